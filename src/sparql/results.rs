//! Query result forms and serialization.
//!
//! A query evaluates to one of: a solution table (SELECT), a boolean (ASK),
//! a triple stream (CONSTRUCT / DESCRIBE), or an affected-operation count
//! (updates). Solution tables serialize to the SPARQL 1.1 JSON results
//! format.

use crate::term::{Term, Value};
use serde_json::{json, Value as Json};

/// One materialized solution table.
#[derive(Debug, Clone, PartialEq)]
pub struct Solutions {
    /// Projected variable names, in projection order.
    pub variables: Vec<String>,
    /// One cell per variable per row; `None` is an unbound variable.
    pub rows: Vec<Vec<Option<Value>>>,
}

impl Solutions {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell by row index and variable name.
    pub fn cell(&self, row: usize, variable: &str) -> Option<&Value> {
        let col = self.variables.iter().position(|v| v == variable)?;
        self.rows.get(row)?.get(col)?.as_ref()
    }

    /// SPARQL 1.1 Query Results JSON.
    pub fn to_json(&self) -> Json {
        let bindings: Vec<Json> = self
            .rows
            .iter()
            .map(|row| {
                let mut object = serde_json::Map::new();
                for (variable, cell) in self.variables.iter().zip(row.iter()) {
                    if let Some(value) = cell {
                        object.insert(variable.clone(), value_to_json(value));
                    }
                }
                Json::Object(object)
            })
            .collect();
        json!({
            "head": { "vars": self.variables },
            "results": { "bindings": bindings }
        })
    }
}

fn value_to_json(value: &Value) -> Json {
    match value.to_term() {
        Term::Iri(iri) => json!({ "type": "uri", "value": iri }),
        Term::Blank(label) => json!({ "type": "bnode", "value": label }),
        Term::Plain(v) => json!({ "type": "literal", "value": v }),
        Term::Lang { value: v, lang } => {
            json!({ "type": "literal", "value": v, "xml:lang": lang })
        }
        Term::Typed {
            value: v,
            datatype,
        } => json!({ "type": "literal", "value": v, "datatype": datatype }),
    }
}

/// A triple produced by CONSTRUCT or DESCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstructedTriple {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

/// The result of a query or update.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResults {
    /// SELECT
    Solutions(Solutions),
    /// ASK
    Boolean(bool),
    /// CONSTRUCT / DESCRIBE
    Graph(Vec<ConstructedTriple>),
    /// Update: operations that changed the store
    Update(usize),
}

impl QueryResults {
    pub fn into_solutions(self) -> Option<Solutions> {
        match self {
            QueryResults::Solutions(solutions) => Some(solutions),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            QueryResults::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solutions_json() {
        let solutions = Solutions {
            variables: vec!["name".to_string(), "age".to_string()],
            rows: vec![
                vec![
                    Some(Value::Plain("Alice".to_string())),
                    Some(Value::Integer(30)),
                ],
                vec![Some(Value::Plain("Bob".to_string())), None],
            ],
        };
        let json = solutions.to_json();
        assert_eq!(json["head"]["vars"][0], "name");
        assert_eq!(
            json["results"]["bindings"][0]["name"]["value"],
            "Alice"
        );
        assert_eq!(
            json["results"]["bindings"][0]["age"]["datatype"],
            "http://www.w3.org/2001/XMLSchema#integer"
        );
        // Unbound cells are simply absent.
        assert!(json["results"]["bindings"][1]
            .as_object()
            .unwrap()
            .get("age")
            .is_none());
    }

    #[test]
    fn test_cell_lookup() {
        let solutions = Solutions {
            variables: vec!["x".to_string()],
            rows: vec![vec![Some(Value::Integer(1))]],
        };
        assert_eq!(solutions.cell(0, "x"), Some(&Value::Integer(1)));
        assert_eq!(solutions.cell(0, "y"), None);
    }
}

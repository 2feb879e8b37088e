//! SPARQL 1.1 query and update engine.
//!
//! The engine parses a query into a zero-copy AST ([`ast`]), plans it
//! against the store's indexes ([`plan`]), executes it through composed
//! scan operators over a shared binding table ([`scan`]), and shapes the
//! emitted rows through the solution pipeline ([`pipeline`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use tarka::store::Store;
//! use tarka::sparql::SparqlEngine;
//!
//! let store = Store::open("db").unwrap();
//! store.add("http://example.org/a", "http://example.org/p", "\"v\"", "").unwrap();
//!
//! let engine = SparqlEngine::new(&store);
//! let results = engine.query("SELECT ?s WHERE { ?s ?p ?o }").unwrap();
//! ```

pub mod ast;
mod expr;
mod lexer;
pub mod parser;
mod pipeline;
mod plan;
mod resolve;
mod results;
pub mod scan;
mod update;

pub use parser::{parse_query, ParseError};
pub use results::{ConstructedTriple, QueryResults, Solutions};
pub use scan::{CancelFlag, ExecError};

use ast::{Query, QueryForm, SelectQuery, TermRef};
use rustc_hash::FxHashSet;
use scan::{ExecContext, ExecResult};
use thiserror::Error;
use tracing::debug;

use crate::store::{QuadPattern, Store, StoreReader};
use crate::term::{Term, Value};

/// SPARQL errors
#[derive(Error, Debug)]
pub enum SparqlError {
    /// Parse error, with source position
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Execution error
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type SparqlResult<T> = Result<T, SparqlError>;

/// SPARQL query engine over one store.
pub struct SparqlEngine<'s> {
    store: &'s Store,
}

impl<'s> SparqlEngine<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// Execute a query (SELECT / ASK / CONSTRUCT / DESCRIBE) or update.
    pub fn query(&self, source: &str) -> SparqlResult<QueryResults> {
        self.query_with(source, CancelFlag::new())
    }

    /// Execute with an external cancellation token; the token is checked at
    /// every multi-pattern step and trips [`ExecError::Cancelled`].
    pub fn query_with(&self, source: &str, cancel: CancelFlag) -> SparqlResult<QueryResults> {
        let query = parse_query(source)?;
        debug!(len = source.len(), "query parsed");
        match &query.form {
            QueryForm::Select(select) => {
                let reader = self.store.reader();
                let ctx = self.context(&reader, &query, Some(select), &cancel)?;
                let (names, rows) = pipeline::exec_select_rows(&ctx, select)?;
                Ok(QueryResults::Solutions(Solutions {
                    variables: names.into_iter().map(str::to_string).collect(),
                    rows,
                }))
            }
            QueryForm::Ask { body } => {
                let reader = self.store.reader();
                let ctx = self.context(&reader, &query, Some(body), &cancel)?;
                let matched = pipeline::any_solution(&ctx, &body.where_clause)?;
                Ok(QueryResults::Boolean(matched))
            }
            QueryForm::Construct { template, body } => {
                let reader = self.store.reader();
                let ctx = self.context(&reader, &query, Some(body), &cancel)?;
                let (names, rows) = pipeline::exec_select_rows(&ctx, body)?;
                drop(ctx);
                drop(reader);
                let triples = construct(&query, template, &names, &rows)?;
                Ok(QueryResults::Graph(triples))
            }
            QueryForm::Describe {
                targets,
                star,
                body,
            } => {
                let reader = self.store.reader();
                let nodes = {
                    let select_ref = body.as_ref();
                    let ctx = self.context(&reader, &query, select_ref, &cancel)?;
                    describe_nodes(&ctx, &query, targets, *star, select_ref)?
                };
                let triples = describe(&reader, nodes)?;
                Ok(QueryResults::Graph(triples))
            }
            QueryForm::Update(ops) => {
                let affected = update::execute_update(self.store, &query, ops, &cancel)?;
                Ok(QueryResults::Update(affected))
            }
        }
    }

    /// Resolve the query's FROM / FROM NAMED datasets into an execution
    /// context.
    fn context<'q, 'r>(
        &self,
        reader: &'r StoreReader<'r>,
        query: &'q Query<'q>,
        select: Option<&'q SelectQuery<'q>>,
        cancel: &CancelFlag,
    ) -> ExecResult<ExecContext<'q, 'r>> {
        let mut ctx = ExecContext::new(reader, query);
        ctx.cancel = cancel.clone();
        if let Some(select) = select {
            if !select.from.is_empty() {
                let mut graphs = Vec::new();
                for iri in &select.from {
                    let iri = resolve::expand_iri(query, iri)?;
                    if let Some(id) = self.store.atoms().lookup(&iri) {
                        graphs.push(id);
                    }
                }
                ctx.default_graphs = Some(graphs);
            }
            if !select.from_named.is_empty() {
                let mut graphs = Vec::new();
                for iri in &select.from_named {
                    let iri = resolve::expand_iri(query, iri)?;
                    if let Some(id) = self.store.atoms().lookup(&iri) {
                        graphs.push(id);
                    }
                }
                ctx.named_graphs = Some(graphs);
            }
        }
        Ok(ctx)
    }
}

impl Store {
    /// Parse and execute a SPARQL query or update against this store.
    pub fn query(&self, source: &str) -> SparqlResult<QueryResults> {
        SparqlEngine::new(self).query(source)
    }

    /// Parse and execute a SPARQL update against this store, returning the
    /// number of operations that changed it.
    pub fn update(&self, source: &str) -> SparqlResult<usize> {
        match SparqlEngine::new(self).query(source)? {
            QueryResults::Update(affected) => Ok(affected),
            _ => Err(SparqlError::Exec(ExecError::Semantic(
                "expected an update, got a query".to_string(),
            ))),
        }
    }
}

/// Instantiate a CONSTRUCT template over the solution rows. Rows that leave
/// a template variable unbound, or would put a literal in subject position,
/// skip that triple. Blank labels mint a fresh node per row.
fn construct(
    query: &Query<'_>,
    template: &[ast::QuadTemplate<'_>],
    names: &[&str],
    rows: &[Vec<Option<Value>>],
) -> ExecResult<Vec<ConstructedTriple>> {
    let mut seen = FxHashSet::default();
    let mut triples = Vec::new();
    for (row_index, cells) in rows.iter().enumerate() {
        let row: Vec<(&str, Value)> = names
            .iter()
            .zip(cells.iter())
            .filter_map(|(n, c)| c.clone().map(|v| (*n, v)))
            .collect();
        let mut blank = |label: &str| format!("r{}_{}", row_index, label);
        for quad in template {
            let Some([s, p, o, _]) = update::instantiate_texts(query, quad, &row, &mut blank)?
            else {
                continue;
            };
            let subject = Term::from_stored(&s)?;
            let predicate = Term::from_stored(&p)?;
            let object = Term::from_stored(&o)?;
            if subject.is_literal() || !predicate.is_iri() {
                continue;
            }
            let triple = ConstructedTriple {
                subject,
                predicate,
                object,
            };
            if seen.insert(triple.clone()) {
                triples.push(triple);
            }
        }
    }
    Ok(triples)
}

/// The set of nodes a DESCRIBE names: explicit IRIs plus the IRI values of
/// its target variables (all variables for `DESCRIBE *`) over the WHERE
/// solutions.
fn describe_nodes<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    query: &'q Query<'q>,
    targets: &[TermRef<'q>],
    star: bool,
    body: Option<&'q SelectQuery<'q>>,
) -> ExecResult<Vec<String>> {
    let mut nodes: Vec<String> = Vec::new();
    let mut push = |text: String| {
        if !nodes.contains(&text) {
            nodes.push(text);
        }
    };

    let mut var_targets: Vec<&str> = Vec::new();
    for target in targets {
        match target {
            TermRef::Var(name) => var_targets.push(*name),
            other => {
                if let Some(text) = resolve::term_to_stored(query, other)? {
                    push(text);
                }
            }
        }
    }

    if let Some(body) = body {
        let (names, rows) = pipeline::exec_select_rows(ctx, body)?;
        for cells in &rows {
            for (name, cell) in names.iter().zip(cells.iter()) {
                let wanted = star || var_targets.contains(name);
                if !wanted {
                    continue;
                }
                if let Some(Value::Iri(iri)) = cell {
                    push(iri.clone());
                }
            }
        }
    }
    Ok(nodes)
}

/// Subject-oriented description: every default-graph quad whose subject is
/// one of the nodes.
fn describe(reader: &StoreReader<'_>, nodes: Vec<String>) -> ExecResult<Vec<ConstructedTriple>> {
    let mut triples = Vec::new();
    let atoms = reader.atoms();
    for node in nodes {
        let Some(id) = atoms.lookup(&node) else {
            continue;
        };
        let pattern = QuadPattern {
            s: Some(id),
            g: Some(0),
            ..Default::default()
        };
        for quad in reader.scan(pattern)? {
            let quad = quad.map_err(ExecError::from)?;
            triples.push(ConstructedTriple {
                subject: Term::from_stored(atoms.fetch(quad.s)?.as_str()?)?,
                predicate: Term::from_stored(atoms.fetch(quad.p)?.as_str()?)?,
                object: Term::from_stored(atoms.fetch(quad.o)?.as_str()?)?,
            });
        }
    }
    Ok(triples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(data: &[(&str, &str, &str, &str)]) -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for (s, p, o, g) in data {
            store.add(s, p, o, g).unwrap();
        }
        (dir, store)
    }

    fn name_data() -> Vec<(&'static str, &'static str, &'static str, &'static str)> {
        vec![
            ("http://x/a", "http://x/name", "\"A\"", ""),
            ("http://x/b", "http://x/name", "\"B\"", ""),
            (
                "http://x/a",
                "http://x/age",
                "\"30\"^^<http://www.w3.org/2001/XMLSchema#integer>",
                "",
            ),
        ]
    }

    #[test]
    fn test_select_basic() {
        let (_dir, store) = store_with(&name_data());
        let results = store
            .query("SELECT ?n WHERE { ?x <http://x/name> ?n }")
            .unwrap();
        let solutions = results.into_solutions().unwrap();
        assert_eq!(solutions.variables, vec!["n"]);
        assert_eq!(solutions.len(), 2);
    }

    #[test]
    fn test_optional_left_join() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query(
                "SELECT ?n ?age WHERE { ?x <http://x/name> ?n \
                 OPTIONAL { ?x <http://x/age> ?age } } ORDER BY ?n",
            )
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 2);
        assert_eq!(
            solutions.cell(0, "age"),
            Some(&Value::Integer(30))
        );
        assert_eq!(solutions.cell(1, "age"), None);
    }

    #[test]
    fn test_union() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query(
                "SELECT ?v WHERE { { ?x <http://x/name> ?v } UNION { ?x <http://x/age> ?v } }",
            )
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 3);
    }

    #[test]
    fn test_count_empty_is_zero() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query("SELECT (COUNT(*) AS ?c) WHERE { ?s <http://x/nothere> ?o }")
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions.cell(0, "c"), Some(&Value::Integer(0)));
    }

    #[test]
    fn test_graph_variable() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .add("http://x/a", "http://x/p", "http://x/b", "http://g/1")
            .unwrap();
        store
            .add("http://x/a", "http://x/p", "http://x/c", "http://g/2")
            .unwrap();

        let solutions = store
            .query("SELECT ?g ?o WHERE { GRAPH ?g { <http://x/a> <http://x/p> ?o } } ORDER BY ?o")
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 2);
        assert_eq!(
            solutions.cell(0, "g"),
            Some(&Value::Iri("http://g/1".to_string()))
        );
        assert_eq!(
            solutions.cell(1, "o"),
            Some(&Value::Iri("http://x/c".to_string()))
        );
    }

    #[test]
    fn test_ask() {
        let (_dir, store) = store_with(&name_data());
        assert_eq!(
            store
                .query("ASK { <http://x/a> <http://x/name> \"A\" }")
                .unwrap()
                .as_boolean(),
            Some(true)
        );
        assert_eq!(
            store
                .query("ASK { <http://x/a> <http://x/name> \"Z\" }")
                .unwrap()
                .as_boolean(),
            Some(false)
        );
    }

    #[test]
    fn test_filter_and_bind() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query(
                "SELECT ?x ?doubled WHERE { ?x <http://x/age> ?age \
                 FILTER(?age > 20) BIND(?age * 2 AS ?doubled) }",
            )
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions.cell(0, "doubled"), Some(&Value::Integer(60)));
    }

    #[test]
    fn test_construct() {
        let (_dir, store) = store_with(&name_data());
        let results = store
            .query(
                "CONSTRUCT { ?x <http://x/label> ?n } WHERE { ?x <http://x/name> ?n }",
            )
            .unwrap();
        let QueryResults::Graph(triples) = results else {
            panic!("expected a graph result");
        };
        assert_eq!(triples.len(), 2);
        assert!(triples
            .iter()
            .all(|t| t.predicate == Term::Iri("http://x/label".to_string())));
    }

    #[test]
    fn test_update_insert_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let n = store
            .update("INSERT DATA { <http://x/a> <http://x/p> \"v\" }")
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.stats().quad_count, 1);

        let n = store
            .update("DELETE DATA { <http://x/a> <http://x/p> \"v\" }")
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.stats().quad_count, 0);
    }

    #[test]
    fn test_update_modify() {
        let (_dir, store) = store_with(&name_data());
        store
            .update(
                "DELETE { ?x <http://x/name> ?n } INSERT { ?x <http://x/label> ?n } \
                 WHERE { ?x <http://x/name> ?n }",
            )
            .unwrap();
        let solutions = store
            .query("SELECT ?n WHERE { ?x <http://x/label> ?n }")
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 2);
        let old = store
            .query("SELECT ?n WHERE { ?x <http://x/name> ?n }")
            .unwrap()
            .into_solutions()
            .unwrap();
        assert!(old.is_empty());
    }

    #[test]
    fn test_cancellation() {
        let (_dir, store) = store_with(&name_data());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let engine = SparqlEngine::new(&store);
        let err = engine
            .query_with("SELECT ?s WHERE { ?s ?p ?o }", cancel)
            .unwrap_err();
        assert!(matches!(err, SparqlError::Exec(ExecError::Cancelled)));
    }

    #[test]
    fn test_distinct_and_limit() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query("SELECT DISTINCT ?p WHERE { ?s ?p ?o } ORDER BY ?p LIMIT 1")
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 1);
        assert_eq!(
            solutions.cell(0, "p"),
            Some(&Value::Iri("http://x/age".to_string()))
        );
    }

    #[test]
    fn test_minus() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query(
                "SELECT ?x WHERE { ?x <http://x/name> ?n MINUS { ?x <http://x/age> ?a } }",
            )
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 1);
        assert_eq!(
            solutions.cell(0, "x"),
            Some(&Value::Iri("http://x/b".to_string()))
        );
    }

    #[test]
    fn test_exists_filter() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query(
                "SELECT ?x WHERE { ?x <http://x/name> ?n \
                 FILTER NOT EXISTS { ?x <http://x/age> ?a } }",
            )
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 1);
    }

    #[test]
    fn test_property_path_plus() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for (s, o) in [("a", "b"), ("b", "c"), ("c", "a")] {
            store
                .add(
                    &format!("http://x/{}", s),
                    "http://x/next",
                    &format!("http://x/{}", o),
                    "",
                )
                .unwrap();
        }
        // A cycle: the closure must terminate and report each node once.
        let solutions = store
            .query("SELECT ?r WHERE { <http://x/a> <http://x/next>+ ?r }")
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 3);
    }

    #[test]
    fn test_subquery_with_limit() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query(
                "SELECT ?n WHERE { ?x <http://x/name> ?n \
                 { SELECT ?x WHERE { ?x <http://x/name> ?inner } ORDER BY ?inner LIMIT 1 } }",
            )
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 1);
        assert_eq!(
            solutions.cell(0, "n"),
            Some(&Value::Plain("A".to_string()))
        );
    }

    #[test]
    fn test_values() {
        let (_dir, store) = store_with(&name_data());
        let solutions = store
            .query(
                "SELECT ?n WHERE { ?x <http://x/name> ?n VALUES ?x { <http://x/a> } }",
            )
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions.cell(0, "n"), Some(&Value::Plain("A".to_string())));
    }

    #[test]
    fn test_group_by_aggregation() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for (person, score) in [("a", 1), ("a", 2), ("b", 5)] {
            store
                .add(
                    &format!("http://x/{}", person),
                    "http://x/score",
                    &format!(
                        "\"{}\"^^<http://www.w3.org/2001/XMLSchema#integer>",
                        score
                    ),
                    "",
                )
                .unwrap();
        }
        let solutions = store
            .query(
                "SELECT ?p (SUM(?s) AS ?total) WHERE { ?p <http://x/score> ?s } \
                 GROUP BY ?p ORDER BY ?p",
            )
            .unwrap()
            .into_solutions()
            .unwrap();
        assert_eq!(solutions.len(), 2);
        assert_eq!(solutions.cell(0, "total"), Some(&Value::Integer(3)));
        assert_eq!(solutions.cell(1, "total"), Some(&Value::Integer(5)));
    }

    #[test]
    fn test_clear_graph() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.add("http://x/s", "http://x/p", "\"1\"", "").unwrap();
        store
            .add("http://x/s", "http://x/p", "\"2\"", "http://g/1")
            .unwrap();

        store.update("CLEAR GRAPH <http://g/1>").unwrap();
        assert_eq!(store.stats().quad_count, 1);
        store.update("CLEAR ALL").unwrap();
        assert_eq!(store.stats().quad_count, 0);
    }
}

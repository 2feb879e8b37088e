//! Resolution of parsed terms to stored text and typed values.
//!
//! The parser leaves prefixed names unexpanded and literal escapes intact;
//! everything meets the store's text encoding here. Relative IRIs resolve
//! against the query's BASE.

use super::ast::{IriRef, Query, TermRef};
use super::scan::{ExecError, ExecResult};
use crate::term::{self, xsd, Term, Value};
use oxiri::Iri;

/// Expand an IRI reference to its full form.
pub fn expand_iri(query: &Query<'_>, iri: &IriRef<'_>) -> ExecResult<String> {
    match iri {
        IriRef::Iri(text) => resolve_base(query, text),
        IriRef::Prefixed { prefix, local } => {
            let namespace = query.prefix(prefix).ok_or_else(|| {
                ExecError::Semantic(format!("unknown prefix '{}:'", prefix))
            })?;
            let namespace = resolve_base(query, namespace)?;
            Ok(format!("{}{}", namespace, local))
        }
    }
}

fn resolve_base(query: &Query<'_>, text: &str) -> ExecResult<String> {
    if let Some(base) = query.base {
        if Iri::parse(text).is_err() {
            let base = Iri::parse(base).map_err(|e| {
                ExecError::Semantic(format!("invalid BASE IRI '{}': {}", base, e))
            })?;
            return base
                .resolve(text)
                .map(|iri| iri.into_inner())
                .map_err(|e| {
                    ExecError::Semantic(format!("cannot resolve '{}' against BASE: {}", text, e))
                });
        }
    }
    Ok(text.to_string())
}

/// A constant term's stored-text encoding; `None` for variables.
pub fn term_to_stored(query: &Query<'_>, term: &TermRef<'_>) -> ExecResult<Option<String>> {
    Ok(match term {
        TermRef::Var(_) => None,
        other => Some(constant_to_term(query, other)?.to_stored()),
    })
}

/// A constant term as a typed value; variables are the caller's problem.
pub fn term_to_value(query: &Query<'_>, term: &TermRef<'_>) -> ExecResult<Value> {
    Ok(Value::from_term(constant_to_term(query, term)?))
}

fn constant_to_term(query: &Query<'_>, term_ref: &TermRef<'_>) -> ExecResult<Term> {
    Ok(match term_ref {
        TermRef::Iri(iri) => Term::Iri(expand_iri(query, iri)?),
        TermRef::Literal {
            value,
            lang,
            datatype,
        } => {
            let value = term::unescape(value);
            match (lang, datatype) {
                (Some(lang), _) => Term::Lang {
                    value,
                    lang: (*lang).to_string(),
                },
                (None, Some(datatype)) => {
                    let datatype = expand_iri(query, datatype)?;
                    if datatype == xsd::STRING {
                        Term::Plain(value)
                    } else {
                        Term::Typed { value, datatype }
                    }
                }
                (None, None) => Term::Plain(value),
            }
        }
        TermRef::Integer(text) => Term::Typed {
            value: (*text).to_string(),
            datatype: xsd::INTEGER.to_string(),
        },
        TermRef::Double(text) => Term::Typed {
            value: (*text).to_string(),
            datatype: xsd::DOUBLE.to_string(),
        },
        TermRef::Boolean(b) => Term::Typed {
            value: b.to_string(),
            datatype: xsd::BOOLEAN.to_string(),
        },
        TermRef::Blank(label) => Term::Blank((*label).to_string()),
        TermRef::Var(v) => {
            return Err(ExecError::Semantic(format!(
                "variable ?{} where a constant term is required",
                v
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparql::parser::parse_query;

    #[test]
    fn test_prefix_expansion() {
        let query = parse_query(
            "PREFIX foaf: <http://xmlns.com/foaf/0.1/> SELECT ?x WHERE { ?x foaf:name ?n }",
        )
        .unwrap();
        let iri = IriRef::Prefixed {
            prefix: "foaf",
            local: "name",
        };
        assert_eq!(
            expand_iri(&query, &iri).unwrap(),
            "http://xmlns.com/foaf/0.1/name"
        );
    }

    #[test]
    fn test_base_resolution() {
        let query =
            parse_query("BASE <http://example.org/dir/> SELECT ?x WHERE { ?x <doc> ?y }").unwrap();
        assert_eq!(
            expand_iri(&query, &IriRef::Iri("doc")).unwrap(),
            "http://example.org/dir/doc"
        );
    }

    #[test]
    fn test_numeric_term_encoding() {
        let query = parse_query("SELECT ?x WHERE { ?x <p> 30 }").unwrap();
        assert_eq!(
            term_to_stored(&query, &TermRef::Integer("30"))
                .unwrap()
                .unwrap(),
            "\"30\"^^<http://www.w3.org/2001/XMLSchema#integer>"
        );
    }

    #[test]
    fn test_var_is_not_constant() {
        let query = parse_query("SELECT ?x WHERE { ?x <p> ?y }").unwrap();
        assert_eq!(term_to_stored(&query, &TermRef::Var("x")).unwrap(), None);
    }
}

//! RDF term model and the stored-text codec.
//!
//! The store keeps every term as an interned string. IRIs are stored bare,
//! literals keep their surrounding quotes plus an optional `@lang` or
//! `^^<datatype>` suffix, blank nodes keep their `_:` prefix. This module
//! decodes that text into typed values and encodes typed values back.

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// XSD namespace IRIs used for typed literals.
pub mod xsd {
    pub const INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
    pub const DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
    pub const DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
    pub const BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
    pub const STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
    pub const DATE_TIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
}

/// Term errors
#[derive(Error, Debug)]
pub enum TermError {
    /// Malformed stored term text
    #[error("Malformed stored term: {0}")]
    Malformed(String),

    /// Invalid literal
    #[error("Invalid literal: {0}")]
    InvalidLiteral(String),
}

pub type TermResult<T> = Result<T, TermError>;

/// A decoded RDF term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// Named node (IRI), stored bare
    Iri(String),
    /// Plain literal without language tag
    Plain(String),
    /// Language-tagged literal
    Lang {
        /// Lexical value
        value: String,
        /// Language tag (without the `@`)
        lang: String,
    },
    /// Typed literal
    Typed {
        /// Lexical value
        value: String,
        /// Datatype IRI
        datatype: String,
    },
    /// Blank node with its label
    Blank(String),
}

impl Term {
    /// Decode the store's text representation of a term.
    pub fn from_stored(text: &str) -> TermResult<Self> {
        if let Some(rest) = text.strip_prefix("_:") {
            return Ok(Term::Blank(rest.to_string()));
        }
        if !text.starts_with('"') {
            return Ok(Term::Iri(text.to_string()));
        }
        let close = find_closing_quote(text)
            .ok_or_else(|| TermError::Malformed(text.to_string()))?;
        let value = unescape(&text[1..close]);
        let suffix = &text[close + 1..];
        if suffix.is_empty() {
            return Ok(Term::Plain(value));
        }
        if let Some(lang) = suffix.strip_prefix('@') {
            return Ok(Term::Lang {
                value,
                lang: lang.to_string(),
            });
        }
        if let Some(dt) = suffix.strip_prefix("^^<").and_then(|s| s.strip_suffix('>')) {
            if dt == xsd::STRING {
                return Ok(Term::Plain(value));
            }
            return Ok(Term::Typed {
                value,
                datatype: dt.to_string(),
            });
        }
        Err(TermError::Malformed(text.to_string()))
    }

    /// Encode this term into the store's text representation.
    pub fn to_stored(&self) -> String {
        match self {
            Term::Iri(iri) => iri.clone(),
            Term::Plain(v) => format!("\"{}\"", escape(v)),
            Term::Lang { value, lang } => format!("\"{}\"@{}", escape(value), lang),
            Term::Typed { value, datatype } => {
                format!("\"{}\"^^<{}>", escape(value), datatype)
            }
            Term::Blank(label) => format!("_:{}", label),
        }
    }

    /// Whether the stored text denotes a literal.
    pub fn stored_is_literal(text: &str) -> bool {
        text.starts_with('"')
    }

    /// Whether the stored text denotes a blank node.
    pub fn stored_is_blank(text: &str) -> bool {
        text.starts_with("_:")
    }

    /// Whether the stored text denotes an IRI.
    pub fn stored_is_iri(text: &str) -> bool {
        !Self::stored_is_literal(text) && !Self::stored_is_blank(text)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Plain(_) | Term::Lang { .. } | Term::Typed { .. })
    }

    pub fn is_iri(&self) -> bool {
        matches!(self, Term::Iri(_))
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Term::Blank(_))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{}>", iri),
            _ => write!(f, "{}", self.to_stored()),
        }
    }
}

/// A typed value bound to a variable in one solution row.
///
/// Stored objects decode into one of these; BIND and aggregate expressions
/// produce them directly. The numeric/boolean variants preserve their type
/// through the pipeline as the spec requires.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Iri(String),
    Plain(String),
    Lang { value: String, lang: String },
    Integer(i64),
    Double(f64),
    Boolean(bool),
    DateTime(String),
    Typed { value: String, datatype: String },
    Blank(String),
}

impl Value {
    /// Decode a stored term text into a typed value.
    pub fn from_stored(text: &str) -> TermResult<Self> {
        Ok(Self::from_term(Term::from_stored(text)?))
    }

    /// Promote a decoded term, recognizing the numeric/boolean XSD types.
    pub fn from_term(term: Term) -> Self {
        match term {
            Term::Iri(iri) => Value::Iri(iri),
            Term::Plain(v) => Value::Plain(v),
            Term::Lang { value, lang } => Value::Lang { value, lang },
            Term::Blank(label) => Value::Blank(label),
            Term::Typed { value, datatype } => match datatype.as_str() {
                xsd::INTEGER => match value.parse::<i64>() {
                    Ok(i) => Value::Integer(i),
                    Err(_) => Value::Typed { value, datatype },
                },
                xsd::DOUBLE | xsd::DECIMAL => match value.parse::<f64>() {
                    Ok(d) => Value::Double(d),
                    Err(_) => Value::Typed { value, datatype },
                },
                xsd::BOOLEAN => match value.as_str() {
                    "true" | "1" => Value::Boolean(true),
                    "false" | "0" => Value::Boolean(false),
                    _ => Value::Typed { value, datatype },
                },
                xsd::DATE_TIME => Value::DateTime(value),
                _ => Value::Typed { value, datatype },
            },
        }
    }

    /// Re-encode this value as a term.
    pub fn to_term(&self) -> Term {
        match self {
            Value::Iri(iri) => Term::Iri(iri.clone()),
            Value::Plain(v) => Term::Plain(v.clone()),
            Value::Lang { value, lang } => Term::Lang {
                value: value.clone(),
                lang: lang.clone(),
            },
            Value::Integer(i) => Term::Typed {
                value: i.to_string(),
                datatype: xsd::INTEGER.to_string(),
            },
            Value::Double(d) => Term::Typed {
                value: format_double(*d),
                datatype: xsd::DOUBLE.to_string(),
            },
            Value::Boolean(b) => Term::Typed {
                value: b.to_string(),
                datatype: xsd::BOOLEAN.to_string(),
            },
            Value::DateTime(v) => Term::Typed {
                value: v.clone(),
                datatype: xsd::DATE_TIME.to_string(),
            },
            Value::Typed { value, datatype } => Term::Typed {
                value: value.clone(),
                datatype: datatype.clone(),
            },
            Value::Blank(label) => Term::Blank(label.clone()),
        }
    }

    /// Stored-text encoding, used when a computed value flows back into
    /// store matching or update templates.
    pub fn to_stored(&self) -> String {
        self.to_term().to_stored()
    }

    /// The lexical string of the value, the `STR()` view.
    pub fn lexical(&self) -> String {
        match self {
            Value::Iri(iri) => iri.clone(),
            Value::Plain(v) => v.clone(),
            Value::Lang { value, .. } => value.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Double(d) => format_double(*d),
            Value::Boolean(b) => b.to_string(),
            Value::DateTime(v) => v.clone(),
            Value::Typed { value, .. } => value.clone(),
            Value::Blank(label) => label.clone(),
        }
    }

    /// Numeric view, if the value is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Double(_))
    }

    pub fn is_literal(&self) -> bool {
        !matches!(self, Value::Iri(_) | Value::Blank(_))
    }

    /// Datatype IRI of a literal value, if any.
    pub fn datatype(&self) -> Option<&str> {
        match self {
            Value::Plain(_) => Some(xsd::STRING),
            Value::Lang { .. } => None,
            Value::Integer(_) => Some(xsd::INTEGER),
            Value::Double(_) => Some(xsd::DOUBLE),
            Value::Boolean(_) => Some(xsd::BOOLEAN),
            Value::DateTime(_) => Some(xsd::DATE_TIME),
            Value::Typed { datatype, .. } => Some(datatype),
            Value::Iri(_) | Value::Blank(_) => None,
        }
    }

    /// Total SPARQL ordering: IRIs, then blank nodes, then literals;
    /// numeric literals compare by value, everything else by code point.
    pub fn cmp_sparql(&self, other: &Value) -> Ordering {
        let rank = |v: &Value| match v {
            Value::Iri(_) => 0u8,
            Value::Blank(_) => 1,
            _ => 2,
        };
        match rank(self).cmp(&rank(other)) {
            Ordering::Equal => {}
            ord => return ord,
        }
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        }
        self.lexical().cmp(&other.lexical())
    }

    /// Value equality with numeric coercion, used for `=` and for
    /// already-bound variable checks in pattern scans.
    pub fn same_value(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a == b;
        }
        self == other
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_term())
    }
}

/// xsd:double lexical form; keep integral doubles readable.
fn format_double(d: f64) -> String {
    if d.fract() == 0.0 && d.is_finite() && d.abs() < 1e15 {
        format!("{:.1}", d)
    } else {
        d.to_string()
    }
}

fn find_closing_quote(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Escape a literal lexical form for stored text (N-Triples string escapes).
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`].
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                if let Some(c) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.push(c);
                }
            }
            Some('U') => {
                let hex: String = chars.by_ref().take(8).collect();
                if let Some(c) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.push(c);
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iri_round_trip() {
        let term = Term::from_stored("http://example.org/alice").unwrap();
        assert_eq!(term, Term::Iri("http://example.org/alice".to_string()));
        assert_eq!(term.to_stored(), "http://example.org/alice");
    }

    #[test]
    fn test_plain_literal_round_trip() {
        let term = Term::Plain("Alice \"A\"".to_string());
        let stored = term.to_stored();
        assert_eq!(Term::from_stored(&stored).unwrap(), term);
    }

    #[test]
    fn test_lang_literal() {
        let term = Term::from_stored("\"Alice\"@en").unwrap();
        assert_eq!(
            term,
            Term::Lang {
                value: "Alice".to_string(),
                lang: "en".to_string()
            }
        );
    }

    #[test]
    fn test_typed_literal_decodes_to_integer() {
        let value =
            Value::from_stored("\"30\"^^<http://www.w3.org/2001/XMLSchema#integer>").unwrap();
        assert_eq!(value, Value::Integer(30));
    }

    #[test]
    fn test_xsd_string_normalizes_to_plain() {
        let term =
            Term::from_stored("\"abc\"^^<http://www.w3.org/2001/XMLSchema#string>").unwrap();
        assert_eq!(term, Term::Plain("abc".to_string()));
    }

    #[test]
    fn test_blank_node() {
        let term = Term::from_stored("_:b1").unwrap();
        assert_eq!(term, Term::Blank("b1".to_string()));
        assert_eq!(term.to_stored(), "_:b1");
    }

    #[test]
    fn test_sparql_ordering() {
        let iri = Value::Iri("http://example.org/a".to_string());
        let blank = Value::Blank("b".to_string());
        let lit = Value::Plain("a".to_string());
        assert_eq!(iri.cmp_sparql(&blank), Ordering::Less);
        assert_eq!(blank.cmp_sparql(&lit), Ordering::Less);
        assert_eq!(
            Value::Integer(2).cmp_sparql(&Value::Double(10.0)),
            Ordering::Less
        );
    }

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(Value::Integer(3).same_value(&Value::Double(3.0)));
        assert!(!Value::Integer(3).same_value(&Value::Double(3.5)));
    }
}

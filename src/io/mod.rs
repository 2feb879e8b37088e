//! RDF format handling: media types, content negotiation, the parser/writer
//! callback contract, and the in-tree line-oriented codecs.
//!
//! Parsers hand each quad to a [`QuadSink`] as borrowed text windows that
//! are only valid for the duration of the call; a sink that retains terms
//! must copy them. The non-line formats are reachable through the same
//! contract but their codecs live outside this crate; asking the in-tree
//! parser for one is an error, never silent degradation.

mod loader;
mod ntriples;

pub use loader::{load_async, load_str, parse_into, serialize_store};
pub use ntriples::{parse_nquads, parse_ntriples, write_nquads, write_ntriples, CollectingSink};

use std::io;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// I/O and format errors
#[derive(Error, Debug)]
pub enum IoError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Syntax error in an RDF document
    #[error("Parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    /// The requested format has no in-tree codec
    #[error("No in-tree codec for {0:?}; use an external parser through the sink contract")]
    UnsupportedFormat(RdfFormat),

    /// Store failure while loading
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

pub type IoResult<T> = Result<T, IoError>;

/// A supported RDF serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdfFormat {
    NTriples,
    Turtle,
    NQuads,
    TriG,
    RdfXml,
    JsonLd,
}

impl RdfFormat {
    pub const ALL: [RdfFormat; 6] = [
        RdfFormat::NTriples,
        RdfFormat::Turtle,
        RdfFormat::NQuads,
        RdfFormat::TriG,
        RdfFormat::RdfXml,
        RdfFormat::JsonLd,
    ];

    /// Canonical media type.
    pub fn media_type(self) -> &'static str {
        match self {
            RdfFormat::NTriples => "application/n-triples",
            RdfFormat::Turtle => "text/turtle",
            RdfFormat::NQuads => "application/n-quads",
            RdfFormat::TriG => "application/trig",
            RdfFormat::RdfXml => "application/rdf+xml",
            RdfFormat::JsonLd => "application/ld+json",
        }
    }

    /// Canonical file extension, without the dot.
    pub fn file_extension(self) -> &'static str {
        match self {
            RdfFormat::NTriples => "nt",
            RdfFormat::Turtle => "ttl",
            RdfFormat::NQuads => "nq",
            RdfFormat::TriG => "trig",
            RdfFormat::RdfXml => "rdf",
            RdfFormat::JsonLd => "jsonld",
        }
    }

    /// Match a media type (parameters ignored).
    pub fn from_media_type(value: &str) -> Option<Self> {
        let mime = mime::Mime::from_str(value.trim()).ok()?;
        let essence = mime.essence_str().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.media_type() == essence)
    }

    /// Match a file extension (with or without the dot).
    pub fn from_extension(value: &str) -> Option<Self> {
        let value = value.trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.file_extension() == value)
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        Self::from_extension(path.extension()?.to_str()?)
    }

    /// Whether this crate ships a codec for the format.
    pub fn has_native_codec(self) -> bool {
        matches!(self, RdfFormat::NTriples | RdfFormat::NQuads)
    }
}

/// Pick the best supported format from an HTTP Accept header with
/// q-values. Unknown or empty headers fall back to Turtle.
pub fn negotiate(accept: &str) -> RdfFormat {
    let mut best: Option<(f32, usize, RdfFormat)> = None;
    for (position, part) in accept.split(',').enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Ok(mime) = mime::Mime::from_str(part) else {
            continue;
        };
        let q = mime
            .get_param("q")
            .and_then(|v| v.as_str().parse::<f32>().ok())
            .unwrap_or(1.0);
        let candidate = if mime.type_() == mime::STAR {
            Some(RdfFormat::Turtle)
        } else {
            RdfFormat::from_media_type(mime.essence_str())
        };
        if let Some(format) = candidate {
            let replace = match best {
                None => true,
                // Higher q wins; earlier position breaks ties.
                Some((bq, bpos, _)) => q > bq || (q == bq && position < bpos),
            };
            if replace {
                best = Some((q, position, format));
            }
        }
    }
    best.map(|(_, _, format)| format).unwrap_or(RdfFormat::Turtle)
}

/// One parsed quad, borrowed from the parser's buffers. The term texts use
/// the store encoding (bare IRIs, quoted literals, `_:` blanks); `graph`
/// is `None` in the default graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadRef<'a> {
    pub subject: &'a str,
    pub predicate: &'a str,
    pub object: &'a str,
    pub graph: Option<&'a str>,
}

/// Receiver half of the parser callback contract.
pub trait QuadSink {
    /// Handle one emitted quad. The borrowed windows are valid only during
    /// this call.
    fn quad(&mut self, quad: QuadRef<'_>) -> IoResult<()>;
}

impl<F> QuadSink for F
where
    F: FnMut(QuadRef<'_>) -> IoResult<()>,
{
    fn quad(&mut self, quad: QuadRef<'_>) -> IoResult<()> {
        self(quad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_mapping_is_symmetric() {
        for format in RdfFormat::ALL {
            assert_eq!(RdfFormat::from_media_type(format.media_type()), Some(format));
            assert_eq!(
                RdfFormat::from_extension(format.file_extension()),
                Some(format)
            );
        }
    }

    #[test]
    fn test_media_type_with_parameters() {
        assert_eq!(
            RdfFormat::from_media_type("text/turtle; charset=utf-8"),
            Some(RdfFormat::Turtle)
        );
    }

    #[test]
    fn test_negotiate_q_values() {
        assert_eq!(
            negotiate("application/rdf+xml;q=0.5, text/turtle;q=0.9"),
            RdfFormat::Turtle
        );
        assert_eq!(
            negotiate("application/n-triples, text/turtle"),
            RdfFormat::NTriples
        );
        assert_eq!(negotiate(""), RdfFormat::Turtle);
        assert_eq!(negotiate("application/json"), RdfFormat::Turtle);
        assert_eq!(negotiate("*/*"), RdfFormat::Turtle);
    }

    #[test]
    fn test_from_path() {
        assert_eq!(
            RdfFormat::from_path(Path::new("data/dump.nq")),
            Some(RdfFormat::NQuads)
        );
        assert_eq!(RdfFormat::from_path(Path::new("README.md")), None);
    }
}

//! N-Triples and N-Quads codecs.
//!
//! Line-oriented: one statement per line, `#` comments, blank lines
//! allowed. Parsed terms are canonicalized into the store encoding before
//! they reach the sink, so `parse(serialize(T)) = T` holds.

use super::{IoError, IoResult, QuadRef, QuadSink};
use crate::term;
use std::io::Write;

/// Parse an N-Triples document, emitting each triple to `sink`.
pub fn parse_ntriples<S: QuadSink + ?Sized>(input: &str, sink: &mut S) -> IoResult<usize> {
    parse_lines(input, false, sink)
}

/// Parse an N-Quads document, emitting each quad to `sink`.
pub fn parse_nquads<S: QuadSink + ?Sized>(input: &str, sink: &mut S) -> IoResult<usize> {
    parse_lines(input, true, sink)
}

fn parse_lines<S: QuadSink + ?Sized>(
    input: &str,
    allow_graph: bool,
    sink: &mut S,
) -> IoResult<usize> {
    let mut count = 0usize;
    for (index, line) in input.lines().enumerate() {
        if let Some((s, p, o, g)) = parse_line(line, index + 1, allow_graph)? {
            sink.quad(QuadRef {
                subject: &s,
                predicate: &p,
                object: &o,
                graph: g.as_deref(),
            })?;
            count += 1;
        }
    }
    Ok(count)
}

/// Parse one statement line into stored-form term texts. `None` for blank
/// and comment lines.
pub(super) fn parse_line(
    line: &str,
    line_no: usize,
    allow_graph: bool,
) -> IoResult<Option<(String, String, String, Option<String>)>> {
    let mut cursor = Cursor {
        line,
        bytes: line.as_bytes(),
        pos: 0,
        line_no,
    };
    cursor.skip_ws();
    if cursor.at_end() || cursor.bytes[cursor.pos] == b'#' {
        return Ok(None);
    }

    let subject = cursor.parse_term(false)?;
    cursor.skip_ws();
    let predicate = cursor.parse_term(false)?;
    cursor.skip_ws();
    let object = cursor.parse_term(true)?;
    cursor.skip_ws();

    let graph = if allow_graph && !cursor.at_end() && cursor.bytes[cursor.pos] != b'.' {
        let g = cursor.parse_term(false)?;
        cursor.skip_ws();
        Some(g)
    } else {
        None
    };

    if cursor.at_end() || cursor.bytes[cursor.pos] != b'.' {
        return Err(cursor.error("expected '.' at end of statement"));
    }
    cursor.pos += 1;
    cursor.skip_ws();
    if !cursor.at_end() && cursor.bytes[cursor.pos] != b'#' {
        return Err(cursor.error("unexpected trailing content"));
    }

    Ok(Some((subject, predicate, object, graph)))
}

struct Cursor<'a> {
    line: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line_no: usize,
}

impl Cursor<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn skip_ws(&mut self) {
        while !self.at_end() && matches!(self.bytes[self.pos], b' ' | b'\t') {
            self.pos += 1;
        }
    }

    fn error(&self, message: &str) -> IoError {
        IoError::Parse {
            line: self.line_no,
            column: self.pos + 1,
            message: message.to_string(),
        }
    }

    /// Parse one term into its stored-form text.
    fn parse_term(&mut self, allow_literal: bool) -> IoResult<String> {
        if self.at_end() {
            return Err(self.error("unexpected end of line"));
        }
        match self.bytes[self.pos] {
            b'<' => {
                let start = self.pos + 1;
                let mut end = start;
                while end < self.bytes.len() && self.bytes[end] != b'>' {
                    end += 1;
                }
                if end == self.bytes.len() {
                    return Err(self.error("unterminated IRI"));
                }
                let iri = term::unescape(&self.line[start..end]);
                self.pos = end + 1;
                Ok(iri)
            }
            b'_' => {
                if self.bytes.get(self.pos + 1) != Some(&b':') {
                    return Err(self.error("malformed blank node label"));
                }
                let start = self.pos;
                let mut end = self.pos + 2;
                while end < self.bytes.len()
                    && !matches!(self.bytes[end], b' ' | b'\t' | b'.')
                {
                    end += 1;
                }
                let label = &self.line[start..end];
                self.pos = end;
                Ok(label.to_string())
            }
            b'"' => {
                if !allow_literal {
                    return Err(self.error("literal not allowed in this position"));
                }
                let start = self.pos + 1;
                let mut end = start;
                while end < self.bytes.len() {
                    match self.bytes[end] {
                        b'\\' => end += 2,
                        b'"' => break,
                        _ => end += 1,
                    }
                }
                if end >= self.bytes.len() {
                    return Err(self.error("unterminated string literal"));
                }
                let lexical = term::unescape(&self.line[start..end]);
                self.pos = end + 1;

                // Optional language tag or datatype suffix.
                if !self.at_end() && self.bytes[self.pos] == b'@' {
                    let start = self.pos + 1;
                    let mut end = start;
                    while end < self.bytes.len()
                        && (self.bytes[end].is_ascii_alphanumeric() || self.bytes[end] == b'-')
                    {
                        end += 1;
                    }
                    if end == start {
                        return Err(self.error("empty language tag"));
                    }
                    let lang = &self.line[start..end];
                    self.pos = end;
                    return Ok(term::Term::Lang {
                        value: lexical,
                        lang: lang.to_string(),
                    }
                    .to_stored());
                }
                if self.pos + 1 < self.bytes.len()
                    && self.bytes[self.pos] == b'^'
                    && self.bytes[self.pos + 1] == b'^'
                {
                    self.pos += 2;
                    if self.at_end() || self.bytes[self.pos] != b'<' {
                        return Err(self.error("expected datatype IRI after '^^'"));
                    }
                    let start = self.pos + 1;
                    let mut end = start;
                    while end < self.bytes.len() && self.bytes[end] != b'>' {
                        end += 1;
                    }
                    if end == self.bytes.len() {
                        return Err(self.error("unterminated datatype IRI"));
                    }
                    let datatype = term::unescape(&self.line[start..end]);
                    self.pos = end + 1;
                    if datatype == term::xsd::STRING {
                        return Ok(term::Term::Plain(lexical).to_stored());
                    }
                    return Ok(term::Term::Typed {
                        value: lexical,
                        datatype,
                    }
                    .to_stored());
                }
                Ok(term::Term::Plain(lexical).to_stored())
            }
            _ => Err(self.error("expected an IRI, blank node or literal")),
        }
    }
}

/// Write stored-form triples as N-Triples.
pub fn write_ntriples<'a, W, I>(writer: &mut W, triples: I) -> IoResult<()>
where
    W: Write,
    I: IntoIterator<Item = [&'a str; 3]>,
{
    for [s, p, o] in triples {
        writeln!(
            writer,
            "{} {} {} .",
            term_syntax(s),
            term_syntax(p),
            term_syntax(o)
        )?;
    }
    Ok(())
}

/// Write stored-form quads as N-Quads; `None` graphs land in the default
/// graph (no fourth term).
pub fn write_nquads<'a, W, I>(writer: &mut W, quads: I) -> IoResult<()>
where
    W: Write,
    I: IntoIterator<Item = ([&'a str; 3], Option<&'a str>)>,
{
    for ([s, p, o], g) in quads {
        match g {
            Some(g) if !g.is_empty() => writeln!(
                writer,
                "{} {} {} {} .",
                term_syntax(s),
                term_syntax(p),
                term_syntax(o),
                term_syntax(g)
            )?,
            _ => writeln!(
                writer,
                "{} {} {} .",
                term_syntax(s),
                term_syntax(p),
                term_syntax(o)
            )?,
        }
    }
    Ok(())
}

/// Stored-form term to N-Triples syntax. Literals and blank nodes already
/// carry their syntax; bare IRIs gain angle brackets.
fn term_syntax(stored: &str) -> String {
    if stored.starts_with('"') || stored.starts_with("_:") {
        stored.to_string()
    } else {
        format!("<{}>", stored)
    }
}

/// A sink that copies every quad, for tests and buffering callers.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub quads: Vec<(String, String, String, Option<String>)>,
}

impl QuadSink for CollectingSink {
    fn quad(&mut self, quad: QuadRef<'_>) -> IoResult<()> {
        self.quads.push((
            quad.subject.to_string(),
            quad.predicate.to_string(),
            quad.object.to_string(),
            quad.graph.map(str::to_string),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_triples() {
        let input = "\
# a comment
<http://x/a> <http://x/name> \"Alice\" .
<http://x/a> <http://x/age> \"30\"^^<http://www.w3.org/2001/XMLSchema#integer> .

_:b1 <http://x/label> \"chat\"@fr .
";
        let mut sink = CollectingSink::default();
        let count = parse_ntriples(input, &mut sink).unwrap();
        assert_eq!(count, 3);
        assert_eq!(sink.quads[0].0, "http://x/a");
        assert_eq!(sink.quads[0].2, "\"Alice\"");
        assert_eq!(
            sink.quads[1].2,
            "\"30\"^^<http://www.w3.org/2001/XMLSchema#integer>"
        );
        assert_eq!(sink.quads[2].0, "_:b1");
        assert_eq!(sink.quads[2].2, "\"chat\"@fr");
    }

    #[test]
    fn test_parse_nquads_graph() {
        let input = "<http://x/a> <http://x/p> <http://x/b> <http://g/1> .\n";
        let mut sink = CollectingSink::default();
        parse_nquads(input, &mut sink).unwrap();
        assert_eq!(sink.quads[0].3.as_deref(), Some("http://g/1"));
    }

    #[test]
    fn test_parse_error_position() {
        let err = parse_ntriples("<http://x/a> <http://x/p> \"v\"\n", &mut CollectingSink::default())
            .unwrap_err();
        match err {
            IoError::Parse { line, message, .. } => {
                assert_eq!(line, 1);
                assert!(message.contains("'.'"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_literal_escapes_round_trip() {
        let original = "<http://x/a> <http://x/p> \"line\\nbreak \\\"quoted\\\"\" .\n";
        let mut sink = CollectingSink::default();
        parse_ntriples(original, &mut sink).unwrap();

        let mut out = Vec::new();
        let (s, p, o, _) = &sink.quads[0];
        write_ntriples(&mut out, [[s.as_str(), p.as_str(), o.as_str()]]).unwrap();
        let serialized = String::from_utf8(out).unwrap();
        assert_eq!(serialized, original);

        let mut again = CollectingSink::default();
        parse_ntriples(&serialized, &mut again).unwrap();
        assert_eq!(again.quads, sink.quads);
    }

    #[test]
    fn test_xsd_string_normalizes() {
        let input =
            "<http://x/a> <http://x/p> \"v\"^^<http://www.w3.org/2001/XMLSchema#string> .\n";
        let mut sink = CollectingSink::default();
        parse_ntriples(input, &mut sink).unwrap();
        assert_eq!(sink.quads[0].2, "\"v\"");
    }

    #[test]
    fn test_literal_subject_rejected() {
        assert!(parse_ntriples(
            "\"v\" <http://x/p> <http://x/o> .\n",
            &mut CollectingSink::default()
        )
        .is_err());
    }
}

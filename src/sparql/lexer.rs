//! SPARQL tokenizer.
//!
//! Tokens borrow the query source; string and IRI tokens keep their raw
//! (still escaped) contents so the lexer never allocates term text.

use super::parser::ParseError;

/// A token kind with its borrowed payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tok<'a> {
    /// Bare word: keywords, `a`, `true`/`false`
    Word(&'a str),
    /// `?name` / `$name`, without the sigil
    Var(&'a str),
    /// `<...>` contents
    Iri(&'a str),
    /// `prefix:local`
    PName { prefix: &'a str, local: &'a str },
    /// Quoted string contents, escapes intact
    String(&'a str),
    /// `@tag`
    LangTag(&'a str),
    Integer(&'a str),
    Decimal(&'a str),
    /// `_:label`
    Blank(&'a str),
    Dot,
    Comma,
    Semicolon,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Star,
    Slash,
    Pipe,
    Caret,
    DoubleCaret,
    Plus,
    Minus,
    Question,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Eof,
}

/// A token plus its byte offset in the source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'a> {
    pub tok: Tok<'a>,
    pub pos: usize,
}

/// Tokenize `src` completely.
pub fn tokenize(src: &str) -> Result<Vec<Token<'_>>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'{' => {
                tokens.push(Token { tok: Tok::LBrace, pos: i });
                i += 1;
            }
            b'}' => {
                tokens.push(Token { tok: Tok::RBrace, pos: i });
                i += 1;
            }
            b'(' => {
                tokens.push(Token { tok: Tok::LParen, pos: i });
                i += 1;
            }
            b')' => {
                tokens.push(Token { tok: Tok::RParen, pos: i });
                i += 1;
            }
            b',' => {
                tokens.push(Token { tok: Tok::Comma, pos: i });
                i += 1;
            }
            b';' => {
                tokens.push(Token { tok: Tok::Semicolon, pos: i });
                i += 1;
            }
            b'*' => {
                tokens.push(Token { tok: Tok::Star, pos: i });
                i += 1;
            }
            b'/' => {
                tokens.push(Token { tok: Tok::Slash, pos: i });
                i += 1;
            }
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token { tok: Tok::OrOr, pos: i });
                    i += 2;
                } else {
                    tokens.push(Token { tok: Tok::Pipe, pos: i });
                    i += 1;
                }
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token { tok: Tok::AndAnd, pos: i });
                i += 2;
            }
            b'^' => {
                if bytes.get(i + 1) == Some(&b'^') {
                    tokens.push(Token { tok: Tok::DoubleCaret, pos: i });
                    i += 2;
                } else {
                    tokens.push(Token { tok: Tok::Caret, pos: i });
                    i += 1;
                }
            }
            b'+' => {
                tokens.push(Token { tok: Tok::Plus, pos: i });
                i += 1;
            }
            b'-' => {
                tokens.push(Token { tok: Tok::Minus, pos: i });
                i += 1;
            }
            b'=' => {
                tokens.push(Token { tok: Tok::Eq, pos: i });
                i += 1;
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { tok: Tok::Ne, pos: i });
                    i += 2;
                } else {
                    tokens.push(Token { tok: Tok::Bang, pos: i });
                    i += 1;
                }
            }
            b'<' => {
                // An IRIREF runs to `>` with no whitespace or quote inside;
                // anything else is the less-than operator.
                if let Some(end) = scan_iri_end(bytes, i + 1) {
                    let text = &src[i + 1..end];
                    tokens.push(Token {
                        tok: Tok::Iri(text),
                        pos: i,
                    });
                    i = end + 1;
                } else if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { tok: Tok::Le, pos: i });
                    i += 2;
                } else {
                    tokens.push(Token { tok: Tok::Lt, pos: i });
                    i += 1;
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { tok: Tok::Ge, pos: i });
                    i += 2;
                } else {
                    tokens.push(Token { tok: Tok::Gt, pos: i });
                    i += 1;
                }
            }
            b'.' => {
                // A dot directly before a digit begins a decimal literal.
                if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
                    let (tok, next) = lex_number(src, i)?;
                    tokens.push(Token { tok, pos: i });
                    i = next;
                } else {
                    tokens.push(Token { tok: Tok::Dot, pos: i });
                    i += 1;
                }
            }
            b'?' | b'$' => {
                let start = i + 1;
                let end = scan_name_end(bytes, start);
                if end > start {
                    tokens.push(Token {
                        tok: Tok::Var(&src[start..end]),
                        pos: i,
                    });
                    i = end;
                } else {
                    tokens.push(Token { tok: Tok::Question, pos: i });
                    i += 1;
                }
            }
            b'@' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'-')
                {
                    end += 1;
                }
                if end == start {
                    return Err(ParseError::unexpected(src, i, "@", "a language tag"));
                }
                tokens.push(Token {
                    tok: Tok::LangTag(&src[start..end]),
                    pos: i,
                });
                i = end;
            }
            b'"' | b'\'' => {
                let (text, next) = lex_string(src, i)?;
                tokens.push(Token {
                    tok: Tok::String(text),
                    pos: i,
                });
                i = next;
            }
            b'_' if bytes.get(i + 1) == Some(&b':') => {
                let start = i + 2;
                let end = scan_name_end(bytes, start);
                if end == start {
                    return Err(ParseError::unexpected(src, i, "_:", "a blank node label"));
                }
                tokens.push(Token {
                    tok: Tok::Blank(&src[start..end]),
                    pos: i,
                });
                i = end;
            }
            b'0'..=b'9' => {
                let (tok, next) = lex_number(src, i)?;
                tokens.push(Token { tok, pos: i });
                i = next;
            }
            _ if is_name_start(c) || c == b':' => {
                let start = i;
                let end = scan_name_end(bytes, i);
                // A colon right after the word makes this a prefixed name.
                if bytes.get(end) == Some(&b':') {
                    let local_start = end + 1;
                    let local_end = scan_local_end(bytes, local_start);
                    tokens.push(Token {
                        tok: Tok::PName {
                            prefix: &src[start..end],
                            local: &src[local_start..local_end],
                        },
                        pos: i,
                    });
                    i = local_end;
                } else if end > start {
                    tokens.push(Token {
                        tok: Tok::Word(&src[start..end]),
                        pos: i,
                    });
                    i = end;
                } else {
                    // Bare colon: prefixed name with the empty prefix.
                    let local_start = i + 1;
                    let local_end = scan_local_end(bytes, local_start);
                    tokens.push(Token {
                        tok: Tok::PName {
                            prefix: "",
                            local: &src[local_start..local_end],
                        },
                        pos: i,
                    });
                    i = local_end;
                }
            }
            _ => {
                return Err(ParseError::unexpected(
                    src,
                    i,
                    &src[i..src.len().min(i + 1)],
                    "a token",
                ));
            }
        }
    }

    tokens.push(Token {
        tok: Tok::Eof,
        pos: src.len(),
    });
    Ok(tokens)
}

fn scan_iri_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'>' => return Some(i),
            b' ' | b'\t' | b'\r' | b'\n' | b'"' | b'{' | b'}' | b'<' => return None,
            _ => i += 1,
        }
    }
    None
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c >= 0x80
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c >= 0x80
}

fn scan_name_end(bytes: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < bytes.len() && is_name_char(bytes[i]) {
        i += 1;
    }
    i
}

/// PN_LOCAL additionally allows dots (not at the end) and `%`-escapes.
fn scan_local_end(bytes: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < bytes.len() && (is_name_char(bytes[i]) || bytes[i] == b'.' || bytes[i] == b'%') {
        i += 1;
    }
    // A trailing dot belongs to the surrounding syntax.
    while i > from && bytes[i - 1] == b'.' {
        i -= 1;
    }
    i
}

fn lex_string(src: &str, start: usize) -> Result<(&str, usize), ParseError> {
    let bytes = src.as_bytes();
    let quote = bytes[start];
    // Long form: """...""" or '''...'''.
    if bytes.get(start + 1) == Some(&quote) && bytes.get(start + 2) == Some(&quote) {
        let body = start + 3;
        let mut i = body;
        while i + 2 < bytes.len() {
            if bytes[i] == quote && bytes[i + 1] == quote && bytes[i + 2] == quote {
                return Ok((&src[body..i], i + 3));
            }
            i += 1;
        }
        return Err(ParseError::unterminated_string(src, start));
    }
    let body = start + 1;
    let mut i = body;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => break,
            c if c == quote => return Ok((&src[body..i], i + 1)),
            _ => i += 1,
        }
    }
    Err(ParseError::unterminated_string(src, start))
}

fn lex_number(src: &str, start: usize) -> Result<(Tok<'_>, usize), ParseError> {
    let bytes = src.as_bytes();
    let mut i = start;
    let mut has_dot = false;
    let mut has_exp = false;

    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' => i += 1,
            b'.' if !has_dot && !has_exp => {
                // A dot not followed by a digit terminates the number (it is
                // the triple terminator).
                if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
                    has_dot = true;
                    i += 1;
                } else {
                    break;
                }
            }
            b'e' | b'E' if !has_exp => {
                has_exp = true;
                i += 1;
                if matches!(bytes.get(i), Some(b'+') | Some(b'-')) {
                    i += 1;
                }
                if !bytes.get(i).is_some_and(u8::is_ascii_digit) {
                    return Err(ParseError::bad_number(src, start, &src[start..i]));
                }
            }
            c if is_name_char(c) => {
                return Err(ParseError::bad_number(src, start, &src[start..=i]));
            }
            _ => break,
        }
    }

    let text = &src[start..i];
    let tok = if has_dot || has_exp {
        Tok::Decimal(text)
    } else {
        Tok::Integer(text)
    };
    Ok((tok, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Tok<'_>> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_basic_tokens() {
        let toks = kinds("SELECT ?name WHERE { ?s <http://p> \"v\"@en . }");
        assert_eq!(
            toks,
            vec![
                Tok::Word("SELECT"),
                Tok::Var("name"),
                Tok::Word("WHERE"),
                Tok::LBrace,
                Tok::Var("s"),
                Tok::Iri("http://p"),
                Tok::String("v"),
                Tok::LangTag("en"),
                Tok::Dot,
                Tok::RBrace,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_prefixed_names() {
        let toks = kinds("foaf:name :p xsd:integer");
        assert_eq!(
            toks,
            vec![
                Tok::PName {
                    prefix: "foaf",
                    local: "name"
                },
                Tok::PName {
                    prefix: "",
                    local: "p"
                },
                Tok::PName {
                    prefix: "xsd",
                    local: "integer"
                },
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("30 3.5 2e10 ."),
            vec![
                Tok::Integer("30"),
                Tok::Decimal("3.5"),
                Tok::Decimal("2e10"),
                Tok::Dot,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_number_then_terminator_dot() {
        assert_eq!(
            kinds("?x :p 30 ."),
            vec![
                Tok::Var("x"),
                Tok::PName {
                    prefix: "",
                    local: "p"
                },
                Tok::Integer("30"),
                Tok::Dot,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_operators_vs_iris() {
        assert_eq!(
            kinds("?a < ?b && ?c >= 3"),
            vec![
                Tok::Var("a"),
                Tok::Lt,
                Tok::Var("b"),
                Tok::AndAnd,
                Tok::Var("c"),
                Tok::Ge,
                Tok::Integer("3"),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("SELECT # all of it\n *"),
            vec![Tok::Word("SELECT"), Tok::Star, Tok::Eof]
        );
    }

    #[test]
    fn test_path_operators() {
        assert_eq!(
            kinds("^:p :q* :r+ :s?"),
            vec![
                Tok::Caret,
                Tok::PName {
                    prefix: "",
                    local: "p"
                },
                Tok::PName {
                    prefix: "",
                    local: "q"
                },
                Tok::Star,
                Tok::PName {
                    prefix: "",
                    local: "r"
                },
                Tok::Plus,
                Tok::PName {
                    prefix: "",
                    local: "s"
                },
                Tok::Question,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_iri_is_less_than() {
        // `<` with whitespace after it cannot start an IRI.
        assert_eq!(
            kinds("?a < 3"),
            vec![Tok::Var("a"), Tok::Lt, Tok::Integer("3"), Tok::Eof]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("\"oops").is_err());
    }

    #[test]
    fn test_blank_node() {
        assert_eq!(kinds("_:b1"), vec![Tok::Blank("b1"), Tok::Eof]);
    }
}

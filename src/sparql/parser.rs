//! SPARQL 1.1 parser.
//!
//! Recursive descent over the token stream from [`super::lexer`]. The
//! resulting [`Query`] borrows every term from the source string. Group
//! capacities are enforced here; the parser refuses oversized input rather
//! than truncating it.

use super::ast::*;
use super::lexer::{tokenize, Tok, Token};
use thiserror::Error;

const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
/// Group-nesting bound; recursion past this is a capacity error.
const MAX_DEPTH: usize = 32;

/// Parser errors
#[derive(Error, Debug)]
pub enum ParseError {
    /// Unexpected token
    #[error("Unexpected token at line {line}, column {column}: found '{found}', expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        line: usize,
        column: usize,
    },

    /// Unterminated IRI
    #[error("Unterminated IRI at line {line}, column {column}")]
    UnterminatedIri { line: usize, column: usize },

    /// Unterminated string literal
    #[error("Unterminated string at line {line}, column {column}")]
    UnterminatedString { line: usize, column: usize },

    /// Malformed numeric literal
    #[error("Bad numeric literal '{text}' at line {line}, column {column}")]
    BadNumericLiteral {
        text: String,
        line: usize,
        column: usize,
    },

    /// A group was not closed before end of input
    #[error("Unclosed group starting at line {line}, column {column}")]
    UnclosedGroup { line: usize, column: usize },

    /// Unknown aggregate function
    #[error("Unknown aggregate '{name}' at line {line}, column {column}")]
    UnknownAggregate {
        name: String,
        line: usize,
        column: usize,
    },

    /// Prefixed name with an undeclared prefix
    #[error("Unknown prefix '{name}:' at line {line}, column {column}")]
    UnknownPrefix {
        name: String,
        line: usize,
        column: usize,
    },

    /// An inline AST capacity was exceeded
    #[error("Too many {what} in one group (limit {limit})")]
    Capacity { what: &'static str, limit: usize },

    /// Recognized but unsupported syntax
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub type ParseResult<T> = Result<T, ParseError>;

impl ParseError {
    pub(super) fn unexpected(src: &str, pos: usize, found: &str, expected: &str) -> Self {
        let (line, column) = position(src, pos);
        ParseError::UnexpectedToken {
            found: found.to_string(),
            expected: expected.to_string(),
            line,
            column,
        }
    }

    pub(super) fn unterminated_string(src: &str, pos: usize) -> Self {
        let (line, column) = position(src, pos);
        ParseError::UnterminatedString { line, column }
    }

    pub(super) fn bad_number(src: &str, pos: usize, text: &str) -> Self {
        let (line, column) = position(src, pos);
        ParseError::BadNumericLiteral {
            text: text.to_string(),
            line,
            column,
        }
    }
}

/// Byte offset to 1-based line and column.
pub fn position(src: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut column = 1;
    for (i, c) in src.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

/// Parse a SPARQL query or update.
pub fn parse_query(src: &str) -> ParseResult<Query<'_>> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
        prefixes: Vec::new(),
        base: None,
    };
    parser.parse()
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token<'a>>,
    pos: usize,
    prefixes: Vec<(&'a str, &'a str)>,
    base: Option<&'a str>,
}

impl<'a> Parser<'a> {
    fn parse(&mut self) -> ParseResult<Query<'a>> {
        self.parse_prologue()?;

        let form = if self.at_word("SELECT") {
            QueryForm::Select(self.parse_select(false)?)
        } else if self.at_word("ASK") {
            self.advance();
            let mut body = SelectQuery {
                star: true,
                ..Default::default()
            };
            self.parse_datasets(&mut body)?;
            self.eat_word("WHERE");
            body.where_clause = self.parse_group(0, false)?;
            QueryForm::Ask { body }
        } else if self.at_word("CONSTRUCT") {
            self.advance();
            let template = self.parse_quad_block(true)?;
            let mut body = SelectQuery {
                star: true,
                ..Default::default()
            };
            self.parse_datasets(&mut body)?;
            self.expect_word("WHERE")?;
            body.where_clause = self.parse_group(0, false)?;
            self.parse_solution_modifiers(&mut body)?;
            QueryForm::Construct { template, body }
        } else if self.at_word("DESCRIBE") {
            self.advance();
            let mut targets = Vec::new();
            let mut star = false;
            if self.eat(Tok::Star) {
                star = true;
            } else {
                loop {
                    match self.peek() {
                        Tok::Var(_) | Tok::Iri(_) | Tok::PName { .. } => {
                            targets.push(self.parse_term()?);
                        }
                        _ => break,
                    }
                }
                if targets.is_empty() {
                    return Err(self.error_here("a variable, IRI or '*'"));
                }
            }
            let mut body = None;
            if self.at_word("WHERE") || self.at(Tok::LBrace) {
                self.eat_word("WHERE");
                let mut select = SelectQuery {
                    star: true,
                    ..Default::default()
                };
                select.where_clause = self.parse_group(0, false)?;
                self.parse_solution_modifiers(&mut select)?;
                body = Some(select);
            }
            QueryForm::Describe {
                targets,
                star,
                body,
            }
        } else {
            QueryForm::Update(self.parse_update_ops()?)
        };

        self.expect(Tok::Eof, "end of input")?;
        Ok(Query {
            base: self.base,
            prefixes: std::mem::take(&mut self.prefixes),
            form,
        })
    }

    fn parse_prologue(&mut self) -> ParseResult<()> {
        loop {
            if self.eat_word("PREFIX") {
                let (prefix, local) = match self.peek() {
                    Tok::PName { prefix, local } => {
                        self.advance();
                        (prefix, local)
                    }
                    _ => return Err(self.error_here("a prefix declaration like 'foaf:'")),
                };
                if !local.is_empty() {
                    return Err(self.error_here("a prefix name ending in ':'"));
                }
                let iri = self.expect_iri_text()?;
                self.prefixes.push((prefix, iri));
            } else if self.eat_word("BASE") {
                let iri = self.expect_iri_text()?;
                self.base = Some(iri);
            } else {
                return Ok(());
            }
        }
    }

    // ---- SELECT ----------------------------------------------------------

    fn parse_select(&mut self, subquery: bool) -> ParseResult<SelectQuery<'a>> {
        self.expect_word("SELECT")?;
        let mut query = SelectQuery::default();
        if self.eat_word("DISTINCT") {
            query.distinct = true;
        } else if self.eat_word("REDUCED") {
            query.reduced = true;
        }

        if self.eat(Tok::Star) {
            query.star = true;
        } else {
            loop {
                match self.peek() {
                    Tok::Var(v) => {
                        self.advance();
                        query.items.push(SelectItem::Var(v));
                    }
                    Tok::LParen => {
                        self.advance();
                        let item = self.parse_projection_expr()?;
                        query.items.push(item);
                    }
                    _ => break,
                }
            }
            if query.items.is_empty() {
                return Err(self.error_here("a projection list or '*'"));
            }
        }

        if !subquery {
            self.parse_datasets(&mut query)?;
        }
        self.eat_word("WHERE");
        query.where_clause = self.parse_group(0, subquery)?;
        self.parse_solution_modifiers(&mut query)?;
        Ok(query)
    }

    /// `( expr AS ?alias )` where expr may be an aggregate call.
    fn parse_projection_expr(&mut self) -> ParseResult<SelectItem<'a>> {
        if let Tok::Word(name) = self.peek() {
            if let Some(func) = aggregate_func(name) {
                if self.peek_ahead(1) == Tok::LParen {
                    self.advance();
                    let agg = self.parse_aggregate_body(func)?;
                    self.expect_word("AS")?;
                    let alias = self.expect_var()?;
                    self.expect(Tok::RParen, "')'")?;
                    return Ok(SelectItem::Agg { agg, alias });
                }
            } else if looks_like_aggregate(name) && self.peek_ahead(1) == Tok::LParen {
                let pos = self.peek_pos();
                let (line, column) = position(self.src, pos);
                return Err(ParseError::UnknownAggregate {
                    name: name.to_string(),
                    line,
                    column,
                });
            }
        }
        let expr = self.parse_expr()?;
        self.expect_word("AS")?;
        let alias = self.expect_var()?;
        self.expect(Tok::RParen, "')'")?;
        Ok(SelectItem::Expr { expr, alias })
    }

    fn parse_aggregate_body(&mut self, func: AggFunc) -> ParseResult<Aggregate<'a>> {
        self.expect(Tok::LParen, "'('")?;
        let distinct = self.eat_word("DISTINCT");
        let expr = if self.eat(Tok::Star) {
            if func != AggFunc::Count {
                return Err(ParseError::Unsupported(
                    "'*' is only valid inside COUNT".to_string(),
                ));
            }
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(Tok::RParen, "')'")?;
        Ok(Aggregate {
            func,
            distinct,
            expr,
        })
    }

    fn parse_datasets(&mut self, query: &mut SelectQuery<'a>) -> ParseResult<()> {
        while self.eat_word("FROM") {
            if self.eat_word("NAMED") {
                query.from_named.push(self.expect_iri_ref()?);
            } else {
                query.from.push(self.expect_iri_ref()?);
            }
        }
        Ok(())
    }

    fn parse_solution_modifiers(&mut self, query: &mut SelectQuery<'a>) -> ParseResult<()> {
        if self.eat_word("GROUP") {
            self.expect_word("BY")?;
            loop {
                match self.peek() {
                    Tok::Var(v) => {
                        self.advance();
                        query.group_by.push(v);
                    }
                    _ => break,
                }
            }
            if query.group_by.is_empty() {
                return Err(self.error_here("one or more grouping variables"));
            }
        }
        if self.eat_word("HAVING") {
            query.having = Some(self.parse_constraint()?);
        }
        if self.eat_word("ORDER") {
            self.expect_word("BY")?;
            loop {
                let key = if self.eat_word("ASC") {
                    self.expect(Tok::LParen, "'('")?;
                    let expr = self.parse_expr()?;
                    self.expect(Tok::RParen, "')'")?;
                    OrderKey {
                        expr,
                        descending: false,
                    }
                } else if self.eat_word("DESC") {
                    self.expect(Tok::LParen, "'('")?;
                    let expr = self.parse_expr()?;
                    self.expect(Tok::RParen, "')'")?;
                    OrderKey {
                        expr,
                        descending: true,
                    }
                } else if let Tok::Var(v) = self.peek() {
                    self.advance();
                    OrderKey {
                        expr: Expr::Term(TermRef::Var(v)),
                        descending: false,
                    }
                } else if self.at(Tok::LParen) {
                    self.advance();
                    let expr = self.parse_expr()?;
                    self.expect(Tok::RParen, "')'")?;
                    OrderKey {
                        expr,
                        descending: false,
                    }
                } else {
                    break;
                };
                query.order_by.push(key);
            }
            if query.order_by.is_empty() {
                return Err(self.error_here("one or more ordering keys"));
            }
        }
        loop {
            if self.eat_word("LIMIT") {
                query.limit = Some(self.expect_usize()?);
            } else if self.eat_word("OFFSET") {
                query.offset = Some(self.expect_usize()?);
            } else {
                break;
            }
        }
        Ok(())
    }

    // ---- group patterns --------------------------------------------------

    fn parse_group(&mut self, depth: usize, subquery: bool) -> ParseResult<GroupPattern<'a>> {
        if depth >= MAX_DEPTH {
            return Err(ParseError::Capacity {
                what: "nested groups",
                limit: MAX_DEPTH,
            });
        }
        let open_pos = self.peek_pos();
        self.expect(Tok::LBrace, "'{'")?;
        let mut group = GroupPattern::default();
        let mut exists_count = 0usize;
        let pattern_cap = if subquery {
            MAX_SUB_PATTERNS
        } else {
            MAX_PATTERNS
        };

        loop {
            match self.peek() {
                Tok::RBrace => {
                    self.advance();
                    return Ok(group);
                }
                Tok::Eof => {
                    let (line, column) = position(self.src, open_pos);
                    return Err(ParseError::UnclosedGroup { line, column });
                }
                Tok::Dot => {
                    self.advance();
                }
                Tok::LBrace => {
                    // Either a subselect, a UNION chain, or a plain nested
                    // group (whose contents join into this one).
                    if self.is_select_after_brace() {
                        self.advance();
                        let sub = self.parse_select(true)?;
                        self.expect(Tok::RBrace, "'}' after subselect")?;
                        if group.subqueries.len() == MAX_SUBQUERIES {
                            return Err(ParseError::Capacity {
                                what: "subqueries",
                                limit: MAX_SUBQUERIES,
                            });
                        }
                        group.subqueries.push(Box::new(sub));
                    } else {
                        let first = self.parse_group(depth + 1, subquery)?;
                        if self.at_word("UNION") {
                            let mut left = first;
                            while self.eat_word("UNION") {
                                let right = self.parse_group(depth + 1, subquery)?;
                                if group.unions.len() == MAX_UNIONS {
                                    return Err(ParseError::Capacity {
                                        what: "UNION clauses",
                                        limit: MAX_UNIONS,
                                    });
                                }
                                // Chains left-associate: (a UNION b) UNION c.
                                if self.at_word("UNION") {
                                    let merged = GroupPattern {
                                        unions: vec![UnionClause {
                                            left: Box::new(left),
                                            right: Box::new(right),
                                        }],
                                        ..Default::default()
                                    };
                                    left = merged;
                                } else {
                                    group.unions.push(UnionClause {
                                        left: Box::new(left),
                                        right: Box::new(right),
                                    });
                                    break;
                                }
                            }
                        } else {
                            self.merge_group(&mut group, first, pattern_cap)?;
                        }
                    }
                }
                Tok::Word(w) if w.eq_ignore_ascii_case("OPTIONAL") => {
                    self.advance();
                    let inner = self.parse_group(depth + 1, subquery)?;
                    if group.optionals.len() == MAX_OPTIONALS {
                        return Err(ParseError::Capacity {
                            what: "OPTIONAL groups",
                            limit: MAX_OPTIONALS,
                        });
                    }
                    group.optionals.push(Box::new(inner));
                }
                Tok::Word(w) if w.eq_ignore_ascii_case("MINUS") => {
                    self.advance();
                    let inner = self.parse_group(depth + 1, subquery)?;
                    if group.minuses.len() == MAX_MINUS {
                        return Err(ParseError::Capacity {
                            what: "MINUS groups",
                            limit: MAX_MINUS,
                        });
                    }
                    group.minuses.push(Box::new(inner));
                }
                Tok::Word(w) if w.eq_ignore_ascii_case("GRAPH") => {
                    self.advance();
                    let graph = match self.peek() {
                        Tok::Var(_) | Tok::Iri(_) | Tok::PName { .. } => self.parse_term()?,
                        _ => return Err(self.error_here("a graph IRI or variable")),
                    };
                    let inner = self.parse_group(depth + 1, subquery)?;
                    if group.graphs.len() == MAX_GRAPHS {
                        return Err(ParseError::Capacity {
                            what: "GRAPH clauses",
                            limit: MAX_GRAPHS,
                        });
                    }
                    group.graphs.push(GraphClause {
                        graph,
                        group: Box::new(inner),
                    });
                }
                Tok::Word(w) if w.eq_ignore_ascii_case("FILTER") => {
                    self.advance();
                    let expr = if self.at_word("EXISTS") || self.at_word("NOT") {
                        let negated = self.eat_word("NOT");
                        self.expect_word("EXISTS")?;
                        let inner = self.parse_group(depth + 1, subquery)?;
                        exists_count += 1;
                        if exists_count > MAX_EXISTS {
                            return Err(ParseError::Capacity {
                                what: "EXISTS filters",
                                limit: MAX_EXISTS,
                            });
                        }
                        Expr::Exists {
                            group: Box::new(inner),
                            negated,
                        }
                    } else {
                        self.parse_constraint()?
                    };
                    if group.filters.len() == MAX_FILTERS {
                        return Err(ParseError::Capacity {
                            what: "filters",
                            limit: MAX_FILTERS,
                        });
                    }
                    group.filters.push(expr);
                }
                Tok::Word(w) if w.eq_ignore_ascii_case("BIND") => {
                    self.advance();
                    self.expect(Tok::LParen, "'('")?;
                    let expr = self.parse_expr()?;
                    self.expect_word("AS")?;
                    let var = self.expect_var()?;
                    self.expect(Tok::RParen, "')'")?;
                    if group.binds.len() == MAX_BINDS {
                        return Err(ParseError::Capacity {
                            what: "BIND clauses",
                            limit: MAX_BINDS,
                        });
                    }
                    group.binds.push(Bind { expr, var });
                }
                Tok::Word(w) if w.eq_ignore_ascii_case("VALUES") => {
                    let values = self.parse_values()?;
                    if group.values.is_some() {
                        return Err(ParseError::Unsupported(
                            "more than one VALUES clause per group".to_string(),
                        ));
                    }
                    group.values = Some(values);
                }
                _ => {
                    self.parse_triple_block(&mut group, pattern_cap)?;
                }
            }
        }
    }

    /// Join the contents of a plain nested group into `target`.
    fn merge_group(
        &self,
        target: &mut GroupPattern<'a>,
        other: GroupPattern<'a>,
        pattern_cap: usize,
    ) -> ParseResult<()> {
        if target.patterns.len() + other.patterns.len() > pattern_cap {
            return Err(ParseError::Capacity {
                what: "triple patterns",
                limit: pattern_cap,
            });
        }
        if target.filters.len() + other.filters.len() > MAX_FILTERS {
            return Err(ParseError::Capacity {
                what: "filters",
                limit: MAX_FILTERS,
            });
        }
        target.patterns.extend(other.patterns);
        target.filters.extend(other.filters);
        target.binds.extend(other.binds);
        target.optionals.extend(other.optionals);
        target.unions.extend(other.unions);
        target.minuses.extend(other.minuses);
        target.graphs.extend(other.graphs);
        target.subqueries.extend(other.subqueries);
        if other.values.is_some() {
            if target.values.is_some() {
                return Err(ParseError::Unsupported(
                    "more than one VALUES clause per group".to_string(),
                ));
            }
            target.values = other.values;
        }
        Ok(())
    }

    /// True when the token after a brace we have not consumed yet begins a
    /// subselect.
    fn is_select_after_brace(&self) -> bool {
        matches!(self.peek_ahead(1), Tok::Word(w) if w.eq_ignore_ascii_case("SELECT"))
    }

    fn parse_values(&mut self) -> ParseResult<ValuesClause<'a>> {
        self.expect_word("VALUES")?;
        let mut vars = Vec::new();
        let parenthesized = self.eat(Tok::LParen);
        if parenthesized {
            while let Tok::Var(v) = self.peek() {
                self.advance();
                vars.push(v);
            }
            self.expect(Tok::RParen, "')'")?;
        } else {
            vars.push(self.expect_var()?);
        }
        self.expect(Tok::LBrace, "'{'")?;
        let mut rows = Vec::new();
        loop {
            if self.eat(Tok::RBrace) {
                break;
            }
            let mut row = Vec::with_capacity(vars.len());
            if parenthesized {
                self.expect(Tok::LParen, "'('")?;
                for _ in 0..vars.len() {
                    row.push(self.parse_values_term()?);
                }
                self.expect(Tok::RParen, "')'")?;
            } else {
                row.push(self.parse_values_term()?);
            }
            rows.push(row);
        }
        Ok(ValuesClause { vars, rows })
    }

    fn parse_values_term(&mut self) -> ParseResult<Option<TermRef<'a>>> {
        if self.eat_word("UNDEF") {
            return Ok(None);
        }
        Ok(Some(self.parse_term()?))
    }

    /// One subject with its predicate-object list (`;` and `,`
    /// continuations).
    fn parse_triple_block(
        &mut self,
        group: &mut GroupPattern<'a>,
        pattern_cap: usize,
    ) -> ParseResult<()> {
        let subject = self.parse_term()?;
        loop {
            let path = self.parse_path()?;
            loop {
                let object = self.parse_term()?;
                if group.patterns.len() == pattern_cap {
                    return Err(ParseError::Capacity {
                        what: "triple patterns",
                        limit: pattern_cap,
                    });
                }
                group.patterns.push(TriplePattern {
                    subject: subject.clone(),
                    path: path.clone(),
                    object,
                });
                if !self.eat(Tok::Comma) {
                    break;
                }
            }
            if !self.eat(Tok::Semicolon) {
                break;
            }
            // A dangling semicolon before '.' or '}' is legal.
            if matches!(self.peek(), Tok::Dot | Tok::RBrace) {
                break;
            }
        }
        self.eat(Tok::Dot);
        Ok(())
    }

    // ---- property paths --------------------------------------------------

    fn parse_path(&mut self) -> ParseResult<PropertyPath<'a>> {
        let first = self.parse_path_sequence()?;
        if !self.at(Tok::Pipe) {
            return Ok(first);
        }
        let mut arms = vec![first];
        while self.eat(Tok::Pipe) {
            arms.push(self.parse_path_sequence()?);
        }
        Ok(PropertyPath::Alternative(arms))
    }

    fn parse_path_sequence(&mut self) -> ParseResult<PropertyPath<'a>> {
        let first = self.parse_path_elt()?;
        if !self.at(Tok::Slash) {
            return Ok(first);
        }
        let mut steps = vec![first];
        while self.eat(Tok::Slash) {
            steps.push(self.parse_path_elt()?);
        }
        Ok(PropertyPath::Sequence(steps))
    }

    fn parse_path_elt(&mut self) -> ParseResult<PropertyPath<'a>> {
        let inverse = self.eat(Tok::Caret);
        let mut path = self.parse_path_primary()?;
        if inverse {
            path = PropertyPath::Inverse(Box::new(path));
        }
        path = match self.peek() {
            Tok::Star => {
                self.advance();
                PropertyPath::ZeroOrMore(Box::new(path))
            }
            Tok::Plus => {
                self.advance();
                PropertyPath::OneOrMore(Box::new(path))
            }
            Tok::Question => {
                self.advance();
                PropertyPath::ZeroOrOne(Box::new(path))
            }
            _ => path,
        };
        Ok(path)
    }

    fn parse_path_primary(&mut self) -> ParseResult<PropertyPath<'a>> {
        match self.peek() {
            Tok::LParen => {
                self.advance();
                let path = self.parse_path()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(path)
            }
            Tok::Var(v) => {
                self.advance();
                Ok(PropertyPath::Simple(TermRef::Var(v)))
            }
            Tok::Iri(iri) => {
                self.advance();
                Ok(PropertyPath::Simple(TermRef::Iri(IriRef::Iri(iri))))
            }
            Tok::PName { prefix, local } => {
                self.check_prefix(prefix)?;
                self.advance();
                Ok(PropertyPath::Simple(TermRef::Iri(IriRef::Prefixed {
                    prefix,
                    local,
                })))
            }
            Tok::Word("a") => {
                self.advance();
                Ok(PropertyPath::Simple(TermRef::Iri(IriRef::Iri(RDF_TYPE))))
            }
            _ => Err(self.error_here("a predicate or property path")),
        }
    }

    // ---- terms -----------------------------------------------------------

    fn parse_term(&mut self) -> ParseResult<TermRef<'a>> {
        match self.peek() {
            Tok::Var(v) => {
                self.advance();
                Ok(TermRef::Var(v))
            }
            Tok::Iri(iri) => {
                self.advance();
                Ok(TermRef::Iri(IriRef::Iri(iri)))
            }
            Tok::PName { prefix, local } => {
                self.check_prefix(prefix)?;
                self.advance();
                Ok(TermRef::Iri(IriRef::Prefixed { prefix, local }))
            }
            Tok::Blank(label) => {
                self.advance();
                Ok(TermRef::Blank(label))
            }
            Tok::Integer(text) => {
                self.advance();
                Ok(TermRef::Integer(text))
            }
            Tok::Decimal(text) => {
                self.advance();
                Ok(TermRef::Double(text))
            }
            Tok::Minus => {
                // Signed numeric literal: reslice the source to keep the
                // sign inside the borrowed window.
                let minus_pos = self.peek_pos();
                self.advance();
                match self.peek() {
                    Tok::Integer(text) if self.peek_pos() == minus_pos + 1 => {
                        let end = self.peek_pos() + text.len();
                        self.advance();
                        Ok(TermRef::Integer(&self.src[minus_pos..end]))
                    }
                    Tok::Decimal(text) if self.peek_pos() == minus_pos + 1 => {
                        let end = self.peek_pos() + text.len();
                        self.advance();
                        Ok(TermRef::Double(&self.src[minus_pos..end]))
                    }
                    _ => Err(self.error_here("a numeric literal after '-'")),
                }
            }
            Tok::String(value) => {
                self.advance();
                match self.peek() {
                    Tok::LangTag(lang) => {
                        self.advance();
                        Ok(TermRef::Literal {
                            value,
                            lang: Some(lang),
                            datatype: None,
                        })
                    }
                    Tok::DoubleCaret => {
                        self.advance();
                        let datatype = self.expect_iri_ref()?;
                        Ok(TermRef::Literal {
                            value,
                            lang: None,
                            datatype: Some(datatype),
                        })
                    }
                    _ => Ok(TermRef::Literal {
                        value,
                        lang: None,
                        datatype: None,
                    }),
                }
            }
            Tok::Word(w) if w.eq_ignore_ascii_case("true") => {
                self.advance();
                Ok(TermRef::Boolean(true))
            }
            Tok::Word(w) if w.eq_ignore_ascii_case("false") => {
                self.advance();
                Ok(TermRef::Boolean(false))
            }
            _ => Err(self.error_here("an RDF term")),
        }
    }

    // ---- expressions -----------------------------------------------------

    /// FILTER / HAVING constraint: a bracketted expression or bare call.
    fn parse_constraint(&mut self) -> ParseResult<Expr<'a>> {
        if self.at(Tok::LParen) {
            self.advance();
            let expr = self.parse_expr()?;
            self.expect(Tok::RParen, "')'")?;
            Ok(expr)
        } else {
            self.parse_primary_expr()
        }
    }

    fn parse_expr(&mut self) -> ParseResult<Expr<'a>> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ParseResult<Expr<'a>> {
        let mut lhs = self.parse_and()?;
        while self.eat(Tok::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> ParseResult<Expr<'a>> {
        let mut lhs = self.parse_relational()?;
        while self.eat(Tok::AndAnd) {
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> ParseResult<Expr<'a>> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Tok::Eq => BinOp::Eq,
            Tok::Ne => BinOp::Ne,
            Tok::Lt => BinOp::Lt,
            Tok::Le => BinOp::Le,
            Tok::Gt => BinOp::Gt,
            Tok::Ge => BinOp::Ge,
            Tok::Word(w) if w.eq_ignore_ascii_case("IN") => {
                self.advance();
                let list = self.parse_expr_list()?;
                return Ok(Expr::In {
                    expr: Box::new(lhs),
                    list,
                    negated: false,
                });
            }
            Tok::Word(w) if w.eq_ignore_ascii_case("NOT") => {
                self.advance();
                self.expect_word("IN")?;
                let list = self.parse_expr_list()?;
                return Ok(Expr::In {
                    expr: Box::new(lhs),
                    list,
                    negated: true,
                });
            }
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_additive(&mut self) -> ParseResult<Expr<'a>> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr<'a>> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr<'a>> {
        if self.eat(Tok::Bang) {
            return Ok(Expr::Unary {
                op: UnOp::Not,
                expr: Box::new(self.parse_unary()?),
            });
        }
        if self.eat(Tok::Minus) {
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                expr: Box::new(self.parse_unary()?),
            });
        }
        if self.eat(Tok::Plus) {
            return self.parse_unary();
        }
        self.parse_primary_expr()
    }

    fn parse_primary_expr(&mut self) -> ParseResult<Expr<'a>> {
        match self.peek() {
            Tok::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(expr)
            }
            Tok::Word(w) if w.eq_ignore_ascii_case("EXISTS") => {
                self.advance();
                let group = self.parse_group(0, false)?;
                Ok(Expr::Exists {
                    group: Box::new(group),
                    negated: false,
                })
            }
            Tok::Word(w) if w.eq_ignore_ascii_case("NOT") => {
                self.advance();
                self.expect_word("EXISTS")?;
                let group = self.parse_group(0, false)?;
                Ok(Expr::Exists {
                    group: Box::new(group),
                    negated: true,
                })
            }
            Tok::Word(w) => {
                if let Some(func) = builtin_func(w) {
                    if self.peek_ahead(1) == Tok::LParen {
                        self.advance();
                        let args = self.parse_expr_list()?;
                        return Ok(Expr::Call { func, args });
                    }
                }
                self.parse_term().map(Expr::Term)
            }
            Tok::PName { prefix, local } if self.peek_ahead(1) == Tok::LParen => {
                self.check_prefix(prefix)?;
                self.advance();
                self.expect(Tok::LParen, "'('")?;
                let expr = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(Expr::Cast {
                    datatype: IriRef::Prefixed { prefix, local },
                    expr: Box::new(expr),
                })
            }
            Tok::Iri(iri) if self.peek_ahead(1) == Tok::LParen => {
                self.advance();
                self.expect(Tok::LParen, "'('")?;
                let expr = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(Expr::Cast {
                    datatype: IriRef::Iri(iri),
                    expr: Box::new(expr),
                })
            }
            _ => self.parse_term().map(Expr::Term),
        }
    }

    fn parse_expr_list(&mut self) -> ParseResult<Vec<Expr<'a>>> {
        self.expect(Tok::LParen, "'('")?;
        let mut list = Vec::new();
        if self.eat(Tok::RParen) {
            return Ok(list);
        }
        loop {
            list.push(self.parse_expr()?);
            if self.eat(Tok::Comma) {
                continue;
            }
            self.expect(Tok::RParen, "')' or ','")?;
            return Ok(list);
        }
    }

    // ---- updates ---------------------------------------------------------

    fn parse_update_ops(&mut self) -> ParseResult<Vec<UpdateOp<'a>>> {
        let mut ops = Vec::new();
        loop {
            if self.at(Tok::Eof) {
                break;
            }
            ops.push(self.parse_update_op()?);
            if !self.eat(Tok::Semicolon) {
                break;
            }
            // Each operation may repeat the prologue.
            self.parse_prologue()?;
        }
        if ops.is_empty() {
            return Err(self.error_here("a query or update operation"));
        }
        Ok(ops)
    }

    fn parse_update_op(&mut self) -> ParseResult<UpdateOp<'a>> {
        if self.eat_word("INSERT") {
            if self.eat_word("DATA") {
                let quads = self.parse_quad_block(false)?;
                return Ok(UpdateOp::InsertData(quads));
            }
            let insert = self.parse_quad_block(true)?;
            self.expect_word("WHERE")?;
            let where_clause = self.parse_group(0, false)?;
            return Ok(UpdateOp::Modify {
                delete: Vec::new(),
                insert,
                where_clause,
            });
        }
        if self.eat_word("DELETE") {
            if self.eat_word("DATA") {
                let quads = self.parse_quad_block(false)?;
                return Ok(UpdateOp::DeleteData(quads));
            }
            if self.at_word("WHERE") {
                // DELETE WHERE { ... }: the pattern is its own template.
                self.advance();
                let where_clause = self.parse_group(0, false)?;
                let delete = patterns_as_templates(&where_clause)?;
                return Ok(UpdateOp::Modify {
                    delete,
                    insert: Vec::new(),
                    where_clause,
                });
            }
            let delete = self.parse_quad_block(true)?;
            let insert = if self.eat_word("INSERT") {
                self.parse_quad_block(true)?
            } else {
                Vec::new()
            };
            self.expect_word("WHERE")?;
            let where_clause = self.parse_group(0, false)?;
            return Ok(UpdateOp::Modify {
                delete,
                insert,
                where_clause,
            });
        }
        if self.eat_word("CLEAR") {
            self.eat_word("SILENT");
            return Ok(UpdateOp::Clear(self.parse_graph_target()?));
        }
        if self.eat_word("DROP") {
            self.eat_word("SILENT");
            return Ok(UpdateOp::Drop(self.parse_graph_target()?));
        }
        Err(self.error_here("INSERT, DELETE, CLEAR or DROP"))
    }

    fn parse_graph_target(&mut self) -> ParseResult<GraphTarget<'a>> {
        if self.eat_word("DEFAULT") {
            Ok(GraphTarget::Default)
        } else if self.eat_word("NAMED") {
            Ok(GraphTarget::Named)
        } else if self.eat_word("ALL") {
            Ok(GraphTarget::All)
        } else if self.eat_word("GRAPH") {
            Ok(GraphTarget::Graph(self.expect_iri_ref()?))
        } else {
            Err(self.error_here("GRAPH <iri>, DEFAULT, NAMED or ALL"))
        }
    }

    /// `{ triples... GRAPH g { triples... } ... }` used by data blocks,
    /// templates and CONSTRUCT. With `allow_vars` false every term must be
    /// ground.
    fn parse_quad_block(&mut self, allow_vars: bool) -> ParseResult<Vec<QuadTemplate<'a>>> {
        self.expect(Tok::LBrace, "'{'")?;
        let mut quads = Vec::new();
        loop {
            match self.peek() {
                Tok::RBrace => {
                    self.advance();
                    return Ok(quads);
                }
                Tok::Eof => return Err(self.error_here("'}'")),
                Tok::Dot => {
                    self.advance();
                }
                Tok::Word(w) if w.eq_ignore_ascii_case("GRAPH") => {
                    self.advance();
                    let graph = self.parse_term()?;
                    if !allow_vars && graph.is_var() {
                        return Err(ParseError::Unsupported(
                            "variables are not allowed in ground data".to_string(),
                        ));
                    }
                    self.expect(Tok::LBrace, "'{'")?;
                    loop {
                        match self.peek() {
                            Tok::RBrace => {
                                self.advance();
                                break;
                            }
                            Tok::Eof => return Err(self.error_here("'}'")),
                            Tok::Dot => {
                                self.advance();
                            }
                            _ => self.parse_template_triples(
                                &mut quads,
                                Some(graph.clone()),
                                allow_vars,
                            )?,
                        }
                    }
                }
                _ => self.parse_template_triples(&mut quads, None, allow_vars)?,
            }
        }
    }

    fn parse_template_triples(
        &mut self,
        quads: &mut Vec<QuadTemplate<'a>>,
        graph: Option<TermRef<'a>>,
        allow_vars: bool,
    ) -> ParseResult<()> {
        let subject = self.parse_term()?;
        loop {
            let predicate = if self.eat_word("a") {
                TermRef::Iri(IriRef::Iri(RDF_TYPE))
            } else {
                self.parse_term()?
            };
            loop {
                let object = self.parse_term()?;
                if !allow_vars
                    && (subject.is_var() || predicate.is_var() || object.is_var())
                {
                    return Err(ParseError::Unsupported(
                        "variables are not allowed in ground data".to_string(),
                    ));
                }
                quads.push(QuadTemplate {
                    subject: subject.clone(),
                    predicate: predicate.clone(),
                    object,
                    graph: graph.clone(),
                });
                if !self.eat(Tok::Comma) {
                    break;
                }
            }
            if !self.eat(Tok::Semicolon) {
                break;
            }
            if matches!(self.peek(), Tok::Dot | Tok::RBrace) {
                break;
            }
        }
        self.eat(Tok::Dot);
        Ok(())
    }

    // ---- token helpers ---------------------------------------------------

    fn peek(&self) -> Tok<'a> {
        self.tokens[self.pos].tok
    }

    fn peek_ahead(&self, n: usize) -> Tok<'a> {
        self.tokens
            .get(self.pos + n)
            .map(|t| t.tok)
            .unwrap_or(Tok::Eof)
    }

    fn peek_pos(&self) -> usize {
        self.tokens[self.pos].pos
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn at(&self, tok: Tok<'a>) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: Tok<'a>) -> bool {
        if self.at(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok<'a>, expected: &str) -> ParseResult<()> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error_here(expected))
        }
    }

    fn at_word(&self, word: &str) -> bool {
        matches!(self.peek(), Tok::Word(w) if w.eq_ignore_ascii_case(word))
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.at_word(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, word: &str) -> ParseResult<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(self.error_here(&format!("'{}'", word)))
        }
    }

    fn expect_var(&mut self) -> ParseResult<&'a str> {
        match self.peek() {
            Tok::Var(v) => {
                self.advance();
                Ok(v)
            }
            _ => Err(self.error_here("a variable")),
        }
    }

    fn expect_iri_text(&mut self) -> ParseResult<&'a str> {
        match self.peek() {
            Tok::Iri(iri) => {
                self.advance();
                Ok(iri)
            }
            _ => Err(self.error_here("an IRI")),
        }
    }

    fn expect_iri_ref(&mut self) -> ParseResult<IriRef<'a>> {
        match self.peek() {
            Tok::Iri(iri) => {
                self.advance();
                Ok(IriRef::Iri(iri))
            }
            Tok::PName { prefix, local } => {
                self.check_prefix(prefix)?;
                self.advance();
                Ok(IriRef::Prefixed { prefix, local })
            }
            _ => Err(self.error_here("an IRI or prefixed name")),
        }
    }

    fn expect_usize(&mut self) -> ParseResult<usize> {
        match self.peek() {
            Tok::Integer(text) => {
                let value = text.parse::<usize>().map_err(|_| {
                    ParseError::bad_number(self.src, self.peek_pos(), text)
                })?;
                self.advance();
                Ok(value)
            }
            _ => Err(self.error_here("a non-negative integer")),
        }
    }

    fn check_prefix(&self, prefix: &str) -> ParseResult<()> {
        if self.prefixes.iter().any(|(p, _)| *p == prefix) {
            Ok(())
        } else {
            let (line, column) = position(self.src, self.peek_pos());
            Err(ParseError::UnknownPrefix {
                name: prefix.to_string(),
                line,
                column,
            })
        }
    }

    fn error_here(&self, expected: &str) -> ParseError {
        ParseError::unexpected(
            self.src,
            self.peek_pos(),
            &describe(self.peek()),
            expected,
        )
    }
}

/// DELETE WHERE reuses the pattern as its own template; only simple
/// predicates are allowed there.
fn patterns_as_templates<'a>(group: &GroupPattern<'a>) -> ParseResult<Vec<QuadTemplate<'a>>> {
    let mut templates = Vec::new();
    for pattern in &group.patterns {
        let PropertyPath::Simple(predicate) = &pattern.path else {
            return Err(ParseError::Unsupported(
                "property paths are not allowed in DELETE WHERE".to_string(),
            ));
        };
        templates.push(QuadTemplate {
            subject: pattern.subject.clone(),
            predicate: predicate.clone(),
            object: pattern.object.clone(),
            graph: None,
        });
    }
    for graph in &group.graphs {
        for pattern in &graph.group.patterns {
            let PropertyPath::Simple(predicate) = &pattern.path else {
                return Err(ParseError::Unsupported(
                    "property paths are not allowed in DELETE WHERE".to_string(),
                ));
            };
            templates.push(QuadTemplate {
                subject: pattern.subject.clone(),
                predicate: predicate.clone(),
                object: pattern.object.clone(),
                graph: Some(graph.graph.clone()),
            });
        }
    }
    Ok(templates)
}

fn aggregate_func(word: &str) -> Option<AggFunc> {
    match word.to_ascii_uppercase().as_str() {
        "COUNT" => Some(AggFunc::Count),
        "SUM" => Some(AggFunc::Sum),
        "AVG" => Some(AggFunc::Avg),
        "MIN" => Some(AggFunc::Min),
        "MAX" => Some(AggFunc::Max),
        _ => None,
    }
}

/// Uppercase word that is neither a builtin nor a known aggregate: the
/// author probably meant an aggregate we do not know.
fn looks_like_aggregate(word: &str) -> bool {
    word.chars().all(|c| c.is_ascii_uppercase()) && builtin_func(word).is_none()
}

fn builtin_func(word: &str) -> Option<Func> {
    match word.to_ascii_uppercase().as_str() {
        "STR" => Some(Func::Str),
        "LANG" => Some(Func::Lang),
        "LANGMATCHES" => Some(Func::LangMatches),
        "DATATYPE" => Some(Func::Datatype),
        "BOUND" => Some(Func::Bound),
        "ISIRI" | "ISURI" => Some(Func::IsIri),
        "ISLITERAL" => Some(Func::IsLiteral),
        "ISBLANK" => Some(Func::IsBlank),
        "ISNUMERIC" => Some(Func::IsNumeric),
        "CONCAT" => Some(Func::Concat),
        "STRLEN" => Some(Func::StrLen),
        "SUBSTR" => Some(Func::SubStr),
        "UCASE" => Some(Func::UCase),
        "LCASE" => Some(Func::LCase),
        "CONTAINS" => Some(Func::Contains),
        "STRSTARTS" => Some(Func::StrStarts),
        "STRENDS" => Some(Func::StrEnds),
        "REPLACE" => Some(Func::Replace),
        "REGEX" => Some(Func::Regex),
        "IF" => Some(Func::If),
        "COALESCE" => Some(Func::Coalesce),
        _ => None,
    }
}

fn describe(tok: Tok<'_>) -> String {
    match tok {
        Tok::Word(w) => w.to_string(),
        Tok::Var(v) => format!("?{}", v),
        Tok::Iri(iri) => format!("<{}>", iri),
        Tok::PName { prefix, local } => format!("{}:{}", prefix, local),
        Tok::String(s) => format!("\"{}\"", s),
        Tok::LangTag(l) => format!("@{}", l),
        Tok::Integer(n) | Tok::Decimal(n) => n.to_string(),
        Tok::Blank(b) => format!("_:{}", b),
        Tok::Eof => "end of input".to_string(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(src: &str) -> SelectQuery<'_> {
        match parse_query(src).unwrap().form {
            QueryForm::Select(s) => s,
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_select() {
        let q = select("SELECT ?s ?o WHERE { ?s <http://p> ?o . }");
        assert_eq!(q.items.len(), 2);
        assert_eq!(q.where_clause.patterns.len(), 1);
        let p = &q.where_clause.patterns[0];
        assert_eq!(p.subject, TermRef::Var("s"));
        assert!(p.path.is_simple());
    }

    #[test]
    fn test_prefixes_and_pnames() {
        let q = select(
            "PREFIX foaf: <http://xmlns.com/foaf/0.1/>\n\
             SELECT ?n WHERE { ?x foaf:name ?n }",
        );
        assert_eq!(q.where_clause.patterns.len(), 1);
        match &q.where_clause.patterns[0].path {
            PropertyPath::Simple(TermRef::Iri(IriRef::Prefixed { prefix, local })) => {
                assert_eq!(*prefix, "foaf");
                assert_eq!(*local, "name");
            }
            other => panic!("unexpected path {:?}", other),
        }
    }

    #[test]
    fn test_unknown_prefix_rejected() {
        let err = parse_query("SELECT ?n WHERE { ?x foaf:name ?n }").unwrap_err();
        assert!(matches!(err, ParseError::UnknownPrefix { .. }));
    }

    #[test]
    fn test_optional_union_minus() {
        let q = select(
            "SELECT ?a WHERE { ?a <p> <b> OPTIONAL { ?a <q> ?c } \
             { ?a <r> ?d } UNION { ?a <s> ?d } MINUS { ?a <t> <u> } }",
        );
        assert_eq!(q.where_clause.optionals.len(), 1);
        assert_eq!(q.where_clause.unions.len(), 1);
        assert_eq!(q.where_clause.minuses.len(), 1);
    }

    #[test]
    fn test_filter_and_bind() {
        let q = select(
            "SELECT ?a WHERE { ?a <p> ?v FILTER(?v > 3) BIND(?v * 2 AS ?w) }",
        );
        assert_eq!(q.where_clause.filters.len(), 1);
        assert_eq!(q.where_clause.binds.len(), 1);
        assert_eq!(q.where_clause.binds[0].var, "w");
    }

    #[test]
    fn test_filter_exists() {
        let q = select("SELECT ?a WHERE { ?a <p> ?v FILTER NOT EXISTS { ?a <q> ?v } }");
        assert!(matches!(
            q.where_clause.filters[0],
            Expr::Exists { negated: true, .. }
        ));
    }

    #[test]
    fn test_aggregates() {
        let q = select(
            "SELECT (COUNT(*) AS ?c) (SUM(?v) AS ?total) WHERE { ?a <p> ?v } GROUP BY ?a HAVING(?total > 10)",
        );
        assert_eq!(q.items.len(), 2);
        assert!(matches!(
            q.items[0],
            SelectItem::Agg {
                agg: Aggregate {
                    func: AggFunc::Count,
                    expr: None,
                    ..
                },
                alias: "c"
            }
        ));
        assert_eq!(q.group_by, vec!["a"]);
        assert!(q.having.is_some());
    }

    #[test]
    fn test_unknown_aggregate() {
        let err =
            parse_query("SELECT (MEDIAN(?v) AS ?m) WHERE { ?a <p> ?v }").unwrap_err();
        assert!(matches!(err, ParseError::UnknownAggregate { .. }));
    }

    #[test]
    fn test_solution_modifiers() {
        let q = select(
            "SELECT ?v WHERE { ?a <p> ?v } ORDER BY DESC(?v) LIMIT 10 OFFSET 5",
        );
        assert_eq!(q.order_by.len(), 1);
        assert!(q.order_by[0].descending);
        assert_eq!(q.limit, Some(10));
        assert_eq!(q.offset, Some(5));
    }

    #[test]
    fn test_graph_clauses() {
        let q = select("SELECT ?g ?o WHERE { GRAPH ?g { <a> <p> ?o } }");
        assert_eq!(q.where_clause.graphs.len(), 1);
        assert_eq!(q.where_clause.graphs[0].graph, TermRef::Var("g"));
    }

    #[test]
    fn test_subselect() {
        let q = select(
            "SELECT ?a WHERE { ?a <p> ?v { SELECT ?a WHERE { ?a <q> ?w } LIMIT 2 } }",
        );
        assert_eq!(q.where_clause.subqueries.len(), 1);
        assert_eq!(q.where_clause.subqueries[0].limit, Some(2));
    }

    #[test]
    fn test_property_paths() {
        let q = select("SELECT ?a WHERE { ?a ^<p>/<q>* ?b . ?a <r>|<s> ?c }");
        match &q.where_clause.patterns[0].path {
            PropertyPath::Sequence(steps) => {
                assert!(matches!(steps[0], PropertyPath::Inverse(_)));
                assert!(matches!(steps[1], PropertyPath::ZeroOrMore(_)));
            }
            other => panic!("unexpected path {:?}", other),
        }
        assert!(matches!(
            q.where_clause.patterns[1].path,
            PropertyPath::Alternative(_)
        ));
    }

    #[test]
    fn test_values() {
        let q = select("SELECT ?v WHERE { ?a <p> ?v VALUES ?a { <x> <y> } }");
        let values = q.where_clause.values.unwrap();
        assert_eq!(values.vars, vec!["a"]);
        assert_eq!(values.rows.len(), 2);
    }

    #[test]
    fn test_ask_and_construct() {
        assert!(matches!(
            parse_query("ASK { <a> <b> <c> }").unwrap().form,
            QueryForm::Ask { .. }
        ));
        match parse_query("CONSTRUCT { ?s <p2> ?o } WHERE { ?s <p> ?o }")
            .unwrap()
            .form
        {
            QueryForm::Construct { template, .. } => assert_eq!(template.len(), 1),
            other => panic!("expected CONSTRUCT, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_delete_data() {
        let ops = match parse_query(
            "INSERT DATA { <a> <b> <c> . GRAPH <g> { <a> <b> <d> } }",
        )
        .unwrap()
        .form
        {
            QueryForm::Update(ops) => ops,
            other => panic!("expected update, got {:?}", other),
        };
        match &ops[0] {
            UpdateOp::InsertData(quads) => {
                assert_eq!(quads.len(), 2);
                assert!(quads[0].graph.is_none());
                assert!(quads[1].graph.is_some());
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_ground_data_rejects_vars() {
        assert!(matches!(
            parse_query("INSERT DATA { ?s <b> <c> }").unwrap_err(),
            ParseError::Unsupported(_)
        ));
    }

    #[test]
    fn test_clear_and_drop() {
        let ops = match parse_query("CLEAR GRAPH <g> ; DROP ALL").unwrap().form {
            QueryForm::Update(ops) => ops,
            other => panic!("expected update, got {:?}", other),
        };
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], UpdateOp::Clear(GraphTarget::Graph(_))));
        assert!(matches!(ops[1], UpdateOp::Drop(GraphTarget::All)));
    }

    #[test]
    fn test_delete_insert_where() {
        let ops = match parse_query(
            "DELETE { ?s <old> ?o } INSERT { ?s <new> ?o } WHERE { ?s <old> ?o }",
        )
        .unwrap()
        .form
        {
            QueryForm::Update(ops) => ops,
            other => panic!("expected update, got {:?}", other),
        };
        match &ops[0] {
            UpdateOp::Modify {
                delete, insert, ..
            } => {
                assert_eq!(delete.len(), 1);
                assert_eq!(insert.len(), 1);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_too_many_patterns() {
        let mut src = String::from("SELECT ?a WHERE { ");
        for i in 0..=MAX_PATTERNS {
            src.push_str(&format!("?a <p{}> ?o{} . ", i, i));
        }
        src.push('}');
        assert!(matches!(
            parse_query(&src).unwrap_err(),
            ParseError::Capacity {
                what: "triple patterns",
                ..
            }
        ));
    }

    #[test]
    fn test_unclosed_group() {
        assert!(matches!(
            parse_query("SELECT ?a WHERE { ?a <p> ?b").unwrap_err(),
            ParseError::UnclosedGroup { .. }
        ));
    }

    #[test]
    fn test_error_position() {
        let err = parse_query("SELECT ?a WHERE { ?a <p> }").unwrap_err();
        match err {
            ParseError::UnexpectedToken { line, column, .. } => {
                assert_eq!(line, 1);
                assert!(column > 20);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_negative_numbers_in_data() {
        let ops = match parse_query("INSERT DATA { <a> <b> -5 }").unwrap().form {
            QueryForm::Update(ops) => ops,
            other => panic!("expected update, got {:?}", other),
        };
        match &ops[0] {
            UpdateOp::InsertData(quads) => {
                assert_eq!(quads[0].object, TermRef::Integer("-5"));
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_describe() {
        match parse_query("DESCRIBE <http://example.org/a>").unwrap().form {
            QueryForm::Describe { targets, star, .. } => {
                assert_eq!(targets.len(), 1);
                assert!(!star);
            }
            other => panic!("expected DESCRIBE, got {:?}", other),
        }
    }
}

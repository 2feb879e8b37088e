//! Abstract syntax tree for SPARQL queries and updates.
//!
//! The AST owns no term text: every IRI, literal, variable and prefix is a
//! `&str` window into the caller's query source, which must outlive the
//! tree. Prefixed names stay unexpanded until execution.
//!
//! Group patterns hold bounded collections; the parser refuses input that
//! overflows a capacity rather than truncating it.

/// Triple patterns per group.
pub const MAX_PATTERNS: usize = 32;
/// Triple patterns per nested subselect.
pub const MAX_SUB_PATTERNS: usize = 16;
/// Filters per group.
pub const MAX_FILTERS: usize = 16;
/// BIND clauses per group.
pub const MAX_BINDS: usize = 8;
/// MINUS groups per group.
pub const MAX_MINUS: usize = 8;
/// EXISTS / NOT EXISTS filters per group.
pub const MAX_EXISTS: usize = 4;
/// GRAPH clauses per group.
pub const MAX_GRAPHS: usize = 4;
/// Subqueries per group.
pub const MAX_SUBQUERIES: usize = 2;
/// OPTIONAL groups per group.
pub const MAX_OPTIONALS: usize = 8;
/// UNION clauses per group.
pub const MAX_UNIONS: usize = 8;

/// An IRI reference: written out in full or as a prefixed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IriRef<'a> {
    /// `<...>` contents, possibly relative to BASE
    Iri(&'a str),
    /// `prefix:local`
    Prefixed { prefix: &'a str, local: &'a str },
}

/// One term position in a pattern, expression or template.
#[derive(Debug, Clone, PartialEq)]
pub enum TermRef<'a> {
    Iri(IriRef<'a>),
    /// Literal with raw (still escaped) lexical value
    Literal {
        value: &'a str,
        lang: Option<&'a str>,
        datatype: Option<IriRef<'a>>,
    },
    /// Raw integer token
    Integer(&'a str),
    /// Raw decimal/double token
    Double(&'a str),
    Boolean(bool),
    Blank(&'a str),
    /// Variable, without its `?`/`$` sigil
    Var(&'a str),
}

impl<'a> TermRef<'a> {
    pub fn as_var(&self) -> Option<&'a str> {
        match self {
            TermRef::Var(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, TermRef::Var(_))
    }
}

/// A property path over IRI steps.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyPath<'a> {
    /// A plain predicate: IRI, prefixed name or variable
    Simple(TermRef<'a>),
    /// `^p`
    Inverse(Box<PropertyPath<'a>>),
    /// `p*`
    ZeroOrMore(Box<PropertyPath<'a>>),
    /// `p+`
    OneOrMore(Box<PropertyPath<'a>>),
    /// `p?`
    ZeroOrOne(Box<PropertyPath<'a>>),
    /// `p1/p2/...`
    Sequence(Vec<PropertyPath<'a>>),
    /// `p1|p2|...`
    Alternative(Vec<PropertyPath<'a>>),
}

impl PropertyPath<'_> {
    /// Whether this is a plain predicate with no path operators.
    pub fn is_simple(&self) -> bool {
        matches!(self, PropertyPath::Simple(_))
    }
}

/// A triple pattern inside a group.
#[derive(Debug, Clone, PartialEq)]
pub struct TriplePattern<'a> {
    pub subject: TermRef<'a>,
    pub path: PropertyPath<'a>,
    pub object: TermRef<'a>,
}

/// `BIND(expr AS ?var)`
#[derive(Debug, Clone, PartialEq)]
pub struct Bind<'a> {
    pub expr: Expr<'a>,
    pub var: &'a str,
}

/// Inline data block: `VALUES ?v { ... }` or `VALUES (?a ?b) { (...) }`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuesClause<'a> {
    pub vars: Vec<&'a str>,
    /// One entry per row; `None` is UNDEF.
    pub rows: Vec<Vec<Option<TermRef<'a>>>>,
}

/// `GRAPH <iri> { ... }` or `GRAPH ?g { ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct GraphClause<'a> {
    pub graph: TermRef<'a>,
    pub group: Box<GroupPattern<'a>>,
}

/// A `{ left } UNION { right }` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionClause<'a> {
    pub left: Box<GroupPattern<'a>>,
    pub right: Box<GroupPattern<'a>>,
}

/// One `{ ... }` group and everything it contains.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupPattern<'a> {
    pub patterns: Vec<TriplePattern<'a>>,
    pub filters: Vec<Expr<'a>>,
    pub binds: Vec<Bind<'a>>,
    pub optionals: Vec<Box<GroupPattern<'a>>>,
    pub unions: Vec<UnionClause<'a>>,
    pub minuses: Vec<Box<GroupPattern<'a>>>,
    pub graphs: Vec<GraphClause<'a>>,
    pub subqueries: Vec<Box<SelectQuery<'a>>>,
    pub values: Option<ValuesClause<'a>>,
}

impl GroupPattern<'_> {
    /// True when nothing at all was written between the braces.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
            && self.filters.is_empty()
            && self.binds.is_empty()
            && self.optionals.is_empty()
            && self.unions.is_empty()
            && self.minuses.is_empty()
            && self.graphs.is_empty()
            && self.subqueries.is_empty()
            && self.values.is_none()
    }
}

/// Expression operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

/// Built-in call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Str,
    Lang,
    LangMatches,
    Datatype,
    Bound,
    IsIri,
    IsLiteral,
    IsBlank,
    IsNumeric,
    Concat,
    StrLen,
    SubStr,
    UCase,
    LCase,
    Contains,
    StrStarts,
    StrEnds,
    Replace,
    Regex,
    If,
    Coalesce,
}

/// A SPARQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr<'a> {
    Term(TermRef<'a>),
    Binary {
        op: BinOp,
        lhs: Box<Expr<'a>>,
        rhs: Box<Expr<'a>>,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr<'a>>,
    },
    Call {
        func: Func,
        args: Vec<Expr<'a>>,
    },
    /// `FILTER [NOT] EXISTS { ... }`
    Exists {
        group: Box<GroupPattern<'a>>,
        negated: bool,
    },
    In {
        expr: Box<Expr<'a>>,
        list: Vec<Expr<'a>>,
        negated: bool,
    },
    /// `xsd:integer(expr)` style datatype casts
    Cast {
        datatype: IriRef<'a>,
        expr: Box<Expr<'a>>,
    },
}

impl<'a> Expr<'a> {
    /// Collect the variables this expression mentions.
    pub fn variables(&self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Term(TermRef::Var(v)) => {
                if !out.contains(v) {
                    out.push(v);
                }
            }
            Expr::Term(_) => {}
            Expr::Binary { lhs, rhs, .. } => {
                lhs.variables(out);
                rhs.variables(out);
            }
            Expr::Unary { expr, .. } => expr.variables(out),
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.variables(out);
                }
            }
            // EXISTS sees the whole binding row; treat as no requirement.
            Expr::Exists { .. } => {}
            Expr::In { expr, list, .. } => {
                expr.variables(out);
                for item in list {
                    item.variables(out);
                }
            }
            Expr::Cast { expr, .. } => expr.variables(out),
        }
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregate call; `expr` is `None` for `COUNT(*)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate<'a> {
    pub func: AggFunc,
    pub distinct: bool,
    pub expr: Option<Expr<'a>>,
}

/// One item of a SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem<'a> {
    Var(&'a str),
    Expr { expr: Expr<'a>, alias: &'a str },
    Agg { agg: Aggregate<'a>, alias: &'a str },
}

impl<'a> SelectItem<'a> {
    /// The output column name of this item.
    pub fn name(&self) -> &'a str {
        match self {
            SelectItem::Var(v) => v,
            SelectItem::Expr { alias, .. } | SelectItem::Agg { alias, .. } => alias,
        }
    }
}

/// ORDER BY key.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey<'a> {
    pub expr: Expr<'a>,
    pub descending: bool,
}

/// A SELECT query or subselect.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery<'a> {
    pub distinct: bool,
    pub reduced: bool,
    /// Empty with `star` set for `SELECT *`.
    pub items: Vec<SelectItem<'a>>,
    pub star: bool,
    pub where_clause: GroupPattern<'a>,
    pub group_by: Vec<&'a str>,
    pub having: Option<Expr<'a>>,
    pub order_by: Vec<OrderKey<'a>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub from: Vec<IriRef<'a>>,
    pub from_named: Vec<IriRef<'a>>,
}

/// Ground or templated quad used by CONSTRUCT and updates.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadTemplate<'a> {
    pub subject: TermRef<'a>,
    pub predicate: TermRef<'a>,
    pub object: TermRef<'a>,
    /// `None` is the default graph.
    pub graph: Option<TermRef<'a>>,
}

/// Target of CLEAR / DROP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphTarget<'a> {
    Default,
    Named,
    All,
    Graph(IriRef<'a>),
}

/// One update operation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp<'a> {
    InsertData(Vec<QuadTemplate<'a>>),
    DeleteData(Vec<QuadTemplate<'a>>),
    Clear(GraphTarget<'a>),
    Drop(GraphTarget<'a>),
    /// `DELETE { .. } INSERT { .. } WHERE { .. }`
    Modify {
        delete: Vec<QuadTemplate<'a>>,
        insert: Vec<QuadTemplate<'a>>,
        where_clause: GroupPattern<'a>,
    },
}

/// The query form.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryForm<'a> {
    Select(SelectQuery<'a>),
    Construct {
        template: Vec<QuadTemplate<'a>>,
        body: SelectQuery<'a>,
    },
    Ask {
        body: SelectQuery<'a>,
    },
    Describe {
        targets: Vec<TermRef<'a>>,
        star: bool,
        body: Option<SelectQuery<'a>>,
    },
    Update(Vec<UpdateOp<'a>>),
}

/// A parsed query plus its prologue. Borrows the query source.
#[derive(Debug, Clone, PartialEq)]
pub struct Query<'a> {
    pub base: Option<&'a str>,
    pub prefixes: Vec<(&'a str, &'a str)>,
    pub form: QueryForm<'a>,
}

impl<'a> Query<'a> {
    /// Look up a declared prefix.
    pub fn prefix(&self, name: &str) -> Option<&'a str> {
        self.prefixes
            .iter()
            .rev()
            .find(|(p, _)| *p == name)
            .map(|(_, iri)| *iri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_variables() {
        let expr = Expr::Binary {
            op: BinOp::Gt,
            lhs: Box::new(Expr::Term(TermRef::Var("age"))),
            rhs: Box::new(Expr::Term(TermRef::Integer("30"))),
        };
        let mut vars = Vec::new();
        expr.variables(&mut vars);
        assert_eq!(vars, vec!["age"]);
    }

    #[test]
    fn test_select_item_names() {
        let item = SelectItem::Var("name");
        assert_eq!(item.name(), "name");

        let item = SelectItem::Agg {
            agg: Aggregate {
                func: AggFunc::Count,
                distinct: false,
                expr: None,
            },
            alias: "c",
        };
        assert_eq!(item.name(), "c");
    }

    #[test]
    fn test_group_is_empty() {
        let group = GroupPattern::default();
        assert!(group.is_empty());
    }
}

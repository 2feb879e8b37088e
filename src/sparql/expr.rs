//! SPARQL expression evaluation.
//!
//! Expressions follow the three-valued semantics: an evaluation that errors
//! yields `None`, which `FILTER` treats as false, `BIND` as leave-unbound,
//! and `COALESCE` skips. Real failures (store corruption, cancellation)
//! still propagate as `Err`.

use super::ast::{BinOp, Expr, Func, Query, TermRef, UnOp};
use super::resolve;
use super::scan::{group_matches, value_of, Bindings, ExecContext, ExecResult, VarKey};
use crate::atom::AtomStore;
use crate::term::{xsd, Value};
use regex::RegexBuilder;

const RDF_LANG_STRING: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString";

/// Where an expression reads its variables from: a live binding table
/// during scans, or a materialized row in the solution pipeline.
pub struct EvalCtx<'q, 's, 'b> {
    pub query: &'q Query<'q>,
    exec: Option<&'b ExecContext<'q, 's>>,
    bindings: Option<&'b Bindings<'q>>,
    row: Option<&'b [(&'q str, Value)]>,
    atoms: Option<&'s AtomStore>,
}

impl<'q, 's, 'b> EvalCtx<'q, 's, 'b> {
    /// Scan-side context: variables come from the binding table and
    /// EXISTS groups can be probed.
    pub fn scan(exec: &'b ExecContext<'q, 's>, bindings: &'b Bindings<'q>) -> Self {
        Self {
            query: exec.query,
            exec: Some(exec),
            bindings: Some(bindings),
            row: None,
            atoms: Some(exec.atoms()),
        }
    }

    /// Pipeline-side context over a materialized row (HAVING, projection,
    /// ORDER BY). EXISTS is not available here.
    pub fn row(query: &'q Query<'q>, row: &'b [(&'q str, Value)]) -> Self {
        Self {
            query,
            exec: None,
            bindings: None,
            row: Some(row),
            atoms: None,
        }
    }

    fn lookup_named(&self, name: &str) -> ExecResult<Option<Value>> {
        if let (Some(bindings), Some(atoms)) = (self.bindings, self.atoms) {
            if let Some(bound) = bindings.get(VarKey::Named(name)) {
                return Ok(Some(value_of(bound, atoms)?));
            }
            return Ok(None);
        }
        if let Some(row) = self.row {
            return Ok(row
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone()));
        }
        Ok(None)
    }

    fn lookup_blank(&self, label: &str) -> ExecResult<Option<Value>> {
        if let (Some(bindings), Some(atoms)) = (self.bindings, self.atoms) {
            if let Some(bound) = bindings.get(VarKey::Blank(label)) {
                return Ok(Some(value_of(bound, atoms)?));
            }
        }
        Ok(None)
    }

    fn is_bound(&self, name: &str) -> bool {
        if let Some(bindings) = self.bindings {
            return bindings.get(VarKey::Named(name)).is_some();
        }
        if let Some(row) = self.row {
            return row.iter().any(|(n, _)| *n == name);
        }
        false
    }
}

/// Evaluate to a value; `None` is the SPARQL "error" outcome.
pub fn eval<'q>(expr: &'q Expr<'q>, ctx: &mut EvalCtx<'q, '_, '_>) -> ExecResult<Option<Value>> {
    match expr {
        Expr::Term(TermRef::Var(name)) => ctx.lookup_named(name),
        Expr::Term(TermRef::Blank(label)) => ctx.lookup_blank(label),
        Expr::Term(term) => Ok(Some(resolve::term_to_value(ctx.query, term)?)),

        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, ctx),

        Expr::Unary { op, expr } => {
            let value = eval(expr, ctx)?;
            Ok(match op {
                UnOp::Not => ebv_opt(value).map(|b| Value::Boolean(!b)),
                UnOp::Neg => match value {
                    Some(Value::Integer(i)) => Some(Value::Integer(-i)),
                    Some(Value::Double(d)) => Some(Value::Double(-d)),
                    _ => None,
                },
            })
        }

        Expr::Call { func, args } => eval_call(*func, args, ctx),

        Expr::Exists { group, negated } => {
            let (Some(exec), Some(bindings)) = (ctx.exec, ctx.bindings) else {
                return Ok(None);
            };
            let matched = group_matches(exec, group, bindings)?;
            Ok(Some(Value::Boolean(matched != *negated)))
        }

        Expr::In {
            expr,
            list,
            negated,
        } => {
            let Some(needle) = eval(expr, ctx)? else {
                return Ok(None);
            };
            let mut saw_error = false;
            let mut found = false;
            for item in list {
                match eval(item, ctx)? {
                    Some(candidate) => {
                        if needle.same_value(&candidate) {
                            found = true;
                            break;
                        }
                    }
                    None => saw_error = true,
                }
            }
            if found {
                Ok(Some(Value::Boolean(!negated)))
            } else if saw_error {
                Ok(None)
            } else {
                Ok(Some(Value::Boolean(*negated)))
            }
        }

        Expr::Cast { datatype, expr } => {
            let Some(value) = eval(expr, ctx)? else {
                return Ok(None);
            };
            let datatype = resolve::expand_iri(ctx.query, datatype)?;
            Ok(cast(&value, &datatype))
        }
    }
}

/// Effective boolean value of an expression; errors collapse to `false`.
pub fn truth<'q>(expr: &'q Expr<'q>, ctx: &mut EvalCtx<'q, '_, '_>) -> ExecResult<bool> {
    Ok(ebv_opt(eval(expr, ctx)?).unwrap_or(false))
}

fn eval_binary<'q>(
    op: BinOp,
    lhs: &'q Expr<'q>,
    rhs: &'q Expr<'q>,
    ctx: &mut EvalCtx<'q, '_, '_>,
) -> ExecResult<Option<Value>> {
    match op {
        // Logical operators keep SPARQL's error-tolerant truth tables.
        BinOp::Or => {
            let l = ebv_opt(eval(lhs, ctx)?);
            if l == Some(true) {
                return Ok(Some(Value::Boolean(true)));
            }
            let r = ebv_opt(eval(rhs, ctx)?);
            Ok(match (l, r) {
                (_, Some(true)) => Some(Value::Boolean(true)),
                (Some(false), Some(false)) => Some(Value::Boolean(false)),
                _ => None,
            })
        }
        BinOp::And => {
            let l = ebv_opt(eval(lhs, ctx)?);
            if l == Some(false) {
                return Ok(Some(Value::Boolean(false)));
            }
            let r = ebv_opt(eval(rhs, ctx)?);
            Ok(match (l, r) {
                (_, Some(false)) => Some(Value::Boolean(false)),
                (Some(true), Some(true)) => Some(Value::Boolean(true)),
                _ => None,
            })
        }
        _ => {
            let Some(l) = eval(lhs, ctx)? else {
                return Ok(None);
            };
            let Some(r) = eval(rhs, ctx)? else {
                return Ok(None);
            };
            Ok(apply_binary(op, &l, &r))
        }
    }
}

fn apply_binary(op: BinOp, l: &Value, r: &Value) -> Option<Value> {
    match op {
        BinOp::Eq => Some(Value::Boolean(l.same_value(r))),
        BinOp::Ne => Some(Value::Boolean(!l.same_value(r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(l, r)?;
            let result = match op {
                BinOp::Lt => ord == std::cmp::Ordering::Less,
                BinOp::Le => ord != std::cmp::Ordering::Greater,
                BinOp::Gt => ord == std::cmp::Ordering::Greater,
                _ => ord != std::cmp::Ordering::Less,
            };
            Some(Value::Boolean(result))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arithmetic(op, l, r),
        BinOp::Or | BinOp::And => None,
    }
}

/// Order two values for `<`/`>` comparisons; `None` is a type error.
fn compare(l: &Value, r: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return a.partial_cmp(&b);
    }
    match (l, r) {
        (Value::Plain(a), Value::Plain(b)) => Some(a.cmp(b)),
        (Value::Lang { value: a, .. }, Value::Lang { value: b, .. }) => Some(a.cmp(b)),
        (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        (Value::Iri(a), Value::Iri(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn arithmetic(op: BinOp, l: &Value, r: &Value) -> Option<Value> {
    if let (Value::Integer(a), Value::Integer(b)) = (l, r) {
        return match op {
            BinOp::Add => a.checked_add(*b).map(Value::Integer),
            BinOp::Sub => a.checked_sub(*b).map(Value::Integer),
            BinOp::Mul => a.checked_mul(*b).map(Value::Integer),
            BinOp::Div => {
                if *b == 0 {
                    None
                } else {
                    Some(Value::Double(*a as f64 / *b as f64))
                }
            }
            _ => None,
        };
    }
    let a = l.as_f64()?;
    let b = r.as_f64()?;
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return None;
            }
            a / b
        }
        _ => return None,
    };
    Some(Value::Double(result))
}

fn eval_call<'q>(
    func: Func,
    args: &'q [Expr<'q>],
    ctx: &mut EvalCtx<'q, '_, '_>,
) -> ExecResult<Option<Value>> {
    // BOUND, IF and COALESCE control their own argument evaluation.
    match func {
        Func::Bound => {
            return Ok(match args.first() {
                Some(Expr::Term(TermRef::Var(name))) => {
                    Some(Value::Boolean(ctx.is_bound(name)))
                }
                _ => None,
            });
        }
        Func::If => {
            let [cond, then_branch, else_branch] = args else {
                return Ok(None);
            };
            return match ebv_opt(eval(cond, ctx)?) {
                Some(true) => eval(then_branch, ctx),
                Some(false) => eval(else_branch, ctx),
                None => Ok(None),
            };
        }
        Func::Coalesce => {
            for arg in args {
                if let Some(value) = eval(arg, ctx)? {
                    return Ok(Some(value));
                }
            }
            return Ok(None);
        }
        _ => {}
    }

    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        match eval(arg, ctx)? {
            Some(value) => values.push(value),
            None => return Ok(None),
        }
    }
    Ok(apply_call(func, &values))
}

fn apply_call(func: Func, values: &[Value]) -> Option<Value> {
    match (func, values) {
        (Func::Str, [v]) => Some(Value::Plain(v.lexical())),
        (Func::Lang, [Value::Lang { lang, .. }]) => Some(Value::Plain(lang.clone())),
        (Func::Lang, [v]) if v.is_literal() => Some(Value::Plain(String::new())),
        (Func::Lang, _) => None,
        (Func::LangMatches, [tag, range]) => {
            let (tag, range) = (tag.lexical(), range.lexical());
            let matched = if range == "*" {
                !tag.is_empty()
            } else {
                let tag = tag.to_ascii_lowercase();
                let range = range.to_ascii_lowercase();
                tag == range || tag.starts_with(&format!("{}-", range))
            };
            Some(Value::Boolean(matched))
        }
        (Func::Datatype, [v]) => match v {
            Value::Lang { .. } => Some(Value::Iri(RDF_LANG_STRING.to_string())),
            Value::Iri(_) | Value::Blank(_) => None,
            other => other.datatype().map(|dt| Value::Iri(dt.to_string())),
        },
        (Func::IsIri, [v]) => Some(Value::Boolean(matches!(v, Value::Iri(_)))),
        (Func::IsLiteral, [v]) => Some(Value::Boolean(v.is_literal())),
        (Func::IsBlank, [v]) => Some(Value::Boolean(matches!(v, Value::Blank(_)))),
        (Func::IsNumeric, [v]) => Some(Value::Boolean(v.is_numeric())),
        (Func::Concat, parts) => {
            let mut out = String::new();
            for part in parts {
                out.push_str(&string_arg(part)?);
            }
            Some(Value::Plain(out))
        }
        (Func::StrLen, [v]) => Some(Value::Integer(string_arg(v)?.chars().count() as i64)),
        (Func::SubStr, [v, start]) => {
            let s = string_arg(v)?;
            let start = usize::try_from(int_arg(start)?.max(1) - 1).ok()?;
            Some(Value::Plain(s.chars().skip(start).collect()))
        }
        (Func::SubStr, [v, start, len]) => {
            let s = string_arg(v)?;
            let start = usize::try_from(int_arg(start)?.max(1) - 1).ok()?;
            let len = usize::try_from(int_arg(len)?.max(0)).ok()?;
            Some(Value::Plain(s.chars().skip(start).take(len).collect()))
        }
        (Func::UCase, [v]) => Some(Value::Plain(string_arg(v)?.to_uppercase())),
        (Func::LCase, [v]) => Some(Value::Plain(string_arg(v)?.to_lowercase())),
        (Func::Contains, [h, n]) => {
            Some(Value::Boolean(string_arg(h)?.contains(&string_arg(n)?)))
        }
        (Func::StrStarts, [h, n]) => {
            Some(Value::Boolean(string_arg(h)?.starts_with(&string_arg(n)?)))
        }
        (Func::StrEnds, [h, n]) => {
            Some(Value::Boolean(string_arg(h)?.ends_with(&string_arg(n)?)))
        }
        (Func::Replace, [v, pattern, replacement]) => {
            regex_replace(v, pattern, replacement, None)
        }
        (Func::Replace, [v, pattern, replacement, flags]) => {
            regex_replace(v, pattern, replacement, Some(flags))
        }
        (Func::Regex, [v, pattern]) => regex_match(v, pattern, None),
        (Func::Regex, [v, pattern, flags]) => regex_match(v, pattern, Some(flags)),
        _ => None,
    }
}

fn regex_match(v: &Value, pattern: &Value, flags: Option<&Value>) -> Option<Value> {
    let regex = build_regex(pattern, flags)?;
    Some(Value::Boolean(regex.is_match(&string_arg(v)?)))
}

fn regex_replace(
    v: &Value,
    pattern: &Value,
    replacement: &Value,
    flags: Option<&Value>,
) -> Option<Value> {
    let regex = build_regex(pattern, flags)?;
    let out = regex
        .replace_all(&string_arg(v)?, string_arg(replacement)?.as_str())
        .into_owned();
    Some(Value::Plain(out))
}

fn build_regex(pattern: &Value, flags: Option<&Value>) -> Option<regex::Regex> {
    let mut builder = RegexBuilder::new(&string_arg(pattern)?);
    if let Some(flags) = flags {
        for flag in string_arg(flags)?.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                _ => return None,
            }
        }
    }
    builder.build().ok()
}

/// String-typed argument (plain or language-tagged literal).
fn string_arg(v: &Value) -> Option<String> {
    match v {
        Value::Plain(s) => Some(s.clone()),
        Value::Lang { value, .. } => Some(value.clone()),
        _ => None,
    }
}

fn int_arg(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(*i),
        _ => None,
    }
}

fn cast(value: &Value, datatype: &str) -> Option<Value> {
    let lexical = value.lexical();
    match datatype {
        xsd::INTEGER => match value {
            Value::Double(d) => Some(Value::Integer(*d as i64)),
            Value::Boolean(b) => Some(Value::Integer(i64::from(*b))),
            _ => lexical.trim().parse::<i64>().ok().map(Value::Integer),
        },
        xsd::DOUBLE | xsd::DECIMAL => match value {
            Value::Boolean(b) => Some(Value::Double(if *b { 1.0 } else { 0.0 })),
            _ => lexical.trim().parse::<f64>().ok().map(Value::Double),
        },
        xsd::BOOLEAN => match lexical.trim() {
            "true" | "1" => Some(Value::Boolean(true)),
            "false" | "0" => Some(Value::Boolean(false)),
            _ => None,
        },
        xsd::STRING => Some(Value::Plain(lexical)),
        xsd::DATE_TIME => Some(Value::DateTime(lexical)),
        _ => None,
    }
}

/// Effective boolean value per SPARQL: booleans as-is, numerics non-zero,
/// strings non-empty; anything else is a type error.
fn ebv_opt(value: Option<Value>) -> Option<bool> {
    match value? {
        Value::Boolean(b) => Some(b),
        Value::Integer(i) => Some(i != 0),
        Value::Double(d) => Some(d != 0.0 && !d.is_nan()),
        Value::Plain(s) => Some(!s.is_empty()),
        Value::Lang { value, .. } => Some(!value.is_empty()),
        Value::Typed { value, datatype } if datatype == xsd::STRING => Some(!value.is_empty()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparql::parser::parse_query;

    fn eval_str(expr_src: &str, row: &[(&str, Value)]) -> Option<Value> {
        let src = format!("SELECT ?x WHERE {{ ?x <p> ?y FILTER({}) }}", expr_src);
        let query = parse_query(&src).unwrap();
        let super::super::ast::QueryForm::Select(select) = &query.form else {
            panic!("not a select");
        };
        let filter = &select.where_clause.filters[0];
        let row: Vec<(&str, Value)> = row.to_vec();
        let mut ctx = EvalCtx::row(&query, &row);
        eval(filter, &mut ctx).unwrap()
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(eval_str("2 + 3 * 4", &[]), Some(Value::Integer(14)));
        assert_eq!(eval_str("10 / 4", &[]), Some(Value::Double(2.5)));
        assert_eq!(eval_str("3 < 4", &[]), Some(Value::Boolean(true)));
        assert_eq!(eval_str("3 >= 4", &[]), Some(Value::Boolean(false)));
    }

    #[test]
    fn test_type_error_is_none() {
        assert_eq!(eval_str("<http://x> + 1", &[]), None);
        assert_eq!(eval_str("1 / 0", &[]), None);
    }

    #[test]
    fn test_logical_error_tolerance() {
        // An errored operand is absorbed when the other side decides.
        assert_eq!(
            eval_str("true || (1/0 > 0)", &[]),
            Some(Value::Boolean(true))
        );
        assert_eq!(
            eval_str("false && (1/0 > 0)", &[]),
            Some(Value::Boolean(false))
        );
        assert_eq!(eval_str("true && (1/0 > 0)", &[]), None);
    }

    #[test]
    fn test_variables_from_row() {
        let row = vec![("y", Value::Integer(30))];
        assert_eq!(eval_str("?y > 20", &row), Some(Value::Boolean(true)));
        assert_eq!(eval_str("?missing > 20", &row), None);
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(
            eval_str("CONCAT(\"a\", \"b\")", &[]),
            Some(Value::Plain("ab".to_string()))
        );
        assert_eq!(eval_str("STRLEN(\"abc\")", &[]), Some(Value::Integer(3)));
        assert_eq!(
            eval_str("SUBSTR(\"hello\", 2, 3)", &[]),
            Some(Value::Plain("ell".to_string()))
        );
        assert_eq!(
            eval_str("UCASE(\"ab\")", &[]),
            Some(Value::Plain("AB".to_string()))
        );
        assert_eq!(
            eval_str("CONTAINS(\"hello\", \"ell\")", &[]),
            Some(Value::Boolean(true))
        );
    }

    #[test]
    fn test_regex() {
        assert_eq!(
            eval_str("REGEX(\"Hello\", \"^hel\", \"i\")", &[]),
            Some(Value::Boolean(true))
        );
        assert_eq!(
            eval_str("REPLACE(\"aaa\", \"a\", \"b\")", &[]),
            Some(Value::Plain("bbb".to_string()))
        );
    }

    #[test]
    fn test_bound_and_coalesce() {
        let row = vec![("y", Value::Integer(1))];
        assert_eq!(eval_str("BOUND(?y)", &row), Some(Value::Boolean(true)));
        assert_eq!(eval_str("BOUND(?z)", &row), Some(Value::Boolean(false)));
        assert_eq!(
            eval_str("COALESCE(?z, 1/0, 42)", &row),
            Some(Value::Integer(42))
        );
    }

    #[test]
    fn test_if_and_in() {
        assert_eq!(
            eval_str("IF(2 > 1, \"yes\", \"no\")", &[]),
            Some(Value::Plain("yes".to_string()))
        );
        assert_eq!(eval_str("2 IN (1, 2, 3)", &[]), Some(Value::Boolean(true)));
        assert_eq!(
            eval_str("5 NOT IN (1, 2, 3)", &[]),
            Some(Value::Boolean(true))
        );
    }

    #[test]
    fn test_casts() {
        let query = parse_query(
            "PREFIX xsd: <http://www.w3.org/2001/XMLSchema#> \
             SELECT ?x WHERE { ?x <p> ?y FILTER(xsd:integer(\"42\") = 42) }",
        )
        .unwrap();
        let super::super::ast::QueryForm::Select(select) = &query.form else {
            panic!("not a select");
        };
        let row: Vec<(&str, Value)> = Vec::new();
        let mut ctx = EvalCtx::row(&query, &row);
        assert_eq!(
            eval(&select.where_clause.filters[0], &mut ctx).unwrap(),
            Some(Value::Boolean(true))
        );
    }

    #[test]
    fn test_lang_functions() {
        let row = vec![(
            "y",
            Value::Lang {
                value: "chat".to_string(),
                lang: "fr".to_string(),
            },
        )];
        assert_eq!(
            eval_str("LANG(?y)", &row),
            Some(Value::Plain("fr".to_string()))
        );
        assert_eq!(
            eval_str("LANGMATCHES(LANG(?y), \"FR\")", &row),
            Some(Value::Boolean(true))
        );
    }
}

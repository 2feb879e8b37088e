//! Solution pipeline: aggregation, HAVING, projection, DISTINCT, ORDER BY,
//! OFFSET/LIMIT.
//!
//! Rows stream out of the WHERE scan and are materialized here; the stages
//! then apply in the pipeline order. Group keys concatenate the grouped
//! variables' string values with a unit separator; DISTINCT keeps a set of
//! projected-row fingerprints.

use super::ast::{AggFunc, Aggregate, GroupPattern, PropertyPath, SelectItem, SelectQuery};
use super::expr::{self, EvalCtx};
use super::plan;
use super::scan::{value_of, Bindings, ExecContext, ExecResult, GraphSpec, VarKey};
use crate::term::Value;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use std::hash::{Hash, Hasher};

/// A materialized solution row: named variables only.
pub type Row<'q> = Vec<(&'q str, Value)>;

const GROUP_KEY_SEPARATOR: char = '\u{1f}';

/// Run a SELECT (or subselect) to its projected rows.
///
/// Returns the output variable names and one `Option<Value>` cell per name
/// per row (`None` = unbound).
pub fn exec_select_rows<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    select: &'q SelectQuery<'q>,
) -> ExecResult<(Vec<&'q str>, Vec<Vec<Option<Value>>>)> {
    let raw = collect_rows(ctx, &select.where_clause)?;

    let aggregated = select
        .items
        .iter()
        .any(|item| matches!(item, SelectItem::Agg { .. }))
        || !select.group_by.is_empty();

    let full_rows: Vec<Row<'q>> = if aggregated {
        aggregate(ctx, select, raw)?
    } else {
        raw
    };

    // HAVING applies to aggregated rows; without aggregation it is just a
    // late filter.
    let full_rows: Vec<Row<'q>> = match &select.having {
        Some(condition) => {
            let mut kept = Vec::new();
            for row in full_rows {
                if expr::truth(condition, &mut EvalCtx::row(ctx.query, &row))? {
                    kept.push(row);
                }
            }
            kept
        }
        None => full_rows,
    };

    let names = output_names(select);

    // Projection, keeping the full row alongside for ORDER BY keys.
    let mut projected: Vec<(Vec<Option<Value>>, Row<'q>)> = Vec::with_capacity(full_rows.len());
    for row in full_rows {
        let mut cells = Vec::with_capacity(names.len());
        if select.star || aggregated {
            for name in &names {
                cells.push(row.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone()));
            }
        } else {
            for item in &select.items {
                cells.push(project_item(ctx, item, &row)?);
            }
        }
        projected.push((cells, row));
    }

    // DISTINCT / REDUCED share the fingerprint set.
    if select.distinct || select.reduced {
        let mut seen: FxHashSet<u64> = FxHashSet::default();
        projected.retain(|(cells, _)| seen.insert(fingerprint(cells)));
    }

    // ORDER BY with SPARQL ordering; unbound sorts before everything.
    if !select.order_by.is_empty() {
        let mut keyed: Vec<(Vec<Option<Value>>, (Vec<Option<Value>>, Row<'q>))> = Vec::new();
        for (cells, row) in projected {
            let mut keys = Vec::with_capacity(select.order_by.len());
            for key in &select.order_by {
                keys.push(expr::eval(&key.expr, &mut EvalCtx::row(ctx.query, &row))?);
            }
            keyed.push((keys, (cells, row)));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (key, (x, y)) in select.order_by.iter().zip(a.iter().zip(b.iter())) {
                let ord = match (x, y) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(x), Some(y)) => x.cmp_sparql(y),
                };
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        projected = keyed.into_iter().map(|(_, pair)| pair).collect();
    }

    // OFFSET, then LIMIT.
    let offset = select.offset.unwrap_or(0);
    let mut rows: Vec<Vec<Option<Value>>> = projected
        .into_iter()
        .skip(offset)
        .map(|(cells, _)| cells)
        .collect();
    if let Some(limit) = select.limit {
        rows.truncate(limit);
    }

    Ok((names, rows))
}

/// Run the WHERE scan to completion, materializing named variables.
pub fn collect_rows<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    group: &'q GroupPattern<'q>,
) -> ExecResult<Vec<Row<'q>>> {
    let mut scan = plan::build_group_scan(ctx, group, GraphSpec::Default)?;
    let mut bindings = Bindings::new();
    let mut rows = Vec::new();
    let atoms = ctx.atoms();
    while scan.move_next(ctx, &mut bindings)? {
        let mut row: Row<'q> = Vec::new();
        for (key, bound) in bindings.iter() {
            if let VarKey::Named(name) = key {
                if !row.iter().any(|(n, _)| n == name) {
                    row.push((*name, value_of(bound, atoms)?));
                }
            }
        }
        rows.push(row);
    }
    scan.close();
    Ok(rows)
}

/// Whether the WHERE scan produces at least one solution.
pub fn any_solution<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    group: &'q GroupPattern<'q>,
) -> ExecResult<bool> {
    let mut scan = plan::build_group_scan(ctx, group, GraphSpec::Default)?;
    let mut bindings = Bindings::new();
    let matched = scan.move_next(ctx, &mut bindings)?;
    scan.close();
    Ok(matched)
}

/// Output column names in projection order.
fn output_names<'q>(select: &SelectQuery<'q>) -> Vec<&'q str> {
    if select.star {
        let mut names = Vec::new();
        collect_syntactic_vars(&select.where_clause, &mut names);
        names
    } else if select.items.is_empty() {
        Vec::new()
    } else {
        select.items.iter().map(|item| item.name()).collect()
    }
}

/// Named variables in syntactic order, for deterministic `SELECT *`.
fn collect_syntactic_vars<'q>(group: &GroupPattern<'q>, out: &mut Vec<&'q str>) {
    let mut push = |name: &'q str| {
        if !out.contains(&name) {
            out.push(name);
        }
    };
    for pattern in &group.patterns {
        if let Some(v) = pattern.subject.as_var() {
            push(v);
        }
        if let PropertyPath::Simple(term) = &pattern.path {
            if let Some(v) = term.as_var() {
                push(v);
            }
        }
        if let Some(v) = pattern.object.as_var() {
            push(v);
        }
    }
    drop(push);
    for bind in &group.binds {
        if !out.contains(&bind.var) {
            out.push(bind.var);
        }
    }
    if let Some(values) = &group.values {
        for var in &values.vars {
            if !out.contains(var) {
                out.push(*var);
            }
        }
    }
    for clause in &group.graphs {
        if let Some(v) = clause.graph.as_var() {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        collect_syntactic_vars(&clause.group, out);
    }
    for union in &group.unions {
        collect_syntactic_vars(&union.left, out);
        collect_syntactic_vars(&union.right, out);
    }
    for optional in &group.optionals {
        collect_syntactic_vars(optional, out);
    }
    for subquery in &group.subqueries {
        if subquery.star {
            collect_syntactic_vars(&subquery.where_clause, out);
        } else {
            for item in &subquery.items {
                if !out.contains(&item.name()) {
                    out.push(item.name());
                }
            }
        }
    }
}

fn project_item<'q>(
    ctx: &ExecContext<'q, '_>,
    item: &'q SelectItem<'q>,
    row: &Row<'q>,
) -> ExecResult<Option<Value>> {
    Ok(match item {
        SelectItem::Var(name) => row.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone()),
        SelectItem::Expr { expr, .. } => expr::eval(expr, &mut EvalCtx::row(ctx.query, row))?,
        // Aggregates only appear on the aggregated path.
        SelectItem::Agg { .. } => None,
    })
}

// ---- aggregation ---------------------------------------------------------

struct GroupState<'q> {
    representative: Row<'q>,
    rows: Vec<Row<'q>>,
}

/// Group rows and evaluate the aggregate items per group.
fn aggregate<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    select: &'q SelectQuery<'q>,
    raw: Vec<Row<'q>>,
) -> ExecResult<Vec<Row<'q>>> {
    let mut groups: IndexMap<String, GroupState<'q>> = IndexMap::new();
    let no_rows = raw.is_empty();

    for row in raw {
        let mut key = String::new();
        for var in &select.group_by {
            if let Some((_, value)) = row.iter().find(|(n, _)| n == var) {
                key.push_str(&value.to_stored());
            }
            key.push(GROUP_KEY_SEPARATOR);
        }
        groups
            .entry(key)
            .or_insert_with(|| GroupState {
                representative: row.clone(),
                rows: Vec::new(),
            })
            .rows
            .push(row);
    }

    // Aggregates over an empty input without GROUP BY still produce one
    // row: COUNT = 0, SUM = 0, the rest unbound.
    if no_rows && select.group_by.is_empty() {
        let mut row: Row<'q> = Vec::new();
        for item in &select.items {
            if let SelectItem::Agg { agg, alias } = item {
                match agg.func {
                    AggFunc::Count | AggFunc::Sum => row.push((*alias, Value::Integer(0))),
                    _ => {}
                }
            }
        }
        return Ok(vec![row]);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, group) in groups {
        let mut row: Row<'q> = Vec::new();
        for var in &select.group_by {
            if let Some((_, value)) = group.representative.iter().find(|(n, _)| n == var) {
                row.push((*var, value.clone()));
            }
        }
        for item in &select.items {
            match item {
                SelectItem::Var(name) => {
                    if !select.group_by.contains(name) {
                        // Ungrouped plain variable: take it from the first
                        // row of the group.
                        if let Some((_, value)) =
                            group.representative.iter().find(|(n, _)| n == name)
                        {
                            if !row.iter().any(|(n, _)| n == name) {
                                row.push((*name, value.clone()));
                            }
                        }
                    }
                }
                SelectItem::Expr { expr, alias } => {
                    if let Some(value) =
                        expr::eval(expr, &mut EvalCtx::row(ctx.query, &group.representative))?
                    {
                        row.push((*alias, value));
                    }
                }
                SelectItem::Agg { agg, alias } => {
                    if let Some(value) = run_aggregate(ctx, agg, &group.rows)? {
                        row.push((*alias, value));
                    }
                }
            }
        }
        out.push(row);
    }
    Ok(out)
}

fn run_aggregate<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    agg: &'q Aggregate<'q>,
    rows: &[Row<'q>],
) -> ExecResult<Option<Value>> {
    let mut distinct_seen: Option<FxHashSet<String>> = if agg.distinct {
        Some(FxHashSet::default())
    } else {
        None
    };

    let mut count = 0u64;
    let mut int_sum = 0i64;
    let mut float_sum = 0.0f64;
    let mut all_integer = true;
    let mut numeric_count = 0u64;
    let mut min: Option<Value> = None;
    let mut max: Option<Value> = None;

    for row in rows {
        let value = match &agg.expr {
            // COUNT(*) counts rows as they are.
            None => Some(Value::Integer(1)),
            Some(expr) => expr::eval(expr, &mut EvalCtx::row(ctx.query, row))?,
        };
        let Some(value) = value else { continue };

        if let Some(seen) = &mut distinct_seen {
            if !seen.insert(value.to_stored()) {
                continue;
            }
        }

        count += 1;
        if let Some(n) = value.as_f64() {
            numeric_count += 1;
            float_sum += n;
            match value {
                Value::Integer(i) => int_sum = int_sum.saturating_add(i),
                _ => all_integer = false,
            }
        }
        match &min {
            Some(current) if current.cmp_sparql(&value) != std::cmp::Ordering::Greater => {}
            _ => min = Some(value.clone()),
        }
        match &max {
            Some(current) if current.cmp_sparql(&value) != std::cmp::Ordering::Less => {}
            _ => max = Some(value.clone()),
        }
    }

    Ok(match agg.func {
        AggFunc::Count => Some(Value::Integer(count as i64)),
        AggFunc::Sum => {
            if numeric_count == 0 {
                Some(Value::Integer(0))
            } else if all_integer {
                Some(Value::Integer(int_sum))
            } else {
                Some(Value::Double(float_sum))
            }
        }
        AggFunc::Avg => {
            if numeric_count == 0 {
                None
            } else {
                Some(Value::Double(float_sum / numeric_count as f64))
            }
        }
        AggFunc::Min => min,
        AggFunc::Max => max,
    })
}

fn fingerprint(cells: &[Option<Value>]) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    for cell in cells {
        match cell {
            None => 0u8.hash(&mut hasher),
            Some(value) => {
                1u8.hash(&mut hasher);
                value.to_stored().hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

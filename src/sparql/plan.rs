//! Query planning: pattern ordering, filter push-down, path expansion.
//!
//! The planner turns one group pattern into a scan tree. Triple patterns
//! are reordered greedily by estimated cardinality given the variables
//! already bound, refined by the store's predicate histogram; filters
//! attach to the earliest join level that binds all their variables (up to
//! a fixed push-down depth); property-path sequences expand into elementary
//! patterns joined through planner-introduced variables.

use super::ast::{
    Bind, Expr, GraphClause, GroupPattern, PropertyPath, TermRef, UnionClause,
};
use super::resolve;
use super::scan::{
    BindScan, Bound, ClosureKind, ExecContext, ExecError, ExecResult, FilterScan, GraphSpec,
    JoinScan, MinusScan, MultiLevel, MultiScan, OptionalScan, PathScan, PathStep, PatternScan,
    Scan, SubQueryScan, TermSpec, UnionScan, ValuesScan, VarGraphScan, VarKey,
};
use rustc_hash::FxHashSet;
use tracing::debug;

/// Filters may push down to join levels 0..=7; deeper ones evaluate at
/// group level.
const MAX_FILTER_LEVEL: usize = 8;

/// Build the scan tree for one group, scoped to `graph`.
pub fn build_group_scan<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    group: &'q GroupPattern<'q>,
    graph: GraphSpec<'q>,
) -> ExecResult<Scan<'q, 's>> {
    build_group(ctx, group, graph, &FxHashSet::default())
}

fn build_group<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    group: &'q GroupPattern<'q>,
    graph: GraphSpec<'q>,
    outer: &FxHashSet<VarKey<'q>>,
) -> ExecResult<Scan<'q, 's>> {
    // VALUES binds first so its rows restrict every later level.
    let values_scan = match &group.values {
        Some(values) => Some(build_values(ctx, values)?),
        None => None,
    };
    let mut bound = outer.clone();
    if let Some(values) = &group.values {
        for var in &values.vars {
            bound.insert(VarKey::Named(*var));
        }
    }

    // Expand property paths into elementary leaves.
    let mut leaves = Vec::new();
    for pattern in &group.patterns {
        let subject = resolve_spec(ctx, &pattern.subject)?;
        let object = resolve_spec(ctx, &pattern.object)?;
        expand_path(ctx, &pattern.path, subject, object, graph, &mut leaves)?;
    }

    // Greedy reorder by estimated cardinality under the current bound set.
    let filter_vars: Vec<Vec<VarKey<'q>>> = group
        .filters
        .iter()
        .map(|f| {
            let mut names = Vec::new();
            f.variables(&mut names);
            names.into_iter().map(VarKey::Named).collect()
        })
        .collect();

    let mut ordered: Vec<Leaf<'q>> = Vec::with_capacity(leaves.len());
    let mut remaining = leaves;
    while !remaining.is_empty() {
        let mut best = 0;
        let mut best_cost = u64::MAX;
        let mut best_helps_filter = false;
        for (i, leaf) in remaining.iter().enumerate() {
            let cost = estimate(ctx, leaf, &bound);
            let helps = leaf_vars(leaf)
                .iter()
                .any(|v| filter_vars.iter().any(|fv| fv.contains(v)));
            let better = cost < best_cost || (cost == best_cost && helps && !best_helps_filter);
            if better {
                best = i;
                best_cost = cost;
                best_helps_filter = helps;
            }
        }
        let leaf = remaining.remove(best);
        for var in leaf_vars(&leaf) {
            bound.insert(var);
        }
        ordered.push(leaf);
    }
    debug!(levels = ordered.len(), "pattern order fixed");

    // Cumulative bound sets per level, for filter/BIND attachment.
    let mut cumulative: Vec<FxHashSet<VarKey<'q>>> = Vec::with_capacity(ordered.len());
    let mut acc = outer.clone();
    if let Some(values) = &group.values {
        for var in &values.vars {
            acc.insert(VarKey::Named(*var));
        }
    }
    for leaf in &ordered {
        for var in leaf_vars(leaf) {
            acc.insert(var);
        }
        cumulative.push(acc.clone());
    }

    let mut levels: Vec<MultiLevel<'q, 's>> = ordered
        .into_iter()
        .map(|leaf| MultiLevel {
            scan: leaf_to_scan(leaf, graph),
            filters: Vec::new(),
            binds: Vec::new(),
        })
        .collect();

    // BINDs attach to the earliest level that binds their inputs; each
    // bind's target then counts as bound for what follows.
    let mut group_binds: Vec<&'q Bind<'q>> = Vec::new();
    for bind in &group.binds {
        let mut vars = Vec::new();
        bind.expr.variables(&mut vars);
        let keys: Vec<VarKey<'q>> = vars.into_iter().map(VarKey::Named).collect();
        match attachment_level(&keys, &cumulative) {
            Some(level) if !levels.is_empty() => {
                let level = level.min(levels.len() - 1);
                levels[level].binds.push(bind);
                for set in cumulative.iter_mut().skip(level) {
                    set.insert(VarKey::Named(bind.var));
                }
            }
            _ => group_binds.push(bind),
        }
    }

    // Filters: pushed to the earliest level with all variables bound, up
    // to the push-down cap; EXISTS filters and the rest wrap the group.
    let mut group_filters: Vec<&'q Expr<'q>> = Vec::new();
    for (filter, keys) in group.filters.iter().zip(filter_vars.iter()) {
        if contains_exists(filter) {
            group_filters.push(filter);
            continue;
        }
        match attachment_level(keys, &cumulative) {
            Some(level) if level < MAX_FILTER_LEVEL && !levels.is_empty() => {
                let level = level.min(levels.len() - 1);
                levels[level].filters.push(filter);
            }
            _ => group_filters.push(filter),
        }
    }

    // Leftover BINDs whose inputs a pattern level never binds evaluate
    // after the joins.
    let mut trailing_binds: Vec<&'q Bind<'q>> = Vec::new();
    if !group_binds.is_empty() {
        if let Some(last) = levels.last_mut() {
            last.binds.extend(group_binds);
        } else {
            trailing_binds = group_binds;
        }
    }

    let mut vars_in_scope = cumulative
        .last()
        .cloned()
        .unwrap_or_else(|| bound.clone());
    let mut scan = Scan::Multi(Box::new(MultiScan::new(levels)));
    if let Some(values) = values_scan {
        scan = Scan::Join(Box::new(JoinScan::new(values, scan)));
    }

    // Conjunctive components join in; optional/minus wrap.
    for subquery in &group.subqueries {
        for item in &subquery.items {
            vars_in_scope.insert(VarKey::Named(item.name()));
        }
        scan = Scan::Join(Box::new(JoinScan::new(
            scan,
            Scan::SubQuery(Box::new(SubQueryScan::new(subquery))),
        )));
    }
    for clause in &group.graphs {
        let inner = build_graph_clause(ctx, clause, &vars_in_scope)?;
        collect_group_vars(&clause.group, &mut vars_in_scope);
        if let Some(var) = clause.graph.as_var() {
            vars_in_scope.insert(VarKey::Named(var));
        }
        scan = Scan::Join(Box::new(JoinScan::new(scan, inner)));
    }
    for UnionClause { left, right } in &group.unions {
        let left_scan = build_group(ctx, left, graph, &vars_in_scope)?;
        let right_scan = build_group(ctx, right, graph, &vars_in_scope)?;
        collect_group_vars(left, &mut vars_in_scope);
        collect_group_vars(right, &mut vars_in_scope);
        scan = Scan::Join(Box::new(JoinScan::new(
            scan,
            Scan::Union(Box::new(UnionScan::new(left_scan, right_scan))),
        )));
    }
    for optional in &group.optionals {
        let inner = build_group(ctx, optional, graph, &vars_in_scope)?;
        collect_group_vars(optional, &mut vars_in_scope);
        scan = Scan::Optional(Box::new(OptionalScan::new(scan, inner)));
    }
    for minus in &group.minuses {
        let mut minus_vars = FxHashSet::default();
        collect_group_vars(minus, &mut minus_vars);
        let shares = minus_vars.iter().any(|v| vars_in_scope.contains(v));
        let inner = build_group(ctx, minus, graph, &vars_in_scope)?;
        scan = Scan::Minus(Box::new(MinusScan::new(scan, inner, shares)));
    }
    if !trailing_binds.is_empty() {
        scan = Scan::Bind(Box::new(BindScan::new(scan, trailing_binds)));
    }
    if !group_filters.is_empty() {
        scan = Scan::Filter(Box::new(FilterScan::new(scan, group_filters)));
    }
    Ok(scan)
}

fn build_graph_clause<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    clause: &'q GraphClause<'q>,
    outer: &FxHashSet<VarKey<'q>>,
) -> ExecResult<Scan<'q, 's>> {
    match &clause.graph {
        TermRef::Var(name) => {
            let key = VarKey::Named(name);
            let inner = build_group(ctx, &clause.group, GraphSpec::Var(key), outer)?;
            Ok(Scan::VarGraph(Box::new(VarGraphScan::new(key, inner))))
        }
        term => {
            let stored = resolve::term_to_stored(ctx.query, term)?.ok_or_else(|| {
                ExecError::Semantic("GRAPH needs an IRI or a variable".to_string())
            })?;
            let id = ctx.atoms().lookup(&stored);
            build_group(ctx, &clause.group, GraphSpec::Named(id), outer)
        }
    }
}

fn build_values<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    values: &'q super::ast::ValuesClause<'q>,
) -> ExecResult<Scan<'q, 's>> {
    let vars: Vec<VarKey<'q>> = values.vars.iter().map(|v| VarKey::Named(*v)).collect();
    let mut rows = Vec::with_capacity(values.rows.len());
    for row in &values.rows {
        let mut out = Vec::with_capacity(row.len());
        for cell in row {
            out.push(match cell {
                None => None,
                Some(term) => {
                    let stored = resolve::term_to_stored(ctx.query, term)?.ok_or_else(|| {
                        ExecError::Semantic("variables are not VALUES terms".to_string())
                    })?;
                    Some(match ctx.atoms().lookup(&stored) {
                        Some(id) => Bound::Atom(id),
                        None => Bound::Value(resolve::term_to_value(ctx.query, term)?),
                    })
                }
            });
        }
        rows.push(out);
    }
    Ok(Scan::Values(Box::new(ValuesScan::new(vars, rows))))
}

// ---- path expansion ------------------------------------------------------

/// One join level before scan construction.
enum Leaf<'q> {
    Triple {
        s: TermSpec<'q>,
        p: TermSpec<'q>,
        o: TermSpec<'q>,
        inverse: bool,
    },
    Closure {
        s: TermSpec<'q>,
        o: TermSpec<'q>,
        steps: Vec<PathStep>,
        kind: ClosureKind,
    },
    Alt {
        s: TermSpec<'q>,
        o: TermSpec<'q>,
        arms: Vec<(TermSpec<'q>, bool)>,
    },
}

fn expand_path<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    path: &'q PropertyPath<'q>,
    s: TermSpec<'q>,
    o: TermSpec<'q>,
    graph: GraphSpec<'q>,
    out: &mut Vec<Leaf<'q>>,
) -> ExecResult<()> {
    match path {
        PropertyPath::Simple(term) => {
            out.push(Leaf::Triple {
                s,
                p: resolve_spec(ctx, term)?,
                o,
                inverse: false,
            });
        }
        PropertyPath::Inverse(inner) => match inner.as_ref() {
            PropertyPath::Simple(term) => {
                out.push(Leaf::Triple {
                    s,
                    p: resolve_spec(ctx, term)?,
                    o,
                    inverse: true,
                });
            }
            other => expand_path(ctx, other, o, s, graph, out)?,
        },
        PropertyPath::Sequence(steps) => {
            let mut current = s;
            for (i, step) in steps.iter().enumerate() {
                let next = if i + 1 == steps.len() {
                    o
                } else {
                    TermSpec::Var(ctx.next_path_var())
                };
                expand_path(ctx, step, current, next, graph, out)?;
                current = next;
            }
        }
        PropertyPath::Alternative(_) => {
            let arms = elementary_steps(ctx, path)?
                .into_iter()
                .map(|step| (TermSpec::Const(step.pred), step.inverse))
                .collect();
            out.push(Leaf::Alt { s, o, arms });
        }
        PropertyPath::ZeroOrMore(inner) => {
            out.push(Leaf::Closure {
                s,
                o,
                steps: elementary_steps(ctx, inner)?,
                kind: ClosureKind::ZeroOrMore,
            });
        }
        PropertyPath::OneOrMore(inner) => {
            out.push(Leaf::Closure {
                s,
                o,
                steps: elementary_steps(ctx, inner)?,
                kind: ClosureKind::OneOrMore,
            });
        }
        PropertyPath::ZeroOrOne(inner) => {
            out.push(Leaf::Closure {
                s,
                o,
                steps: elementary_steps(ctx, inner)?,
                kind: ClosureKind::ZeroOrOne,
            });
        }
    }
    Ok(())
}

/// Flatten a path into elementary (predicate, inverse) steps; closures only
/// iterate over these.
fn elementary_steps<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    path: &PropertyPath<'q>,
) -> ExecResult<Vec<PathStep>> {
    match path {
        PropertyPath::Simple(TermRef::Var(v)) => Err(ExecError::Semantic(format!(
            "variable ?{} is not allowed inside a property path operator",
            v
        ))),
        PropertyPath::Simple(term) => {
            let stored = resolve::term_to_stored(ctx.query, term)?
                .ok_or_else(|| ExecError::Semantic("invalid path predicate".to_string()))?;
            Ok(vec![PathStep {
                pred: ctx.atoms().lookup(&stored),
                inverse: false,
            }])
        }
        PropertyPath::Inverse(inner) => {
            let mut steps = elementary_steps(ctx, inner)?;
            for step in &mut steps {
                step.inverse = !step.inverse;
            }
            Ok(steps)
        }
        PropertyPath::Alternative(arms) => {
            let mut steps = Vec::new();
            for arm in arms {
                steps.extend(elementary_steps(ctx, arm)?);
            }
            Ok(steps)
        }
        PropertyPath::Sequence(_)
        | PropertyPath::ZeroOrMore(_)
        | PropertyPath::OneOrMore(_)
        | PropertyPath::ZeroOrOne(_) => Err(ExecError::Semantic(
            "nested path operators are not supported inside closures".to_string(),
        )),
    }
}

fn leaf_to_scan<'q, 's>(leaf: Leaf<'q>, graph: GraphSpec<'q>) -> Scan<'q, 's> {
    match leaf {
        Leaf::Triple { s, p, o, inverse } => {
            Scan::Pattern(PatternScan::new(s, p, o, graph, inverse))
        }
        Leaf::Closure { s, o, steps, kind } => {
            Scan::Path(Box::new(PathScan::new(s, o, graph, steps, kind)))
        }
        Leaf::Alt { s, o, arms } => {
            let mut scans: Vec<Scan<'q, 's>> = arms
                .into_iter()
                .map(|(p, inverse)| Scan::Pattern(PatternScan::new(s, p, o, graph, inverse)))
                .collect();
            let mut scan = scans.pop().unwrap_or_else(|| {
                Scan::Pattern(PatternScan::new(s, TermSpec::Const(None), o, graph, false))
            });
            while let Some(next) = scans.pop() {
                scan = Scan::Union(Box::new(UnionScan::new(next, scan)));
            }
            scan
        }
    }
}

fn resolve_spec<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    term: &TermRef<'q>,
) -> ExecResult<TermSpec<'q>> {
    Ok(match term {
        TermRef::Var(name) => TermSpec::Var(VarKey::Named(name)),
        TermRef::Blank(label) => TermSpec::Var(VarKey::Blank(label)),
        other => {
            let stored = resolve::term_to_stored(ctx.query, other)?
                .ok_or_else(|| ExecError::Semantic("unexpected variable".to_string()))?;
            TermSpec::Const(ctx.atoms().lookup(&stored))
        }
    })
}

fn leaf_vars<'q>(leaf: &Leaf<'q>) -> Vec<VarKey<'q>> {
    let mut out = Vec::new();
    let mut push = |spec: &TermSpec<'q>| {
        if let TermSpec::Var(key) = spec {
            if !out.contains(key) {
                out.push(*key);
            }
        }
    };
    match leaf {
        Leaf::Triple { s, p, o, .. } => {
            push(s);
            push(p);
            push(o);
        }
        Leaf::Closure { s, o, .. } | Leaf::Alt { s, o, .. } => {
            push(s);
            push(o);
        }
    }
    out
}

/// Cardinality estimate for a leaf given the bound variables: constants and
/// bound variables count as bound positions; the predicate histogram
/// sharpens the middle cases.
fn estimate<'q, 's>(ctx: &ExecContext<'q, 's>, leaf: &Leaf<'q>, bound: &FxHashSet<VarKey<'q>>) -> u64 {
    let is_bound = |spec: &TermSpec<'q>| match spec {
        TermSpec::Const(_) => true,
        TermSpec::Var(key) => bound.contains(key),
    };
    let (s, p, o, closure) = match leaf {
        Leaf::Triple { s, p, o, .. } => (is_bound(s), is_bound(p), is_bound(o), false),
        Leaf::Closure { s, o, .. } => (is_bound(s), true, is_bound(o), true),
        Leaf::Alt { s, o, .. } => (is_bound(s), true, is_bound(o), false),
    };
    let unbound = [s, p, o].iter().filter(|b| !**b).count() as u64;

    let pred_card = match leaf {
        Leaf::Triple {
            p: TermSpec::Const(Some(id)),
            ..
        } => ctx.reader.predicate_count(*id),
        _ => {
            let kinds = ctx.reader.predicate_kinds() as u64;
            ctx.reader.quad_count() / kinds.max(1)
        }
    };
    let base = match unbound {
        0 => 1,
        1 => pred_card.max(1) / 8 + 1,
        2 => pred_card.max(8),
        _ => ctx.reader.quad_count().max(1).saturating_mul(4),
    };
    if closure {
        base.saturating_mul(16)
    } else {
        base
    }
}

/// Earliest level index whose cumulative bound set covers `keys`.
fn attachment_level<'q>(
    keys: &[VarKey<'q>],
    cumulative: &[FxHashSet<VarKey<'q>>],
) -> Option<usize> {
    cumulative
        .iter()
        .position(|set| keys.iter().all(|k| set.contains(k)))
}

fn contains_exists(expr: &Expr<'_>) -> bool {
    match expr {
        Expr::Exists { .. } => true,
        Expr::Term(_) => false,
        Expr::Binary { lhs, rhs, .. } => contains_exists(lhs) || contains_exists(rhs),
        Expr::Unary { expr, .. } => contains_exists(expr),
        Expr::Call { args, .. } => args.iter().any(contains_exists),
        Expr::In { expr, list, .. } => {
            contains_exists(expr) || list.iter().any(contains_exists)
        }
        Expr::Cast { expr, .. } => contains_exists(expr),
    }
}

/// All variables a group can bind, recursively.
pub fn collect_group_vars<'q>(group: &GroupPattern<'q>, out: &mut FxHashSet<VarKey<'q>>) {
    for pattern in &group.patterns {
        collect_term_var(&pattern.subject, out);
        collect_term_var(&pattern.object, out);
        collect_path_vars(&pattern.path, out);
    }
    for bind in &group.binds {
        out.insert(VarKey::Named(bind.var));
    }
    if let Some(values) = &group.values {
        for var in &values.vars {
            out.insert(VarKey::Named(*var));
        }
    }
    for clause in &group.graphs {
        if let Some(var) = clause.graph.as_var() {
            out.insert(VarKey::Named(var));
        }
        collect_group_vars(&clause.group, out);
    }
    for union in &group.unions {
        collect_group_vars(&union.left, out);
        collect_group_vars(&union.right, out);
    }
    for optional in &group.optionals {
        collect_group_vars(optional, out);
    }
    for subquery in &group.subqueries {
        for item in &subquery.items {
            out.insert(VarKey::Named(item.name()));
        }
        if subquery.star {
            collect_group_vars(&subquery.where_clause, out);
        }
    }
}

fn collect_term_var<'q>(term: &TermRef<'q>, out: &mut FxHashSet<VarKey<'q>>) {
    match term {
        TermRef::Var(name) => {
            out.insert(VarKey::Named(name));
        }
        TermRef::Blank(label) => {
            out.insert(VarKey::Blank(label));
        }
        _ => {}
    }
}

fn collect_path_vars<'q>(path: &PropertyPath<'q>, out: &mut FxHashSet<VarKey<'q>>) {
    match path {
        PropertyPath::Simple(term) => collect_term_var(term, out),
        PropertyPath::Inverse(inner)
        | PropertyPath::ZeroOrMore(inner)
        | PropertyPath::OneOrMore(inner)
        | PropertyPath::ZeroOrOne(inner) => collect_path_vars(inner, out),
        PropertyPath::Sequence(steps) | PropertyPath::Alternative(steps) => {
            for step in steps {
                collect_path_vars(step, out);
            }
        }
    }
}

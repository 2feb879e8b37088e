//! Scan operators.
//!
//! Execution composes scans over one shared, append-only binding table.
//! Every scan obeys the same contract: `move_next` advances the cursor and
//! appends any newly bound variables; on `false` it has truncated the table
//! back to the count recorded when it was opened; re-entry after a success
//! truncates to that mark before producing the next row. Pattern scans bind
//! atom ids and never allocate per tuple.
//!
//! The operators form an `enum` dispatched by `match`; recursive variants
//! are heap-boxed so nested subqueries cannot grow the stack.

use super::ast::{Bind, Expr, GroupPattern, SelectQuery};
use super::expr::{self, EvalCtx};
use crate::atom::{AtomError, AtomId, AtomStore};
use crate::store::{QuadPattern, StoreError, StoreReader};
use crate::term::{TermError, Value};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Execution errors
#[derive(Error, Debug)]
pub enum ExecError {
    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Atom store error
    #[error(transparent)]
    Atom(#[from] AtomError),

    /// Term decoding error
    #[error(transparent)]
    Term(#[from] TermError),

    /// Semantic error: unknown prefix, unbound graph variable, misuse
    #[error("Semantic error: {0}")]
    Semantic(String),

    /// A planner or executor capacity was exceeded
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// The cancellation token was tripped
    #[error("Query cancelled")]
    Cancelled,
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Cooperative cancellation token, checked at every multi-pattern step.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A variable slot in the binding table. Blank nodes in patterns and
/// planner-introduced path joints live in their own namespaces so they can
/// never collide with user variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKey<'q> {
    Named(&'q str),
    Blank(&'q str),
    Path(u32),
}

/// One bound value: an interned atom from a scan, or a computed value from
/// BIND / VALUES / a subquery.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Atom(AtomId),
    Value(Value),
}

/// Decode a binding to its typed value.
pub fn value_of(bound: &Bound, atoms: &AtomStore) -> ExecResult<Value> {
    Ok(match bound {
        Bound::Atom(0) => Value::Plain(String::new()),
        Bound::Atom(id) => Value::from_stored(atoms.fetch(*id)?.as_str()?)?,
        Bound::Value(v) => v.clone(),
    })
}

/// Type-aware comparison of an existing binding against a scanned atom.
pub fn bound_matches_atom(bound: &Bound, id: AtomId, atoms: &AtomStore) -> ExecResult<bool> {
    match bound {
        Bound::Atom(existing) => Ok(*existing == id),
        Bound::Value(value) => {
            let scanned = value_of(&Bound::Atom(id), atoms)?;
            Ok(value.same_value(&scanned))
        }
    }
}

/// The shared binding table: append-only, truncated on backtracking.
#[derive(Debug, Default, Clone)]
pub struct Bindings<'q> {
    entries: Vec<(VarKey<'q>, Bound)>,
}

impl<'q> Bindings<'q> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn truncate(&mut self, mark: usize) {
        self.entries.truncate(mark);
    }

    pub fn get(&self, key: VarKey<'_>) -> Option<&Bound> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| key_eq(*k, key))
            .map(|(_, b)| b)
    }

    pub fn push(&mut self, key: VarKey<'q>, value: Bound) {
        self.entries.push((key, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(VarKey<'q>, Bound)> {
        self.entries.iter()
    }
}

/// Key comparison across distinct borrow lifetimes.
fn key_eq(a: VarKey<'_>, b: VarKey<'_>) -> bool {
    match (a, b) {
        (VarKey::Named(x), VarKey::Named(y)) => x == y,
        (VarKey::Blank(x), VarKey::Blank(y)) => x == y,
        (VarKey::Path(x), VarKey::Path(y)) => x == y,
        _ => false,
    }
}

/// Per-query execution context, threaded through every scan explicitly.
pub struct ExecContext<'q, 's> {
    pub reader: &'s StoreReader<'s>,
    pub query: &'q super::ast::Query<'q>,
    pub cancel: CancelFlag,
    /// FROM: graphs scanned in place of the default graph.
    pub default_graphs: Option<Vec<AtomId>>,
    /// FROM NAMED: restriction for variable-graph iteration.
    pub named_graphs: Option<Vec<AtomId>>,
    /// Allocator for planner-introduced path variables, shared so nested
    /// plans (EXISTS, subqueries) never reuse a joint.
    pub path_vars: Cell<u32>,
}

impl<'q, 's> ExecContext<'q, 's> {
    pub fn new(reader: &'s StoreReader<'s>, query: &'q super::ast::Query<'q>) -> Self {
        Self {
            reader,
            query,
            cancel: CancelFlag::new(),
            default_graphs: None,
            named_graphs: None,
            path_vars: Cell::new(0),
        }
    }

    pub fn check_cancelled(&self) -> ExecResult<()> {
        if self.cancel.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn atoms(&self) -> &'s AtomStore {
        self.reader.atoms()
    }

    pub fn next_path_var(&self) -> VarKey<'q> {
        let n = self.path_vars.get();
        self.path_vars.set(n + 1);
        VarKey::Path(n)
    }

    /// The graph list a variable-graph scan iterates.
    pub fn graph_universe(&self) -> ExecResult<Vec<AtomId>> {
        match &self.named_graphs {
            Some(restricted) => Ok(restricted.clone()),
            None => Ok(self.reader.named_graphs()?),
        }
    }
}

/// A pattern slot after planning: a looked-up constant or a variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TermSpec<'q> {
    /// `None` means the constant is not in the atom store, so nothing can
    /// match.
    Const(Option<AtomId>),
    Var(VarKey<'q>),
}

/// The graph a scan is scoped to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GraphSpec<'q> {
    Default,
    Named(Option<AtomId>),
    Var(VarKey<'q>),
}

/// The operator tree.
pub enum Scan<'q, 's> {
    Pattern(PatternScan<'q, 's>),
    Path(Box<PathScan<'q>>),
    Multi(Box<MultiScan<'q, 's>>),
    Join(Box<JoinScan<'q, 's>>),
    Union(Box<UnionScan<'q, 's>>),
    Optional(Box<OptionalScan<'q, 's>>),
    Minus(Box<MinusScan<'q, 's>>),
    Filter(Box<FilterScan<'q, 's>>),
    Bind(Box<BindScan<'q, 's>>),
    Values(Box<ValuesScan<'q>>),
    SubQuery(Box<SubQueryScan<'q, 's>>),
    VarGraph(Box<VarGraphScan<'q, 's>>),
}

impl<'q, 's> Scan<'q, 's> {
    /// Advance to the next solution, appending new bindings. On `false`
    /// the binding table is back at the mark recorded when the scan
    /// opened.
    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        match self {
            Scan::Pattern(s) => s.move_next(ctx, bindings),
            Scan::Path(s) => s.move_next(ctx, bindings),
            Scan::Multi(s) => s.move_next(ctx, bindings),
            Scan::Join(s) => s.move_next(ctx, bindings),
            Scan::Union(s) => s.move_next(ctx, bindings),
            Scan::Optional(s) => s.move_next(ctx, bindings),
            Scan::Minus(s) => s.move_next(ctx, bindings),
            Scan::Filter(s) => s.move_next(ctx, bindings),
            Scan::Bind(s) => s.move_next(ctx, bindings),
            Scan::Values(s) => s.move_next(ctx, bindings),
            Scan::SubQuery(s) => s.move_next(ctx, bindings),
            Scan::VarGraph(s) => s.move_next(ctx, bindings),
        }
    }

    /// Rewind so the next `move_next` starts over against the bindings
    /// current at that time.
    pub fn reset(&mut self) {
        match self {
            Scan::Pattern(s) => s.reset(),
            Scan::Path(s) => s.reset(),
            Scan::Multi(s) => s.reset(),
            Scan::Join(s) => s.reset(),
            Scan::Union(s) => s.reset(),
            Scan::Optional(s) => s.reset(),
            Scan::Minus(s) => s.reset(),
            Scan::Filter(s) => s.reset(),
            Scan::Bind(s) => s.reset(),
            Scan::Values(s) => s.reset(),
            Scan::SubQuery(s) => s.reset(),
            Scan::VarGraph(s) => s.reset(),
        }
    }

    /// Release cursors and scratch state. Also invoked implicitly by drop;
    /// the explicit form exists so callers can release mid-query.
    pub fn close(&mut self) {
        self.reset();
    }
}

// ---- triple pattern scan -------------------------------------------------

pub struct PatternScan<'q, 's> {
    pub subject: TermSpec<'q>,
    pub predicate: TermSpec<'q>,
    pub object: TermSpec<'q>,
    pub graph: GraphSpec<'q>,
    /// Property-path inverse: swap subject and object against the store.
    pub inverse: bool,
    state: Option<PatternState<'q, 's>>,
}

struct PatternState<'q, 's> {
    mark: usize,
    /// Graphs still to scan, in reverse order for `pop`. Almost always one
    /// entry; FROM lists spill.
    graphs: SmallVec<[AtomId; 2]>,
    iter: Option<crate::store::QuadIter<'s>>,
    pattern: QuadPattern,
    /// Residual type-aware checks for vars bound to computed values.
    s_check: Option<Value>,
    p_check: Option<Value>,
    o_check: Option<Value>,
    s_var: Option<VarKey<'q>>,
    p_var: Option<VarKey<'q>>,
    o_var: Option<VarKey<'q>>,
}

impl<'q, 's> PatternScan<'q, 's> {
    pub fn new(
        subject: TermSpec<'q>,
        predicate: TermSpec<'q>,
        object: TermSpec<'q>,
        graph: GraphSpec<'q>,
        inverse: bool,
    ) -> Self {
        Self {
            subject,
            predicate,
            object,
            graph,
            inverse,
            state: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = None;
    }

    fn open(
        &self,
        ctx: &ExecContext<'q, 's>,
        bindings: &Bindings<'q>,
    ) -> ExecResult<PatternState<'q, 's>> {
        let mark = bindings.len();
        // The store-facing subject/object honour path inversion.
        let (s_spec, o_spec) = if self.inverse {
            (self.object, self.subject)
        } else {
            (self.subject, self.object)
        };

        let mut pattern = QuadPattern::default();
        let mut state = PatternState {
            mark,
            graphs: SmallVec::new(),
            iter: None,
            pattern,
            s_check: None,
            p_check: None,
            o_check: None,
            s_var: None,
            p_var: None,
            o_var: None,
        };

        let mut satisfiable = true;
        let mut slot = |spec: TermSpec<'q>,
                        out: &mut Option<AtomId>,
                        check: &mut Option<Value>,
                        var: &mut Option<VarKey<'q>>|
         -> ExecResult<()> {
            match spec {
                TermSpec::Const(None) => satisfiable = false,
                TermSpec::Const(Some(id)) => *out = Some(id),
                TermSpec::Var(key) => match bindings.get(key) {
                    Some(Bound::Atom(id)) => *out = Some(*id),
                    Some(Bound::Value(v)) => {
                        *check = Some(v.clone());
                        *var = None;
                    }
                    None => *var = Some(key),
                },
            }
            Ok(())
        };
        slot(s_spec, &mut pattern.s, &mut state.s_check, &mut state.s_var)?;
        slot(
            self.predicate,
            &mut pattern.p,
            &mut state.p_check,
            &mut state.p_var,
        )?;
        slot(o_spec, &mut pattern.o, &mut state.o_check, &mut state.o_var)?;
        drop(slot);

        let graphs = match self.graph {
            GraphSpec::Default => match &ctx.default_graphs {
                Some(graphs) => graphs.clone(),
                None => vec![0],
            },
            GraphSpec::Named(None) => {
                satisfiable = false;
                Vec::new()
            }
            GraphSpec::Named(Some(g)) => vec![g],
            GraphSpec::Var(key) => match bindings.get(key) {
                Some(Bound::Atom(g)) => vec![*g],
                Some(Bound::Value(v)) => match ctx.atoms().lookup(&v.to_stored()) {
                    Some(g) => vec![g],
                    None => {
                        satisfiable = false;
                        Vec::new()
                    }
                },
                None => {
                    return Err(ExecError::Semantic(
                        "graph variable is not bound at scan time".to_string(),
                    ))
                }
            },
        };

        state.pattern = pattern;
        if satisfiable {
            state.graphs = graphs.into_iter().rev().collect();
        }
        Ok(state)
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        // The state is owned for the duration of the call and put back on
        // success; exhaustion drops it so the next call reopens.
        let mut state = match self.state.take() {
            Some(state) => state,
            None => self.open(ctx, bindings)?,
        };

        loop {
            bindings.truncate(state.mark);
            if state.iter.is_none() {
                let Some(g) = state.graphs.pop() else {
                    return Ok(false);
                };
                let mut pattern = state.pattern;
                pattern.g = Some(g);
                state.iter = Some(ctx.reader.scan(pattern)?);
            }
            let Some(iter) = state.iter.as_mut() else {
                continue;
            };
            match iter.next() {
                None => {
                    state.iter = None;
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(quad)) => {
                    let atoms = ctx.atoms();
                    if let Some(check) = &state.s_check {
                        if !check.same_value(&value_of(&Bound::Atom(quad.s), atoms)?) {
                            continue;
                        }
                    }
                    if let Some(check) = &state.p_check {
                        if !check.same_value(&value_of(&Bound::Atom(quad.p), atoms)?) {
                            continue;
                        }
                    }
                    if let Some(check) = &state.o_check {
                        if !check.same_value(&value_of(&Bound::Atom(quad.o), atoms)?) {
                            continue;
                        }
                    }
                    if !bind_or_check(bindings, state.s_var, quad.s, atoms)?
                        || !bind_or_check(bindings, state.p_var, quad.p, atoms)?
                        || !bind_or_check(bindings, state.o_var, quad.o, atoms)?
                    {
                        continue;
                    }
                    self.state = Some(state);
                    return Ok(true);
                }
            }
        }
    }
}

/// Bind an unbound variable or verify the existing binding; handles the
/// same variable appearing in two slots of one pattern.
fn bind_or_check<'q>(
    bindings: &mut Bindings<'q>,
    var: Option<VarKey<'q>>,
    id: AtomId,
    atoms: &AtomStore,
) -> ExecResult<bool> {
    let Some(key) = var else { return Ok(true) };
    if let Some(existing) = bindings.get(key) {
        return bound_matches_atom(existing, id, atoms);
    }
    bindings.push(key, Bound::Atom(id));
    Ok(true)
}

// ---- property path closure scan ------------------------------------------

/// One elementary step of a path closure; alternatives hold several.
#[derive(Debug, Clone, Copy)]
pub struct PathStep {
    /// `None` when the predicate IRI is not in the store.
    pub pred: Option<AtomId>,
    pub inverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureKind {
    ZeroOrMore,
    OneOrMore,
    ZeroOrOne,
}

/// Breadth-first closure over `p*`, `p+`, `p?` (and alternatives of simple
/// steps). Reachable nodes are visited once, so cyclic data terminates and
/// duplicates are suppressed. Results materialize per opening.
pub struct PathScan<'q> {
    pub subject: TermSpec<'q>,
    pub object: TermSpec<'q>,
    pub graph: GraphSpec<'q>,
    pub steps: Vec<PathStep>,
    pub kind: ClosureKind,
    state: Option<PathState<'q>>,
}

struct PathState<'q> {
    mark: usize,
    results: Vec<(AtomId, AtomId)>,
    idx: usize,
    s_var: Option<VarKey<'q>>,
    o_var: Option<VarKey<'q>>,
}

impl<'q> PathScan<'q> {
    pub fn new(
        subject: TermSpec<'q>,
        object: TermSpec<'q>,
        graph: GraphSpec<'q>,
        steps: Vec<PathStep>,
        kind: ClosureKind,
    ) -> Self {
        Self {
            subject,
            object,
            graph,
            steps,
            kind,
            state: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = None;
    }

    pub fn move_next<'s>(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        let mut state = match self.state.take() {
            Some(state) => state,
            None => self.open(ctx, bindings)?,
        };
        let atoms = ctx.atoms();
        loop {
            bindings.truncate(state.mark);
            if state.idx >= state.results.len() {
                return Ok(false);
            }
            let (start, end) = state.results[state.idx];
            state.idx += 1;
            if !bind_or_check(bindings, state.s_var, start, atoms)?
                || !bind_or_check(bindings, state.o_var, end, atoms)?
            {
                continue;
            }
            self.state = Some(state);
            return Ok(true);
        }
    }

    fn open<'s>(
        &self,
        ctx: &ExecContext<'q, 's>,
        bindings: &Bindings<'q>,
    ) -> ExecResult<PathState<'q>> {
        let mark = bindings.len();
        let (start, s_var) = resolve_endpoint(self.subject, bindings, ctx)?;
        let (end, o_var) = resolve_endpoint(self.object, bindings, ctx)?;

        let mut state = PathState {
            mark,
            results: Vec::new(),
            idx: 0,
            s_var,
            o_var,
        };
        // A constant endpoint missing from the store cannot match.
        if matches!(self.subject, TermSpec::Const(None))
            || matches!(self.object, TermSpec::Const(None))
        {
            return Ok(state);
        }

        let graphs: Vec<AtomId> = match self.graph {
            GraphSpec::Default => ctx.default_graphs.clone().unwrap_or_else(|| vec![0]),
            GraphSpec::Named(None) => return Ok(state),
            GraphSpec::Named(Some(g)) => vec![g],
            GraphSpec::Var(key) => match bindings.get(key) {
                Some(Bound::Atom(g)) => vec![*g],
                _ => {
                    return Err(ExecError::Semantic(
                        "graph variable is not bound at scan time".to_string(),
                    ))
                }
            },
        };

        for g in graphs {
            match (start, end) {
                (Some(s), Some(o)) => {
                    if self.closure_from(ctx, s, g, false)?.contains(&o) {
                        state.results.push((s, o));
                    }
                }
                (Some(s), None) => {
                    for o in self.closure_from(ctx, s, g, false)? {
                        state.results.push((s, o));
                    }
                }
                (None, Some(o)) => {
                    for s in self.closure_from(ctx, o, g, true)? {
                        state.results.push((s, o));
                    }
                }
                (None, None) => {
                    for s in self.candidate_starts(ctx, g)? {
                        for o in self.closure_from(ctx, s, g, false)? {
                            state.results.push((s, o));
                        }
                    }
                }
            }
        }
        Ok(state)
    }

    /// BFS closure from `origin`, following steps (reversed when
    /// `backward`).
    fn closure_from<'s>(
        &self,
        ctx: &ExecContext<'q, 's>,
        origin: AtomId,
        g: AtomId,
        backward: bool,
    ) -> ExecResult<Vec<AtomId>> {
        let mut visited: FxHashSet<AtomId> = FxHashSet::default();
        let mut queue: VecDeque<(AtomId, usize)> = VecDeque::new();
        let mut out = Vec::new();
        let mut origin_revisited = false;
        queue.push_back((origin, 0));

        while let Some((node, depth)) = queue.pop_front() {
            ctx.check_cancelled()?;
            if !visited.insert(node) {
                continue;
            }
            let include = match self.kind {
                ClosureKind::ZeroOrMore => true,
                ClosureKind::OneOrMore => depth >= 1,
                ClosureKind::ZeroOrOne => depth <= 1,
            };
            if include {
                out.push(node);
            }
            if self.kind == ClosureKind::ZeroOrOne && depth >= 1 {
                continue;
            }
            for step in &self.steps {
                let Some(pred) = step.pred else { continue };
                let forward = step.inverse == backward;
                let pattern = if forward {
                    QuadPattern {
                        s: Some(node),
                        p: Some(pred),
                        o: None,
                        g: Some(g),
                    }
                } else {
                    QuadPattern {
                        s: None,
                        p: Some(pred),
                        o: Some(node),
                        g: Some(g),
                    }
                };
                for quad in ctx.reader.scan(pattern)? {
                    let quad = quad?;
                    let next = if forward { quad.o } else { quad.s };
                    if next == origin {
                        origin_revisited = true;
                    }
                    if !visited.contains(&next) {
                        queue.push_back((next, depth + 1));
                    }
                }
            }
        }
        // A cycle back to the origin makes it reachable in one or more
        // steps even though BFS seeded it at depth zero.
        if self.kind == ClosureKind::OneOrMore && origin_revisited && !out.contains(&origin) {
            out.push(origin);
        }
        Ok(out)
    }

    /// Start candidates for a fully unbound closure: every term occurring
    /// on the appropriate side of one of the step predicates.
    fn candidate_starts<'s>(
        &self,
        ctx: &ExecContext<'q, 's>,
        g: AtomId,
    ) -> ExecResult<Vec<AtomId>> {
        let mut set: FxHashSet<AtomId> = FxHashSet::default();
        for step in &self.steps {
            let Some(pred) = step.pred else { continue };
            let pattern = QuadPattern {
                s: None,
                p: Some(pred),
                o: None,
                g: Some(g),
            };
            for quad in ctx.reader.scan(pattern)? {
                let quad = quad?;
                set.insert(if step.inverse { quad.o } else { quad.s });
            }
        }
        let mut out: Vec<AtomId> = set.into_iter().collect();
        out.sort_unstable();
        Ok(out)
    }
}

fn resolve_endpoint<'q, 's>(
    spec: TermSpec<'q>,
    bindings: &Bindings<'q>,
    ctx: &ExecContext<'q, 's>,
) -> ExecResult<(Option<AtomId>, Option<VarKey<'q>>)> {
    Ok(match spec {
        TermSpec::Const(id) => (id, None),
        TermSpec::Var(key) => match bindings.get(key) {
            Some(Bound::Atom(id)) => (Some(*id), None),
            Some(Bound::Value(v)) => (ctx.atoms().lookup(&v.to_stored()), None),
            None => (None, Some(key)),
        },
    })
}

// ---- multi-pattern nested loop -------------------------------------------

/// One join level: a leaf scan plus the filters and BINDs attached to it.
pub struct MultiLevel<'q, 's> {
    pub scan: Scan<'q, 's>,
    pub filters: Vec<&'q Expr<'q>>,
    pub binds: Vec<&'q Bind<'q>>,
}

/// Nested-loop join over the ordered pattern levels of one group.
pub struct MultiScan<'q, 's> {
    pub levels: Vec<MultiLevel<'q, 's>>,
    started: bool,
    done: bool,
    empty_emitted: bool,
}

impl<'q, 's> MultiScan<'q, 's> {
    pub fn new(levels: Vec<MultiLevel<'q, 's>>) -> Self {
        Self {
            levels,
            started: false,
            done: false,
            empty_emitted: false,
        }
    }

    pub fn reset(&mut self) {
        self.started = false;
        self.done = false;
        self.empty_emitted = false;
        for level in &mut self.levels {
            level.scan.reset();
        }
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        ctx.check_cancelled()?;
        if self.done {
            return Ok(false);
        }
        if self.levels.is_empty() {
            // A group with no patterns contributes exactly one empty row.
            if self.empty_emitted {
                self.done = true;
                return Ok(false);
            }
            self.empty_emitted = true;
            return Ok(true);
        }

        let mut i = if self.started {
            self.levels.len() - 1
        } else {
            self.started = true;
            self.levels[0].scan.reset();
            0
        };

        loop {
            ctx.check_cancelled()?;
            if self.levels[i].scan.move_next(ctx, bindings)? {
                if !self.accept_level(i, ctx, bindings)? {
                    continue;
                }
                if i + 1 == self.levels.len() {
                    return Ok(true);
                }
                i += 1;
                self.levels[i].scan.reset();
            } else if i == 0 {
                self.done = true;
                return Ok(false);
            } else {
                i -= 1;
            }
        }
    }

    /// Evaluate the filters pushed to this level, then its BINDs.
    fn accept_level(
        &self,
        i: usize,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        for &filter in &self.levels[i].filters {
            if !expr::truth(filter, &mut EvalCtx::scan(ctx, bindings))? {
                return Ok(false);
            }
        }
        for &bind in &self.levels[i].binds {
            let value = expr::eval(&bind.expr, &mut EvalCtx::scan(ctx, bindings))?;
            let key = VarKey::Named(bind.var);
            match (bindings.get(key).cloned(), value) {
                // An errored expression leaves the target unbound.
                (None, None) => {}
                (None, Some(v)) => bindings.push(key, Bound::Value(v)),
                (Some(existing), Some(v)) => {
                    if !value_of(&existing, ctx.atoms())?.same_value(&v) {
                        return Ok(false);
                    }
                }
                (Some(_), None) => return Ok(false),
            }
        }
        Ok(true)
    }
}

// ---- combinators ---------------------------------------------------------

/// Nested-loop conjunction of two sub-scans sharing the binding table.
pub struct JoinScan<'q, 's> {
    pub left: Scan<'q, 's>,
    pub right: Scan<'q, 's>,
    left_active: bool,
}

impl<'q, 's> JoinScan<'q, 's> {
    pub fn new(left: Scan<'q, 's>, right: Scan<'q, 's>) -> Self {
        Self {
            left,
            right,
            left_active: false,
        }
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
        self.left_active = false;
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        loop {
            if !self.left_active {
                if !self.left.move_next(ctx, bindings)? {
                    return Ok(false);
                }
                self.left_active = true;
                self.right.reset();
            }
            if self.right.move_next(ctx, bindings)? {
                return Ok(true);
            }
            self.left_active = false;
        }
    }
}

/// Structural union: all rows of the left branch, then all of the right.
/// Both branches see the same already-bound outer variables.
pub struct UnionScan<'q, 's> {
    pub left: Scan<'q, 's>,
    pub right: Scan<'q, 's>,
    side: u8,
}

impl<'q, 's> UnionScan<'q, 's> {
    pub fn new(left: Scan<'q, 's>, right: Scan<'q, 's>) -> Self {
        Self {
            left,
            right,
            side: 0,
        }
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
        self.side = 0;
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        if self.side == 0 {
            if self.left.move_next(ctx, bindings)? {
                return Ok(true);
            }
            self.side = 1;
            self.right.reset();
        }
        if self.side == 1 {
            if self.right.move_next(ctx, bindings)? {
                return Ok(true);
            }
            self.side = 2;
        }
        Ok(false)
    }
}

/// Left-outer join: every outer row, extended by the optional side when it
/// matches, passed through bare when it does not.
pub struct OptionalScan<'q, 's> {
    pub outer: Scan<'q, 's>,
    pub inner: Scan<'q, 's>,
    have_outer: bool,
    matched: bool,
}

impl<'q, 's> OptionalScan<'q, 's> {
    pub fn new(outer: Scan<'q, 's>, inner: Scan<'q, 's>) -> Self {
        Self {
            outer,
            inner,
            have_outer: false,
            matched: false,
        }
    }

    pub fn reset(&mut self) {
        self.outer.reset();
        self.inner.reset();
        self.have_outer = false;
        self.matched = false;
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        loop {
            if !self.have_outer {
                if !self.outer.move_next(ctx, bindings)? {
                    return Ok(false);
                }
                self.have_outer = true;
                self.matched = false;
                self.inner.reset();
            }
            if self.inner.move_next(ctx, bindings)? {
                self.matched = true;
                return Ok(true);
            }
            let emit_bare = !self.matched;
            self.have_outer = false;
            if emit_bare {
                return Ok(true);
            }
        }
    }
}

/// MINUS: suppress outer rows for which the minus side has a compatible
/// row. When the two sides share no variables the clause has no effect.
pub struct MinusScan<'q, 's> {
    pub outer: Scan<'q, 's>,
    pub minus: Scan<'q, 's>,
    pub shares_variables: bool,
}

impl<'q, 's> MinusScan<'q, 's> {
    pub fn new(outer: Scan<'q, 's>, minus: Scan<'q, 's>, shares_variables: bool) -> Self {
        Self {
            outer,
            minus,
            shares_variables,
        }
    }

    pub fn reset(&mut self) {
        self.outer.reset();
        self.minus.reset();
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        loop {
            if !self.outer.move_next(ctx, bindings)? {
                return Ok(false);
            }
            if !self.shares_variables {
                return Ok(true);
            }
            let mark = bindings.len();
            self.minus.reset();
            let hit = self.minus.move_next(ctx, bindings)?;
            bindings.truncate(mark);
            if !hit {
                return Ok(true);
            }
        }
    }
}

/// BIND evaluation for binds that no pattern level could host (groups
/// without patterns, or binds over OPTIONAL/UNION variables).
pub struct BindScan<'q, 's> {
    pub input: Scan<'q, 's>,
    pub binds: Vec<&'q Bind<'q>>,
    mark: usize,
    active: bool,
}

impl<'q, 's> BindScan<'q, 's> {
    pub fn new(input: Scan<'q, 's>, binds: Vec<&'q Bind<'q>>) -> Self {
        Self {
            input,
            binds,
            mark: 0,
            active: false,
        }
    }

    pub fn reset(&mut self) {
        self.input.reset();
        self.active = false;
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        if !self.active {
            self.mark = bindings.len();
            self.active = true;
        }
        'rows: loop {
            if !self.input.move_next(ctx, bindings)? {
                bindings.truncate(self.mark);
                self.active = false;
                return Ok(false);
            }
            for &bind in &self.binds {
                let value = expr::eval(&bind.expr, &mut EvalCtx::scan(ctx, bindings))?;
                let key = VarKey::Named(bind.var);
                match (bindings.get(key).cloned(), value) {
                    (None, None) => {}
                    (None, Some(v)) => bindings.push(key, Bound::Value(v)),
                    (Some(existing), Some(v)) => {
                        if !value_of(&existing, ctx.atoms())?.same_value(&v) {
                            continue 'rows;
                        }
                    }
                    (Some(_), None) => continue 'rows,
                }
            }
            return Ok(true);
        }
    }
}

/// Group-level FILTER application for filters that could not be pushed to
/// a join level.
pub struct FilterScan<'q, 's> {
    pub input: Scan<'q, 's>,
    pub filters: Vec<&'q Expr<'q>>,
}

impl<'q, 's> FilterScan<'q, 's> {
    pub fn new(input: Scan<'q, 's>, filters: Vec<&'q Expr<'q>>) -> Self {
        Self { input, filters }
    }

    pub fn reset(&mut self) {
        self.input.reset();
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        'rows: loop {
            if !self.input.move_next(ctx, bindings)? {
                return Ok(false);
            }
            for &filter in &self.filters {
                if !expr::truth(filter, &mut EvalCtx::scan(ctx, bindings))? {
                    continue 'rows;
                }
            }
            return Ok(true);
        }
    }
}

/// Inline data: restricts or extends the current bindings row by row.
pub struct ValuesScan<'q> {
    pub vars: Vec<VarKey<'q>>,
    pub rows: Vec<Vec<Option<Bound>>>,
    idx: usize,
    mark: usize,
    active: bool,
}

impl<'q> ValuesScan<'q> {
    pub fn new(vars: Vec<VarKey<'q>>, rows: Vec<Vec<Option<Bound>>>) -> Self {
        Self {
            vars,
            rows,
            idx: 0,
            mark: 0,
            active: false,
        }
    }

    pub fn reset(&mut self) {
        self.idx = 0;
        self.active = false;
    }

    pub fn move_next<'s>(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        if !self.active {
            self.mark = bindings.len();
            self.active = true;
        }
        let atoms = ctx.atoms();
        'rows: while self.idx < self.rows.len() {
            bindings.truncate(self.mark);
            let row = &self.rows[self.idx];
            self.idx += 1;
            for (key, cell) in self.vars.iter().zip(row.iter()) {
                let Some(value) = cell else { continue };
                match bindings.get(*key) {
                    None => bindings.push(*key, value.clone()),
                    Some(existing) => {
                        let ok = match (existing, value) {
                            (Bound::Atom(a), Bound::Atom(b)) => a == b,
                            _ => value_of(existing, atoms)?.same_value(&value_of(value, atoms)?),
                        };
                        if !ok {
                            continue 'rows;
                        }
                    }
                }
            }
            return Ok(true);
        }
        bindings.truncate(self.mark);
        self.active = false;
        self.idx = self.rows.len();
        Ok(false)
    }
}

/// Subquery: materializes its inner result eagerly on first call, then
/// streams the projected rows as join candidates. Aggregation and solution
/// modifiers run inside the boundary; only projected variables escape.
pub struct SubQueryScan<'q, 's> {
    pub select: &'q SelectQuery<'q>,
    rows: Option<Vec<Vec<(VarKey<'q>, Value)>>>,
    idx: usize,
    mark: usize,
    active: bool,
    _reader: std::marker::PhantomData<&'s ()>,
}

impl<'q, 's> SubQueryScan<'q, 's> {
    pub fn new(select: &'q SelectQuery<'q>) -> Self {
        Self {
            select,
            rows: None,
            idx: 0,
            mark: 0,
            active: false,
            _reader: std::marker::PhantomData,
        }
    }

    pub fn reset(&mut self) {
        // The materialized result is independent of outer bindings and is
        // kept across re-openings.
        self.idx = 0;
        self.active = false;
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        if self.rows.is_none() {
            let (names, solutions) = super::pipeline::exec_select_rows(ctx, self.select)?;
            let mut rows = Vec::with_capacity(solutions.len());
            for solution in solutions {
                let mut row = Vec::new();
                for (name, value) in names.iter().zip(solution.into_iter()) {
                    if let Some(value) = value {
                        row.push((VarKey::Named(*name), value));
                    }
                }
                rows.push(row);
            }
            self.rows = Some(rows);
        }
        if !self.active {
            self.mark = bindings.len();
            self.active = true;
        }
        let atoms = ctx.atoms();
        let rows = match self.rows.as_ref() {
            Some(rows) => rows,
            None => return Ok(false),
        };
        'rows: while self.idx < rows.len() {
            bindings.truncate(self.mark);
            let row = &rows[self.idx];
            self.idx += 1;
            for (key, value) in row {
                match bindings.get(*key) {
                    None => bindings.push(*key, Bound::Value(value.clone())),
                    Some(existing) => {
                        if !value_of(existing, atoms)?.same_value(value) {
                            continue 'rows;
                        }
                    }
                }
            }
            return Ok(true);
        }
        bindings.truncate(self.mark);
        self.active = false;
        Ok(false)
    }
}

/// `GRAPH ?g { ... }`: iterate the named-graph universe (or the FROM NAMED
/// restriction), binding the graph variable and scoping the inner scan.
pub struct VarGraphScan<'q, 's> {
    pub var: VarKey<'q>,
    pub inner: Scan<'q, 's>,
    graphs: Option<Vec<AtomId>>,
    idx: usize,
    mark: usize,
    inner_active: bool,
}

impl<'q, 's> VarGraphScan<'q, 's> {
    pub fn new(var: VarKey<'q>, inner: Scan<'q, 's>) -> Self {
        Self {
            var,
            inner,
            graphs: None,
            idx: 0,
            mark: 0,
            inner_active: false,
        }
    }

    pub fn reset(&mut self) {
        self.idx = 0;
        self.inner_active = false;
        self.inner.reset();
    }

    pub fn move_next(
        &mut self,
        ctx: &ExecContext<'q, 's>,
        bindings: &mut Bindings<'q>,
    ) -> ExecResult<bool> {
        if self.graphs.is_none() {
            self.graphs = Some(ctx.graph_universe()?);
        }
        let graphs = match self.graphs.as_ref() {
            Some(graphs) => graphs,
            None => return Ok(false),
        };
        loop {
            ctx.check_cancelled()?;
            if !self.inner_active {
                loop {
                    if self.idx >= graphs.len() {
                        return Ok(false);
                    }
                    let g = graphs[self.idx];
                    self.idx += 1;
                    self.mark = bindings.len();
                    match bindings.get(self.var) {
                        Some(existing) => {
                            if !bound_matches_atom(existing, g, ctx.atoms())? {
                                continue;
                            }
                        }
                        None => bindings.push(self.var, Bound::Atom(g)),
                    }
                    self.inner.reset();
                    self.inner_active = true;
                    break;
                }
            }
            if self.inner.move_next(ctx, bindings)? {
                return Ok(true);
            }
            self.inner_active = false;
            bindings.truncate(self.mark);
        }
    }
}

/// Run a group as an EXISTS probe against a snapshot of the current row.
pub fn group_matches<'q, 's>(
    ctx: &ExecContext<'q, 's>,
    group: &'q GroupPattern<'q>,
    bindings: &Bindings<'q>,
) -> ExecResult<bool> {
    let mut scan = super::plan::build_group_scan(ctx, group, GraphSpec::Default)?;
    let mut probe = bindings.clone();
    let matched = scan.move_next(ctx, &mut probe)?;
    scan.close();
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_truncate_and_shadow() {
        let mut b = Bindings::new();
        b.push(VarKey::Named("x"), Bound::Atom(1));
        let mark = b.len();
        b.push(VarKey::Named("y"), Bound::Atom(2));
        assert!(b.get(VarKey::Named("y")).is_some());
        b.truncate(mark);
        assert!(b.get(VarKey::Named("y")).is_none());
        assert!(b.get(VarKey::Named("x")).is_some());
    }

    #[test]
    fn test_var_key_namespaces() {
        assert_ne!(VarKey::Named("b1"), VarKey::Blank("b1"));
        assert_ne!(VarKey::Path(0), VarKey::Path(1));
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}

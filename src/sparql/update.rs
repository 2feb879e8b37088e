//! SPARQL update execution.
//!
//! INSERT DATA / DELETE DATA apply ground quads directly; CLEAR and DROP
//! collect their victims under a read view first; DELETE/INSERT WHERE runs
//! the WHERE clause to full materialization, then applies both templates
//! as one atomic batch. Every operation commits through the store's WAL-
//! backed batch path under the writer lock.

use super::ast::{GraphTarget, Query, QuadTemplate, TermRef, UpdateOp};
use super::pipeline::{self, Row};
use super::resolve;
use super::scan::{CancelFlag, ExecContext, ExecError, ExecResult};
use crate::store::{Quad, QuadPattern, Store};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// Execute a parsed update request; returns the number of operations that
/// changed the store.
pub fn execute_update(
    store: &Store,
    query: &Query<'_>,
    ops: &[UpdateOp<'_>],
    cancel: &CancelFlag,
) -> ExecResult<usize> {
    let mut affected = 0usize;
    for op in ops {
        affected += match op {
            UpdateOp::InsertData(quads) => insert_data(store, query, quads)?,
            UpdateOp::DeleteData(quads) => delete_data(store, query, quads)?,
            UpdateOp::Clear(target) => clear(store, query, target)?,
            // With tombstoned storage DROP and CLEAR coincide: a graph
            // exists exactly while quads in it do.
            UpdateOp::Drop(target) => clear(store, query, target)?,
            UpdateOp::Modify {
                delete,
                insert,
                where_clause,
            } => {
                let rows = {
                    let reader = store.reader();
                    let mut ctx = ExecContext::new(&reader, query);
                    ctx.cancel = cancel.clone();
                    pipeline::collect_rows(&ctx, where_clause)?
                };
                apply_modify(store, query, delete, insert, &rows)?
            }
        };
    }
    info!(affected, "update executed");
    Ok(affected)
}

fn insert_data(store: &Store, query: &Query<'_>, quads: &[QuadTemplate<'_>]) -> ExecResult<usize> {
    let mut batch = store.batch();
    let mut blanks = FxHashMap::default();
    for template in quads {
        let quad = ground_quad(store, query, template, &mut blanks)?;
        batch.add(quad).map_err(ExecError::from)?;
    }
    Ok(batch.commit().map_err(ExecError::from)?)
}

fn delete_data(store: &Store, query: &Query<'_>, quads: &[QuadTemplate<'_>]) -> ExecResult<usize> {
    let mut batch = store.batch();
    for template in quads {
        // Deleting data never matches blank nodes; an unknown term means
        // the quad is simply absent.
        match lookup_quad(store, query, template)? {
            Some(quad) => batch.remove(quad).map_err(ExecError::from)?,
            None => continue,
        }
    }
    Ok(batch.commit().map_err(ExecError::from)?)
}

fn clear(store: &Store, query: &Query<'_>, target: &GraphTarget<'_>) -> ExecResult<usize> {
    let victims: Vec<Quad> = {
        let reader = store.reader();
        let patterns: Vec<QuadPattern> = match target {
            GraphTarget::Default => vec![QuadPattern {
                g: Some(0),
                ..Default::default()
            }],
            GraphTarget::All => vec![QuadPattern::default()],
            GraphTarget::Named => reader
                .named_graphs()?
                .into_iter()
                .map(|g| QuadPattern {
                    g: Some(g),
                    ..Default::default()
                })
                .collect(),
            GraphTarget::Graph(iri) => {
                let iri = resolve::expand_iri(query, iri)?;
                match store.atoms().lookup(&iri) {
                    Some(g) => vec![QuadPattern {
                        g: Some(g),
                        ..Default::default()
                    }],
                    None => Vec::new(),
                }
            }
        };
        let mut victims = Vec::new();
        for pattern in patterns {
            for quad in reader.scan(pattern)? {
                victims.push(quad.map_err(ExecError::from)?);
            }
        }
        victims
    };

    debug!(victims = victims.len(), "clearing quads");
    let mut batch = store.batch();
    for quad in victims {
        batch.remove(quad).map_err(ExecError::from)?;
    }
    Ok(batch.commit().map_err(ExecError::from)?)
}

fn apply_modify(
    store: &Store,
    query: &Query<'_>,
    delete: &[QuadTemplate<'_>],
    insert: &[QuadTemplate<'_>],
    rows: &[Row<'_>],
) -> ExecResult<usize> {
    let mut batch = store.batch();
    let mut blank_counter = 0u64;

    for row in rows {
        for template in delete {
            // Unbound template variables skip the quad for this solution.
            if let Some(quad) = instantiate_lookup(store, query, template, row)? {
                batch.remove(quad).map_err(ExecError::from)?;
            }
        }
    }
    for row in rows {
        // CONSTRUCT-style blank labels mint a fresh node per solution row.
        let mut blanks: FxHashMap<String, String> = FxHashMap::default();
        blank_counter += 1;
        for template in insert {
            if let Some(texts) = instantiate_texts(query, template, row, &mut |label: &str| {
                blanks
                    .entry(label.to_string())
                    .or_insert_with(|| format!("r{}_{}", blank_counter, label))
                    .clone()
            })? {
                let [s, p, o, g] = texts;
                batch.add_text(&s, &p, &o, &g).map_err(ExecError::from)?;
            }
        }
    }
    Ok(batch.commit().map_err(ExecError::from)?)
}

/// Resolve a ground template to an interned quad, minting blank nodes.
fn ground_quad(
    store: &Store,
    query: &Query<'_>,
    template: &QuadTemplate<'_>,
    blanks: &mut FxHashMap<String, String>,
) -> ExecResult<Quad> {
    let mut term_text = |term: &TermRef<'_>| -> ExecResult<String> {
        if let TermRef::Blank(label) = term {
            // Blank labels are scoped to this data block.
            return Ok(format!(
                "_:{}",
                blanks
                    .entry((*label).to_string())
                    .or_insert_with(|| (*label).to_string())
                    .clone()
            ));
        }
        resolve::term_to_stored(query, term)?
            .ok_or_else(|| ExecError::Semantic("ground data cannot contain variables".to_string()))
    };
    let s = term_text(&template.subject)?;
    let p = term_text(&template.predicate)?;
    let o = term_text(&template.object)?;
    let g = match &template.graph {
        None => String::new(),
        Some(term) => term_text(term)?,
    };
    let atoms = store.atoms();
    Ok(Quad::new(
        atoms.intern(&s)?,
        atoms.intern(&p)?,
        atoms.intern(&o)?,
        atoms.intern(&g)?,
    ))
}

/// Resolve a ground template against existing atoms only.
fn lookup_quad(
    store: &Store,
    query: &Query<'_>,
    template: &QuadTemplate<'_>,
) -> ExecResult<Option<Quad>> {
    let atoms = store.atoms();
    let mut lookup = |term: &TermRef<'_>| -> ExecResult<Option<u32>> {
        let stored = resolve::term_to_stored(query, term)?.ok_or_else(|| {
            ExecError::Semantic("ground data cannot contain variables".to_string())
        })?;
        Ok(atoms.lookup(&stored))
    };
    let Some(s) = lookup(&template.subject)? else {
        return Ok(None);
    };
    let Some(p) = lookup(&template.predicate)? else {
        return Ok(None);
    };
    let Some(o) = lookup(&template.object)? else {
        return Ok(None);
    };
    let g = match &template.graph {
        None => 0,
        Some(term) => match lookup(term)? {
            Some(g) => g,
            None => return Ok(None),
        },
    };
    Ok(Some(Quad::new(s, p, o, g)))
}

/// Instantiate a template against one solution row, as stored text.
/// `None` when a template variable is unbound in this row.
pub fn instantiate_texts(
    query: &Query<'_>,
    template: &QuadTemplate<'_>,
    row: &Row<'_>,
    blank: &mut dyn FnMut(&str) -> String,
) -> ExecResult<Option<[String; 4]>> {
    let mut term_text = |term: &TermRef<'_>| -> ExecResult<Option<String>> {
        Ok(match term {
            TermRef::Var(name) => row
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.to_stored()),
            TermRef::Blank(label) => Some(format!("_:{}", blank(label))),
            other => resolve::term_to_stored(query, other)?,
        })
    };
    let Some(s) = term_text(&template.subject)? else {
        return Ok(None);
    };
    let Some(p) = term_text(&template.predicate)? else {
        return Ok(None);
    };
    let Some(o) = term_text(&template.object)? else {
        return Ok(None);
    };
    let g = match &template.graph {
        None => String::new(),
        Some(term) => match term_text(term)? {
            Some(g) => g,
            None => return Ok(None),
        },
    };
    Ok(Some([s, p, o, g]))
}

/// As [`instantiate_texts`] but resolving to existing atoms for deletion.
fn instantiate_lookup(
    store: &Store,
    query: &Query<'_>,
    template: &QuadTemplate<'_>,
    row: &Row<'_>,
) -> ExecResult<Option<Quad>> {
    let mut no_blanks = |_: &str| String::new();
    let Some([s, p, o, g]) = instantiate_texts(query, template, row, &mut no_blanks)? else {
        return Ok(None);
    };
    let atoms = store.atoms();
    let (Some(s), Some(p), Some(o)) = (atoms.lookup(&s), atoms.lookup(&p), atoms.lookup(&o))
    else {
        return Ok(None);
    };
    let g = if g.is_empty() {
        0
    } else {
        match atoms.lookup(&g) {
            Some(g) => g,
            None => return Ok(None),
        }
    };
    Ok(Some(Quad::new(s, p, o, g)))
}

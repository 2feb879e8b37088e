//! RDFS/OWL forward-chaining materializer.
//!
//! The reasoner reads the default graph through the store's pattern-scan
//! interface, buffers the triples each pass infers (never mutating the
//! store mid-iteration), then commits the non-duplicate ones as one batch.
//! Passes repeat until a fixed point or the configured ceiling. `sameAs`
//! expands one step per pass; the fixpoint iteration closes it
//! transitively.

use crate::atom::AtomId;
use crate::store::{Quad, QuadPattern, Store, StoreError, StoreReader};
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, info};

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const RDFS_SUB_CLASS_OF: &str = "http://www.w3.org/2000/01/rdf-schema#subClassOf";
pub const RDFS_SUB_PROPERTY_OF: &str = "http://www.w3.org/2000/01/rdf-schema#subPropertyOf";
pub const RDFS_DOMAIN: &str = "http://www.w3.org/2000/01/rdf-schema#domain";
pub const RDFS_RANGE: &str = "http://www.w3.org/2000/01/rdf-schema#range";
pub const OWL_TRANSITIVE_PROPERTY: &str = "http://www.w3.org/2002/07/owl#TransitiveProperty";
pub const OWL_SYMMETRIC_PROPERTY: &str = "http://www.w3.org/2002/07/owl#SymmetricProperty";
pub const OWL_INVERSE_OF: &str = "http://www.w3.org/2002/07/owl#inverseOf";
pub const OWL_SAME_AS: &str = "http://www.w3.org/2002/07/owl#sameAs";
pub const OWL_EQUIVALENT_CLASS: &str = "http://www.w3.org/2002/07/owl#equivalentClass";
pub const OWL_EQUIVALENT_PROPERTY: &str = "http://www.w3.org/2002/07/owl#equivalentProperty";

/// Reasoning errors
#[derive(Error, Debug)]
pub enum ReasonError {
    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The pass ceiling was reached before a fixed point
    #[error("No fixed point after {0} passes")]
    NoFixedPoint(usize),
}

pub type ReasonResult<T> = Result<T, ReasonError>;

/// Rule selection bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSet(u32);

impl RuleSet {
    pub const SUBCLASS_TRANSITIVITY: RuleSet = RuleSet(1);
    pub const SUBCLASS_INSTANCE: RuleSet = RuleSet(1 << 1);
    pub const SUBPROPERTY_TRANSITIVITY: RuleSet = RuleSet(1 << 2);
    pub const SUBPROPERTY_INSTANCE: RuleSet = RuleSet(1 << 3);
    pub const DOMAIN: RuleSet = RuleSet(1 << 4);
    pub const RANGE: RuleSet = RuleSet(1 << 5);
    pub const TRANSITIVE_PROPERTY: RuleSet = RuleSet(1 << 6);
    pub const SYMMETRIC_PROPERTY: RuleSet = RuleSet(1 << 7);
    pub const INVERSE_OF: RuleSet = RuleSet(1 << 8);
    pub const SAME_AS: RuleSet = RuleSet(1 << 9);
    pub const EQUIVALENT_CLASS: RuleSet = RuleSet(1 << 10);
    pub const EQUIVALENT_PROPERTY: RuleSet = RuleSet(1 << 11);

    /// The RDFS entailment subset.
    pub const RDFS: RuleSet = RuleSet(
        Self::SUBCLASS_TRANSITIVITY.0
            | Self::SUBCLASS_INSTANCE.0
            | Self::SUBPROPERTY_TRANSITIVITY.0
            | Self::SUBPROPERTY_INSTANCE.0
            | Self::DOMAIN.0
            | Self::RANGE.0,
    );

    /// Every rule.
    pub const ALL: RuleSet = RuleSet((1 << 12) - 1);

    pub const fn empty() -> Self {
        RuleSet(0)
    }

    pub const fn contains(self, other: RuleSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: RuleSet) -> RuleSet {
        RuleSet(self.0 | other.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for RuleSet {
    type Output = RuleSet;

    fn bitor(self, rhs: RuleSet) -> RuleSet {
        self.union(rhs)
    }
}

/// Resolved vocabulary atom ids; `None` when a term never occurs, which
/// disables the rules that need it.
struct Vocabulary {
    rdf_type: Option<AtomId>,
    sub_class_of: Option<AtomId>,
    sub_property_of: Option<AtomId>,
    domain: Option<AtomId>,
    range: Option<AtomId>,
    transitive_property: Option<AtomId>,
    symmetric_property: Option<AtomId>,
    inverse_of: Option<AtomId>,
    same_as: Option<AtomId>,
    equivalent_class: Option<AtomId>,
    equivalent_property: Option<AtomId>,
}

impl Vocabulary {
    fn resolve(store: &Store) -> Self {
        let atoms = store.atoms();
        Self {
            rdf_type: atoms.lookup(RDF_TYPE),
            sub_class_of: atoms.lookup(RDFS_SUB_CLASS_OF),
            sub_property_of: atoms.lookup(RDFS_SUB_PROPERTY_OF),
            domain: atoms.lookup(RDFS_DOMAIN),
            range: atoms.lookup(RDFS_RANGE),
            transitive_property: atoms.lookup(OWL_TRANSITIVE_PROPERTY),
            symmetric_property: atoms.lookup(OWL_SYMMETRIC_PROPERTY),
            inverse_of: atoms.lookup(OWL_INVERSE_OF),
            same_as: atoms.lookup(OWL_SAME_AS),
            equivalent_class: atoms.lookup(OWL_EQUIVALENT_CLASS),
            equivalent_property: atoms.lookup(OWL_EQUIVALENT_PROPERTY),
        }
    }
}

/// Forward-chaining rule runner.
pub struct Reasoner {
    rules: RuleSet,
    max_passes: usize,
}

impl Reasoner {
    /// All rules, default pass ceiling.
    pub fn new() -> Self {
        Self {
            rules: RuleSet::ALL,
            max_passes: 32,
        }
    }

    pub fn with_rules(rules: RuleSet) -> Self {
        Self {
            rules,
            max_passes: 32,
        }
    }

    pub fn max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes.max(1);
        self
    }

    /// Materialize inferences into the default graph; returns the number
    /// of new triples added across all passes.
    pub fn materialize(&self, store: &Store) -> ReasonResult<usize> {
        let mut total = 0usize;
        for pass in 0..self.max_passes {
            let vocab = Vocabulary::resolve(store);
            // One read lock covers the whole pass; inferences buffer here.
            let inferred: Vec<Quad> = {
                let reader = store.reader();
                self.infer_pass(&reader, &vocab)?
            };
            if inferred.is_empty() {
                info!(passes = pass, total, "reasoner reached fixed point");
                return Ok(total);
            }

            let mut batch = store.batch();
            for quad in &inferred {
                batch.add(*quad)?;
            }
            let added = batch.commit()?;
            debug!(pass, candidates = inferred.len(), added, "reasoner pass");
            total += added;
            if added == 0 {
                info!(passes = pass + 1, total, "reasoner reached fixed point");
                return Ok(total);
            }
        }
        Err(ReasonError::NoFixedPoint(self.max_passes))
    }

    fn infer_pass(&self, reader: &StoreReader<'_>, vocab: &Vocabulary) -> ReasonResult<Vec<Quad>> {
        let mut fresh: FxHashSet<Quad> = FxHashSet::default();

        if self.rules.contains(RuleSet::SUBCLASS_TRANSITIVITY) {
            if let Some(p) = vocab.sub_class_of {
                self.transitive_rule(reader, p, &mut fresh)?;
            }
        }
        if self.rules.contains(RuleSet::SUBPROPERTY_TRANSITIVITY) {
            if let Some(p) = vocab.sub_property_of {
                self.transitive_rule(reader, p, &mut fresh)?;
            }
        }
        if self.rules.contains(RuleSet::SUBCLASS_INSTANCE) {
            if let (Some(sco), Some(ty)) = (vocab.sub_class_of, vocab.rdf_type) {
                for link in scan_by_predicate(reader, sco)? {
                    for instance in scan_pattern(
                        reader,
                        QuadPattern {
                            p: Some(ty),
                            o: Some(link.s),
                            g: Some(0),
                            ..Default::default()
                        },
                    )? {
                        push_fresh(reader, &mut fresh, Quad::new(instance.s, ty, link.o, 0))?;
                    }
                }
            }
        }
        if self.rules.contains(RuleSet::SUBPROPERTY_INSTANCE) {
            if let Some(spo) = vocab.sub_property_of {
                for link in scan_by_predicate(reader, spo)? {
                    for usage in scan_by_predicate(reader, link.s)? {
                        push_fresh(reader, &mut fresh, Quad::new(usage.s, link.o, usage.o, 0))?;
                    }
                }
            }
        }
        if self.rules.contains(RuleSet::DOMAIN) {
            if let (Some(dom), Some(ty)) = (vocab.domain, vocab.rdf_type) {
                for decl in scan_by_predicate(reader, dom)? {
                    for usage in scan_by_predicate(reader, decl.s)? {
                        push_fresh(reader, &mut fresh, Quad::new(usage.s, ty, decl.o, 0))?;
                    }
                }
            }
        }
        if self.rules.contains(RuleSet::RANGE) {
            if let (Some(range), Some(ty)) = (vocab.range, vocab.rdf_type) {
                for decl in scan_by_predicate(reader, range)? {
                    for usage in scan_by_predicate(reader, decl.s)? {
                        push_fresh(reader, &mut fresh, Quad::new(usage.o, ty, decl.o, 0))?;
                    }
                }
            }
        }
        if self.rules.contains(RuleSet::TRANSITIVE_PROPERTY) {
            if let (Some(tp), Some(ty)) = (vocab.transitive_property, vocab.rdf_type) {
                for decl in scan_pattern(
                    reader,
                    QuadPattern {
                        p: Some(ty),
                        o: Some(tp),
                        g: Some(0),
                        ..Default::default()
                    },
                )? {
                    self.transitive_rule(reader, decl.s, &mut fresh)?;
                }
            }
        }
        if self.rules.contains(RuleSet::SYMMETRIC_PROPERTY) {
            if let (Some(sp), Some(ty)) = (vocab.symmetric_property, vocab.rdf_type) {
                for decl in scan_pattern(
                    reader,
                    QuadPattern {
                        p: Some(ty),
                        o: Some(sp),
                        g: Some(0),
                        ..Default::default()
                    },
                )? {
                    for usage in scan_by_predicate(reader, decl.s)? {
                        push_fresh(reader, &mut fresh, Quad::new(usage.o, decl.s, usage.s, 0))?;
                    }
                }
            }
        }
        if self.rules.contains(RuleSet::INVERSE_OF) {
            if let Some(inv) = vocab.inverse_of {
                for link in scan_by_predicate(reader, inv)? {
                    for usage in scan_by_predicate(reader, link.s)? {
                        push_fresh(reader, &mut fresh, Quad::new(usage.o, link.o, usage.s, 0))?;
                    }
                    for usage in scan_by_predicate(reader, link.o)? {
                        push_fresh(reader, &mut fresh, Quad::new(usage.o, link.s, usage.s, 0))?;
                    }
                }
            }
        }
        if self.rules.contains(RuleSet::SAME_AS) {
            if let Some(same) = vocab.same_as {
                for link in scan_by_predicate(reader, same)? {
                    push_fresh(reader, &mut fresh, Quad::new(link.o, same, link.s, 0))?;
                    // One-step identity expansion; the fixpoint closes it.
                    for usage in scan_pattern(
                        reader,
                        QuadPattern {
                            s: Some(link.s),
                            g: Some(0),
                            ..Default::default()
                        },
                    )? {
                        if usage.p != same {
                            push_fresh(reader, &mut fresh, Quad::new(link.o, usage.p, usage.o, 0))?;
                        }
                    }
                    for usage in scan_pattern(
                        reader,
                        QuadPattern {
                            o: Some(link.s),
                            g: Some(0),
                            ..Default::default()
                        },
                    )? {
                        if usage.p != same {
                            push_fresh(reader, &mut fresh, Quad::new(usage.s, usage.p, link.o, 0))?;
                        }
                    }
                }
            }
        }
        if self.rules.contains(RuleSet::EQUIVALENT_CLASS) {
            if let (Some(eq), Some(sco)) = (vocab.equivalent_class, vocab.sub_class_of) {
                for link in scan_by_predicate(reader, eq)? {
                    push_fresh(reader, &mut fresh, Quad::new(link.s, sco, link.o, 0))?;
                    push_fresh(reader, &mut fresh, Quad::new(link.o, sco, link.s, 0))?;
                }
            }
        }
        if self.rules.contains(RuleSet::EQUIVALENT_PROPERTY) {
            if let (Some(eq), Some(spo)) = (vocab.equivalent_property, vocab.sub_property_of) {
                for link in scan_by_predicate(reader, eq)? {
                    push_fresh(reader, &mut fresh, Quad::new(link.s, spo, link.o, 0))?;
                    push_fresh(reader, &mut fresh, Quad::new(link.o, spo, link.s, 0))?;
                }
            }
        }

        Ok(fresh.into_iter().collect())
    }

    /// `(x p y), (y p z) -> (x p z)` for one predicate.
    fn transitive_rule(
        &self,
        reader: &StoreReader<'_>,
        p: AtomId,
        fresh: &mut FxHashSet<Quad>,
    ) -> ReasonResult<()> {
        for first in scan_by_predicate(reader, p)? {
            for second in scan_pattern(
                reader,
                QuadPattern {
                    s: Some(first.o),
                    p: Some(p),
                    g: Some(0),
                    ..Default::default()
                },
            )? {
                if first.s != second.o {
                    push_fresh(reader, fresh, Quad::new(first.s, p, second.o, 0))?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Reasoner {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_by_predicate(reader: &StoreReader<'_>, p: AtomId) -> ReasonResult<Vec<Quad>> {
    scan_pattern(
        reader,
        QuadPattern {
            p: Some(p),
            g: Some(0),
            ..Default::default()
        },
    )
}

fn scan_pattern(reader: &StoreReader<'_>, pattern: QuadPattern) -> ReasonResult<Vec<Quad>> {
    let mut out = Vec::new();
    for quad in reader.scan(pattern)? {
        out.push(quad?);
    }
    Ok(out)
}

/// Buffer a candidate unless it is already stored; subjects and predicates
/// must be valid for insertion.
fn push_fresh(
    reader: &StoreReader<'_>,
    fresh: &mut FxHashSet<Quad>,
    quad: Quad,
) -> ReasonResult<()> {
    if quad.s == 0 || quad.p == 0 {
        return Ok(());
    }
    if !reader.contains(&quad)? {
        fresh.insert(quad);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_subclass_transitivity_and_instances() {
        let (_dir, store) = open_store();
        store
            .add("http://x/Dog", RDFS_SUB_CLASS_OF, "http://x/Mammal", "")
            .unwrap();
        store
            .add("http://x/Mammal", RDFS_SUB_CLASS_OF, "http://x/Animal", "")
            .unwrap();
        store.add("http://x/rex", RDF_TYPE, "http://x/Dog", "").unwrap();

        Reasoner::with_rules(RuleSet::RDFS)
            .materialize(&store)
            .unwrap();

        for expected in [
            ("http://x/Dog", RDFS_SUB_CLASS_OF, "http://x/Animal"),
            ("http://x/rex", RDF_TYPE, "http://x/Mammal"),
            ("http://x/rex", RDF_TYPE, "http://x/Animal"),
        ] {
            let matched = store
                .query(&format!(
                    "ASK {{ <{}> <{}> <{}> }}",
                    expected.0, expected.1, expected.2
                ))
                .unwrap()
                .as_boolean();
            assert_eq!(matched, Some(true), "missing {:?}", expected);
        }
    }

    #[test]
    fn test_domain_and_range() {
        let (_dir, store) = open_store();
        store
            .add("http://x/owns", RDFS_DOMAIN, "http://x/Person", "")
            .unwrap();
        store
            .add("http://x/owns", RDFS_RANGE, "http://x/Thing", "")
            .unwrap();
        store
            .add("http://x/ann", "http://x/owns", "http://x/car", "")
            .unwrap();

        Reasoner::with_rules(RuleSet::DOMAIN | RuleSet::RANGE)
            .materialize(&store)
            .unwrap();

        assert_eq!(
            store
                .query(&format!("ASK {{ <http://x/ann> <{}> <http://x/Person> }}", RDF_TYPE))
                .unwrap()
                .as_boolean(),
            Some(true)
        );
        assert_eq!(
            store
                .query(&format!("ASK {{ <http://x/car> <{}> <http://x/Thing> }}", RDF_TYPE))
                .unwrap()
                .as_boolean(),
            Some(true)
        );
    }

    #[test]
    fn test_symmetric_and_inverse() {
        let (_dir, store) = open_store();
        store
            .add("http://x/knows", RDF_TYPE, OWL_SYMMETRIC_PROPERTY, "")
            .unwrap();
        store
            .add("http://x/a", "http://x/knows", "http://x/b", "")
            .unwrap();
        store
            .add("http://x/parentOf", OWL_INVERSE_OF, "http://x/childOf", "")
            .unwrap();
        store
            .add("http://x/p", "http://x/parentOf", "http://x/c", "")
            .unwrap();

        Reasoner::new().materialize(&store).unwrap();

        assert_eq!(
            store
                .query("ASK { <http://x/b> <http://x/knows> <http://x/a> }")
                .unwrap()
                .as_boolean(),
            Some(true)
        );
        assert_eq!(
            store
                .query("ASK { <http://x/c> <http://x/childOf> <http://x/p> }")
                .unwrap()
                .as_boolean(),
            Some(true)
        );
    }

    #[test]
    fn test_same_as_closes_transitively() {
        let (_dir, store) = open_store();
        store.add("http://x/a", OWL_SAME_AS, "http://x/b", "").unwrap();
        store.add("http://x/b", OWL_SAME_AS, "http://x/c", "").unwrap();
        store
            .add("http://x/a", "http://x/label", "\"thing\"", "")
            .unwrap();

        Reasoner::with_rules(RuleSet::SAME_AS)
            .materialize(&store)
            .unwrap();

        // The fixpoint propagates the label through both identities.
        assert_eq!(
            store
                .query("ASK { <http://x/c> <http://x/label> \"thing\" }")
                .unwrap()
                .as_boolean(),
            Some(true)
        );
    }

    #[test]
    fn test_fixed_point_on_cycles() {
        let (_dir, store) = open_store();
        store
            .add("http://x/A", RDFS_SUB_CLASS_OF, "http://x/B", "")
            .unwrap();
        store
            .add("http://x/B", RDFS_SUB_CLASS_OF, "http://x/A", "")
            .unwrap();

        // A subclass cycle must still reach a fixed point.
        let added = Reasoner::with_rules(RuleSet::SUBCLASS_TRANSITIVITY)
            .materialize(&store)
            .unwrap();
        assert_eq!(added, 0);
    }

    #[test]
    fn test_rule_set_bitmask() {
        let rules = RuleSet::DOMAIN | RuleSet::RANGE;
        assert!(rules.contains(RuleSet::DOMAIN));
        assert!(!rules.contains(RuleSet::SAME_AS));
        assert!(RuleSet::ALL.contains(RuleSet::RDFS));
    }
}

//! Multi-index quad store.
//!
//! A quad-store facade over three B+Trees (`spo.db`, `pos.db`, `osp.db`)
//! and the atom store. Every tree keys the quad in a different component
//! permutation, all with the graph id leading, so a scan restricted to one
//! graph is always a bounded prefix scan. Index selection picks the tree
//! whose key order binds the longest prefix of the pattern's bound
//! components.
//!
//! One reader-writer lock guards the index set: readers hold shared guards
//! for the lifetime of their iterators, batch commits hold it exclusively.
//! Commits are logged to a WAL first; open replays whatever a crash left
//! unapplied.

mod wal;

pub use wal::{Wal, WalEntry, WalError, WalOp, WalResult};

use crate::atom::{AtomError, AtomId, AtomStore};
use crate::index::{BTree, Key, TreeError, TreeScan};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Atom store error
    #[error(transparent)]
    Atom(#[from] AtomError),

    /// Index error
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// WAL error
    #[error(transparent)]
    Wal(#[from] WalError),

    /// Subject or predicate was empty
    #[error("Quad has an empty {0}")]
    EmptyComponent(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A quad of atom ids. `g == 0` denotes the default graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Quad {
    pub s: AtomId,
    pub p: AtomId,
    pub o: AtomId,
    pub g: AtomId,
}

impl Quad {
    pub fn new(s: AtomId, p: AtomId, o: AtomId, g: AtomId) -> Self {
        Self { s, p, o, g }
    }
}

/// A match pattern: each component either bound to an atom id or wildcard.
/// `g: None` matches quads in any graph; `g: Some(0)` only the default
/// graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuadPattern {
    pub s: Option<AtomId>,
    pub p: Option<AtomId>,
    pub o: Option<AtomId>,
    pub g: Option<AtomId>,
}

impl QuadPattern {
    pub fn matches(&self, quad: &Quad) -> bool {
        self.s.map_or(true, |s| s == quad.s)
            && self.p.map_or(true, |p| p == quad.p)
            && self.o.map_or(true, |o| o == quad.o)
            && self.g.map_or(true, |g| g == quad.g)
    }
}

/// Component permutation of an index file. The graph id always leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrder {
    /// (g, s, p, o)
    Spo,
    /// (g, p, o, s)
    Pos,
    /// (g, o, s, p)
    Osp,
}

impl IndexOrder {
    pub fn encode(self, quad: &Quad) -> Key {
        match self {
            IndexOrder::Spo => [quad.g, quad.s, quad.p, quad.o],
            IndexOrder::Pos => [quad.g, quad.p, quad.o, quad.s],
            IndexOrder::Osp => [quad.g, quad.o, quad.s, quad.p],
        }
    }

    pub fn decode(self, key: Key) -> Quad {
        match self {
            IndexOrder::Spo => Quad::new(key[1], key[2], key[3], key[0]),
            IndexOrder::Pos => Quad::new(key[3], key[1], key[2], key[0]),
            IndexOrder::Osp => Quad::new(key[2], key[3], key[1], key[0]),
        }
    }

    fn tag(self) -> u32 {
        match self {
            IndexOrder::Spo => 1,
            IndexOrder::Pos => 2,
            IndexOrder::Osp => 3,
        }
    }

    /// The pattern components in this index's key order (after the graph).
    fn components(self, pattern: &QuadPattern) -> [Option<AtomId>; 3] {
        match self {
            IndexOrder::Spo => [pattern.s, pattern.p, pattern.o],
            IndexOrder::Pos => [pattern.p, pattern.o, pattern.s],
            IndexOrder::Osp => [pattern.o, pattern.s, pattern.p],
        }
    }
}

/// The index set guarded by the store's reader-writer lock.
pub struct Indexes {
    spo: BTree,
    pos: BTree,
    osp: BTree,
    /// Approximate per-predicate cardinality, feeding the planner.
    predicates: FxHashMap<AtomId, u64>,
}

impl Indexes {
    fn tree(&self, order: IndexOrder) -> &BTree {
        match order {
            IndexOrder::Spo => &self.spo,
            IndexOrder::Pos => &self.pos,
            IndexOrder::Osp => &self.osp,
        }
    }

    /// Insert into all three trees; undone on partial failure.
    fn apply_add(&mut self, quad: &Quad) -> StoreResult<bool> {
        if !self.spo.insert(IndexOrder::Spo.encode(quad))? {
            return Ok(false);
        }
        if let Err(e) = self.pos.insert(IndexOrder::Pos.encode(quad)) {
            self.spo.remove(IndexOrder::Spo.encode(quad))?;
            return Err(e.into());
        }
        if let Err(e) = self.osp.insert(IndexOrder::Osp.encode(quad)) {
            self.spo.remove(IndexOrder::Spo.encode(quad))?;
            self.pos.remove(IndexOrder::Pos.encode(quad))?;
            return Err(e.into());
        }
        *self.predicates.entry(quad.p).or_insert(0) += 1;
        Ok(true)
    }

    /// Tombstone in all three trees; undone on partial failure.
    fn apply_remove(&mut self, quad: &Quad) -> StoreResult<bool> {
        if !self.spo.remove(IndexOrder::Spo.encode(quad))? {
            return Ok(false);
        }
        if let Err(e) = self.pos.remove(IndexOrder::Pos.encode(quad)) {
            self.spo.insert(IndexOrder::Spo.encode(quad))?;
            return Err(e.into());
        }
        if let Err(e) = self.osp.remove(IndexOrder::Osp.encode(quad)) {
            self.spo.insert(IndexOrder::Spo.encode(quad))?;
            self.pos.insert(IndexOrder::Pos.encode(quad))?;
            return Err(e.into());
        }
        if let Some(count) = self.predicates.get_mut(&quad.p) {
            *count = count.saturating_sub(1);
        }
        Ok(true)
    }
}

/// Summary counters for the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub quad_count: u64,
    pub atom_count: u32,
    pub total_bytes: u64,
    /// Tombstoned index entries awaiting compaction.
    pub tombstone_count: u64,
}

/// Persistent quad store.
pub struct Store {
    dir: PathBuf,
    atoms: Arc<AtomStore>,
    indexes: RwLock<Indexes>,
    wal: Mutex<Wal>,
}

impl Store {
    /// Open (or create) a store in `dir`, replaying any WAL tail left by a
    /// crash.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let atoms = Arc::new(AtomStore::open(&dir)?);

        let spo = BTree::open(dir.join("spo.db"), IndexOrder::Spo.tag())?;
        let pos = BTree::open(dir.join("pos.db"), IndexOrder::Pos.tag())?;
        let osp = BTree::open(dir.join("osp.db"), IndexOrder::Osp.tag())?;
        let mut indexes = Indexes {
            spo,
            pos,
            osp,
            predicates: FxHashMap::default(),
        };

        let wal = Wal::open(dir.join("store.wal"))?;
        let checkpoint = wal.last_checkpoint()?;
        let mut replayed = 0usize;
        wal.replay(checkpoint, |entry| {
            if let WalEntry::Batch { ops } = entry {
                for op in ops {
                    Self::replay_op(&atoms, &mut indexes, op).map_err(|e| {
                        warn!(?e, "WAL replay failed");
                        WalError::Io(std::io::Error::other(e.to_string()))
                    })?;
                    replayed += 1;
                }
            }
            Ok(())
        })?;
        if replayed > 0 {
            info!(replayed, "re-applied WAL operations");
        }

        Self::rebuild_histogram(&mut indexes)?;
        info!(path = %dir.display(), quads = indexes.spo.len(), "opened store");

        Ok(Self {
            dir,
            atoms,
            indexes: RwLock::new(indexes),
            wal: Mutex::new(wal),
        })
    }

    fn replay_op(atoms: &AtomStore, indexes: &mut Indexes, op: &WalOp) -> StoreResult<()> {
        match op {
            WalOp::Add {
                subject,
                predicate,
                object,
                graph,
            } => {
                let quad = Quad::new(
                    atoms.intern(subject)?,
                    atoms.intern(predicate)?,
                    atoms.intern(object)?,
                    atoms.intern(graph)?,
                );
                indexes.apply_add(&quad)?;
            }
            WalOp::Remove {
                subject,
                predicate,
                object,
                graph,
            } => {
                let quad = Quad::new(
                    atoms.intern(subject)?,
                    atoms.intern(predicate)?,
                    atoms.intern(object)?,
                    atoms.intern(graph)?,
                );
                indexes.apply_remove(&quad)?;
            }
        }
        Ok(())
    }

    /// Rebuild the in-memory predicate histogram from the POS tree, whose
    /// second key component is the predicate.
    fn rebuild_histogram(indexes: &mut Indexes) -> StoreResult<()> {
        let mut histogram: FxHashMap<AtomId, u64> = FxHashMap::default();
        for key in indexes.pos.scan([0; 4], 0)? {
            let key = key?;
            *histogram.entry(key[1]).or_insert(0) += 1;
        }
        indexes.predicates = histogram;
        Ok(())
    }

    /// The shared atom store.
    pub fn atoms(&self) -> &AtomStore {
        &self.atoms
    }

    /// Intern stored-form term text.
    pub fn intern(&self, text: &str) -> StoreResult<AtomId> {
        Ok(self.atoms.intern(text)?)
    }

    /// Acquire a read view; the shared lock is held until the reader drops.
    pub fn reader(&self) -> StoreReader<'_> {
        StoreReader {
            atoms: &self.atoms,
            guard: self.indexes.read(),
        }
    }

    /// Start an empty write batch.
    pub fn batch(&self) -> Batch<'_> {
        Batch {
            store: self,
            ops: Vec::new(),
        }
    }

    /// Insert one quad (a single-op batch). Returns true if it was new.
    pub fn add_quad(&self, quad: Quad) -> StoreResult<bool> {
        let mut batch = self.batch();
        batch.add(quad)?;
        Ok(batch.commit()? == 1)
    }

    /// Insert one quad given stored-form term text.
    pub fn add(&self, s: &str, p: &str, o: &str, g: &str) -> StoreResult<bool> {
        let quad = Quad::new(
            self.atoms.intern(s)?,
            self.atoms.intern(p)?,
            self.atoms.intern(o)?,
            self.atoms.intern(g)?,
        );
        self.add_quad(quad)
    }

    /// Remove one quad (a single-op batch). Returns true if it existed.
    pub fn remove_quad(&self, quad: Quad) -> StoreResult<bool> {
        let mut batch = self.batch();
        batch.remove(quad)?;
        Ok(batch.commit()? == 1)
    }

    /// Counters for diagnostics and planning.
    pub fn stats(&self) -> StoreStats {
        let indexes = self.indexes.read();
        StoreStats {
            quad_count: indexes.spo.len(),
            atom_count: self.atoms.atom_count(),
            total_bytes: self.atoms.total_bytes(),
            tombstone_count: indexes.spo.tombstone_count(),
        }
    }

    /// Rewrite the three trees without their tombstones. Holds the writer
    /// lock for the duration; readers opened before keep their view of the
    /// old files.
    pub fn compact(&self) -> StoreResult<()> {
        let mut indexes = self.indexes.write();
        let quads: Vec<Quad> = {
            let mut quads = Vec::new();
            for key in indexes.spo.scan([0; 4], 0)? {
                quads.push(IndexOrder::Spo.decode(key?));
            }
            quads
        };
        info!(live = quads.len(), "compacting indexes");

        for (order, name) in [
            (IndexOrder::Spo, "spo.db"),
            (IndexOrder::Pos, "pos.db"),
            (IndexOrder::Osp, "osp.db"),
        ] {
            let path = self.dir.join(name);
            let tmp = self.dir.join(format!("{}.compact", name));
            if tmp.exists() {
                std::fs::remove_file(&tmp)?;
            }
            let mut fresh = BTree::open(&tmp, order.tag())?;
            for quad in &quads {
                fresh.insert(order.encode(quad))?;
            }
            fresh.flush()?;
            drop(fresh);
            std::fs::rename(&tmp, &path)?;
            let reopened = BTree::open(&path, order.tag())?;
            match order {
                IndexOrder::Spo => indexes.spo = reopened,
                IndexOrder::Pos => indexes.pos = reopened,
                IndexOrder::Osp => indexes.osp = reopened,
            }
        }
        Ok(())
    }

    /// Flush everything and checkpoint the WAL.
    pub fn flush(&self) -> StoreResult<()> {
        self.atoms.flush()?;
        {
            let indexes = self.indexes.read();
            indexes.spo.flush()?;
            indexes.pos.flush()?;
            indexes.osp.flush()?;
        }
        let mut wal = self.wal.lock();
        let sequence = wal.sequence();
        wal.checkpoint(sequence)?;
        Ok(())
    }

    /// Directory this store lives in.
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(?e, "failed to flush store on drop");
        }
    }
}

/// Shared-lock read view over the store.
pub struct StoreReader<'a> {
    atoms: &'a AtomStore,
    guard: RwLockReadGuard<'a, Indexes>,
}

impl<'a> StoreReader<'a> {
    pub fn atoms(&self) -> &'a AtomStore {
        self.atoms
    }

    /// Scan quads matching `pattern` through the best index.
    pub fn scan(&self, pattern: QuadPattern) -> StoreResult<QuadIter<'_>> {
        let (order, prefix, prefix_len) = select_index(&pattern);
        debug!(?order, prefix_len, "index selected");
        let inner = self.guard.tree(order).scan(prefix, prefix_len)?;
        Ok(QuadIter {
            inner,
            order,
            pattern,
        })
    }

    /// Point containment check against the SPO tree.
    pub fn contains(&self, quad: &Quad) -> StoreResult<bool> {
        Ok(self.guard.spo.contains(&IndexOrder::Spo.encode(quad))?)
    }

    /// Distinct named graphs, by seek-skipping the SPO tree's leading
    /// component. The default graph (id 0) is not included.
    pub fn named_graphs(&self) -> StoreResult<Vec<AtomId>> {
        let mut graphs = Vec::new();
        let mut from = 1u32;
        loop {
            let mut scan = self.guard.spo.seek([from, 0, 0, 0])?;
            match scan.next() {
                Some(key) => {
                    let g = key?[0];
                    graphs.push(g);
                    match g.checked_add(1) {
                        Some(next) => from = next,
                        None => break,
                    }
                }
                None => break,
            }
        }
        Ok(graphs)
    }

    /// Approximate number of quads with predicate `p`.
    pub fn predicate_count(&self, p: AtomId) -> u64 {
        self.guard.predicates.get(&p).copied().unwrap_or(0)
    }

    /// Number of distinct predicates seen.
    pub fn predicate_kinds(&self) -> usize {
        self.guard.predicates.len().max(1)
    }

    pub fn quad_count(&self) -> u64 {
        self.guard.spo.len()
    }
}

/// Pick the index whose key order binds the longest prefix of the bound
/// components, per the selection table: S -> SPO, P (without S) -> POS,
/// O alone -> OSP, nothing -> SPO full scan.
fn select_index(pattern: &QuadPattern) -> (IndexOrder, Key, usize) {
    let order = if pattern.s.is_some() {
        IndexOrder::Spo
    } else if pattern.p.is_some() {
        IndexOrder::Pos
    } else if pattern.o.is_some() {
        IndexOrder::Osp
    } else {
        IndexOrder::Spo
    };

    let mut prefix = [0u32; 4];
    let mut prefix_len = 0;
    if let Some(g) = pattern.g {
        prefix[0] = g;
        prefix_len = 1;
        for component in order.components(pattern) {
            match component {
                Some(id) if prefix_len < 4 => {
                    prefix[prefix_len] = id;
                    prefix_len += 1;
                }
                _ => break,
            }
        }
    }
    (order, prefix, prefix_len)
}

/// Iterator over quads matching a pattern. Components bound in the pattern
/// but outside the scan prefix are filtered here.
pub struct QuadIter<'a> {
    inner: TreeScan<'a>,
    order: IndexOrder,
    pattern: QuadPattern,
}

impl Iterator for QuadIter<'_> {
    type Item = StoreResult<Quad>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.inner.by_ref() {
            match key {
                Ok(key) => {
                    let quad = self.order.decode(key);
                    if self.pattern.matches(&quad) {
                        return Some(Ok(quad));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}

/// Accumulated write batch; applied all-or-nothing under the exclusive
/// lock on commit, discarded on rollback/drop.
pub struct Batch<'a> {
    store: &'a Store,
    ops: Vec<BatchOp>,
}

#[derive(Debug, Clone, Copy)]
enum BatchOp {
    Add(Quad),
    Remove(Quad),
}

impl Batch<'_> {
    /// Queue an insert. Subject and predicate must be non-empty.
    pub fn add(&mut self, quad: Quad) -> StoreResult<()> {
        if quad.s == 0 {
            return Err(StoreError::EmptyComponent("subject"));
        }
        if quad.p == 0 {
            return Err(StoreError::EmptyComponent("predicate"));
        }
        self.ops.push(BatchOp::Add(quad));
        Ok(())
    }

    /// Queue an insert of stored-form term text.
    pub fn add_text(&mut self, s: &str, p: &str, o: &str, g: &str) -> StoreResult<()> {
        let atoms = self.store.atoms();
        let quad = Quad::new(
            atoms.intern(s)?,
            atoms.intern(p)?,
            atoms.intern(o)?,
            atoms.intern(g)?,
        );
        self.add(quad)
    }

    /// Queue a removal.
    pub fn remove(&mut self, quad: Quad) -> StoreResult<()> {
        self.ops.push(BatchOp::Remove(quad));
        Ok(())
    }

    /// Queued operation count.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Discard the batch.
    pub fn rollback(self) {
        debug!(ops = self.ops.len(), "batch rolled back");
    }

    /// Apply the batch atomically; returns the number of operations that
    /// changed the store. On error every already-applied operation is
    /// undone before the lock is released.
    pub fn commit(self) -> StoreResult<usize> {
        if self.ops.is_empty() {
            return Ok(0);
        }

        // Resolve term text for the WAL before taking any lock.
        let atoms = self.store.atoms();
        let mut wal_ops = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let quad = match op {
                BatchOp::Add(q) | BatchOp::Remove(q) => q,
            };
            let resolve = |id: AtomId| -> StoreResult<String> {
                if id == 0 {
                    Ok(String::new())
                } else {
                    Ok(atoms.resolve(id)?)
                }
            };
            let (subject, predicate, object, graph) = (
                resolve(quad.s)?,
                resolve(quad.p)?,
                resolve(quad.o)?,
                resolve(quad.g)?,
            );
            wal_ops.push(match op {
                BatchOp::Add(_) => WalOp::Add {
                    subject,
                    predicate,
                    object,
                    graph,
                },
                BatchOp::Remove(_) => WalOp::Remove {
                    subject,
                    predicate,
                    object,
                    graph,
                },
            });
        }

        self.store.wal.lock().append(WalEntry::Batch { ops: wal_ops })?;

        let mut indexes = self.store.indexes.write();
        let mut applied: Vec<(BatchOp, bool)> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let result = match op {
                BatchOp::Add(quad) => indexes.apply_add(quad),
                BatchOp::Remove(quad) => indexes.apply_remove(quad),
            };
            match result {
                Ok(changed) => applied.push((*op, changed)),
                Err(e) => {
                    warn!(?e, "batch failed; undoing applied operations");
                    for (done, changed) in applied.iter().rev() {
                        if !*changed {
                            continue;
                        }
                        let undo = match done {
                            BatchOp::Add(quad) => indexes.apply_remove(quad),
                            BatchOp::Remove(quad) => indexes.apply_add(quad),
                        };
                        if let Err(undo_err) = undo {
                            tracing::error!(?undo_err, "batch undo failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        let changed = applied.iter().filter(|(_, c)| *c).count();
        debug!(ops = applied.len(), changed, "batch committed");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quad(store: &Store, s: &str, p: &str, o: &str, g: &str) -> Quad {
        Quad::new(
            store.intern(s).unwrap(),
            store.intern(p).unwrap(),
            store.intern(o).unwrap(),
            store.intern(g).unwrap(),
        )
    }

    #[test]
    fn test_add_and_scan() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let a = quad(&store, "a", "b", "c", "");
        assert!(store.add_quad(a).unwrap());
        assert!(!store.add_quad(a).unwrap());

        let reader = store.reader();
        assert!(reader.contains(&a).unwrap());
        assert_eq!(reader.quad_count(), 1);
    }

    #[test]
    fn test_index_consistency() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        // Scenario from the storage contract: (a,b,c), (a,b,d), (a,e,c).
        store.add("a", "b", "c", "").unwrap();
        store.add("a", "b", "d", "").unwrap();
        store.add("a", "e", "c", "").unwrap();

        let a = store.atoms().lookup("a").unwrap();
        let b = store.atoms().lookup("b").unwrap();
        let c = store.atoms().lookup("c").unwrap();

        let reader = store.reader();
        let by_p: Vec<Quad> = reader
            .scan(QuadPattern {
                p: Some(b),
                g: Some(0),
                ..Default::default()
            })
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(by_p.len(), 2);

        let by_o: Vec<Quad> = reader
            .scan(QuadPattern {
                o: Some(c),
                g: Some(0),
                ..Default::default()
            })
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(by_o.len(), 2);

        let by_s: Vec<Quad> = reader
            .scan(QuadPattern {
                s: Some(a),
                g: Some(0),
                ..Default::default()
            })
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(by_s.len(), 3);
    }

    #[test]
    fn test_graphs_are_separate() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store.add("s", "p", "o", "").unwrap();
        store.add("s", "p", "o", "g1").unwrap();

        let reader = store.reader();
        let default_only: Vec<Quad> = reader
            .scan(QuadPattern {
                g: Some(0),
                ..Default::default()
            })
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(default_only.len(), 1);

        let graphs = reader.named_graphs().unwrap();
        assert_eq!(graphs.len(), 1);
        assert_eq!(
            store.atoms().resolve(graphs[0]).unwrap(),
            "g1".to_string()
        );
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let q = quad(&store, "s", "p", "o", "");
        store.add_quad(q).unwrap();
        assert!(store.remove_quad(q).unwrap());
        assert!(!store.remove_quad(q).unwrap());
        assert_eq!(store.stats().quad_count, 0);

        let reader = store.reader();
        let all: Vec<Quad> = reader
            .scan(QuadPattern::default())
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn test_empty_subject_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let o = store.intern("o").unwrap();
        let p = store.intern("p").unwrap();

        let mut batch = store.batch();
        assert!(matches!(
            batch.add(Quad::new(0, p, o, 0)),
            Err(StoreError::EmptyComponent("subject"))
        ));
    }

    #[test]
    fn test_batch_rollback_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.add("s", "p", "o", "").unwrap();

        let mut batch = store.batch();
        batch
            .add(quad(&store, "s2", "p2", "o2", ""))
            .unwrap();
        batch.rollback();

        assert_eq!(store.stats().quad_count, 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.add("s", "p", "o", "").unwrap();
            store.add("s", "p", "o2", "g").unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.stats().quad_count, 2);
        let p = store.atoms().lookup("p").unwrap();
        assert_eq!(store.reader().predicate_count(p), 2);
    }

    #[test]
    fn test_batch_is_atomic_for_readers() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut batch = store.batch();
        for i in 0..10 {
            batch
                .add(quad(&store, &format!("s{}", i), "p", "o", ""))
                .unwrap();
        }
        // Reader opened before commit sees nothing from the batch.
        {
            let reader = store.reader();
            assert_eq!(reader.quad_count(), 0);
        }
        assert_eq!(batch.commit().unwrap(), 10);
        assert_eq!(store.reader().quad_count(), 10);
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for i in 0..50 {
            store.add(&format!("s{}", i), "p", "o", "").unwrap();
        }
        for i in 0..25 {
            let q = quad(&store, &format!("s{}", i), "p", "o", "");
            store.remove_quad(q).unwrap();
        }
        assert_eq!(store.stats().tombstone_count, 25);

        store.compact().unwrap();
        let stats = store.stats();
        assert_eq!(stats.quad_count, 25);
        assert_eq!(stats.tombstone_count, 0);

        let kept = quad(&store, "s30", "p", "o", "");
        let gone = quad(&store, "s3", "p", "o", "");
        let reader = store.reader();
        assert!(reader.contains(&kept).unwrap());
        assert!(!reader.contains(&gone).unwrap());
    }

    #[test]
    fn test_predicate_histogram() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store.add("a", "p", "x", "").unwrap();
        store.add("b", "p", "y", "").unwrap();
        store.add("c", "q", "z", "").unwrap();

        let p = store.atoms().lookup("p").unwrap();
        let q = store.atoms().lookup("q").unwrap();
        let reader = store.reader();
        assert_eq!(reader.predicate_count(p), 2);
        assert_eq!(reader.predicate_count(q), 1);
    }
}

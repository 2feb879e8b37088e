//! B+Tree over a memory-mapped file.
//!
//! Page 0 is a metadata page; every other page is an internal node or a
//! leaf. Leaves form a singly-linked list in key order for sequential
//! scans. Deleted keys are tombstoned in place and skipped on read; the
//! space is reclaimed only by offline compaction.
//!
//! The tree is single-writer, multi-reader: all mutation goes through
//! `&mut self` (the store holds its writer lock for the duration of a
//! split chain), reads and scans borrow `&self`.

use super::page::{
    read_entries, Entry, PageMut, PageRef, ENTRY_SIZE, FLAG_PRESENT, FLAG_TOMBSTONE, MAX_ENTRIES,
    PAGE_SIZE,
};
use super::{Key, TreeError, TreeResult};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

const META_MAGIC: &[u8; 8] = b"TARKABT1";
const FORMAT_VERSION: u32 = 1;
const INITIAL_PAGES: u64 = 16;

const OFF_VERSION: usize = 8;
const OFF_ORDER_TAG: usize = 12;
const OFF_ROOT: usize = 16;
const OFF_PAGE_COUNT: usize = 20;
const OFF_HEIGHT: usize = 24;
const OFF_LIVE: usize = 28;
const OFF_TOMBSTONES: usize = 36;

/// Persistent ordered index over 4-component keys.
pub struct BTree {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
}

impl BTree {
    /// Open or create the tree at `path`. `order_tag` names the component
    /// permutation this file holds; a mismatch on open is a corruption
    /// error, not a silent reinterpretation.
    pub fn open(path: impl AsRef<Path>, order_tag: u32) -> TreeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let fresh = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < PAGE_SIZE as u64 {
            file.set_len(INITIAL_PAGES * PAGE_SIZE as u64)?;
        }
        // SAFETY: the file is open read/write and set_len above guarantees
        // the mapped range is allocated.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut tree = Self { path, file, mmap };

        if fresh {
            tree.mmap[..8].copy_from_slice(META_MAGIC);
            tree.write_meta_u32(OFF_VERSION, FORMAT_VERSION);
            tree.write_meta_u32(OFF_ORDER_TAG, order_tag);
            tree.write_meta_u32(OFF_ROOT, 1);
            tree.write_meta_u32(OFF_PAGE_COUNT, 2);
            tree.write_meta_u32(OFF_HEIGHT, 1);
            tree.write_meta_u64(OFF_LIVE, 0);
            tree.write_meta_u64(OFF_TOMBSTONES, 0);
            tree.page_mut(1)?.init(true);
            tree.mmap.flush()?;
        } else {
            if &tree.mmap[..8] != META_MAGIC {
                return Err(TreeError::CorruptMeta(
                    tree.path.clone(),
                    "bad magic".to_string(),
                ));
            }
            if tree.read_meta_u32(OFF_ORDER_TAG) != order_tag {
                return Err(TreeError::CorruptMeta(
                    tree.path.clone(),
                    "key-order tag mismatch".to_string(),
                ));
            }
            let page_count = tree.read_meta_u32(OFF_PAGE_COUNT);
            let root = tree.read_meta_u32(OFF_ROOT);
            if page_count < 2 || root == 0 || root >= page_count {
                return Err(TreeError::CorruptMeta(
                    tree.path.clone(),
                    format!("implausible meta: root={} pages={}", root, page_count),
                ));
            }
        }
        Ok(tree)
    }

    /// Insert `key`; returns false if it was already present.
    pub fn insert(&mut self, key: Key) -> TreeResult<bool> {
        let (leaf_id, stack) = self.descend(&key)?;
        let (found, slot, flag, count) = {
            let page = self.page(leaf_id)?;
            match page.search(&key) {
                Ok(slot) => (true, slot, page.flag(slot), page.entry_count()),
                Err(slot) => (false, slot, 0, page.entry_count()),
            }
        };

        if found {
            if flag == FLAG_TOMBSTONE {
                self.page_mut(leaf_id)?.set_flag(slot, FLAG_PRESENT);
                self.write_meta_u64(OFF_LIVE, self.read_meta_u64(OFF_LIVE) + 1);
                self.write_meta_u64(
                    OFF_TOMBSTONES,
                    self.read_meta_u64(OFF_TOMBSTONES).saturating_sub(1),
                );
                return Ok(true);
            }
            return Ok(false);
        }

        if count < MAX_ENTRIES {
            self.page_mut(leaf_id)?
                .insert_entry(slot, key, 0, FLAG_PRESENT);
        } else {
            self.split_leaf_and_insert(leaf_id, stack, key)?;
        }
        self.write_meta_u64(OFF_LIVE, self.read_meta_u64(OFF_LIVE) + 1);
        Ok(true)
    }

    /// Tombstone `key`; returns false if it was not present.
    pub fn remove(&mut self, key: Key) -> TreeResult<bool> {
        let (leaf_id, _) = self.descend(&key)?;
        let slot = {
            let page = self.page(leaf_id)?;
            match page.search(&key) {
                Ok(slot) if page.flag(slot) == FLAG_PRESENT => Some(slot),
                _ => None,
            }
        };
        let Some(slot) = slot else { return Ok(false) };
        self.page_mut(leaf_id)?.set_flag(slot, FLAG_TOMBSTONE);
        self.write_meta_u64(OFF_LIVE, self.read_meta_u64(OFF_LIVE).saturating_sub(1));
        self.write_meta_u64(OFF_TOMBSTONES, self.read_meta_u64(OFF_TOMBSTONES) + 1);
        Ok(true)
    }

    /// Point lookup.
    pub fn contains(&self, key: &Key) -> TreeResult<bool> {
        let (leaf_id, _) = self.descend(key)?;
        let page = self.page(leaf_id)?;
        Ok(match page.search(key) {
            Ok(slot) => page.flag(slot) == FLAG_PRESENT,
            Err(_) => false,
        })
    }

    /// Scan keys whose first `prefix_len` components equal `prefix`.
    /// `prefix_len == 0` is a full forward scan.
    pub fn scan(&self, prefix: Key, prefix_len: usize) -> TreeResult<TreeScan<'_>> {
        let mut start = [0u32; 4];
        start[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        self.start_scan(start, prefix, prefix_len)
    }

    /// Forward scan from the first key >= `start`.
    pub fn seek(&self, start: Key) -> TreeResult<TreeScan<'_>> {
        self.start_scan(start, [0; 4], 0)
    }

    /// Live (non-tombstoned) entries.
    pub fn len(&self) -> u64 {
        self.read_meta_u64(OFF_LIVE)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tombstoned entries awaiting compaction.
    pub fn tombstone_count(&self) -> u64 {
        self.read_meta_u64(OFF_TOMBSTONES)
    }

    pub fn flush(&self) -> TreeResult<()> {
        self.mmap.flush()?;
        Ok(())
    }

    fn start_scan(&self, start: Key, prefix: Key, prefix_len: usize) -> TreeResult<TreeScan<'_>> {
        let mut page_id = self.root();
        loop {
            let page = self.page(page_id)?;
            if page.is_leaf() {
                let slot = match page.search(&start) {
                    Ok(slot) => slot,
                    Err(slot) => slot,
                };
                return Ok(TreeScan {
                    tree: self,
                    page: page_id,
                    slot,
                    prefix,
                    prefix_len,
                });
            }
            page_id = page.child(page.descend_slot(&start));
        }
    }

    /// Walk from the root to the leaf covering `key`, recording the path of
    /// internal pages for split propagation.
    fn descend(&self, key: &Key) -> TreeResult<(u32, Vec<u32>)> {
        let mut stack = Vec::new();
        let mut page_id = self.root();
        loop {
            let page = self.page(page_id)?;
            if page.is_leaf() {
                return Ok((page_id, stack));
            }
            stack.push(page_id);
            page_id = page.child(page.descend_slot(key));
        }
    }

    fn split_leaf_and_insert(&mut self, leaf_id: u32, stack: Vec<u32>, key: Key) -> TreeResult<()> {
        let (mut entries, next_leaf, parent) = {
            let page = self.page(leaf_id)?;
            (read_entries(page), page.next_leaf(), page.parent())
        };
        let slot = entries
            .binary_search_by(|e| e.key.cmp(&key))
            .unwrap_or_else(|i| i);
        entries.insert(
            slot,
            Entry {
                key,
                child: 0,
                flag: FLAG_PRESENT,
            },
        );

        let mid = entries.len() / 2;
        let right_id = self.allocate_page(true)?;
        let separator = entries[mid].key;

        {
            let mut left = self.page_mut(leaf_id)?;
            for (i, e) in entries[..mid].iter().enumerate() {
                left.write_entry(i, e.key, e.child, e.flag);
            }
            left.truncate_entries(mid);
            left.set_next_leaf(right_id);
        }
        {
            let mut right = self.page_mut(right_id)?;
            for (i, e) in entries[mid..].iter().enumerate() {
                right.write_entry(i, e.key, e.child, e.flag);
            }
            right.set_entry_count(entries.len() - mid);
            right.set_next_leaf(next_leaf);
            right.set_parent(parent);
        }
        debug!(
            path = %self.path.display(),
            left = leaf_id,
            right = right_id,
            "split leaf"
        );
        self.insert_into_parent(stack, leaf_id, separator, right_id)
    }

    /// Insert the (separator, right) pair produced by a split into the
    /// parent, splitting internal nodes recursively; grows the tree at the
    /// root.
    fn insert_into_parent(
        &mut self,
        mut stack: Vec<u32>,
        mut left_id: u32,
        mut separator: Key,
        mut right_id: u32,
    ) -> TreeResult<()> {
        loop {
            let Some(parent_id) = stack.pop() else {
                // The split page was the root: grow the tree by one level.
                let new_root = self.allocate_page(false)?;
                let left_min = self.page(left_id)?.key(0);
                {
                    let mut root = self.page_mut(new_root)?;
                    root.insert_entry(0, left_min, left_id, 0);
                    root.insert_entry(1, separator, right_id, 0);
                }
                self.page_mut(left_id)?.set_parent(new_root);
                self.page_mut(right_id)?.set_parent(new_root);
                self.write_meta_u32(OFF_ROOT, new_root);
                self.write_meta_u32(OFF_HEIGHT, self.read_meta_u32(OFF_HEIGHT) + 1);
                debug!(path = %self.path.display(), root = new_root, "root split");
                return Ok(());
            };

            let (slot, count) = {
                let page = self.page(parent_id)?;
                let slot = match page.search(&separator) {
                    Ok(slot) => slot,
                    Err(slot) => slot,
                };
                (slot, page.entry_count())
            };

            if count < MAX_ENTRIES {
                self.page_mut(parent_id)?
                    .insert_entry(slot, separator, right_id, 0);
                self.page_mut(right_id)?.set_parent(parent_id);
                return Ok(());
            }

            // Internal node overflow: split it and keep propagating.
            let mut entries = read_entries(self.page(parent_id)?);
            entries.insert(
                slot,
                Entry {
                    key: separator,
                    child: right_id,
                    flag: 0,
                },
            );
            let mid = entries.len() / 2;
            let new_right = self.allocate_page(false)?;
            let promoted = entries[mid].key;

            {
                let mut left = self.page_mut(parent_id)?;
                for (i, e) in entries[..mid].iter().enumerate() {
                    left.write_entry(i, e.key, e.child, e.flag);
                }
                left.truncate_entries(mid);
            }
            {
                let mut right = self.page_mut(new_right)?;
                for (i, e) in entries[mid..].iter().enumerate() {
                    right.write_entry(i, e.key, e.child, e.flag);
                }
                right.set_entry_count(entries.len() - mid);
            }
            for e in &entries[mid..] {
                self.page_mut(e.child)?.set_parent(new_right);
            }
            if entries[..mid].iter().any(|e| e.child == right_id) {
                self.page_mut(right_id)?.set_parent(parent_id);
            }

            left_id = parent_id;
            separator = promoted;
            right_id = new_right;
        }
    }

    fn allocate_page(&mut self, leaf: bool) -> TreeResult<u32> {
        let id = self.read_meta_u32(OFF_PAGE_COUNT);
        let required = (u64::from(id) + 1) * PAGE_SIZE as u64;
        if required > self.mmap.len() as u64 {
            let mut new_len = self.mmap.len() as u64;
            while new_len < required {
                new_len = new_len.checked_mul(2).ok_or_else(|| {
                    TreeError::CapacityExhausted("index file size overflow".to_string())
                })?;
            }
            debug!(path = %self.path.display(), new_len, "growing index file");
            self.mmap.flush()?;
            self.file
                .set_len(new_len)
                .map_err(|e| TreeError::CapacityExhausted(e.to_string()))?;
            // SAFETY: the file was just extended to cover the new mapping;
            // the caller holds `&mut self`, so no other view exists.
            self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        }
        self.write_meta_u32(OFF_PAGE_COUNT, id + 1);
        self.page_mut(id)?.init(leaf);
        Ok(id)
    }

    fn root(&self) -> u32 {
        self.read_meta_u32(OFF_ROOT)
    }

    fn page(&self, id: u32) -> TreeResult<PageRef<'_>> {
        let page_count = self.read_meta_u32(OFF_PAGE_COUNT);
        if id == 0 || id >= page_count {
            return Err(TreeError::PageCorrupt {
                page: id,
                path: self.path.clone(),
                reason: format!("page id out of range (pages={})", page_count),
            });
        }
        let at = id as usize * PAGE_SIZE;
        let page = PageRef::new(&self.mmap[at..at + PAGE_SIZE]);
        if page.flags() & !1 != 0 || page.entry_count() > MAX_ENTRIES {
            return Err(TreeError::PageCorrupt {
                page: id,
                path: self.path.clone(),
                reason: format!(
                    "implausible header: flags={:#x} entries={}",
                    page.flags(),
                    page.entry_count()
                ),
            });
        }
        Ok(page)
    }

    fn page_mut(&mut self, id: u32) -> TreeResult<PageMut<'_>> {
        let page_count = self.read_meta_u32(OFF_PAGE_COUNT);
        if id == 0 || id >= page_count {
            return Err(TreeError::PageCorrupt {
                page: id,
                path: self.path.clone(),
                reason: format!("page id out of range (pages={})", page_count),
            });
        }
        let at = id as usize * PAGE_SIZE;
        Ok(PageMut::new(&mut self.mmap[at..at + PAGE_SIZE]))
    }

    fn read_meta_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.mmap[at],
            self.mmap[at + 1],
            self.mmap[at + 2],
            self.mmap[at + 3],
        ])
    }

    fn write_meta_u32(&mut self, at: usize, v: u32) {
        self.mmap[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn read_meta_u64(&self, at: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.mmap[at..at + 8]);
        u64::from_le_bytes(buf)
    }

    fn write_meta_u64(&mut self, at: usize, v: u64) {
        self.mmap[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }
}

/// Forward scan over live keys, optionally bounded by a component prefix.
pub struct TreeScan<'a> {
    tree: &'a BTree,
    /// Current leaf page; 0 when exhausted (page 0 is the meta page).
    page: u32,
    slot: usize,
    prefix: Key,
    prefix_len: usize,
}

impl Iterator for TreeScan<'_> {
    type Item = TreeResult<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.page != 0 {
            let page = match self.tree.page(self.page) {
                Ok(page) => page,
                Err(e) => {
                    self.page = 0;
                    return Some(Err(e));
                }
            };
            if self.slot >= page.entry_count() {
                self.page = page.next_leaf();
                self.slot = 0;
                continue;
            }
            let key = page.key(self.slot);
            let flag = page.flag(self.slot);
            self.slot += 1;
            if self.prefix_len > 0 {
                let bound = &self.prefix[..self.prefix_len];
                match key[..self.prefix_len].cmp(bound) {
                    std::cmp::Ordering::Greater => {
                        self.page = 0;
                        return None;
                    }
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => {}
                }
            }
            if flag == FLAG_PRESENT {
                return Some(Ok(key));
            }
        }
        None
    }
}

// Entry size must divide the page payload evenly for the fixed-slot layout.
const _: () = assert!((PAGE_SIZE - super::page::PAGE_HEADER) % ENTRY_SIZE == 0);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tree(dir: &TempDir) -> BTree {
        BTree::open(dir.path().join("t.db"), 7).unwrap()
    }

    #[test]
    fn test_insert_lookup() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);

        assert!(tree.insert([1, 2, 3, 0]).unwrap());
        assert!(!tree.insert([1, 2, 3, 0]).unwrap());
        assert!(tree.contains(&[1, 2, 3, 0]).unwrap());
        assert!(!tree.contains(&[1, 2, 4, 0]).unwrap());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_remove_and_resurrect() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);

        tree.insert([5, 5, 5, 5]).unwrap();
        assert!(tree.remove([5, 5, 5, 5]).unwrap());
        assert!(!tree.contains(&[5, 5, 5, 5]).unwrap());
        assert!(!tree.remove([5, 5, 5, 5]).unwrap());
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.tombstone_count(), 1);

        assert!(tree.insert([5, 5, 5, 5]).unwrap());
        assert!(tree.contains(&[5, 5, 5, 5]).unwrap());
        assert_eq!(tree.tombstone_count(), 0);
    }

    #[test]
    fn test_many_inserts_force_splits() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);

        // Insert in a scrambled order so splits hit both halves.
        let n = 5000u32;
        for i in 0..n {
            let k = (i.wrapping_mul(2_654_435_761)) % n;
            tree.insert([k, k % 17, k % 5, 0]).unwrap();
        }
        for i in 0..n {
            let k = (i.wrapping_mul(2_654_435_761)) % n;
            assert!(tree.contains(&[k, k % 17, k % 5, 0]).unwrap(), "key {}", k);
        }

        // A full scan yields everything exactly once, in order.
        let keys: Vec<Key> = tree
            .scan([0; 4], 0)
            .unwrap()
            .collect::<TreeResult<Vec<_>>>()
            .unwrap();
        assert_eq!(keys.len() as u64, tree.len());
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_prefix_scan() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);

        tree.insert([1, 10, 100, 0]).unwrap();
        tree.insert([1, 10, 101, 0]).unwrap();
        tree.insert([1, 11, 100, 0]).unwrap();
        tree.insert([2, 10, 100, 0]).unwrap();

        let hits: Vec<Key> = tree
            .scan([1, 10, 0, 0], 2)
            .unwrap()
            .collect::<TreeResult<Vec<_>>>()
            .unwrap();
        assert_eq!(hits, vec![[1, 10, 100, 0], [1, 10, 101, 0]]);

        let hits: Vec<Key> = tree
            .scan([1, 0, 0, 0], 1)
            .unwrap()
            .collect::<TreeResult<Vec<_>>>()
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_scan_skips_tombstones() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);

        tree.insert([1, 1, 1, 0]).unwrap();
        tree.insert([1, 1, 2, 0]).unwrap();
        tree.remove([1, 1, 1, 0]).unwrap();

        let hits: Vec<Key> = tree
            .scan([1, 0, 0, 0], 1)
            .unwrap()
            .collect::<TreeResult<Vec<_>>>()
            .unwrap();
        assert_eq!(hits, vec![[1, 1, 2, 0]]);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut tree = open_tree(&dir);
            for i in 0..100 {
                tree.insert([i, 0, 0, 0]).unwrap();
            }
            tree.flush().unwrap();
        }
        let tree = open_tree(&dir);
        assert_eq!(tree.len(), 100);
        assert!(tree.contains(&[42, 0, 0, 0]).unwrap());
    }

    #[test]
    fn test_order_tag_mismatch() {
        let dir = TempDir::new().unwrap();
        {
            BTree::open(dir.path().join("t.db"), 7).unwrap();
        }
        assert!(matches!(
            BTree::open(dir.path().join("t.db"), 8),
            Err(TreeError::CorruptMeta(_, _))
        ));
    }

    #[test]
    fn test_seek() {
        let dir = TempDir::new().unwrap();
        let mut tree = open_tree(&dir);
        for g in [3u32, 7, 9] {
            tree.insert([g, 1, 1, 1]).unwrap();
            tree.insert([g, 2, 2, 2]).unwrap();
        }

        let mut scan = tree.seek([4, 0, 0, 0]).unwrap();
        assert_eq!(scan.next().unwrap().unwrap(), [7, 1, 1, 1]);
    }
}

//! Persistent atom store: interns UTF-8 strings to dense 32-bit ids.
//!
//! Three memory-mapped files back the store:
//! - `atoms.data`: a 1 KiB metadata header, then length-prefixed UTF-8
//!   records in id order;
//! - `atoms.index`: a fixed open-addressed hash table (FNV-1a, bounded
//!   linear probing) mapping bytes to ids;
//! - `atoms.offset`: a flat id -> data-offset directory for O(1) fetch.
//!
//! Interning is `&self` and safe to call from multiple threads: buckets are
//! claimed with a compare-and-swap on the id field, the remaining fields are
//! published with release ordering. The data map grows under a write lock;
//! the index and offset maps are fixed-size and never remapped.

use memmap2::MmapMut;
use parking_lot::{RwLock, RwLockReadGuard};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Interned atom id. Id 0 is reserved and denotes "empty/absent".
pub type AtomId = u32;

const MAGIC: &[u8; 8] = b"ATOMSTOR";
const FORMAT_VERSION: u32 = 1;
/// Reserved metadata prefix of `atoms.data`.
const HEADER_SIZE: u64 = 1024;
/// Compiled-in hash table capacity; must match between writer and reader.
const BUCKET_COUNT: usize = 1 << 20;
/// Bytes per bucket: `{id: u32, hash: u32, offset: u64, len: u32, pad: u32}`.
const BUCKET_SIZE: usize = 24;
/// Linear probe bound; an atom that cannot be placed within this many
/// buckets is a capacity failure, not a blocking condition.
const MAX_PROBE: usize = 64;
const INITIAL_DATA_SIZE: u64 = 4 * 1024 * 1024;

const OFF_WRITE_POS: usize = 16;
const OFF_NEXT_ID: usize = 24;
const OFF_ATOM_COUNT: usize = 28;
const OFF_TOTAL_BYTES: usize = 32;

/// Atom store errors
#[derive(Error, Debug)]
pub enum AtomError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// All probe candidates for a hash were occupied
    #[error("Atom hash table overflow after {0} probes")]
    HashBucketOverflow(usize),

    /// The backing store cannot hold more atoms
    #[error("Atom store capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Metadata magic mismatch on open
    #[error("Atom store magic mismatch in {0}")]
    CorruptMagic(PathBuf),

    /// Stored bytes are inconsistent with the metadata
    #[error("Atom store corruption: {0}")]
    Corrupt(String),

    /// Unknown atom id
    #[error("Unknown atom id {0}")]
    NotFound(AtomId),
}

pub type AtomResult<T> = Result<T, AtomError>;

/// Borrowed view of one atom's bytes.
///
/// Holds a shared lock on the data map; the bytes stay valid (and the map
/// cannot be remapped) until the guard is dropped.
pub struct AtomRef<'a> {
    guard: RwLockReadGuard<'a, MmapMut>,
    start: usize,
    len: usize,
}

impl AtomRef<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        &self.guard[self.start..self.start + self.len]
    }

    pub fn as_str(&self) -> AtomResult<&str> {
        std::str::from_utf8(self.as_bytes())
            .map_err(|_| AtomError::Corrupt("atom bytes are not valid UTF-8".to_string()))
    }
}

/// Persistent, memory-mapped string interner.
pub struct AtomStore {
    dir: PathBuf,
    data_file: File,
    data: RwLock<MmapMut>,
    /// Fixed-size hash table map; never remapped after open.
    index: MmapMut,
    /// Fixed-size id -> offset directory; never remapped after open.
    offsets: MmapMut,
    next_id: AtomicU32,
    write_pos: AtomicU64,
    total_bytes: AtomicU64,
}

impl AtomStore {
    /// Open the atom store in `dir`, creating the files on first use.
    pub fn open(dir: impl AsRef<Path>) -> AtomResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let data_path = dir.join("atoms.data");
        let fresh = !data_path.exists();
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;
        if data_file.metadata()?.len() < HEADER_SIZE {
            data_file.set_len(INITIAL_DATA_SIZE)?;
        }
        // SAFETY: the file is open read/write and set_len above guarantees
        // the mapped range is allocated.
        let mut data = unsafe { MmapMut::map_mut(&data_file)? };

        if fresh {
            data[..8].copy_from_slice(MAGIC);
            data[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            write_u64(&mut data, OFF_WRITE_POS, HEADER_SIZE);
            write_u32(&mut data, OFF_NEXT_ID, 1);
            write_u32(&mut data, OFF_ATOM_COUNT, 0);
            write_u64(&mut data, OFF_TOTAL_BYTES, 0);
            data.flush()?;
        } else if &data[..8] != MAGIC {
            return Err(AtomError::CorruptMagic(data_path));
        }

        let index =
            Self::open_fixed(&dir.join("atoms.index"), (BUCKET_COUNT * BUCKET_SIZE) as u64)?;
        let offsets = Self::open_fixed(&dir.join("atoms.offset"), (BUCKET_COUNT * 8) as u64)?;

        let write_pos = read_u64(&data, OFF_WRITE_POS);
        let next_id = read_u32(&data, OFF_NEXT_ID);
        let total_bytes = read_u64(&data, OFF_TOTAL_BYTES);
        info!(
            path = %dir.display(),
            atoms = next_id.saturating_sub(1),
            bytes = total_bytes,
            "opened atom store"
        );

        Ok(Self {
            dir,
            data_file,
            data: RwLock::new(data),
            index,
            offsets,
            next_id: AtomicU32::new(next_id),
            write_pos: AtomicU64::new(write_pos),
            total_bytes: AtomicU64::new(total_bytes),
        })
    }

    fn open_fixed(path: &Path, size: u64) -> AtomResult<MmapMut> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(size)?;
        } else if len != size {
            return Err(AtomError::Corrupt(format!(
                "{} has size {}, expected {} (capacity constants must match)",
                path.display(),
                len,
                size
            )));
        }
        // SAFETY: file is open read/write and sized to the mapped range.
        Ok(unsafe { MmapMut::map_mut(&file)? })
    }

    /// Intern `text`, returning its id. Equal strings always yield the same
    /// id, within and across sessions. The empty string interns to id 0.
    pub fn intern(&self, text: &str) -> AtomResult<AtomId> {
        if text.is_empty() {
            return Ok(0);
        }
        let bytes = text.as_bytes();
        let hash = fnv1a(bytes);
        if let Some(id) = self.probe(hash, bytes) {
            return Ok(id);
        }
        // Miss on the lock-free probe: take the allocation lock and re-probe
        // so a racing interner of the same string cannot burn an id.
        let mut data = self.data.write();
        for probe in 0..MAX_PROBE {
            let bucket = (hash as usize).wrapping_add(probe) & (BUCKET_COUNT - 1);
            let id_slot = self.bucket_u32(bucket, 0);
            let existing = id_slot.load(Ordering::Acquire);
            if existing != 0 {
                if self.bucket_matches_locked(&data, bucket, hash, bytes) {
                    return Ok(existing);
                }
                continue;
            }

            let (new_id, offset) = self.append_record(&mut data, bytes)?;
            self.bucket_u64(bucket, 8).store(offset, Ordering::Release);
            self.bucket_u32(bucket, 4).store(hash, Ordering::Release);
            self.offset_slot(new_id).store(offset, Ordering::Release);
            if id_slot
                .compare_exchange(0, new_id, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Buckets are only claimed under the allocation lock, so the
                // slot we just observed empty cannot have been taken.
                return Err(AtomError::Corrupt(format!(
                    "bucket {} claimed outside the allocation lock",
                    bucket
                )));
            }
            // Length is published last; lock-free probers spin on it.
            self.bucket_u32(bucket, 16)
                .store(bytes.len() as u32, Ordering::Release);
            return Ok(new_id);
        }
        Err(AtomError::HashBucketOverflow(MAX_PROBE))
    }

    /// Lock-free probe for an existing atom.
    fn probe(&self, hash: u32, bytes: &[u8]) -> Option<AtomId> {
        for probe in 0..MAX_PROBE {
            let bucket = (hash as usize).wrapping_add(probe) & (BUCKET_COUNT - 1);
            let id = self.bucket_u32(bucket, 0).load(Ordering::Acquire);
            if id == 0 {
                return None;
            }
            if let Some(id) = self.bucket_matches(bucket, id, hash, bytes) {
                return Some(id);
            }
        }
        None
    }

    /// Probe for `text` without allocating.
    pub fn lookup(&self, text: &str) -> Option<AtomId> {
        if text.is_empty() {
            return Some(0);
        }
        let bytes = text.as_bytes();
        self.probe(fnv1a(bytes), bytes)
    }

    /// Borrow the bytes of an atom.
    pub fn fetch(&self, id: AtomId) -> AtomResult<AtomRef<'_>> {
        if id == 0 || id >= self.next_id.load(Ordering::Acquire) {
            return Err(AtomError::NotFound(id));
        }
        let offset = self.offset_slot(id).load(Ordering::Acquire) as usize;
        let guard = self.data.read();
        if offset + 4 > guard.len() {
            return Err(AtomError::Corrupt(format!(
                "offset {} for atom {} is out of bounds",
                offset, id
            )));
        }
        let len = read_u32(&guard, offset) as usize;
        if offset + 4 + len > guard.len() {
            return Err(AtomError::Corrupt(format!(
                "record for atom {} overruns the data file",
                id
            )));
        }
        Ok(AtomRef {
            guard,
            start: offset + 4,
            len,
        })
    }

    /// Owned copy of an atom's text.
    pub fn resolve(&self, id: AtomId) -> AtomResult<String> {
        Ok(self.fetch(id)?.as_str()?.to_string())
    }

    /// Number of interned atoms.
    pub fn atom_count(&self) -> u32 {
        self.next_id.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Total interned payload bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Persist counters and flush the maps.
    pub fn flush(&self) -> AtomResult<()> {
        let mut data = self.data.write();
        let next_id = self.next_id.load(Ordering::Acquire);
        write_u64(
            &mut data,
            OFF_WRITE_POS,
            self.write_pos.load(Ordering::Acquire),
        );
        write_u32(&mut data, OFF_NEXT_ID, next_id);
        write_u32(&mut data, OFF_ATOM_COUNT, next_id.saturating_sub(1));
        write_u64(
            &mut data,
            OFF_TOTAL_BYTES,
            self.total_bytes.load(Ordering::Acquire),
        );
        data.flush()?;
        self.index.flush()?;
        self.offsets.flush()?;
        Ok(())
    }

    /// Reserve space, copy the record, and assign the next id. The caller
    /// holds the data write lock, so record order matches id order on disk.
    fn append_record(&self, data: &mut MmapMut, bytes: &[u8]) -> AtomResult<(AtomId, u64)> {
        let record_len = 4 + bytes.len() as u64;

        let next_id = self.next_id.load(Ordering::Acquire);
        if next_id as usize >= BUCKET_COUNT {
            return Err(AtomError::CapacityExhausted(format!(
                "offset directory is full ({} atoms)",
                next_id
            )));
        }
        let offset = self.write_pos.load(Ordering::Acquire);
        let required = offset + record_len;
        if required > data.len() as u64 {
            self.grow_data(data, required)?;
        }

        let start = offset as usize;
        data[start..start + 4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        data[start + 4..start + 4 + bytes.len()].copy_from_slice(bytes);

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.write_pos.store(required, Ordering::Release);
        self.total_bytes
            .fetch_add(bytes.len() as u64, Ordering::AcqRel);
        Ok((id, offset))
    }

    fn grow_data(&self, data: &mut MmapMut, required: u64) -> AtomResult<()> {
        let mut new_len = (data.len() as u64).max(INITIAL_DATA_SIZE);
        while new_len < required {
            new_len = new_len
                .checked_mul(2)
                .ok_or_else(|| AtomError::CapacityExhausted("data file size overflow".into()))?;
        }
        debug!(new_len, "growing atom data file");
        data.flush()?;
        self.data_file
            .set_len(new_len)
            .map_err(|e| AtomError::CapacityExhausted(e.to_string()))?;
        // SAFETY: the file was just extended to cover the new mapping; the
        // old map is replaced under the exclusive lock held by the caller.
        *data = unsafe { MmapMut::map_mut(&self.data_file)? };
        Ok(())
    }

    /// Compare a claimed bucket against `bytes`, waiting out a concurrent
    /// writer that has claimed the id but not yet published the length.
    fn bucket_matches(&self, bucket: usize, id: AtomId, hash: u32, bytes: &[u8]) -> Option<AtomId> {
        let mut len = self.bucket_u32(bucket, 16).load(Ordering::Acquire);
        while len == 0 {
            std::hint::spin_loop();
            len = self.bucket_u32(bucket, 16).load(Ordering::Acquire);
        }
        if self.bucket_u32(bucket, 4).load(Ordering::Acquire) != hash || len as usize != bytes.len()
        {
            return None;
        }
        let offset = self.bucket_u64(bucket, 8).load(Ordering::Acquire) as usize;
        let data = self.data.read();
        let start = offset + 4;
        if start + bytes.len() <= data.len() && &data[start..start + bytes.len()] == bytes {
            Some(id)
        } else {
            None
        }
    }

    /// As [`Self::bucket_matches`], but for callers already holding the data
    /// write lock. Claims only happen under that lock, so a non-empty bucket
    /// is always fully published here and no spin is needed.
    fn bucket_matches_locked(
        &self,
        data: &MmapMut,
        bucket: usize,
        hash: u32,
        bytes: &[u8],
    ) -> bool {
        if self.bucket_u32(bucket, 4).load(Ordering::Acquire) != hash
            || self.bucket_u32(bucket, 16).load(Ordering::Acquire) as usize != bytes.len()
        {
            return false;
        }
        let offset = self.bucket_u64(bucket, 8).load(Ordering::Acquire) as usize;
        let start = offset + 4;
        start + bytes.len() <= data.len() && &data[start..start + bytes.len()] == bytes
    }

    fn bucket_u32(&self, bucket: usize, field: usize) -> &AtomicU32 {
        let at = bucket * BUCKET_SIZE + field;
        // SAFETY: `at` is within the fixed-size index map (bucket <
        // BUCKET_COUNT, field < BUCKET_SIZE), the map is page-aligned and the
        // 24-byte stride keeps every u32 field 4-byte aligned. The map is
        // never remapped and never borrowed mutably, so the atomic view is
        // the only way these bytes are accessed.
        unsafe { &*(self.index.as_ptr().add(at) as *const AtomicU32) }
    }

    fn bucket_u64(&self, bucket: usize, field: usize) -> &AtomicU64 {
        let at = bucket * BUCKET_SIZE + field;
        // SAFETY: as for `bucket_u32`; the u64 field sits at offset 8 of a
        // 24-byte stride from a page-aligned base, so it is 8-byte aligned.
        unsafe { &*(self.index.as_ptr().add(at) as *const AtomicU64) }
    }

    fn offset_slot(&self, id: AtomId) -> &AtomicU64 {
        let at = id as usize * 8;
        // SAFETY: id < BUCKET_COUNT is enforced at allocation, the offsets
        // map is sized to BUCKET_COUNT u64s, page-aligned, never remapped
        // and never borrowed mutably.
        unsafe { &*(self.offsets.as_ptr().add(at) as *const AtomicU64) }
    }

    /// Directory this store lives in.
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for AtomStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(?e, "failed to flush atom store on drop");
        }
    }
}

/// FNV-1a, 32-bit.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = 0x811c_9dc5u32;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or([0; 4]))
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or([0; 8]))
}

fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_intern_and_fetch_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = AtomStore::open(dir.path()).unwrap();

        let id = store.intern("http://example.org/a").unwrap();
        assert!(id > 0);
        assert_eq!(
            store.fetch(id).unwrap().as_str().unwrap(),
            "http://example.org/a"
        );
    }

    #[test]
    fn test_reintern_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = AtomStore::open(dir.path()).unwrap();

        let id = store.intern("http://example.org/a").unwrap();
        let count = store.atom_count();
        assert_eq!(store.intern("http://example.org/a").unwrap(), id);
        assert_eq!(store.atom_count(), count);
    }

    #[test]
    fn test_ids_are_dense_from_one() {
        let dir = TempDir::new().unwrap();
        let store = AtomStore::open(dir.path()).unwrap();

        assert_eq!(store.intern("a").unwrap(), 1);
        assert_eq!(store.intern("b").unwrap(), 2);
        assert_eq!(store.intern("c").unwrap(), 3);
        assert_eq!(store.atom_count(), 3);
    }

    #[test]
    fn test_empty_string_is_id_zero() {
        let dir = TempDir::new().unwrap();
        let store = AtomStore::open(dir.path()).unwrap();
        assert_eq!(store.intern("").unwrap(), 0);
        assert_eq!(store.lookup(""), Some(0));
    }

    #[test]
    fn test_lookup_without_allocation() {
        let dir = TempDir::new().unwrap();
        let store = AtomStore::open(dir.path()).unwrap();

        assert_eq!(store.lookup("missing"), None);
        let id = store.intern("present").unwrap();
        assert_eq!(store.lookup("present"), Some(id));
        assert_eq!(store.atom_count(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = AtomStore::open(dir.path()).unwrap();
            store.intern("persistent atom").unwrap()
        };
        let store = AtomStore::open(dir.path()).unwrap();
        assert_eq!(store.lookup("persistent atom"), Some(id));
        assert_eq!(store.resolve(id).unwrap(), "persistent atom");
        assert_eq!(store.intern("another").unwrap(), id + 1);
    }

    #[test]
    fn test_corrupt_magic_refuses_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = AtomStore::open(dir.path()).unwrap();
            store.intern("x").unwrap();
        }
        let path = dir.path().join("atoms.data");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[..8].copy_from_slice(b"BADMAGIC");
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            AtomStore::open(dir.path()),
            Err(AtomError::CorruptMagic(_))
        ));
    }

    #[test]
    fn test_concurrent_intern_agrees() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(AtomStore::open(dir.path()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = std::sync::Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                (0..200)
                    .map(|i| store.intern(&format!("atom-{}", i % 50)).unwrap())
                    .collect::<Vec<_>>()
            }));
        }
        let results: Vec<Vec<AtomId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
        assert_eq!(store.atom_count(), 50);
    }
}

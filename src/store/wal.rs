//! Write-ahead log for batched quad writes.
//!
//! Every batch commit appends one length-prefixed, checksummed bincode
//! record before the indexes are touched. Replay on open re-applies batches
//! newer than the last checkpoint; a torn record at the tail (failed length
//! read, bad checksum) ends replay, so an interrupted commit is dropped as
//! a whole and the all-or-nothing batch guarantee survives a crash.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// WAL errors
#[derive(Error, Debug)]
pub enum WalError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Corruption detected mid-log (not at the tail)
    #[error("WAL corruption detected at sequence {0}")]
    Corruption(u64),
}

pub type WalResult<T> = Result<T, WalError>;

/// One logged quad operation; terms are stored as text so replay does not
/// depend on atom-id assignment having been flushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalOp {
    /// Insert a quad (graph text empty for the default graph)
    Add {
        subject: String,
        predicate: String,
        object: String,
        graph: String,
    },
    /// Tombstone a quad
    Remove {
        subject: String,
        predicate: String,
        object: String,
        graph: String,
    },
}

/// Write-ahead log entry types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    /// One atomic batch of quad operations
    Batch { ops: Vec<WalOp> },
    /// Checkpoint marker: state up to `sequence` is durable in the indexes
    Checkpoint { sequence: u64, timestamp: i64 },
}

/// WAL record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalRecord {
    /// Sequence number (monotonically increasing)
    sequence: u64,
    /// Entry data
    entry: WalEntry,
    /// Checksum for corruption detection
    checksum: u32,
}

impl WalRecord {
    fn new(sequence: u64, entry: WalEntry) -> Self {
        let mut record = Self {
            sequence,
            entry,
            checksum: 0,
        };
        record.checksum = record.calculate_checksum();
        record
    }

    fn calculate_checksum(&self) -> u32 {
        let bytes = bincode::serialize(&self.entry).unwrap_or_default();
        bytes
            .iter()
            .fold(0x811c_9dc5u32, |acc, &b| {
                (acc ^ u32::from(b)).wrapping_mul(0x0100_0193)
            })
            ^ (self.sequence as u32)
    }

    fn verify_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }
}

/// Write-ahead log manager over a single append-only file.
pub struct Wal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    sequence: u64,
    sync_mode: bool,
}

impl Wal {
    /// Open the WAL at `path` (created on first append).
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let sequence = Self::scan_last_sequence(&path)?;
        info!(path = %path.display(), sequence, "opened WAL");
        Ok(Self {
            path,
            writer: None,
            sequence,
            sync_mode: true,
        })
    }

    /// Toggle fsync-per-append.
    pub fn set_sync_mode(&mut self, sync: bool) {
        self.sync_mode = sync;
        debug!(sync, "WAL sync mode");
    }

    /// Append an entry, returning its sequence number.
    pub fn append(&mut self, entry: WalEntry) -> WalResult<u64> {
        self.sequence += 1;
        let sequence = self.sequence;
        let record = WalRecord::new(sequence, entry);
        let data = bincode::serialize(&record)?;

        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = &mut self.writer {
            writer.write_all(&(data.len() as u32).to_le_bytes())?;
            writer.write_all(&data)?;
            writer.flush()?;
            if self.sync_mode {
                writer.get_ref().sync_all()?;
            }
        }
        Ok(sequence)
    }

    /// Replay entries with sequence > `from_sequence` through `callback`.
    /// Returns the last sequence seen. A torn tail record ends replay with
    /// a warning; corruption before the tail is an error.
    pub fn replay<F>(&self, from_sequence: u64, mut callback: F) -> WalResult<u64>
    where
        F: FnMut(&WalEntry) -> WalResult<()>,
    {
        if !self.path.exists() {
            return Ok(from_sequence);
        }
        let file = File::open(&self.path)?;
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut consumed = 0u64;
        let mut last_sequence = from_sequence;
        let mut replayed = 0u64;
        let mut buf = Vec::new();

        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_bytes) as u64;
            if consumed + 4 + len > total {
                warn!("dropping torn WAL tail record");
                break;
            }
            buf.resize(len as usize, 0);
            reader.read_exact(&mut buf)?;
            consumed += 4 + len;

            let record: WalRecord = match bincode::deserialize(&buf) {
                Ok(record) => record,
                Err(_) if consumed == total => {
                    warn!("dropping undecodable WAL tail record");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if !record.verify_checksum() {
                if consumed == total {
                    warn!(sequence = record.sequence, "dropping torn WAL tail record");
                    break;
                }
                return Err(WalError::Corruption(record.sequence));
            }
            last_sequence = record.sequence;
            if record.sequence > from_sequence {
                callback(&record.entry)?;
                replayed += 1;
            }
        }
        info!(replayed, last_sequence, "WAL replay complete");
        Ok(last_sequence)
    }

    /// Find the sequence of the last checkpoint marker in the log.
    pub fn last_checkpoint(&self) -> WalResult<u64> {
        let mut checkpoint = 0u64;
        self.replay(0, |entry| {
            if let WalEntry::Checkpoint { sequence, .. } = entry {
                checkpoint = *sequence;
            }
            Ok(())
        })?;
        Ok(checkpoint)
    }

    /// Record that state up to `sequence` is durable.
    pub fn checkpoint(&mut self, sequence: u64) -> WalResult<()> {
        debug!(sequence, "WAL checkpoint");
        let timestamp = chrono::Utc::now().timestamp();
        self.append(WalEntry::Checkpoint {
            sequence,
            timestamp,
        })?;
        Ok(())
    }

    /// Current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn scan_last_sequence(path: &Path) -> WalResult<u64> {
        if !path.exists() {
            return Ok(0);
        }
        let probe = Wal {
            path: path.to_path_buf(),
            writer: None,
            sequence: 0,
            sync_mode: false,
        };
        probe.replay(0, |_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_op(n: u32) -> WalOp {
        WalOp::Add {
            subject: format!("http://example.org/s{}", n),
            predicate: "http://example.org/p".to_string(),
            object: format!("\"{}\"", n),
            graph: String::new(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.wal");
        let mut wal = Wal::open(&path).unwrap();

        for i in 0..5 {
            wal.append(WalEntry::Batch {
                ops: vec![add_op(i)],
            })
            .unwrap();
        }

        let mut count = 0;
        wal.replay(0, |entry| {
            assert!(matches!(entry, WalEntry::Batch { .. }));
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(WalEntry::Batch {
                ops: vec![add_op(1)],
            })
            .unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        assert_eq!(wal.sequence(), 1);
        assert_eq!(
            wal.append(WalEntry::Batch {
                ops: vec![add_op(2)]
            })
            .unwrap(),
            2
        );
    }

    #[test]
    fn test_checkpoint_tracking() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.wal");
        let mut wal = Wal::open(&path).unwrap();

        wal.append(WalEntry::Batch {
            ops: vec![add_op(1)],
        })
        .unwrap();
        let seq = wal.sequence();
        wal.checkpoint(seq).unwrap();
        wal.append(WalEntry::Batch {
            ops: vec![add_op(2)],
        })
        .unwrap();

        assert_eq!(wal.last_checkpoint().unwrap(), seq);

        let mut after = 0;
        wal.replay(seq, |entry| {
            if matches!(entry, WalEntry::Batch { .. }) {
                after += 1;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(after, 1);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(WalEntry::Batch {
                ops: vec![add_op(1)],
            })
            .unwrap();
            wal.append(WalEntry::Batch {
                ops: vec![add_op(2)],
            })
            .unwrap();
        }
        // Truncate mid-record to simulate a crash during append.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let wal = Wal::open(&path).unwrap();
        let mut count = 0;
        wal.replay(0, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }
}

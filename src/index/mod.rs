//! Ordered persistent index: a memory-mapped B+Tree over quad keys.
//!
//! Each index file orders the four atom-id components of a quad in one
//! permutation (see [`crate::store`]); the tree itself only knows about
//! 4-component keys in lexicographic order.

mod btree;
mod page;

pub use btree::{BTree, TreeScan};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A quad key: four atom ids in the index's component order.
pub type Key = [u32; 4];

/// B+Tree errors
#[derive(Error, Debug)]
pub enum TreeError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Page header failed a sanity check
    #[error("Corrupt page {page} in {path}: {reason}")]
    PageCorrupt {
        page: u32,
        path: PathBuf,
        reason: String,
    },

    /// Metadata magic or key-order tag mismatch on open
    #[error("Corrupt index file {0}: {1}")]
    CorruptMeta(PathBuf, String),

    /// The index file cannot grow
    #[error("Index capacity exhausted: {0}")]
    CapacityExhausted(String),
}

pub type TreeResult<T> = Result<T, TreeError>;

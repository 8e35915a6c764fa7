//! Storage for the leaves of the tree, addressed by path.
//!
//! Each live leaf path maps to one [LeafRecord] holding the leaf's key and value. Records are
//! written to a [crate::store::Store] in the `{table}-leaves` partition. A path that stops
//! holding a leaf without being rewritten (because its key moved elsewhere or was deleted)
//! receives a tombstone, so an index rebuilt from data files agrees with the live one.
//!
//! # Format
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |...|   |   |   |   |   |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |          Path (u64)           |Key Len (u32)  |  Key  |     Value     |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! ```

mod record;
mod storage;

pub use record::LeafRecord;
pub use storage::{partition, LeafStore, StagedLeaves};
use thiserror::Error;

/// Errors that can occur when interacting with a [LeafStore].
#[derive(Debug, Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("index error: {0}")]
    Index(#[from] crate::index::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::store::Error),
    #[error("record for path {found} stored at path {expected}")]
    PathMismatch { expected: u64, found: u64 },
}

/// Configuration for a [LeafStore].
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of the buffer used when writing data files.
    pub write_buffer: usize,

    /// Configuration of the path index.
    pub index: crate::index::Config,

    /// Ignore any persisted index and rebuild it from data files.
    pub force_rebuild: bool,
}

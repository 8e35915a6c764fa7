//! A table of the virtual Merkle tree: hashes, leaves, and the key index behind one façade.
//!
//! A [DataSource] owns one [crate::hashes::HashChunkStore], one [crate::keys::KeyToPath] map,
//! and one [crate::leaves::LeafStore]. Every store of table `t` lives in its own
//! [commonware_runtime::Storage] partition:
//!
//! ```text
//! t-metadata   table metadata (a commonware_storage::metadata::Metadata store)
//! t-hashes     hash chunks (data files, index, ram)
//! t-leaves     leaf records (data files, index)
//! t-keys       key buckets (data files, index, buckets)
//! ```
//!
//! Every state transition of the tree is written with a single call to
//! [DataSource::save_records]. Each store writes its share of the batch to a new data file first
//! and the batch is only made visible (all stores at once) after every file was written, so a
//! reader either observes the whole batch or none of it.
//!
//! Tables are created, snapshotted, and restored through a [Builder].
//!
//! # Metadata
//!
//! Metadata fields are stored under fixed `u64` keys:
//!
//! ```text
//! 1 first leaf path      4 hashes ram to disk threshold
//! 2 last leaf path       5 chunk height
//! 3 initial capacity     6 compaction enabled
//! ```
//!
//! Fields are optional (a missing field is filled from [Config] when the table is opened).

mod builder;
mod metadata;
mod metrics;
mod storage;

pub use builder::Builder;
pub use metadata::Metadata;
pub use metrics::Statistics;
pub use storage::DataSource;

use crate::{compaction, files, hashes, index, keys, leaves};
use thiserror::Error;

/// Errors that can occur when interacting with a [DataSource].
#[derive(Debug, Error)]
pub enum Error {
    #[error("metadata error: {0}")]
    Metadata(#[from] commonware_storage::metadata::Error),
    #[error("file error: {0}")]
    Files(#[from] files::Error),
    #[error("index error: {0}")]
    Index(#[from] index::Error),
    #[error("hash store error: {0}")]
    Hashes(#[from] hashes::Error),
    #[error("key map error: {0}")]
    Keys(#[from] keys::Error),
    #[error("leaf store error: {0}")]
    Leaves(#[from] leaves::Error),
    #[error("compaction error: {0}")]
    Compaction(#[from] compaction::Error),
    #[error("invalid path: {0}")]
    InvalidPath(u64),
    #[error("invalid chunk id: {0}")]
    InvalidChunkId(u64),
    #[error("path {0} outside of the leaf range")]
    PathOutOfRange(u64),
    #[error("invalid leaf range: {0}..={1}")]
    InvalidRange(u64, u64),
    #[error("invalid chunk height: expected {expected}, found {found}")]
    InvalidChunkHeight { expected: u8, found: u8 },
    #[error("invalid table name: {0}")]
    InvalidTableName(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("missing metadata for table {0}")]
    MissingMetadata(String),
    #[error("table already exists: {0}")]
    TargetExists(String),
    #[error("table closed")]
    Closed,
    #[error("table poisoned by a failed write")]
    Poisoned,
    #[error("snapshot already in progress")]
    SnapshotInProgress,
}

impl Error {
    /// Returns true if the error rejected the arguments of a call (before any state changed).
    pub fn is_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath(_)
                | Self::InvalidChunkId(_)
                | Self::PathOutOfRange(_)
                | Self::InvalidRange(_, _)
                | Self::InvalidChunkHeight { .. }
                | Self::InvalidTableName(_)
                | Self::InvalidConfig(_)
        )
    }
}

/// Configuration for a [DataSource].
#[derive(Clone, Debug)]
pub struct Config {
    /// Expected number of leaves of a new table. Sizes the key map.
    pub initial_capacity: u64,

    /// Hashes of paths below this threshold are kept in memory. `0` keeps every hash on disk and
    /// `u64::MAX` keeps every hash in memory.
    pub hashes_ram_to_disk_threshold: u64,

    /// Number of ranks in each hash chunk (`1..=16`).
    pub chunk_height: u8,

    /// Run compaction in the background after flushes.
    pub compaction_enabled: bool,

    /// Compaction of a store starts once it holds this many files.
    pub min_files_to_compact: usize,

    /// Compactions the process-wide [compaction::Executor] runs at once (set by its first user).
    pub compaction_threads: usize,

    /// Number of entries allocated at a time by every index.
    pub index_chunk_size: usize,

    /// Largest number of leaves a table may hold. Bounds the capacity of every index.
    pub max_num_of_keys: u64,

    /// Tables whose key map is rebuilt from their leaves when opened.
    pub tables_to_repair_index: Vec<String>,

    /// Ignore persisted indices and rebuild them from data files when opening.
    pub force_index_rebuild: bool,

    /// Size of the buffer used when writing data files.
    pub write_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_capacity: 1_000_000,
            hashes_ram_to_disk_threshold: 1 << 23,
            chunk_height: 6,
            compaction_enabled: true,
            min_files_to_compact: 3,
            compaction_threads: 4,
            index_chunk_size: 1 << 20,
            max_num_of_keys: 500_000_000,
            tables_to_repair_index: Vec::new(),
            force_index_rebuild: false,
            write_buffer: 1 << 20,
        }
    }
}

impl Config {
    /// Check that every field is usable.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: String| Err(Error::InvalidConfig(reason));
        if self.chunk_height == 0 || self.chunk_height > hashes::MAX_HEIGHT {
            return invalid(format!(
                "chunk height {} not in 1..={}",
                self.chunk_height,
                hashes::MAX_HEIGHT
            ));
        }
        if self.max_num_of_keys == 0 || self.path_capacity().is_none() {
            return invalid(format!(
                "max number of keys {} not addressable",
                self.max_num_of_keys
            ));
        }
        if self.initial_capacity == 0 || self.initial_capacity > self.max_num_of_keys {
            return invalid(format!(
                "initial capacity {} not in 1..={}",
                self.initial_capacity, self.max_num_of_keys
            ));
        }
        if self.index_chunk_size == 0 {
            return invalid("index chunk size must be positive".into());
        }
        if self.min_files_to_compact == 0 {
            return invalid("min files to compact must be positive".into());
        }
        if self.compaction_threads == 0 {
            return invalid("compaction threads must be positive".into());
        }
        if self.write_buffer == 0 {
            return invalid("write buffer must be positive".into());
        }
        Ok(())
    }

    /// Number of paths the leaf index must address (twice the number of keys).
    pub(crate) fn path_capacity(&self) -> Option<u64> {
        self.max_num_of_keys
            .checked_mul(2)
            .filter(|capacity| *capacity <= crate::path::MAX_PATH + 1)
    }
}

//! In-memory arenas mapping dense integer ids to packed disk locations.
//!
//! A [LongList] resolves an id (a leaf path, a hash chunk id, or a bucket id) to a non-zero `u64`
//! (usually a [crate::files::DiskLocation]). Storage is allocated in fixed-size chunks of
//! [Config::chunk_size] entries: a chunk is allocated the first time an id inside it is written
//! and freed once the valid id range moves past it, so memory tracks the live part of the tree
//! rather than its capacity.
//!
//! Every chunk allocated or freed is accounted in a [MemoryTracker] shared by all lists of a table
//! and in a process-wide counter ([allocated_bytes]).
//!
//! # Format
//!
//! Lists can be persisted to (and loaded from) a single [commonware_runtime::Blob]:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |12 |13 |14 |15 |16 |17 |18 |19 |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |  Magic "MKLL" |Version|Reserv.|Chunk Size(u32)|       Capacity (u64)          |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |20 |21 |22 |23 |24 |25 |26 |27 |28 |29 |30 |31 |32 |33 |34 |35 |...|   |   |   |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |       Min Valid (u64)         |   End (u64, exclusive)        |Values |  CRC  |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!
//! Values = (End - Min Valid) big-endian u64 entries (0 = absent)
//! CRC = CRC32 over everything preceding it
//! ```

mod list;
mod memory;

pub use list::LongList;
pub use memory::{allocated_bytes, MemoryGauge, MemoryTracker};
use thiserror::Error;

/// Errors that can occur when interacting with a [LongList].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("file error: {0}")]
    Files(#[from] crate::files::Error),
    #[error("invalid index file: {0}")]
    InvalidFile(String),
    #[error("index {index} exceeds capacity {capacity}")]
    IndexOutOfBounds { index: u64, capacity: u64 },
    #[error("index {0} outside of the valid range")]
    OutsideValidRange(u64),
    #[error("invalid range: {0}..={1}")]
    InvalidRange(u64, u64),
}

/// Configuration for a [LongList].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of ids the list can hold.
    pub capacity: u64,

    /// Number of entries allocated at a time.
    pub chunk_size: usize,
}

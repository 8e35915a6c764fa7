//! Storage for the internal hashes of the tree, grouped into fixed-height chunks.
//!
//! A [HashChunk] holds every hash of the subtree below its chunk path, down to `height` ranks.
//! Chunks are addressed by a dense id (see [path_to_chunk_id]) which makes them a natural fit for
//! a [crate::index::LongList]: the id space only grows as the tree does.
//!
//! The [HashChunkStore] keeps the top of the tree in memory and the rest on disk. Chunks whose id
//! is below the RAM limit (derived from the configured path threshold) are never written to data
//! files. They are persisted to a single blob when the store is closed or snapshotted.
//!
//! # Format
//!
//! Chunks on disk are records of a [crate::files::FileSet] in the `{table}-hashes` partition,
//! keyed by chunk id:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |...|   |   |   |   |   |   |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |       Chunk Path (u64)        | H | D |     Hashes (48 bytes each)    |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!
//! H = Height (u8)
//! D = Data Rank (u8), the deepest rank holding a hash
//! Hashes = 2 + 4 + ... + 2^D slots, rank by rank
//! ```
//!
//! RAM-resident chunks are saved to the `ram` blob of the same partition:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |  Magic "MKHR" |Version| H | 0 |         Count (u64)           |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |  Id (u64) | Len (u32) | Chunk | ... | CRC32 |
//! +---+---+---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! # Legacy Layout
//!
//! Older tables stored one hash per path in the `{table}-legacy-hashes` partition: a flat list
//! (the `ram` blob) for paths below the threshold and a file set for the rest. [HashFormat]
//! detects which layout a table uses and [HashChunkStore::init] migrates legacy tables into
//! chunks.

mod chunk;
mod legacy;
mod storage;

pub use chunk::{
    chunk_id_to_path, chunk_path, last_chunk_id, max_chunk_id, path_to_chunk_id, Digest,
    HashChunk, DIGEST_SIZE, MAX_HEIGHT,
};
pub use legacy::{partition as legacy_partition, HashFormat};
#[cfg(test)]
pub(crate) use legacy::{write_legacy_disk, write_legacy_ram};
pub use storage::{partition, ram_chunk_limit, HashChunkStore, StagedChunks};
use thiserror::Error;

/// Errors that can occur when interacting with hash chunks.
#[derive(Debug, Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("file error: {0}")]
    Files(#[from] crate::files::Error),
    #[error("index error: {0}")]
    Index(#[from] crate::index::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::store::Error),
    #[error("invalid digest length: {0}")]
    InvalidDigest(usize),
    #[error("invalid chunk height: {0}")]
    InvalidChunkHeight(u8),
    #[error("invalid chunk path: {0}")]
    InvalidChunkPath(u64),
    #[error("invalid chunk id: {0}")]
    InvalidChunkId(u64),
    #[error("path {path} not in chunk {chunk}")]
    PathNotInChunk { path: u64, chunk: u64 },
    #[error("chunk height mismatch: expected {expected}, found {found}")]
    HeightMismatch { expected: u8, found: u8 },
    #[error("invalid hash file: {0}")]
    InvalidFile(String),
}

/// Configuration for a [HashChunkStore].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of ranks stored in each chunk.
    pub chunk_height: u8,

    /// Hashes of paths below this threshold are kept in memory.
    pub ram_to_disk_threshold: u64,

    /// Size of the buffer used when writing data files.
    pub write_buffer: usize,

    /// Configuration of the chunk id index.
    pub index: crate::index::Config,

    /// Ignore any persisted index and rebuild it from data files.
    pub force_rebuild: bool,
}

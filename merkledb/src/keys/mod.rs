//! A half-disk hash map from leaf keys to leaf paths.
//!
//! Keys are hashed with CRC32 into a power-of-two number of buckets. Each bucket is a single
//! record (keyed by bucket id) holding every key that hashes to it, so a lookup costs one index
//! access and one disk read regardless of how many keys the map holds. Only the bucket index is
//! kept in memory.
//!
//! Because buckets store the full key, a lookup can never return the path of a different key that
//! happens to share a bucket.
//!
//! The map grows eagerly: once the tree holds more than [ENTRIES_PER_BUCKET] leaves per bucket,
//! the bucket count doubles and every bucket `b` is split into `b` and `b + n` within the write
//! batch that triggered the growth.
//!
//! # Format
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |12 |13 |14 |15 |16 |17 |18 |...|
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |  Count (u32)  | Key Hash (u32)|          Path (u64)           |Key Len (u32)  |Key|
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!
//! (Key Hash, Path, Key Len, Key) repeated Count times
//! ```
//!
//! A bucket that loses its last key is written as a tombstone so that rebuilding the bucket index
//! from data files never resurrects it.
//!
//! Buckets, the persisted bucket index and the bucket count all live in the `{table}-keys`
//! partition.

mod bucket;
mod map;

pub use bucket::{bucket_id, key_hash, Bucket, Entry};
use bytes::Bytes;
pub use map::{buckets_for, partition, KeyToPath, StagedKeys, ENTRIES_PER_BUCKET};
use thiserror::Error;

/// Errors that can occur when interacting with a [KeyToPath] map.
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
    #[error("invalid bucket {0}: {1}")]
    InvalidBucket(u64, #[source] commonware_codec::Error),
    #[error("invalid bucket count: {0}")]
    InvalidBucketCount(u64),
}

/// A change to the mapping of one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Map `key` to `path` (moving it if it was mapped elsewhere).
    Put { key: Bytes, path: u64 },

    /// Remove `key`.
    Delete { key: Bytes },

    /// Remove `key` only if it is still mapped to `path`.
    DeleteIfEqual { key: Bytes, path: u64 },
}

impl Mutation {
    /// The key being changed.
    pub fn key(&self) -> &Bytes {
        match self {
            Self::Put { key, .. } | Self::Delete { key } | Self::DeleteIfEqual { key, .. } => key,
        }
    }
}

/// Configuration for a [KeyToPath] map.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of buckets of a new map (a power of two).
    pub initial_buckets: u64,

    /// Size of the buffer used when writing data files.
    pub write_buffer: usize,

    /// Configuration of the bucket index. Its capacity bounds the number of buckets.
    pub index: crate::index::Config,

    /// Ignore any persisted index and rebuild it from data files.
    pub force_rebuild: bool,
}

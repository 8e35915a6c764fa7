//! Append-only data files and the sets of them that back a store.
//!
//! Every store persists its records in a collection of immutable [DataFile]s managed by a
//! [FileSet]. Files are produced by a [Writer] (one per flush or compaction), become readable
//! once finished, and are removed only after nothing references their records anymore.
//!
//! # Format
//!
//! Each file starts with a fixed-size header followed by a sequence of records:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |12 |13 |14 |15 |16 |17 |18 |19 |20 |21 |22 |23 |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |  Magic "MKDF" |Version|Reserv.|  File ID (u32)|        Sequence (u64)         |  CRC32 (u32)  |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |  ...  |   |   |   |   |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |   Len (u32)   |           Key (u64)           |Payload|  CRC32 (u32)  |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!
//! CRC32 = checksum over Key and Payload
//! ```
//!
//! The key of a record is whatever the owning store indexes it by (a path, a chunk id, or a
//! bucket id). Compaction relies on it to check whether the index still references the record.
//!
//! The sequence of a file orders it relative to its siblings: a record in a file with a larger
//! sequence supersedes a record with the same key in a file with a smaller one. Compacted files
//! inherit the largest sequence of their inputs.
//!
//! _A data file is written with a zeroed header that is only filled in once every record has been
//! synced, so a file interrupted by a crash fails header validation and is removed when its set is
//! next opened. A torn tail is still tolerated when replaying (records after the first invalid one
//! are ignored)._
//!
//! # Blobs
//!
//! Every [FileSet] owns a [commonware_runtime::Storage] partition. Data files are blobs named by
//! their big-endian `u32` id; stores keep their auxiliary blobs (persisted indices and the like)
//! in the same partition under longer names.

mod file;
mod set;

pub use file::{DataFile, Record, Records, Writer};
pub use set::FileSet;

use commonware_runtime::{Blob, Storage};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur when interacting with data files.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("invalid file name: {0:?}")]
    InvalidFileName(Vec<u8>),
    #[error("checksum mismatch in file {file} at offset {offset}")]
    ChecksumMismatch { file: u32, offset: u64 },
    #[error("record out of bounds in file {file} at offset {offset}")]
    OutOfBounds { file: u32, offset: u64 },
    #[error("record too large: {0}")]
    RecordTooLarge(usize),
    #[error("file id overflow")]
    FileIdOverflow,
    #[error("offset overflow: {0}")]
    OffsetOverflow(u64),
}

/// Size of the header at the start of every data file.
pub const HEADER_SIZE: u64 = 24;

/// Bytes added to every payload (length, key, and checksum).
pub const RECORD_OVERHEAD: u64 = 16;

/// Largest payload a single record may carry.
pub const MAX_PAYLOAD: usize = 1 << 30;

const OFFSET_BITS: u32 = 40;

/// Largest file id that fits in a [DiskLocation].
pub const MAX_FILE_ID: u32 = (1 << (64 - OFFSET_BITS)) - 1;

/// Largest offset that fits in a [DiskLocation].
pub const MAX_OFFSET: u64 = (1 << OFFSET_BITS) - 1;

/// The position of a record on disk, packed into a single `u64`.
///
/// The upper 24 bits hold the file id and the lower 40 bits the byte offset of the record within
/// that file. File ids start at 1, so the raw value `0` never refers to a record and is used by
/// indices to mean "absent".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskLocation(u64);

impl DiskLocation {
    /// Pack a file id and offset into a [DiskLocation].
    pub fn new(file: u32, offset: u64) -> Result<Self, Error> {
        if file == 0 || file > MAX_FILE_ID {
            return Err(Error::FileIdOverflow);
        }
        if offset > MAX_OFFSET {
            return Err(Error::OffsetOverflow(offset));
        }
        Ok(Self(((file as u64) << OFFSET_BITS) | offset))
    }

    /// Interpret a raw index value, returning `None` for the absent marker.
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        Some(Self(raw))
    }

    /// The packed representation.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The id of the file containing the record.
    pub fn file(&self) -> u32 {
        (self.0 >> OFFSET_BITS) as u32
    }

    /// The offset of the record within its file.
    pub fn offset(&self) -> u64 {
        self.0 & MAX_OFFSET
    }
}

impl fmt::Debug for DiskLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file(), self.offset())
    }
}

impl fmt::Display for DiskLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Size of the chunks used when copying blobs.
const COPY_CHUNK: u64 = 1 << 20;

/// List the blobs of `partition`, treating a missing partition as empty.
pub async fn scan<E: Storage>(context: &E, partition: &str) -> Result<Vec<Vec<u8>>, Error> {
    match context.scan(partition).await {
        Ok(names) => Ok(names),
        Err(commonware_runtime::Error::PartitionMissing(_)) => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Returns true if `partition` holds a blob called `name`.
pub async fn exists<E: Storage>(context: &E, partition: &str, name: &[u8]) -> Result<bool, Error> {
    Ok(scan(context, partition)
        .await?
        .iter()
        .any(|existing| existing == name))
}

/// Remove the blob `name` from `partition` (if present).
pub async fn remove_blob<E: Storage>(
    context: &E,
    partition: &str,
    name: &[u8],
) -> Result<(), Error> {
    match context.remove(partition, Some(name)).await {
        Ok(())
        | Err(commonware_runtime::Error::BlobMissing(..))
        | Err(commonware_runtime::Error::PartitionMissing(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Remove `partition` and every blob in it (if present).
pub async fn remove_partition<E: Storage>(context: &E, partition: &str) -> Result<(), Error> {
    match context.remove(partition, None).await {
        Ok(()) | Err(commonware_runtime::Error::PartitionMissing(_)) => {
            debug!(partition, "removed partition");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Read the whole blob `name`, returning `None` if it does not exist.
pub async fn read_blob<E: Storage>(
    context: &E,
    partition: &str,
    name: &[u8],
) -> Result<Option<Vec<u8>>, Error> {
    if !exists(context, partition, name).await? {
        return Ok(None);
    }
    let (blob, size) = context.open(partition, name).await?;
    if size == 0 {
        return Ok(Some(Vec::new()));
    }
    let buf = blob.read_at(vec![0u8; size as usize], 0).await?;
    Ok(Some(buf.as_ref().to_vec()))
}

/// Replace the contents of blob `name` with `data` and sync it.
pub async fn write_blob<E: Storage>(
    context: &E,
    partition: &str,
    name: &[u8],
    data: Vec<u8>,
) -> Result<(), Error> {
    let (blob, _) = context.open(partition, name).await?;
    let len = data.len() as u64;
    blob.resize(len).await?;
    if len > 0 {
        blob.write_at(data, 0).await?;
    }
    blob.sync().await?;
    debug!(partition, len, "wrote blob");
    Ok(())
}

/// Copy the first `size` bytes of `source` into blob `name` of `partition`.
pub async fn copy_blob<E: Storage, B: Blob>(
    context: &E,
    source: &B,
    size: u64,
    partition: &str,
    name: &[u8],
) -> Result<(), Error> {
    let (target, _) = context.open(partition, name).await?;
    target.resize(0).await?;
    let mut offset = 0;
    while offset < size {
        let len = (size - offset).min(COPY_CHUNK);
        let buf = source.read_at(vec![0u8; len as usize], offset).await?;
        target.write_at(buf.as_ref().to_vec(), offset).await?;
        offset += len;
    }
    target.sync().await?;
    Ok(())
}

/// Copy every blob of `source` into `target`, returning the number of blobs copied.
pub async fn copy_partition<E: Storage>(
    context: &E,
    source: &str,
    target: &str,
) -> Result<usize, Error> {
    let names = scan(context, source).await?;
    for name in &names {
        let (blob, size) = context.open(source, name).await?;
        copy_blob(context, &blob, size, target, name).await?;
    }
    debug!(source, target, blobs = names.len(), "copied partition");
    Ok(names.len())
}

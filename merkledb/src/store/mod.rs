//! A disk-resident store of opaque values addressed by a dense integer key.
//!
//! [Store] pairs a [crate::files::FileSet] with a [crate::index::LongList] that maps each key to
//! the location of its latest record. It backs both the leaf store (keyed by path) and the disk
//! part of the hash chunk store (keyed by chunk id).
//!
//! Writes happen in two phases. A [Batch] appends records to a new data file without changing
//! what readers see. Once finished, the resulting [Staged] batch is published: the file becomes
//! readable and the index is updated to point into it. Callers that need several stores to change
//! together publish all of their staged batches under one lock.
//!
//! Removing a key appends a tombstone (a record with an empty payload) so that rebuilding the
//! index from data files never resurrects it. Empty payloads are therefore reserved.
//!
//! The index is persisted next to the data files (in the blob [INDEX]) when a store is closed and
//! removed again once loaded, so a crash never leaves a stale index behind. A store without a
//! persisted index rebuilds it by replaying its data files.

mod storage;

pub use storage::{load_index, Batch, Staged, Store, INDEX};
use thiserror::Error;

/// Errors that can occur when interacting with a [Store].
#[derive(Debug, Error)]
pub enum Error {
    #[error("file error: {0}")]
    Files(#[from] crate::files::Error),
    #[error("index error: {0}")]
    Index(#[from] crate::index::Error),
    #[error("record at {location} has key {found}, expected {expected}")]
    KeyMismatch {
        location: crate::files::DiskLocation,
        expected: u64,
        found: u64,
    },
    #[error("record for key {0} references a missing file")]
    MissingFile(u64),
    #[error("empty value for key {0}")]
    EmptyValue(u64),
}

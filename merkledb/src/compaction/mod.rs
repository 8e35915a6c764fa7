//! Background merging of data files.
//!
//! Every flush adds one file to each store it touches, and every overwrite leaves a dead record
//! behind. A [Compactor] merges all files of one store into a single file holding only the
//! records its index still references, then moves index entries to the new file with
//! compare-and-swap updates: a write that lands while the merge runs keeps its newer location.
//!
//! A [Coordinator] spawns the compactors of one table as runtime tasks throttled by a shared
//! [Executor], running at most one compaction per store at a time. Snapshots close the [Gate] to
//! keep compactors from rewriting indices or deleting files while they copy a consistent view.
//!
//! Compaction can be interrupted until its compactor enters the [Gate]. An interrupted compactor
//! leaves its inputs in place and deletes whatever it wrote.

mod compactor;
mod coordinator;
mod executor;
mod gate;

pub use compactor::{Compactor, State, Summary};
pub use coordinator::{Coordinator, Metrics};
pub use executor::Executor;
pub use gate::{Gate, Guard, Interrupt};
use thiserror::Error;

/// Errors that can occur during compaction.
#[derive(Debug, Error)]
pub enum Error {
    #[error("compaction interrupted")]
    Interrupted,
    #[error("file error: {0}")]
    Files(#[from] crate::files::Error),
    #[error("index error: {0}")]
    Index(#[from] crate::index::Error),
}

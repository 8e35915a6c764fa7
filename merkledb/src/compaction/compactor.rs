use super::{Error, Gate, Interrupt};
use crate::{
    files::{DataFile, FileSet, Writer},
    index::LongList,
};
use commonware_runtime::{reschedule, Clock, Storage};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, info};

/// Records copied between yields to other tasks.
const YIELD_EVERY: u64 = 256;

/// Lifecycle of a [Compactor].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Completed,
    Interrupted,
    Failed,
}

/// Outcome of a merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Files merged (and removed).
    pub files: usize,
    /// Live records copied into the new file.
    pub records: u64,
    /// Index entries moved to the new file.
    pub moved: u64,
}

/// Merges every file of one store into a single file holding only live records.
///
/// A record is live if the store's index still points at it. Index entries are moved to the new
/// file with compare-and-swap updates, so writes that land while the merge runs always win.
///
/// An interrupt is honored while copying and while waiting at the [Gate]. Once inside the gate
/// the swap runs to completion, so the index never points into a mix of inputs and output
/// because of an interrupt.
pub struct Compactor<E: Storage + Clock> {
    files: Arc<FileSet<E>>,
    index: Arc<LongList>,
    gate: Arc<Gate>,
    min_files: usize,
    interrupt: Interrupt,
    state: Mutex<State>,
}

impl<E: Storage + Clock> Compactor<E> {
    /// Create a compactor for the store made of `files` and `index`.
    ///
    /// Nothing is merged until at least `min_files` files exist.
    pub fn new(
        files: Arc<FileSet<E>>,
        index: Arc<LongList>,
        gate: Arc<Gate>,
        min_files: usize,
    ) -> Self {
        Self {
            files,
            index,
            gate,
            min_files: min_files.max(1),
            interrupt: Interrupt::default(),
            state: Mutex::new(State::Idle),
        }
    }

    /// Name of the store being compacted (its partition).
    pub fn name(&self) -> &str {
        self.files.partition()
    }

    /// Current state.
    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Stop the merge at the next record or gate wait. The compactor cannot be restarted.
    pub fn interrupt(&self) {
        self.gate.interrupt(&self.interrupt);
    }

    /// Returns true if [Compactor::interrupt] was never called.
    pub fn not_interrupted(&self) -> bool {
        self.interrupt.not_interrupted()
    }

    /// Merge the files of the store.
    ///
    /// Returns `None` if there were fewer files than the configured minimum.
    pub async fn compact(&self) -> Result<Option<Summary>, Error> {
        *self.state.lock().unwrap() = State::Running;
        let result = self.merge().await;
        let state = match &result {
            Ok(_) => State::Completed,
            Err(Error::Interrupted) => State::Interrupted,
            Err(_) => State::Failed,
        };
        *self.state.lock().unwrap() = state;
        result
    }

    /// Copy the live records of `inputs` into `writer`, returning the index moves to apply.
    async fn copy(
        &self,
        inputs: &[Arc<DataFile<E::Blob>>],
        writer: &mut Writer<E>,
    ) -> Result<Vec<(u64, u64, u64)>, Error> {
        let mut moves = Vec::new();
        let mut scanned = 0u64;
        for file in inputs {
            let mut records = file.records();
            while let Some(record) = records.next().await? {
                self.interrupt.check()?;
                scanned += 1;
                if scanned % YIELD_EVERY == 0 {
                    reschedule().await;
                }

                // Tombstones are dropped: every older file is an input
                if record.payload.is_empty()
                    || self.index.get(record.key) != Some(record.location.raw())
                {
                    continue;
                }
                let location = writer.append(record.key, &record.payload).await?;
                moves.push((record.key, record.location.raw(), location.raw()));
            }
        }
        Ok(moves)
    }

    async fn merge(&self) -> Result<Option<Summary>, Error> {
        let context = self.files.context();
        let start = context.current();
        let inputs = self.files.candidates();
        if inputs.len() < self.min_files {
            debug!(
                store = self.name(),
                files = inputs.len(),
                min = self.min_files,
                "not enough files to compact"
            );
            return Ok(None);
        }
        self.interrupt.check()?;

        // Copy live records
        let sequence = inputs.iter().map(|file| file.sequence()).max().unwrap_or(0);
        let mut writer = self.files.create_writer_with_sequence(sequence).await?;
        let moves = match self.copy(&inputs, &mut writer).await {
            Ok(moves) => moves,
            Err(err) => {
                writer.abort().await;
                return Err(err);
            }
        };
        if let Err(err) = self.interrupt.check() {
            writer.abort().await;
            return Err(err);
        }
        let output = if moves.is_empty() {
            writer.abort().await;
            None
        } else {
            Some(writer.finish().await?)
        };
        let output_id = output.as_ref().map(|file| file.id());
        self.files.publish(output, || ());

        // Move index entries and drop the inputs (excluded while a snapshot runs)
        let _guard = match self.gate.enter(&self.interrupt).await {
            Ok(guard) => guard,
            Err(err) => {
                // Nothing points into the output yet
                self.files.remove(output_id).await?;
                return Err(err);
            }
        };
        let mut moved = 0;
        for (key, old, new) in &moves {
            if self.index.put_if_equal(*key, *old, *new) {
                moved += 1;
            }
        }

        // Release our handles so the inputs can be deleted right away
        let merged: Vec<u32> = inputs.iter().map(|file| file.id()).collect();
        drop(inputs);
        self.files.remove(merged.iter().copied()).await?;

        let summary = Summary {
            files: merged.len(),
            records: moves.len() as u64,
            moved,
        };
        let elapsed = context
            .current()
            .duration_since(start)
            .unwrap_or(Duration::ZERO);
        info!(
            store = self.name(),
            files = summary.files,
            records = summary.records,
            moved = summary.moved,
            output = ?output_id,
            ?elapsed,
            "compacted files"
        );
        Ok(Some(summary))
    }
}

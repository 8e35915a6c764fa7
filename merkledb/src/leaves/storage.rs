use super::{Config, Error, LeafRecord};
use crate::{
    files::FileSet,
    index::{LongList, MemoryGauge, MemoryTracker},
    store::{load_index, Staged, Store},
};
use bytes::Bytes;
use commonware_codec::{DecodeExt, Encode};
use commonware_runtime::Storage;
use std::{collections::HashSet, ops::RangeInclusive, sync::Arc};
use tracing::{debug, info};

/// Name of the index resolving leaf paths.
pub(super) const STORE_NAME: &str = "pathToKeyValue";

/// Partition holding the leaves of `table`.
pub fn partition(table: &str) -> String {
    format!("{table}-leaves")
}

/// Leaf writes staged for publication.
pub struct StagedLeaves<E: Storage> {
    staged: Staged<E::Blob>,
    removed: usize,
}

impl<E: Storage> StagedLeaves<E> {
    /// Number of records written (including tombstones).
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Number of tombstones written.
    pub fn removed(&self) -> usize {
        self.removed
    }
}

/// The current [LeafRecord] of every live leaf path.
pub struct LeafStore<E: Storage> {
    store: Store<E>,
}

impl<E: Storage> LeafStore<E> {
    /// Open the leaf store of `table`, restricted to `range`.
    pub async fn init(
        context: E,
        table: &str,
        cfg: &Config,
        range: Option<RangeInclusive<u64>>,
        memory: Arc<MemoryTracker>,
        gauge: MemoryGauge,
    ) -> Result<Self, Error> {
        let partition = partition(table);
        let (index, rebuild) = load_index(
            &context,
            &partition,
            STORE_NAME,
            cfg.index.clone(),
            cfg.force_rebuild,
            memory,
            gauge,
        )
        .await?;
        let store = Store::init(context, &partition, cfg.write_buffer, index).await?;
        store.update_valid_range(range)?;
        if rebuild && !store.files().is_empty() {
            let leaves = store.rebuild_index().await?;
            info!(
                partition,
                leaves,
                forced = cfg.force_rebuild,
                "rebuilt leaf index"
            );
        }
        debug!(partition, files = store.files().len(), "opened leaf store");
        Ok(Self { store })
    }

    /// Data files of the store.
    pub fn files(&self) -> &Arc<FileSet<E>> {
        self.store.files()
    }

    /// Index of the store.
    pub fn index(&self) -> &Arc<LongList> {
        self.store.index()
    }

    /// Get the record stored at `path`.
    pub async fn get(&self, path: u64) -> Result<Option<LeafRecord>, Error> {
        let Some(bytes) = self.store.get(path).await? else {
            return Ok(None);
        };
        let record = LeafRecord::decode(bytes)?;
        if record.path != path {
            return Err(Error::PathMismatch {
                expected: path,
                found: record.path,
            });
        }
        Ok(Some(record))
    }

    /// Write `dirty` records and tombstones for the `vacated` paths that are inside `range`, not
    /// rewritten by `dirty`, and still hold the key that was removed from them.
    pub async fn stage(
        &self,
        dirty: &[LeafRecord],
        vacated: &[(u64, Bytes)],
        range: Option<&RangeInclusive<u64>>,
    ) -> Result<StagedLeaves<E>, Error> {
        let mut batch = self.store.batch();
        let mut written = HashSet::with_capacity(dirty.len());
        let mut removed = 0;
        let result = async {
            for record in dirty {
                batch.put(record.path, &record.encode()).await?;
                written.insert(record.path);
            }
            for (path, key) in vacated {
                if !range.is_some_and(|range| range.contains(path)) || written.contains(path) {
                    continue;
                }
                // A stale key entry must not remove the leaf that replaced it
                let stored = self.get(*path).await?;
                if !stored.is_some_and(|record| record.key == *key) {
                    continue;
                }
                written.insert(*path);
                batch.remove(*path).await?;
                removed += 1;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(err) = result {
            batch.abort().await;
            return Err(err);
        }
        Ok(StagedLeaves {
            staged: batch.finish().await?,
            removed,
        })
    }

    /// Make staged writes visible to readers.
    pub fn publish(&self, staged: StagedLeaves<E>) -> Result<(), Error> {
        self.store.publish(staged.staged)?;
        Ok(())
    }

    pub async fn discard(&self, staged: StagedLeaves<E>) -> Result<(), Error> {
        self.store.discard(staged.staged).await?;
        Ok(())
    }

    /// Forget every path outside of `range`.
    pub fn update_valid_range(&self, range: Option<RangeInclusive<u64>>) -> Result<(), Error> {
        self.store.update_valid_range(range)?;
        Ok(())
    }

    /// Persist the path index next to the data files.
    pub async fn persist(&self) -> Result<(), Error> {
        self.store.persist().await?;
        Ok(())
    }

    /// Copy the store into the leaf partition of table `target`.
    pub async fn snapshot(&self, target: &str) -> Result<(), Error> {
        self.store.snapshot(&partition(target)).await?;
        Ok(())
    }
}

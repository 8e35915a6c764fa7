use super::Error;
use crate::{
    files::{exists, remove_blob, DataFile, DiskLocation, FileSet, Writer},
    index::{Config, LongList, MemoryGauge, MemoryTracker},
};
use bytes::Bytes;
use commonware_runtime::{Blob, Storage};
use std::{ops::RangeInclusive, sync::Arc};
use tracing::{debug, warn};

/// Name of the blob holding the persisted index of a store.
pub const INDEX: &str = "index";

/// Load the index persisted in `partition` (removing the blob), or create an empty one.
///
/// Returns the index and whether it must be rebuilt from data files (because nothing was
/// persisted, the persisted copy was unusable, or `force_rebuild` was requested).
pub async fn load_index<E: Storage>(
    context: &E,
    partition: &str,
    name: &str,
    cfg: Config,
    force_rebuild: bool,
    memory: Arc<MemoryTracker>,
    gauge: MemoryGauge,
) -> Result<(LongList, bool), Error> {
    let persisted = exists(context, partition, INDEX.as_bytes()).await?;
    let loaded = if persisted && !force_rebuild {
        match LongList::load(context, partition, INDEX, cfg.clone(), memory.clone(), gauge.clone())
            .await
        {
            Ok(list) => list,
            Err(crate::index::Error::InvalidFile(reason)) => {
                warn!(partition, %reason, "discarding unusable index");
                None
            }
            Err(err) => return Err(err.into()),
        }
    } else {
        None
    };
    if persisted {
        remove_blob(context, partition, INDEX.as_bytes()).await?;
    }
    match loaded {
        Some(list) => Ok((list, false)),
        None => Ok((LongList::new(name, cfg, memory, gauge), true)),
    }
}

/// Records appended to a new data file but not yet visible to readers.
///
/// The data file is created by the first write, so an empty batch consumes no file id.
pub struct Batch<E: Storage> {
    files: Arc<FileSet<E>>,
    writer: Option<Writer<E>>,
    updates: Vec<(u64, u64)>,
}

impl<E: Storage> Batch<E> {
    async fn writer(&mut self) -> Result<&mut Writer<E>, Error> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.files.create_writer().await?,
        };
        Ok(self.writer.insert(writer))
    }

    /// Write `value` for `key`.
    pub async fn put(&mut self, key: u64, value: &[u8]) -> Result<(), Error> {
        if value.is_empty() {
            return Err(Error::EmptyValue(key));
        }
        let location = self.writer().await?.append(key, value).await?;
        self.updates.push((key, location.raw()));
        Ok(())
    }

    /// Remove `key` (appending a tombstone).
    pub async fn remove(&mut self, key: u64) -> Result<(), Error> {
        self.writer().await?.append(key, &[]).await?;
        self.updates.push((key, 0));
        Ok(())
    }

    /// Number of keys written or removed.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Sync the data file, producing a batch that can be published.
    pub async fn finish(self) -> Result<Staged<E::Blob>, Error> {
        let Some(writer) = self.writer else {
            return Ok(Staged {
                file: None,
                updates: Vec::new(),
            });
        };
        let file = writer.finish().await?;
        Ok(Staged {
            file: Some(file),
            updates: self.updates,
        })
    }

    /// Discard everything written.
    pub async fn abort(self) {
        if let Some(writer) = self.writer {
            writer.abort().await;
        }
    }
}

/// A finished [Batch] waiting to be published.
pub struct Staged<B: Blob> {
    file: Option<DataFile<B>>,
    updates: Vec<(u64, u64)>,
}

impl<B: Blob> Staged<B> {
    /// Number of keys written or removed.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Returns true if the batch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// A store of values addressed by a dense integer key.
pub struct Store<E: Storage> {
    files: Arc<FileSet<E>>,
    index: Arc<LongList>,
}

impl<E: Storage> Store<E> {
    /// Open the store whose data files live in `partition`, resolving keys with `index`.
    pub async fn init(
        context: E,
        partition: &str,
        write_buffer: usize,
        index: LongList,
    ) -> Result<Self, Error> {
        let files = FileSet::init(context, partition, write_buffer).await?;
        Ok(Self {
            files: Arc::new(files),
            index: Arc::new(index),
        })
    }

    /// The data files of the store.
    pub fn files(&self) -> &Arc<FileSet<E>> {
        &self.files
    }

    /// The index of the store.
    pub fn index(&self) -> &Arc<LongList> {
        &self.index
    }

    /// Get the latest value for `key`.
    pub async fn get(&self, key: u64) -> Result<Option<Bytes>, Error> {
        loop {
            let Some(raw) = self.index.get(key) else {
                return Ok(None);
            };
            let Some(location) = DiskLocation::from_raw(raw) else {
                return Ok(None);
            };
            match self.files.read(location).await? {
                Some((found, value)) => {
                    if found != key {
                        return Err(Error::KeyMismatch {
                            location,
                            expected: key,
                            found,
                        });
                    }
                    return Ok(Some(value));
                }
                None => {
                    // Compaction moves records before removing their file, so if the index still
                    // holds the same location the file is genuinely gone
                    if self.index.get(key) == Some(raw) {
                        return Err(Error::MissingFile(key));
                    }
                }
            }
        }
    }

    /// Start a new batch of writes.
    pub fn batch(&self) -> Batch<E> {
        Batch {
            files: self.files.clone(),
            writer: None,
            updates: Vec::new(),
        }
    }

    /// Make a staged batch visible to readers.
    pub fn publish(&self, staged: Staged<E::Blob>) -> Result<(), Error> {
        let Staged { file, updates } = staged;
        self.files.publish(file, || {
            for (key, value) in updates {
                self.index.put(key, value)?;
            }
            Ok(())
        })
    }

    /// Restrict the store to keys in `range`, forgetting every other key.
    pub fn update_valid_range(&self, range: Option<RangeInclusive<u64>>) -> Result<(), Error> {
        self.index.update_valid_range(range)?;
        Ok(())
    }

    /// Rebuild the index by replaying every data file, oldest first.
    ///
    /// Keys outside of the index's valid range are skipped. Returns the number of keys indexed.
    pub async fn rebuild_index(&self) -> Result<u64, Error> {
        let Some(range) = self.index.valid_range() else {
            return Ok(0);
        };
        let files = self.files.files();
        let mut records = 0u64;
        for file in &files {
            let mut scan = file.records();
            while let Some(record) = scan.next().await? {
                if !range.contains(&record.key) {
                    continue;
                }
                records += 1;
                if record.payload.is_empty() {
                    self.index.remove(record.key);
                } else {
                    self.index.put(record.key, record.location.raw())?;
                }
            }
        }
        let keys = (*range.start()..self.index.end())
            .filter(|key| self.index.get(*key).is_some())
            .count() as u64;
        debug!(
            partition = self.files.partition(),
            files = files.len(),
            records,
            keys,
            "rebuilt index"
        );
        Ok(keys)
    }

    /// Delete the file of a batch that will not be published.
    pub async fn discard(&self, staged: Staged<E::Blob>) -> Result<(), Error> {
        if let Some(file) = staged.file {
            self.files.discard(file).await?;
        }
        Ok(())
    }

    /// Persist the index next to the data files.
    pub async fn persist(&self) -> Result<(), Error> {
        let files = &self.files;
        self.index
            .write(files.context(), files.partition(), INDEX.as_bytes())
            .await?;
        Ok(())
    }

    /// Remove the index written by [Store::persist] (if any).
    pub async fn discard_persisted(&self) -> Result<(), Error> {
        let files = &self.files;
        remove_blob(files.context(), files.partition(), INDEX.as_bytes()).await?;
        Ok(())
    }

    /// Copy the data files and the index into `target`.
    pub async fn snapshot(&self, target: &str) -> Result<(), Error> {
        self.files.snapshot(target).await?;
        self.index
            .write(self.files.context(), target, INDEX.as_bytes())
            .await?;
        Ok(())
    }
}

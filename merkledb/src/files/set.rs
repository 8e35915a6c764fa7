use super::{
    copy_blob,
    file::{blob_id, blob_name},
    remove_blob, scan, DataFile, DiskLocation, Error, Writer, MAX_FILE_ID,
};
use bytes::Bytes;
use commonware_runtime::Storage;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};
use tracing::{debug, warn};

/// The collection of [DataFile]s that make up one store.
///
/// Files are addressed by id. Publishing a new file and applying the index updates that point
/// into it happen under a single lock that compaction also takes when choosing its inputs, so a
/// compactor never observes a file whose records are not yet indexed.
///
/// Removed files are retired rather than deleted: their blobs are only removed once no reader
/// holds the file anymore (see [FileSet::purge]).
pub struct FileSet<E: Storage> {
    context: E,
    partition: String,
    write_buffer: usize,

    files: RwLock<BTreeMap<u32, Arc<DataFile<E::Blob>>>>,
    publish: Mutex<()>,
    retired: Mutex<Vec<Arc<DataFile<E::Blob>>>>,

    next_id: AtomicU32,
    next_sequence: AtomicU64,
}

impl<E: Storage> FileSet<E> {
    /// Open (or create) the file set stored in `partition`.
    ///
    /// Files whose header was never completed (writers interrupted by a crash) are removed.
    pub async fn init(context: E, partition: &str, write_buffer: usize) -> Result<Self, Error> {
        let mut files = BTreeMap::new();
        let mut next_id = 1;
        let mut next_sequence = 1;
        for name in scan(&context, partition).await? {
            let Some(id) = blob_id(&name) else {
                continue;
            };
            let (blob, size) = context.open(partition, &name).await?;
            let file = match DataFile::open(blob, size).await {
                Ok(file) => file,
                Err(Error::InvalidHeader(_) | Error::Codec(_)) => {
                    warn!(partition, file = id, size, "removing incomplete data file");
                    remove_blob(&context, partition, &name).await?;
                    next_id = next_id.max(id + 1);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if file.id() != id {
                return Err(Error::InvalidFileName(name));
            }
            next_id = next_id.max(id + 1);
            next_sequence = next_sequence.max(file.sequence() + 1);
            files.insert(id, Arc::new(file));
        }
        debug!(partition, files = files.len(), next_id, "opened file set");

        Ok(Self {
            context,
            partition: partition.to_string(),
            write_buffer,
            files: RwLock::new(files),
            publish: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(next_id),
            next_sequence: AtomicU64::new(next_sequence),
        })
    }

    /// Partition holding the files of the set.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Runtime context the set performs I/O with.
    pub fn context(&self) -> &E {
        &self.context
    }

    /// Start writing a new file that supersedes every existing file.
    pub async fn create_writer(&self) -> Result<Writer<E>, Error> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.create_writer_with_sequence(sequence).await
    }

    /// Start writing a new file with an explicit sequence (used when merging existing files).
    pub async fn create_writer_with_sequence(&self, sequence: u64) -> Result<Writer<E>, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id > MAX_FILE_ID {
            return Err(Error::FileIdOverflow);
        }
        Writer::create(
            self.context.clone(),
            self.partition.clone(),
            id,
            sequence,
            self.write_buffer,
        )
        .await
    }

    /// Make `file` readable and run `apply` (typically index updates pointing into it) before any
    /// compactor can select the file.
    pub fn publish<R>(&self, file: Option<DataFile<E::Blob>>, apply: impl FnOnce() -> R) -> R {
        let _guard = self.publish.lock().unwrap();
        if let Some(file) = file {
            self.files
                .write()
                .unwrap()
                .insert(file.id(), Arc::new(file));
        }
        apply()
    }

    /// Files eligible for compaction (every published file), ordered by sequence.
    pub fn candidates(&self) -> Vec<Arc<DataFile<E::Blob>>> {
        let _guard = self.publish.lock().unwrap();
        self.files()
    }

    /// All published files, ordered from oldest to newest sequence.
    pub fn files(&self) -> Vec<Arc<DataFile<E::Blob>>> {
        let mut files: Vec<_> = self.files.read().unwrap().values().cloned().collect();
        files.sort_by_key(|file| (file.sequence(), file.id()));
        files
    }

    /// Number of published files.
    pub fn len(&self) -> usize {
        self.files.read().unwrap().len()
    }

    /// Returns true if no file is published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size in bytes of all published files.
    pub fn size(&self) -> u64 {
        self.files
            .read()
            .unwrap()
            .values()
            .map(|file| file.size())
            .sum()
    }

    /// Read the record at `location`.
    ///
    /// Returns `None` if the file was removed (the caller should consult its index again, as
    /// compaction rewrites locations before removing files).
    pub async fn read(&self, location: DiskLocation) -> Result<Option<(u64, Bytes)>, Error> {
        let file = self.files.read().unwrap().get(&location.file()).cloned();
        match file {
            Some(file) => file.read(location.offset()).await.map(Some),
            None => Ok(None),
        }
    }

    /// Stop serving the given files and delete them once no reader holds them.
    pub async fn remove(&self, ids: impl IntoIterator<Item = u32>) -> Result<(), Error> {
        {
            let mut files = self.files.write().unwrap();
            let mut retired = self.retired.lock().unwrap();
            for id in ids {
                if let Some(file) = files.remove(&id) {
                    retired.push(file);
                }
            }
        }
        self.purge().await
    }

    /// Delete the blobs of retired files that no reader holds anymore.
    pub async fn purge(&self) -> Result<(), Error> {
        let unused: Vec<_> = {
            let mut retired = self.retired.lock().unwrap();
            let (unused, held) = retired
                .drain(..)
                .partition(|file| Arc::strong_count(file) == 1);
            *retired = held;
            unused
        };
        for file in unused {
            let id = file.id();
            drop(file);
            remove_blob(&self.context, &self.partition, &blob_name(id)).await?;
            debug!(partition = %self.partition, file = id, "removed data file");
        }
        Ok(())
    }

    /// Delete a finished file that was never published.
    pub async fn discard(&self, file: DataFile<E::Blob>) -> Result<(), Error> {
        let id = file.id();
        drop(file);
        remove_blob(&self.context, &self.partition, &blob_name(id)).await?;
        debug!(partition = %self.partition, file = id, "discarded data file");
        Ok(())
    }

    /// Number of retired files still waiting for their readers.
    pub fn retired(&self) -> usize {
        self.retired.lock().unwrap().len()
    }

    /// Copy every published file into `target`, returning the number of files.
    pub async fn snapshot(&self, target: &str) -> Result<usize, Error> {
        let files = self.files();
        for file in &files {
            copy_blob(
                &self.context,
                file.blob(),
                file.size(),
                target,
                &blob_name(file.id()),
            )
            .await?;
        }
        debug!(partition = %self.partition, target, files = files.len(), "snapshotted file set");
        Ok(files.len())
    }
}

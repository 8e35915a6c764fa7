use super::{
    metadata::{self, Metadata, MetadataStore},
    Config, Error, Statistics,
};
use crate::{
    compaction::{Compactor, Coordinator, Executor},
    files::{copy_partition, remove_partition, scan, FileSet},
    hashes::{
        self, last_chunk_id, legacy_partition, max_chunk_id, Digest, HashChunk, HashChunkStore,
        HashFormat, StagedChunks,
    },
    index::{self, LongList, MemoryTracker},
    keys::{self, KeyToPath, Mutation, StagedKeys, ENTRIES_PER_BUCKET},
    leaves::{self, LeafRecord, LeafStore},
    path,
};
use async_lock::{Mutex, RwLock, RwLockReadGuard};
use commonware_runtime::{Clock, Metrics, Spawner, Storage};
use std::{
    collections::HashSet,
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Capacities of the indices of a table.
struct Layout {
    paths: u64,
    chunks: u64,
    buckets: u64,
    initial_buckets: u64,
}

impl Layout {
    fn new(cfg: &Config, initial_capacity: u64, chunk_height: u8) -> Result<Self, Error> {
        let paths = cfg.path_capacity().ok_or_else(|| {
            Error::InvalidConfig(format!("{} keys not addressable", cfg.max_num_of_keys))
        })?;
        let initial_buckets = initial_capacity
            .div_ceil(ENTRIES_PER_BUCKET)
            .next_power_of_two();
        let buckets = cfg
            .max_num_of_keys
            .div_ceil(ENTRIES_PER_BUCKET)
            .next_power_of_two()
            .max(initial_buckets);
        Ok(Self {
            paths,
            chunks: last_chunk_id(paths - 1, chunk_height) + 1,
            buckets,
            initial_buckets,
        })
    }

    fn index(&self, capacity: u64, cfg: &Config) -> index::Config {
        index::Config {
            capacity,
            chunk_size: cfg.index_chunk_size,
        }
    }
}

/// Table names become partition and metric prefixes, so they are restricted to `[A-Za-z0-9_]`.
pub(super) fn validate_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::InvalidTableName(name.to_string()));
    }
    Ok(())
}

/// Every partition of `table`, metadata last.
pub(super) fn partitions(table: &str) -> [String; 5] {
    [
        hashes::partition(table),
        legacy_partition(table),
        leaves::partition(table),
        keys::partition(table),
        metadata::partition(table),
    ]
}

/// Returns true if `table` holds any store.
async fn has_stores<E: Storage>(context: &E, table: &str) -> Result<bool, Error> {
    if !matches!(HashFormat::detect(context, table).await?, HashFormat::Empty) {
        return Ok(true);
    }
    for partition in [leaves::partition(table), keys::partition(table)] {
        if !scan(context, &partition).await?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Returns true if `table` holds metadata or any store.
pub(super) async fn exists<E: Storage + Clock + Metrics>(
    context: &E,
    table: &str,
) -> Result<bool, Error> {
    Ok(metadata::read(context, table).await?.is_some() || has_stores(context, table).await?)
}

/// Remove every partition of `table`.
pub(super) async fn remove<E: Storage>(context: &E, table: &str) -> Result<(), Error> {
    for partition in partitions(table) {
        remove_partition(context, &partition).await?;
    }
    Ok(())
}

/// Copy every partition of `source` into `target`, metadata last.
pub(super) async fn copy<E: Storage>(context: &E, source: &str, target: &str) -> Result<(), Error> {
    let mut blobs = 0;
    for (from, to) in partitions(source).iter().zip(partitions(target).iter()) {
        blobs += copy_partition(context, from, to).await?;
    }
    debug!(source, target, blobs, "copied table");
    Ok(())
}

/// One table of the tree.
///
/// Writers ([DataSource::save_records], [DataSource::snapshot], and [DataSource::close]) are
/// serialized by a write lock (which also guards the metadata store). Readers only contend with
/// the short critical section in which a written batch is made visible.
pub struct DataSource<E: Spawner + Storage + Clock + Metrics> {
    context: E,
    name: String,
    ephemeral: bool,

    initial_capacity: u64,
    hashes_ram_to_disk_threshold: u64,
    compaction_enabled: bool,
    min_files_to_compact: usize,
    path_capacity: u64,

    memory: Arc<MemoryTracker>,
    statistics: Arc<Statistics>,
    hashes: HashChunkStore<E>,
    leaves: LeafStore<E>,
    keys: KeyToPath<E>,
    coordinator: Coordinator<E>,

    metadata: Mutex<Option<MetadataStore<E>>>,
    visibility: RwLock<Option<RangeInclusive<u64>>>,
    snapshotting: AtomicBool,
    poisoned: AtomicBool,
    closed: AtomicBool,
}

impl<E: Spawner + Storage + Clock + Metrics> DataSource<E> {
    /// Open (or create) the table `name`.
    ///
    /// Metrics are registered with `context` (which the caller labels with the table name).
    pub(super) async fn init(
        context: E,
        name: &str,
        cfg: &Config,
        ephemeral: bool,
        executor: Arc<Executor>,
    ) -> Result<Self, Error> {
        validate_name(name)?;
        cfg.validate()?;
        let start = context.current();

        // Load the metadata, filling fields missing from older tables from the config
        let mut store = MetadataStore::init(context.clone(), name).await?;
        let existing = store.read()?;
        if existing.is_none() && has_stores(&context, name).await? {
            return Err(Error::MissingMetadata(name.to_string()));
        }
        let existed = existing.is_some();
        let metadata = existing.unwrap_or_default();
        let initial_capacity = metadata.initial_capacity.unwrap_or_else(|| {
            if existed {
                warn!(
                    table = name,
                    value = cfg.initial_capacity,
                    "initial capacity missing from metadata, using config"
                );
            }
            cfg.initial_capacity
        });
        let hashes_ram_to_disk_threshold =
            metadata.hashes_ram_to_disk_threshold.unwrap_or_else(|| {
                if existed {
                    warn!(
                        table = name,
                        value = cfg.hashes_ram_to_disk_threshold,
                        "hash threshold missing from metadata, using config"
                    );
                }
                cfg.hashes_ram_to_disk_threshold
            });
        let compaction_enabled = metadata.compaction_enabled.unwrap_or(cfg.compaction_enabled);
        if let Some(found) = metadata.chunk_height {
            if found != cfg.chunk_height {
                return Err(Error::InvalidChunkHeight {
                    expected: cfg.chunk_height,
                    found,
                });
            }
        }
        if initial_capacity == 0 || initial_capacity > cfg.max_num_of_keys {
            return Err(Error::InvalidConfig(format!(
                "initial capacity {initial_capacity} not in 1..={}",
                cfg.max_num_of_keys
            )));
        }
        let layout = Layout::new(cfg, initial_capacity, cfg.chunk_height)?;
        let range = metadata.leaves;
        if let Some(range) = &range {
            if *range.end() >= layout.paths {
                return Err(Error::InvalidRange(*range.start(), *range.end()));
            }
        }
        store
            .write(&Metadata {
                leaves: range.clone(),
                initial_capacity: Some(initial_capacity),
                hashes_ram_to_disk_threshold: Some(hashes_ram_to_disk_threshold),
                chunk_height: Some(cfg.chunk_height),
                compaction_enabled: Some(compaction_enabled),
            })
            .await?;

        // Open the stores
        let statistics = Arc::new(Statistics::default());
        statistics.register(&context);
        let memory = Arc::new(MemoryTracker::new(statistics.total_index_mb.clone()));
        let hashes = HashChunkStore::init(
            context.clone(),
            name,
            &hashes::Config {
                chunk_height: cfg.chunk_height,
                ram_to_disk_threshold: hashes_ram_to_disk_threshold,
                write_buffer: cfg.write_buffer,
                index: layout.index(layout.chunks, cfg),
                force_rebuild: cfg.force_index_rebuild,
            },
            range.as_ref().map(|range| *range.end()),
            memory.clone(),
            statistics.hash_index_mb.clone(),
        )
        .await?;
        let leaves = LeafStore::init(
            context.clone(),
            name,
            &leaves::Config {
                write_buffer: cfg.write_buffer,
                index: layout.index(layout.paths, cfg),
                force_rebuild: cfg.force_index_rebuild,
            },
            range.clone(),
            memory.clone(),
            statistics.leaf_index_mb.clone(),
        )
        .await?;
        let keys = KeyToPath::init(
            context.clone(),
            name,
            &keys::Config {
                initial_buckets: layout.initial_buckets,
                write_buffer: cfg.write_buffer,
                index: layout.index(layout.buckets, cfg),
                force_rebuild: cfg.force_index_rebuild,
            },
            memory.clone(),
            statistics.bucket_index_mb.clone(),
        )
        .await?;
        if cfg.tables_to_repair_index.iter().any(|table| table == name) {
            repair_keys(&keys, &leaves, range.as_ref()).await?;
        }

        // Keep file statistics current as compaction adds and removes files
        let listener = {
            let statistics = statistics.clone();
            let hashes = hashes.files().clone();
            let leaves = leaves.files().clone();
            let buckets = keys.files().clone();
            move || statistics.update_files(&hashes, &leaves, &buckets)
        };
        let coordinator = Coordinator::new(
            context.clone(),
            name,
            executor,
            compaction_enabled,
            statistics.compaction.clone(),
            listener,
        );

        let elapsed = context
            .current()
            .duration_since(start)
            .unwrap_or(Duration::ZERO);
        let source = Self {
            context,
            name: name.to_string(),
            ephemeral,
            initial_capacity,
            hashes_ram_to_disk_threshold,
            compaction_enabled,
            min_files_to_compact: cfg.min_files_to_compact,
            path_capacity: layout.paths,
            memory,
            statistics,
            hashes,
            leaves,
            keys,
            coordinator,
            metadata: Mutex::new(Some(store)),
            visibility: RwLock::new(range.clone()),
            snapshotting: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        source.update_file_statistics();
        info!(
            table = name,
            ?range,
            initial_capacity,
            hashes_ram_to_disk_threshold,
            compaction_enabled,
            ephemeral,
            ?elapsed,
            "opened table"
        );
        Ok(source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Paths of the first and last leaf (`None` if the tree has no leaves).
    pub async fn leaf_range(&self) -> Option<RangeInclusive<u64>> {
        self.visibility.read().await.clone()
    }

    pub fn chunk_height(&self) -> u8 {
        self.hashes.height()
    }

    pub fn initial_capacity(&self) -> u64 {
        self.initial_capacity
    }

    pub fn hashes_ram_to_disk_threshold(&self) -> u64 {
        self.hashes_ram_to_disk_threshold
    }

    /// Metrics of the table.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    /// Bytes reserved by the indices of the table.
    pub fn memory_reserved(&self) -> u64 {
        self.memory.reserved()
    }

    /// The compaction coordinator of the table.
    pub fn coordinator(&self) -> &Coordinator<E> {
        &self.coordinator
    }

    pub fn enable_background_compaction(&self) {
        self.coordinator.enable_background_compaction();
    }

    /// Interrupt running compactions and wait for them to stop. No compaction starts until
    /// [DataSource::enable_background_compaction] is called.
    pub async fn stop_and_disable_background_compaction(&self) {
        self.coordinator.stop_and_disable_background_compaction().await;
    }

    pub fn is_compaction_enabled(&self) -> bool {
        self.coordinator.is_compaction_enabled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true if a write failed after validation. A poisoned table rejects every write.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Save one state transition of the tree.
    ///
    /// `leaves` is the new leaf range. `chunks` replace the stored hash chunks with the same id,
    /// `dirty` leaves are written at their path, and `deleted` leaves are removed (unless the same
    /// key is also dirty). In a `reconnect`, a deleted key is only removed if it is still mapped
    /// to the path of the deleted leaf.
    ///
    /// Nothing is changed if the arguments are invalid. Once this returns, every read observes
    /// the whole batch.
    pub async fn save_records(
        &self,
        leaves: Option<RangeInclusive<u64>>,
        chunks: &[HashChunk],
        dirty: &[LeafRecord],
        deleted: &[LeafRecord],
        reconnect: bool,
    ) -> Result<(), Error> {
        let mut metadata = self.metadata.lock().await;
        let Some(store) = metadata.as_mut() else {
            return Err(Error::Closed);
        };
        if self.is_poisoned() {
            return Err(Error::Poisoned);
        }
        self.validate(leaves.as_ref(), chunks, dirty, deleted)?;
        if let Err(err) = self
            .flush(store, leaves, chunks, dirty, deleted, reconnect)
            .await
        {
            self.poisoned.store(true, Ordering::Release);
            error!(table = %self.name, ?err, "failed to save records");
            return Err(err);
        }
        Ok(())
    }

    fn validate(
        &self,
        leaves: Option<&RangeInclusive<u64>>,
        chunks: &[HashChunk],
        dirty: &[LeafRecord],
        deleted: &[LeafRecord],
    ) -> Result<(), Error> {
        if let Some(range) = leaves {
            let (first, last) = (*range.start(), *range.end());
            if first > last {
                return Err(Error::InvalidRange(first, last));
            }
            if !path::is_valid(last) {
                return Err(Error::InvalidPath(last));
            }
            if last >= self.path_capacity {
                return Err(Error::InvalidRange(first, last));
            }
        }
        let height = self.hashes.height();
        let last_chunk = leaves.map(|range| last_chunk_id(*range.end(), height));
        for chunk in chunks {
            if chunk.height() != height {
                return Err(Error::InvalidChunkHeight {
                    expected: height,
                    found: chunk.height(),
                });
            }
            if last_chunk.is_none_or(|last| chunk.id() > last) {
                return Err(Error::InvalidChunkId(chunk.id()));
            }
        }
        for record in dirty {
            if !path::is_valid(record.path) {
                return Err(Error::InvalidPath(record.path));
            }
            if !leaves.is_some_and(|range| range.contains(&record.path)) {
                return Err(Error::PathOutOfRange(record.path));
            }
        }
        if let Some(record) = deleted.iter().find(|record| !path::is_valid(record.path)) {
            return Err(Error::InvalidPath(record.path));
        }
        Ok(())
    }

    async fn flush(
        &self,
        store: &mut MetadataStore<E>,
        leaves: Option<RangeInclusive<u64>>,
        chunks: &[HashChunk],
        dirty: &[LeafRecord],
        deleted: &[LeafRecord],
        reconnect: bool,
    ) -> Result<(), Error> {
        let start = self.context.current();
        let last_chunk = leaves
            .as_ref()
            .map(|range| last_chunk_id(*range.end(), self.hashes.height()));
        let count = leaves
            .as_ref()
            .map_or(0, |range| range.end() - range.start() + 1);

        // An update of a key wins over its deletion
        let updated: HashSet<&[u8]> = dirty.iter().map(|record| record.key.as_ref()).collect();
        let mut mutations: Vec<Mutation> = dirty
            .iter()
            .map(|record| Mutation::Put {
                key: record.key.clone(),
                path: record.path,
            })
            .collect();
        for record in deleted {
            if updated.contains(record.key.as_ref()) {
                continue;
            }
            mutations.push(if reconnect {
                Mutation::DeleteIfEqual {
                    key: record.key.clone(),
                    path: record.path,
                }
            } else {
                Mutation::Delete {
                    key: record.key.clone(),
                }
            });
        }
        let deletes = mutations.len() - dirty.len();

        // Write every store's share of the batch
        let staged_chunks = self.hashes.stage(chunks).await?;
        let staged_keys = match self.keys.stage(&mutations, count).await {
            Ok(staged) => staged,
            Err(err) => {
                self.discard(staged_chunks, None).await;
                return Err(err.into());
            }
        };
        let staged_leaves = match self
            .leaves
            .stage(dirty, staged_keys.vacated(), leaves.as_ref())
            .await
        {
            Ok(staged) => staged,
            Err(err) => {
                self.discard(staged_chunks, Some(staged_keys)).await;
                return Err(err.into());
            }
        };
        let tombstones = staged_leaves.removed();

        // Make the batch visible
        {
            let mut visible = self.visibility.write().await;
            self.hashes.update_valid_range(last_chunk)?;
            self.leaves.update_valid_range(leaves.clone())?;
            self.hashes.publish(staged_chunks)?;
            self.keys.publish(staged_keys)?;
            self.leaves.publish(staged_leaves)?;
            *visible = leaves.clone();
        }
        store.write(&self.metadata(leaves.clone())).await?;

        self.statistics.flushes.inc();
        self.statistics.chunks_written.inc_by(chunks.len() as u64);
        self.statistics.leaves_written.inc_by(dirty.len() as u64);
        self.statistics.leaves_deleted.inc_by(deletes as u64);
        self.update_file_statistics();
        let elapsed = self
            .context
            .current()
            .duration_since(start)
            .unwrap_or(Duration::ZERO);
        debug!(
            table = %self.name,
            ?leaves,
            chunks = chunks.len(),
            dirty = dirty.len(),
            deletes,
            tombstones,
            ?elapsed,
            "saved records"
        );

        self.compact_in_background();
        Ok(())
    }

    /// Remove the files of a batch that failed before it was published.
    async fn discard(&self, chunks: StagedChunks<E>, keys: Option<StagedKeys<E>>) {
        if let Err(err) = self.hashes.discard(chunks).await {
            warn!(table = %self.name, ?err, "failed to discard staged chunks");
        }
        if let Some(keys) = keys {
            if let Err(err) = self.keys.discard(keys).await {
                warn!(table = %self.name, ?err, "failed to discard staged buckets");
            }
        }
    }

    /// Take a read lock on the visible state, failing if the table is closed.
    async fn visible(&self) -> Result<RwLockReadGuard<'_, Option<RangeInclusive<u64>>>, Error> {
        let visible = self.visibility.read().await;
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(visible)
    }

    /// Load the leaf stored at `path`.
    ///
    /// Fails with [Error::PathOutOfRange] above the last leaf path. Returns `None` for a path
    /// that holds no leaf.
    pub async fn load_leaf_record(&self, path: u64) -> Result<Option<LeafRecord>, Error> {
        if !path::is_valid(path) {
            return Err(Error::InvalidPath(path));
        }
        let visible = self.visible().await?;
        let Some(range) = visible.as_ref() else {
            return Err(Error::PathOutOfRange(path));
        };
        if path > *range.end() {
            return Err(Error::PathOutOfRange(path));
        }
        if path < *range.start() {
            return Ok(None);
        }
        self.statistics.leaf_reads.inc();
        Ok(self.leaves.get(path).await?)
    }

    /// Load the leaf holding `key`.
    ///
    /// Keys mapped outside of the leaf range (left behind by older states of the tree) are
    /// reported as absent.
    pub async fn load_leaf_record_by_key(&self, key: &[u8]) -> Result<Option<LeafRecord>, Error> {
        let visible = self.visible().await?;
        self.statistics.leaf_key_reads.inc();
        let Some(path) = self.keys.get(key).await? else {
            return Ok(None);
        };
        if !visible.as_ref().is_some_and(|range| range.contains(&path)) {
            return Ok(None);
        }
        self.statistics.leaf_reads.inc();
        Ok(self
            .leaves
            .get(path)
            .await?
            .filter(|record| record.key.as_ref() == key))
    }

    /// Find the path `key` is mapped to, without checking it against the leaf range.
    pub async fn find_key(&self, key: &[u8]) -> Result<Option<u64>, Error> {
        let _visible = self.visible().await?;
        self.statistics.leaf_key_reads.inc();
        Ok(self.keys.get(key).await?)
    }

    /// Load the hash chunk with the given id.
    pub async fn load_hash_chunk(&self, id: u64) -> Result<Option<HashChunk>, Error> {
        let height = self.hashes.height();
        if id > max_chunk_id(height) {
            return Err(Error::InvalidChunkId(id));
        }
        let visible = self.visible().await?;
        let Some(range) = visible.as_ref() else {
            return Ok(None);
        };
        if id > last_chunk_id(*range.end(), height) {
            return Ok(None);
        }
        self.statistics.hash_reads.inc();
        Ok(self.hashes.get(id).await?)
    }

    /// Load the hash of `path` (`None` beyond the last leaf or if it was never set).
    ///
    /// A hash of all zeroes marks an unset slot and also loads as `None`.
    pub async fn load_hash(&self, path: u64) -> Result<Option<Digest>, Error> {
        if !path::is_valid(path) {
            return Err(Error::InvalidPath(path));
        }
        let visible = self.visible().await?;
        if !visible.as_ref().is_some_and(|range| path <= *range.end()) {
            return Ok(None);
        }
        self.statistics.hash_reads.inc();
        Ok(self.hashes.hash(path).await?)
    }

    /// Merge the files of every store not already being compacted in the background, returning
    /// the number of files merged.
    pub async fn compact(&self) -> Result<usize, Error> {
        let metadata = self.metadata.lock().await;
        if metadata.is_none() {
            return Err(Error::Closed);
        }
        let mut merged = 0;
        for (files, index) in self.stores() {
            if self.coordinator.is_compaction_running(files.partition()) {
                continue;
            }
            let compactor = Compactor::new(
                files.clone(),
                index.clone(),
                self.coordinator.gate().clone(),
                1,
            );
            if let Some(summary) = compactor.compact().await? {
                merged += summary.files;
            }
        }
        self.update_file_statistics();
        Ok(merged)
    }

    fn stores(&self) -> [(&Arc<FileSet<E>>, &Arc<LongList>); 3] {
        [
            (self.hashes.files(), self.hashes.index()),
            (self.leaves.files(), self.leaves.index()),
            (self.keys.files(), self.keys.index()),
        ]
    }

    /// Submit a background compaction for every store holding enough files, returning the
    /// number submitted.
    pub fn compact_in_background(&self) -> usize {
        if !self.coordinator.is_compaction_enabled() {
            return 0;
        }
        let mut submitted = 0;
        for (files, index) in self.stores() {
            if files.len() < self.min_files_to_compact {
                continue;
            }
            let compactor = Compactor::new(
                files.clone(),
                index.clone(),
                self.coordinator.gate().clone(),
                self.min_files_to_compact,
            );
            if self.coordinator.compact_if_not_running_yet(compactor) {
                submitted += 1;
            }
        }
        submitted
    }

    fn update_file_statistics(&self) {
        self.statistics
            .update_files(self.hashes.files(), self.leaves.files(), self.keys.files());
    }

    fn metadata(&self, leaves: Option<RangeInclusive<u64>>) -> Metadata {
        Metadata {
            leaves,
            initial_capacity: Some(self.initial_capacity),
            hashes_ram_to_disk_threshold: Some(self.hashes_ram_to_disk_threshold),
            chunk_height: Some(self.hashes.height()),
            compaction_enabled: Some(self.compaction_enabled),
        }
    }

    /// Write a consistent copy of the table to the new table `target`.
    ///
    /// Data files are copied and indices are written in full. The metadata of `target` is
    /// written last and a table without metadata cannot be opened, so a failed snapshot never
    /// leaves an openable table behind (its partitions are removed).
    pub async fn snapshot(&self, target: &str) -> Result<(), Error> {
        validate_name(target)?;
        if self.snapshotting.swap(true, Ordering::AcqRel) {
            return Err(Error::SnapshotInProgress);
        }
        let result = self.snapshot_exclusive(target).await;
        self.snapshotting.store(false, Ordering::Release);
        result
    }

    async fn snapshot_exclusive(&self, target: &str) -> Result<(), Error> {
        let metadata = self.metadata.lock().await;
        if metadata.is_none() {
            return Err(Error::Closed);
        }
        if target == self.name || exists(&self.context, target).await? {
            return Err(Error::TargetExists(target.to_string()));
        }
        let start = self.context.current();

        // Keep compactors from moving index entries or removing files while copying
        self.coordinator.pause_compaction().await;
        let result = self.write_snapshot(target).await;
        self.coordinator.resume_compaction();
        if let Err(err) = result {
            if let Err(cleanup) = remove(&self.context, target).await {
                warn!(table = %self.name, target, ?cleanup, "failed to remove partial snapshot");
            }
            return Err(err);
        }
        let elapsed = self
            .context
            .current()
            .duration_since(start)
            .unwrap_or(Duration::ZERO);
        info!(table = %self.name, target, ?elapsed, "snapshot complete");
        Ok(())
    }

    async fn write_snapshot(&self, target: &str) -> Result<(), Error> {
        self.hashes.snapshot(target).await?;
        self.leaves.snapshot(target).await?;
        self.keys.snapshot(target).await?;
        let leaves = self.leaf_range().await;
        metadata::write(&self.context, target, &self.metadata(leaves)).await
    }

    /// Stop compaction, persist the indices, and release their memory.
    ///
    /// Ephemeral tables are deleted instead. Closing an already closed table does nothing, and
    /// every other operation fails with [Error::Closed] afterwards.
    pub async fn close(&self) -> Result<(), Error> {
        let mut metadata = self.metadata.lock().await;
        let Some(store) = metadata.take() else {
            return Ok(());
        };
        {
            let _visible = self.visibility.write().await;
            self.closed.store(true, Ordering::Release);
        }
        self.coordinator.stop_and_disable_background_compaction().await;
        let result = if self.ephemeral {
            store.destroy().await
        } else {
            self.persist(store).await
        };
        for (_, index) in self.stores() {
            index.release();
        }
        if self.ephemeral {
            if let Err(err) = remove(&self.context, &self.name).await {
                warn!(table = %self.name, ?err, "failed to remove ephemeral table");
            }
        }
        info!(table = %self.name, ephemeral = self.ephemeral, "closed table");
        result
    }

    async fn persist(&self, mut store: MetadataStore<E>) -> Result<(), Error> {
        self.hashes.persist().await?;
        self.leaves.persist().await?;
        self.keys.persist().await?;
        let leaves = self.leaf_range().await;
        store.write(&self.metadata(leaves)).await?;
        store.close().await
    }
}

/// Rebuild the key map from the leaves in `range`.
async fn repair_keys<E: Storage>(
    keys: &KeyToPath<E>,
    leaves: &LeafStore<E>,
    range: Option<&RangeInclusive<u64>>,
) -> Result<(), Error> {
    let mut entries = Vec::new();
    if let Some(range) = range {
        for path in range.clone() {
            if let Some(record) = leaves.get(path).await? {
                entries.push((record.key, path));
            }
        }
    }
    let count = range.map_or(0, |range| range.end() - range.start() + 1);
    keys.repair(entries, count).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        files::{exists as blob_exists, write_blob, MAX_FILE_ID},
        hashes::{path_to_chunk_id, DIGEST_SIZE},
        path::MAX_PATH,
        source::Builder,
        store::INDEX,
    };
    use commonware_codec::Encode;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::{BTreeMap, BTreeSet};
    use test_case::test_case;

    const HEIGHT: u8 = 3;
    const TABLE: &str = "accounts";

    fn config() -> Config {
        Config {
            initial_capacity: 100,
            hashes_ram_to_disk_threshold: 40,
            chunk_height: HEIGHT,
            compaction_enabled: false,
            min_files_to_compact: 2,
            index_chunk_size: 64,
            max_num_of_keys: 10_000,
            write_buffer: 4096,
            ..Config::default()
        }
    }

    fn builder(context: &deterministic::Context, cfg: Config) -> Builder<deterministic::Context> {
        Builder::new(context.clone(), cfg).with_executor(Arc::new(Executor::new(2)))
    }

    fn digest(seed: u64) -> Digest {
        let mut bytes = [0xabu8; DIGEST_SIZE];
        bytes[..8].copy_from_slice(&seed.to_be_bytes());
        Digest::from(bytes)
    }

    fn key(i: u64) -> Vec<u8> {
        format!("key{i}").into_bytes()
    }

    fn leaf(path: u64, i: u64) -> LeafRecord {
        LeafRecord::new(path, key(i), format!("value{i}").into_bytes())
    }

    /// Build the chunks holding `hashes`.
    fn chunks(hashes: &BTreeMap<u64, Digest>) -> Vec<HashChunk> {
        let mut chunks: BTreeMap<u64, HashChunk> = BTreeMap::new();
        for (path, hash) in hashes {
            let id = path_to_chunk_id(*path, HEIGHT);
            chunks
                .entry(id)
                .or_insert_with(|| HashChunk::with_id(id, HEIGHT).unwrap())
                .set_hash_at_path(*path, *hash)
                .unwrap();
        }
        chunks.into_values().collect()
    }

    async fn assert_hashes(
        source: &DataSource<deterministic::Context>,
        hashes: &BTreeMap<u64, Digest>,
    ) {
        for (path, hash) in hashes {
            assert_eq!(
                source.load_hash(*path).await.unwrap(),
                Some(*hash),
                "path {path}"
            );
        }
    }

    #[test_case(0; "all on disk")]
    #[test_case(63; "half in memory")]
    #[test_case(u64::MAX; "all in memory")]
    fn test_hashes_survive_updates_and_reopen(threshold: u64) {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let builder = builder(
                &context,
                Config {
                    hashes_ram_to_disk_threshold: threshold,
                    ..config()
                },
            );
            let mut rng = StdRng::seed_from_u64(0);

            // Create a tree with 64 leaves
            let source = builder.build(TABLE).await.unwrap();
            let mut hashes: BTreeMap<u64, Digest> =
                (1..=126).map(|path| (path, digest(rng.gen()))).collect();
            source
                .save_records(Some(63..=126), &chunks(&hashes), &[], &[], false)
                .await
                .unwrap();
            assert_hashes(&source, &hashes).await;

            // Update random paths, writing only the chunks that changed
            let mut touched = BTreeSet::new();
            for _ in 0..50 {
                let path = rng.gen_range(1..=126);
                hashes.insert(path, digest(rng.gen()));
                touched.insert(path_to_chunk_id(path, HEIGHT));
            }
            let changed: Vec<HashChunk> = chunks(&hashes)
                .into_iter()
                .filter(|chunk| touched.contains(&chunk.id()))
                .collect();
            source
                .save_records(Some(63..=126), &changed, &[], &[], false)
                .await
                .unwrap();
            assert_hashes(&source, &hashes).await;
            assert_eq!(source.load_hash(127).await.unwrap(), None);
            source.close().await.unwrap();

            // Reopen and compare every chunk
            let source = builder.build(TABLE).await.unwrap();
            assert_eq!(source.leaf_range().await, Some(63..=126));
            assert_hashes(&source, &hashes).await;
            for chunk in chunks(&hashes) {
                let loaded = source.load_hash_chunk(chunk.id()).await.unwrap().unwrap();
                assert_eq!(loaded.encode(), chunk.encode(), "chunk {}", chunk.id());
            }
            source.close().await.unwrap();
        });
    }

    async fn check_moved(source: &DataSource<deterministic::Context>) {
        assert_eq!(source.leaf_range().await, Some(4..=8));
        assert_eq!(source.load_leaf_record(3).await.unwrap(), None);
        assert_eq!(source.find_key(&key(0)).await.unwrap(), Some(7));
        assert_eq!(
            source.load_leaf_record_by_key(&key(0)).await.unwrap(),
            Some(leaf(7, 0))
        );
        for i in 1..4 {
            assert_eq!(
                source.load_leaf_record(3 + i).await.unwrap(),
                Some(leaf(3 + i, i))
            );
        }
        assert_eq!(source.load_leaf_record(8).await.unwrap(), Some(leaf(8, 4)));
    }

    #[test_traced]
    fn test_leaf_moves_survive_compaction_and_rebuild() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // Create a tree with 4 leaves
            let source = builder(&context, config()).build(TABLE).await.unwrap();
            let initial: Vec<LeafRecord> = (0..4).map(|i| leaf(3 + i, i)).collect();
            source
                .save_records(Some(3..=6), &[], &initial, &[], false)
                .await
                .unwrap();

            // Add a fifth leaf (the leaf at 3 moves to 7)
            source
                .save_records(Some(4..=8), &[], &[leaf(7, 0), leaf(8, 4)], &[], false)
                .await
                .unwrap();
            check_moved(&source).await;

            // Merge every file
            assert!(source.compact().await.unwrap() > 0);
            assert_eq!(source.leaves.files().len(), 1);
            check_moved(&source).await;
            source.close().await.unwrap();

            // Reopen ignoring persisted indices
            let rebuild = Config {
                force_index_rebuild: true,
                ..config()
            };
            let source = builder(&context, rebuild).build(TABLE).await.unwrap();
            check_moved(&source).await;
            source.close().await.unwrap();
        });
    }

    #[test_case(false; "plain delete")]
    #[test_case(true; "reconnect")]
    fn test_delete_of_moved_key(reconnect: bool) {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = builder(&context, config()).build(TABLE).await.unwrap();

            // Create leaves for keys 0..4 at paths 3..=6
            let initial: Vec<LeafRecord> = (0..4).map(|i| leaf(3 + i, i)).collect();
            source
                .save_records(Some(3..=6), &[], &initial, &[], reconnect)
                .await
                .unwrap();

            // Move key 0 to path 7 and add key 4 at path 8
            source
                .save_records(
                    Some(4..=8),
                    &[],
                    &[leaf(7, 0), leaf(8, 4)],
                    &[],
                    reconnect,
                )
                .await
                .unwrap();

            // Delete key 0 at the path it was first written to
            source
                .save_records(Some(4..=8), &[], &[], &[leaf(3, 0)], reconnect)
                .await
                .unwrap();
            if reconnect {
                // The key was remapped since, so the stale delete is ignored
                assert_eq!(source.find_key(&key(0)).await.unwrap(), Some(7));
                assert_eq!(source.load_leaf_record(7).await.unwrap(), Some(leaf(7, 0)));
            } else {
                assert_eq!(source.find_key(&key(0)).await.unwrap(), None);
                assert_eq!(source.load_leaf_record(7).await.unwrap(), None);
            }
            assert_eq!(source.find_key(&key(4)).await.unwrap(), Some(8));
            source.close().await.unwrap();
        });
    }

    #[test_case(false; "plain delete")]
    #[test_case(true; "reconnect")]
    fn test_delete_of_stale_key_keeps_new_leaf(reconnect: bool) {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = builder(&context, config()).build(TABLE).await.unwrap();
            let initial: Vec<LeafRecord> = (8..=16).map(|i| leaf(i, i)).collect();
            source
                .save_records(Some(8..=16), &[], &initial, &[], reconnect)
                .await
                .unwrap();

            // Drop path 8 from the range without deleting its key
            source
                .save_records(
                    Some(9..=18),
                    &[],
                    &[leaf(17, 17), leaf(18, 18)],
                    &[],
                    reconnect,
                )
                .await
                .unwrap();
            assert_eq!(source.find_key(&key(8)).await.unwrap(), Some(8));

            // Reuse path 8 for another key
            source
                .save_records(Some(8..=18), &[], &[leaf(8, 100)], &[], reconnect)
                .await
                .unwrap();

            // Deleting the stale key removes its entry but not the new leaf
            source
                .save_records(Some(8..=18), &[], &[], &[leaf(8, 8)], reconnect)
                .await
                .unwrap();
            assert_eq!(source.find_key(&key(8)).await.unwrap(), None);
            assert_eq!(source.find_key(&key(100)).await.unwrap(), Some(8));
            assert_eq!(source.load_leaf_record(8).await.unwrap(), Some(leaf(8, 100)));
            assert_eq!(
                source.load_leaf_record_by_key(&key(100)).await.unwrap(),
                Some(leaf(8, 100))
            );
            source.close().await.unwrap();

            // The leaf survives a rebuild from data files
            let rebuild = Config {
                force_index_rebuild: true,
                ..config()
            };
            let source = builder(&context, rebuild).build(TABLE).await.unwrap();
            assert_eq!(source.load_leaf_record(8).await.unwrap(), Some(leaf(8, 100)));
            source.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_update_wins_over_delete_of_same_key() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = builder(&context, config()).build(TABLE).await.unwrap();
            source
                .save_records(Some(1..=2), &[], &[leaf(1, 0), leaf(2, 1)], &[], false)
                .await
                .unwrap();

            // Delete and rewrite key 1 in the same batch
            let updated = LeafRecord::new(2, key(1), b"updated".to_vec());
            source
                .save_records(Some(1..=2), &[], &[updated.clone()], &[leaf(2, 1)], false)
                .await
                .unwrap();
            assert_eq!(
                source.load_leaf_record_by_key(&key(1)).await.unwrap(),
                Some(updated)
            );
            assert_eq!(source.statistics().leaves_deleted.get(), 0);
            source.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_snapshot_and_restore() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let builder = builder(&context, config());
            let mut rng = StdRng::seed_from_u64(1);

            // Create a tree with 32 leaves (hashes split between memory and disk)
            let source = builder.build(TABLE).await.unwrap();
            let hashes: BTreeMap<u64, Digest> =
                (1..=62).map(|path| (path, digest(rng.gen()))).collect();
            let leaves: Vec<LeafRecord> = (0..32).map(|i| leaf(31 + i, i)).collect();
            source
                .save_records(Some(31..=62), &chunks(&hashes), &leaves, &[], false)
                .await
                .unwrap();

            // Snapshot
            source.snapshot("snapshot").await.unwrap();
            assert!(matches!(
                source.snapshot("snapshot").await,
                Err(Error::TargetExists(_))
            ));
            assert!(matches!(
                source.snapshot(TABLE).await,
                Err(Error::TargetExists(_))
            ));

            // Restore twice
            let first = builder.restore("snapshot", "first").await.unwrap();
            let second = builder.restore("snapshot", "second").await.unwrap();
            let last = last_chunk_id(62, HEIGHT);
            for restored in [&first, &second] {
                assert_eq!(restored.leaf_range().await, Some(31..=62));
                for id in 0..=last {
                    let expected = source
                        .load_hash_chunk(id)
                        .await
                        .unwrap()
                        .map(|c| c.encode());
                    let found = restored
                        .load_hash_chunk(id)
                        .await
                        .unwrap()
                        .map(|c| c.encode());
                    assert_eq!(found, expected, "chunk {id}");
                }
                for record in &leaves {
                    assert_eq!(
                        restored
                            .load_leaf_record_by_key(&record.key)
                            .await
                            .unwrap()
                            .as_ref(),
                        Some(record)
                    );
                }
            }

            // Diverge the first restore
            first
                .save_records(Some(31..=62), &[], &[leaf(31, 100)], &[leaf(31, 0)], false)
                .await
                .unwrap();
            assert_eq!(first.find_key(&key(0)).await.unwrap(), None);
            assert_eq!(second.find_key(&key(0)).await.unwrap(), Some(31));
            assert_eq!(source.find_key(&key(100)).await.unwrap(), None);
            first.close().await.unwrap();
            second.close().await.unwrap();
            source.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_missing_indices_are_rebuilt() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let builder = builder(
                &context,
                Config {
                    hashes_ram_to_disk_threshold: 0,
                    ..config()
                },
            );
            let mut rng = StdRng::seed_from_u64(2);

            // Create a table across several flushes
            let source = builder.build(TABLE).await.unwrap();
            let mut hashes = BTreeMap::new();
            for round in 0..3u64 {
                for path in 1..=30 {
                    hashes.insert(path, digest(rng.gen()));
                }
                let leaves: Vec<LeafRecord> =
                    (0..16).map(|i| leaf(15 + i, i + round)).collect();
                source
                    .save_records(Some(15..=30), &chunks(&hashes), &leaves, &[], false)
                    .await
                    .unwrap();
            }
            source.close().await.unwrap();

            // Remove every index
            for partition in [
                hashes::partition(TABLE),
                leaves::partition(TABLE),
                keys::partition(TABLE),
            ] {
                assert!(blob_exists(&context, &partition, INDEX.as_bytes())
                    .await
                    .unwrap());
                context
                    .remove(&partition, Some(INDEX.as_bytes()))
                    .await
                    .unwrap();
            }

            // Reopen and check the latest state is served
            let source = builder.build(TABLE).await.unwrap();
            assert_hashes(&source, &hashes).await;
            for i in 0..16 {
                assert_eq!(
                    source.load_leaf_record(15 + i).await.unwrap(),
                    Some(leaf(15 + i, i + 2))
                );
                assert_eq!(source.find_key(&key(i + 2)).await.unwrap(), Some(15 + i));
            }
            source.close().await.unwrap();
        });
    }

    #[test_case(false; "without repair")]
    #[test_case(true; "with repair")]
    fn test_stale_keys(repair: bool) {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // Write leaves at 8..=16, then shift the range without deleting the key at 8
            let source = builder(&context, config()).build(TABLE).await.unwrap();
            let leaves: Vec<LeafRecord> = (8..=16).map(|path| leaf(path, path)).collect();
            source
                .save_records(Some(8..=16), &[], &leaves, &[], false)
                .await
                .unwrap();
            source
                .save_records(Some(9..=18), &[], &[leaf(17, 17), leaf(18, 18)], &[], false)
                .await
                .unwrap();
            assert_eq!(source.find_key(&key(8)).await.unwrap(), Some(8));
            assert_eq!(source.load_leaf_record_by_key(&key(8)).await.unwrap(), None);
            source.snapshot("snapshot").await.unwrap();
            source.close().await.unwrap();

            // Restore (repairing the key map if requested)
            let tables_to_repair_index = if repair {
                vec!["restored".to_string()]
            } else {
                Vec::new()
            };
            let restored = builder(
                &context,
                Config {
                    tables_to_repair_index,
                    ..config()
                },
            )
            .restore("snapshot", "restored")
            .await
            .unwrap();
            let expected = if repair { None } else { Some(8) };
            assert_eq!(restored.find_key(&key(8)).await.unwrap(), expected);
            for path in 9..=18 {
                assert_eq!(restored.find_key(&key(path)).await.unwrap(), Some(path));
            }
            restored.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_close_is_idempotent() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = builder(&context, config()).build(TABLE).await.unwrap();
            source
                .save_records(Some(1..=1), &[], &[leaf(1, 1)], &[], false)
                .await
                .unwrap();
            assert!(source.memory_reserved() > 0);
            source.close().await.unwrap();
            source.close().await.unwrap();
            assert!(source.is_closed());
            assert_eq!(source.memory_reserved(), 0);

            // Every operation fails once closed
            assert!(matches!(
                source.save_records(Some(1..=1), &[], &[], &[], false).await,
                Err(Error::Closed)
            ));
            assert!(matches!(
                source.load_leaf_record(1).await,
                Err(Error::Closed)
            ));
            assert!(matches!(
                source.load_leaf_record_by_key(&key(1)).await,
                Err(Error::Closed)
            ));
            assert!(matches!(source.find_key(&key(1)).await, Err(Error::Closed)));
            assert!(matches!(
                source.load_hash_chunk(0).await,
                Err(Error::Closed)
            ));
            assert!(matches!(source.load_hash(1).await, Err(Error::Closed)));
            assert!(matches!(source.compact().await, Err(Error::Closed)));
            assert!(matches!(
                source.snapshot("snapshot").await,
                Err(Error::Closed)
            ));
        });
    }

    #[test_traced]
    fn test_close_while_saving() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let builder = builder(&context, config());
            let source = Arc::new(builder.build(TABLE).await.unwrap());

            // Save from another task until the table closes
            let writer = context.with_label("writer").spawn({
                let source = source.clone();
                move |_| async move {
                    let mut saved = 0;
                    for i in 1..=200u64 {
                        match source
                            .save_records(Some(1..=i), &[], &[leaf(i, i)], &[], false)
                            .await
                        {
                            Ok(()) => saved = i,
                            Err(Error::Closed) => break,
                            Err(err) => panic!("unexpected error: {err}"),
                        }
                    }
                    saved
                }
            });
            context.sleep(Duration::from_millis(5)).await;
            source.close().await.unwrap();
            let saved = writer.await.unwrap();
            drop(source);

            // The reopened table holds every batch that was acknowledged
            let source = builder.build(TABLE).await.unwrap();
            if saved == 0 {
                assert_eq!(source.leaf_range().await, None);
            } else {
                assert_eq!(source.leaf_range().await, Some(1..=saved));
                for i in 1..=saved {
                    assert_eq!(source.find_key(&key(i)).await.unwrap(), Some(i));
                }
            }
            source.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_boundaries() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = builder(&context, config()).build(TABLE).await.unwrap();

            // An empty table has no leaves and no hashes
            assert!(matches!(
                source.load_leaf_record(1).await,
                Err(Error::PathOutOfRange(1))
            ));
            assert_eq!(source.load_hash_chunk(0).await.unwrap(), None);
            assert_eq!(source.load_hash(1).await.unwrap(), None);
            assert!(matches!(
                source.load_hash_chunk(u64::MAX).await,
                Err(Error::InvalidChunkId(u64::MAX))
            ));

            source
                .save_records(Some(3..=6), &[], &[leaf(4, 4)], &[], false)
                .await
                .unwrap();
            assert_eq!(source.load_leaf_record(3).await.unwrap(), None);
            assert_eq!(source.load_leaf_record(1).await.unwrap(), None);
            assert!(matches!(
                source.load_leaf_record(7).await,
                Err(Error::PathOutOfRange(7))
            ));
            assert!(matches!(
                source.load_leaf_record(MAX_PATH + 1).await,
                Err(Error::InvalidPath(_))
            ));
            assert!(matches!(
                source.load_hash(u64::MAX).await,
                Err(Error::InvalidPath(_))
            ));
            assert_eq!(
                source
                    .load_hash_chunk(last_chunk_id(6, HEIGHT) + 1)
                    .await
                    .unwrap(),
                None
            );

            // Invalid batches are rejected without side effects
            let cases: Vec<(Option<RangeInclusive<u64>>, Vec<HashChunk>, Vec<LeafRecord>)> = vec![
                (Some(6..=3), vec![], vec![]),
                (Some(3..=MAX_PATH + 1), vec![], vec![]),
                (Some(3..=20_000), vec![], vec![]),
                (Some(3..=6), vec![], vec![leaf(7, 7)]),
                (None, vec![], vec![leaf(3, 3)]),
                (Some(3..=6), vec![HashChunk::with_id(100, HEIGHT).unwrap()], vec![]),
                (Some(3..=6), vec![HashChunk::with_id(0, HEIGHT + 1).unwrap()], vec![]),
                (None, vec![HashChunk::with_id(0, HEIGHT).unwrap()], vec![]),
            ];
            for (range, chunks, dirty) in cases {
                let err = source
                    .save_records(range.clone(), &chunks, &dirty, &[], false)
                    .await
                    .unwrap_err();
                assert!(err.is_argument(), "{range:?}: {err}");
            }
            assert!(matches!(
                source
                    .save_records(Some(3..=6), &[], &[], &[leaf(MAX_PATH + 1, 1)], false)
                    .await,
                Err(Error::InvalidPath(_))
            ));
            assert!(!source.is_poisoned());
            assert_eq!(source.leaf_range().await, Some(3..=6));
            assert_eq!(source.statistics().flushes.get(), 1);

            // Valid batches still apply
            source
                .save_records(Some(3..=6), &[], &[leaf(3, 3)], &[], false)
                .await
                .unwrap();
            assert_eq!(source.load_leaf_record(3).await.unwrap(), Some(leaf(3, 3)));

            // Removing every leaf empties the table
            source
                .save_records(None, &[], &[], &[leaf(3, 3), leaf(4, 4)], false)
                .await
                .unwrap();
            assert_eq!(source.leaf_range().await, None);
            assert_eq!(source.find_key(&key(3)).await.unwrap(), None);
            assert!(matches!(
                source.load_leaf_record(3).await,
                Err(Error::PathOutOfRange(3))
            ));
            source.close().await.unwrap();
        });
    }

    #[test_case(0; "all on disk")]
    #[test_case(49; "half in memory")]
    #[test_case(98; "last leaf")]
    #[test_case(196; "beyond the tree")]
    fn test_migrates_legacy_table(threshold: u64) {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // Create a table written before chunks (and most metadata fields) existed
            let legacy: Vec<Digest> = (0..=98)
                .map(|path| if path == 0 { Digest::ZERO } else { digest(path) })
                .collect();
            hashes::write_legacy_ram(&context, TABLE, &legacy).await;
            metadata::write(
                &context,
                TABLE,
                &Metadata {
                    leaves: Some(49..=98),
                    ..Metadata::default()
                },
            )
            .await
            .unwrap();

            // Open it
            let cfg = Config {
                hashes_ram_to_disk_threshold: threshold,
                ..config()
            };
            let source = builder(&context, cfg).build(TABLE).await.unwrap();
            assert_eq!(source.leaf_range().await, Some(49..=98));
            assert_eq!(source.initial_capacity(), 100);
            assert_eq!(source.hashes_ram_to_disk_threshold(), threshold);
            assert_eq!(source.chunk_height(), HEIGHT);
            for path in 1..=98 {
                assert_eq!(source.load_hash(path).await.unwrap(), Some(digest(path)));
            }
            source.close().await.unwrap();

            // The migrated table has complete metadata
            let metadata = metadata::read(&context, TABLE).await.unwrap().unwrap();
            assert_eq!(metadata.chunk_height, Some(HEIGHT));
            assert_eq!(metadata.initial_capacity, Some(100));
            assert_eq!(metadata.hashes_ram_to_disk_threshold, Some(threshold));
            assert_eq!(
                HashFormat::detect(&context, TABLE).await.unwrap(),
                HashFormat::Chunked
            );
        });
    }

    #[test_traced]
    fn test_rejects_mismatched_tables() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = builder(&context, config()).build(TABLE).await.unwrap();
            source.close().await.unwrap();

            // Open with another chunk height
            let result = builder(
                &context,
                Config {
                    chunk_height: HEIGHT + 1,
                    ..config()
                },
            )
            .build(TABLE)
            .await;
            assert!(matches!(
                result,
                Err(Error::InvalidChunkHeight { expected, found }) if expected == HEIGHT + 1 && found == HEIGHT
            ));

            // Open without metadata
            remove_partition(&context, &metadata::partition(TABLE))
                .await
                .unwrap();
            let result = builder(&context, config()).build(TABLE).await;
            assert!(matches!(result, Err(Error::MissingMetadata(_))));
        });
    }

    #[test_traced]
    fn test_background_compaction() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                compaction_enabled: true,
                ..config()
            };
            let source = builder(&context, cfg).build(TABLE).await.unwrap();
            assert!(source.is_compaction_enabled());

            // Rewrite the same leaves repeatedly
            for round in 0..6u64 {
                let leaves: Vec<LeafRecord> =
                    (0..8).map(|i| leaf(7 + i, i + 10 * round)).collect();
                source
                    .save_records(Some(7..=14), &[], &leaves, &[], false)
                    .await
                    .unwrap();
            }
            while source.coordinator().running() > 0 {
                context.sleep(Duration::from_millis(1)).await;
            }

            // Compactions ran and the statistics track the remaining files
            let statistics = source.statistics();
            assert!(statistics.compaction.completed.get() > 0);
            assert_eq!(
                statistics.leaf_files.get(),
                source.leaves.files().len() as i64
            );
            assert_eq!(
                statistics.bucket_files.get(),
                source.keys.files().len() as i64
            );
            for i in 0..8 {
                assert_eq!(
                    source.load_leaf_record(7 + i).await.unwrap(),
                    Some(leaf(7 + i, i + 50))
                );
            }

            // Once disabled, flushes no longer start compactions
            source.stop_and_disable_background_compaction().await;
            let completed = statistics.compaction.completed.get();
            source
                .save_records(Some(7..=14), &[], &[leaf(7, 99)], &[], false)
                .await
                .unwrap();
            assert_eq!(source.coordinator().running(), 0);
            assert_eq!(statistics.compaction.completed.get(), completed);
            source.close().await.unwrap();
        });
    }

    #[test_case(false; "open gate")]
    #[test_case(true; "paused gate")]
    fn test_stop_interrupts_running_compactions(paused: bool) {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                initial_capacity: 1_000,
                hashes_ram_to_disk_threshold: 0,
                max_num_of_keys: 200_000,
                index_chunk_size: 4096,
                write_buffer: 1 << 16,
                ..config()
            };
            let source = builder(&context, cfg).build(TABLE).await.unwrap();

            // Write 100,000 leaves in two flushes so that every store holds two files
            const LEAVES: u64 = 100_000;
            let (first, last) = (LEAVES - 1, 2 * LEAVES - 2);
            let hashes: BTreeMap<u64, Digest> = (1..=14).map(|path| (path, digest(path))).collect();
            for half in [first..first + LEAVES / 2, first + LEAVES / 2..last + 1] {
                let leaves: Vec<LeafRecord> =
                    half.map(|path| leaf(path, path - first)).collect();
                source
                    .save_records(Some(first..=last), &chunks(&hashes), &leaves, &[], false)
                    .await
                    .unwrap();
            }
            for (files, _) in source.stores() {
                assert_eq!(files.len(), 2, "{}", files.partition());
            }

            // Start compacting all three stores
            let executor = source.coordinator().executor().clone();
            let completed = executor.completed_task_count();
            source.enable_background_compaction();
            assert_eq!(source.compact_in_background(), 3);
            if paused {
                source.coordinator().pause_compaction().await;
            }

            // Stop them
            context.sleep(Duration::from_millis(20)).await;
            let start = context.current();
            source.stop_and_disable_background_compaction().await;
            let elapsed = context.current().duration_since(start).unwrap();
            assert!(elapsed <= Duration::from_millis(100), "{elapsed:?}");
            assert_eq!(source.coordinator().running(), 0);
            assert_eq!(executor.queued(), 0);
            assert_eq!(executor.completed_task_count(), completed + 3);
            if paused {
                source.coordinator().resume_compaction();
            }

            // Every leaf is still served
            for path in [first, first + LEAVES / 2, last] {
                assert_eq!(
                    source.load_leaf_record(path).await.unwrap(),
                    Some(leaf(path, path - first))
                );
            }
            assert_eq!(source.compact_in_background(), 0);
            source.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_snapshot_during_background_compaction() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                initial_capacity: 1_000,
                hashes_ram_to_disk_threshold: 0,
                max_num_of_keys: 200_000,
                index_chunk_size: 4096,
                write_buffer: 1 << 16,
                ..config()
            };
            let builder = builder(&context, cfg);
            let source = builder.build(TABLE).await.unwrap();

            // Two flushes leave two files in every store
            const LEAVES: u64 = 100_000;
            let (first, last) = (LEAVES - 1, 2 * LEAVES - 2);
            let hashes: BTreeMap<u64, Digest> = (1..=14).map(|path| (path, digest(path))).collect();
            for half in [first..first + LEAVES / 2, first + LEAVES / 2..last + 1] {
                let leaves: Vec<LeafRecord> =
                    half.map(|path| leaf(path, path - first)).collect();
                source
                    .save_records(Some(first..=last), &chunks(&hashes), &leaves, &[], false)
                    .await
                    .unwrap();
            }

            // Snapshot while all three stores are being merged
            let completed = source.statistics().compaction.completed.get();
            source.enable_background_compaction();
            assert_eq!(source.compact_in_background(), 3);
            context.sleep(Duration::from_millis(20)).await;
            assert_eq!(source.coordinator().running(), 3);
            source.snapshot("snapshot").await.unwrap();

            // The compactions resume and finish after the snapshot
            while source.coordinator().running() > 0 {
                context.sleep(Duration::from_millis(1)).await;
            }
            assert_eq!(
                source.statistics().compaction.completed.get(),
                completed + 3
            );
            for (files, _) in source.stores() {
                assert_eq!(files.len(), 1, "{}", files.partition());
            }

            // The restored table serves exactly what the source serves
            let restored = builder.restore("snapshot", "restored").await.unwrap();
            assert_eq!(restored.leaf_range().await, Some(first..=last));
            for id in 0..=last_chunk_id(14, HEIGHT) {
                let expected = source
                    .load_hash_chunk(id)
                    .await
                    .unwrap()
                    .map(|c| c.encode());
                let found = restored
                    .load_hash_chunk(id)
                    .await
                    .unwrap()
                    .map(|c| c.encode());
                assert_eq!(found, expected, "chunk {id}");
            }
            for path in (first..=last).step_by(997).chain([first + LEAVES / 2, last]) {
                let expected = source
                    .load_leaf_record(path)
                    .await
                    .unwrap()
                    .map(|r| r.encode());
                let found = restored
                    .load_leaf_record(path)
                    .await
                    .unwrap()
                    .map(|r| r.encode());
                assert!(found.is_some(), "path {path}");
                assert_eq!(found, expected, "path {path}");
            }
            restored.close().await.unwrap();
            source.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_failed_write_poisons_table() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let builder = builder(&context, config());
            let source = builder.build(TABLE).await.unwrap();
            source
                .save_records(Some(1..=1), &[], &[leaf(1, 1)], &[], false)
                .await
                .unwrap();
            source.close().await.unwrap();

            // Leave an incomplete file with the largest id so that no new leaf file can be created
            write_blob(
                &context,
                &leaves::partition(TABLE),
                &MAX_FILE_ID.to_be_bytes(),
                vec![0; 4],
            )
            .await
            .unwrap();
            let source = builder.build(TABLE).await.unwrap();
            let hash_files = source.hashes.files().len();
            let bucket_blobs = scan(&context, &keys::partition(TABLE)).await.unwrap();
            let err = source
                .save_records(Some(1..=2), &[], &[leaf(2, 2)], &[], false)
                .await
                .unwrap_err();
            assert!(!err.is_argument());
            assert!(source.is_poisoned());

            // Files staged by the other stores were discarded
            assert_eq!(
                scan(&context, &keys::partition(TABLE)).await.unwrap(),
                bucket_blobs
            );
            assert_eq!(source.hashes.files().len(), hash_files);

            // Reads keep working but writes are refused
            assert_eq!(source.leaf_range().await, Some(1..=1));
            assert_eq!(source.find_key(&key(1)).await.unwrap(), Some(1));
            assert!(matches!(
                source.save_records(Some(1..=1), &[], &[], &[], false).await,
                Err(Error::Poisoned)
            ));
            source.close().await.unwrap();

            // The last acknowledged state survives
            let source = builder.build(TABLE).await.unwrap();
            assert_eq!(source.leaf_range().await, Some(1..=1));
            assert_eq!(source.find_key(&key(2)).await.unwrap(), None);
            assert_eq!(source.load_leaf_record(1).await.unwrap(), Some(leaf(1, 1)));
            source.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_ephemeral_table_is_removed() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = builder(&context, config())
                .build_ephemeral(TABLE)
                .await
                .unwrap();
            source
                .save_records(Some(1..=2), &[], &[leaf(1, 1), leaf(2, 2)], &[], false)
                .await
                .unwrap();
            source.close().await.unwrap();
            assert!(!exists(&context, TABLE).await.unwrap());
        });
    }

    #[test_traced]
    fn test_metrics() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let source = builder(&context, config()).build(TABLE).await.unwrap();
            source
                .save_records(Some(1..=2), &[], &[leaf(1, 1), leaf(2, 2)], &[], false)
                .await
                .unwrap();
            source.load_leaf_record(1).await.unwrap();
            source.find_key(&key(2)).await.unwrap();

            let buffer = context.encode();
            assert!(buffer.contains("accounts_flushes_total 1"));
            assert!(buffer.contains("accounts_leaves_written_total 2"));
            assert!(buffer.contains("accounts_leaf_reads_total 1"));
            assert!(buffer.contains("accounts_leaf_key_reads_total 1"));
            assert!(buffer.contains("accounts_leaf_files 1"));
            source.close().await.unwrap();
        });
    }
}

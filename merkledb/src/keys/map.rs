use super::{
    bucket::{bucket_id, key_hash, Bucket},
    Config, Error, Mutation,
};
use crate::{
    files::{read_blob, write_blob, FileSet},
    index::{LongList, MemoryGauge, MemoryTracker},
    store::{load_index, Batch, Staged, Store},
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{
    Decode, DecodeExt, Encode, Error as CodecError, FixedSize, Read as CodecRead,
    Write as CodecWrite,
};
use commonware_runtime::Storage;
use std::{
    collections::{btree_map, BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, info};

/// Name of the index resolving bucket ids.
pub(super) const STORE_NAME: &str = "keyToPath";

/// Blob holding the bucket count of the map.
const COUNT: &[u8] = b"buckets";
const COUNT_MAGIC: &[u8; 4] = b"MKBM";

/// Average number of keys per bucket the map grows to before doubling.
pub const ENTRIES_PER_BUCKET: u64 = 16;

/// Partition holding the key map of `table`.
pub fn partition(table: &str) -> String {
    format!("{table}-keys")
}

/// Returns the number of buckets needed to hold `keys` keys.
pub fn buckets_for(keys: u64, min: u64, max: u64) -> u64 {
    let mut buckets = min.max(1);
    while keys > buckets * ENTRIES_PER_BUCKET && buckets * 2 <= max {
        buckets *= 2;
    }
    buckets
}

/// The number of buckets of a map, as persisted in the [COUNT] blob.
struct BucketCount(u64);

impl FixedSize for BucketCount {
    const SIZE: usize = 16;
}

impl CodecWrite for BucketCount {
    fn write(&self, buf: &mut impl BufMut) {
        let mut body = [0u8; 12];
        let mut cursor = &mut body[..];
        cursor.put_slice(COUNT_MAGIC);
        cursor.put_u64(self.0);
        buf.put_slice(&body);
        buf.put_u32(crc32fast::hash(&body));
    }
}

impl CodecRead for BucketCount {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::EndOfBuffer);
        }
        let mut body = [0u8; 12];
        buf.copy_to_slice(&mut body);
        if crc32fast::hash(&body) != buf.get_u32() {
            return Err(CodecError::Invalid("BucketCount", "checksum mismatch"));
        }
        let mut body = &body[..];
        if &body[..4] != COUNT_MAGIC {
            return Err(CodecError::Invalid("BucketCount", "bad magic"));
        }
        body.advance(4);
        Ok(Self(body.get_u64()))
    }
}

async fn read_count<E: Storage>(context: &E, partition: &str) -> Result<Option<u64>, Error> {
    match read_blob(context, partition, COUNT).await? {
        Some(data) => Ok(Some(BucketCount::decode(data.as_slice())?.0)),
        None => Ok(None),
    }
}

async fn write_count<E: Storage>(context: &E, partition: &str, buckets: u64) -> Result<(), Error> {
    let data = BucketCount(buckets).encode().to_vec();
    write_blob(context, partition, COUNT, data).await?;
    Ok(())
}

/// Bucket updates written but not yet visible.
pub struct StagedKeys<E: Storage> {
    staged: Staged<E::Blob>,
    buckets: u64,
    vacated: Vec<(u64, Bytes)>,
}

impl<E: Storage> StagedKeys<E> {
    /// Paths the map no longer resolves to, with the key that was mapped there (keys that were
    /// moved or removed).
    ///
    /// A key entry may be stale, so the leaf stored at a vacated path does not necessarily hold
    /// its key.
    pub fn vacated(&self) -> &[(u64, Bytes)] {
        &self.vacated
    }

    /// Number of buckets the map will have once published.
    pub fn buckets(&self) -> u64 {
        self.buckets
    }

    /// Number of buckets rewritten.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

/// A bucket being rewritten by a batch.
struct Slot {
    bucket: Bucket,
    stored: bool,
    changed: bool,
}

impl Slot {
    /// The part of bucket `source_id` (read under the current count) that maps to `id` once the
    /// map has `buckets` buckets.
    fn split(source: Option<&Bucket>, source_id: u64, id: u64, buckets: u64) -> Self {
        match source {
            Some(bucket) => Self {
                bucket: bucket.split_off(id, buckets),
                stored: id == source_id,
                changed: false,
            },
            None => Self {
                bucket: Bucket::new(id),
                stored: false,
                changed: false,
            },
        }
    }

    async fn write<E: Storage>(&self, batch: &mut Batch<E>, id: u64) -> Result<(), Error> {
        if !self.changed {
            return Ok(());
        }
        if self.bucket.is_empty() {
            // Emptied buckets become tombstones
            if self.stored {
                batch.remove(id).await?;
            }
            return Ok(());
        }
        batch.put(id, &self.bucket.encode()).await?;
        Ok(())
    }
}

/// Buckets read (under the current bucket count) and rewritten (under the new one) by a batch.
struct Working<'a, E: Storage> {
    map: &'a KeyToPath<E>,
    current: u64,
    target: u64,
    loaded: HashMap<u64, Option<Bucket>>,
    slots: BTreeMap<u64, Slot>,
}

impl<'a, E: Storage> Working<'a, E> {
    fn new(map: &'a KeyToPath<E>, target: u64) -> Self {
        Self {
            map,
            current: map.buckets(),
            target,
            loaded: HashMap::new(),
            slots: BTreeMap::new(),
        }
    }

    async fn slot(&mut self, id: u64) -> Result<&mut Slot, Error> {
        let slot = match self.slots.entry(id) {
            btree_map::Entry::Occupied(entry) => entry.into_mut(),
            btree_map::Entry::Vacant(entry) => {
                // The bucket currently holding the keys of `id`
                let source = id & (self.current - 1);
                if !self.loaded.contains_key(&source) {
                    let bucket = self.map.read(source).await?;
                    self.loaded.insert(source, bucket);
                }
                let bucket = self.loaded.get(&source).and_then(Option::as_ref);
                entry.insert(Slot::split(bucket, source, id, self.target))
            }
        };
        Ok(slot)
    }

    /// Write every bucket of the new count, reading one current bucket at a time.
    ///
    /// Buckets touched by the batch are taken from the working set. Every other bucket is split
    /// from its source as it is written, so only one untouched bucket is held at once.
    async fn write_resized(&mut self, batch: &mut Batch<E>) -> Result<(), Error> {
        for source in 0..self.current {
            let bucket = match self.loaded.remove(&source) {
                Some(bucket) => bucket,
                None => self.map.read(source).await?,
            };
            for id in (source..self.target).step_by(self.current as usize) {
                let mut slot = self.slots.remove(&id).unwrap_or_else(|| {
                    Slot::split(bucket.as_ref(), source, id, self.target)
                });
                slot.changed = true;
                slot.write(batch, id).await?;
            }
        }
        Ok(())
    }
}

/// A hash map from leaf keys to paths whose buckets live on disk.
///
/// Buckets are records of a file set keyed by bucket id. Only the bucket index (one location per
/// bucket) is kept in memory.
pub struct KeyToPath<E: Storage> {
    context: E,
    partition: String,
    store: Store<E>,
    buckets: AtomicU64,
    min_buckets: u64,
}

impl<E: Storage> KeyToPath<E> {
    /// Open the key map of `table`.
    pub async fn init(
        context: E,
        table: &str,
        cfg: &Config,
        memory: Arc<MemoryTracker>,
        gauge: MemoryGauge,
    ) -> Result<Self, Error> {
        let partition = partition(table);

        // Load the persisted bucket index (removed so that a crash never leaves a stale copy)
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
        let store = Store::init(context.clone(), &partition, cfg.write_buffer, index).await?;
        if rebuild && !store.files().is_empty() {
            let buckets = store.rebuild_index().await?;
            info!(
                partition,
                buckets,
                forced = cfg.force_rebuild,
                "rebuilt bucket index"
            );
        }

        // Recover the bucket count
        let min_buckets = cfg.initial_buckets.max(1);
        let buckets = match read_count(&context, &partition).await? {
            Some(buckets) => buckets,
            None if store.files().is_empty() => min_buckets,
            // Keys never live above the highest stored bucket, so the smallest count covering it
            // places every key where it was written
            None => store.index().end().next_power_of_two(),
        };
        if !buckets.is_power_of_two() || buckets > cfg.index.capacity {
            return Err(Error::InvalidBucketCount(buckets));
        }
        write_count(&context, &partition, buckets).await?;
        debug!(partition, buckets, "opened key map");
        Ok(Self {
            context,
            partition,
            store,
            buckets: AtomicU64::new(buckets),
            min_buckets,
        })
    }

    /// Current number of buckets.
    pub fn buckets(&self) -> u64 {
        self.buckets.load(Ordering::Acquire)
    }

    /// Data files of the map.
    pub fn files(&self) -> &Arc<FileSet<E>> {
        self.store.files()
    }

    /// Index of the map.
    pub fn index(&self) -> &Arc<LongList> {
        self.store.index()
    }

    async fn read(&self, id: u64) -> Result<Option<Bucket>, Error> {
        match self.store.get(id).await? {
            Some(bytes) => Bucket::decode_cfg(bytes, &id)
                .map(Some)
                .map_err(|err| Error::InvalidBucket(id, err)),
            None => Ok(None),
        }
    }

    /// Get the path `key` is mapped to.
    pub async fn get(&self, key: &[u8]) -> Result<Option<u64>, Error> {
        let hash = key_hash(key);
        let id = bucket_id(hash, self.buckets());
        Ok(self.read(id).await?.and_then(|bucket| bucket.get(key, hash)))
    }

    /// Number of buckets needed once the tree holds `leaves` leaves.
    fn target(&self, leaves: u64) -> u64 {
        let max = prev_power_of_two(self.store.index().capacity());
        buckets_for(leaves, self.buckets(), max)
    }

    /// Write the buckets changed by `mutations` without making them visible.
    ///
    /// Mutations are applied in order. If the tree will hold more than
    /// [ENTRIES_PER_BUCKET] keys per bucket once the batch is applied, every bucket is split as
    /// part of the same batch (streaming over the current buckets) and the new bucket count is
    /// persisted with it.
    pub async fn stage(
        &self,
        mutations: &[Mutation],
        leaves: u64,
    ) -> Result<StagedKeys<E>, Error> {
        let target = self.target(leaves);
        let mut working = Working::new(self, target);

        // Apply the mutations
        let mut vacated = Vec::new();
        for mutation in mutations {
            let hash = key_hash(mutation.key());
            let slot = working.slot(bucket_id(hash, target)).await?;
            match mutation {
                Mutation::Put { key, path } => {
                    if let Some(old) = slot.bucket.put(key.clone(), hash, *path) {
                        if old != *path {
                            vacated.push((old, key.clone()));
                        }
                    }
                    slot.changed = true;
                }
                Mutation::Delete { key } => {
                    if let Some(old) = slot.bucket.remove(key, hash) {
                        vacated.push((old, key.clone()));
                        slot.changed = true;
                    }
                }
                Mutation::DeleteIfEqual { key, path } => {
                    if slot.bucket.remove_if_equal(key, hash, *path) {
                        vacated.push((*path, key.clone()));
                        slot.changed = true;
                    }
                }
            }
        }

        // Write the changed buckets (every bucket when growing)
        let resized = target != working.current;
        let mut batch = self.store.batch();
        let written = async {
            if resized {
                working.write_resized(&mut batch).await?;
            }
            for (id, slot) in &working.slots {
                slot.write(&mut batch, *id).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(err) = written {
            batch.abort().await;
            return Err(err);
        }
        let staged = batch.finish().await?;
        if resized {
            write_count(&self.context, &self.partition, target).await?;
        }
        Ok(StagedKeys {
            staged,
            buckets: target,
            vacated,
        })
    }

    /// Make staged buckets visible to readers.
    pub fn publish(&self, staged: StagedKeys<E>) -> Result<(), Error> {
        let StagedKeys {
            staged, buckets, ..
        } = staged;
        let previous = self.buckets();
        self.store.publish(staged)?;
        if buckets != previous {
            self.buckets.store(buckets, Ordering::Release);
            info!(previous, buckets, "resized key map");
        }
        Ok(())
    }

    /// Delete staged buckets that will not be published, restoring the persisted bucket count.
    pub async fn discard(&self, staged: StagedKeys<E>) -> Result<(), Error> {
        let StagedKeys {
            staged, buckets, ..
        } = staged;
        self.store.discard(staged).await?;
        if buckets != self.buckets() {
            write_count(&self.context, &self.partition, self.buckets()).await?;
        }
        Ok(())
    }

    /// Replace the contents of the map with `entries` (key and path pairs).
    ///
    /// Every existing data file is removed once the new one is published.
    pub async fn repair(
        &self,
        entries: impl IntoIterator<Item = (Bytes, u64)>,
        leaves: u64,
    ) -> Result<(), Error> {
        let buckets = buckets_for(
            leaves,
            self.min_buckets,
            prev_power_of_two(self.store.index().capacity()),
        );
        let mut rebuilt: BTreeMap<u64, Bucket> = BTreeMap::new();
        let mut keys = 0u64;
        for (key, path) in entries {
            let hash = key_hash(&key);
            let id = bucket_id(hash, buckets);
            rebuilt
                .entry(id)
                .or_insert_with(|| Bucket::new(id))
                .put(key, hash, path);
            keys += 1;
        }
        let mut batch = self.store.batch();
        for (id, bucket) in &rebuilt {
            if let Err(err) = batch.put(*id, &bucket.encode()).await {
                batch.abort().await;
                return Err(err.into());
            }
        }
        let staged = batch.finish().await?;

        // Forget every existing bucket before publishing the rebuilt ones
        let stale: Vec<u32> = self.files().files().iter().map(|file| file.id()).collect();
        let last = self.store.index().capacity().saturating_sub(1);
        self.store.update_valid_range(None)?;
        self.store.update_valid_range(Some(0..=last))?;
        self.store.publish(staged)?;
        self.files().remove(stale.iter().copied()).await?;
        write_count(&self.context, &self.partition, buckets).await?;
        self.buckets.store(buckets, Ordering::Release);
        info!(
            partition = self.partition,
            keys,
            buckets,
            removed = stale.len(),
            "repaired key map"
        );
        Ok(())
    }

    /// Persist the bucket index and bucket count next to the data files.
    pub async fn persist(&self) -> Result<(), Error> {
        self.store.persist().await?;
        write_count(&self.context, &self.partition, self.buckets()).await
    }

    /// Copy the map into the key partition of table `target`.
    pub async fn snapshot(&self, target: &str) -> Result<(), Error> {
        let target = partition(target);
        self.store.snapshot(&target).await?;
        write_count(&self.context, &target, self.buckets()).await
    }
}

fn prev_power_of_two(value: u64) -> u64 {
    if value == 0 {
        return 0;
    }
    1 << (63 - value.leading_zeros())
}

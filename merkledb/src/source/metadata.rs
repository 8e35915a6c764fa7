use super::Error;
use commonware_runtime::{Clock, Metrics, Storage};
use commonware_storage::metadata::{self, Metadata as Store};
use commonware_utils::sequence::U64;
use std::ops::RangeInclusive;
use tracing::debug;

const FIRST_LEAF: u64 = 1;
const LAST_LEAF: u64 = 2;
const INITIAL_CAPACITY: u64 = 3;
const RAM_TO_DISK_THRESHOLD: u64 = 4;
const CHUNK_HEIGHT: u64 = 5;
const COMPACTION_ENABLED: u64 = 6;

const KEYS: [u64; 6] = [
    FIRST_LEAF,
    LAST_LEAF,
    INITIAL_CAPACITY,
    RAM_TO_DISK_THRESHOLD,
    CHUNK_HEIGHT,
    COMPACTION_ENABLED,
];

/// Partition holding the metadata of `table`.
pub(super) fn partition(table: &str) -> String {
    format!("{table}-metadata")
}

/// Persistent description of a table.
///
/// Every field is optional so that metadata written by older versions (which lacked some of
/// them) still loads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Paths of the first and last leaf (`None` if the tree has no leaves).
    pub leaves: Option<RangeInclusive<u64>>,
    pub initial_capacity: Option<u64>,
    pub hashes_ram_to_disk_threshold: Option<u64>,
    pub chunk_height: Option<u8>,
    pub compaction_enabled: Option<bool>,
}

/// The metadata of one table, kept in a [commonware_storage::metadata::Metadata] store.
pub(super) struct MetadataStore<E: Clock + Storage + Metrics> {
    store: Store<E, U64, u64>,
}

impl<E: Clock + Storage + Metrics> MetadataStore<E> {
    /// Open the metadata store of `table`.
    pub async fn init(context: E, table: &str) -> Result<Self, Error> {
        let store = Store::init(
            context.with_label("metadata"),
            metadata::Config {
                partition: partition(table),
                codec_config: (),
            },
        )
        .await?;
        Ok(Self { store })
    }

    fn get(&self, key: u64) -> Option<u64> {
        self.store.get(&U64::new(key)).copied()
    }

    /// The stored metadata (`None` if nothing was ever written).
    pub fn read(&self) -> Result<Option<Metadata>, Error> {
        if KEYS.iter().all(|key| self.get(*key).is_none()) {
            return Ok(None);
        }
        let leaves = match (self.get(FIRST_LEAF), self.get(LAST_LEAF)) {
            (Some(first), Some(last)) if first <= last => Some(first..=last),
            (None, None) => None,
            (first, last) => {
                return Err(Error::InvalidMetadata(format!(
                    "leaf range {first:?}..={last:?}"
                )))
            }
        };
        let chunk_height = match self.get(CHUNK_HEIGHT) {
            Some(value) => Some(
                u8::try_from(value)
                    .map_err(|_| Error::InvalidMetadata(format!("chunk height {value}")))?,
            ),
            None => None,
        };
        Ok(Some(Metadata {
            leaves,
            initial_capacity: self.get(INITIAL_CAPACITY),
            hashes_ram_to_disk_threshold: self.get(RAM_TO_DISK_THRESHOLD),
            chunk_height,
            compaction_enabled: self.get(COMPACTION_ENABLED).map(|value| value != 0),
        }))
    }

    fn set(&mut self, key: u64, value: Option<u64>) {
        let key = U64::new(key);
        match value {
            Some(value) => {
                self.store.put(key, value);
            }
            None => {
                self.store.remove(&key);
            }
        }
    }

    /// Replace the stored metadata with `metadata` and sync it.
    pub async fn write(&mut self, metadata: &Metadata) -> Result<(), Error> {
        let leaves = metadata.leaves.as_ref();
        self.set(FIRST_LEAF, leaves.map(|range| *range.start()));
        self.set(LAST_LEAF, leaves.map(|range| *range.end()));
        self.set(INITIAL_CAPACITY, metadata.initial_capacity);
        self.set(RAM_TO_DISK_THRESHOLD, metadata.hashes_ram_to_disk_threshold);
        self.set(CHUNK_HEIGHT, metadata.chunk_height.map(u64::from));
        self.set(COMPACTION_ENABLED, metadata.compaction_enabled.map(u64::from));
        self.store.sync().await?;
        debug!(?metadata, "wrote metadata");
        Ok(())
    }

    pub async fn close(self) -> Result<(), Error> {
        self.store.close().await?;
        Ok(())
    }

    /// Remove the metadata of the table.
    pub async fn destroy(self) -> Result<(), Error> {
        self.store.destroy().await?;
        Ok(())
    }
}

/// Write `metadata` as the metadata of `table`.
pub(super) async fn write<E: Clock + Storage + Metrics>(
    context: &E,
    table: &str,
    metadata: &Metadata,
) -> Result<(), Error> {
    let mut store = MetadataStore::init(context.clone(), table).await?;
    store.write(metadata).await?;
    store.close().await
}

/// Read the metadata of `table` (`None` if it has none).
pub(super) async fn read<E: Clock + Storage + Metrics>(
    context: &E,
    table: &str,
) -> Result<Option<Metadata>, Error> {
    let store = MetadataStore::init(context.clone(), table).await?;
    let metadata = store.read();
    store.close().await?;
    metadata
}

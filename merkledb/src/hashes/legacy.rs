use super::{chunk::last_chunk_id, storage::HashChunkStore, Config, Digest, Error, HashChunk};
use crate::{
    files::{read_blob, remove_partition, scan},
    index::{self, LongList, MemoryGauge, MemoryTracker},
    path::{self, MAX_RANK},
    store::Store,
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    DecodeExt, EncodeSize, Error as CodecError, FixedSize, Read as CodecRead, ReadExt,
    Write as CodecWrite,
};
use commonware_runtime::Storage;
use std::sync::Arc;
use tracing::info;

/// Blob holding the flat list of low hashes.
const RAM: &[u8] = b"ram";
const STORE_NAME: &str = "internalHashes";
const MAGIC: &[u8; 4] = b"MKHL";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 16;

/// Chunks migrated per data file.
const MIGRATION_BATCH: usize = 4096;

/// Partition holding the legacy hashes of `table`.
pub fn partition(table: &str) -> String {
    format!("{table}-legacy-hashes")
}

/// The layout used to store the hashes of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashFormat {
    /// Hashes are grouped into chunks.
    Chunked,

    /// One hash per path, split between a flat in-memory list and a file set keyed by path.
    Legacy { ram: bool, disk: bool },

    /// The table has no hashes yet.
    Empty,
}

impl HashFormat {
    /// Detect the layout of `table`.
    ///
    /// Legacy blobs take precedence: they are only removed once a migration completes, so their
    /// presence next to chunks means that migration was interrupted.
    pub async fn detect<E: Storage>(context: &E, table: &str) -> Result<Self, Error> {
        let legacy = scan(context, &partition(table)).await?;
        let ram = legacy.iter().any(|name| name == RAM);
        let disk = legacy.iter().any(|name| name != RAM);
        if ram || disk {
            return Ok(Self::Legacy { ram, disk });
        }
        if scan(context, &super::partition(table)).await?.is_empty() {
            Ok(Self::Empty)
        } else {
            Ok(Self::Chunked)
        }
    }
}

/// The flat list of hashes kept in memory by legacy tables, indexed by path.
struct LegacyHashes(Vec<Digest>);

impl EncodeSize for LegacyHashes {
    fn encode_size(&self) -> usize {
        HEADER_SIZE + self.0.len() * Digest::SIZE + 4
    }
}

impl CodecWrite for LegacyHashes {
    fn write(&self, buf: &mut impl BufMut) {
        let mut body = Vec::with_capacity(self.encode_size());
        body.put_slice(MAGIC);
        body.put_u16(VERSION);
        body.put_u16(0);
        body.put_u64(self.0.len() as u64);
        for hash in &self.0 {
            hash.write(&mut body);
        }
        buf.put_slice(&body);
        buf.put_u32(crc32fast::hash(&body));
    }
}

impl CodecRead for LegacyHashes {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let data = buf.copy_to_bytes(buf.remaining());
        if data.len() < HEADER_SIZE + 4 {
            return Err(CodecError::EndOfBuffer);
        }
        let (mut body, mut crc) = data.split_at(data.len() - 4);
        if crc32fast::hash(body) != crc.get_u32() {
            return Err(CodecError::Invalid("LegacyHashes", "checksum mismatch"));
        }
        if &body[..4] != MAGIC {
            return Err(CodecError::Invalid("LegacyHashes", "bad magic"));
        }
        body.advance(4);
        if body.get_u16() != VERSION {
            return Err(CodecError::Invalid("LegacyHashes", "unsupported version"));
        }
        let _reserved = body.get_u16();
        let count = body.get_u64();
        if count.checked_mul(Digest::SIZE as u64) != Some(body.remaining() as u64) {
            return Err(CodecError::Invalid("LegacyHashes", "length mismatch"));
        }
        let hashes = (0..count)
            .map(|_| Digest::read(&mut body))
            .collect::<Result<_, _>>()?;
        Ok(Self(hashes))
    }
}

/// Read access to the hashes of a legacy table.
struct Hashes<E: Storage> {
    ram: Vec<Digest>,
    disk: Option<Store<E>>,
}

impl<E: Storage> Hashes<E> {
    async fn init(
        context: &E,
        table: &str,
        ram: bool,
        disk: bool,
        last_leaf: u64,
        cfg: &Config,
    ) -> Result<Self, Error> {
        let partition = partition(table);
        let ram = match read_blob(context, &partition, RAM).await? {
            Some(data) if ram => LegacyHashes::decode(data.as_slice())?.0,
            _ => Vec::new(),
        };
        let disk = if disk {
            // The legacy index was never trusted across restarts, so replay the files
            let index = LongList::new(
                STORE_NAME,
                index::Config {
                    capacity: last_leaf + 1,
                    chunk_size: cfg.index.chunk_size,
                },
                Arc::new(MemoryTracker::default()),
                MemoryGauge::default(),
            );
            let store = Store::init(context.clone(), &partition, cfg.write_buffer, index).await?;
            store.update_valid_range(Some(1..=last_leaf))?;
            store.rebuild_index().await?;
            Some(store)
        } else {
            None
        };
        Ok(Self { ram, disk })
    }

    async fn get(&self, path: u64) -> Result<Option<Digest>, Error> {
        if let Some(hash) = usize::try_from(path).ok().and_then(|path| self.ram.get(path)) {
            if !hash.is_zero() {
                return Ok(Some(*hash));
            }
        }
        let Some(disk) = &self.disk else {
            return Ok(None);
        };
        match disk.get(path).await? {
            Some(hash) => Ok(Some(Digest::try_from(hash.as_ref())?)),
            None => Ok(None),
        }
    }
}

/// Convert the legacy hashes of `table` into chunks stored in `store`, then remove them.
///
/// Every path in `1..=last_leaf` is migrated. A hash is taken from the in-memory list if it holds
/// a non-zero entry for the path and from the file set otherwise.
pub(super) async fn migrate<E: Storage>(
    store: &HashChunkStore<E>,
    table: &str,
    ram: bool,
    disk: bool,
    last_leaf: Option<u64>,
    cfg: &Config,
) -> Result<(), Error> {
    let mut migrated = 0u64;
    if let Some(last_leaf) = last_leaf {
        let hashes = Hashes::init(store.context(), table, ram, disk, last_leaf, cfg).await?;
        let height = store.height();
        let mut pending = Vec::with_capacity(MIGRATION_BATCH);
        for id in 0..=last_chunk_id(last_leaf, height) {
            let mut chunk = HashChunk::with_id(id, height)?;
            let top = path::rank(chunk.path());
            for depth in 1..=height as u32 {
                if top + depth > MAX_RANK {
                    break;
                }
                let first = path::left_grand_child(chunk.path(), depth);
                if first > last_leaf {
                    break;
                }
                let last = path::right_grand_child(chunk.path(), depth).min(last_leaf);
                for path in first..=last {
                    if let Some(hash) = hashes.get(path).await? {
                        chunk.set_hash_at_path(path, hash)?;
                    }
                }
            }
            if chunk.data_rank() == 0 {
                continue;
            }
            pending.push(chunk);
            if pending.len() == MIGRATION_BATCH {
                migrated += pending.len() as u64;
                store.publish(store.stage(&pending).await?)?;
                pending.clear();
            }
        }
        migrated += pending.len() as u64;
        store.publish(store.stage(&pending).await?)?;
    }

    // Make the chunks durable before dropping their source
    store.persist().await?;
    remove_partition(store.context(), &partition(table)).await?;
    store.discard_persisted().await?;
    info!(table, chunks = migrated, ?last_leaf, "migrated legacy hashes");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn write_legacy_ram<E: Storage>(context: &E, table: &str, hashes: &[Digest]) {
    use commonware_codec::Encode;

    let data = LegacyHashes(hashes.to_vec()).encode().to_vec();
    crate::files::write_blob(context, &partition(table), RAM, data)
        .await
        .unwrap();
}

#[cfg(test)]
pub(crate) async fn write_legacy_disk<E: Storage>(
    context: &E,
    table: &str,
    hashes: &[(u64, Digest)],
) {
    let files = crate::files::FileSet::init(context.clone(), &partition(table), 4096)
        .await
        .unwrap();
    let mut writer = files.create_writer().await.unwrap();
    for (path, hash) in hashes {
        writer.append(*path, hash.as_ref()).await.unwrap();
    }
    writer.finish().await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        files::{exists, write_blob},
        hashes::{partition as chunk_partition, path_to_chunk_id, DIGEST_SIZE},
        store::INDEX,
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use test_case::test_case;

    const HEIGHT: u8 = 3;
    const LEAVES: u64 = 100;
    const TABLE: &str = "table";

    fn config(threshold: u64) -> Config {
        Config {
            chunk_height: HEIGHT,
            ram_to_disk_threshold: threshold,
            write_buffer: 4096,
            index: index::Config {
                capacity: 10_000,
                chunk_size: 64,
            },
            force_rebuild: false,
        }
    }

    fn digest(path: u64) -> Digest {
        let mut bytes = [0x55u8; DIGEST_SIZE];
        bytes[DIGEST_SIZE - 8..].copy_from_slice(&path.to_be_bytes());
        Digest::from(bytes)
    }

    async fn try_open(
        context: &deterministic::Context,
        threshold: u64,
        last_leaf: Option<u64>,
    ) -> Result<HashChunkStore<deterministic::Context>, Error> {
        HashChunkStore::init(
            context.clone(),
            TABLE,
            &config(threshold),
            last_leaf,
            Arc::new(MemoryTracker::default()),
            MemoryGauge::default(),
        )
        .await
    }

    /// Write a legacy table where paths below `threshold` are in the flat list and the rest are
    /// in the file set.
    async fn write_legacy(context: &deterministic::Context, threshold: u64, last_leaf: u64) {
        let ram: Vec<Digest> = (0..threshold.min(last_leaf + 1))
            .map(|path| if path == 0 { Digest::ZERO } else { digest(path) })
            .collect();
        let disk: Vec<(u64, Digest)> = (threshold.max(1)..=last_leaf)
            .map(|path| (path, digest(path)))
            .collect();
        if !ram.is_empty() {
            write_legacy_ram(context, TABLE, &ram).await;
        }
        if !disk.is_empty() {
            write_legacy_disk(context, TABLE, &disk).await;
        }
    }

    #[test_traced]
    fn test_detect() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let detect = |context: deterministic::Context| async move {
                HashFormat::detect(&context, TABLE).await.unwrap()
            };
            assert_eq!(detect(context.clone()).await, HashFormat::Empty);

            // Create a flat list
            write_legacy_ram(&context, TABLE, &[Digest::ZERO, digest(1)]).await;
            assert_eq!(
                detect(context.clone()).await,
                HashFormat::Legacy {
                    ram: true,
                    disk: false,
                }
            );

            // Add a file set
            write_legacy_disk(&context, TABLE, &[(1, digest(1))]).await;
            assert_eq!(
                detect(context.clone()).await,
                HashFormat::Legacy {
                    ram: true,
                    disk: true,
                }
            );

            // Drop the legacy layout and leave a chunk store behind
            remove_partition(&context, &partition(TABLE)).await.unwrap();
            write_blob(&context, &chunk_partition(TABLE), INDEX.as_bytes(), vec![0])
                .await
                .unwrap();
            assert_eq!(detect(context.clone()).await, HashFormat::Chunked);
        });
    }

    #[test_case(0; "all on disk")]
    #[test_case(LEAVES / 2; "half in memory")]
    #[test_case(LEAVES; "leaves in memory")]
    #[test_case(2 * LEAVES; "all in memory")]
    fn test_migration(threshold: u64) {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let last_leaf = 2 * LEAVES - 2;
            write_legacy(&context, threshold, last_leaf).await;

            // Open the table, migrating the legacy hashes
            let store = try_open(&context, threshold, Some(last_leaf)).await.unwrap();
            for path in 1..=last_leaf {
                assert_eq!(
                    store.hash(path).await.unwrap(),
                    Some(digest(path)),
                    "path {path}"
                );
            }
            assert!(scan(&context, &partition(TABLE)).await.unwrap().is_empty());
            assert!(!matches!(
                HashFormat::detect(&context, TABLE).await.unwrap(),
                HashFormat::Legacy { .. }
            ));

            // Chunks land on the side of the threshold they belong to
            let ram_chunks = store.ram_limit().min(last_chunk_id(last_leaf, HEIGHT) + 1);
            assert_eq!(store.ram_chunks() as u64, ram_chunks);

            // The migrated store survives a clean restart
            store.persist().await.unwrap();
            drop(store);
            let store = try_open(&context, threshold, Some(last_leaf)).await.unwrap();
            for path in 1..=last_leaf {
                assert_eq!(
                    store.hash(path).await.unwrap(),
                    Some(digest(path)),
                    "path {path}"
                );
            }
        });
    }

    #[test_traced]
    fn test_memory_list_preferred() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let last_leaf = 20;

            // Both sources hold path 5, but only the file set holds path 6
            let mut ram: Vec<Digest> = (0..=last_leaf).map(digest).collect();
            ram[0] = Digest::ZERO;
            ram[6] = Digest::ZERO;
            write_legacy_ram(&context, TABLE, &ram).await;
            write_legacy_disk(&context, TABLE, &[(5, digest(500)), (6, digest(600))]).await;

            let store = try_open(&context, 0, Some(last_leaf)).await.unwrap();
            assert_eq!(store.hash(5).await.unwrap(), Some(digest(5)));
            assert_eq!(store.hash(6).await.unwrap(), Some(digest(600)));
            let chunk = store.get(path_to_chunk_id(6, HEIGHT)).await.unwrap().unwrap();
            assert_eq!(chunk.height(), HEIGHT);
        });
    }

    #[test_traced]
    fn test_interrupted_migration_restarts() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let last_leaf = 30;
            write_legacy(&context, 10, last_leaf).await;

            // Leave a partial chunk store behind
            let chunks = chunk_partition(TABLE);
            write_blob(&context, &chunks, b"garbage", b"partial".to_vec())
                .await
                .unwrap();

            let store = try_open(&context, 10, Some(last_leaf)).await.unwrap();
            for path in 1..=last_leaf {
                assert_eq!(store.hash(path).await.unwrap(), Some(digest(path)));
            }
            assert!(!exists(&context, &chunks, b"garbage").await.unwrap());
        });
    }

    #[test_traced]
    fn test_empty_table_drops_legacy_blobs() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            write_legacy_ram(&context, TABLE, &[Digest::ZERO]).await;

            let store = try_open(&context, 10, None).await.unwrap();
            assert_eq!(store.ram_chunks(), 0);
            assert!(scan(&context, &partition(TABLE)).await.unwrap().is_empty());
        });
    }

    #[test_traced]
    fn test_corrupt_legacy_list_rejected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            write_legacy_ram(&context, TABLE, &[Digest::ZERO, digest(1), digest(2)]).await;
            let partition = partition(TABLE);
            let mut data = read_blob(&context, &partition, RAM).await.unwrap().unwrap();
            data[HEADER_SIZE] ^= 1;
            write_blob(&context, &partition, RAM, data).await.unwrap();

            let result = try_open(&context, 0, Some(2)).await;
            assert!(matches!(
                result,
                Err(Error::Codec(CodecError::Invalid(
                    "LegacyHashes",
                    "checksum mismatch"
                )))
            ));
        });
    }
}

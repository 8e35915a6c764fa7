use super::{
    chunk::{last_chunk_id, max_chunk_id, path_to_chunk_id},
    legacy::{self, HashFormat},
    Config, Digest, Error, HashChunk,
};
use crate::{
    files::{read_blob, remove_blob, remove_partition, scan, write_blob, FileSet},
    index::{LongList, MemoryGauge, MemoryTracker},
    path::{MAX_PATH, ROOT_PATH},
    store::{load_index, Staged, Store},
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    Decode, Encode, EncodeSize, Error as CodecError, Read as CodecRead, Write as CodecWrite,
};
use commonware_runtime::Storage;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Name of the data files holding disk-resident chunks.
pub(super) const STORE_NAME: &str = "idToHashChunk";

/// Blob holding the memory-resident chunks of a closed store.
const RAM: &[u8] = b"ram";
const RAM_MAGIC: &[u8; 4] = b"MKHR";
const RAM_VERSION: u16 = 1;
const RAM_HEADER_SIZE: usize = 16;

/// Partition holding the hash chunks of `table`.
pub fn partition(table: &str) -> String {
    format!("{table}-hashes")
}

/// Returns the number of chunk ids kept in memory for a path threshold.
///
/// Every path below `threshold` belongs to a chunk with a smaller id than the returned limit.
pub fn ram_chunk_limit(threshold: u64, height: u8) -> u64 {
    if threshold == 0 {
        return 0;
    }
    if threshold > MAX_PATH {
        return max_chunk_id(height) + 1;
    }
    last_chunk_id(threshold - 1, height) + 1
}

/// The memory-resident chunks of a store, as persisted in the [RAM] blob.
struct RamChunks {
    height: u8,
    chunks: Vec<HashChunk>,
}

impl EncodeSize for RamChunks {
    fn encode_size(&self) -> usize {
        RAM_HEADER_SIZE
            + self
                .chunks
                .iter()
                .map(|chunk| 12 + chunk.encode_size())
                .sum::<usize>()
            + 4
    }
}

impl CodecWrite for RamChunks {
    fn write(&self, buf: &mut impl BufMut) {
        let mut body = Vec::with_capacity(self.encode_size());
        body.put_slice(RAM_MAGIC);
        body.put_u16(RAM_VERSION);
        body.put_u8(self.height);
        body.put_u8(0);
        body.put_u64(self.chunks.len() as u64);
        for chunk in &self.chunks {
            body.put_u64(chunk.id());
            body.put_u32(chunk.encode_size() as u32);
            chunk.write(&mut body);
        }
        buf.put_slice(&body);
        buf.put_u32(crc32fast::hash(&body));
    }
}

impl CodecRead for RamChunks {
    type Cfg = u8;

    fn read_cfg(buf: &mut impl Buf, height: &u8) -> Result<Self, CodecError> {
        let data = buf.copy_to_bytes(buf.remaining());
        if data.len() < RAM_HEADER_SIZE + 4 {
            return Err(CodecError::EndOfBuffer);
        }
        let (mut body, mut crc) = data.split_at(data.len() - 4);
        if crc32fast::hash(body) != crc.get_u32() {
            return Err(CodecError::Invalid("RamChunks", "checksum mismatch"));
        }
        if &body[..4] != RAM_MAGIC {
            return Err(CodecError::Invalid("RamChunks", "bad magic"));
        }
        body.advance(4);
        if body.get_u16() != RAM_VERSION {
            return Err(CodecError::Invalid("RamChunks", "unsupported version"));
        }
        if body.get_u8() != *height {
            return Err(CodecError::Invalid("RamChunks", "height mismatch"));
        }
        let _reserved = body.get_u8();
        let count = body.get_u64();

        let mut chunks = Vec::new();
        for _ in 0..count {
            if body.remaining() < 12 {
                return Err(CodecError::EndOfBuffer);
            }
            let id = body.get_u64();
            let len = body.get_u32() as usize;
            if body.remaining() < len {
                return Err(CodecError::EndOfBuffer);
            }
            let chunk = HashChunk::decode_cfg(&body[..len], height)?;
            body.advance(len);
            if chunk.id() != id {
                return Err(CodecError::Invalid("RamChunks", "chunk id mismatch"));
            }
            chunks.push(chunk);
        }
        if body.has_remaining() {
            return Err(CodecError::ExtraData(body.remaining()));
        }
        Ok(Self {
            height: *height,
            chunks,
        })
    }
}

/// Chunks staged for publication.
pub struct StagedChunks<E: Storage> {
    ram: Vec<HashChunk>,
    disk: Staged<E::Blob>,
}

impl<E: Storage> StagedChunks<E> {
    /// Number of chunks staged.
    pub fn len(&self) -> usize {
        self.ram.len() + self.disk.len()
    }

    /// Returns true if nothing was staged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash chunks split between memory (low ids) and data files (high ids).
pub struct HashChunkStore<E: Storage> {
    context: E,
    partition: String,
    height: u8,
    ram_limit: u64,
    ram: RwLock<Vec<Option<HashChunk>>>,
    disk: Store<E>,
}

impl<E: Storage> HashChunkStore<E> {
    /// Open the chunk store of `table`.
    ///
    /// `last_leaf` is the last leaf path of the table (if any). Tables using the legacy layout
    /// are migrated before returning.
    pub async fn init(
        context: E,
        table: &str,
        cfg: &Config,
        last_leaf: Option<u64>,
        memory: Arc<MemoryTracker>,
        gauge: MemoryGauge,
    ) -> Result<Self, Error> {
        let format = HashFormat::detect(&context, table).await?;
        let partition = partition(table);
        if matches!(format, HashFormat::Legacy { .. })
            && !scan(&context, &partition).await?.is_empty()
        {
            // A previous migration did not complete
            info!(partition, "discarding partially migrated hashes");
            remove_partition(&context, &partition).await?;
        }

        // Load the persisted index (it is removed so that a crash never leaves a stale copy)
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
        let disk = Store::init(context.clone(), &partition, cfg.write_buffer, index).await?;
        let store = Self {
            context,
            partition,
            height: cfg.chunk_height,
            ram_limit: ram_chunk_limit(cfg.ram_to_disk_threshold, cfg.chunk_height),
            ram: RwLock::new(Vec::new()),
            disk,
        };
        let last_chunk = last_leaf.map(|path| last_chunk_id(path, store.height));
        store.disk.update_valid_range(store.disk_range(last_chunk))?;

        // Rebuild the index if it could not be loaded
        if rebuild && !store.disk.files().is_empty() {
            let chunks = store.disk.rebuild_index().await?;
            info!(
                partition = store.partition,
                chunks,
                forced = cfg.force_rebuild,
                "rebuilt hash chunk index"
            );
        }

        // Load the chunks kept in memory
        if let Some(data) = read_blob(&store.context, &store.partition, RAM).await? {
            store.load_ram(&data, last_chunk)?;
            remove_blob(&store.context, &store.partition, RAM).await?;
        }

        if let HashFormat::Legacy { ram, disk } = format {
            legacy::migrate(&store, table, ram, disk, last_leaf, cfg).await?;
        }
        debug!(
            partition = store.partition,
            ram_limit = store.ram_limit,
            ram_chunks = store.ram_chunks(),
            files = store.disk.files().len(),
            "opened hash chunk store"
        );
        Ok(store)
    }

    pub(super) fn context(&self) -> &E {
        &self.context
    }

    /// Height of every chunk in the store.
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Chunks with an id below this limit are kept in memory.
    pub fn ram_limit(&self) -> u64 {
        self.ram_limit
    }

    /// Number of chunks currently held in memory.
    pub fn ram_chunks(&self) -> usize {
        self.ram.read().unwrap().iter().flatten().count()
    }

    /// Data files of the disk-resident chunks.
    pub fn files(&self) -> &Arc<FileSet<E>> {
        self.disk.files()
    }

    /// Index of the disk-resident chunks.
    pub fn index(&self) -> &Arc<LongList> {
        self.disk.index()
    }

    fn disk_range(&self, last_chunk: Option<u64>) -> Option<std::ops::RangeInclusive<u64>> {
        match last_chunk {
            Some(last) if last >= self.ram_limit => Some(self.ram_limit..=last),
            _ => None,
        }
    }

    /// Get the chunk with the given id.
    pub async fn get(&self, id: u64) -> Result<Option<HashChunk>, Error> {
        if id < self.ram_limit {
            let ram = self.ram.read().unwrap();
            return Ok(usize::try_from(id)
                .ok()
                .and_then(|id| ram.get(id))
                .cloned()
                .flatten());
        }
        match self.disk.get(id).await? {
            Some(bytes) => Ok(Some(HashChunk::decode_cfg(bytes, &self.height)?)),
            None => Ok(None),
        }
    }

    /// Get the hash stored for `path` (if it was ever set).
    ///
    /// Chunks hold a fixed-size slot per path and [Digest::ZERO] marks an unset slot, so a hash
    /// of all zeroes reads back as `None`. The root hash is never stored.
    pub async fn hash(&self, path: u64) -> Result<Option<Digest>, Error> {
        if path == ROOT_PATH {
            return Ok(None);
        }
        let Some(chunk) = self.get(path_to_chunk_id(path, self.height)).await? else {
            return Ok(None);
        };
        let hash = chunk.hash_at_path(path)?;
        Ok((!hash.is_zero()).then_some(hash))
    }

    /// Write `chunks` without making them visible.
    pub async fn stage(&self, chunks: &[HashChunk]) -> Result<StagedChunks<E>, Error> {
        if let Some(chunk) = chunks.iter().find(|chunk| chunk.height() != self.height) {
            return Err(Error::HeightMismatch {
                expected: self.height,
                found: chunk.height(),
            });
        }
        let mut batch = self.disk.batch();
        let mut ram = Vec::new();
        for chunk in chunks {
            let id = chunk.id();
            if id < self.ram_limit {
                ram.push(chunk.clone());
                continue;
            }
            if let Err(err) = batch.put(id, &chunk.encode()).await {
                batch.abort().await;
                return Err(err.into());
            }
        }
        Ok(StagedChunks {
            ram,
            disk: batch.finish().await?,
        })
    }

    /// Make staged chunks visible to readers.
    pub fn publish(&self, staged: StagedChunks<E>) -> Result<(), Error> {
        let StagedChunks { ram, disk } = staged;
        {
            let mut chunks = self.ram.write().unwrap();
            for chunk in ram {
                let id = chunk.id() as usize;
                if chunks.len() <= id {
                    chunks.resize_with(id + 1, || None);
                }
                chunks[id] = Some(chunk);
            }
        }
        self.disk.publish(disk)?;
        Ok(())
    }

    /// Delete the data file of chunks that will not be published.
    pub async fn discard(&self, staged: StagedChunks<E>) -> Result<(), Error> {
        self.disk.discard(staged.disk).await?;
        Ok(())
    }

    /// Forget every chunk with an id above `last_chunk` (or every chunk if `None`).
    pub fn update_valid_range(&self, last_chunk: Option<u64>) -> Result<(), Error> {
        {
            let mut chunks = self.ram.write().unwrap();
            match last_chunk {
                Some(last) => {
                    let keep = usize::try_from(last.saturating_add(1)).unwrap_or(usize::MAX);
                    chunks.truncate(keep);
                }
                None => chunks.clear(),
            }
        }
        self.disk.update_valid_range(self.disk_range(last_chunk))?;
        Ok(())
    }

    /// Persist the index and the memory-resident chunks next to the data files.
    pub async fn persist(&self) -> Result<(), Error> {
        self.disk.persist().await?;
        self.write_ram(&self.partition).await
    }

    /// Remove the blobs written by [HashChunkStore::persist].
    pub(super) async fn discard_persisted(&self) -> Result<(), Error> {
        self.disk.discard_persisted().await?;
        remove_blob(&self.context, &self.partition, RAM).await?;
        Ok(())
    }

    /// Copy the store into the hash partition of table `target`.
    pub async fn snapshot(&self, target: &str) -> Result<(), Error> {
        let target = partition(target);
        self.disk.snapshot(&target).await?;
        self.write_ram(&target).await
    }

    async fn write_ram(&self, partition: &str) -> Result<(), Error> {
        let ram = RamChunks {
            height: self.height,
            chunks: self.ram.read().unwrap().iter().flatten().cloned().collect(),
        };
        let count = ram.chunks.len();
        write_blob(&self.context, partition, RAM, ram.encode().to_vec()).await?;
        debug!(partition, chunks = count, "wrote memory-resident chunks");
        Ok(())
    }

    fn load_ram(&self, data: &[u8], last_chunk: Option<u64>) -> Result<(), Error> {
        let RamChunks { chunks: loaded, .. } = RamChunks::decode_cfg(data, &self.height)?;
        let mut chunks = self.ram.write().unwrap();
        let mut kept = 0;
        for chunk in loaded {
            let id = chunk.id();
            if id >= self.ram_limit {
                return Err(Error::InvalidFile(format!(
                    "{} (chunk {id} above memory limit)",
                    self.partition
                )));
            }

            // Chunks beyond the last leaf are stale
            if !matches!(last_chunk, Some(last) if id <= last) {
                continue;
            }
            let id = id as usize;
            if chunks.len() <= id {
                chunks.resize_with(id + 1, || None);
            }
            chunks[id] = Some(chunk);
            kept += 1;
        }
        debug!(partition = self.partition, chunks = kept, "loaded memory-resident chunks");
        Ok(())
    }
}

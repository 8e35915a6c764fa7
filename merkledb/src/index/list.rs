use super::{
    memory::{to_megabytes, MemoryGauge},
    Config, Error, MemoryTracker,
};
use crate::files::exists;
use bytes::{Buf, BufMut};
use commonware_codec::{
    DecodeExt, Encode, FixedSize, Read as CodecRead, Write as CodecWrite,
};
use commonware_runtime::{
    buffer::{Read as ReadBuffer, Write},
    Blob, Storage,
};
use std::{
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
};
use tracing::debug;

const MAGIC: &[u8; 4] = b"MKLL";
const VERSION: u16 = 1;

/// Number of values copied per batch when persisting or loading a list.
const BATCH: u64 = 8 * 1024;

/// Size of the buffers used when persisting or loading a list.
const BUFFER: usize = 1 << 20;

/// Header of a persisted list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    chunk_size: u32,
    capacity: u64,
    min: u64,
    end: u64,
}

impl FixedSize for Header {
    const SIZE: usize = 36;
}

impl CodecWrite for Header {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u16(0);
        buf.put_u32(self.chunk_size);
        buf.put_u64(self.capacity);
        buf.put_u64(self.min);
        buf.put_u64(self.end);
    }
}

impl CodecRead for Header {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, commonware_codec::Error> {
        if buf.remaining() < Self::SIZE {
            return Err(commonware_codec::Error::EndOfBuffer);
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(commonware_codec::Error::Invalid("Header", "bad magic"));
        }
        if buf.get_u16() != VERSION {
            return Err(commonware_codec::Error::Invalid("Header", "unsupported version"));
        }
        let _reserved = buf.get_u16();
        let chunk_size = buf.get_u32();
        let capacity = buf.get_u64();
        let min = buf.get_u64();
        let end = buf.get_u64();
        if min > end {
            return Err(commonware_codec::Error::Invalid("Header", "inverted range"));
        }
        Ok(Self {
            chunk_size,
            capacity,
            min,
            end,
        })
    }
}

type Chunk = Box<[AtomicU64]>;

fn new_chunk(size: usize) -> Chunk {
    (0..size).map(|_| AtomicU64::new(0)).collect()
}

/// A chunked arena of `u64` values addressed by id.
///
/// Reads and updates of allocated chunks only take a shared lock. Allocating a chunk, freeing
/// chunks, and moving the valid range take an exclusive lock.
pub struct LongList {
    name: String,
    capacity: u64,
    chunk_size: usize,

    chunks: RwLock<Vec<Option<Chunk>>>,
    range: RwLock<Option<(u64, u64)>>,
    end: AtomicU64,

    allocated: AtomicU64,
    gauge: MemoryGauge,
    memory: Arc<MemoryTracker>,
    released: AtomicBool,
}

impl LongList {
    /// Create an empty list.
    ///
    /// Every id below the capacity is valid until [LongList::update_valid_range] is called.
    pub fn new(name: &str, cfg: Config, memory: Arc<MemoryTracker>, gauge: MemoryGauge) -> Self {
        let chunks = cfg.capacity.div_ceil(cfg.chunk_size as u64) as usize;
        let range = cfg.capacity.checked_sub(1).map(|last| (0, last));
        Self {
            name: name.to_string(),
            capacity: cfg.capacity,
            chunk_size: cfg.chunk_size,
            chunks: RwLock::new((0..chunks).map(|_| None).collect()),
            range: RwLock::new(range),
            end: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            gauge,
            memory,
            released: AtomicBool::new(false),
        }
    }

    /// Number of ids the list can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// One past the largest id ever written (within the valid range).
    pub fn end(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    /// The current valid range, if any.
    pub fn valid_range(&self) -> Option<RangeInclusive<u64>> {
        self.range
            .read()
            .unwrap()
            .map(|(min, max)| min..=max)
    }

    /// Number of chunks currently allocated.
    pub fn allocated_chunks(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Bytes reserved by allocated chunks.
    pub fn reserved_bytes(&self) -> u64 {
        self.allocated_chunks() * self.chunk_bytes()
    }

    fn chunk_bytes(&self) -> u64 {
        (self.chunk_size * std::mem::size_of::<u64>()) as u64
    }

    fn locate(&self, index: u64) -> (usize, usize) {
        let chunk_size = self.chunk_size as u64;
        ((index / chunk_size) as usize, (index % chunk_size) as usize)
    }

    fn allocate(&self, chunks: &mut [Option<Chunk>], chunk: usize) {
        chunks[chunk] = Some(new_chunk(self.chunk_size));
        let allocated = self.allocated.fetch_add(1, Ordering::AcqRel) + 1;
        self.memory.reserve(self.chunk_bytes());
        self.gauge
            .set(to_megabytes(allocated * self.chunk_bytes()));
    }

    fn free(&self, chunks: &mut [Option<Chunk>], chunk: usize) {
        if chunks[chunk].take().is_none() {
            return;
        }
        let allocated = self.allocated.fetch_sub(1, Ordering::AcqRel) - 1;
        self.memory.release(self.chunk_bytes());
        self.gauge
            .set(to_megabytes(allocated * self.chunk_bytes()));
    }

    /// Get the value stored for `index`.
    pub fn get(&self, index: u64) -> Option<u64> {
        if index >= self.capacity {
            return None;
        }
        let (chunk, offset) = self.locate(index);
        let chunks = self.chunks.read().unwrap();
        let value = chunks[chunk].as_ref()?[offset].load(Ordering::Acquire);
        (value != 0).then_some(value)
    }

    fn check(&self, index: u64) -> Result<(), Error> {
        if index >= self.capacity {
            return Err(Error::IndexOutOfBounds {
                index,
                capacity: self.capacity,
            });
        }
        match *self.range.read().unwrap() {
            Some((min, max)) if index >= min && index <= max => Ok(()),
            _ => Err(Error::OutsideValidRange(index)),
        }
    }

    /// Store `value` for `index`, allocating its chunk if needed.
    ///
    /// Storing `0` is equivalent to [LongList::remove].
    pub fn put(&self, index: u64, value: u64) -> Result<(), Error> {
        if value == 0 {
            self.remove(index);
            return Ok(());
        }
        self.check(index)?;
        let (chunk, offset) = self.locate(index);

        // Fast path: the chunk already exists
        {
            let chunks = self.chunks.read().unwrap();
            if let Some(entries) = &chunks[chunk] {
                entries[offset].store(value, Ordering::Release);
                self.end.fetch_max(index + 1, Ordering::AcqRel);
                return Ok(());
            }
        }

        // Allocate the chunk (another writer may have done so in the meantime)
        let mut chunks = self.chunks.write().unwrap();
        if chunks[chunk].is_none() {
            self.allocate(&mut chunks, chunk);
        }
        if let Some(entries) = &chunks[chunk] {
            entries[offset].store(value, Ordering::Release);
        }
        self.end.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Replace the value for `index` only if it is currently `old`.
    ///
    /// Returns true if the value was replaced. Never allocates.
    pub fn put_if_equal(&self, index: u64, old: u64, new: u64) -> bool {
        if index >= self.capacity || old == 0 {
            return false;
        }
        let (chunk, offset) = self.locate(index);
        let chunks = self.chunks.read().unwrap();
        let Some(entries) = &chunks[chunk] else {
            return false;
        };
        entries[offset]
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the value for `index`.
    pub fn remove(&self, index: u64) {
        if index >= self.capacity {
            return;
        }
        let (chunk, offset) = self.locate(index);
        let chunks = self.chunks.read().unwrap();
        if let Some(entries) = &chunks[chunk] {
            entries[offset].store(0, Ordering::Release);
        }
    }

    /// Restrict the list to ids in `range` (or to nothing if `None`).
    ///
    /// Values outside of the new range are cleared and chunks that no longer overlap it are freed.
    pub fn update_valid_range(&self, range: Option<RangeInclusive<u64>>) -> Result<(), Error> {
        let range = match range {
            Some(range) => {
                let (min, max) = range.into_inner();
                if min > max || max >= self.capacity {
                    return Err(Error::InvalidRange(min, max));
                }
                Some((min, max))
            }
            None => None,
        };

        let mut chunks = self.chunks.write().unwrap();
        let chunk_size = self.chunk_size as u64;
        for chunk in 0..chunks.len() {
            if chunks[chunk].is_none() {
                continue;
            }
            let first = chunk as u64 * chunk_size;
            let last = first + chunk_size - 1;
            match range {
                Some((min, max)) if last >= min && first <= max => {
                    // Clear the entries that fell outside of the range
                    if let Some(entries) = &chunks[chunk] {
                        for (offset, entry) in entries.iter().enumerate() {
                            let index = first + offset as u64;
                            if index < min || index > max {
                                entry.store(0, Ordering::Release);
                            }
                        }
                    }
                }
                _ => self.free(&mut chunks, chunk),
            }
        }
        match range {
            Some((_, max)) => {
                self.end.fetch_min(max + 1, Ordering::AcqRel);
            }
            None => self.end.store(0, Ordering::Release),
        }
        *self.range.write().unwrap() = range;
        debug!(
            list = %self.name,
            ?range,
            chunks = self.allocated_chunks(),
            "updated valid range"
        );
        Ok(())
    }

    /// Free every chunk and return its memory to the tracker.
    ///
    /// Only the first call has any effect. The list behaves as empty afterwards.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut chunks = self.chunks.write().unwrap();
        for chunk in 0..chunks.len() {
            self.free(&mut chunks, chunk);
        }
        self.end.store(0, Ordering::Release);
        *self.range.write().unwrap() = None;
        debug!(list = %self.name, "released index memory");
    }

    /// Persist the valid part of the list to blob `name` of `partition`.
    pub async fn write<E: Storage>(
        &self,
        context: &E,
        partition: &str,
        name: &[u8],
    ) -> Result<(), Error> {
        let min = self.range.read().unwrap().map(|(min, _)| min).unwrap_or(0);
        let end = self.end().max(min);
        let header = Header {
            chunk_size: self.chunk_size as u32,
            capacity: self.capacity,
            min,
            end,
        }
        .encode();

        let (blob, _) = context.open(partition, name).await?;
        blob.resize(0).await?;
        let out = Write::new(blob, 0, BUFFER);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        let mut offset = header.len() as u64;
        out.write_at(header.to_vec(), 0).await?;

        // Copy values in batches so the chunk lock is never held across a write
        let mut start = min;
        while start < end {
            let stop = end.min(start + BATCH);
            let mut values = Vec::with_capacity(((stop - start) * 8) as usize);
            {
                let chunks = self.chunks.read().unwrap();
                for index in start..stop {
                    let (chunk, offset) = self.locate(index);
                    let value = chunks[chunk]
                        .as_ref()
                        .map(|entries| entries[offset].load(Ordering::Acquire))
                        .unwrap_or(0);
                    values.put_u64(value);
                }
            }
            hasher.update(&values);
            let len = values.len() as u64;
            out.write_at(values, offset).await?;
            offset += len;
            start = stop;
        }
        out.write_at(hasher.finalize().to_be_bytes().to_vec(), offset)
            .await?;
        out.sync().await?;
        debug!(list = %self.name, min, end, partition, "wrote index");
        Ok(())
    }

    /// Load a list previously persisted with [LongList::write].
    ///
    /// Returns `None` if the blob does not exist. The capacity and chunk size come from `cfg`
    /// (they may differ from the ones in use when the list was written). The valid range starts
    /// at the persisted minimum and is unbounded above until the caller restricts it.
    pub async fn load<E: Storage>(
        context: &E,
        partition: &str,
        name: &str,
        cfg: Config,
        memory: Arc<MemoryTracker>,
        gauge: MemoryGauge,
    ) -> Result<Option<Self>, Error> {
        let blob_name = name.as_bytes();
        if !exists(context, partition, blob_name).await? {
            return Ok(None);
        }
        let (blob, size) = context.open(partition, blob_name).await?;
        let invalid = |reason: &str| Error::InvalidFile(format!("{partition}/{name} ({reason})"));
        if size < (Header::SIZE + 4) as u64 {
            return Err(invalid("truncated header"));
        }
        let mut reader = ReadBuffer::new(blob, size, BUFFER);
        let mut hasher = crc32fast::Hasher::new();

        // Read the header
        let mut header = [0u8; Header::SIZE];
        reader.read_exact(&mut header, Header::SIZE).await?;
        hasher.update(&header);
        let Header {
            chunk_size,
            capacity,
            min,
            end,
        } = Header::decode(&header[..])?;
        if end > cfg.capacity {
            return Err(invalid("range exceeds capacity"));
        }
        if size != (Header::SIZE + 4) as u64 + (end - min) * 8 {
            return Err(invalid("unexpected length"));
        }

        // Read the values
        let list = Self::new(name, cfg, memory, gauge);
        let mut start = min;
        while start < end {
            let stop = end.min(start + BATCH);
            let len = ((stop - start) * 8) as usize;
            let mut values = vec![0u8; len];
            reader.read_exact(&mut values, len).await?;
            hasher.update(&values);
            let mut cursor = &values[..];
            for index in start..stop {
                let value = cursor.get_u64();
                if value != 0 {
                    list.put(index, value)?;
                }
            }
            start = stop;
        }

        // Verify the checksum
        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc, 4).await?;
        if (&crc[..]).get_u32() != hasher.finalize() {
            list.release();
            return Err(invalid("checksum mismatch"));
        }
        if let Some(last) = list.capacity.checked_sub(1) {
            *list.range.write().unwrap() = Some((min.min(last), last));
        }
        debug!(
            list = name,
            min,
            end,
            written_capacity = capacity,
            written_chunk_size = chunk_size,
            "loaded index"
        );
        Ok(Some(list))
    }
}

impl Drop for LongList {
    fn drop(&mut self) {
        self.release();
    }
}

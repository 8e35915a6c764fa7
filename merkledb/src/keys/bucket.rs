use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, Read, Write};

/// Size of the fixed part of an encoded entry.
const ENTRY_OVERHEAD: usize = 4 + 8 + 4;

/// Returns the hash used to place `key` in a bucket.
pub fn key_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Returns the bucket holding keys with `hash` when the map has `buckets` buckets.
///
/// `buckets` must be a power of two.
pub fn bucket_id(hash: u32, buckets: u64) -> u64 {
    hash as u64 & (buckets - 1)
}

/// A key stored in a bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub hash: u32,
    pub path: u64,
    pub key: Bytes,
}

/// The entries of every key whose hash maps to the same bucket id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    id: u64,
    entries: Vec<Entry>,
}

impl Bucket {
    /// Create an empty bucket.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            entries: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn position(&self, key: &[u8], hash: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.hash == hash && entry.key.as_ref() == key)
    }

    /// Get the path of `key`.
    pub fn get(&self, key: &[u8], hash: u32) -> Option<u64> {
        self.position(key, hash).map(|index| self.entries[index].path)
    }

    /// Map `key` to `path`, returning the path it was previously mapped to.
    pub fn put(&mut self, key: Bytes, hash: u32, path: u64) -> Option<u64> {
        match self.position(&key, hash) {
            Some(index) => Some(std::mem::replace(&mut self.entries[index].path, path)),
            None => {
                self.entries.push(Entry { hash, path, key });
                None
            }
        }
    }

    /// Remove `key`, returning the path it was mapped to.
    pub fn remove(&mut self, key: &[u8], hash: u32) -> Option<u64> {
        let index = self.position(key, hash)?;
        Some(self.entries.swap_remove(index).path)
    }

    /// Remove `key` only if it is still mapped to `path`.
    pub fn remove_if_equal(&mut self, key: &[u8], hash: u32, path: u64) -> bool {
        match self.position(key, hash) {
            Some(index) if self.entries[index].path == path => {
                self.entries.swap_remove(index);
                true
            }
            _ => false,
        }
    }

    /// Keep only the entries that belong to this bucket once the map has `buckets` buckets.
    pub fn retain_for(&mut self, buckets: u64) {
        let id = self.id;
        self.entries
            .retain(|entry| bucket_id(entry.hash, buckets) == id);
    }

    /// Return a copy of the bucket holding the entries that map to `id` once the map has
    /// `buckets` buckets.
    pub fn split_off(&self, id: u64, buckets: u64) -> Bucket {
        Bucket {
            id,
            entries: self
                .entries
                .iter()
                .filter(|entry| bucket_id(entry.hash, buckets) == id)
                .cloned()
                .collect(),
        }
    }
}

impl Write for Bucket {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u32(entry.hash);
            buf.put_u64(entry.path);
            buf.put_u32(entry.key.len() as u32);
            buf.put_slice(&entry.key);
        }
    }
}

impl EncodeSize for Bucket {
    fn encode_size(&self) -> usize {
        4 + self
            .entries
            .iter()
            .map(|entry| ENTRY_OVERHEAD + entry.key.len())
            .sum::<usize>()
    }
}

impl Read for Bucket {
    /// Id of the bucket being read (it is not part of the encoding).
    type Cfg = u64;

    fn read_cfg(buf: &mut impl Buf, id: &u64) -> Result<Self, Error> {
        if buf.remaining() < 4 {
            return Err(Error::EndOfBuffer);
        }
        let count = buf.get_u32() as usize;
        let mut entries = Vec::with_capacity(count.min(buf.remaining() / ENTRY_OVERHEAD));
        for _ in 0..count {
            if buf.remaining() < ENTRY_OVERHEAD {
                return Err(Error::EndOfBuffer);
            }
            let hash = buf.get_u32();
            let path = buf.get_u64();
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(Error::EndOfBuffer);
            }
            let key = buf.copy_to_bytes(len);
            if key_hash(&key) != hash {
                return Err(Error::Invalid("Bucket", "hash mismatch"));
            }
            entries.push(Entry { hash, path, key });
        }
        Ok(Self { id: *id, entries })
    }
}

use super::Error;
use crate::path::{self, MAX_PATH, MAX_RANK};
use bytes::{Buf, BufMut};
use commonware_codec::{
    EncodeSize, Error as CodecError, FixedSize, Read as CodecRead, ReadExt, Write as CodecWrite,
};
use std::fmt;

/// Size of a hash in bytes.
pub const DIGEST_SIZE: usize = 48;

/// Largest supported chunk height.
pub const MAX_HEIGHT: u8 = 16;

/// An opaque hash stored for a path.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// The value of a slot that was never set (a stored hash of all zeroes is read as unset).
    pub const ZERO: Digest = Digest([0u8; DIGEST_SIZE]);

    /// Returns true if the digest is [Digest::ZERO].
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }
}

impl From<[u8; DIGEST_SIZE]> for Digest {
    fn from(value: [u8; DIGEST_SIZE]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; DIGEST_SIZE] = value
            .try_into()
            .map_err(|_| Error::InvalidDigest(value.len()))?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FixedSize for Digest {
    const SIZE: usize = DIGEST_SIZE;
}

impl CodecWrite for Digest {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

impl CodecRead for Digest {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        if buf.remaining() < DIGEST_SIZE {
            return Err(CodecError::EndOfBuffer);
        }
        let mut bytes = [0u8; DIGEST_SIZE];
        buf.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }
}

fn check_height(height: u8) -> Result<(), Error> {
    if height == 0 || height > MAX_HEIGHT {
        return Err(Error::InvalidChunkHeight(height));
    }
    Ok(())
}

/// Returns the id of the chunk that stores the hash of `path`.
///
/// Chunk ids are assigned rank by rank (in groups of `height` ranks) and left to right within a
/// rank, so the root chunk has id `0`. The root path itself is not stored in any chunk and is
/// reported as belonging to chunk `0`.
pub fn path_to_chunk_id(path: u64, height: u8) -> u64 {
    if path == path::ROOT_PATH {
        return 0;
    }
    let height = height as u32;
    let rank = path::rank(path);

    // Number of ranks between the path and the top of its chunk
    let offset = (rank - 1) % height + 1;

    // Position of the chunk among the chunks at its rank
    let first = 1u64 << (rank - offset);
    let position = ((path + 1) >> offset) ^ first;

    // Number of chunks at all shallower chunk ranks
    let preceding = (first - 1) / ((1u64 << height) - 1);
    position + preceding
}

/// Returns the path of the chunk with the given id.
pub fn chunk_id_to_path(id: u64, height: u8) -> u64 {
    if id == 0 {
        return path::ROOT_PATH;
    }
    let height = height as u32;
    let mut rank = 0;
    let mut at_rank = 1u64;
    let mut last = 0u64;
    while last < id {
        at_rank <<= height;
        last += at_rank;
        rank += height;
    }
    path::first_at_rank(rank) + id + at_rank - 1 - last
}

/// Returns the path of the chunk that stores the hash of `path`.
pub fn chunk_path(path: u64, height: u8) -> u64 {
    if path == path::ROOT_PATH {
        return path::ROOT_PATH;
    }
    let height = height as u32;
    let rank = path::rank(path);
    let top = ((rank - 1) / height) * height;
    path::grand_parent(path, rank - top)
}

/// Returns the largest chunk id that stores a path at or above `last_leaf_path`.
///
/// Leaves of a complete tree live on its last two ranks, so the right-most chunk of the
/// second-to-last rank may have a larger id than the chunk of the last leaf.
pub fn last_chunk_id(last_leaf_path: u64, height: u8) -> u64 {
    let last = path_to_chunk_id(last_leaf_path, height);
    let rank = path::rank(last_leaf_path);
    if rank <= 1 {
        return last;
    }
    last.max(path_to_chunk_id(path::last_at_rank(rank - 1), height))
}

/// Returns the largest chunk id that can be addressed at `height`.
pub fn max_chunk_id(height: u8) -> u64 {
    path_to_chunk_id(MAX_PATH, height)
}

fn slots_through(rank: u8) -> usize {
    (1usize << (rank as usize + 1)) - 2
}

/// A subtree of hashes of a fixed height.
///
/// The chunk at path `p` stores the hashes of every descendant of `p` up to `height` ranks below
/// it (`p` itself belongs to its parent chunk). Slots are laid out rank by rank, left to right:
///
/// ```text
/// chunk at path 0, height 2:  [1, 2, 3, 4, 5, 6]
/// chunk at path 3, height 2:  [7, 8, 15, 16, 17, 18]
/// ```
///
/// Only ranks up to the deepest one ever set (the data rank) are materialized and serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct HashChunk {
    path: u64,
    height: u8,
    data_rank: u8,
    hashes: Vec<Digest>,
}

impl HashChunk {
    /// Create an empty chunk rooted at `path`.
    pub fn new(path: u64, height: u8) -> Result<Self, Error> {
        check_height(height)?;
        if path > MAX_PATH || path::rank(path) % height as u32 != 0 {
            return Err(Error::InvalidChunkPath(path));
        }
        Ok(Self {
            path,
            height,
            data_rank: 0,
            hashes: Vec::new(),
        })
    }

    /// Create an empty chunk with the given id.
    pub fn with_id(id: u64, height: u8) -> Result<Self, Error> {
        check_height(height)?;
        if id > max_chunk_id(height) {
            return Err(Error::InvalidChunkId(id));
        }
        Self::new(chunk_id_to_path(id, height), height)
    }

    /// Path of the chunk.
    pub fn path(&self) -> u64 {
        self.path
    }

    /// Id of the chunk.
    pub fn id(&self) -> u64 {
        if self.path == path::ROOT_PATH {
            return 0;
        }
        path_to_chunk_id(path::left_child(self.path), self.height)
    }

    /// Height of the chunk.
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Deepest rank (relative to the chunk path) that holds data.
    pub fn data_rank(&self) -> u8 {
        self.data_rank
    }

    /// Returns true if the chunk stores the hash of `path`.
    pub fn contains(&self, path: u64) -> bool {
        self.slot(path).is_ok()
    }

    fn slot(&self, path: u64) -> Result<(u8, usize), Error> {
        let not_in_chunk = || Error::PathNotInChunk {
            path,
            chunk: self.path,
        };
        if path > MAX_PATH || path == path::ROOT_PATH {
            return Err(not_in_chunk());
        }
        let top = path::rank(self.path);
        let rank = path::rank(path);
        if rank <= top || rank > top + self.height as u32 || rank > MAX_RANK {
            return Err(not_in_chunk());
        }
        let relative = rank - top;
        if path::grand_parent(path, relative) != self.path {
            return Err(not_in_chunk());
        }
        let position = path - path::left_grand_child(self.path, relative);
        let index = slots_through(relative as u8 - 1) + position as usize;
        Ok((relative as u8, index))
    }

    /// Get the hash stored for `path` ([Digest::ZERO] if it was never set).
    pub fn hash_at_path(&self, path: u64) -> Result<Digest, Error> {
        let (_, index) = self.slot(path)?;
        Ok(self.hashes.get(index).copied().unwrap_or(Digest::ZERO))
    }

    /// Set the hash stored for `path`.
    pub fn set_hash_at_path(&mut self, path: u64, hash: Digest) -> Result<(), Error> {
        let (rank, index) = self.slot(path)?;
        if rank > self.data_rank {
            self.data_rank = rank;
            self.hashes.resize(slots_through(rank), Digest::ZERO);
        }
        self.hashes[index] = hash;
        Ok(())
    }
}

/// Bytes preceding the hashes of a serialized chunk.
const CHUNK_PREFIX: usize = 10;

impl EncodeSize for HashChunk {
    fn encode_size(&self) -> usize {
        CHUNK_PREFIX + self.hashes.len() * DIGEST_SIZE
    }
}

impl CodecWrite for HashChunk {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.path);
        buf.put_u8(self.height);
        buf.put_u8(self.data_rank);
        for hash in &self.hashes {
            hash.write(buf);
        }
    }
}

impl CodecRead for HashChunk {
    /// Height every chunk of the store is expected to have.
    type Cfg = u8;

    fn read_cfg(buf: &mut impl Buf, height: &u8) -> Result<Self, CodecError> {
        if buf.remaining() < CHUNK_PREFIX {
            return Err(CodecError::EndOfBuffer);
        }
        let path = buf.get_u64();
        if buf.get_u8() != *height {
            return Err(CodecError::Invalid("HashChunk", "height mismatch"));
        }
        let data_rank = buf.get_u8();
        if data_rank > *height {
            return Err(CodecError::Invalid("HashChunk", "data rank above height"));
        }
        let slots = if data_rank == 0 {
            0
        } else {
            slots_through(data_rank)
        };
        let mut chunk = Self::new(path, *height)
            .map_err(|_| CodecError::Invalid("HashChunk", "invalid path"))?;
        chunk.data_rank = data_rank;
        chunk.hashes = (0..slots)
            .map(|_| Digest::read(buf))
            .collect::<Result<_, _>>()?;
        Ok(chunk)
    }
}

impl fmt::Debug for HashChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashChunk")
            .field("path", &self.path)
            .field("height", &self.height)
            .field("data_rank", &self.data_rank)
            .finish()
    }
}

use super::{
    remove_blob, DiskLocation, Error, HEADER_SIZE, MAX_OFFSET, MAX_PAYLOAD, RECORD_OVERHEAD,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{
    DecodeExt, Encode, FixedSize, Read as CodecRead, Write as CodecWrite,
};
use commonware_runtime::{
    buffer::{Read as ReadBuffer, Write},
    Blob, Storage,
};
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"MKDF";
const VERSION: u16 = 1;

/// Bytes of the header covered by its checksum.
const CHECKED: usize = 20;

/// Size of the buffer used when scanning a file.
const SCAN_BUFFER: usize = 64 * 1024;

/// Name of the blob holding the file with `id`.
pub(super) fn blob_name(id: u32) -> [u8; 4] {
    id.to_be_bytes()
}

/// Id of the file stored in blob `name`, if it names a data file.
pub(super) fn blob_id(name: &[u8]) -> Option<u32> {
    let id: [u8; 4] = name.try_into().ok()?;
    Some(u32::from_be_bytes(id))
}

/// Header stored at the start of every data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Header {
    id: u32,
    sequence: u64,
}

impl FixedSize for Header {
    const SIZE: usize = HEADER_SIZE as usize;
}

impl CodecWrite for Header {
    fn write(&self, buf: &mut impl BufMut) {
        let mut checked = [0u8; CHECKED];
        let mut cursor = &mut checked[..];
        cursor.put_slice(MAGIC);
        cursor.put_u16(VERSION);
        cursor.put_u16(0);
        cursor.put_u32(self.id);
        cursor.put_u64(self.sequence);
        buf.put_slice(&checked);
        buf.put_u32(crc32fast::hash(&checked));
    }
}

impl CodecRead for Header {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, commonware_codec::Error> {
        if buf.remaining() < Self::SIZE {
            return Err(commonware_codec::Error::EndOfBuffer);
        }
        let mut checked = [0u8; CHECKED];
        buf.copy_to_slice(&mut checked);
        if buf.get_u32() != crc32fast::hash(&checked) {
            return Err(commonware_codec::Error::Invalid("Header", "checksum mismatch"));
        }
        let mut cursor = &checked[..];
        if &cursor[..4] != MAGIC {
            return Err(commonware_codec::Error::Invalid("Header", "bad magic"));
        }
        cursor.advance(4);
        if cursor.get_u16() != VERSION {
            return Err(commonware_codec::Error::Invalid("Header", "unsupported version"));
        }
        let _reserved = cursor.get_u16();
        let id = cursor.get_u32();
        let sequence = cursor.get_u64();
        Ok(Self { id, sequence })
    }
}

fn checksum(key: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// A record read back from a [DataFile].
#[derive(Debug, Clone)]
pub struct Record {
    /// Location of the record.
    pub location: DiskLocation,
    /// Key the owning store indexes the record by.
    pub key: u64,
    /// Opaque payload.
    pub payload: Bytes,
}

/// An immutable, finished data file.
///
/// Point reads and scans share the underlying [Blob] (blobs synchronize access themselves).
pub struct DataFile<B: Blob> {
    id: u32,
    sequence: u64,
    blob: B,
    size: u64,
}

impl<B: Blob> DataFile<B> {
    /// Open a finished data file stored in `blob`.
    ///
    /// Fails with [Error::InvalidHeader] or [Error::Codec] if the header was never completed.
    pub async fn open(blob: B, size: u64) -> Result<Self, Error> {
        if size < HEADER_SIZE {
            return Err(Error::InvalidHeader(format!("too short: {size}")));
        }
        let buf = blob.read_at(vec![0u8; Header::SIZE], 0).await?;
        let header = Header::decode(buf.as_ref())?;
        debug!(file = header.id, sequence = header.sequence, size, "opened data file");

        Ok(Self {
            id: header.id,
            sequence: header.sequence,
            blob,
            size,
        })
    }

    /// Id of the file (unique within its [super::FileSet]).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sequence of the file (larger sequences supersede smaller ones).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Size of the file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub(super) fn blob(&self) -> &B {
        &self.blob
    }

    /// Read the record at `offset`, returning its key and payload.
    pub async fn read(&self, offset: u64) -> Result<(u64, Bytes), Error> {
        let out_of_bounds = || Error::OutOfBounds {
            file: self.id,
            offset,
        };
        if offset < HEADER_SIZE || offset + RECORD_OVERHEAD > self.size {
            return Err(out_of_bounds());
        }

        // Read the record prefix
        let prefix = self.blob.read_at(vec![0u8; 12], offset).await?;
        let mut cursor = prefix.as_ref();
        let len = cursor.get_u32() as u64;
        let key = cursor.get_u64();
        if offset + RECORD_OVERHEAD + len > self.size {
            return Err(out_of_bounds());
        }

        // Read the payload and checksum
        let body = self
            .blob
            .read_at(vec![0u8; len as usize + 4], offset + 12)
            .await?;
        let body = body.as_ref();
        let (payload, mut crc) = body.split_at(len as usize);
        if crc.get_u32() != checksum(key, payload) {
            return Err(Error::ChecksumMismatch {
                file: self.id,
                offset,
            });
        }
        Ok((key, Bytes::copy_from_slice(payload)))
    }

    /// Scan all records in the file, in the order they were written.
    pub fn records(&self) -> Records<B> {
        Records {
            file: self.id,
            reader: ReadBuffer::new(self.blob.clone(), self.size, SCAN_BUFFER),
            offset: HEADER_SIZE,
            size: self.size,
            done: false,
        }
    }
}

/// Sequential scan over the records of a [DataFile].
///
/// The scan stops (with a warning) at the first record that is truncated or fails its checksum.
pub struct Records<B: Blob> {
    file: u32,
    reader: ReadBuffer<B>,
    offset: u64,
    size: u64,
    done: bool,
}

impl<B: Blob> Records<B> {
    /// Return the next record, or `None` once the scan is over.
    pub async fn next(&mut self) -> Result<Option<Record>, Error> {
        if self.done || self.offset >= self.size {
            return Ok(None);
        }
        let record = self.next_record().await;
        if !matches!(record, Ok(Some(_))) {
            self.done = true;
        }
        record
    }

    async fn next_record(&mut self) -> Result<Option<Record>, Error> {
        let offset = self.offset;
        let remaining = self.size - offset;
        if remaining < RECORD_OVERHEAD {
            warn!(
                file = self.file,
                offset, remaining, "trailing bytes shorter than a record, ignoring"
            );
            return Ok(None);
        }

        // Read the prefix
        self.reader.seek_to(offset)?;
        let mut prefix = [0u8; 12];
        self.reader.read_exact(&mut prefix, 12).await?;
        let mut cursor = &prefix[..];
        let len = cursor.get_u32() as u64;
        let key = cursor.get_u64();
        if RECORD_OVERHEAD + len > remaining {
            warn!(
                file = self.file,
                offset, len, "record extends past end of file, ignoring"
            );
            return Ok(None);
        }

        // Read the body
        let body_len = len as usize + 4;
        let mut body = vec![0u8; body_len];
        self.reader.read_exact(&mut body, body_len).await?;
        let crc = (&body[len as usize..]).get_u32();
        body.truncate(len as usize);
        if crc != checksum(key, &body) {
            warn!(
                file = self.file,
                offset, "record checksum mismatch, ignoring rest of file"
            );
            return Ok(None);
        }
        self.offset += RECORD_OVERHEAD + len;

        Ok(Some(Record {
            location: DiskLocation::new(self.file, offset)?,
            key,
            payload: Bytes::from(body),
        }))
    }
}

/// Appends records to a new data file.
///
/// The header is left zeroed until [Writer::finish] has synced every record, so an interrupted
/// writer never produces a file that opens.
pub struct Writer<E: Storage> {
    context: E,
    partition: String,
    id: u32,
    sequence: u64,
    blob: E::Blob,
    out: Write<E::Blob>,
    position: u64,
    records: u64,
}

impl<E: Storage> Writer<E> {
    pub(super) async fn create(
        context: E,
        partition: String,
        id: u32,
        sequence: u64,
        buffer: usize,
    ) -> Result<Self, Error> {
        let (blob, size) = context.open(&partition, &blob_name(id)).await?;
        if size > 0 {
            blob.resize(0).await?;
        }
        blob.write_at(vec![0u8; Header::SIZE], 0).await?;
        let out = Write::new(blob.clone(), HEADER_SIZE, buffer);

        Ok(Self {
            context,
            partition,
            id,
            sequence,
            blob,
            out,
            position: HEADER_SIZE,
            records: 0,
        })
    }

    /// Id of the file being written.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sequence of the file being written.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of records appended so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Bytes written so far (including the header).
    pub fn size(&self) -> u64 {
        self.position
    }

    /// Append a record, returning where it will be readable once the file is finished.
    pub async fn append(&mut self, key: u64, payload: &[u8]) -> Result<DiskLocation, Error> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::RecordTooLarge(payload.len()));
        }
        let offset = self.position;
        let len = RECORD_OVERHEAD + payload.len() as u64;
        if offset + len > MAX_OFFSET {
            return Err(Error::OffsetOverflow(offset + len));
        }
        let location = DiskLocation::new(self.id, offset)?;

        let mut frame = Vec::with_capacity(len as usize);
        frame.put_u32(payload.len() as u32);
        frame.put_u64(key);
        frame.put_slice(payload);
        frame.put_u32(checksum(key, payload));
        self.out.write_at(frame, offset).await?;
        self.position += len;

        self.records += 1;
        Ok(location)
    }

    /// Sync every record, complete the header, and open the file for reading.
    pub async fn finish(self) -> Result<DataFile<E::Blob>, Error> {
        self.out.sync().await?;
        let header = Header {
            id: self.id,
            sequence: self.sequence,
        };
        self.blob.write_at(header.encode().to_vec(), 0).await?;
        self.blob.sync().await?;
        let size = self.position;
        debug!(
            file = self.id,
            sequence = self.sequence,
            records = self.records,
            size,
            "finished data file"
        );
        Ok(DataFile {
            id: self.id,
            sequence: self.sequence,
            blob: self.blob,
            size,
        })
    }

    /// Discard the file.
    pub async fn abort(self) {
        let Writer {
            context,
            partition,
            id,
            blob,
            out,
            ..
        } = self;
        drop(out);
        drop(blob);
        if let Err(err) = remove_blob(&context, &partition, &blob_name(id)).await {
            warn!(file = id, ?err, "failed to remove aborted data file");
        }
    }
}

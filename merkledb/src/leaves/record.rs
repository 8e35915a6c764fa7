use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, Read, Write};

/// The key and value stored at a leaf path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LeafRecord {
    pub path: u64,
    pub key: Bytes,
    pub value: Bytes,
}

impl LeafRecord {
    pub fn new(path: u64, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            path,
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Write for LeafRecord {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.path);
        buf.put_u32(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }
}

impl EncodeSize for LeafRecord {
    fn encode_size(&self) -> usize {
        12 + self.key.len() + self.value.len()
    }
}

impl Read for LeafRecord {
    type Cfg = ();

    /// The value runs to the end of `buf`.
    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        if buf.remaining() < 12 {
            return Err(Error::EndOfBuffer);
        }
        let path = buf.get_u64();
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Error::Invalid("LeafRecord", "key length exceeds record"));
        }
        let key = buf.copy_to_bytes(len);
        let value = buf.copy_to_bytes(buf.remaining());
        Ok(Self { path, key, value })
    }
}

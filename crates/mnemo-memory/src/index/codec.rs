//! On-disk layout of a persisted index.
//!
//! ```text
//! magic "MNIX" | version u32 | dimension u32 | count u64
//! count × (id i64 | dimension × f32)
//! blake3(everything above) 32 bytes
//! ```
//!
//! All integers and floats are little-endian. Floats are stored bit-exact so a
//! reloaded index ranks queries exactly like the one that was persisted.

use std::collections::BTreeMap;

use super::IndexError;
use crate::types::NumericId;

const MAGIC: &[u8; 4] = b"MNIX";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const HASH_LEN: usize = 32;

#[derive(Debug, Default, PartialEq)]
pub(super) struct Decoded {
    pub dimension: Option<usize>,
    pub entries: BTreeMap<NumericId, Vec<f32>>,
}

pub(super) fn encode(
    dimension: Option<usize>,
    entries: &BTreeMap<NumericId, Vec<f32>>,
) -> Result<Vec<u8>, IndexError> {
    let dim = dimension.unwrap_or(0);
    let dim_u32 = u32::try_from(dim)
        .map_err(|_| IndexError::Corrupt(format!("dimension {dim} does not fit the format")))?;
    let count = entries.len() as u64;

    let mut buf = Vec::with_capacity(HEADER_LEN + entries.len() * (8 + dim * 4) + HASH_LEN);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&dim_u32.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    for (id, vector) in entries {
        if vector.len() != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }
        buf.extend_from_slice(&id.0.to_le_bytes());
        for x in vector {
            buf.extend_from_slice(&x.to_le_bytes());
        }
    }
    let hash = blake3::hash(&buf);
    buf.extend_from_slice(hash.as_bytes());
    Ok(buf)
}

pub(super) fn decode(bytes: &[u8]) -> Result<Decoded, IndexError> {
    if bytes.len() < HEADER_LEN + HASH_LEN {
        return Err(IndexError::Corrupt(format!(
            "file too short ({} bytes)",
            bytes.len()
        )));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - HASH_LEN);
    if blake3::hash(body).as_bytes() != trailer {
        return Err(IndexError::Corrupt("checksum mismatch".into()));
    }

    let mut reader = Reader { buf: body, pos: 0 };
    if reader.take(4)? != MAGIC {
        return Err(IndexError::Corrupt("bad magic".into()));
    }
    let version = reader.u32()?;
    if version != VERSION {
        return Err(IndexError::Corrupt(format!(
            "unsupported format version {version}"
        )));
    }
    let dim = reader.u32()? as usize;
    let count = reader.u64()?;

    let entry_len = 8 + dim * 4;
    let expected = usize::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(entry_len))
        .ok_or_else(|| IndexError::Corrupt(format!("entry count {count} overflows")))?;
    if reader.remaining() != expected {
        return Err(IndexError::Corrupt(format!(
            "expected {expected} bytes of entries, found {}",
            reader.remaining()
        )));
    }
    if dim == 0 && count > 0 {
        return Err(IndexError::Corrupt("entries without a dimension".into()));
    }

    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let id = NumericId(reader.i64()?);
        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            vector.push(reader.f32()?);
        }
        if entries.insert(id, vector).is_some() {
            return Err(IndexError::Corrupt(format!("duplicate id {id}")));
        }
    }

    Ok(Decoded {
        dimension: (dim > 0).then_some(dim),
        entries,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        if self.remaining() < n {
            return Err(IndexError::Corrupt("unexpected end of file".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], IndexError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, IndexError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, IndexError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, IndexError> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

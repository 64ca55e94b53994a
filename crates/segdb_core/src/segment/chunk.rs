//! Chunk file encoding for segment main and delta files.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "SGCK" | version u16 | count u32 | entries... | crc32 u32
//! entry: flags u8 | key_len u32 | key | value_len u32 | value
//! ```
//!
//! The CRC covers every byte before it.

use crate::error::{IndexError, IndexResult};
use std::collections::BTreeMap;

const MAGIC: &[u8; 4] = b"SGCK";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

const FLAG_TOMBSTONE: u8 = 0x01;

/// Sorted entries of one chunk. `None` values are tombstones.
pub type ChunkEntries = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Encodes sorted entries into chunk bytes.
///
/// # Errors
///
/// `InvalidArgument` if the entry count or a key or value length does not
/// fit its u32 prefix.
pub fn encode(entries: &ChunkEntries) -> IndexResult<Vec<u8>> {
    let payload: usize = entries
        .iter()
        .map(|(k, v)| 9 + k.len() + v.as_ref().map_or(0, Vec::len))
        .sum();
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload + CRC_SIZE);

    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&length_prefix(entries.len(), "entry count")?.to_le_bytes());

    for (key, value) in entries {
        let flags = if value.is_none() { FLAG_TOMBSTONE } else { 0 };
        buf.push(flags);
        buf.extend_from_slice(&length_prefix(key.len(), "key")?.to_le_bytes());
        buf.extend_from_slice(key);
        let value = value.as_deref().unwrap_or_default();
        buf.extend_from_slice(&length_prefix(value.len(), "value")?.to_le_bytes());
        buf.extend_from_slice(value);
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn length_prefix(len: usize, field: &str) -> IndexResult<u32> {
    u32::try_from(len).map_err(|_| {
        IndexError::invalid_argument(format!("chunk {field} of {len} exceeds the u32 limit"))
    })
}

/// Decodes chunk bytes, verifying magic, version and checksum.
///
/// # Errors
///
/// Returns `Corruption` if the bytes are not a valid chunk.
pub fn decode(data: &[u8]) -> IndexResult<ChunkEntries> {
    if data.len() < HEADER_SIZE + CRC_SIZE {
        return Err(IndexError::corruption("chunk too short"));
    }
    if &data[..4] != MAGIC {
        return Err(IndexError::corruption("bad chunk magic"));
    }

    let body_len = data.len() - CRC_SIZE;
    let stored = u32::from_le_bytes([
        data[body_len],
        data[body_len + 1],
        data[body_len + 2],
        data[body_len + 3],
    ]);
    let computed = crc32fast::hash(&data[..body_len]);
    if stored != computed {
        return Err(IndexError::corruption(format!(
            "chunk checksum mismatch: expected {stored:#010x}, got {computed:#010x}"
        )));
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != VERSION {
        return Err(IndexError::corruption(format!(
            "unsupported chunk version {version}"
        )));
    }
    let count = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;

    let mut reader = Reader {
        data: &data[..body_len],
        pos: HEADER_SIZE,
    };
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let flags = reader.take(1)?[0];
        let key_len = reader.u32()? as usize;
        let key = reader.take(key_len)?.to_vec();
        let value_len = reader.u32()? as usize;
        let value = reader.take(value_len)?.to_vec();
        let value = if flags & FLAG_TOMBSTONE != 0 {
            None
        } else {
            Some(value)
        };
        entries.insert(key, value);
    }
    if reader.pos != body_len {
        return Err(IndexError::corruption("trailing bytes after chunk entries"));
    }
    Ok(entries)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> IndexResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| IndexError::corruption("truncated chunk entry"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> IndexResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

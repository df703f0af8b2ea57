//! Key/value records made of raw bytes
//!
//! Binary form:
//! ```text
//! ┌──────────────┬──────────────┬─────────┬───────────┐
//! │ KeyLen (u32) │ ValLen (u32) │   Key   │   Value   │
//! └──────────────┴──────────────┴─────────┴───────────┘
//! ```

use std::cmp::Ordering;
use std::io::{Read, Write};

use bytes::Bytes;

use crate::error::{Result, SortError};

use super::{TypeComparator, TypeSerializer};

/// A record with an opaque byte key and byte value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytesRecord {
    pub key: Bytes,
    pub value: Bytes,
}

impl BytesRecord {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Serializer for [`BytesRecord`]
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl TypeSerializer<BytesRecord> for BytesSerializer {
    fn create_instance(&self) -> BytesRecord {
        BytesRecord::default()
    }

    fn serialize(&self, record: &BytesRecord, target: &mut dyn Write) -> Result<()> {
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&(record.key.len() as u32).to_le_bytes());
        header[4..8].copy_from_slice(&(record.value.len() as u32).to_le_bytes());

        target.write_all(&header).map_err(SortError::serialization)?;
        target.write_all(&record.key).map_err(SortError::serialization)?;
        target
            .write_all(&record.value)
            .map_err(SortError::serialization)
    }

    fn deserialize(&self, source: &mut dyn Read) -> Result<BytesRecord> {
        let mut header = [0u8; 8];
        source
            .read_exact(&mut header)
            .map_err(SortError::serialization)?;

        let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let val_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut payload = vec![0u8; key_len + val_len];
        source
            .read_exact(&mut payload)
            .map_err(SortError::serialization)?;

        let mut payload = Bytes::from(payload);
        let value = payload.split_off(key_len);
        Ok(BytesRecord {
            key: payload,
            value,
        })
    }
}

/// Lexicographic order on the key bytes
///
/// Normalized key layout for length `n`: the first `n - 1` key bytes
/// (zero-padded), then `min(key_len, n - 1)`. The trailing length byte keeps
/// `"a"` ordered before `"a\0"` even though their padded prefixes agree.
#[derive(Debug, Clone, Copy)]
pub struct BytesKeyComparator {
    normalized_len: usize,
}

impl BytesKeyComparator {
    pub fn new(normalized_len: usize) -> Self {
        Self {
            normalized_len: normalized_len.min(256),
        }
    }
}

impl Default for BytesKeyComparator {
    fn default() -> Self {
        Self::new(8)
    }
}

impl TypeComparator<BytesRecord> for BytesKeyComparator {
    fn compare(&self, a: &BytesRecord, b: &BytesRecord) -> Ordering {
        a.key.cmp(&b.key)
    }

    fn normalized_key_len(&self) -> usize {
        self.normalized_len
    }

    fn put_normalized_key(&self, record: &BytesRecord, target: &mut [u8]) -> bool {
        if target.is_empty() {
            return false;
        }

        let prefix_len = target.len() - 1;
        let copied = record.key.len().min(prefix_len);
        target[..copied].copy_from_slice(&record.key[..copied]);
        target[copied..prefix_len].fill(0);
        target[prefix_len] = copied as u8;

        record.key.len() < prefix_len
    }
}

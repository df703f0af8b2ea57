//! `(i32, i32)` records keyed on the first field
//!
//! Binary form: two big-endian `i32`s (8 bytes).

use std::cmp::Ordering;
use std::io::{Read, Write};

use crate::error::{Result, SortError};

use super::{TypeComparator, TypeSerializer};

/// Serializer for `(key, value)` integer pairs
#[derive(Debug, Clone, Copy, Default)]
pub struct IntPairSerializer;

impl TypeSerializer<(i32, i32)> for IntPairSerializer {
    fn create_instance(&self) -> (i32, i32) {
        (0, 0)
    }

    fn serialize(&self, record: &(i32, i32), target: &mut dyn Write) -> Result<()> {
        let mut bytes = [0u8; 8];
        bytes[0..4].copy_from_slice(&record.0.to_be_bytes());
        bytes[4..8].copy_from_slice(&record.1.to_be_bytes());
        target.write_all(&bytes).map_err(SortError::serialization)
    }

    fn deserialize(&self, source: &mut dyn Read) -> Result<(i32, i32)> {
        let mut bytes = [0u8; 8];
        source
            .read_exact(&mut bytes)
            .map_err(SortError::serialization)?;
        Ok((
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        ))
    }
}

/// Orders pairs by their first field
///
/// The normalized key is the key with its sign bit flipped, big-endian, so
/// byte order equals numeric order and the prefix is always complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntPairComparator {
    descending: bool,
}

impl IntPairComparator {
    pub fn ascending() -> Self {
        Self { descending: false }
    }

    pub fn descending() -> Self {
        Self { descending: true }
    }
}

impl TypeComparator<(i32, i32)> for IntPairComparator {
    fn compare(&self, a: &(i32, i32), b: &(i32, i32)) -> Ordering {
        let ord = a.0.cmp(&b.0);
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }

    fn normalized_key_len(&self) -> usize {
        4
    }

    fn put_normalized_key(&self, record: &(i32, i32), target: &mut [u8]) -> bool {
        let mut key = (record.0 as u32) ^ 0x8000_0000;
        if self.descending {
            key = !key;
        }
        target.copy_from_slice(&key.to_be_bytes());
        true
    }
}

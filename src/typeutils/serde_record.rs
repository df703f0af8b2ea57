//! Serde-based records
//!
//! Any `Serialize + DeserializeOwned` type can be sorted through bincode, with
//! a key extractor providing the order. No normalized key is available, so
//! every comparison in the sort buffer decodes both records.

use std::cmp::Ordering;
use std::io::{Read, Write};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SortError};

use super::{TypeComparator, TypeSerializer};

/// bincode serializer for serde types
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TypeSerializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    fn create_instance(&self) -> T {
        T::default()
    }

    fn serialize(&self, record: &T, target: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(target, record).map_err(SortError::serialization)
    }

    fn deserialize(&self, source: &mut dyn Read) -> Result<T> {
        bincode::deserialize_from(source).map_err(SortError::serialization)
    }
}

/// Orders records by an extracted key
pub struct KeyComparator<T, K, F> {
    extract: F,
    _marker: PhantomData<fn(&T) -> K>,
}

impl<T, K, F> KeyComparator<T, K, F>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    pub fn new(extract: F) -> Self {
        Self {
            extract,
            _marker: PhantomData,
        }
    }
}

impl<T, K, F> TypeComparator<T> for KeyComparator<T, K, F>
where
    K: Ord,
    F: Fn(&T) -> K + Send + Sync,
{
    fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.extract)(a).cmp(&(self.extract)(b))
    }
}

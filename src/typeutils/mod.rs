//! Type Utilities Module
//!
//! The interfaces through which the engine handles records it knows nothing
//! about, plus a few ready-made implementations.
//!
//! ## Interfaces
//! - [`TypeSerializer`]: record ⇄ bytes
//! - [`TypeComparator`]: total order plus an optional normalized key prefix
//! - [`RecordIterator`]: pull-based record stream (engine input and output)
//! - [`Collector`]: push-based record sink (combiner output)
//!
//! ## Normalized Keys
//! A comparator may expose a fixed-length, byte-comparable prefix of the sort
//! key. The sort buffer compares these prefixes with `memcmp` and only decodes
//! records when two prefixes tie and at least one of them is not complete.

mod keyvalue;
mod pair;
mod serde_record;
mod source;

use std::cmp::Ordering;
use std::io::{Read, Write};

use crate::error::Result;

pub use keyvalue::{BytesKeyComparator, BytesRecord, BytesSerializer};
pub use pair::{IntPairComparator, IntPairSerializer};
pub use serde_record::{BincodeSerializer, KeyComparator};
pub use source::{IterSource, VecSource};

/// Encodes and decodes records of type `T`
pub trait TypeSerializer<T>: Send + Sync {
    /// A fresh instance, used to seed object reuse
    fn create_instance(&self) -> T;

    /// Write the binary form of `record`
    fn serialize(&self, record: &T, target: &mut dyn Write) -> Result<()>;

    /// Read one record
    fn deserialize(&self, source: &mut dyn Read) -> Result<T>;

    /// Read one record, overwriting `reuse` where the type allows it
    fn deserialize_reuse(&self, reuse: T, source: &mut dyn Read) -> Result<T> {
        let _ = reuse;
        self.deserialize(source)
    }
}

/// Orders records of type `T`
pub trait TypeComparator<T>: Send + Sync {
    /// Total order over records
    fn compare(&self, a: &T, b: &T) -> Ordering;

    /// Length of the normalized key prefix in bytes (0 = not supported)
    fn normalized_key_len(&self) -> usize {
        0
    }

    /// Write the normalized key of `record` into `target`
    /// (`target.len() == normalized_key_len()`).
    ///
    /// Returns true if the prefix captures the whole key, i.e. two records
    /// whose complete prefixes are equal compare as equal.
    fn put_normalized_key(&self, record: &T, target: &mut [u8]) -> bool {
        let _ = (record, target);
        false
    }

    /// True if both records belong to the same key group
    fn equal_keys(&self, a: &T, b: &T) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

/// Pull-based record stream
///
/// `Ok(None)` marks the end of the stream.
pub trait RecordIterator<T> {
    /// Next record as a fresh instance
    fn next(&mut self) -> Result<Option<T>>;

    /// Next record, allowed to overwrite and return `reuse`
    fn next_reuse(&mut self, reuse: T) -> Result<Option<T>> {
        let _ = reuse;
        self.next()
    }
}

impl<T, R: RecordIterator<T> + ?Sized> RecordIterator<T> for Box<R> {
    fn next(&mut self) -> Result<Option<T>> {
        (**self).next()
    }

    fn next_reuse(&mut self, reuse: T) -> Result<Option<T>> {
        (**self).next_reuse(reuse)
    }
}

/// Push-based record sink
pub trait Collector<T> {
    fn collect(&mut self, record: T) -> Result<()>;
}

impl<T> Collector<T> for Vec<T> {
    fn collect(&mut self, record: T) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

impl<T> Collector<T> for std::collections::VecDeque<T> {
    fn collect(&mut self, record: T) -> Result<()> {
        self.push_back(record);
        Ok(())
    }
}

//! In-memory record sources

use crate::error::Result;

use super::RecordIterator;

/// Yields the records of a `Vec` in order
pub struct VecSource<T> {
    records: std::vec::IntoIter<T>,
}

impl<T> VecSource<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

impl<T> RecordIterator<T> for VecSource<T> {
    fn next(&mut self) -> Result<Option<T>> {
        Ok(self.records.next())
    }
}

/// Adapts any `Iterator` into a record source
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<T, I> RecordIterator<T> for IterSource<I>
where
    I: Iterator<Item = T>,
{
    fn next(&mut self) -> Result<Option<T>> {
        Ok(self.inner.next())
    }
}

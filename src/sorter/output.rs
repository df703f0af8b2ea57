//! Sorted output

use crate::error::Result;
use crate::merge::SortedSource;
use crate::typeutils::RecordIterator;

/// The sorted (and possibly combined) result of a [`Sorter`](super::Sorter)
///
/// Pull records through [`RecordIterator`] or as a plain
/// `Iterator<Item = Result<T>>`. Iteration stops after the first error, and
/// every merge source is released before that error is returned.
pub struct SortedOutput<T> {
    source: Option<Box<dyn SortedSource<T>>>,
    /// Merge round reported in errors
    round: usize,
    failed: bool,
}

impl<T> SortedOutput<T> {
    pub(crate) fn new(source: Option<Box<dyn SortedSource<T>>>, round: usize) -> Self {
        Self {
            source,
            round,
            failed: false,
        }
    }

    /// Next record
    pub fn next_record(&mut self) -> Result<Option<T>> {
        self.pull(|source| source.next())
    }

    /// Next record, allowed to overwrite `reuse`
    pub fn next_record_reuse(&mut self, reuse: T) -> Result<Option<T>> {
        self.pull(|source| source.next_reuse(reuse))
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        match self.source.take() {
            Some(mut source) => source.close(),
            None => Ok(()),
        }
    }

    fn pull<F>(&mut self, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Box<dyn SortedSource<T>>) -> Result<Option<T>>,
    {
        if self.failed {
            return Ok(None);
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        match f(source) {
            Ok(record) => Ok(record),
            Err(e) => {
                self.failed = true;
                // Readers, resident buffers and channel files go back now
                if let Err(close_err) = self.close() {
                    tracing::warn!(error = %close_err, "Failed to release merge sources");
                }
                Err(e.merging(self.round))
            }
        }
    }
}

impl<T> RecordIterator<T> for SortedOutput<T> {
    fn next(&mut self) -> Result<Option<T>> {
        self.next_record()
    }

    fn next_reuse(&mut self, reuse: T) -> Result<Option<T>> {
        self.next_record_reuse(reuse)
    }
}

impl<T> Iterator for SortedOutput<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        self.next_record().transpose()
    }
}

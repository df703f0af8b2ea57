//! Merge Iterator
//!
//! Pulls one head record per source into a heap and always emits the
//! smallest. Look-ahead is exactly one record per source.

use std::sync::Arc;

use crate::error::Result;
use crate::typeutils::{RecordIterator, TypeComparator};

use super::heap::MergeHeap;
use super::SortedSource;

/// Merges sorted sources into one sorted stream
pub struct MergeIterator<T, S = Box<dyn SortedSource<T>>> {
    sources: Vec<S>,
    heap: MergeHeap<T>,
    initialized: bool,
}

impl<T, S: SortedSource<T>> MergeIterator<T, S> {
    /// Merge `sources`; equal keys come out in the order of `sources`
    pub fn new(sources: Vec<S>, comparator: Arc<dyn TypeComparator<T>>) -> Self {
        let heap = MergeHeap::new(comparator, sources.len());
        Self {
            sources,
            heap,
            initialized: false,
        }
    }

    /// Number of merged sources
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Give up the sources without closing them
    pub fn into_sources(mut self) -> Vec<S> {
        self.heap.clear();
        std::mem::take(&mut self.sources)
    }

    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        for (i, source) in self.sources.iter_mut().enumerate() {
            if let Some(record) = source.next()? {
                self.heap.push(record, i);
            }
        }
        Ok(())
    }
}

impl<T, S: SortedSource<T>> RecordIterator<T> for MergeIterator<T, S> {
    fn next(&mut self) -> Result<Option<T>> {
        self.initialize()?;
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(record) = self.sources[top.source].next()? {
            self.heap.push(record, top.source);
        }
        Ok(Some(top.record))
    }

    /// `reuse` refills the source the returned record came from
    fn next_reuse(&mut self, reuse: T) -> Result<Option<T>> {
        self.initialize()?;
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(record) = self.sources[top.source].next_reuse(reuse)? {
            self.heap.push(record, top.source);
        }
        Ok(Some(top.record))
    }
}

impl<T: Send, S: SortedSource<T>> SortedSource<T> for MergeIterator<T, S> {
    fn close(&mut self) -> Result<()> {
        self.heap.clear();
        let mut first_error = None;
        for mut source in self.sources.drain(..) {
            if let Err(e) = source.close() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

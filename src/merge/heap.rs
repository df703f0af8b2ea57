//! Binary min-heap of source heads ordered by a runtime comparator
//!
//! `std::collections::BinaryHeap` needs `Ord` on the element type, which
//! records do not have; their order lives in a `TypeComparator` object.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::typeutils::TypeComparator;

pub(crate) struct HeapEntry<T> {
    pub record: T,
    pub source: usize,
}

pub(crate) struct MergeHeap<T> {
    entries: Vec<HeapEntry<T>>,
    comparator: Arc<dyn TypeComparator<T>>,
}

impl<T> MergeHeap<T> {
    pub fn new(comparator: Arc<dyn TypeComparator<T>>, capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            comparator,
        }
    }

    pub fn push(&mut self, record: T, source: usize) {
        self.entries.push(HeapEntry { record, source });
        self.sift_up(self.entries.len() - 1);
    }

    pub fn pop(&mut self) -> Option<HeapEntry<T>> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let top = self.entries.pop();
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        top
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Record order first, source position on ties
    fn less(&self, a: usize, b: usize) -> bool {
        let (a, b) = (&self.entries[a], &self.entries[b]);
        match self.comparator.compare(&a.record, &b.record) {
            Ordering::Equal => a.source < b.source,
            ordering => ordering == Ordering::Less,
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.entries.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.entries.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let child = if right < n && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, i) {
                break;
            }
            self.entries.swap(i, child);
            i = child;
        }
    }
}

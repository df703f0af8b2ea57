//! Key grouping over sorted streams

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Result, SortError};
use crate::merge::SortedSource;
use crate::typeutils::{RecordIterator, TypeComparator};

use super::SharedCombiner;

/// Splits a sorted stream into runs of equal-key records
///
/// Read errors cannot travel through a group's `Iterator` interface; they
/// end the group early and are reported by [`take_error`](Self::take_error)
/// and by the next call to [`next_group`](Self::next_group).
pub struct KeyGroupedIterator<T, I> {
    input: I,
    comparator: Arc<dyn TypeComparator<T>>,
    /// Next record of the current group
    pending: Option<T>,
    /// First record of the following group
    next_head: Option<T>,
    exhausted: bool,
    error: Option<SortError>,
}

impl<T, I: RecordIterator<T>> KeyGroupedIterator<T, I> {
    pub fn new(input: I, comparator: Arc<dyn TypeComparator<T>>) -> Self {
        Self {
            input,
            comparator,
            pending: None,
            next_head: None,
            exhausted: false,
            error: None,
        }
    }

    /// Move to the next group; records left in the current group are skipped
    pub fn next_group(&mut self) -> Result<Option<Group<'_, T, I>>> {
        while self.pending.is_some() {
            self.advance();
        }
        if let Some(e) = self.error.take() {
            return Err(e);
        }

        let head = match self.next_head.take() {
            Some(head) => head,
            None if self.exhausted => return Ok(None),
            None => match self.input.next()? {
                Some(head) => head,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            },
        };

        self.pending = Some(head);
        Ok(Some(Group { parent: self }))
    }

    /// The read error that cut the last group short, if any
    pub fn take_error(&mut self) -> Option<SortError> {
        self.error.take()
    }

    pub fn get_mut(&mut self) -> &mut I {
        &mut self.input
    }

    /// Yield the pending record and look one record ahead
    fn advance(&mut self) -> Option<T> {
        let record = self.pending.take()?;
        if !self.exhausted {
            match self.input.next() {
                Ok(Some(next)) => {
                    if self.comparator.equal_keys(&record, &next) {
                        self.pending = Some(next);
                    } else {
                        self.next_head = Some(next);
                    }
                }
                Ok(None) => self.exhausted = true,
                Err(e) => {
                    self.error = Some(e);
                    self.exhausted = true;
                }
            }
        }
        Some(record)
    }
}

/// The records of one key group
pub struct Group<'a, T, I> {
    parent: &'a mut KeyGroupedIterator<T, I>,
}

impl<T, I: RecordIterator<T>> Iterator for Group<'_, T, I> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.parent.advance()
    }
}

/// Sorted stream of combined groups
///
/// Holds at most one group's worth of combiner output at a time.
pub struct CombiningIterator<T, I> {
    groups: KeyGroupedIterator<T, I>,
    combiner: Arc<SharedCombiner<T>>,
    output: VecDeque<T>,
}

impl<T, I: RecordIterator<T>> CombiningIterator<T, I> {
    pub fn new(input: I, comparator: Arc<dyn TypeComparator<T>>, combiner: Arc<SharedCombiner<T>>) -> Self {
        Self {
            groups: KeyGroupedIterator::new(input, comparator),
            combiner,
            output: VecDeque::new(),
        }
    }
}

impl<T, I: RecordIterator<T>> RecordIterator<T> for CombiningIterator<T, I> {
    fn next(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(record) = self.output.pop_front() {
                return Ok(Some(record));
            }

            let Some(mut group) = self.groups.next_group()? else {
                return Ok(None);
            };
            self.combiner.combine(&mut group, &mut self.output)?;

            if let Some(e) = self.groups.take_error() {
                return Err(e);
            }
        }
    }
}

impl<T: Send, I: SortedSource<T>> SortedSource<T> for CombiningIterator<T, I> {
    fn close(&mut self) -> Result<()> {
        self.output.clear();
        self.groups.pending = None;
        self.groups.next_head = None;
        self.groups.get_mut().close()
    }
}

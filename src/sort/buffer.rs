//! Sort Buffer
//!
//! Arena of serialized records plus an index of fixed-length entries.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Result, SortError};
use crate::io::ChannelOutputView;
use crate::memory::{read_at, write_at, MemoryManager, MemorySegment, SegmentReader};
use crate::merge::SortedSource;
use crate::typeutils::{RecordIterator, TypeComparator, TypeSerializer};

use super::quicksort::{self, IndexedSortable};

/// Pointer flag: record lives in the overflow region
const OVERFLOW_FLAG: u64 = 1 << 63;
/// Pointer flag: the normalized key decides comparisons on its own
const FULL_KEY_FLAG: u64 = 1 << 62;
const POSITION_MASK: u64 = FULL_KEY_FLAG - 1;

const POINTER_LEN: usize = 8;
const LENGTH_PREFIX: usize = 4;

/// In-memory batch of records, sortable without moving record bytes
///
/// All memory comes from the segments handed to [`new`](Self::new); the
/// buffer never allocates segments on its own. Segments move from the free
/// list into the data, index and overflow regions as records arrive and go
/// back on [`reset`](Self::reset).
pub struct SortBuffer<T> {
    serializer: Arc<dyn TypeSerializer<T>>,
    comparator: Arc<dyn TypeComparator<T>>,

    page_size: usize,
    total_segments: usize,
    free: Vec<MemorySegment>,
    data: Vec<MemorySegment>,
    index: Vec<MemorySegment>,
    overflow: Vec<MemorySegment>,

    /// Normalized key bytes per entry (0 = compare records only)
    key_len: usize,
    entry_len: usize,
    entries_per_segment: usize,

    /// Logical end of the data region
    data_end: usize,
    /// Logical end of the overflow region
    overflow_end: usize,
    count: usize,

    large_records: bool,

    record_scratch: Vec<u8>,
    key_scratch: Vec<u8>,
    /// First decode failure seen while sorting
    sort_error: Option<SortError>,
}

impl<T> SortBuffer<T> {
    /// Create a buffer over `segments` (at least two are needed to hold a record)
    pub fn new(
        serializer: Arc<dyn TypeSerializer<T>>,
        comparator: Arc<dyn TypeComparator<T>>,
        segments: Vec<MemorySegment>,
        large_records: bool,
    ) -> Self {
        let page_size = segments.first().map_or(0, |s| s.size());

        // Keys that would not leave room for a single entry per segment are
        // ignored; records are compared in full instead.
        let mut key_len = comparator.normalized_key_len();
        if POINTER_LEN + key_len > page_size {
            key_len = 0;
        }
        let entry_len = POINTER_LEN + key_len;

        Self {
            serializer,
            comparator,
            page_size,
            total_segments: segments.len(),
            free: segments,
            data: Vec::new(),
            index: Vec::new(),
            overflow: Vec::new(),
            key_len,
            entry_len,
            entries_per_segment: if page_size == 0 { 1 } else { page_size / entry_len },
            data_end: 0,
            overflow_end: 0,
            count: 0,
            large_records,
            record_scratch: Vec::new(),
            key_scratch: vec![0u8; key_len],
            sort_error: None,
        }
    }

    /// Append a record
    ///
    /// Returns `Ok(false)` if the buffer has no room left; the record is not
    /// stored and the buffer is unchanged.
    pub fn write(&mut self, record: &T) -> Result<bool> {
        self.record_scratch.clear();
        self.serializer.serialize(record, &mut self.record_scratch)?;

        let len = self.record_scratch.len();
        let stored = LENGTH_PREFIX + len;
        let large = stored > self.page_size;

        if self.total_segments == 0 || len > u32::MAX as usize || (large && !self.large_records) {
            return Err(SortError::RecordTooLarge {
                size: len,
                limit: self.max_record_len(),
            });
        }

        let index_needed = usize::from(self.count % self.entries_per_segment == 0);
        let (start, region_needed) = if large {
            let start = self.overflow_end.div_ceil(self.page_size) * self.page_size;
            let needed = (start + stored).div_ceil(self.page_size) - self.overflow.len();
            (start, needed)
        } else {
            let needed = (self.data_end + stored)
                .div_ceil(self.page_size)
                .saturating_sub(self.data.len());
            (self.data_end, needed)
        };

        if index_needed + region_needed > self.free.len() {
            if self.count == 0 {
                return Err(SortError::RecordTooLarge {
                    size: len,
                    limit: self.max_record_len(),
                });
            }
            return Ok(false);
        }

        let split = self.free.len() - index_needed;
        self.index.extend(self.free.drain(split..));
        let split = self.free.len() - region_needed;
        let region = if large { &mut self.overflow } else { &mut self.data };
        region.extend(self.free.drain(split..));

        write_at(region, self.page_size, start, &(len as u32).to_le_bytes());
        write_at(region, self.page_size, start + LENGTH_PREFIX, &self.record_scratch);

        let mut pointer = start as u64;
        if large {
            pointer |= OVERFLOW_FLAG;
            self.overflow_end = start + stored;
        } else {
            self.data_end = start + stored;
        }

        if self.key_len > 0 {
            self.key_scratch.fill(0);
            if self.comparator.put_normalized_key(record, &mut self.key_scratch) {
                pointer |= FULL_KEY_FLAG;
            }
        }

        let (segment, offset) = self.entry_position(self.count);
        let entry = &mut self.index[segment][offset..offset + self.entry_len];
        entry[..POINTER_LEN].copy_from_slice(&pointer.to_be_bytes());
        entry[POINTER_LEN..].copy_from_slice(&self.key_scratch);

        self.count += 1;
        Ok(true)
    }

    /// Sort the index in place
    pub fn sort(&mut self) -> Result<()> {
        quicksort::sort(self);
        match self.sort_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Decode the record at index position `i`
    pub fn record(&self, i: usize) -> Result<T> {
        let (region, start, len) = self.locate(i);
        let mut reader = SegmentReader::new(region, self.page_size, start, start + len);
        self.serializer.deserialize(&mut reader)
    }

    /// Decode the record at index position `i` into `reuse`
    pub fn record_reuse(&self, i: usize, reuse: T) -> Result<T> {
        let (region, start, len) = self.locate(i);
        let mut reader = SegmentReader::new(region, self.page_size, start, start + len);
        self.serializer.deserialize_reuse(reuse, &mut reader)
    }

    /// Copy the serialized record at index position `i` to `out`
    pub fn write_record(&self, i: usize, out: &mut ChannelOutputView) -> Result<()> {
        let (region, mut pos, len) = self.locate(i);
        let end = pos + len;
        while pos < end {
            let offset = pos % self.page_size;
            let n = (end - pos).min(self.page_size - offset);
            out.write_bytes(&region[pos / self.page_size][offset..offset + n])?;
            pos += n;
        }
        Ok(())
    }

    /// Copy every record in index order to `out`
    pub fn write_all(&self, out: &mut ChannelOutputView) -> Result<()> {
        for i in 0..self.count {
            self.write_record(i, out)?;
        }
        Ok(())
    }

    /// Iterate over records in index order
    pub fn iter(&self) -> SortBufferIter<'_, T> {
        SortBufferIter {
            buffer: self,
            position: 0,
        }
    }

    /// Turn the buffer into a merge source that gives its segments back to
    /// `memory` when closed
    pub fn into_source(self, memory: Arc<MemoryManager>) -> SortBufferSource<T> {
        SortBufferSource {
            buffer: Some(self),
            position: 0,
            memory,
        }
    }

    /// Drop all records, keeping the segments
    pub fn reset(&mut self) {
        self.free.append(&mut self.data);
        self.free.append(&mut self.index);
        self.free.append(&mut self.overflow);
        self.data_end = 0;
        self.overflow_end = 0;
        self.count = 0;
        self.sort_error = None;
    }

    /// Hand back every segment
    pub fn dispose(mut self) -> Vec<MemorySegment> {
        self.reset();
        std::mem::take(&mut self.free)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes used by records and index entries
    pub fn occupancy(&self) -> usize {
        self.data_end + self.overflow_end + self.count * self.entry_len
    }

    /// Bytes of memory owned by the buffer
    pub fn capacity(&self) -> usize {
        self.total_segments * self.page_size
    }

    /// Number of segments owned by the buffer
    pub fn segment_count(&self) -> usize {
        self.total_segments
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn max_record_len(&self) -> usize {
        let segments = if self.large_records {
            self.total_segments.saturating_sub(1)
        } else {
            1
        };
        (segments * self.page_size).saturating_sub(LENGTH_PREFIX)
    }

    fn entry_position(&self, i: usize) -> (usize, usize) {
        (
            i / self.entries_per_segment,
            (i % self.entries_per_segment) * self.entry_len,
        )
    }

    fn entry(&self, i: usize) -> &[u8] {
        let (segment, offset) = self.entry_position(i);
        &self.index[segment][offset..offset + self.entry_len]
    }

    fn pointer(&self, i: usize) -> u64 {
        let mut bytes = [0u8; POINTER_LEN];
        bytes.copy_from_slice(&self.entry(i)[..POINTER_LEN]);
        u64::from_be_bytes(bytes)
    }

    /// Region, payload start and payload length of record `i`
    fn locate(&self, i: usize) -> (&[MemorySegment], usize, usize) {
        let pointer = self.pointer(i);
        let region: &[MemorySegment] = if pointer & OVERFLOW_FLAG != 0 {
            &self.overflow
        } else {
            &self.data
        };
        let start = (pointer & POSITION_MASK) as usize;

        let mut prefix = [0u8; LENGTH_PREFIX];
        read_at(region, self.page_size, start, &mut prefix);
        (region, start + LENGTH_PREFIX, u32::from_le_bytes(prefix) as usize)
    }

    fn compare_records(&mut self, i: usize, j: usize) -> Ordering {
        if self.sort_error.is_some() {
            return Ordering::Equal;
        }
        match (self.record(i), self.record(j)) {
            (Ok(a), Ok(b)) => self.comparator.compare(&a, &b),
            (Err(e), _) | (_, Err(e)) => {
                self.sort_error = Some(e);
                Ordering::Equal
            }
        }
    }
}

impl<T> IndexedSortable for SortBuffer<T> {
    fn compare(&mut self, i: usize, j: usize) -> Ordering {
        if self.key_len > 0 {
            let a = self.entry(i);
            let b = self.entry(j);
            match a[POINTER_LEN..].cmp(&b[POINTER_LEN..]) {
                Ordering::Equal => {
                    if self.pointer(i) & self.pointer(j) & FULL_KEY_FLAG != 0 {
                        return Ordering::Equal;
                    }
                }
                decided => return decided,
            }
        }
        self.compare_records(i, j)
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        let len = self.entry_len;
        let (mut a, mut b) = (self.entry_position(i), self.entry_position(j));
        if a > b {
            std::mem::swap(&mut a, &mut b);
        }
        let ((seg_a, off_a), (seg_b, off_b)) = (a, b);

        if seg_a == seg_b {
            let (left, right) = self.index[seg_a].split_at_mut(off_b);
            left[off_a..off_a + len].swap_with_slice(&mut right[..len]);
        } else {
            let (left, right) = self.index.split_at_mut(seg_b);
            left[seg_a][off_a..off_a + len].swap_with_slice(&mut right[0][off_b..off_b + len]);
        }
    }

    fn size(&self) -> usize {
        self.count
    }
}

/// Borrowing iterator over a sort buffer in index order
pub struct SortBufferIter<'a, T> {
    buffer: &'a SortBuffer<T>,
    position: usize,
}

impl<T> RecordIterator<T> for SortBufferIter<'_, T> {
    fn next(&mut self) -> Result<Option<T>> {
        if self.position >= self.buffer.len() {
            return Ok(None);
        }
        let record = self.buffer.record(self.position)?;
        self.position += 1;
        Ok(Some(record))
    }

    fn next_reuse(&mut self, reuse: T) -> Result<Option<T>> {
        if self.position >= self.buffer.len() {
            return Ok(None);
        }
        let record = self.buffer.record_reuse(self.position, reuse)?;
        self.position += 1;
        Ok(Some(record))
    }
}

/// A sorted buffer kept in memory as a merge input
pub struct SortBufferSource<T> {
    buffer: Option<SortBuffer<T>>,
    position: usize,
    memory: Arc<MemoryManager>,
}

impl<T> RecordIterator<T> for SortBufferSource<T> {
    fn next(&mut self) -> Result<Option<T>> {
        match &self.buffer {
            Some(buffer) if self.position < buffer.len() => {
                let record = buffer.record(self.position)?;
                self.position += 1;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    fn next_reuse(&mut self, reuse: T) -> Result<Option<T>> {
        match &self.buffer {
            Some(buffer) if self.position < buffer.len() => {
                let record = buffer.record_reuse(self.position, reuse)?;
                self.position += 1;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }
}

impl<T: Send> SortedSource<T> for SortBufferSource<T> {
    fn close(&mut self) -> Result<()> {
        if let Some(buffer) = self.buffer.take() {
            self.memory.release(buffer.dispose());
        }
        Ok(())
    }
}

impl<T> Drop for SortBufferSource<T> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.memory.release(buffer.dispose());
        }
    }
}

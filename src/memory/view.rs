//! Paged views over segment lists
//!
//! Segments in a list form one logical address space: byte `pos` lives in
//! segment `pos / page_size` at offset `pos % page_size`.

use std::io::{self, Read};

use super::MemorySegment;

/// Copy `bytes` into the segment list starting at logical position `pos`
///
/// The caller guarantees the range is covered by `segments`.
pub fn write_at(segments: &mut [MemorySegment], page_size: usize, mut pos: usize, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let segment = &mut segments[pos / page_size];
        let offset = pos % page_size;
        let n = bytes.len().min(page_size - offset);
        segment[offset..offset + n].copy_from_slice(&bytes[..n]);
        bytes = &bytes[n..];
        pos += n;
    }
}

/// Copy bytes from the segment list starting at logical position `pos`
pub fn read_at(segments: &[MemorySegment], page_size: usize, mut pos: usize, target: &mut [u8]) {
    let mut filled = 0;
    while filled < target.len() {
        let segment = &segments[pos / page_size];
        let offset = pos % page_size;
        let n = (target.len() - filled).min(page_size - offset);
        target[filled..filled + n].copy_from_slice(&segment[offset..offset + n]);
        filled += n;
        pos += n;
    }
}

/// `Read` over a byte range of a segment list
pub struct SegmentReader<'a> {
    segments: &'a [MemorySegment],
    page_size: usize,
    pos: usize,
    end: usize,
}

impl<'a> SegmentReader<'a> {
    /// Read the range `[start, end)` of the logical address space
    pub fn new(segments: &'a [MemorySegment], page_size: usize, start: usize, end: usize) -> Self {
        debug_assert!(end <= segments.len() * page_size);
        Self {
            segments,
            page_size,
            pos: start,
            end,
        }
    }

    /// Current logical position
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left before the end of the range
    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }
}

impl Read for SegmentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end || buf.is_empty() {
            return Ok(0);
        }

        let segment = &self.segments[self.pos / self.page_size];
        let offset = self.pos % self.page_size;
        let n = buf
            .len()
            .min(self.page_size - offset)
            .min(self.end - self.pos);
        buf[..n].copy_from_slice(&segment[offset..offset + n]);
        self.pos += n;
        Ok(n)
    }
}

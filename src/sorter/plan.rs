//! Memory plan
//!
//! Splits the segments claimed by a sorter into write buffers (only when
//! spilling) and sort buffers. Once input is exhausted, the segments of
//! spilled and unused sort buffers become the read buffers of the merge.

use crate::error::{Result, SortError};

/// Segments reserved for double-buffered channel writes
pub(crate) const NUM_WRITE_BUFFERS: usize = 2;

/// Smallest sort buffer: one index segment plus one data segment
pub(crate) const MIN_SEGMENTS_PER_BUFFER: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemoryPlan {
    pub write_segments: usize,
    /// Segments per sort buffer
    pub buffers: Vec<usize>,
}

impl MemoryPlan {
    pub fn compute(total: usize, num_sort_buffers: usize, spilling: bool) -> Result<Self> {
        let write_segments = if spilling { NUM_WRITE_BUFFERS } else { 0 };
        let required = write_segments + MIN_SEGMENTS_PER_BUFFER;
        if total < required {
            return Err(SortError::OutOfMemory {
                requested: required,
                available: total,
            });
        }

        let sort_segments = total - write_segments;
        let mut count = num_sort_buffers.max(1);
        if sort_segments / count < MIN_SEGMENTS_PER_BUFFER {
            count = sort_segments / MIN_SEGMENTS_PER_BUFFER;
            tracing::debug!(
                requested = num_sort_buffers,
                count,
                "Not enough memory for all sort buffers"
            );
        }

        let base = sort_segments / count;
        let extra = sort_segments % count;
        let buffers = (0..count).map(|i| base + usize::from(i < extra)).collect();

        Ok(Self {
            write_segments,
            buffers,
        })
    }

    /// Segments the plan claims in total
    pub fn total(&self) -> usize {
        self.write_segments + self.buffers.iter().sum::<usize>()
    }
}

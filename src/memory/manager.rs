//! Memory Manager
//!
//! Pool of fixed-size memory segments with leak accounting.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use crate::config::MemoryBudget;
use crate::error::{Result, SortError};

/// A fixed-size block of memory borrowed from a [`MemoryManager`]
pub struct MemorySegment {
    data: Box<[u8]>,
}

impl MemorySegment {
    /// Size of this segment in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Deref for MemorySegment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for MemorySegment {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySegment")
            .field("size", &self.data.len())
            .finish()
    }
}

/// Mutable pool state, guarded by one lock
struct PoolState {
    /// Allocations handed back and ready for reuse
    free: Vec<Box<[u8]>>,
    /// Segments currently checked out
    outstanding: usize,
}

/// Allocates and reclaims fixed-size memory segments
///
/// ## Concurrency:
/// - All methods take `&self`; the pool is shared behind an `Arc`
/// - A single `parking_lot::Mutex` guards the free list and the counter
pub struct MemoryManager {
    /// Size of each segment in bytes
    page_size: usize,

    /// Maximum number of segments that may be checked out at once
    total_segments: usize,

    state: Mutex<PoolState>,
}

impl MemoryManager {
    /// Default segment size (32 KB)
    pub const DEFAULT_PAGE_SIZE: usize = 32 * 1024;

    /// Smallest segment size accepted
    pub const MIN_PAGE_SIZE: usize = 64;

    /// Create a pool of `total_bytes`, split into `page_size` segments
    pub fn new(total_bytes: usize, page_size: usize) -> Result<Self> {
        if page_size < Self::MIN_PAGE_SIZE {
            return Err(SortError::Config(format!(
                "page size must be at least {} bytes, got {}",
                Self::MIN_PAGE_SIZE,
                page_size
            )));
        }

        let total_segments = total_bytes / page_size;
        if total_segments == 0 {
            return Err(SortError::Config(format!(
                "memory size {} is smaller than one page of {} bytes",
                total_bytes, page_size
            )));
        }

        Ok(Self {
            page_size,
            total_segments,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                outstanding: 0,
            }),
        })
    }

    /// Check out `count` segments, or none at all
    pub fn allocate(&self, count: usize) -> Result<Vec<MemorySegment>> {
        let mut state = self.state.lock();

        let available = self.total_segments - state.outstanding;
        if count > available {
            return Err(SortError::OutOfMemory {
                requested: count,
                available,
            });
        }

        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let data = state
                .free
                .pop()
                .unwrap_or_else(|| vec![0u8; self.page_size].into_boxed_slice());
            segments.push(MemorySegment { data });
        }
        state.outstanding += count;

        tracing::trace!(
            count,
            outstanding = state.outstanding,
            "Allocated memory segments"
        );
        Ok(segments)
    }

    /// Return segments to the pool
    pub fn release<I>(&self, segments: I)
    where
        I: IntoIterator<Item = MemorySegment>,
    {
        let mut state = self.state.lock();
        let mut count = 0;
        for segment in segments {
            debug_assert_eq!(segment.size(), self.page_size);
            state.free.push(segment.data);
            count += 1;
        }
        debug_assert!(
            count <= state.outstanding,
            "released {} segments but only {} are checked out",
            count,
            state.outstanding
        );
        state.outstanding = state.outstanding.saturating_sub(count);

        if count > 0 {
            tracing::trace!(
                count,
                outstanding = state.outstanding,
                "Released memory segments"
            );
        }
    }

    /// Return a single segment to the pool
    pub fn release_one(&self, segment: MemorySegment) {
        self.release(std::iter::once(segment));
    }

    /// Number of segments a budget translates to in this pool
    pub fn segments_for(&self, budget: MemoryBudget) -> usize {
        match budget {
            MemoryBudget::Bytes(bytes) => bytes / self.page_size,
            MemoryBudget::Fraction(fraction) => {
                (self.total_segments as f64 * fraction).floor() as usize
            }
        }
    }

    /// Segment size in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total number of segments in the pool
    pub fn total_segments(&self) -> usize {
        self.total_segments
    }

    /// Segments that can still be allocated
    pub fn available_segments(&self) -> usize {
        self.total_segments - self.state.lock().outstanding
    }

    /// Segments currently checked out
    pub fn outstanding_segments(&self) -> usize {
        self.state.lock().outstanding
    }

    /// True if every allocated segment has been released
    pub fn verify_empty(&self) -> bool {
        self.outstanding_segments() == 0
    }
}

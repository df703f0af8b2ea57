//! Sort Module
//!
//! In-memory sort buffers: records are appended in serialized form and
//! sorted by permuting a compact index.
//!
//! ## Layout
//! ```text
//! data region      [len|record][len|record][len|rec-
//!                  ord][len|record]...          (records straddle segments)
//! index region     [pointer|normalized key][pointer|normalized key]...
//! overflow region  [len|large record .......................] (segment aligned)
//! ```
//!
//! The pointer's top bit marks an overflow record, the next bit marks a
//! normalized key that captures the whole sort key.

mod buffer;
pub mod quicksort;

pub use buffer::{SortBuffer, SortBufferIter, SortBufferSource};
pub use quicksort::IndexedSortable;

//! Memory Module
//!
//! Fixed-size memory segments and the pool that accounts for them.
//!
//! ## Responsibilities
//! - Hand out segments up to a fixed total (all-or-nothing allocation)
//! - Take segments back and reuse their allocations
//! - Track outstanding segments so tests can check for leaks
//! - Read and write byte ranges that straddle segment boundaries
//!
//! ## Ownership
//! ```text
//!   MemoryManager ──allocate(n)──► Vec<MemorySegment> ──► owner (sort buffer,
//!        ▲                                                 spill writer, reader)
//!        └────────────────────release(segments)─────────────────┘
//! ```
//!
//! A segment is a plain owned value. Dropping one instead of releasing it is a
//! leak that `verify_empty()` reports.

mod manager;
mod view;

pub use manager::{MemoryManager, MemorySegment};
pub use view::{read_at, write_at, SegmentReader};

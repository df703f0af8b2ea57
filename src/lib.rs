//! # sortmerge
//!
//! An external sort/merge engine for batch data processing:
//! - Sorts record streams larger than memory within a fixed memory budget
//! - Spills sorted batches to disk and merges them with a bounded fan-in
//! - Optionally reduces equal-key groups with a user combiner, both while
//!   spilling and in the final merge
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Record Source                           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ records
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │   reader ──► sorter ──► spiller        (Sorter pipeline)    │
//! │     ▲                      │                                │
//! │     └──── empty buffers ───┤                                │
//! └────────────────────────────┼────────────────────────────────┘
//!                              │
//!          ┌───────────────────┴───────────┐
//!          │                               │
//!          ▼                               ▼
//!   ┌─────────────┐                 ┌─────────────┐
//!   │ SortBuffer  │                 │ IoManager   │
//!   │ (resident)  │                 │ (channels)  │
//!   └──────┬──────┘                 └──────┬──────┘
//!          │                               │ merge rounds
//!          └──────────────┬────────────────┘
//!                         ▼
//!                 ┌───────────────┐
//!                 │ MergeIterator │──► Combiner ──► SortedOutput
//!                 └───────────────┘
//! ```
//!
//! All memory comes from a [`MemoryManager`] in fixed-size segments and is
//! returned when the sorter closes; [`MemoryManager::verify_empty`] checks it.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod combine;
pub mod io;
pub mod memory;
pub mod merge;
pub mod sort;
pub mod sorter;
pub mod spill;
pub mod typeutils;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use combine::{FnCombiner, GroupCombiner, ReduceCombiner};
pub use config::{MemoryBudget, SorterConfig};
pub use error::{BoxError, Result, SortError};
pub use io::{IoManager, SpillChannel};
pub use memory::{MemoryManager, MemorySegment};
pub use sorter::{EngineState, SortedOutput, Sorter, SorterBuilder};
pub use typeutils::{
    BincodeSerializer, BytesKeyComparator, BytesRecord, BytesSerializer, Collector,
    IntPairComparator, IntPairSerializer, IterSource, KeyComparator, RecordIterator,
    TypeComparator, TypeSerializer, VecSource,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of sortmerge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

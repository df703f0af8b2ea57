//! Combine Module
//!
//! Reduces runs of equal-key records with a user function.
//!
//! ## Where combining happens
//! - While spilling: each sorted batch is compacted on its way to disk
//! - In the final merge: groups are combined as the output is pulled
//!
//! Intermediate merge rounds never combine.
//!
//! ## Lifecycle
//! The user combiner is shared by the spilling role and the output iterator
//! through [`SharedCombiner`]. `open` runs lazily before the first group and
//! at most once; `close` runs once, when the sorter closes, and only if
//! `open` ran.

mod combiner;
mod grouping;

pub use combiner::{FnCombiner, GroupCombiner, ReduceCombiner, SharedCombiner};
pub use grouping::{CombiningIterator, Group, KeyGroupedIterator};

//! Merge Module
//!
//! N-way merging of sorted sources.
//!
//! ## Sources
//! ```text
//! ChannelRecordReader  (spilled, on disk)  ─┐
//! ChannelRecordReader                       ├─► MergeIterator ─► output
//! SortBufferSource     (resident, memory)  ─┘
//! ```
//!
//! Equal keys are emitted in source order. Spilled channels come first in
//! spill order, resident buffers last, so records with equal keys leave the
//! engine in the order their batches were filled.
//!
//! When there are more channels than can be open at once, [`rounds`] merges
//! runs of channels into intermediate channels until the rest fits.

mod heap;
mod iterator;
pub mod rounds;

use crate::error::Result;
use crate::typeutils::RecordIterator;

pub use iterator::MergeIterator;
pub use rounds::{plan_round, RoundPlan};

/// A sorted record stream feeding a merge
///
/// Sources own memory segments and possibly a channel file. `close` gives
/// both back; dropping an unclosed source does the same on a best-effort
/// basis.
pub trait SortedSource<T>: RecordIterator<T> + Send {
    fn close(&mut self) -> Result<()>;
}

impl<T, S: SortedSource<T> + ?Sized> SortedSource<T> for Box<S> {
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

//! Combiner trait, adapters and the shared lifecycle wrapper

use parking_lot::Mutex;

use crate::error::{Result, SortError};
use crate::typeutils::Collector;

/// User function reducing a group of equal-key records
///
/// `combine` receives every record of one group and may emit any number of
/// records into `out`. Emitted records must keep the group's key. Failures
/// of user code are reported with [`SortError::combiner`].
pub trait GroupCombiner<T>: Send {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn combine(&mut self, values: &mut dyn Iterator<Item = T>, out: &mut dyn Collector<T>)
        -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Combiner from a closure over one group
pub struct FnCombiner<F> {
    func: F,
}

impl<F> FnCombiner<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<T, F> GroupCombiner<T> for FnCombiner<F>
where
    F: FnMut(&mut dyn Iterator<Item = T>, &mut dyn Collector<T>) -> Result<()> + Send,
{
    fn combine(&mut self, values: &mut dyn Iterator<Item = T>, out: &mut dyn Collector<T>) -> Result<()> {
        (self.func)(values, out)
    }
}

/// Combiner folding a group pairwise into a single record
///
/// ```
/// use sortmerge::combine::ReduceCombiner;
///
/// // (key, count) pairs: sum the counts
/// let sum = ReduceCombiner::new(|a: (i32, i32), b: (i32, i32)| (a.0, a.1 + b.1));
/// # let _ = sum;
/// ```
pub struct ReduceCombiner<F> {
    reduce: F,
}

impl<F> ReduceCombiner<F> {
    pub fn new(reduce: F) -> Self {
        Self { reduce }
    }
}

impl<T, F> GroupCombiner<T> for ReduceCombiner<F>
where
    F: Fn(T, T) -> T + Send,
{
    fn combine(&mut self, values: &mut dyn Iterator<Item = T>, out: &mut dyn Collector<T>) -> Result<()> {
        let Some(first) = values.next() else {
            return Ok(());
        };
        let combined = values.fold(first, |acc, value| (self.reduce)(acc, value));
        out.collect(combined)
    }
}

struct CombinerState<T> {
    combiner: Box<dyn GroupCombiner<T>>,
    opened: bool,
    closed: bool,
}

/// A combiner shared between the spilling role and the output iterator
///
/// Only one side uses it at a time; the mutex makes the hand-over safe.
pub struct SharedCombiner<T> {
    state: Mutex<CombinerState<T>>,
}

impl<T> SharedCombiner<T> {
    pub fn new(combiner: Box<dyn GroupCombiner<T>>) -> Self {
        Self {
            state: Mutex::new(CombinerState {
                combiner,
                opened: false,
                closed: false,
            }),
        }
    }

    /// Combine one group, opening the user combiner first if needed
    pub fn combine(&self, values: &mut dyn Iterator<Item = T>, out: &mut dyn Collector<T>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SortError::Closed);
        }
        if !state.opened {
            // Marked before the call so a failed open still gets its close
            state.opened = true;
            tracing::trace!("Opening combiner");
            state.combiner.open()?;
        }
        state.combiner.combine(values, out)
    }

    /// Close the user combiner if it was opened; later calls do nothing
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if state.opened {
            tracing::trace!("Closing combiner");
            state.combiner.close()?;
        }
        Ok(())
    }

    /// True once `open` has been called on the user combiner
    pub fn is_opened(&self) -> bool {
        self.state.lock().opened
    }
}

//! Engine state

use std::sync::atomic::{AtomicU8, Ordering};

/// Phase the engine is in
///
/// Moves forward only, except for the `Collecting → Sorting → Spilling →
/// Collecting` cycle while input is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Collecting,
    Sorting,
    Spilling,
    Merging,
    Closed,
}

impl EngineState {
    fn as_u8(self) -> u8 {
        match self {
            EngineState::Collecting => 0,
            EngineState::Sorting => 1,
            EngineState::Spilling => 2,
            EngineState::Merging => 3,
            EngineState::Closed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Collecting,
            1 => EngineState::Sorting,
            2 => EngineState::Spilling,
            3 => EngineState::Merging,
            _ => EngineState::Closed,
        }
    }
}

/// Engine state shared by the pipeline roles
#[derive(Debug)]
pub(crate) struct StateCell {
    value: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(EngineState::Collecting.as_u8()),
        }
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.value.load(Ordering::SeqCst))
    }

    /// Move to `next`; ignored once merging has begun, unless `next` is later
    pub fn set(&self, next: EngineState) {
        let _ = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let current = EngineState::from_u8(current);
                let allowed = match current {
                    EngineState::Closed => false,
                    EngineState::Merging => next == EngineState::Closed,
                    _ => true,
                };
                if allowed && current != next {
                    tracing::trace!(from = ?current, to = ?next, "Engine state change");
                    Some(next.as_u8())
                } else {
                    None
                }
            });
    }
}

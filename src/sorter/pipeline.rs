//! Pipeline roles
//!
//! ```text
//!            empty buffers
//!   ┌─────────────────────────────────────────────┐
//!   ▼                                             │
//! [reader] ──full──► [sorter] ──sorted──► [spiller] ──► MergeInput ──► consumer
//!                                             │
//!                                       spill channels
//! ```
//!
//! Buffers travel by value, so whoever holds a buffer owns its segments.
//! Each role releases what it holds when it exits, whether it finished,
//! failed or was told to stop. Failures travel downstream as
//! [`QueueElement::Failed`] and end at the consumer.

use std::sync::Arc;

use crossbeam::channel::{select, Receiver, Sender};

use crate::combine::SharedCombiner;
use crate::error::{Result, SortError};
use crate::io::{IoManager, SpillChannel};
use crate::memory::{MemoryManager, MemorySegment};
use crate::merge::rounds::{merge_rounds, RoundContext};
use crate::sort::SortBuffer;
use crate::spill::SpillWriter;
use crate::typeutils::{RecordIterator, TypeComparator, TypeSerializer};

use super::state::{EngineState, StateCell};

/// Read segments needed to keep the last buffer in memory after spilling
const MIN_READ_SEGMENTS: usize = 2;

/// Message passed between roles
pub(crate) enum QueueElement<T> {
    /// A full buffer; more input follows
    Buffer(SortBuffer<T>),
    /// The last buffer (possibly empty); input is exhausted
    Final(SortBuffer<T>),
    Failed(SortError),
}

impl<T> QueueElement<T> {
    pub fn release(self, memory: &MemoryManager) {
        match self {
            QueueElement::Buffer(buffer) | QueueElement::Final(buffer) => {
                memory.release(buffer.dispose());
            }
            QueueElement::Failed(_) => {}
        }
    }
}

/// What the spilling role hands to the consumer for the final merge
pub(crate) struct MergeInput<T> {
    /// Sorted buffers kept in memory, in batch order
    pub resident: Vec<SortBuffer<T>>,
    /// Spilled channels, in spill order
    pub channels: Vec<SpillChannel>,
    /// Buffers for reading the channels
    pub read_segments: Vec<MemorySegment>,
    /// Intermediate merge rounds already run
    pub rounds: usize,
}

impl<T> MergeInput<T> {
    pub fn release(self, memory: &MemoryManager, io: Option<&IoManager>) {
        for buffer in self.resident {
            memory.release(buffer.dispose());
        }
        memory.release(self.read_segments);
        if let Some(io) = io {
            for channel in &self.channels {
                if let Err(e) = io.delete_channel(&channel.id) {
                    tracing::warn!(channel = channel.channel_id(), error = %e, "Failed to delete channel");
                }
            }
        }
    }
}

/// Receive from `rx` unless the engine is shutting down
///
/// `None` on shutdown or when the sending role is gone.
fn recv_or_shutdown<M>(rx: &Receiver<M>, shutdown: &Receiver<()>) -> Option<M> {
    select! {
        recv(rx) -> message => message.ok(),
        recv(shutdown) -> _ => None,
    }
}

/// Send to the next role; if it is gone, release the buffer instead
fn forward<T>(tx: &Sender<QueueElement<T>>, element: QueueElement<T>, memory: &MemoryManager) {
    if let Err(err) = tx.send(element) {
        err.into_inner().release(memory);
    }
}

/// Handles shared by all roles
pub(crate) struct RoleContext<T> {
    pub memory: Arc<MemoryManager>,
    pub serializer: Arc<dyn TypeSerializer<T>>,
    pub comparator: Arc<dyn TypeComparator<T>>,
    pub state: Arc<StateCell>,
    pub shutdown: Receiver<()>,
}

impl<T> Clone for RoleContext<T> {
    fn clone(&self) -> Self {
        Self {
            memory: Arc::clone(&self.memory),
            serializer: Arc::clone(&self.serializer),
            comparator: Arc::clone(&self.comparator),
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.clone(),
        }
    }
}

// =============================================================================
// Reading
// =============================================================================

/// Pulls records from the source into empty buffers
pub(crate) struct ReadRole<T> {
    pub ctx: RoleContext<T>,
    pub source: Box<dyn RecordIterator<T> + Send>,
    pub object_reuse: bool,
    pub empty: Receiver<SortBuffer<T>>,
    pub output: Sender<QueueElement<T>>,
}

impl<T> ReadRole<T> {
    pub fn run(mut self) {
        if let Err(e) = self.read() {
            tracing::debug!(error = %e, "Reading failed");
            forward(&self.output, QueueElement::Failed(e.reading()), &self.ctx.memory);
        }
    }

    fn read(&mut self) -> Result<()> {
        let mut reuse = self
            .object_reuse
            .then(|| self.ctx.serializer.create_instance());

        let Some(mut buffer) = recv_or_shutdown(&self.empty, &self.ctx.shutdown) else {
            return Ok(());
        };

        loop {
            self.ctx.state.set(EngineState::Collecting);
            match self.fill(&mut buffer, &mut reuse) {
                Ok(None) => {
                    tracing::debug!(records = buffer.len(), "Input exhausted");
                    forward(&self.output, QueueElement::Final(buffer), &self.ctx.memory);
                    return Ok(());
                }
                Ok(Some(record)) => {
                    tracing::trace!(records = buffer.len(), "Buffer full");
                    forward(&self.output, QueueElement::Buffer(buffer), &self.ctx.memory);

                    buffer = match recv_or_shutdown(&self.empty, &self.ctx.shutdown) {
                        Some(buffer) => buffer,
                        None => return Ok(()),
                    };

                    // An empty buffer takes any record or rejects it with an error
                    if let Err(e) = buffer.write(&record) {
                        self.ctx.memory.release(buffer.dispose());
                        return Err(e);
                    }
                    if self.object_reuse {
                        reuse = Some(record);
                    }
                }
                Err(e) => {
                    self.ctx.memory.release(buffer.dispose());
                    return Err(e);
                }
            }
        }
    }

    /// Fill `buffer`; returns the record that did not fit, or `None` at the
    /// end of input
    fn fill(&mut self, buffer: &mut SortBuffer<T>, reuse: &mut Option<T>) -> Result<Option<T>> {
        loop {
            let next = match reuse.take() {
                Some(instance) => self.source.next_reuse(instance)?,
                None => self.source.next()?,
            };
            let Some(record) = next else {
                return Ok(None);
            };
            if !buffer.write(&record)? {
                return Ok(Some(record));
            }
            if self.object_reuse {
                *reuse = Some(record);
            }
        }
    }
}

// =============================================================================
// Sorting
// =============================================================================

/// Sorts full buffers
pub(crate) struct SortRole<T> {
    pub ctx: RoleContext<T>,
    pub input: Receiver<QueueElement<T>>,
    pub output: Sender<QueueElement<T>>,
}

impl<T> SortRole<T> {
    pub fn run(self) {
        let memory = &self.ctx.memory;
        let mut batch = 0;

        while let Some(element) = recv_or_shutdown(&self.input, &self.ctx.shutdown) {
            let (mut buffer, last) = match element {
                QueueElement::Buffer(buffer) => (buffer, false),
                QueueElement::Final(buffer) => (buffer, true),
                QueueElement::Failed(e) => {
                    forward(&self.output, QueueElement::Failed(e), memory);
                    return;
                }
            };

            self.ctx.state.set(EngineState::Sorting);
            tracing::debug!(batch, records = buffer.len(), "Sorting buffer");

            if let Err(e) = buffer.sort() {
                memory.release(buffer.dispose());
                forward(&self.output, QueueElement::Failed(e.sorting(batch)), memory);
                return;
            }

            if last {
                forward(&self.output, QueueElement::Final(buffer), memory);
                return;
            }
            forward(&self.output, QueueElement::Buffer(buffer), memory);
            batch += 1;
        }
    }
}

// =============================================================================
// Spilling and Merging
// =============================================================================

/// Caches sorted buffers, spills them once memory runs short and prepares
/// the final merge
pub(crate) struct SpillRole<T> {
    pub ctx: RoleContext<T>,
    pub io: Option<Arc<IoManager>>,
    pub combiner: Option<Arc<SharedCombiner<T>>>,
    pub writer: Option<SpillWriter<T>>,

    pub input: Receiver<QueueElement<T>>,
    pub empty_tx: Sender<SortBuffer<T>>,
    pub empty_rx: Receiver<SortBuffer<T>>,
    pub results: Sender<Result<MergeInput<T>>>,

    pub num_buffers: usize,
    /// Bytes of all sort buffers together
    pub sort_bytes: usize,
    pub spill_threshold: f32,
    pub max_file_handles: usize,

    pub spilling: bool,
    pub cached: Vec<SortBuffer<T>>,
    pub channels: Vec<SpillChannel>,
    pub read_segments: Vec<MemorySegment>,
}

impl<T: Send> SpillRole<T> {
    pub fn run(mut self) {
        let result = match self.collect() {
            Ok(true) => self.prepare_merge(),
            Ok(false) => return,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            tracing::debug!(error = %e, "Spilling role failed");
        }
        if let Err(err) = self.results.send(result) {
            if let Ok(input) = err.into_inner() {
                input.release(&self.ctx.memory, self.io.as_deref());
            }
        }
    }

    /// Take sorted buffers until the final one arrives
    ///
    /// Returns false if the engine is shutting down.
    fn collect(&mut self) -> Result<bool> {
        while let Some(element) = recv_or_shutdown(&self.input, &self.ctx.shutdown) {
            match element {
                QueueElement::Buffer(buffer) => {
                    self.cached.push(buffer);
                    self.spill_if_needed()?;
                }
                QueueElement::Final(buffer) => {
                    if buffer.is_empty() {
                        self.read_segments.extend(buffer.dispose());
                    } else {
                        self.cached.push(buffer);
                    }
                    return Ok(true);
                }
                QueueElement::Failed(e) => return Err(e),
            }
        }
        Ok(false)
    }

    fn spill_if_needed(&mut self) -> Result<()> {
        if !self.spilling {
            let cached_bytes: usize = self.cached.iter().map(|b| b.occupancy()).sum();
            let all_cached = self.cached.len() >= self.num_buffers;
            let over_threshold =
                cached_bytes as f64 >= f64::from(self.spill_threshold) * self.sort_bytes as f64;

            if !(all_cached || over_threshold) {
                return Ok(());
            }
            if self.io.is_none() {
                // In memory only: keep going until no buffer is left to fill
                if !all_cached {
                    return Ok(());
                }
                let segments: usize = self.cached.iter().map(|b| b.segment_count()).sum();
                return Err(SortError::OutOfMemory {
                    requested: segments + 1,
                    available: segments,
                });
            }

            tracing::debug!(
                cached = self.cached.len(),
                bytes = cached_bytes,
                "Spill threshold reached, spilling from now on"
            );
            self.spilling = true;
        }

        self.spill_cached(true)
    }

    /// Spill every cached buffer in order; recycle them as empty buffers or
    /// keep their segments for reading
    fn spill_cached(&mut self, recycle: bool) -> Result<()> {
        let mut pending = std::mem::take(&mut self.cached).into_iter();
        while let Some(mut buffer) = pending.next() {
            let batch = self.channels.len();
            if let Err(e) = self.spill_buffer(&buffer) {
                self.cached.push(buffer);
                self.cached.extend(pending);
                return Err(e.spilling(batch));
            }

            if recycle {
                buffer.reset();
                if let Err(err) = self.empty_tx.send(buffer) {
                    self.ctx.memory.release(err.into_inner().dispose());
                }
            } else {
                self.read_segments.extend(buffer.dispose());
            }
        }
        Ok(())
    }

    fn spill_buffer(&mut self, buffer: &SortBuffer<T>) -> Result<()> {
        self.ctx.state.set(EngineState::Spilling);
        let writer = self.writer.as_mut().ok_or_else(|| {
            SortError::Config("spilling requires an I/O manager".into())
        })?;
        let channel = writer.spill(buffer, self.combiner.as_deref())?;

        tracing::debug!(
            batch = self.channels.len(),
            records = buffer.len(),
            channel = channel.channel_id(),
            "Spilled buffer"
        );
        self.channels.push(channel);
        Ok(())
    }

    /// Runs after the last buffer arrived: settle what stays in memory and
    /// merge channels down to the fan-in
    fn prepare_merge(&mut self) -> Result<MergeInput<T>> {
        // The reader is done; unused buffers become read memory
        while let Ok(buffer) = self.empty_rx.try_recv() {
            self.read_segments.extend(buffer.dispose());
        }

        if self.channels.is_empty() {
            tracing::debug!(buffers = self.cached.len(), "Everything fits in memory");
            self.ctx.state.set(EngineState::Merging);
            self.ctx.memory.release(std::mem::take(&mut self.read_segments));
            if let Some(writer) = self.writer.take() {
                self.ctx.memory.release(writer.into_segments());
            }
            return Ok(MergeInput {
                resident: std::mem::take(&mut self.cached),
                channels: Vec::new(),
                read_segments: Vec::new(),
                rounds: 0,
            });
        }

        // Reading the channels back needs memory; keep the tail in memory
        // only if enough is left without it
        if !self.cached.is_empty() && self.read_segments.len() < MIN_READ_SEGMENTS {
            self.spill_cached(false)?;
        }
        self.ctx.state.set(EngineState::Merging);

        let io = self
            .io
            .clone()
            .ok_or_else(|| SortError::Config("spilling requires an I/O manager".into()))?;
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| SortError::Config("spill writer already released".into()))?;

        let fan_in = self.max_file_handles.min(self.read_segments.len());
        if fan_in < 2 {
            self.read_segments.extend(writer.into_segments());
            return Err(SortError::OutOfMemory {
                requested: 2,
                available: fan_in,
            });
        }

        let channels = std::mem::take(&mut self.channels);
        let merged = {
            let mut round_ctx = RoundContext {
                io: &io,
                memory: &self.ctx.memory,
                serializer: &self.ctx.serializer,
                comparator: &self.ctx.comparator,
                read_segments: &mut self.read_segments,
                writer: &mut writer,
            };
            merge_rounds(channels, fan_in, &mut round_ctx)
        };

        // Write buffers are no longer needed; they serve as read-ahead
        self.read_segments.extend(writer.into_segments());
        let (channels, rounds) = merged?;

        tracing::debug!(
            channels = channels.len(),
            resident = self.cached.len(),
            rounds,
            read_segments = self.read_segments.len(),
            "Ready for final merge"
        );

        Ok(MergeInput {
            resident: std::mem::take(&mut self.cached),
            channels,
            read_segments: std::mem::take(&mut self.read_segments),
            rounds,
        })
    }
}

impl<T> Drop for SpillRole<T> {
    fn drop(&mut self) {
        let memory = &self.ctx.memory;
        for buffer in self.cached.drain(..) {
            memory.release(buffer.dispose());
        }
        if let Some(writer) = self.writer.take() {
            memory.release(writer.into_segments());
        }
        memory.release(std::mem::take(&mut self.read_segments));
        if let Some(io) = &self.io {
            for channel in self.channels.drain(..) {
                if let Err(e) = io.delete_channel(&channel.id) {
                    tracing::warn!(channel = channel.channel_id(), error = %e, "Failed to delete channel");
                }
            }
        }
    }
}

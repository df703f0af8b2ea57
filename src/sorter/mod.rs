//! Sorter Module
//!
//! The façade that wires buffers, roles, spilling and merging together.
//!
//! ## Usage
//! ```no_run
//! use std::sync::Arc;
//! use sortmerge::{IntPairComparator, IntPairSerializer, IoManager, MemoryManager, Sorter, VecSource};
//!
//! # fn main() -> sortmerge::Result<()> {
//! let memory = Arc::new(MemoryManager::new(4 * 1024 * 1024, 32 * 1024)?);
//! let io = Arc::new(IoManager::new(std::env::temp_dir().join("sortmerge"))?);
//!
//! let input = VecSource::new(vec![(3, 1), (1, 1), (2, 1)]);
//! let mut sorter = Sorter::builder(
//!     memory,
//!     Arc::new(IntPairSerializer),
//!     Arc::new(IntPairComparator::ascending()),
//! )
//! .io_manager(io)
//! .build(input)?;
//!
//! for record in sorter.get_iterator()? {
//!     println!("{:?}", record?);
//! }
//! sorter.close()?;
//! # Ok(())
//! # }
//! ```

mod output;
mod pipeline;
mod plan;
mod state;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

use crate::combine::{CombiningIterator, GroupCombiner, SharedCombiner};
use crate::config::SorterConfig;
use crate::error::{Result, SortError};
use crate::io::IoManager;
use crate::memory::MemoryManager;
use crate::merge::{MergeIterator, SortedSource};
use crate::sort::SortBuffer;
use crate::spill::{ChannelRecordReader, SpillWriter};
use crate::typeutils::{RecordIterator, TypeComparator, TypeSerializer};

pub use output::SortedOutput;
pub use state::EngineState;

use pipeline::{MergeInput, QueueElement, ReadRole, RoleContext, SortRole, SpillRole};
use plan::MemoryPlan;
use state::StateCell;

/// Builder for a [`Sorter`]
pub struct SorterBuilder<T> {
    memory: Arc<MemoryManager>,
    serializer: Arc<dyn TypeSerializer<T>>,
    comparator: Arc<dyn TypeComparator<T>>,
    io: Option<Arc<IoManager>>,
    combiner: Option<Box<dyn GroupCombiner<T>>>,
    config: SorterConfig,
}

impl<T: Send + 'static> SorterBuilder<T> {
    /// Enable spilling to the manager's directories
    pub fn io_manager(mut self, io: Arc<IoManager>) -> Self {
        self.io = Some(io);
        self
    }

    /// Combine equal-key groups while spilling and in the final merge
    pub fn combiner(mut self, combiner: impl GroupCombiner<T> + 'static) -> Self {
        self.combiner = Some(Box::new(combiner));
        self
    }

    pub fn config(mut self, config: SorterConfig) -> Self {
        self.config = config;
        self
    }

    /// Claim memory and start sorting `source` in the background
    ///
    /// Fails with `OutOfMemory` (holding nothing) if the memory cannot be
    /// claimed.
    pub fn build(self, source: impl RecordIterator<T> + Send + 'static) -> Result<Sorter<T>> {
        // Step 1: Validate configuration
        self.config.validate()?;

        // Step 2: Plan and claim memory (all or nothing)
        let budget = self.memory.segments_for(self.config.memory);
        let plan = MemoryPlan::compute(budget, self.config.num_sort_buffers, self.io.is_some())?;
        let mut segments = self.memory.allocate(plan.total())?;

        let page_size = self.memory.page_size();
        let write_segments = segments.split_off(segments.len() - plan.write_segments);
        let mut buffers = Vec::with_capacity(plan.buffers.len());
        for &count in &plan.buffers {
            let at = segments.len() - count;
            buffers.push(SortBuffer::new(
                Arc::clone(&self.serializer),
                Arc::clone(&self.comparator),
                segments.split_off(at),
                self.config.large_records,
            ));
        }
        let sort_bytes = plan.buffers.iter().sum::<usize>() * page_size;

        tracing::debug!(
            buffers = plan.buffers.len(),
            write_segments = plan.write_segments,
            page_size,
            spilling = self.io.is_some(),
            combining = self.combiner.is_some(),
            "Starting sorter"
        );

        // Step 3: Queues. Capacity covers every buffer plus a failure
        // message, so sends never block.
        let capacity = plan.buffers.len() + 2;
        let (empty_tx, empty_rx) = channel::bounded(capacity);
        let (sort_tx, sort_rx) = channel::bounded(capacity);
        let (spill_tx, spill_rx) = channel::bounded(capacity);
        let (results_tx, results_rx) = channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);

        for buffer in buffers {
            if let Err(err) = empty_tx.send(buffer) {
                self.memory.release(err.into_inner().dispose());
            }
        }

        let state = Arc::new(StateCell::new());
        let combiner = self.combiner.map(|c| Arc::new(SharedCombiner::new(c)));
        let ctx = RoleContext {
            memory: Arc::clone(&self.memory),
            serializer: Arc::clone(&self.serializer),
            comparator: Arc::clone(&self.comparator),
            state: Arc::clone(&state),
            shutdown: shutdown_rx,
        };

        let mut sorter = Sorter {
            memory: self.memory,
            io: self.io.clone(),
            serializer: self.serializer,
            comparator: self.comparator,
            combiner: combiner.clone(),
            state,
            shutdown: Some(shutdown_tx),
            threads: Vec::with_capacity(3),
            empty: empty_rx.clone(),
            sorting: sort_rx.clone(),
            spilling: spill_rx.clone(),
            results: results_rx,
            output: None,
            closed: false,
        };

        // Step 4: Spawn the roles
        let writer = self.io.as_ref().map(|io| {
            SpillWriter::new(
                Arc::clone(io),
                Arc::clone(&ctx.serializer),
                Arc::clone(&ctx.comparator),
                write_segments,
            )
        });

        let spill_role = SpillRole {
            ctx: ctx.clone(),
            io: self.io,
            combiner,
            writer,
            input: spill_rx,
            empty_tx,
            empty_rx: empty_rx.clone(),
            results: results_tx,
            num_buffers: plan.buffers.len(),
            sort_bytes,
            spill_threshold: self.config.spill_threshold,
            max_file_handles: self.config.max_file_handles,
            spilling: false,
            cached: Vec::new(),
            channels: Vec::new(),
            read_segments: Vec::new(),
        };
        let sort_role = SortRole {
            ctx: ctx.clone(),
            input: sort_rx,
            output: spill_tx,
        };
        let read_role = ReadRole {
            ctx,
            source: Box::new(source),
            object_reuse: self.config.object_reuse,
            empty: empty_rx,
            output: sort_tx,
        };

        let spawned = sorter
            .spawn("spiller", move || spill_role.run())
            .and_then(|s| s.spawn("sorter", move || sort_role.run()))
            .and_then(|s| s.spawn("reader", move || read_role.run()));
        if let Err(e) = spawned {
            sorter.teardown();
            return Err(e);
        }

        Ok(sorter)
    }
}

/// External sorter over records of type `T`
///
/// ## Lifecycle
/// 1. [`Sorter::builder`] ... [`build`](SorterBuilder::build) claims memory
///    and starts reading, sorting and spilling in background threads
/// 2. [`get_iterator`](Self::get_iterator) waits for all input and returns
///    the sorted output; the final merge runs lazily as records are pulled
/// 3. [`close`](Self::close) stops everything, deletes spill files and
///    returns all memory (also done on drop)
///
/// Any failure ends the pipeline. `get_iterator` tears the engine down
/// before returning the error.
pub struct Sorter<T> {
    memory: Arc<MemoryManager>,
    io: Option<Arc<IoManager>>,
    serializer: Arc<dyn TypeSerializer<T>>,
    comparator: Arc<dyn TypeComparator<T>>,
    combiner: Option<Arc<SharedCombiner<T>>>,
    state: Arc<StateCell>,

    /// Dropping this sender stops every role
    shutdown: Option<Sender<()>>,
    threads: Vec<(&'static str, JoinHandle<()>)>,

    // Queue ends kept so leftovers can be drained on close
    empty: Receiver<SortBuffer<T>>,
    sorting: Receiver<QueueElement<T>>,
    spilling: Receiver<QueueElement<T>>,
    results: Receiver<Result<MergeInput<T>>>,

    output: Option<SortedOutput<T>>,
    closed: bool,
}

impl<T: Send + 'static> Sorter<T> {
    /// Start configuring a sorter
    pub fn builder(
        memory: Arc<MemoryManager>,
        serializer: Arc<dyn TypeSerializer<T>>,
        comparator: Arc<dyn TypeComparator<T>>,
    ) -> SorterBuilder<T> {
        SorterBuilder {
            memory,
            serializer,
            comparator,
            io: None,
            combiner: None,
            config: SorterConfig::default(),
        }
    }

    /// Wait for the input to be consumed and return the sorted output
    ///
    /// Repeated calls return the same output.
    pub fn get_iterator(&mut self) -> Result<&mut SortedOutput<T>> {
        if self.closed {
            return Err(SortError::Closed);
        }

        if self.output.is_none() {
            let received = self.results.recv();
            let input = match received {
                Ok(Ok(input)) => input,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Sort failed, shutting down");
                    self.teardown();
                    return Err(e);
                }
                Err(_) => {
                    let panicked = self.stop_roles();
                    self.teardown();
                    return Err(SortError::ThreadPanicked(match panicked {
                        Some(role) => format!("{} role panicked", role),
                        None => "pipeline stopped without a result".into(),
                    }));
                }
            };

            match self.open_output(input) {
                Ok(output) => self.output = Some(output),
                Err(e) => {
                    self.teardown();
                    return Err(e);
                }
            }
        }

        self.output.as_mut().ok_or(SortError::Closed)
    }

    /// Build the final merge over spilled channels and resident buffers
    fn open_output(&self, input: MergeInput<T>) -> Result<SortedOutput<T>> {
        let MergeInput {
            resident,
            channels,
            mut read_segments,
            rounds,
        } = input;

        let mut sources: Vec<Box<dyn SortedSource<T>>> =
            Vec::with_capacity(channels.len() + resident.len());

        // Resident buffers come last so equal keys keep batch order; they are
        // wrapped first so a failure below releases them
        let resident: Vec<Box<dyn SortedSource<T>>> = resident
            .into_iter()
            .map(|buffer| Box::new(buffer.into_source(Arc::clone(&self.memory))) as Box<dyn SortedSource<T>>)
            .collect();

        if !channels.is_empty() {
            let io = match &self.io {
                Some(io) => Arc::clone(io),
                None => {
                    self.memory.release(read_segments);
                    return Err(SortError::Config("spill channels without an I/O manager".into()));
                }
            };

            let per_reader = read_segments.len() / channels.len();
            let mut pending = channels.into_iter();
            while let Some(channel) = pending.next() {
                let at = read_segments.len() - per_reader;
                let segments = read_segments.split_off(at);
                match ChannelRecordReader::open(
                    Arc::clone(&io),
                    Arc::clone(&self.memory),
                    Arc::clone(&self.serializer),
                    channel,
                    segments,
                ) {
                    Ok(reader) => sources.push(Box::new(reader)),
                    Err(e) => {
                        for channel in pending {
                            if let Err(delete_err) = io.delete_channel(&channel.id) {
                                tracing::warn!(channel = channel.channel_id(), error = %delete_err, "Failed to delete channel");
                            }
                        }
                        self.memory.release(read_segments);
                        return Err(e);
                    }
                }
            }
        }
        self.memory.release(read_segments);
        sources.extend(resident);

        tracing::debug!(sources = sources.len(), rounds, "Opening final merge");

        // One source needs no merge; none means empty output
        let merged: Option<Box<dyn SortedSource<T>>> = if sources.len() > 1 {
            Some(Box::new(MergeIterator::new(sources, Arc::clone(&self.comparator))))
        } else {
            sources.pop()
        };

        let output = match (&self.combiner, merged) {
            (Some(combiner), Some(source)) => Some(Box::new(CombiningIterator::new(
                source,
                Arc::clone(&self.comparator),
                Arc::clone(combiner),
            )) as Box<dyn SortedSource<T>>),
            (_, merged) => merged,
        };

        Ok(SortedOutput::new(output, rounds + 1))
    }
}

impl<T> Sorter<T> {
    /// Current engine state
    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// Stop all roles, delete spill files, return all memory and close the
    /// combiner if it was opened
    ///
    /// Safe to call more than once and after failures.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Step 1: Stop and join the roles
        if let Some(role) = self.stop_roles() {
            tracing::warn!(role, "Role panicked");
        }

        // Step 2: Release whatever is still queued between roles
        self.drain_queues();

        // Step 3: Close the output (readers, resident buffers)
        let mut first_error = None;
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.close() {
                first_error.get_or_insert(e);
            }
        }

        // Step 4: Close the combiner
        if let Some(combiner) = &self.combiner {
            if let Err(e) = combiner.close() {
                first_error.get_or_insert(e);
            }
        }

        self.state.set(EngineState::Closed);
        tracing::debug!("Sorter closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn spawn<F>(&mut self, role: &'static str, f: F) -> Result<&mut Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(format!("sortmerge-{}", role))
            .spawn(f)?;
        self.threads.push((role, handle));
        Ok(self)
    }

    /// Signal shutdown and join every role; returns the first role that
    /// panicked
    fn stop_roles(&mut self) -> Option<&'static str> {
        drop(self.shutdown.take());
        let mut panicked = None;
        for (role, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                panicked.get_or_insert(role);
            }
        }
        panicked
    }

    fn drain_queues(&mut self) {
        while let Ok(buffer) = self.empty.try_recv() {
            self.memory.release(buffer.dispose());
        }
        for queue in [&self.sorting, &self.spilling] {
            while let Ok(element) = queue.try_recv() {
                element.release(&self.memory);
            }
        }
        while let Ok(result) = self.results.try_recv() {
            if let Ok(input) = result {
                input.release(&self.memory, self.io.as_deref());
            }
        }
    }

    /// Close, logging instead of returning failures
    fn teardown(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Error while tearing down sorter");
        }
    }
}

impl<T> Drop for Sorter<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

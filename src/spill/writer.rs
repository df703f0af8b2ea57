//! Spill Writer

use std::sync::Arc;

use crate::combine::{KeyGroupedIterator, SharedCombiner};
use crate::error::{Result, SortError};
use crate::io::{ChannelOutputView, IoManager, SpillChannel};
use crate::memory::MemorySegment;
use crate::sort::SortBuffer;
use crate::typeutils::{Collector, RecordIterator, TypeComparator, TypeSerializer};

/// Writes sorted record streams into fresh spill channels
///
/// Owns the write buffers for its whole lifetime; every spill borrows them
/// and gets all of them back before the channel counts as written. Take
/// them back with [`into_segments`](Self::into_segments).
pub struct SpillWriter<T> {
    io: Arc<IoManager>,
    serializer: Arc<dyn TypeSerializer<T>>,
    comparator: Arc<dyn TypeComparator<T>>,
    segments: Vec<MemorySegment>,
    scratch: Vec<u8>,
}

impl<T> SpillWriter<T> {
    pub fn new(
        io: Arc<IoManager>,
        serializer: Arc<dyn TypeSerializer<T>>,
        comparator: Arc<dyn TypeComparator<T>>,
        segments: Vec<MemorySegment>,
    ) -> Self {
        Self {
            io,
            serializer,
            comparator,
            segments,
            scratch: Vec::new(),
        }
    }

    /// Write a sorted buffer to a new channel, compacting each key group
    /// through `combiner` if one is given
    pub fn spill(&mut self, buffer: &SortBuffer<T>, combiner: Option<&SharedCombiner<T>>) -> Result<SpillChannel> {
        let serializer = Arc::clone(&self.serializer);
        let comparator = Arc::clone(&self.comparator);
        let mut scratch = std::mem::take(&mut self.scratch);

        let result = self.write_channel(|view| match combiner {
            None => buffer.write_all(view),
            Some(combiner) => {
                let mut groups = KeyGroupedIterator::new(buffer.iter(), comparator);
                let mut out = ViewCollector {
                    serializer: serializer.as_ref(),
                    view,
                    scratch: &mut scratch,
                };
                while let Some(mut group) = groups.next_group()? {
                    combiner.combine(&mut group, &mut out)?;
                    if let Some(e) = groups.take_error() {
                        return Err(e);
                    }
                }
                Ok(())
            }
        });
        self.scratch = scratch;
        result
    }

    /// Drain a sorted stream into a new channel
    pub fn write_stream(&mut self, source: &mut dyn RecordIterator<T>) -> Result<SpillChannel> {
        let serializer = Arc::clone(&self.serializer);
        let mut scratch = std::mem::take(&mut self.scratch);

        let result = self.write_channel(|view| {
            let mut out = ViewCollector {
                serializer: serializer.as_ref(),
                view,
                scratch: &mut scratch,
            };
            while let Some(record) = source.next()? {
                out.collect(record)?;
            }
            Ok(())
        });
        self.scratch = scratch;
        result
    }

    /// Give back the write buffers
    pub fn into_segments(self) -> Vec<MemorySegment> {
        self.segments
    }

    /// Number of write buffers held
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Open a channel, run `fill` against it and close it
    ///
    /// The channel file is removed again if anything fails.
    fn write_channel<F>(&mut self, fill: F) -> Result<SpillChannel>
    where
        F: FnOnce(&mut ChannelOutputView) -> Result<()>,
    {
        if self.segments.is_empty() {
            return Err(SortError::OutOfMemory {
                requested: 1,
                available: 0,
            });
        }

        let id = self.io.create_channel();
        let writer = self.io.create_block_writer(id.clone())?;
        let mut view = ChannelOutputView::new(writer, std::mem::take(&mut self.segments))?;

        let written = fill(&mut view);
        let closed = view.close(&mut self.segments);

        match (written, closed) {
            (Ok(()), Ok(channel)) => {
                tracing::debug!(
                    channel = channel.channel_id(),
                    blocks = channel.blocks,
                    bytes = channel.bytes,
                    "Wrote spill channel"
                );
                Ok(channel)
            }
            (Err(e), _) | (Ok(()), Err(e)) => {
                if let Err(delete_err) = self.io.delete_channel(&id) {
                    tracing::warn!(channel = id.id(), error = %delete_err, "Failed to delete channel");
                }
                Err(e)
            }
        }
    }
}

/// Serializes collected records into an output view
struct ViewCollector<'a, T> {
    serializer: &'a dyn TypeSerializer<T>,
    view: &'a mut ChannelOutputView,
    scratch: &'a mut Vec<u8>,
}

impl<T> Collector<T> for ViewCollector<'_, T> {
    fn collect(&mut self, record: T) -> Result<()> {
        self.scratch.clear();
        self.serializer.serialize(&record, &mut *self.scratch)?;
        self.view.write_bytes(&self.scratch[..])
    }
}

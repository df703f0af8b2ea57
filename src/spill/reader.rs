//! Channel Record Reader

use std::sync::Arc;

use crate::error::Result;
use crate::io::{ChannelInputView, IoManager, SpillChannel};
use crate::memory::{MemoryManager, MemorySegment};
use crate::merge::SortedSource;
use crate::typeutils::{RecordIterator, TypeSerializer};

/// Decodes the records of one spill channel
///
/// The channel file is deleted when the reader is closed (or dropped).
/// Integrity is checked when the last block has been read; a truncated or
/// altered file surfaces as `ChannelCorrupted`.
pub struct ChannelRecordReader<T> {
    serializer: Arc<dyn TypeSerializer<T>>,
    channel: SpillChannel,
    view: Option<ChannelInputView>,
    io: Arc<IoManager>,
    memory: Arc<MemoryManager>,
}

impl<T> ChannelRecordReader<T> {
    /// Start reading `channel` using `segments` as read-ahead buffers
    ///
    /// On failure the segments go back to `memory` and the channel is deleted.
    pub fn open(
        io: Arc<IoManager>,
        memory: Arc<MemoryManager>,
        serializer: Arc<dyn TypeSerializer<T>>,
        channel: SpillChannel,
        segments: Vec<MemorySegment>,
    ) -> Result<Self> {
        let reader = match io.create_block_reader(&channel) {
            Ok(reader) => reader,
            Err(e) => {
                memory.release(segments);
                if let Err(delete_err) = io.delete_channel(&channel.id) {
                    tracing::warn!(channel = channel.channel_id(), error = %delete_err, "Failed to delete channel");
                }
                return Err(e);
            }
        };

        tracing::trace!(
            channel = channel.channel_id(),
            buffers = segments.len(),
            "Reading spill channel"
        );

        Ok(Self {
            serializer,
            channel,
            view: Some(ChannelInputView::new(reader, segments)),
            io,
            memory,
        })
    }

    /// The channel being read
    pub fn channel(&self) -> &SpillChannel {
        &self.channel
    }

    /// Stop reading, delete the channel file and hand the read buffers to
    /// `segments` instead of the pool
    pub fn close_into(&mut self, segments: &mut Vec<MemorySegment>) -> Result<()> {
        if let Some(view) = self.view.take() {
            view.close(segments);
            self.io.delete_channel(&self.channel.id)?;
        }
        Ok(())
    }
}

impl<T> RecordIterator<T> for ChannelRecordReader<T> {
    fn next(&mut self) -> Result<Option<T>> {
        let Some(view) = self.view.as_mut() else {
            return Ok(None);
        };
        if !view.has_remaining()? {
            return Ok(None);
        }
        match self.serializer.deserialize(view) {
            Ok(record) => Ok(Some(record)),
            Err(e) => Err(view.take_error().unwrap_or(e)),
        }
    }

    fn next_reuse(&mut self, reuse: T) -> Result<Option<T>> {
        let Some(view) = self.view.as_mut() else {
            return Ok(None);
        };
        if !view.has_remaining()? {
            return Ok(None);
        }
        match self.serializer.deserialize_reuse(reuse, view) {
            Ok(record) => Ok(Some(record)),
            Err(e) => Err(view.take_error().unwrap_or(e)),
        }
    }
}

impl<T: Send> SortedSource<T> for ChannelRecordReader<T> {
    fn close(&mut self) -> Result<()> {
        let mut segments = Vec::new();
        let result = self.close_into(&mut segments);
        self.memory.release(segments);
        result
    }
}

impl<T> Drop for ChannelRecordReader<T> {
    fn drop(&mut self) {
        if let Some(view) = self.view.take() {
            let mut segments = Vec::new();
            view.close(&mut segments);
            self.memory.release(segments);
            if let Err(e) = self.io.delete_channel(&self.channel.id) {
                tracing::warn!(channel = self.channel.channel_id(), error = %e, "Failed to delete channel");
            }
        }
    }
}

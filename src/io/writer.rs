//! Channel Writer
//!
//! Block-level asynchronous writer and the byte-level output view on top.

use std::fs::{File, OpenOptions};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Result, SortError};
use crate::memory::MemorySegment;

use super::channel::{ChannelId, SpillChannel};
use super::manager::{echo_error, wait_completion, IoCompletion, IoRequest};

/// Writes full segments to a channel file through the I/O writer thread
///
/// Segments submitted with [`write_block`](Self::write_block) come back via
/// [`next_returned`](Self::next_returned) once written. Segments of failed
/// writes are kept and handed out by [`close`](Self::close), which always
/// returns every segment the writer has seen.
pub struct BlockChannelWriter {
    channel: ChannelId,
    file: Arc<Mutex<File>>,
    requests: Sender<IoRequest>,
    completions_tx: Sender<IoCompletion>,
    completions: Receiver<IoCompletion>,
    stopped: Receiver<()>,

    /// Blocks submitted but not yet returned
    in_flight: usize,
    /// Segments back from failed requests
    failed: Vec<MemorySegment>,
    /// First error seen on this channel
    error: Option<SortError>,

    blocks: u64,
    bytes: u64,
    hasher: crc32fast::Hasher,
}

impl BlockChannelWriter {
    pub(crate) fn open(
        channel: ChannelId,
        requests: Sender<IoRequest>,
        stopped: Receiver<()>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(channel.path())
            .map_err(|e| SortError::ChannelIo {
                channel: channel.id(),
                source: e,
            })?;

        let (completions_tx, completions) = channel::unbounded();

        tracing::trace!(channel = channel.id(), "Opened channel for writing");

        Ok(Self {
            channel,
            file: Arc::new(Mutex::new(file)),
            requests,
            completions_tx,
            completions,
            stopped,
            in_flight: 0,
            failed: Vec::new(),
            error: None,
            blocks: 0,
            bytes: 0,
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// The channel being written
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Submit the first `len` bytes of `segment` for writing
    pub fn write_block(&mut self, segment: MemorySegment, len: usize) -> Result<()> {
        if let Some(e) = self.error.take() {
            self.failed.push(segment);
            return Err(self.remember(e));
        }

        self.hasher.update(&segment[..len]);
        self.bytes += len as u64;
        self.blocks += 1;

        let request = IoRequest::Write {
            file: Arc::clone(&self.file),
            segment,
            len,
            done: self.completions_tx.clone(),
        };
        match self.requests.send(request) {
            Ok(()) => {
                self.in_flight += 1;
                Ok(())
            }
            Err(channel::SendError(request)) => {
                if let IoRequest::Write { segment, .. } = request {
                    self.failed.push(segment);
                }
                Err(self.remember(self.shutdown_error()))
            }
        }
    }

    /// Block until a submitted segment has been written and take it back
    pub fn next_returned(&mut self) -> Result<MemorySegment> {
        if self.in_flight == 0 {
            return Err(SortError::ChannelIo {
                channel: self.channel.id(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no block in flight",
                ),
            });
        }

        let completion = self.recv_completion()?;
        match completion.result {
            Ok(()) => Ok(completion.segment),
            Err(e) => {
                self.failed.push(completion.segment);
                let err = SortError::ChannelIo {
                    channel: self.channel.id(),
                    source: e,
                };
                Err(self.remember(err))
            }
        }
    }

    /// Wait for all blocks, hand every segment back and describe the channel
    pub fn close(mut self, segments: &mut Vec<MemorySegment>) -> Result<SpillChannel> {
        while self.in_flight > 0 {
            match self.recv_completion() {
                Ok(completion) => {
                    if let Err(e) = completion.result {
                        if self.error.is_none() {
                            self.error = Some(SortError::ChannelIo {
                                channel: self.channel.id(),
                                source: e,
                            });
                        }
                    }
                    segments.push(completion.segment);
                }
                Err(e) => {
                    if self.error.is_none() {
                        self.error = Some(e);
                    }
                    break;
                }
            }
        }
        segments.append(&mut self.failed);

        if let Some(e) = self.error.take() {
            return Err(e);
        }

        tracing::trace!(
            channel = self.channel.id(),
            blocks = self.blocks,
            bytes = self.bytes,
            "Closed channel writer"
        );

        Ok(SpillChannel {
            id: self.channel.clone(),
            blocks: self.blocks,
            bytes: self.bytes,
            checksum: self.hasher.clone().finalize(),
        })
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn recv_completion(&mut self) -> Result<IoCompletion> {
        match wait_completion(&self.completions, &self.stopped) {
            Some(completion) => {
                self.in_flight -= 1;
                Ok(completion)
            }
            None => {
                // Lost requests never come back
                self.in_flight = 0;
                Err(self.shutdown_error())
            }
        }
    }

    /// Keep the first error; the caller gets the same kind and message
    fn remember(&mut self, err: SortError) -> SortError {
        let reported = echo_error(self.channel.id(), &err);
        if self.error.is_none() {
            self.error = Some(err);
        }
        reported
    }

    fn shutdown_error(&self) -> SortError {
        SortError::ChannelIo {
            channel: self.channel.id(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "I/O manager shut down"),
        }
    }
}

/// Byte-level writer over a [`BlockChannelWriter`]
///
/// Fills one segment while the previously filled one is being written. With
/// two or more segments, serialization and disk I/O overlap.
pub struct ChannelOutputView {
    writer: BlockChannelWriter,
    current: Option<MemorySegment>,
    position: usize,
    /// Segments not yet used in this view
    spare: Vec<MemorySegment>,
}

impl ChannelOutputView {
    /// Create a view writing through `writer`, using `segments` as buffers
    pub fn new(writer: BlockChannelWriter, mut segments: Vec<MemorySegment>) -> Result<Self> {
        let current = segments.pop().ok_or(SortError::OutOfMemory {
            requested: 1,
            available: 0,
        })?;
        Ok(Self {
            writer,
            current: Some(current),
            position: 0,
            spare: segments,
        })
    }

    /// The channel being written
    pub fn channel(&self) -> &ChannelId {
        self.writer.channel()
    }

    /// Append bytes, flushing full segments to disk
    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let mut segment = match self.current.take() {
                Some(segment) => segment,
                None => self.next_segment()?,
            };

            let n = bytes.len().min(segment.size() - self.position);
            segment[self.position..self.position + n].copy_from_slice(&bytes[..n]);
            self.position += n;
            bytes = &bytes[n..];

            if self.position == segment.size() {
                self.position = 0;
                let len = segment.size();
                self.writer.write_block(segment, len)?;
            } else {
                self.current = Some(segment);
            }
        }
        Ok(())
    }

    /// Write the partial last block, wait for all writes and return every
    /// segment into `segments`
    pub fn close(mut self, segments: &mut Vec<MemorySegment>) -> Result<SpillChannel> {
        let flushed = if self.position > 0 {
            self.flush_current()
        } else {
            Ok(())
        };

        segments.extend(self.current.take());
        segments.append(&mut self.spare);

        let channel = self.writer.close(segments);
        flushed?;
        channel
    }

    fn flush_current(&mut self) -> Result<()> {
        if let Some(segment) = self.current.take() {
            let len = self.position;
            self.position = 0;
            self.writer.write_block(segment, len)?;
        }
        Ok(())
    }

    fn next_segment(&mut self) -> Result<MemorySegment> {
        match self.spare.pop() {
            Some(segment) => Ok(segment),
            None => self.writer.next_returned(),
        }
    }
}

//! Channel Reader
//!
//! Block-level read-ahead reader and the byte-level input view on top.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Result, SortError};
use crate::memory::MemorySegment;

use super::channel::SpillChannel;
use super::manager::{echo_error, wait_completion, IoCompletion, IoRequest};

/// Reads a channel file block by block, keeping reads in flight ahead of
/// the consumer
///
/// Every segment handed to the reader is either in flight, returned to the
/// consumer by [`next_block`](Self::next_block), or parked until
/// [`close`](Self::close) gives it back.
pub struct BlockChannelReader {
    channel: SpillChannel,
    file: Arc<Mutex<File>>,
    requests: Sender<IoRequest>,
    completions_tx: Sender<IoCompletion>,
    completions: Receiver<IoCompletion>,
    stopped: Receiver<()>,

    in_flight: usize,
    /// Set once a short block or end of file has been read
    end_of_file: bool,
    /// Segments no longer needed for reading
    parked: Vec<MemorySegment>,
    /// First failure; reported again on every later call
    error: Option<SortError>,

    bytes_read: u64,
    hasher: crc32fast::Hasher,
    verified: bool,
}

impl BlockChannelReader {
    pub(crate) fn open(
        channel: SpillChannel,
        requests: Sender<IoRequest>,
        stopped: Receiver<()>,
    ) -> Result<Self> {
        let file = File::open(channel.id.path()).map_err(|e| SortError::ChannelIo {
            channel: channel.channel_id(),
            source: e,
        })?;
        let (completions_tx, completions) = channel::unbounded();

        tracing::trace!(channel = channel.channel_id(), "Opened channel for reading");

        Ok(Self {
            channel,
            file: Arc::new(Mutex::new(file)),
            requests,
            completions_tx,
            completions,
            stopped,
            in_flight: 0,
            end_of_file: false,
            parked: Vec::new(),
            error: None,
            bytes_read: 0,
            hasher: crc32fast::Hasher::new(),
            verified: false,
        })
    }

    /// The channel being read
    pub fn channel(&self) -> &SpillChannel {
        &self.channel
    }

    /// Queue a read into `segment` (or park it once the file is exhausted)
    pub fn recycle(&mut self, segment: MemorySegment) {
        if self.end_of_file || self.error.is_some() {
            self.parked.push(segment);
            return;
        }

        let request = IoRequest::Read {
            file: Arc::clone(&self.file),
            segment,
            done: self.completions_tx.clone(),
        };
        match self.requests.send(request) {
            Ok(()) => self.in_flight += 1,
            Err(channel::SendError(request)) => {
                if let IoRequest::Read { segment, .. } = request {
                    self.parked.push(segment);
                }
                self.error = Some(self.io_error(io::Error::new(
                    io::ErrorKind::Other,
                    "I/O manager shut down",
                )));
            }
        }
    }

    /// Next filled block and its length; `None` once the channel is
    /// exhausted and verified
    pub fn next_block(&mut self) -> Result<Option<(MemorySegment, usize)>> {
        loop {
            if let Some(e) = &self.error {
                return Err(echo_error(self.channel.channel_id(), e));
            }

            if self.in_flight == 0 {
                self.verify()?;
                return Ok(None);
            }

            let Some(completion) = wait_completion(&self.completions, &self.stopped) else {
                let err = self.io_error(io::Error::new(io::ErrorKind::Other, "I/O manager shut down"));
                // Lost requests never come back
                self.in_flight = 0;
                self.error = Some(echo_error(self.channel.channel_id(), &err));
                return Err(err);
            };
            self.in_flight -= 1;

            if let Err(e) = completion.result {
                self.parked.push(completion.segment);
                let err = self.io_error(e);
                self.error = Some(echo_error(self.channel.channel_id(), &err));
                return Err(err);
            }

            if completion.len < completion.segment.size() {
                self.end_of_file = true;
            }
            if completion.len == 0 {
                self.parked.push(completion.segment);
                continue;
            }

            self.hasher.update(&completion.segment[..completion.len]);
            self.bytes_read += completion.len as u64;
            return Ok(Some((completion.segment, completion.len)));
        }
    }

    /// Wait for outstanding reads and hand every segment back
    pub fn close(mut self, segments: &mut Vec<MemorySegment>) {
        while self.in_flight > 0 {
            match wait_completion(&self.completions, &self.stopped) {
                Some(completion) => {
                    self.in_flight -= 1;
                    segments.push(completion.segment);
                }
                None => break,
            }
        }
        segments.append(&mut self.parked);
    }

    fn verify(&mut self) -> Result<()> {
        if self.verified {
            return Ok(());
        }
        self.verified = true;

        let checksum = self.hasher.clone().finalize();
        if self.bytes_read != self.channel.bytes {
            return Err(SortError::ChannelCorrupted {
                channel: self.channel.channel_id(),
                reason: format!(
                    "expected {} bytes, read {}",
                    self.channel.bytes, self.bytes_read
                ),
            });
        }
        if checksum != self.channel.checksum {
            return Err(SortError::ChannelCorrupted {
                channel: self.channel.channel_id(),
                reason: format!(
                    "checksum mismatch: expected {:08x}, got {:08x}",
                    self.channel.checksum, checksum
                ),
            });
        }
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> SortError {
        SortError::ChannelIo {
            channel: self.channel.channel_id(),
            source,
        }
    }
}

/// Byte-level `Read` over a [`BlockChannelReader`]
///
/// I/O failures cannot travel through `std::io::Read` with their full type,
/// so the view keeps the original error; callers fetch it with
/// [`take_error`](Self::take_error) when decoding fails.
pub struct ChannelInputView {
    reader: BlockChannelReader,
    current: Option<(MemorySegment, usize)>,
    position: usize,
    error: Option<SortError>,
}

impl ChannelInputView {
    /// Start reading, issuing read-ahead requests for all `segments`
    pub fn new(mut reader: BlockChannelReader, segments: Vec<MemorySegment>) -> Self {
        for segment in segments {
            reader.recycle(segment);
        }
        Self {
            reader,
            current: None,
            position: 0,
            error: None,
        }
    }

    /// The channel being read
    pub fn channel(&self) -> &SpillChannel {
        self.reader.channel()
    }

    /// True if at least one more byte can be read
    pub fn has_remaining(&mut self) -> Result<bool> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.fill()
    }

    /// The error behind the last failed `read`, if any
    pub fn take_error(&mut self) -> Option<SortError> {
        self.error.take()
    }

    /// Hand every segment back
    pub fn close(mut self, segments: &mut Vec<MemorySegment>) {
        if let Some((segment, _)) = self.current.take() {
            segments.push(segment);
        }
        self.reader.close(segments);
    }

    /// Make sure `current` has unread bytes; false at end of channel
    fn fill(&mut self) -> Result<bool> {
        loop {
            match &self.current {
                Some((_, len)) if self.position < *len => return Ok(true),
                _ => {}
            }

            if let Some((segment, _)) = self.current.take() {
                self.reader.recycle(segment);
            }
            self.position = 0;

            match self.reader.next_block()? {
                Some(block) => self.current = Some(block),
                None => return Ok(false),
            }
        }
    }
}

impl Read for ChannelInputView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        match self.fill() {
            Ok(true) => {}
            Ok(false) => return Ok(0),
            Err(e) => {
                let message = e.to_string();
                self.error = Some(e);
                return Err(io::Error::new(io::ErrorKind::Other, message));
            }
        }

        match &self.current {
            Some((segment, len)) => {
                let n = buf.len().min(len - self.position);
                buf[..n].copy_from_slice(&segment[self.position..self.position + n]);
                self.position += n;
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

//! I/O Manager
//!
//! Owns the spill directories and the threads that execute block requests.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Result, SortError};
use crate::memory::MemorySegment;

use super::channel::{ChannelId, SpillChannel};
use super::reader::BlockChannelReader;
use super::writer::BlockChannelWriter;

/// Result of one block request, carrying the segment back to its owner
pub(crate) struct IoCompletion {
    pub segment: MemorySegment,
    /// Bytes written, or bytes read (0 = end of file)
    pub len: usize,
    pub result: io::Result<()>,
}

/// Wait for the next completion
///
/// `stopped` disconnects once the I/O threads are gone; completions still
/// queued at that point are delivered, after that the wait gives up instead
/// of blocking on a request that was lost.
pub(crate) fn wait_completion(
    completions: &Receiver<IoCompletion>,
    stopped: &Receiver<()>,
) -> Option<IoCompletion> {
    select! {
        recv(completions) -> completion => completion.ok(),
        recv(stopped) -> _ => completions.try_recv().ok(),
    }
}

/// Report a remembered channel failure again
///
/// Keeps the original `io::ErrorKind` and message.
pub(crate) fn echo_error(channel: u64, err: &SortError) -> SortError {
    let source = match err {
        SortError::ChannelIo { source, .. } | SortError::Io(source) => {
            io::Error::new(source.kind(), source.to_string())
        }
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    };
    SortError::ChannelIo { channel, source }
}

/// A block request for an I/O thread
pub(crate) enum IoRequest {
    Write {
        file: Arc<Mutex<File>>,
        segment: MemorySegment,
        len: usize,
        done: Sender<IoCompletion>,
    },
    Read {
        file: Arc<Mutex<File>>,
        segment: MemorySegment,
        done: Sender<IoCompletion>,
    },
    Shutdown,
}

impl IoRequest {
    /// Complete the request with an error without touching the file
    fn fail(self, reason: &str) {
        match self {
            IoRequest::Write { segment, done, .. } | IoRequest::Read { segment, done, .. } => {
                let _ = done.send(IoCompletion {
                    segment,
                    len: 0,
                    result: Err(io::Error::new(io::ErrorKind::Other, reason.to_string())),
                });
            }
            IoRequest::Shutdown => {}
        }
    }
}

/// Injected failures for exercising error paths
///
/// A counter of `-1` disables injection; `n >= 0` lets `n` more blocks succeed
/// and fails every block after that.
#[derive(Debug)]
struct FaultInjection {
    writes_left: AtomicI64,
    reads_left: AtomicI64,
}

impl FaultInjection {
    fn should_fail(counter: &AtomicI64) -> bool {
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current < 0 {
                return false;
            }
            if current == 0 {
                return true;
            }
            match counter.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return false,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Manages spill channel files and the I/O threads serving them
///
/// ## Concurrency:
/// - One writer thread and one reader thread, each with its own FIFO queue
/// - All methods take `&self`; share the manager behind an `Arc`
pub struct IoManager {
    /// Directories channel files are spread over (round-robin)
    dirs: Vec<PathBuf>,

    /// Next channel id (atomic, lock-free)
    next_channel_id: AtomicU64,

    write_requests: Sender<IoRequest>,
    read_requests: Sender<IoRequest>,

    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Dropped after the threads are joined; never carries a message
    stopped_tx: Mutex<Option<Sender<()>>>,
    stopped_rx: Receiver<()>,

    faults: Arc<FaultInjection>,
}

impl IoManager {
    const CHANNEL_EXTENSION: &'static str = "channel";

    /// Create a manager that spills into `dir`
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_dirs(vec![dir.as_ref().to_path_buf()])
    }

    /// Create a manager spreading channels over several directories
    pub fn with_dirs(dirs: Vec<PathBuf>) -> Result<Self> {
        if dirs.is_empty() {
            return Err(SortError::Config(
                "at least one spill directory is required".into(),
            ));
        }
        for dir in &dirs {
            fs::create_dir_all(dir)?;
        }

        let faults = Arc::new(FaultInjection {
            writes_left: AtomicI64::new(-1),
            reads_left: AtomicI64::new(-1),
        });

        let (write_tx, write_rx) = channel::unbounded();
        let (read_tx, read_rx) = channel::unbounded();

        let writer_faults = Arc::clone(&faults);
        let writer = std::thread::Builder::new()
            .name("sortmerge-io-writer".into())
            .spawn(move || Self::run_io_thread(write_rx, writer_faults))?;

        let reader_faults = Arc::clone(&faults);
        let reader = std::thread::Builder::new()
            .name("sortmerge-io-reader".into())
            .spawn(move || Self::run_io_thread(read_rx, reader_faults))?;

        let (stopped_tx, stopped_rx) = channel::bounded(0);

        tracing::debug!(dirs = ?dirs, "I/O manager started");

        Ok(Self {
            dirs,
            next_channel_id: AtomicU64::new(0),
            write_requests: write_tx,
            read_requests: read_tx,
            threads: Mutex::new(vec![writer, reader]),
            stopped_tx: Mutex::new(Some(stopped_tx)),
            stopped_rx,
            faults,
        })
    }

    /// Reserve a new channel id and file path (the file is created by the writer)
    pub fn create_channel(&self) -> ChannelId {
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let dir = &self.dirs[(id as usize) % self.dirs.len()];
        let path = dir.join(format!("{:08}.{}", id, Self::CHANNEL_EXTENSION));
        ChannelId::new(id, path)
    }

    /// Open a block writer on a fresh channel file
    pub fn create_block_writer(&self, channel: ChannelId) -> Result<BlockChannelWriter> {
        BlockChannelWriter::open(channel, self.write_requests.clone(), self.stopped_rx.clone())
    }

    /// Open a block reader on a written channel
    ///
    /// No reads are issued until segments are handed to the reader.
    pub fn create_block_reader(&self, channel: &SpillChannel) -> Result<BlockChannelReader> {
        BlockChannelReader::open(channel.clone(), self.read_requests.clone(), self.stopped_rx.clone())
    }

    /// Remove a channel file; a missing file is not an error
    pub fn delete_channel(&self, channel: &ChannelId) -> Result<()> {
        match fs::remove_file(channel.path()) {
            Ok(()) => {
                tracing::trace!(channel = channel.id(), "Deleted channel file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SortError::ChannelIo {
                channel: channel.id(),
                source: e,
            }),
        }
    }

    /// Number of channel files currently present in the spill directories
    pub fn channel_file_count(&self) -> Result<usize> {
        let mut count = 0;
        for dir in &self.dirs {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map_or(false, |ext| ext == Self::CHANNEL_EXTENSION) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Spill directories
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    // =========================================================================
    // Fault Injection (for tests)
    // =========================================================================

    /// Let `blocks` more writes succeed, then fail every write
    pub fn fail_writes_after(&self, blocks: u64) {
        self.faults.writes_left.store(blocks as i64, Ordering::SeqCst);
    }

    /// Let `blocks` more reads succeed, then fail every read
    pub fn fail_reads_after(&self, blocks: u64) {
        self.faults.reads_left.store(blocks as i64, Ordering::SeqCst);
    }

    /// Disable all injected failures
    pub fn clear_faults(&self) {
        self.faults.writes_left.store(-1, Ordering::SeqCst);
        self.faults.reads_left.store(-1, Ordering::SeqCst);
    }

    /// Stop the I/O threads; pending requests complete with an error
    ///
    /// Readers and writers still waiting on a request that never reached a
    /// thread fail with a channel error.
    pub fn shutdown(&self) {
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            drop(self.stopped_tx.lock().take());
            return;
        }

        let _ = self.write_requests.send(IoRequest::Shutdown);
        let _ = self.read_requests.send(IoRequest::Shutdown);
        for handle in threads {
            if handle.join().is_err() {
                tracing::warn!("I/O thread panicked during shutdown");
            }
        }
        drop(self.stopped_tx.lock().take());
        tracing::debug!("I/O manager shut down");
    }

    // =========================================================================
    // I/O Thread
    // =========================================================================

    fn run_io_thread(requests: Receiver<IoRequest>, faults: Arc<FaultInjection>) {
        while let Ok(request) = requests.recv() {
            match request {
                IoRequest::Write {
                    file,
                    segment,
                    len,
                    done,
                } => {
                    let result = if FaultInjection::should_fail(&faults.writes_left) {
                        Err(io::Error::new(io::ErrorKind::Other, "injected write failure"))
                    } else {
                        file.lock().write_all(&segment[..len])
                    };
                    let _ = done.send(IoCompletion {
                        segment,
                        len,
                        result,
                    });
                }
                IoRequest::Read {
                    file,
                    mut segment,
                    done,
                } => {
                    let result = if FaultInjection::should_fail(&faults.reads_left) {
                        Err(io::Error::new(io::ErrorKind::Other, "injected read failure"))
                    } else {
                        Self::read_block(&mut file.lock(), &mut segment)
                    };
                    let (len, result) = match result {
                        Ok(len) => (len, Ok(())),
                        Err(e) => (0, Err(e)),
                    };
                    let _ = done.send(IoCompletion {
                        segment,
                        len,
                        result,
                    });
                }
                IoRequest::Shutdown => break,
            }
        }

        // Hand back segments of requests that arrived after shutdown
        while let Ok(request) = requests.try_recv() {
            request.fail("I/O manager shut down");
        }
    }

    /// Fill `segment` from the file, stopping early only at end of file
    fn read_block(file: &mut File, segment: &mut MemorySegment) -> io::Result<usize> {
        let mut filled = 0;
        while filled < segment.size() {
            match file.read(&mut segment[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Tests for spill channels and block I/O
//!
//! These tests verify:
//! - Writing and reading channels through the output and input views
//! - Length and checksum verification of damaged files
//! - Injected read and write failures returning every segment
//! - Channel file cleanup

#[path = "../common/mod.rs"]
mod common;

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use sortmerge::io::{ChannelInputView, ChannelOutputView};
use sortmerge::{IoManager, MemoryManager, SortError, SpillChannel};

use common::{pool, spill_dir};

const PAGE: usize = 256;

// =============================================================================
// Helper Functions
// =============================================================================

fn write_channel(io: &IoManager, memory: &MemoryManager, bytes: &[u8]) -> SpillChannel {
    let id = io.create_channel();
    let writer = io.create_block_writer(id).unwrap();
    let mut view = ChannelOutputView::new(writer, memory.allocate(2).unwrap()).unwrap();
    view.write_bytes(bytes).unwrap();

    let mut segments = Vec::new();
    let channel = view.close(&mut segments).unwrap();
    assert_eq!(segments.len(), 2);
    memory.release(segments);
    channel
}

fn read_channel(io: &IoManager, memory: &MemoryManager, channel: &SpillChannel) -> (Vec<u8>, Option<SortError>) {
    let reader = io.create_block_reader(channel).unwrap();
    let mut view = ChannelInputView::new(reader, memory.allocate(2).unwrap());

    let mut out = Vec::new();
    let result = view.read_to_end(&mut out);
    let error = match result {
        Ok(_) => None,
        Err(_) => view.take_error(),
    };

    let mut segments = Vec::new();
    view.close(&mut segments);
    assert_eq!(segments.len(), 2);
    memory.release(segments);
    (out, error)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_channel_write_read() {
    let (_temp, io) = spill_dir();
    let memory = pool(8, PAGE);

    let bytes = payload(PAGE * 5 + 17);
    let channel = write_channel(&io, &memory, &bytes);
    assert_eq!(channel.bytes, bytes.len() as u64);
    assert_eq!(channel.blocks, 6);
    assert!(!channel.is_empty());

    let (read, error) = read_channel(&io, &memory, &channel);
    assert!(error.is_none());
    assert_eq!(read, bytes);
    assert!(memory.verify_empty());
}

#[test]
fn test_empty_channel() {
    let (_temp, io) = spill_dir();
    let memory = pool(4, PAGE);

    let channel = write_channel(&io, &memory, &[]);
    assert!(channel.is_empty());
    assert_eq!(channel.blocks, 0);

    let (read, error) = read_channel(&io, &memory, &channel);
    assert!(error.is_none());
    assert!(read.is_empty());
    assert!(memory.verify_empty());
}

#[test]
fn test_delete_channel() {
    let (_temp, io) = spill_dir();
    let memory = pool(4, PAGE);

    let channel = write_channel(&io, &memory, &payload(100));
    assert_eq!(io.channel_file_count().unwrap(), 1);
    assert!(channel.id.path().exists());

    io.delete_channel(&channel.id).unwrap();
    assert_eq!(io.channel_file_count().unwrap(), 0);

    // Deleting twice is fine
    io.delete_channel(&channel.id).unwrap();
}

#[test]
fn test_channels_spread_over_dirs() {
    let first = tempfile::TempDir::new().unwrap();
    let second = tempfile::TempDir::new().unwrap();
    let io = IoManager::with_dirs(vec![first.path().to_path_buf(), second.path().to_path_buf()]).unwrap();

    let a = io.create_channel();
    let b = io.create_channel();
    assert_ne!(a.id(), b.id());
    assert!(a.path().starts_with(first.path()));
    assert!(b.path().starts_with(second.path()));
}

#[test]
fn test_with_no_dirs_fails() {
    assert!(matches!(IoManager::with_dirs(Vec::new()), Err(SortError::Config(_))));
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_flipped_byte_is_detected() {
    let (_temp, io) = spill_dir();
    let memory = pool(8, PAGE);

    let channel = write_channel(&io, &memory, &payload(PAGE * 2 + 3));

    let mut file = OpenOptions::new().read(true).write(true).open(channel.id.path()).unwrap();
    file.seek(SeekFrom::Start(PAGE as u64 + 1)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(PAGE as u64 + 1)).unwrap();
    file.write_all(&[byte[0] ^ 0xff]).unwrap();
    drop(file);

    let (_, error) = read_channel(&io, &memory, &channel);
    assert!(matches!(error, Some(SortError::ChannelCorrupted { .. })));
    assert!(memory.verify_empty());
}

#[test]
fn test_truncated_file_is_detected() {
    let (_temp, io) = spill_dir();
    let memory = pool(8, PAGE);

    let channel = write_channel(&io, &memory, &payload(PAGE * 3));
    let file = OpenOptions::new().write(true).open(channel.id.path()).unwrap();
    file.set_len(PAGE as u64 * 2).unwrap();
    drop(file);

    let (read, error) = read_channel(&io, &memory, &channel);
    assert_eq!(read.len(), PAGE * 2);
    match error {
        Some(SortError::ChannelCorrupted { channel: id, reason }) => {
            assert_eq!(id, channel.channel_id());
            assert!(reason.contains("bytes"));
        }
        other => panic!("expected corruption, got {:?}", other),
    }
    assert!(memory.verify_empty());
}

// =============================================================================
// Fault Injection Tests
// =============================================================================

#[test]
fn test_injected_write_failure_returns_segments() {
    let (_temp, io) = spill_dir();
    let memory = pool(4, PAGE);
    io.fail_writes_after(1);

    let id = io.create_channel();
    let writer = io.create_block_writer(id).unwrap();
    let mut view = ChannelOutputView::new(writer, memory.allocate(2).unwrap()).unwrap();

    // The write may or may not notice the failure; close always does
    let _ = view.write_bytes(&payload(PAGE * 6));
    let mut segments = Vec::new();
    assert!(view.close(&mut segments).is_err());
    assert_eq!(segments.len(), 2);

    memory.release(segments);
    assert!(memory.verify_empty());
    io.clear_faults();
}

#[test]
fn test_injected_read_failure() {
    let (_temp, io) = spill_dir();
    let memory = pool(8, PAGE);

    let channel = write_channel(&io, &memory, &payload(PAGE * 4));
    io.fail_reads_after(1);

    let (read, error) = read_channel(&io, &memory, &channel);
    assert!(read.len() <= PAGE);
    assert!(matches!(error, Some(SortError::ChannelIo { .. })));
    assert!(error.unwrap().is_io());
    assert!(memory.verify_empty());
}

#[test]
fn test_read_failure_reported_once_per_call() {
    let (_temp, io) = spill_dir();
    let memory = pool(8, PAGE);

    let channel = write_channel(&io, &memory, &payload(PAGE * 3));
    io.fail_reads_after(0);

    let mut reader = io.create_block_reader(&channel).unwrap();
    reader.recycle(memory.allocate(1).unwrap().pop().unwrap());

    let first = reader.next_block().unwrap_err();
    let again = reader.next_block().unwrap_err();
    for err in [&first, &again] {
        let message = err.to_string();
        assert_eq!(message.matches("IO error").count(), 1, "{}", message);
        assert!(message.contains("injected read failure"), "{}", message);
        match err {
            SortError::ChannelIo { source, .. } => assert_eq!(source.kind(), std::io::ErrorKind::Other),
            other => panic!("unexpected error {:?}", other),
        }
    }

    let mut segments = Vec::new();
    reader.close(&mut segments);
    memory.release(segments);
    assert!(memory.verify_empty());
    io.clear_faults();
}

#[test]
fn test_write_failure_keeps_original_message() {
    let (_temp, io) = spill_dir();
    let memory = pool(4, PAGE);
    io.fail_writes_after(0);

    let mut writer = io.create_block_writer(io.create_channel()).unwrap();
    let mut segments = memory.allocate(2).unwrap();
    writer.write_block(segments.pop().unwrap(), PAGE).unwrap();

    let returned = writer.next_returned().unwrap_err();
    let later = writer.write_block(segments.pop().unwrap(), PAGE).unwrap_err();
    for err in [&returned, &later] {
        let message = err.to_string();
        assert_eq!(message.matches("IO error").count(), 1, "{}", message);
        assert!(message.contains("injected write failure"), "{}", message);
    }

    let mut back = Vec::new();
    let closed = writer.close(&mut back).unwrap_err();
    assert!(closed.to_string().contains("injected write failure"));
    assert_eq!(back.len(), 2);
    memory.release(back);
    assert!(memory.verify_empty());
    io.clear_faults();
}

#[test]
fn test_shutdown_fails_pending_requests() {
    let (_temp, io) = spill_dir();
    let memory: Arc<MemoryManager> = pool(4, PAGE);
    io.shutdown();

    let id = io.create_channel();
    let writer = io.create_block_writer(id).unwrap();
    let mut view = ChannelOutputView::new(writer, memory.allocate(1).unwrap()).unwrap();
    let _ = view.write_bytes(&payload(PAGE * 2));

    let mut segments = Vec::new();
    assert!(view.close(&mut segments).is_err());
    assert_eq!(segments.len(), 1);
    memory.release(segments);
    assert!(memory.verify_empty());
}

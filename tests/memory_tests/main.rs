//! Tests for the memory pool and paged views
//!
//! These tests verify:
//! - All-or-nothing allocation and release accounting
//! - Budget translation (bytes and fractions)
//! - Reads and writes straddling segment boundaries

use std::io::Read;

use sortmerge::config::MemoryBudget;
use sortmerge::memory::{read_at, write_at, SegmentReader};
use sortmerge::{MemoryManager, SortError};

// =============================================================================
// Pool Tests
// =============================================================================

#[test]
fn test_new_rejects_tiny_pages() {
    let result = MemoryManager::new(4096, 16);
    assert!(matches!(result, Err(SortError::Config(_))));
}

#[test]
fn test_new_rejects_pool_smaller_than_one_page() {
    let result = MemoryManager::new(100, 128);
    assert!(matches!(result, Err(SortError::Config(_))));
}

#[test]
fn test_allocate_and_release() {
    let memory = MemoryManager::new(8 * 128, 128).unwrap();
    assert_eq!(memory.total_segments(), 8);

    let segments = memory.allocate(5).unwrap();
    assert_eq!(segments.len(), 5);
    assert!(segments.iter().all(|s| s.size() == 128));
    assert_eq!(memory.outstanding_segments(), 5);
    assert_eq!(memory.available_segments(), 3);
    assert!(!memory.verify_empty());

    memory.release(segments);
    assert_eq!(memory.outstanding_segments(), 0);
    assert!(memory.verify_empty());
}

#[test]
fn test_allocation_is_all_or_nothing() {
    let memory = MemoryManager::new(4 * 128, 128).unwrap();
    let held = memory.allocate(3).unwrap();

    let err = memory.allocate(2).unwrap_err();
    assert!(matches!(
        err,
        SortError::OutOfMemory {
            requested: 2,
            available: 1
        }
    ));
    assert_eq!(memory.outstanding_segments(), 3);

    memory.release(held);
    assert!(memory.verify_empty());
}

#[test]
fn test_release_one_and_reuse() {
    let memory = MemoryManager::new(2 * 128, 128).unwrap();

    let mut segments = memory.allocate(2).unwrap();
    segments[0][0] = 42;
    memory.release_one(segments.remove(0));
    assert_eq!(memory.outstanding_segments(), 1);

    let again = memory.allocate(1).unwrap();
    assert_eq!(again[0].size(), 128);

    memory.release(again);
    memory.release(segments);
    assert!(memory.verify_empty());
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "checked out")]
fn test_release_into_wrong_pool_is_caught() {
    let owner = MemoryManager::new(4 * 256, 256).unwrap();
    let other = MemoryManager::new(4 * 256, 256).unwrap();

    let segments = owner.allocate(2).unwrap();
    other.release(segments);
}

#[test]
fn test_segments_for_budget() {
    let memory = MemoryManager::new(10 * 256, 256).unwrap();

    assert_eq!(memory.segments_for(MemoryBudget::Bytes(1024)), 4);
    assert_eq!(memory.segments_for(MemoryBudget::Bytes(1000)), 3);
    assert_eq!(memory.segments_for(MemoryBudget::Fraction(0.5)), 5);
    assert_eq!(memory.segments_for(MemoryBudget::Fraction(1.0)), 10);
    assert_eq!(memory.segments_for(MemoryBudget::Fraction(0.25)), 2);
}

// =============================================================================
// View Tests
// =============================================================================

#[test]
fn test_write_and_read_across_segments() {
    let memory = MemoryManager::new(3 * 64, 64).unwrap();
    let mut segments = memory.allocate(3).unwrap();

    let bytes: Vec<u8> = (0..100u8).collect();
    write_at(&mut segments, 64, 50, &bytes);

    let mut target = vec![0u8; 100];
    read_at(&segments, 64, 50, &mut target);
    assert_eq!(target, bytes);

    // The range starts in the first segment and ends in the third
    assert_eq!(segments[0][50], 0);
    assert_eq!(segments[1][0], 14);
    assert_eq!(segments[2][0], 78);

    memory.release(segments);
}

#[test]
fn test_segment_reader_stops_at_end() {
    let memory = MemoryManager::new(2 * 64, 64).unwrap();
    let mut segments = memory.allocate(2).unwrap();
    let bytes: Vec<u8> = (0..128).map(|i| i as u8).collect();
    write_at(&mut segments, 64, 0, &bytes);

    let mut reader = SegmentReader::new(&segments, 64, 60, 70);
    assert_eq!(reader.remaining(), 10);

    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    assert_eq!(out, (60..70).map(|i| i as u8).collect::<Vec<_>>());
    assert_eq!(reader.position(), 70);
    assert_eq!(reader.remaining(), 0);

    memory.release(segments);
}

//! Tests for sort buffers
//!
//! These tests verify:
//! - Appending until full and sorting by normalized key or full compare
//! - Partial normalized keys falling back to record comparison
//! - Large records in the overflow region
//! - Reset, dispose and in-memory sources returning every segment

#[path = "../common/mod.rs"]
mod common;

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sortmerge::merge::SortedSource;
use sortmerge::sort::{quicksort, IndexedSortable, SortBuffer};
use sortmerge::{
    BincodeSerializer, BytesKeyComparator, BytesRecord, BytesSerializer, IntPairComparator,
    KeyComparator, MemoryManager, RecordIterator, SortError, TypeComparator, TypeSerializer,
};

use common::{pair_comparator, pair_serializer, pool, random_pairs, reference_sort, Pair};

const PAGE: usize = 128;

// =============================================================================
// Helper Functions
// =============================================================================

fn pair_buffer(memory: &MemoryManager, segments: usize) -> SortBuffer<Pair> {
    SortBuffer::new(pair_serializer(), pair_comparator(), memory.allocate(segments).unwrap(), false)
}

fn drain<T>(buffer: &SortBuffer<T>) -> Vec<T> {
    let mut iter = buffer.iter();
    let mut out = Vec::new();
    while let Some(record) = iter.next().unwrap() {
        out.push(record);
    }
    out
}

// =============================================================================
// Basic Tests
// =============================================================================

#[test]
fn test_empty_buffer() {
    let memory = pool(4, PAGE);
    let mut buffer = pair_buffer(&memory, 4);

    assert!(buffer.is_empty());
    assert_eq!(buffer.capacity(), 4 * PAGE);
    assert_eq!(buffer.segment_count(), 4);
    buffer.sort().unwrap();
    assert!(drain(&buffer).is_empty());

    memory.release(buffer.dispose());
    assert!(memory.verify_empty());
}

#[test]
fn test_write_until_full_then_sort() {
    let memory = pool(8, PAGE);
    let mut buffer = pair_buffer(&memory, 8);

    let input = random_pairs(1000, 50, 7);
    let mut accepted = Vec::new();
    for record in &input {
        if !buffer.write(record).unwrap() {
            break;
        }
        accepted.push(*record);
    }
    assert!(!accepted.is_empty());
    assert!(accepted.len() < input.len());
    assert_eq!(buffer.len(), accepted.len());
    assert!(buffer.occupancy() <= buffer.capacity());

    buffer.sort().unwrap();
    let sorted = drain(&buffer);
    let keys: Vec<i32> = sorted.iter().map(|r| r.0).collect();
    let expected: Vec<i32> = reference_sort(accepted.clone()).iter().map(|r| r.0).collect();
    assert_eq!(keys, expected);

    // Same multiset of records
    let mut got = sorted;
    got.sort();
    accepted.sort();
    assert_eq!(got, accepted);

    memory.release(buffer.dispose());
    assert!(memory.verify_empty());
}

#[test]
fn test_descending_order() {
    let memory = pool(8, PAGE);
    let mut buffer = SortBuffer::new(
        pair_serializer(),
        Arc::new(IntPairComparator::descending()) as Arc<dyn TypeComparator<Pair>>,
        memory.allocate(8).unwrap(),
        false,
    );

    for record in [(3, 0), (-5, 1), (10, 2), (0, 3), (i32::MIN, 4), (i32::MAX, 5)] {
        assert!(buffer.write(&record).unwrap());
    }
    buffer.sort().unwrap();

    let keys: Vec<i32> = drain(&buffer).iter().map(|r| r.0).collect();
    assert_eq!(keys, vec![i32::MAX, 10, 3, 0, -5, i32::MIN]);
    memory.release(buffer.dispose());
}

#[test]
fn test_reset_keeps_segments() {
    let memory = pool(4, PAGE);
    let mut buffer = pair_buffer(&memory, 4);

    for i in 0..10 {
        assert!(buffer.write(&(i, i)).unwrap());
    }
    buffer.reset();
    assert!(buffer.is_empty());
    assert_eq!(buffer.occupancy(), 0);
    assert_eq!(memory.outstanding_segments(), 4);

    assert!(buffer.write(&(1, 1)).unwrap());
    assert_eq!(drain(&buffer), vec![(1, 1)]);

    memory.release(buffer.dispose());
    assert!(memory.verify_empty());
}

#[test]
fn test_record_reuse() {
    let memory = pool(4, PAGE);
    let mut buffer = pair_buffer(&memory, 4);
    for record in [(2, 20), (1, 10)] {
        buffer.write(&record).unwrap();
    }
    buffer.sort().unwrap();

    assert_eq!(buffer.record(0).unwrap(), (1, 10));
    assert_eq!(buffer.record_reuse(1, (0, 0)).unwrap(), (2, 20));
    memory.release(buffer.dispose());
}

// =============================================================================
// Key Comparison Tests
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Event {
    user: String,
    at: u64,
}

#[test]
fn test_sort_without_normalized_keys() {
    let memory = pool(16, PAGE);
    let serializer: Arc<dyn TypeSerializer<Event>> = Arc::new(BincodeSerializer::<Event>::new());
    let comparator: Arc<dyn TypeComparator<Event>> =
        Arc::new(KeyComparator::new(|e: &Event| (e.user.clone(), e.at)));
    let mut buffer = SortBuffer::new(serializer, comparator, memory.allocate(16).unwrap(), false);

    let users = ["carol", "alice", "bob", "alice", "dave", "bob"];
    for (i, user) in users.iter().enumerate() {
        let event = Event {
            user: user.to_string(),
            at: 100 - i as u64,
        };
        assert!(buffer.write(&event).unwrap());
    }
    buffer.sort().unwrap();

    let sorted: Vec<(String, u64)> = drain(&buffer).into_iter().map(|e| (e.user, e.at)).collect();
    assert_eq!(
        sorted,
        vec![
            ("alice".to_string(), 97),
            ("alice".to_string(), 99),
            ("bob".to_string(), 95),
            ("bob".to_string(), 98),
            ("carol".to_string(), 100),
            ("dave".to_string(), 96),
        ]
    );
    memory.release(buffer.dispose());
}

#[test]
fn test_partial_normalized_keys_fall_back_to_records() {
    let memory = pool(32, PAGE);
    let serializer: Arc<dyn TypeSerializer<BytesRecord>> = Arc::new(BytesSerializer);
    let comparator: Arc<dyn TypeComparator<BytesRecord>> = Arc::new(BytesKeyComparator::new(4));
    let mut buffer = SortBuffer::new(serializer, comparator, memory.allocate(32).unwrap(), false);

    // Keys share the 3-byte prefix, so only decoding can order them
    let keys = ["prefix-z", "prefix-a", "pre", "prefix-m", "pr", "pre\0", "prefix"];
    for key in keys {
        let record = BytesRecord::new(key.as_bytes().to_vec(), b"v".to_vec());
        assert!(buffer.write(&record).unwrap());
    }
    buffer.sort().unwrap();

    let sorted: Vec<Vec<u8>> = drain(&buffer).into_iter().map(|r| r.key.to_vec()).collect();
    let mut expected: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
    expected.sort();
    assert_eq!(sorted, expected);
    memory.release(buffer.dispose());
}

#[test]
fn test_key_longer_than_page_is_ignored() {
    let memory = pool(8, 64);
    let serializer: Arc<dyn TypeSerializer<BytesRecord>> = Arc::new(BytesSerializer);
    let comparator: Arc<dyn TypeComparator<BytesRecord>> = Arc::new(BytesKeyComparator::new(100));
    let mut buffer = SortBuffer::new(serializer, comparator, memory.allocate(8).unwrap(), false);

    for key in ["b", "c", "a"] {
        assert!(buffer.write(&BytesRecord::new(key, "")).unwrap());
    }
    buffer.sort().unwrap();

    let sorted: Vec<String> = drain(&buffer)
        .into_iter()
        .map(|r| String::from_utf8(r.key.to_vec()).unwrap())
        .collect();
    assert_eq!(sorted, vec!["a", "b", "c"]);
    memory.release(buffer.dispose());
}

// =============================================================================
// Large Record Tests
// =============================================================================

fn value_of(len: usize, fill: u8) -> Vec<u8> {
    vec![fill; len]
}

#[test]
fn test_large_record_rejected_when_disabled() {
    let memory = pool(8, PAGE);
    let mut buffer = SortBuffer::new(
        Arc::new(BytesSerializer) as Arc<dyn TypeSerializer<BytesRecord>>,
        Arc::new(BytesKeyComparator::default()) as Arc<dyn TypeComparator<BytesRecord>>,
        memory.allocate(8).unwrap(),
        false,
    );

    let err = buffer
        .write(&BytesRecord::new("big", value_of(PAGE * 2, 1)))
        .unwrap_err();
    assert!(matches!(err, SortError::RecordTooLarge { .. }));
    assert!(buffer.is_empty());
    memory.release(buffer.dispose());
}

#[test]
fn test_large_records_in_overflow_region() {
    let memory = pool(16, PAGE);
    let mut buffer = SortBuffer::new(
        Arc::new(BytesSerializer) as Arc<dyn TypeSerializer<BytesRecord>>,
        Arc::new(BytesKeyComparator::default()) as Arc<dyn TypeComparator<BytesRecord>>,
        memory.allocate(16).unwrap(),
        true,
    );

    let records = vec![
        BytesRecord::new("m", value_of(PAGE * 3, 3)),
        BytesRecord::new("a", value_of(10, 1)),
        BytesRecord::new("z", value_of(PAGE + 5, 26)),
        BytesRecord::new("c", value_of(20, 2)),
    ];
    for record in &records {
        assert!(buffer.write(record).unwrap());
    }
    buffer.sort().unwrap();

    let sorted = drain(&buffer);
    let keys: Vec<&[u8]> = sorted.iter().map(|r| r.key.as_ref()).collect();
    assert_eq!(keys, vec![b"a".as_ref(), b"c", b"m", b"z"]);
    assert_eq!(sorted[2].value.len(), PAGE * 3);
    assert!(sorted[2].value.iter().all(|&b| b == 3));
    assert_eq!(sorted[3].value.len(), PAGE + 5);

    memory.release(buffer.dispose());
    assert!(memory.verify_empty());
}

#[test]
fn test_record_larger_than_buffer() {
    let memory = pool(4, PAGE);
    let mut buffer = SortBuffer::new(
        Arc::new(BytesSerializer) as Arc<dyn TypeSerializer<BytesRecord>>,
        Arc::new(BytesKeyComparator::default()) as Arc<dyn TypeComparator<BytesRecord>>,
        memory.allocate(4).unwrap(),
        true,
    );

    let err = buffer
        .write(&BytesRecord::new("huge", value_of(PAGE * 8, 0)))
        .unwrap_err();
    assert!(matches!(err, SortError::RecordTooLarge { .. }));
    memory.release(buffer.dispose());
}

// =============================================================================
// Source Tests
// =============================================================================

#[test]
fn test_buffer_source_releases_segments() {
    let memory = pool(4, PAGE);
    let mut buffer = pair_buffer(&memory, 4);
    for record in [(3, 0), (1, 0), (2, 0)] {
        buffer.write(&record).unwrap();
    }
    buffer.sort().unwrap();

    let mut source = buffer.into_source(Arc::clone(&memory));
    assert_eq!(source.next().unwrap(), Some((1, 0)));
    assert_eq!(source.next_reuse((0, 0)).unwrap(), Some((2, 0)));
    source.close().unwrap();
    assert!(memory.verify_empty());
    assert_eq!(source.next().unwrap(), None);
}

#[test]
fn test_dropped_source_releases_segments() {
    let memory = pool(4, PAGE);
    let buffer = pair_buffer(&memory, 4);
    let source = buffer.into_source(Arc::clone(&memory));
    drop(source);
    assert!(memory.verify_empty());
}

// =============================================================================
// Quicksort Tests
// =============================================================================

struct Keys(Vec<i64>);

impl IndexedSortable for Keys {
    fn compare(&mut self, i: usize, j: usize) -> Ordering {
        self.0[i].cmp(&self.0[j])
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.0.swap(i, j);
    }

    fn size(&self) -> usize {
        self.0.len()
    }
}

#[test]
fn test_quicksort_patterns() {
    let mut rng = common::XorShift::new(99);
    let inputs: Vec<Vec<i64>> = vec![
        Vec::new(),
        vec![1],
        (0..500).collect(),
        (0..500).rev().collect(),
        vec![7; 300],
        (0..1000).map(|_| rng.below(10) as i64).collect(),
        (0..1000).map(|i| if i % 2 == 0 { i } else { -i }).collect(),
    ];

    for input in inputs {
        let mut expected = input.clone();
        expected.sort();
        let mut keys = Keys(input);
        quicksort::sort(&mut keys);
        assert_eq!(keys.0, expected);
    }
}

//! Tests for merging, spilling and merge rounds
//!
//! These tests verify:
//! - N-way merge order and source-order tie breaking
//! - Round planning for bounded fan-in
//! - Spilling sorted buffers and reading channels back
//! - Multi-round merges deleting consumed channels

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sortmerge::combine::SharedCombiner;
use sortmerge::merge::rounds::{merge_rounds, RoundContext};
use sortmerge::merge::{plan_round, MergeIterator, SortedSource};
use sortmerge::sort::SortBuffer;
use sortmerge::spill::{ChannelRecordReader, SpillWriter};
use sortmerge::{IoManager, MemoryManager, RecordIterator, Result, SortError, SpillChannel};

use common::{pair_comparator, pair_serializer, pool, random_pairs, reference_sort, spill_dir, sum_combiner, Pair};

const PAGE: usize = 256;

// =============================================================================
// Helper Functions
// =============================================================================

/// Sorted in-memory source that counts `close` calls
struct ListSource {
    records: std::vec::IntoIter<Pair>,
    closes: Arc<AtomicUsize>,
}

impl ListSource {
    fn boxed(records: Vec<Pair>, closes: &Arc<AtomicUsize>) -> Box<dyn SortedSource<Pair>> {
        Box::new(Self {
            records: records.into_iter(),
            closes: Arc::clone(closes),
        })
    }
}

impl RecordIterator<Pair> for ListSource {
    fn next(&mut self) -> Result<Option<Pair>> {
        Ok(self.records.next())
    }
}

impl SortedSource<Pair> for ListSource {
    fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn drain<I: RecordIterator<Pair>>(source: &mut I) -> Result<Vec<Pair>> {
    let mut out = Vec::new();
    while let Some(record) = source.next()? {
        out.push(record);
    }
    Ok(out)
}

/// Sort `records` into a buffer and spill it
fn spill_sorted(
    memory: &MemoryManager,
    writer: &mut SpillWriter<Pair>,
    records: &[Pair],
    combiner: Option<&SharedCombiner<Pair>>,
) -> SpillChannel {
    let mut buffer = SortBuffer::new(pair_serializer(), pair_comparator(), memory.allocate(40).unwrap(), false);
    for record in records {
        assert!(buffer.write(record).unwrap());
    }
    buffer.sort().unwrap();
    let channel = writer.spill(&buffer, combiner).unwrap();
    memory.release(buffer.dispose());
    channel
}

fn open_reader(io: &Arc<IoManager>, memory: &Arc<MemoryManager>, channel: SpillChannel) -> ChannelRecordReader<Pair> {
    ChannelRecordReader::open(
        Arc::clone(io),
        Arc::clone(memory),
        pair_serializer(),
        channel,
        memory.allocate(2).unwrap(),
    )
    .unwrap()
}

// =============================================================================
// Merge Iterator Tests
// =============================================================================

#[test]
fn test_merge_sorted_sources() {
    let closes = Arc::new(AtomicUsize::new(0));
    let sources = vec![
        ListSource::boxed(vec![(1, 0), (4, 0), (9, 0)], &closes),
        ListSource::boxed(vec![(2, 1), (3, 1), (10, 1)], &closes),
        ListSource::boxed(vec![(0, 2), (5, 2)], &closes),
    ];

    let mut merge = MergeIterator::new(sources, pair_comparator());
    assert_eq!(merge.source_count(), 3);

    let keys: Vec<i32> = drain(&mut merge).unwrap().iter().map(|r| r.0).collect();
    assert_eq!(keys, vec![0, 1, 2, 3, 4, 5, 9, 10]);

    merge.close().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 3);
}

#[test]
fn test_equal_keys_follow_source_order() {
    let closes = Arc::new(AtomicUsize::new(0));
    let sources = vec![
        ListSource::boxed(vec![(1, 0), (1, 1), (2, 2)], &closes),
        ListSource::boxed(vec![(1, 10), (2, 11)], &closes),
        ListSource::boxed(vec![(1, 20), (2, 21)], &closes),
    ];

    let mut merge = MergeIterator::new(sources, pair_comparator());
    let merged = drain(&mut merge).unwrap();
    assert_eq!(
        merged,
        vec![(1, 0), (1, 1), (1, 10), (1, 20), (2, 2), (2, 11), (2, 21)]
    );
}

#[test]
fn test_merge_with_empty_sources() {
    let closes = Arc::new(AtomicUsize::new(0));
    let sources = vec![
        ListSource::boxed(Vec::new(), &closes),
        ListSource::boxed(vec![(5, 0)], &closes),
        ListSource::boxed(Vec::new(), &closes),
    ];

    let mut merge = MergeIterator::new(sources, pair_comparator());
    assert_eq!(drain(&mut merge).unwrap(), vec![(5, 0)]);
    assert_eq!(merge.next().unwrap(), None);
}

#[test]
fn test_merge_random_sources_matches_reference() {
    let closes = Arc::new(AtomicUsize::new(0));
    let mut all = Vec::new();
    let mut sources = Vec::new();
    for seed in 1..=7 {
        let chunk = reference_sort(random_pairs(200, 40, seed));
        all.extend(chunk.iter().copied());
        sources.push(ListSource::boxed(chunk, &closes));
    }

    let mut merge = MergeIterator::new(sources, pair_comparator());
    let merged = drain(&mut merge).unwrap();
    assert_eq!(merged.len(), all.len());
    assert!(merged.windows(2).all(|w| w[0].0 <= w[1].0));
}

// =============================================================================
// Round Planning Tests
// =============================================================================

#[test]
fn test_plan_round_examples() {
    let plan = plan_round(3, 2).unwrap();
    assert_eq!(plan.untouched, 1);
    assert_eq!(plan.runs, vec![2]);

    // One short merge now leaves a full 3-way round for the rest
    let plan = plan_round(10, 3).unwrap();
    assert_eq!(plan.untouched, 8);
    assert_eq!(plan.runs, vec![2]);
    assert_eq!(plan.output_channels(), 9);

    let plan = plan_round(9, 3).unwrap();
    assert_eq!(plan.untouched, 0);
    assert_eq!(plan.runs, vec![3, 3, 3]);

    assert_eq!(plan_round(4, 4), None);
    assert_eq!(plan_round(100, 1), None);
}

#[test]
fn test_plan_rounds_converge() {
    for fan_in in 2..=8 {
        for channels in 0..=300 {
            let mut remaining = channels;
            let mut rounds = 0;
            while let Some(plan) = plan_round(remaining, fan_in) {
                assert_eq!(plan.untouched + plan.runs.iter().sum::<usize>(), remaining);
                assert!(plan.runs.iter().all(|&run| (1..=fan_in).contains(&run)));
                assert!(plan.output_channels() < remaining);
                remaining = plan.output_channels();
                rounds += 1;
                assert!(rounds < 20);
            }
            assert!(remaining <= fan_in);
        }
    }
}

// =============================================================================
// Spill Tests
// =============================================================================

#[test]
fn test_spill_and_read_back() {
    let (_temp, io) = spill_dir();
    let memory = pool(64, PAGE);
    let mut writer = SpillWriter::new(Arc::clone(&io), pair_serializer(), pair_comparator(), memory.allocate(2).unwrap());

    let records = random_pairs(300, 1000, 3);
    let channel = spill_sorted(&memory, &mut writer, &records, None);
    assert_eq!(channel.bytes, 300 * 8);
    assert_eq!(io.channel_file_count().unwrap(), 1);

    let mut reader = open_reader(&io, &memory, channel);
    let read = drain(&mut reader).unwrap();
    assert_eq!(
        read.iter().map(|r| r.0).collect::<Vec<_>>(),
        reference_sort(records).iter().map(|r| r.0).collect::<Vec<_>>()
    );

    reader.close().unwrap();
    assert_eq!(io.channel_file_count().unwrap(), 0);

    memory.release(writer.into_segments());
    assert!(memory.verify_empty());
}

#[test]
fn test_spill_with_combiner_compacts_groups() {
    let (_temp, io) = spill_dir();
    let memory = pool(64, PAGE);
    let mut writer = SpillWriter::new(Arc::clone(&io), pair_serializer(), pair_comparator(), memory.allocate(2).unwrap());
    let combiner = SharedCombiner::new(Box::new(sum_combiner()));

    let records: Vec<Pair> = (0..200).map(|i| (i % 5, 1)).collect();
    let channel = spill_sorted(&memory, &mut writer, &records, Some(&combiner));
    assert_eq!(channel.bytes, 5 * 8);
    assert!(combiner.is_opened());

    let mut reader = open_reader(&io, &memory, channel);
    assert_eq!(
        drain(&mut reader).unwrap(),
        vec![(0, 40), (1, 40), (2, 40), (3, 40), (4, 40)]
    );
    reader.close().unwrap();

    combiner.close().unwrap();
    memory.release(writer.into_segments());
    assert!(memory.verify_empty());
}

#[test]
fn test_corrupted_channel_fails_reader() {
    let (_temp, io) = spill_dir();
    let memory = pool(64, PAGE);
    let mut writer = SpillWriter::new(Arc::clone(&io), pair_serializer(), pair_comparator(), memory.allocate(2).unwrap());

    let records: Vec<Pair> = (0..100).map(|i| (i, i)).collect();
    let channel = spill_sorted(&memory, &mut writer, &records, None);

    let mut bytes = std::fs::read(channel.id.path()).unwrap();
    bytes[13] ^= 0x40;
    std::fs::write(channel.id.path(), &bytes).unwrap();

    let mut reader = open_reader(&io, &memory, channel);
    let err = drain(&mut reader).unwrap_err();
    assert!(matches!(err, SortError::ChannelCorrupted { .. }));

    drop(reader);
    assert_eq!(io.channel_file_count().unwrap(), 0);
    memory.release(writer.into_segments());
    assert!(memory.verify_empty());
}

#[test]
fn test_spill_write_failure_deletes_channel() {
    let (_temp, io) = spill_dir();
    let memory = pool(64, PAGE);
    let mut writer = SpillWriter::new(Arc::clone(&io), pair_serializer(), pair_comparator(), memory.allocate(2).unwrap());

    let mut buffer = SortBuffer::new(pair_serializer(), pair_comparator(), memory.allocate(40).unwrap(), false);
    for i in 0..300 {
        assert!(buffer.write(&(i, i)).unwrap());
    }
    buffer.sort().unwrap();

    io.fail_writes_after(0);
    assert!(writer.spill(&buffer, None).is_err());
    io.clear_faults();

    assert_eq!(io.channel_file_count().unwrap(), 0);
    assert_eq!(writer.segment_count(), 2);
    memory.release(buffer.dispose());
    memory.release(writer.into_segments());
    assert!(memory.verify_empty());
}

// =============================================================================
// Merge Round Tests
// =============================================================================

#[test]
fn test_merge_rounds_down_to_fan_in() {
    let (_temp, io) = spill_dir();
    let memory = pool(64, PAGE);
    let mut writer = SpillWriter::new(Arc::clone(&io), pair_serializer(), pair_comparator(), memory.allocate(2).unwrap());

    let mut all = Vec::new();
    let mut channels = Vec::new();
    for seed in 1..=7 {
        let records = random_pairs(150, 500, seed);
        all.extend(records.iter().copied());
        channels.push(spill_sorted(&memory, &mut writer, &records, None));
    }

    let serializer = pair_serializer();
    let comparator = pair_comparator();
    let mut read_segments = memory.allocate(4).unwrap();
    let (merged, rounds) = {
        let mut ctx = RoundContext {
            io: &io,
            memory: &memory,
            serializer: &serializer,
            comparator: &comparator,
            read_segments: &mut read_segments,
            writer: &mut writer,
        };
        merge_rounds(channels, 2, &mut ctx).unwrap()
    };

    assert_eq!(merged.len(), 2);
    assert_eq!(rounds, 2);
    assert_eq!(read_segments.len(), 4);
    assert_eq!(io.channel_file_count().unwrap(), 2);

    let sources: Vec<Box<dyn SortedSource<Pair>>> = merged
        .into_iter()
        .map(|channel| Box::new(open_reader(&io, &memory, channel)) as Box<dyn SortedSource<Pair>>)
        .collect();
    let mut merge = MergeIterator::new(sources, pair_comparator());
    let result = drain(&mut merge).unwrap();
    merge.close().unwrap();

    assert_eq!(result.len(), all.len());
    assert!(result.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(io.channel_file_count().unwrap(), 0);

    memory.release(read_segments);
    memory.release(writer.into_segments());
    assert!(memory.verify_empty());
}

#[test]
fn test_merge_round_failure_deletes_everything() {
    let (_temp, io) = spill_dir();
    let memory = pool(64, PAGE);
    let mut writer = SpillWriter::new(Arc::clone(&io), pair_serializer(), pair_comparator(), memory.allocate(2).unwrap());

    let channels: Vec<SpillChannel> = (1..=5)
        .map(|seed| spill_sorted(&memory, &mut writer, &random_pairs(400, 100, seed), None))
        .collect();
    assert_eq!(io.channel_file_count().unwrap(), 5);

    io.fail_reads_after(3);
    let serializer = pair_serializer();
    let comparator = pair_comparator();
    let mut read_segments = memory.allocate(4).unwrap();
    let result = {
        let mut ctx = RoundContext {
            io: &io,
            memory: &memory,
            serializer: &serializer,
            comparator: &comparator,
            read_segments: &mut read_segments,
            writer: &mut writer,
        };
        merge_rounds(channels, 2, &mut ctx)
    };
    io.clear_faults();

    let err = result.unwrap_err();
    assert!(matches!(err, SortError::Merging { round: 1, .. }));
    assert!(err.is_io());
    assert_eq!(io.channel_file_count().unwrap(), 0);

    memory.release(read_segments);
    memory.release(writer.into_segments());
    assert!(memory.verify_empty());
}

//! Bounded fan-in merge rounds
//!
//! With `n` channels and a fan-in of `f`, one round leaves the first channels
//! untouched and merges the rest in consecutive runs, so that the next round
//! needs as few merges as possible:
//!
//! ```text
//! scale      = ceil(log_f(n)) - 1
//! end        = f^scale                  channels after this round
//! merges     = ceil((n - end) / (f - 1))
//! untouched  = end - merges
//! ```
//!
//! Rounds are repeated until `n <= f`. Channel order is kept: untouched
//! channels first, then the merged runs in their original order.

use std::sync::Arc;

use crate::error::{Result, SortError};
use crate::io::{IoManager, SpillChannel};
use crate::memory::{MemoryManager, MemorySegment};
use crate::spill::{ChannelRecordReader, SpillWriter};
use crate::typeutils::{TypeComparator, TypeSerializer};

use super::MergeIterator;

/// How one round treats a list of channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPlan {
    /// Leading channels carried over unchanged
    pub untouched: usize,
    /// Sizes of the consecutive runs merged into one channel each
    pub runs: Vec<usize>,
}

impl RoundPlan {
    /// Channels left after the round
    pub fn output_channels(&self) -> usize {
        self.untouched + self.runs.len()
    }
}

/// Plan one round over `channels` channels; `None` if they already fit
pub fn plan_round(channels: usize, fan_in: usize) -> Option<RoundPlan> {
    if fan_in < 2 || channels <= fan_in {
        return None;
    }

    // Smallest power of the fan-in not below the channel count, one step down
    let mut end = 1;
    while end * fan_in < channels {
        end *= fan_in;
    }

    let merges = (channels - end).div_ceil(fan_in - 1);
    let untouched = end - merges;
    let to_merge = channels - untouched;
    let per_run = to_merge.div_ceil(merges);

    let mut runs = Vec::with_capacity(merges);
    let mut left = to_merge;
    while left > 0 {
        let run = per_run.min(left);
        runs.push(run);
        left -= run;
    }

    Some(RoundPlan { untouched, runs })
}

/// Everything a merge round needs besides the channels
pub struct RoundContext<'a, T> {
    pub io: &'a Arc<IoManager>,
    pub memory: &'a Arc<MemoryManager>,
    pub serializer: &'a Arc<dyn TypeSerializer<T>>,
    pub comparator: &'a Arc<dyn TypeComparator<T>>,
    /// Read buffers, shared out among the channels of each run
    pub read_segments: &'a mut Vec<MemorySegment>,
    pub writer: &'a mut SpillWriter<T>,
}

/// Merge rounds until at most `fan_in` channels remain; returns the
/// remaining channels and the number of rounds run
///
/// Merged input channels are deleted as soon as they are consumed. On
/// failure every channel handed in or created is deleted.
pub fn merge_rounds<T: Send>(
    mut channels: Vec<SpillChannel>,
    fan_in: usize,
    ctx: &mut RoundContext<'_, T>,
) -> Result<(Vec<SpillChannel>, usize)> {
    let mut round = 0;
    while let Some(plan) = plan_round(channels.len(), fan_in) {
        round += 1;
        tracing::debug!(
            round,
            channels = channels.len(),
            untouched = plan.untouched,
            merges = plan.runs.len(),
            "Starting merge round"
        );
        channels = merge_round(channels, &plan, ctx).map_err(|e| e.merging(round))?;
    }
    Ok((channels, round))
}

fn merge_round<T: Send>(
    channels: Vec<SpillChannel>,
    plan: &RoundPlan,
    ctx: &mut RoundContext<'_, T>,
) -> Result<Vec<SpillChannel>> {
    let mut merged = Vec::with_capacity(plan.output_channels());
    let mut pending = channels.into_iter();
    merged.extend(pending.by_ref().take(plan.untouched));

    for &run in &plan.runs {
        let inputs: Vec<SpillChannel> = pending.by_ref().take(run).collect();
        match merge_run(inputs, ctx) {
            Ok(channel) => merged.push(channel),
            Err(e) => {
                for channel in merged.iter().chain(pending.as_slice()) {
                    if let Err(delete_err) = ctx.io.delete_channel(&channel.id) {
                        tracing::warn!(channel = channel.channel_id(), error = %delete_err, "Failed to delete channel");
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(merged)
}

/// Merge consecutive channels into one, without combining
fn merge_run<T: Send>(inputs: Vec<SpillChannel>, ctx: &mut RoundContext<'_, T>) -> Result<SpillChannel> {
    let per_reader = ctx.read_segments.len() / inputs.len();
    if per_reader == 0 {
        for channel in &inputs {
            if let Err(delete_err) = ctx.io.delete_channel(&channel.id) {
                tracing::warn!(channel = channel.channel_id(), error = %delete_err, "Failed to delete channel");
            }
        }
        return Err(SortError::OutOfMemory {
            requested: inputs.len(),
            available: ctx.read_segments.len(),
        });
    }

    let mut readers = Vec::with_capacity(inputs.len());
    let mut inputs = inputs.into_iter();
    while let Some(channel) = inputs.next() {
        let at = ctx.read_segments.len() - per_reader;
        let segments = ctx.read_segments.split_off(at);
        match ChannelRecordReader::open(
            Arc::clone(ctx.io),
            Arc::clone(ctx.memory),
            Arc::clone(ctx.serializer),
            channel,
            segments,
        ) {
            Ok(reader) => readers.push(reader),
            Err(e) => {
                for channel in inputs {
                    if let Err(delete_err) = ctx.io.delete_channel(&channel.id) {
                        tracing::warn!(channel = channel.channel_id(), error = %delete_err, "Failed to delete channel");
                    }
                }
                return Err(e);
            }
        }
    }

    let mut merge = MergeIterator::new(readers, Arc::clone(ctx.comparator));
    let written = ctx.writer.write_stream(&mut merge);

    let mut closed = Ok(());
    for mut reader in merge.into_sources() {
        if let Err(e) = reader.close_into(ctx.read_segments) {
            if closed.is_ok() {
                closed = Err(e);
            }
        }
    }

    let channel = written?;
    if let Err(e) = closed {
        if let Err(delete_err) = ctx.io.delete_channel(&channel.id) {
            tracing::warn!(channel = channel.channel_id(), error = %delete_err, "Failed to delete channel");
        }
        return Err(e);
    }
    Ok(channel)
}

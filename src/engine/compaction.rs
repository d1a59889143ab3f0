//! Marten - Compaction
//! Background merging of sorted segments. Compaction trades write
//! bandwidth for read bandwidth: without it every point lookup has to
//! probe an ever-growing list of segments.
//!
//! The driver k-way-merges the selected segments' iterators, keeps the
//! highest-sequence record per key, and writes one new segment.
//! Tombstones are physically dropped only below the caller-supplied
//! watermark (no pinned snapshot predates them AND no older segment
//! outside the input set could still be shadowed).
//!
//! Crash safety: the output is built in a temp file and the manifest
//! swap is the final atomic step, so a crash mid-compaction leaves the
//! old segments untouched and only an orphan temp file behind.

use std::path::Path;
use std::sync::Arc;

use crate::engine::merge::{MergeIterator, RecordStream};
use crate::engine::sstable::{SegmentBuilder, SegmentMeta, SegmentReader};
use crate::error::Result;
use crate::types::SeqNo;

/// Decides which segments to merge next.
pub trait CompactionStrategy {
    /// Select segment ids to merge, given live segment metadata
    /// (newest first). `None` means nothing worth compacting.
    fn select(&self, segments: &[SegmentMeta]) -> Option<Vec<u64>>;

    /// Human-readable strategy name, for logs.
    fn name(&self) -> &str;
}

/// Size-tiered selection over the oldest run of segments.
///
/// Picks up to `max_inputs` of the oldest segments whose combined data
/// size stays below `max_input_bytes`. Restricting selection to a
/// contiguous oldest run keeps live segments' sequence ranges disjoint,
/// which is what lets the read path trust newest-first ordering.
pub struct SizeTieredCompaction {
    /// Minimum number of inputs worth merging.
    min_inputs: usize,
    /// Upper bound on inputs per merge.
    max_inputs: usize,
    /// Upper bound on combined input data size.
    max_input_bytes: u64,
}

impl SizeTieredCompaction {
    pub fn new(min_inputs: usize, max_inputs: usize, max_input_bytes: u64) -> Self {
        Self {
            min_inputs: min_inputs.max(2),
            max_inputs,
            max_input_bytes,
        }
    }
}

impl Default for SizeTieredCompaction {
    fn default() -> Self {
        Self::new(4, 8, 256 * 1024 * 1024)
    }
}

impl CompactionStrategy for SizeTieredCompaction {
    fn select(&self, segments: &[SegmentMeta]) -> Option<Vec<u64>> {
        let mut selected = Vec::new();
        let mut total_bytes = 0u64;

        // Walk from the oldest end.
        for meta in segments.iter().rev() {
            if selected.len() >= self.max_inputs {
                break;
            }
            if total_bytes + meta.data_size > self.max_input_bytes && !selected.is_empty() {
                break;
            }
            total_bytes += meta.data_size;
            selected.push(meta.id);
        }

        if selected.len() >= self.min_inputs {
            Some(selected)
        } else {
            None
        }
    }

    fn name(&self) -> &str {
        "SizeTieredCompaction"
    }
}

/// Merge `inputs` into one new segment with id `output_id`.
///
/// Tombstones with `seq < gc_before` are dropped. Returns `None` when
/// every record was dropped (nothing left to write); any mid-merge
/// failure discards the partial output and leaves the inputs valid.
pub fn compact_segments(
    segment_dir: &Path,
    output_id: u64,
    inputs: &[Arc<SegmentReader>],
    gc_before: SeqNo,
) -> Result<Option<SegmentMeta>> {
    let expected: u64 = inputs.iter().map(|s| s.meta().entry_count).sum();
    let mut streams: Vec<RecordStream<'_>> = Vec::with_capacity(inputs.len());
    for segment in inputs {
        streams.push(Box::new(segment.iter()?));
    }
    let merged = MergeIterator::new(streams)?;

    let mut builder = SegmentBuilder::new(segment_dir, output_id, expected as usize)?;
    let mut dropped = 0u64;

    for item in merged {
        let record = match item {
            Ok(record) => record,
            Err(err) => {
                builder.abandon()?;
                return Err(err);
            }
        };
        if record.is_tombstone() && record.seq < gc_before {
            dropped += 1;
            continue;
        }
        if let Err(err) = builder.add(&record.key, record.seq, record.value.as_deref()) {
            builder.abandon()?;
            return Err(err);
        }
    }

    if builder.entry_count() == 0 {
        builder.abandon()?;
        log::info!(
            "compaction of {} segments produced no surviving records",
            inputs.len()
        );
        return Ok(None);
    }

    let meta = builder.finish()?;
    log::info!(
        "compacted {} segments into segment {} ({} entries, {} tombstones purged)",
        inputs.len(),
        meta.id,
        meta.entry_count,
        dropped
    );
    Ok(Some(meta))
}

//! Compaction policy and the k-way segment merge.
//!
//! The policy is binary span doubling: a segment ending at step boundary
//! `endStep` completes a span of `endStep & -endStep` steps, and a merge is
//! due when that span is covered by more than one segment. Small segments
//! therefore merge often and the number of merges to reach any watermark
//! stays logarithmic in the step count.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::index::eliasfano;
use crate::segment::words::WordGetter;
use crate::segment::{Segment, SegmentWriter};

/// Span, in transaction numbers, completed by a segment ending at `end_tx`.
pub fn merge_span(end_tx: u64, step: u64, max_span: u64) -> u64 {
    let end_step = end_tx / step;
    let span_step = end_step & end_step.wrapping_neg();
    (span_step * step).min(max_span)
}

/// Earliest pending merge among `segments` (ascending), bounded by the
/// minimax watermark `max_end_tx`.
pub fn find_merge_range(
    segments: &[Arc<Segment>],
    step: u64,
    max_end_tx: u64,
    max_span: u64,
) -> Option<(u64, u64)> {
    let mut best: Option<(u64, u64)> = None;
    for segment in segments {
        if segment.frozen() || segment.end_tx() > max_end_tx {
            continue;
        }
        let span = merge_span(segment.end_tx(), step, max_span);
        let from = segment.end_tx().saturating_sub(span);
        // More than one segment covers the completed span.
        if from < segment.start_tx() {
            let candidate = (from, segment.end_tx());
            best = match best {
                None => Some(candidate),
                Some((bf, be)) if from < bf || (from == bf && segment.end_tx() > be) => {
                    Some(candidate)
                }
                keep => keep,
            };
        }
    }
    best
}

/// The snapshot segments tiling exactly `[from, to)`; anything else is a
/// consistency error — merging a partial cover would lose data.
pub fn files_in_range(
    snapshot: &[Arc<Segment>],
    from: u64,
    to: u64,
) -> Result<Vec<Arc<Segment>>> {
    let mut inputs: Vec<Arc<Segment>> = snapshot
        .iter()
        .filter(|s| s.start_tx() >= from && s.end_tx() <= to)
        .cloned()
        .collect();
    inputs.sort_by_key(|s| s.start_tx());
    let mut expected = from;
    for segment in &inputs {
        if segment.start_tx() != expected {
            return Err(Error::Consistency(format!(
                "merge inputs do not tile [{}, {}): hole at {}",
                from, to, expected
            )));
        }
        expected = segment.end_tx();
    }
    if expected != to {
        return Err(Error::Consistency(format!(
            "merge inputs do not tile [{}, {}): end at {}",
            from, to, expected
        )));
    }
    Ok(inputs)
}

/// How co-located keys combine during a merge.
pub enum Combiner<'a> {
    /// Keep only the newest value.
    Replace,
    /// Union the Elias-Fano sequences.
    EfUnion,
    /// Commitment collaborator: fold oldest-to-newest through its function.
    Branch(&'a (dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync)),
}

struct HeapEntry<'a> {
    key: &'a [u8],
    value: &'a [u8],
    end_tx: u64,
    getter: WordGetter<'a>,
}

impl<'a> HeapEntry<'a> {
    fn open(segment: &'a Segment) -> Result<Option<Self>> {
        let mut getter = segment.data().getter();
        if !getter.has_next() {
            return Ok(None);
        }
        let key = getter.next()?;
        let value = getter.next()?;
        Ok(Some(Self {
            key,
            value,
            end_tx: segment.end_tx(),
            getter,
        }))
    }

    /// Step to the next (key, value) pair; false once exhausted.
    fn advance(&mut self) -> Result<bool> {
        if !self.getter.has_next() {
            return Ok(false);
        }
        self.key = self.getter.next()?;
        self.value = self.getter.next()?;
        Ok(true)
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.end_tx == other.end_tx
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on key; equal keys pop the larger end_tx (newest) first.
        match self.key.cmp(other.key) {
            Ordering::Equal => self.end_tx.cmp(&other.end_tx),
            order => order.reverse(),
        }
    }
}

/// K-way merge of the inputs' (key, value) streams into `writer`.
///
/// `out_start_tx` drives the tombstone rule: an empty combined value is
/// dropped entirely when the output starts at the oldest retained boundary,
/// unless `keep_empty` claims the key (marker keys backing prefix
/// enumeration survive).
pub fn merge_streams(
    writer: &mut SegmentWriter,
    inputs: &[Arc<Segment>],
    combiner: &Combiner<'_>,
    out_start_tx: u64,
    keep_empty: impl Fn(&[u8]) -> bool,
) -> Result<u64> {
    let mut heap = BinaryHeap::new();
    for segment in inputs {
        if let Some(entry) = HeapEntry::open(segment)? {
            heap.push(entry);
        }
    }

    let mut emitted = 0u64;
    while let Some(top) = heap.pop() {
        let key = top.key.to_vec();

        // Gather every entry co-located on this key, newest first.
        let mut group: Vec<(Vec<u8>, u64)> = vec![(top.value.to_vec(), top.end_tx)];
        let mut cursors = vec![top];
        loop {
            match heap.peek() {
                Some(next) if next.key == key.as_slice() => {}
                _ => break,
            }
            let Some(entry) = heap.pop() else { break };
            group.push((entry.value.to_vec(), entry.end_tx));
            cursors.push(entry);
        }
        for mut cursor in cursors {
            if cursor.advance()? {
                heap.push(cursor);
            }
        }

        let combined = match combiner {
            Combiner::Replace => group.swap_remove(0).0,
            Combiner::EfUnion => {
                let mut iter = group.into_iter();
                let mut acc = iter.next().map(|(v, _)| v).unwrap_or_default();
                for (value, _) in iter {
                    acc = eliasfano::union_bytes(&acc, &value)?;
                }
                acc
            }
            Combiner::Branch(merge) => {
                group.sort_by_key(|&(_, end_tx)| end_tx);
                let mut iter = group.into_iter();
                let mut acc = iter.next().map(|(v, _)| v).unwrap_or_default();
                for (value, _) in iter {
                    acc = merge(&acc, &value)?;
                }
                acc
            }
        };

        if combined.is_empty() && out_start_tx == 0 && !keep_empty(&key) {
            continue;
        }
        writer.add_pair(&key, &combined)?;
        emitted += 1;
    }
    Ok(emitted)
}

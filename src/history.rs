//! Historical values addressable by transaction number.
//!
//! A history owns the paired inverted index: the touch log says *when* a
//! key changed, the value segments say what the value was *before* that
//! change. A point-in-time read finds the first recorded touch at or after
//! the asked transaction and returns the previous value captured there.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::files::FileKind;
use crate::hot::PlainTable;
use crate::inverted::InvertedIndex;
use crate::merge;
use crate::segment::{open_registry, Segment, SegmentRegistry, SegmentWriter};

/// Three-way outcome of a historical read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryReadout {
    /// The key held this value at the asked transaction.
    Value(Vec<u8>),
    /// The key existed in history but held no value (deleted).
    Deleted,
    /// No recorded touch at or after the asked transaction; the caller
    /// must consult the live state.
    NoHistory,
}

/// Index key of a history value: `txNum || key`.
fn value_index_key(tx_num: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(key);
    out
}

/// Hot row key: `len(key) || key || txNum`, so one key's rows sort by txNum.
fn hot_row_key(key: &[u8], tx_num: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + 8);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out
}

pub struct History {
    name: String,
    dir: PathBuf,
    step: u64,
    max_span: u64,
    inverted: InvertedIndex,
    /// Hot previous-value rows, keyed [`hot_row_key`].
    vals: PlainTable,
    value_segments: RwLock<SegmentRegistry>,
}

pub struct HistoryFiles {
    pub ef: Arc<Segment>,
    pub values: Arc<Segment>,
}

/// Merged segments for both halves, built but not yet swapped in.
pub(crate) struct PreparedMerge {
    from: u64,
    to: u64,
    ef_inputs: Vec<(u64, u64)>,
    value_inputs: Vec<(u64, u64)>,
    ef: Arc<Segment>,
    values: Arc<Segment>,
}

impl History {
    pub fn open(dir: &Path, name: &str, step: u64, max_span: u64) -> Result<History> {
        let inverted = InvertedIndex::open(dir, name, step, max_span)?;
        let value_segments = open_registry(
            dir,
            name,
            FileKind::HistoryValues,
            FileKind::HistoryIndex,
            step,
            max_span,
        )?;
        Ok(History {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            step,
            max_span,
            inverted,
            vals: PlainTable::new(),
            value_segments: RwLock::new(value_segments),
        })
    }

    pub fn inverted(&self) -> &InvertedIndex {
        &self.inverted
    }

    fn read_values(&self) -> Result<std::sync::RwLockReadGuard<'_, SegmentRegistry>> {
        self.value_segments.read().map_err(|_| Error::LockPoisoned)
    }

    fn write_values(&self) -> Result<std::sync::RwLockWriteGuard<'_, SegmentRegistry>> {
        self.value_segments.write().map_err(|_| Error::LockPoisoned)
    }

    pub fn value_segment_count(&self) -> Result<usize> {
        Ok(self.read_values()?.len())
    }

    pub fn max_end_tx(&self) -> Result<u64> {
        let ef = self.inverted.max_end_tx()?;
        let values = self.read_values()?.max_end_tx();
        Ok(ef.min(values))
    }

    /// Record the value `prev` held by `key` before it changes at `tx_num`.
    /// Must run before the overwrite lands in the hot store.
    pub fn add_prev(&self, tx_num: u64, key: &[u8], prev: &[u8]) {
        self.inverted.add(tx_num, key);
        self.vals.put(&hot_row_key(key, tx_num), prev);
    }

    /// Touched keys and their txNums for the range; values stay in the hot
    /// rows until `build_files` reads them out.
    pub fn collate(&self, tx_from: u64, tx_to: u64) -> Result<BTreeMap<Vec<u8>, Vec<u64>>> {
        self.inverted.collate(tx_from, tx_to)
    }

    /// Build both halves for one step: the `.ef`/`.efi` pair and the
    /// `.v`/`.vi` pair whose index maps `txNum || key` to the value word.
    pub fn build_files(
        &self,
        step_num: u64,
        collation: &BTreeMap<Vec<u8>, Vec<u64>>,
    ) -> Result<HistoryFiles> {
        let ef = self.inverted.build_files(step_num, collation)?;

        let mut writer = SegmentWriter::create(
            &self.dir,
            &self.name,
            step_num,
            step_num + 1,
            self.step,
            FileKind::HistoryValues,
            FileKind::HistoryIndex,
        )?;
        let mut write_all = || -> Result<()> {
            for (key, txs) in collation {
                for &tx in txs {
                    let value = self.vals.get(&hot_row_key(key, tx)).ok_or_else(|| {
                        Error::Consistency(format!(
                            "touch of key {:02x?} at tx {} has no recorded previous value",
                            key, tx
                        ))
                    })?;
                    writer.add_indexed_word(&value_index_key(tx, key), &value)?;
                }
            }
            Ok(())
        };
        if let Err(e) = write_all() {
            writer.abort();
            ef.retire();
            return Err(e);
        }
        match writer.finish(self.step >= self.max_span) {
            Ok(values) => Ok(HistoryFiles { ef, values }),
            Err(e) => {
                ef.retire();
                Err(e)
            }
        }
    }

    pub fn integrate(&self, files: HistoryFiles) -> Result<()> {
        self.inverted.integrate(files.ef)?;
        self.write_values()?.insert(files.values);
        Ok(())
    }

    /// Value held by `key` at `tx_num` (exclusive of changes at later
    /// transactions), or how the lookup failed.
    pub fn get(&self, key: &[u8], tx_num: u64) -> Result<HistoryReadout> {
        let ef_snapshot = self.inverted.snapshot()?;
        if let Some(touch_tx) = self.inverted.seek_in(&ef_snapshot, key, tx_num)? {
            let value = self.value_at(key, touch_tx)?;
            return Ok(readout(value));
        }

        // Touches not yet collated live in the hot rows.
        let start = hot_row_key(key, tx_num);
        let prefix_len = 4 + key.len();
        if let Some((row_key, value)) = self.vals.seek(&start) {
            if row_key.len() == prefix_len + 8 && row_key[..prefix_len] == start[..prefix_len] {
                return Ok(readout(value));
            }
        }
        Ok(HistoryReadout::NoHistory)
    }

    /// Fetch the value recorded at a touch known to exist.
    fn value_at(&self, key: &[u8], touch_tx: u64) -> Result<Vec<u8>> {
        let snapshot = self.read_values()?.snapshot();
        let segment = snapshot
            .iter()
            .find(|s| s.start_tx() <= touch_tx && touch_tx < s.end_tx())
            .ok_or_else(|| {
                Error::Consistency(format!(
                    "touch at tx {} has no covering history value segment",
                    touch_tx
                ))
            })?;
        let index_key = value_index_key(touch_tx, key);
        let offset = segment.index().lookup(&index_key).ok_or_else(|| {
            Error::Consistency(format!(
                "history value segment [{}, {}) has an empty index",
                segment.start_tx(),
                segment.end_tx()
            ))
        })?;
        segment.word_at(offset)
    }

    /// Drop hot rows for a collated range.
    pub fn prune(&self, tx_from: u64, tx_to: u64) -> Result<usize> {
        let removed_touches = self.inverted.prune(tx_from, tx_to)?;
        self.vals.remove_if(|row_key, _| {
            let tx = BigEndian::read_u64(&row_key[row_key.len() - 8..]);
            tx >= tx_from && tx < tx_to
        });
        Ok(removed_touches)
    }

    /// Range both halves agree is due for merging, or an invariant
    /// violation when they diverge.
    pub fn pending_range(&self, max_end_tx: u64) -> Result<Option<(u64, u64)>> {
        let ef_range = self.inverted.find_merge_range(max_end_tx)?;
        let values_snapshot = self.read_values()?.snapshot();
        let values_range =
            merge::find_merge_range(&values_snapshot, self.step, max_end_tx, self.max_span);
        match (ef_range, values_range) {
            (None, None) => Ok(None),
            (Some(a), Some(b)) if a == b => Ok(Some(a)),
            (a, b) => Err(Error::MergeMismatch(format!(
                "history {} halves diverge: ef wants {:?}, values want {:?}",
                self.name, a, b
            ))),
        }
    }

    pub fn merge_once(&self, max_end_tx: u64) -> Result<Option<(u64, u64)>> {
        let Some((from, to)) = self.pending_range(max_end_tx)? else {
            return Ok(None);
        };
        let prepared = self.prepare_merge(from, to)?;
        self.commit_merge(prepared)?;
        Ok(Some((from, to)))
    }

    /// Build the merged `[from, to)` segments for both halves. Neither
    /// registry is touched until [`History::commit_merge`], so a failure
    /// here leaves the history exactly as it was.
    pub(crate) fn prepare_merge(&self, from: u64, to: u64) -> Result<PreparedMerge> {
        let ef_snapshot = self.inverted.snapshot()?;
        let ef_inputs = merge::files_in_range(&ef_snapshot, from, to)?;
        let values_snapshot = self.read_values()?.snapshot();
        let value_inputs = merge::files_in_range(&values_snapshot, from, to)?;

        let ef = self.inverted.build_merged(&ef_inputs, from, to)?;
        let values = match self.build_merged_values(&ef, &value_inputs, from, to) {
            Ok(values) => values,
            Err(e) => {
                ef.retire();
                return Err(e);
            }
        };
        Ok(PreparedMerge {
            from,
            to,
            ef_inputs: ef_inputs.iter().map(|s| s.range()).collect(),
            value_inputs: value_inputs.iter().map(|s| s.range()).collect(),
            ef,
            values,
        })
    }

    /// Swap both prepared segments into their registries. The only failures
    /// left here are lock poisoning and registry-shape violations.
    pub(crate) fn commit_merge(&self, prepared: PreparedMerge) -> Result<()> {
        let PreparedMerge {
            from,
            to,
            ef_inputs,
            value_inputs,
            ef,
            values,
        } = prepared;
        self.inverted.commit_merge(&ef_inputs, ef)?;
        self.write_values()?.replace(&value_inputs, values)?;
        tracing::info!(component = %self.name, from, to, "Merged history segments");
        Ok(())
    }

    /// Re-emit values for every touch in the merged sequence segment, in
    /// key order, each key's touches ascending.
    fn build_merged_values(
        &self,
        merged_ef: &Segment,
        value_inputs: &[Arc<Segment>],
        from: u64,
        to: u64,
    ) -> Result<Arc<Segment>> {
        let mut writer = SegmentWriter::create(
            &self.dir,
            &self.name,
            from / self.step,
            to / self.step,
            self.step,
            FileKind::HistoryValues,
            FileKind::HistoryIndex,
        )?;
        let mut write_all = || -> Result<()> {
            let mut getter = merged_ef.data().getter();
            while getter.has_next() {
                let key = getter.next()?.to_vec();
                let sequence =
                    crate::index::eliasfano::EliasFano::from_bytes(getter.next()?)?;
                for tx in sequence.iter() {
                    let input = value_inputs
                        .iter()
                        .find(|s| s.start_tx() <= tx && tx < s.end_tx())
                        .ok_or_else(|| {
                            Error::Consistency(format!(
                                "merged touch at tx {} not covered by any value input",
                                tx
                            ))
                        })?;
                    let index_key = value_index_key(tx, &key);
                    let offset = input.index().lookup(&index_key).ok_or_else(|| {
                        Error::Consistency(format!(
                            "value input [{}, {}) has an empty index",
                            input.start_tx(),
                            input.end_tx()
                        ))
                    })?;
                    let value = input.word_at(offset)?;
                    writer.add_indexed_word(&index_key, &value)?;
                }
            }
            Ok(())
        };
        if let Err(e) = write_all() {
            writer.abort();
            return Err(e);
        }
        writer.finish(to - from >= self.max_span)
    }
}

fn readout(value: Vec<u8>) -> HistoryReadout {
    if value.is_empty() {
        HistoryReadout::Deleted
    } else {
        HistoryReadout::Value(value)
    }
}

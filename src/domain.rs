//! Latest-value store per key, with its change history captured on every
//! overwrite.
//!
//! Reads check the hot store first, then walk the segment chain newest to
//! oldest; the first hit wins and an empty value reads as deleted. Writes
//! record the previous value into the paired history *before* the new
//! value lands in the hot store, so collation can never observe a write
//! whose provenance is missing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::files::FileKind;
use crate::history::History;
use crate::hot::PlainTable;
use crate::index::btree::StaticTree;
use crate::merge::{self, Combiner};
use crate::segment::{open_registry, Segment, SegmentRegistry, SegmentWriter};

/// Commitment collaborator hook: folds an older branch value into a newer
/// one during merges of the commitment component.
pub type BranchMerge = Arc<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Step number with its bits flipped: hot rows for one key then sort
/// newest step first.
fn inverted_step(tx_num: u64, step: u64) -> u64 {
    !(tx_num / step)
}

/// Hot change row key: `len(key) || key || invertedStep`.
fn change_row_key(key: &[u8], inv_step: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + 8);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&inv_step.to_be_bytes());
    out
}

pub struct Domain {
    name: String,
    dir: PathBuf,
    step: u64,
    max_span: u64,
    /// When non-zero, a bare key of exactly this length is an enumeration
    /// marker and survives merges even when empty.
    prefix_len: usize,
    branching: u64,
    /// Hot change rows, keyed [`change_row_key`].
    changes: PlainTable,
    history: History,
    segments: RwLock<SegmentRegistry>,
    branch_merge: Option<BranchMerge>,
}

impl Domain {
    pub fn open(
        dir: &Path,
        name: &str,
        step: u64,
        max_span: u64,
        prefix_len: usize,
        branching: u64,
        branch_merge: Option<BranchMerge>,
    ) -> Result<Domain> {
        let history = History::open(dir, name, step, max_span)?;
        let segments = open_registry(
            dir,
            name,
            FileKind::Values,
            FileKind::ValuesIndex,
            step,
            max_span,
        )?;
        Ok(Domain {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            step,
            max_span,
            prefix_len,
            branching,
            changes: PlainTable::new(),
            history,
            segments: RwLock::new(segments),
            branch_merge,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    fn read_registry(&self) -> Result<std::sync::RwLockReadGuard<'_, SegmentRegistry>> {
        self.segments.read().map_err(|_| Error::LockPoisoned)
    }

    fn write_registry(&self) -> Result<std::sync::RwLockWriteGuard<'_, SegmentRegistry>> {
        self.segments.write().map_err(|_| Error::LockPoisoned)
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.read_registry()?.len())
    }

    /// Highest txNum fully covered across the value segments and both
    /// history halves.
    pub fn max_end_tx(&self) -> Result<u64> {
        let values = self.read_registry()?.max_end_tx();
        Ok(values.min(self.history.max_end_tx()?))
    }

    /// Latest value, empty meaning deleted mapped to `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = match self.hot_get(key) {
            Some(value) => value,
            None => match self.read_from_files(key)? {
                Some(value) => value,
                None => return Ok(None),
            },
        };
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    /// Newest hot value for `key`, if any step still holds one.
    fn hot_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut prefix = Vec::with_capacity(4 + key.len());
        prefix.extend_from_slice(&(key.len() as u32).to_be_bytes());
        prefix.extend_from_slice(key);
        let (row_key, value) = self.changes.seek(&prefix)?;
        if row_key.len() == prefix.len() + 8 && row_key.starts_with(&prefix) {
            Some(value)
        } else {
            None
        }
    }

    /// Scan segments newest to oldest; the first segment knowing the key
    /// answers, even with an empty (deleted) value.
    fn read_from_files(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = self.read_registry()?.snapshot();
        for segment in snapshot.iter().rev() {
            if let Some(value) = segment.lookup(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Write `value` at `tx_num`, capturing the value it overwrites into
    /// history first.
    pub fn put(&self, tx_num: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let original = self.latest_raw(key)?;
        self.history.add_prev(tx_num, key, &original);
        self.changes
            .put(&change_row_key(key, inverted_step(tx_num, self.step)), value);
        Ok(())
    }

    /// Deletion is a put of the empty value.
    pub fn delete(&self, tx_num: u64, key: &[u8]) -> Result<()> {
        self.put(tx_num, key, &[])
    }

    /// Current value with deletion represented as empty, for history capture.
    fn latest_raw(&self, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(value) = self.hot_get(key) {
            return Ok(value);
        }
        Ok(self.read_from_files(key)?.unwrap_or_default())
    }

    /// Latest value per key written during one step.
    pub fn collate(&self, step_num: u64) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let inv = inverted_step(step_num * self.step, self.step);
        let mut values = BTreeMap::new();
        self.changes.scan_all(|row_key, value| {
            let row_inv = BigEndian::read_u64(&row_key[row_key.len() - 8..]);
            if row_inv != inv {
                return;
            }
            let klen = BigEndian::read_u32(&row_key[0..4]) as usize;
            values.insert(row_key[4..4 + klen].to_vec(), value.to_vec());
        });
        Ok(values)
    }

    pub fn build_files(
        &self,
        step_num: u64,
        values: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<Arc<Segment>> {
        let mut writer = SegmentWriter::create(
            &self.dir,
            &self.name,
            step_num,
            step_num + 1,
            self.step,
            FileKind::Values,
            FileKind::ValuesIndex,
        )?;
        for (key, value) in values {
            if let Err(e) = writer.add_pair(key, value) {
                writer.abort();
                return Err(e);
            }
        }
        let segment = writer.finish(self.step >= self.max_span)?;
        tracing::info!(component = %self.name, step = step_num, keys = values.len(), "Built domain segment");
        Ok(segment)
    }

    pub fn integrate(&self, segment: Arc<Segment>) -> Result<()> {
        self.write_registry()?.insert(segment);
        Ok(())
    }

    /// Drop hot change rows for every step up to and including `step_num`.
    pub fn prune(&self, step_num: u64) -> Result<usize> {
        let inv = inverted_step(step_num * self.step, self.step);
        let removed = self.changes.remove_if(|row_key, _| {
            BigEndian::read_u64(&row_key[row_key.len() - 8..]) >= inv
        });
        if removed > 0 {
            tracing::debug!(component = %self.name, step = step_num, removed, "Pruned change rows");
        }
        Ok(removed)
    }

    /// All live keys under `prefix`, newest value per key, deletions and
    /// enumeration markers elided. Segments are positioned with the static
    /// search tree; the hot rows overwrite on top.
    pub fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut combined: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        let snapshot = self.read_registry()?.snapshot();
        for segment in &snapshot {
            let offsets = segment.pair_key_offsets()?;
            let tree = StaticTree::new(offsets.len() as u64, self.branching);
            let found = tree.seek(|i| {
                let key = segment.key_at(offsets[i as usize])?;
                Ok(key.cmp(prefix))
            })?;
            let mut getter = segment.data().getter();
            for &offset in &offsets[found.index as usize..] {
                getter.reset(offset);
                let key = getter.next()?;
                if !key.starts_with(prefix) {
                    break;
                }
                let value = getter.next()?;
                combined.insert(key.to_vec(), value.to_vec());
            }
        }

        // Hot rows are newest; for one key the first row is the newest step.
        let mut seen_hot: Option<Vec<u8>> = None;
        self.changes.scan_all(|row_key, value| {
            let klen = BigEndian::read_u32(&row_key[0..4]) as usize;
            let key = &row_key[4..4 + klen];
            if !key.starts_with(prefix) {
                return;
            }
            if seen_hot.as_deref() == Some(key) {
                return;
            }
            seen_hot = Some(key.to_vec());
            combined.insert(key.to_vec(), value.to_vec());
        });

        Ok(combined
            .into_iter()
            .filter(|(key, value)| !value.is_empty() && key.len() != self.prefix_len)
            .collect())
    }

    /// Merge the domain values and the paired history over the range all
    /// parts agree on; disagreement is an invariant violation.
    pub fn merge_once(&self, max_end_tx: u64) -> Result<Option<(u64, u64)>> {
        let snapshot = self.read_registry()?.snapshot();
        let values_range = merge::find_merge_range(&snapshot, self.step, max_end_tx, self.max_span);
        let history_range = self.history.pending_range(max_end_tx)?;

        let (from, to) = match (values_range, history_range) {
            (None, None) => return Ok(None),
            (Some(a), Some(b)) if a == b => a,
            (a, b) => {
                return Err(Error::MergeMismatch(format!(
                    "domain {} and its history diverge: values want {:?}, history wants {:?}",
                    self.name, a, b
                )))
            }
        };

        let inputs = merge::files_in_range(&snapshot, from, to)?;
        let mut writer = SegmentWriter::create(
            &self.dir,
            &self.name,
            from / self.step,
            to / self.step,
            self.step,
            FileKind::Values,
            FileKind::ValuesIndex,
        )?;
        let combiner = match &self.branch_merge {
            Some(f) => Combiner::Branch(&**f),
            None => Combiner::Replace,
        };
        let keep_empty =
            |key: &[u8]| self.prefix_len > 0 && key.len() == self.prefix_len;
        if let Err(e) = merge::merge_streams(&mut writer, &inputs, &combiner, from, keep_empty) {
            writer.abort();
            return Err(e);
        }
        let merged = writer.finish(to - from >= self.max_span)?;

        // Build every companion output before swapping any registry, so a
        // failure part-way leaves the domain and its history in agreement.
        let prepared = match self.history.prepare_merge(from, to) {
            Ok(prepared) => prepared,
            Err(e) => {
                merged.retire();
                return Err(e);
            }
        };

        let ranges: Vec<(u64, u64)> = inputs.iter().map(|s| s.range()).collect();
        self.write_registry()?.replace(&ranges, merged)?;
        self.history.commit_merge(prepared)?;
        tracing::info!(component = %self.name, from, to, "Merged domain segments");
        Ok(Some((from, to)))
    }
}

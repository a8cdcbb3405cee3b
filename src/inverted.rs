//! Inverted index: per key, the sorted set of transaction numbers at which
//! the key was touched, Elias-Fano encoded and chunked into step segments.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::files::FileKind;
use crate::hot::DupTable;
use crate::index::eliasfano::{EliasFano, EliasFanoBuilder};
use crate::merge::{self, Combiner};
use crate::segment::{open_registry, Segment, SegmentRegistry, SegmentWriter};

pub struct InvertedIndex {
    name: String,
    dir: PathBuf,
    step: u64,
    max_span: u64,
    /// Hot touch log: txNum -> key.
    touch: DupTable,
    segments: RwLock<SegmentRegistry>,
}

impl InvertedIndex {
    pub fn open(dir: &Path, name: &str, step: u64, max_span: u64) -> Result<InvertedIndex> {
        fs::create_dir_all(dir)?;
        let segments = open_registry(dir, name, FileKind::Ef, FileKind::EfIndex, step, max_span)?;
        Ok(InvertedIndex {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            step,
            max_span,
            touch: DupTable::new(),
            segments: RwLock::new(segments),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record that `key` was touched at `tx_num`.
    pub fn add(&self, tx_num: u64, key: &[u8]) {
        self.touch.insert(&tx_num.to_be_bytes(), key);
    }

    pub fn max_end_tx(&self) -> Result<u64> {
        Ok(self.read_registry()?.max_end_tx())
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.read_registry()?.len())
    }

    pub fn snapshot(&self) -> Result<Vec<Arc<Segment>>> {
        Ok(self.read_registry()?.snapshot())
    }

    fn read_registry(&self) -> Result<std::sync::RwLockReadGuard<'_, SegmentRegistry>> {
        self.segments.read().map_err(|_| Error::LockPoisoned)
    }

    fn write_registry(&self) -> Result<std::sync::RwLockWriteGuard<'_, SegmentRegistry>> {
        self.segments.write().map_err(|_| Error::LockPoisoned)
    }

    /// Per-key sorted txNum sets for `[tx_from, tx_to)`, from the touch log.
    pub fn collate(&self, tx_from: u64, tx_to: u64) -> Result<BTreeMap<Vec<u8>, Vec<u64>>> {
        let mut bitmap: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
        self.touch.scan_all(|tx_bytes, key| {
            let tx = BigEndian::read_u64(tx_bytes);
            if tx < tx_from || tx >= tx_to {
                return;
            }
            let txs = bitmap.entry(key.to_vec()).or_default();
            if txs.last() != Some(&tx) {
                txs.push(tx);
            }
        });
        Ok(bitmap)
    }

    /// Write the collation into a fresh `.ef` + `.efi` pair for one step.
    pub fn build_files(
        &self,
        step_num: u64,
        collation: &BTreeMap<Vec<u8>, Vec<u64>>,
    ) -> Result<Arc<Segment>> {
        let mut writer = SegmentWriter::create(
            &self.dir,
            &self.name,
            step_num,
            step_num + 1,
            self.step,
            FileKind::Ef,
            FileKind::EfIndex,
        )?;
        for (key, txs) in collation {
            let sequence = encode_sequence(txs)?;
            if let Err(e) = writer.add_pair(key, &sequence) {
                writer.abort();
                return Err(e);
            }
        }
        let segment = writer.finish(self.step >= self.max_span)?;
        tracing::info!(
            component = %self.name,
            step = step_num,
            keys = collation.len(),
            "Built inverted index segment"
        );
        Ok(segment)
    }

    pub fn integrate(&self, segment: Arc<Segment>) -> Result<()> {
        self.write_registry()?.insert(segment);
        Ok(())
    }

    /// First recorded touch of `key` at or after `tx_num`, searching the
    /// segment chain oldest-first.
    pub fn seek(&self, key: &[u8], tx_num: u64) -> Result<Option<u64>> {
        let snapshot = self.snapshot()?;
        self.seek_in(&snapshot, key, tx_num)
    }

    pub fn seek_in(
        &self,
        snapshot: &[Arc<Segment>],
        key: &[u8],
        tx_num: u64,
    ) -> Result<Option<u64>> {
        for segment in snapshot {
            // All touches in this segment precede the target.
            if segment.end_tx() <= tx_num {
                continue;
            }
            if let Some(sequence) = segment.lookup(key)? {
                let ef = EliasFano::from_bytes(&sequence)?;
                if let Some(tx) = ef.search(tx_num) {
                    return Ok(Some(tx));
                }
            }
        }
        Ok(None)
    }

    /// Full recorded sequence for `key` within one segment, if present.
    pub fn sequence_in(segment: &Segment, key: &[u8]) -> Result<Option<EliasFano>> {
        match segment.lookup(key)? {
            Some(bytes) => Ok(Some(EliasFano::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop hot touch rows for a collated range.
    pub fn prune(&self, tx_from: u64, tx_to: u64) -> Result<usize> {
        let removed = self
            .touch
            .remove_key_range(&tx_from.to_be_bytes(), &tx_to.to_be_bytes());
        if removed > 0 {
            tracing::debug!(component = %self.name, tx_from, tx_to, removed, "Pruned touch log");
        }
        Ok(removed)
    }

    pub fn find_merge_range(&self, max_end_tx: u64) -> Result<Option<(u64, u64)>> {
        let snapshot = self.snapshot()?;
        Ok(merge::find_merge_range(
            &snapshot,
            self.step,
            max_end_tx,
            self.max_span,
        ))
    }

    /// Merge the segments tiling `[from, to)` into one, unioning sequences
    /// of co-located keys. Inputs are retired after the registry swap.
    pub fn merge(&self, from: u64, to: u64) -> Result<()> {
        let snapshot = self.snapshot()?;
        let inputs = merge::files_in_range(&snapshot, from, to)?;
        let merged = self.build_merged(&inputs, from, to)?;
        let ranges: Vec<(u64, u64)> = inputs.iter().map(|s| s.range()).collect();
        self.commit_merge(&ranges, merged)?;
        tracing::info!(component = %self.name, from, to, inputs = ranges.len(), "Merged inverted index segments");
        Ok(())
    }

    /// Build the merged `[from, to)` segment without touching the registry.
    /// Callers that merge companion components build every output first and
    /// swap the registries only once all of them exist.
    pub(crate) fn build_merged(
        &self,
        inputs: &[Arc<Segment>],
        from: u64,
        to: u64,
    ) -> Result<Arc<Segment>> {
        let mut writer = SegmentWriter::create(
            &self.dir,
            &self.name,
            from / self.step,
            to / self.step,
            self.step,
            FileKind::Ef,
            FileKind::EfIndex,
        )?;
        if let Err(e) = merge::merge_streams(&mut writer, inputs, &Combiner::EfUnion, from, |_| false)
        {
            writer.abort();
            return Err(e);
        }
        writer.finish(to - from >= self.max_span)
    }

    /// Swap `merged` in for the input ranges it replaces.
    pub(crate) fn commit_merge(&self, inputs: &[(u64, u64)], merged: Arc<Segment>) -> Result<()> {
        self.write_registry()?.replace(inputs, merged)
    }
}

fn encode_sequence(txs: &[u64]) -> Result<Vec<u8>> {
    let max = txs.last().copied().unwrap_or(0);
    let mut builder = EliasFanoBuilder::new(txs.len() as u64, max)?;
    for &tx in txs {
        builder.push(tx)?;
    }
    Ok(builder.build()?.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_index(dir: &Path) -> InvertedIndex {
        InvertedIndex::open(dir, "logaddrs", 4, 1 << 20).unwrap()
    }

    fn collate_step(index: &InvertedIndex, step_num: u64) {
        let collation = index.collate(step_num * 4, (step_num + 1) * 4).unwrap();
        let segment = index.build_files(step_num, &collation).unwrap();
        index.integrate(segment).unwrap();
        index.prune(step_num * 4, (step_num + 1) * 4).unwrap();
    }

    #[test]
    fn test_collate_orders_and_dedups() {
        let dir = TempDir::new().unwrap();
        let index = open_index(dir.path());
        index.add(3, b"addr1");
        index.add(1, b"addr1");
        index.add(1, b"addr1");
        index.add(2, b"addr2");
        index.add(7, b"addr1"); // outside the range

        let collation = index.collate(0, 4).unwrap();
        assert_eq!(collation.len(), 2);
        assert_eq!(collation[b"addr1".as_slice()], vec![1, 3]);
        assert_eq!(collation[b"addr2".as_slice()], vec![2]);
    }

    #[test]
    fn test_build_and_seek() {
        let dir = TempDir::new().unwrap();
        let index = open_index(dir.path());
        index.add(1, b"addr1");
        index.add(3, b"addr1");
        index.add(2, b"addr2");
        collate_step(&index, 0);

        assert_eq!(index.seek(b"addr1", 0).unwrap(), Some(1));
        assert_eq!(index.seek(b"addr1", 2).unwrap(), Some(3));
        assert_eq!(index.seek(b"addr1", 4).unwrap(), None);
        assert_eq!(index.seek(b"addr2", 2).unwrap(), Some(2));
        assert_eq!(index.seek(b"missing", 0).unwrap(), None);
    }

    #[test]
    fn test_prune_clears_touch_log() {
        let dir = TempDir::new().unwrap();
        let index = open_index(dir.path());
        index.add(1, b"addr1");
        index.add(5, b"addr1");
        collate_step(&index, 0);

        // Only the un-collated touch remains.
        let remaining = index.collate(0, 100).unwrap();
        assert_eq!(remaining[b"addr1".as_slice()], vec![5]);
    }

    #[test]
    fn test_merge_unions_sequences() {
        let dir = TempDir::new().unwrap();
        let index = open_index(dir.path());
        index.add(1, b"addr1");
        index.add(2, b"addr1");
        collate_step(&index, 0);
        index.add(5, b"addr1");
        index.add(6, b"addr2");
        collate_step(&index, 1);

        let range = index.find_merge_range(8).unwrap();
        assert_eq!(range, Some((0, 8)));
        index.merge(0, 8).unwrap();
        assert_eq!(index.segment_count().unwrap(), 1);

        let snapshot = index.snapshot().unwrap();
        let merged = InvertedIndex::sequence_in(&snapshot[0], b"addr1")
            .unwrap()
            .unwrap();
        assert_eq!(merged.iter().collect::<Vec<_>>(), vec![1, 2, 5]);
        assert_eq!(index.seek(b"addr2", 0).unwrap(), Some(6));
    }

    #[test]
    fn test_registry_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let index = open_index(dir.path());
            index.add(1, b"addr1");
            collate_step(&index, 0);
        }
        let reopened = open_index(dir.path());
        assert_eq!(reopened.max_end_tx().unwrap(), 4);
        assert_eq!(reopened.seek(b"addr1", 0).unwrap(), Some(1));
    }
}

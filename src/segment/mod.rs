//! Immutable step segments and the per-component registry.
//!
//! A segment couples one sealed word file with its perfect-hash index and
//! covers a half-open transaction range. Registries hold `Arc`s; reader
//! snapshots clone those `Arc`s under a read lock, so a superseded segment's
//! files are unlinked only when the last holder drops it.

pub mod words;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::files::{scan_component, FileKind, SegmentName};
use crate::index::hash::{HashIndex, HashIndexBuilder};
use words::{WordFile, WordWriter};

pub struct Segment {
    start_tx: u64,
    end_tx: u64,
    data: WordFile,
    index: HashIndex,
    /// Reached the maximum merge span; never a merge input again.
    frozen: bool,
    delete_on_drop: AtomicBool,
    /// Offsets of the key words in a key/value layout, built on first
    /// ordered access (static-tree seeks).
    key_offsets: std::sync::OnceLock<Vec<u64>>,
}

impl Segment {
    pub fn open(
        data_path: &Path,
        index_path: &Path,
        start_tx: u64,
        end_tx: u64,
        frozen: bool,
    ) -> Result<Segment> {
        if start_tx >= end_tx {
            return Err(Error::Consistency(format!(
                "segment {} has empty range [{}, {})",
                data_path.display(),
                start_tx,
                end_tx
            )));
        }
        Ok(Segment {
            start_tx,
            end_tx,
            data: WordFile::open(data_path)?,
            index: HashIndex::open(index_path)?,
            frozen,
            delete_on_drop: AtomicBool::new(false),
            key_offsets: std::sync::OnceLock::new(),
        })
    }

    pub fn start_tx(&self) -> u64 {
        self.start_tx
    }

    pub fn end_tx(&self) -> u64 {
        self.end_tx
    }

    pub fn range(&self) -> (u64, u64) {
        (self.start_tx, self.end_tx)
    }

    pub fn frozen(&self) -> bool {
        self.frozen
    }

    pub fn data(&self) -> &WordFile {
        &self.data
    }

    pub fn index(&self) -> &HashIndex {
        &self.index
    }

    /// Point lookup in the key/value word layout: the indexed offset is the
    /// key word, verified before its paired value word is returned.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(offset) = self.index.lookup(key) else {
            return Ok(None);
        };
        let mut getter = self.data.getter();
        getter.reset(offset);
        if !getter.has_next() || !getter.match_word(key)? {
            return Ok(None);
        }
        Ok(Some(getter.next()?.to_vec()))
    }

    /// Word at an index-resolved offset, for layouts that index value words
    /// directly.
    pub fn word_at(&self, offset: u64) -> Result<Vec<u8>> {
        let mut getter = self.data.getter();
        getter.reset(offset);
        Ok(getter.next()?.to_vec())
    }

    /// Offsets of the key words in a key/value layout, cached after the
    /// first call. Sorted key order makes them the data references of the
    /// static search tree.
    pub fn pair_key_offsets(&self) -> Result<&[u64]> {
        if let Some(offsets) = self.key_offsets.get() {
            return Ok(offsets);
        }
        let mut offsets = Vec::with_capacity((self.data.count() / 2) as usize);
        let mut getter = self.data.getter();
        while getter.has_next() {
            offsets.push(getter.offset());
            getter.skip()?; // key
            getter.skip()?; // value
        }
        let _ = self.key_offsets.set(offsets);
        Ok(self.key_offsets.get().map(|v| v.as_slice()).unwrap_or(&[]))
    }

    /// Key word at one of the cached key offsets.
    pub fn key_at(&self, offset: u64) -> Result<&[u8]> {
        let mut getter = self.data.getter();
        getter.reset(offset);
        getter.next()
    }

    /// Schedule file removal for when the last reference drops.
    pub fn retire(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            for path in [self.data.path().to_path_buf(), self.index.path().to_path_buf()] {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove retired segment file");
                }
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("start_tx", &self.start_tx)
            .field("end_tx", &self.end_tx)
            .field("frozen", &self.frozen)
            .finish()
    }
}

/// Builds one segment: data words plus the paired hash index, sealed and
/// reopened read-only. `abort` removes whatever was written.
pub struct SegmentWriter {
    writer: WordWriter,
    index: HashIndexBuilder,
    data_path: PathBuf,
    index_path: PathBuf,
    start_tx: u64,
    end_tx: u64,
}

impl SegmentWriter {
    pub fn create(
        dir: &Path,
        component: &str,
        start_step: u64,
        end_step: u64,
        step: u64,
        data_kind: FileKind,
        index_kind: FileKind,
    ) -> Result<SegmentWriter> {
        let data_path = SegmentName::new(component, start_step, end_step, data_kind).path(dir);
        let index_path = SegmentName::new(component, start_step, end_step, index_kind).path(dir);
        Ok(SegmentWriter {
            writer: WordWriter::create(&data_path)?,
            index: HashIndexBuilder::new(),
            data_path,
            index_path,
            start_tx: start_step * step,
            end_tx: end_step * step,
        })
    }

    /// Key word followed by value word; the index records the key's offset.
    pub fn add_pair(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let offset = self.writer.add_word(key)?;
        self.writer.add_word(value)?;
        self.index.add(key, offset);
        Ok(())
    }

    /// Bare word indexed under a synthetic key (history value layout).
    pub fn add_indexed_word(&mut self, index_key: &[u8], word: &[u8]) -> Result<()> {
        let offset = self.writer.add_word(word)?;
        self.index.add(index_key, offset);
        Ok(())
    }

    pub fn finish(self, frozen: bool) -> Result<Arc<Segment>> {
        let SegmentWriter {
            writer,
            index,
            data_path,
            index_path,
            start_tx,
            end_tx,
        } = self;
        let result = writer
            .finish()
            .and_then(|_| index.build(&index_path))
            .and_then(|_| Segment::open(&data_path, &index_path, start_tx, end_tx, frozen));
        match result {
            Ok(segment) => Ok(Arc::new(segment)),
            Err(e) => {
                // A failed build leaves nothing behind.
                let _ = fs::remove_file(&data_path);
                let _ = fs::remove_file(&index_path);
                Err(e)
            }
        }
    }

    pub fn abort(self) {
        let _ = fs::remove_file(&self.data_path);
        let _ = fs::remove_file(&self.index_path);
    }
}

/// Ordered set of live segments for one component: ascending `end_tx`, ties
/// with the wider interval last.
#[derive(Default)]
pub struct SegmentRegistry {
    segments: Vec<Arc<Segment>>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    fn position(&self, start_tx: u64, end_tx: u64) -> usize {
        self.segments
            .partition_point(|s| (s.end_tx, std::cmp::Reverse(s.start_tx)) < (end_tx, std::cmp::Reverse(start_tx)))
    }

    pub fn insert(&mut self, segment: Arc<Segment>) {
        let at = self.position(segment.start_tx, segment.end_tx);
        self.segments.insert(at, segment);
    }

    /// Remove the segment covering exactly `[start_tx, end_tx)`, returning it.
    pub fn remove(&mut self, start_tx: u64, end_tx: u64) -> Option<Arc<Segment>> {
        let at = self
            .segments
            .iter()
            .position(|s| s.start_tx == start_tx && s.end_tx == end_tx)?;
        Some(self.segments.remove(at))
    }

    pub fn ascend(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.segments.iter()
    }

    pub fn descend(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.segments.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Highest transaction number fully covered by registered segments.
    pub fn max_end_tx(&self) -> u64 {
        self.segments.last().map(|s| s.end_tx).unwrap_or(0)
    }

    /// Stable list of references for lock-free reads; taken under the
    /// component's read lock.
    pub fn snapshot(&self) -> Vec<Arc<Segment>> {
        self.segments.clone()
    }

    /// Swap merge inputs for their merged replacement, retiring the inputs.
    pub fn replace(&mut self, inputs: &[(u64, u64)], output: Arc<Segment>) -> Result<()> {
        for &(start_tx, end_tx) in inputs {
            let removed = self.remove(start_tx, end_tx).ok_or_else(|| {
                Error::Consistency(format!(
                    "merge input [{}, {}) vanished from the registry",
                    start_tx, end_tx
                ))
            })?;
            removed.retire();
        }
        self.insert(output);
        Ok(())
    }

    /// Fail fast when ranges overlap, leave a gap, or stop short of the hot
    /// store's minimum retained transaction number.
    pub fn validate(&self, hot_min_tx: Option<u64>) -> Result<()> {
        let mut expected_start = 0u64;
        for segment in &self.segments {
            if segment.start_tx != expected_start {
                return Err(Error::Consistency(format!(
                    "segment chain broken at [{}, {}): expected start {}",
                    segment.start_tx, segment.end_tx, expected_start
                )));
            }
            expected_start = segment.end_tx;
        }
        if let Some(hot_min) = hot_min_tx {
            if self.max_end_tx() < hot_min {
                return Err(Error::Consistency(format!(
                    "segments end at {} but the hot store only retains transactions from {}",
                    self.max_end_tx(),
                    hot_min
                )));
            }
        }
        Ok(())
    }
}

/// Rebuild a registry from the files on disk, superseding narrower files
/// covered by wider ones, then validating contiguity.
pub fn open_registry(
    dir: &Path,
    component: &str,
    data_kind: FileKind,
    index_kind: FileKind,
    step: u64,
    max_span: u64,
) -> Result<SegmentRegistry> {
    let mut names = scan_component(dir, component, data_kind)?;
    // Widest-first by start; a file contained in the previously kept range
    // has been superseded by a merge and is skipped.
    names.sort_by(|a, b| a.start_step.cmp(&b.start_step).then(b.end_step.cmp(&a.end_step)));

    let mut registry = SegmentRegistry::new();
    let mut covered_to = 0u64;
    for name in names {
        if name.end_step <= covered_to && covered_to > 0 {
            tracing::info!(
                file = %name.file_name(),
                "Skipping superseded segment file"
            );
            continue;
        }
        let (start_tx, end_tx) = name.tx_range(step);
        let index_name = SegmentName::new(component, name.start_step, name.end_step, index_kind);
        let segment = Segment::open(
            &name.path(dir),
            &index_name.path(dir),
            start_tx,
            end_tx,
            end_tx - start_tx >= max_span,
        )?;
        registry.insert(Arc::new(segment));
        covered_to = covered_to.max(name.end_step);
    }
    registry.validate(None)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn build_segment(
        dir: &Path,
        component: &str,
        start_step: u64,
        end_step: u64,
        pairs: &[(&[u8], &[u8])],
    ) -> Arc<Segment> {
        let mut writer = SegmentWriter::create(
            dir,
            component,
            start_step,
            end_step,
            4,
            FileKind::Values,
            FileKind::ValuesIndex,
        )
        .unwrap();
        for (key, value) in pairs {
            writer.add_pair(key, value).unwrap();
        }
        writer.finish(false).unwrap()
    }

    #[test]
    fn test_build_and_lookup() {
        let dir = TempDir::new().unwrap();
        let segment = build_segment(
            dir.path(),
            "accounts",
            0,
            1,
            &[(b"alice", b"100"), (b"bob", b"250")],
        );
        assert_eq!(segment.range(), (0, 4));
        assert_eq!(segment.lookup(b"alice").unwrap(), Some(b"100".to_vec()));
        assert_eq!(segment.lookup(b"bob").unwrap(), Some(b"250".to_vec()));
        assert_eq!(segment.lookup(b"carol").unwrap(), None);
    }

    #[test]
    fn test_empty_segment_lookup() {
        let dir = TempDir::new().unwrap();
        let segment = build_segment(dir.path(), "accounts", 0, 1, &[]);
        assert_eq!(segment.lookup(b"anything").unwrap(), None);
    }

    #[test]
    fn test_registry_ordering() {
        let dir = TempDir::new().unwrap();
        let mut registry = SegmentRegistry::new();
        registry.insert(build_segment(dir.path(), "a", 1, 2, &[]));
        registry.insert(build_segment(dir.path(), "a", 0, 1, &[]));
        registry.insert(build_segment(dir.path(), "a", 2, 4, &[]));

        let ranges: Vec<(u64, u64)> = registry.ascend().map(|s| s.range()).collect();
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 16)]);
        assert_eq!(registry.max_end_tx(), 16);
    }

    #[test]
    fn test_registry_tie_puts_wider_last() {
        let dir = TempDir::new().unwrap();
        let mut registry = SegmentRegistry::new();
        registry.insert(build_segment(dir.path(), "a", 1, 2, &[]));
        registry.insert(build_segment(dir.path(), "a", 0, 2, &[]));

        let ranges: Vec<(u64, u64)> = registry.ascend().map(|s| s.range()).collect();
        assert_eq!(ranges, vec![(4, 8), (0, 8)]);
    }

    #[test]
    fn test_validate_rejects_gap_and_overlap() {
        let dir = TempDir::new().unwrap();
        let mut registry = SegmentRegistry::new();
        registry.insert(build_segment(dir.path(), "a", 0, 1, &[]));
        registry.insert(build_segment(dir.path(), "a", 2, 3, &[]));
        assert!(matches!(registry.validate(None), Err(Error::Consistency(_))));

        let mut registry = SegmentRegistry::new();
        registry.insert(build_segment(dir.path(), "b", 0, 2, &[]));
        registry.insert(build_segment(dir.path(), "b", 1, 3, &[]));
        assert!(matches!(registry.validate(None), Err(Error::Consistency(_))));
    }

    #[test]
    fn test_validate_hot_gap() {
        let dir = TempDir::new().unwrap();
        let mut registry = SegmentRegistry::new();
        registry.insert(build_segment(dir.path(), "a", 0, 2, &[]));
        assert!(registry.validate(Some(8)).is_ok());
        assert!(matches!(
            registry.validate(Some(12)),
            Err(Error::Consistency(_))
        ));
    }

    #[test]
    fn test_open_registry_supersedes_narrow_files() {
        let dir = TempDir::new().unwrap();
        build_segment(dir.path(), "accounts", 0, 1, &[(b"k", b"old")]);
        build_segment(dir.path(), "accounts", 1, 2, &[(b"k", b"mid")]);
        build_segment(dir.path(), "accounts", 0, 2, &[(b"k", b"new")]);
        build_segment(dir.path(), "accounts", 2, 3, &[]);

        let registry = open_registry(
            dir.path(),
            "accounts",
            FileKind::Values,
            FileKind::ValuesIndex,
            4,
            1024,
        )
        .unwrap();
        let ranges: Vec<(u64, u64)> = registry.ascend().map(|s| s.range()).collect();
        assert_eq!(ranges, vec![(0, 8), (8, 12)]);
    }

    #[test]
    fn test_open_registry_randomized_chains() {
        use std::time::{SystemTime, UNIX_EPOCH};

        fn next(state: &mut u64) -> u64 {
            *state ^= *state << 13;
            *state ^= *state >> 7;
            *state ^= *state << 17;
            *state
        }

        let mut rng = u64::from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .subsec_nanos(),
        ) | 1;

        for round in 0..25 {
            let dir = TempDir::new().unwrap();

            // A contiguous chain of 1..=5 segments with random widths.
            let links = 1 + (next(&mut rng) % 5) as usize;
            let mut chain = Vec::with_capacity(links);
            let mut start = 0u64;
            for _ in 0..links {
                let width = 1 + next(&mut rng) % 4;
                chain.push((start, start + width));
                start += width;
            }
            // Half the rounds lose one non-final link, leaving a hole the
            // scan must refuse. Dropping the final link would just be a
            // shorter valid chain.
            let dropped = if links >= 2 && next(&mut rng) % 2 == 0 {
                Some((next(&mut rng) % (links as u64 - 1)) as usize)
            } else {
                None
            };

            let mut expected = Vec::new();
            for (i, &(s, e)) in chain.iter().enumerate() {
                if Some(i) == dropped {
                    continue;
                }
                build_segment(dir.path(), "accounts", s, e, &[]);
                // Narrow leftover from before the merge that produced
                // [s, e); the scan must supersede it.
                if e - s >= 2 && next(&mut rng) % 2 == 0 {
                    build_segment(dir.path(), "accounts", s, s + 1, &[]);
                }
                expected.push((s * 4, e * 4));
            }

            let opened = open_registry(
                dir.path(),
                "accounts",
                FileKind::Values,
                FileKind::ValuesIndex,
                4,
                1024,
            );
            match (dropped, opened) {
                (None, Ok(registry)) => {
                    let ranges: Vec<(u64, u64)> =
                        registry.ascend().map(|s| s.range()).collect();
                    assert_eq!(ranges, expected, "round {}", round);
                }
                (Some(_), result) => {
                    assert!(
                        matches!(result, Err(Error::Consistency(_))),
                        "round {}: a hole in the chain must fail validation",
                        round
                    );
                }
                (None, Err(e)) => panic!("round {}: unexpected error {}", round, e),
            }
        }
    }

    #[test]
    fn test_retired_segment_files_removed_after_last_reference() {
        let dir = TempDir::new().unwrap();
        let segment = build_segment(dir.path(), "accounts", 0, 1, &[(b"k", b"v")]);
        let data_path = segment.data().path().to_path_buf();

        let reader_ref = Arc::clone(&segment);
        segment.retire();
        drop(segment);
        assert!(data_path.exists(), "reader still holds the segment");

        drop(reader_ref);
        assert!(!data_path.exists(), "last reference dropped, files removed");
    }

    #[test]
    fn test_registry_replace_retires_inputs() {
        let dir = TempDir::new().unwrap();
        let mut registry = SegmentRegistry::new();
        let a = build_segment(dir.path(), "a", 0, 1, &[]);
        let b = build_segment(dir.path(), "a", 1, 2, &[]);
        let a_path = a.data().path().to_path_buf();
        registry.insert(a);
        registry.insert(b);

        let merged = build_segment(dir.path(), "a", 0, 2, &[]);
        registry.replace(&[(0, 4), (4, 8)], merged).unwrap();

        let ranges: Vec<(u64, u64)> = registry.ascend().map(|s| s.range()).collect();
        assert_eq!(ranges, vec![(0, 8)]);
        assert!(!a_path.exists());
    }
}

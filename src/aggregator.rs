//! Top-level orchestration: one aggregator owns every component, drives the
//! collation state machine, and keeps the minimax watermark.
//!
//! Collation is all-or-nothing across components: every segment pair for a
//! step is built before any registry learns about it, and a failure retires
//! whatever was already built. Merging runs one discrete merge at a time so
//! a background task can yield between them.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::EngineConfig;
use crate::domain::{BranchMerge, Domain};
use crate::error::{Error, Result};
use crate::history::HistoryReadout;
use crate::inverted::InvertedIndex;
use crate::segment::Segment;

/// Storage keys are slots under a fixed-width address; the bare address is
/// the enumeration marker.
const STORAGE_PREFIX_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Accounts,
    Storage,
    Code,
    Commitment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Addresses,
    Topics,
}

/// Where the step lifecycle currently stands, for status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Hot,
    Collating,
    FilesBuilt,
    Integrated,
    MergePending,
    Merged,
    Retired,
}

/// Point-in-time snapshot of engine progress.
#[derive(Debug, Clone)]
pub struct AggregatorStatus {
    pub tx_num: u64,
    /// Steps fully collated into segments so far.
    pub collated_steps: u64,
    /// Highest txNum every component has fully covered.
    pub watermark: u64,
    pub state: StepState,
    pub segment_counts: Vec<(&'static str, usize)>,
    pub last_background_error: Option<String>,
}

pub struct Aggregator {
    config: EngineConfig,
    accounts: Domain,
    storage: Domain,
    code: Domain,
    commitment: Domain,
    log_addrs: InvertedIndex,
    log_topics: InvertedIndex,
    tx_num: AtomicU64,
    collated_steps: AtomicU64,
    state: RwLock<StepState>,
    last_error: RwLock<Option<String>>,
}

impl Aggregator {
    /// Open the engine, rebuilding every registry from the files on disk.
    /// The commitment domain merges with last-write-wins; use [`open_with`]
    /// to inject a branch-aware combiner.
    ///
    /// [`open_with`]: Aggregator::open_with
    pub fn open(config: EngineConfig) -> Result<Aggregator> {
        Self::open_inner(config, None)
    }

    pub fn open_with(config: EngineConfig, commitment_merge: BranchMerge) -> Result<Aggregator> {
        Self::open_inner(config, Some(commitment_merge))
    }

    fn open_inner(config: EngineConfig, commitment_merge: Option<BranchMerge>) -> Result<Aggregator> {
        fs::create_dir_all(&config.dir)?;
        let step = config.aggregation_step;
        let max_span = config.max_span();
        let branching = config.branching_factor;

        let accounts = Domain::open(&config.dir, "accounts", step, max_span, 0, branching, None)?;
        let storage = Domain::open(
            &config.dir,
            "storage",
            step,
            max_span,
            STORAGE_PREFIX_LEN,
            branching,
            None,
        )?;
        let code = Domain::open(&config.dir, "code", step, max_span, 0, branching, None)?;
        let commitment = Domain::open(
            &config.dir,
            "commitment",
            step,
            max_span,
            0,
            branching,
            commitment_merge,
        )?;
        let log_addrs = InvertedIndex::open(&config.dir, "logaddrs", step, max_span)?;
        let log_topics = InvertedIndex::open(&config.dir, "logtopics", step, max_span)?;

        let aggregator = Aggregator {
            config,
            accounts,
            storage,
            code,
            commitment,
            log_addrs,
            log_topics,
            tx_num: AtomicU64::new(0),
            collated_steps: AtomicU64::new(0),
            state: RwLock::new(StepState::Hot),
            last_error: RwLock::new(None),
        };

        // Resume where the files leave off; hot rows do not survive restarts.
        let watermark = aggregator.watermark()?;
        aggregator.tx_num.store(watermark, Ordering::SeqCst);
        aggregator
            .collated_steps
            .store(watermark / aggregator.config.aggregation_step, Ordering::SeqCst);
        tracing::info!(
            dir = %aggregator.config.dir.display(),
            watermark,
            "Opened aggregator"
        );
        Ok(aggregator)
    }

    fn domain(&self, kind: DomainKind) -> &Domain {
        match kind {
            DomainKind::Accounts => &self.accounts,
            DomainKind::Storage => &self.storage,
            DomainKind::Code => &self.code,
            DomainKind::Commitment => &self.commitment,
        }
    }

    fn domains(&self) -> [&Domain; 4] {
        [&self.accounts, &self.storage, &self.code, &self.commitment]
    }

    fn inverteds(&self) -> [&InvertedIndex; 2] {
        [&self.log_addrs, &self.log_topics]
    }

    fn log(&self, kind: LogKind) -> &InvertedIndex {
        match kind {
            LogKind::Addresses => &self.log_addrs,
            LogKind::Topics => &self.log_topics,
        }
    }

    fn set_state(&self, state: StepState) -> Result<()> {
        *self.state.write().map_err(|_| Error::LockPoisoned)? = state;
        Ok(())
    }

    pub fn tx_num(&self) -> u64 {
        self.tx_num.load(Ordering::SeqCst)
    }

    /// TxNum that writes in the current transaction should carry.
    pub fn begin_step(&self) -> u64 {
        self.tx_num.load(Ordering::SeqCst)
    }

    /// Seal the current transaction, advancing the counter.
    pub fn finish_step(&self) -> u64 {
        self.tx_num.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Latest value, or the value as of `as_of` when given. A key with no
    /// recorded change at or after `as_of` already held its latest value
    /// then, so the historical miss falls through to the latest read.
    pub fn get(&self, kind: DomainKind, key: &[u8], as_of: Option<u64>) -> Result<Option<Vec<u8>>> {
        let domain = self.domain(kind);
        if let Some(tx_num) = as_of {
            match domain.history().get(key, tx_num)? {
                HistoryReadout::Value(v) => return Ok(Some(v)),
                HistoryReadout::Deleted => return Ok(None),
                HistoryReadout::NoHistory => {}
            }
        }
        domain.get(key)
    }

    pub fn put(&self, kind: DomainKind, key: &[u8], value: &[u8], tx_num: u64) -> Result<()> {
        self.domain(kind).put(tx_num, key, value)
    }

    pub fn delete(&self, kind: DomainKind, key: &[u8], tx_num: u64) -> Result<()> {
        self.domain(kind).delete(tx_num, key)
    }

    /// Tri-state historical readout, with no fallthrough to the latest value.
    pub fn history_get(&self, kind: DomainKind, key: &[u8], tx_num: u64) -> Result<HistoryReadout> {
        self.domain(kind).history().get(key, tx_num)
    }

    /// Record a log touch at `tx_num`.
    pub fn add_log(&self, kind: LogKind, tx_num: u64, key: &[u8]) {
        self.log(kind).add(tx_num, key);
    }

    /// First recorded log touch of `key` at or after `tx_num`.
    pub fn seek_log(&self, kind: LogKind, key: &[u8], tx_num: u64) -> Result<Option<u64>> {
        self.log(kind).seek(key, tx_num)
    }

    /// All live storage slots under `prefix`.
    pub fn iterate_storage(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.storage.iterate_prefix(prefix)
    }

    /// Highest txNum covered by every component's segment chain.
    pub fn watermark(&self) -> Result<u64> {
        let mut watermark = u64::MAX;
        for domain in self.domains() {
            watermark = watermark.min(domain.max_end_tx()?);
        }
        for index in self.inverteds() {
            watermark = watermark.min(index.max_end_tx()?);
        }
        Ok(if watermark == u64::MAX { 0 } else { watermark })
    }

    /// Collate every step that is due, keeping `keep_steps_hot` completed
    /// steps in the hot store. Returns how many steps were collated.
    pub fn flush_if_due(&self) -> Result<u64> {
        let step = self.config.aggregation_step;
        let mut collated = 0u64;
        loop {
            let next = self.collated_steps.load(Ordering::SeqCst);
            let due_at = (next + 1 + self.config.keep_steps_hot) * step;
            if self.tx_num() < due_at {
                break;
            }
            self.collate_step(next)?;
            collated += 1;
        }
        Ok(collated)
    }

    /// Collate one step across all components: build every file first, then
    /// integrate, then prune. A failure anywhere before integration retires
    /// the partial build and leaves every registry untouched.
    fn collate_step(&self, step_num: u64) -> Result<()> {
        let step = self.config.aggregation_step;
        let (tx_from, tx_to) = (step_num * step, (step_num + 1) * step);
        self.set_state(StepState::Collating)?;

        let built = match self.build_step_files(step_num, tx_from, tx_to) {
            Ok(built) => built,
            Err(e) => {
                self.set_state(StepState::Hot)?;
                return Err(e);
            }
        };
        self.set_state(StepState::FilesBuilt)?;

        for (domain, kv, history_files) in built.domains {
            domain.integrate(kv)?;
            domain.history().integrate(history_files)?;
        }
        for (index, segment) in built.inverteds {
            index.integrate(segment)?;
        }
        self.set_state(StepState::Integrated)?;

        for domain in self.domains() {
            domain.prune(step_num)?;
            domain.history().prune(tx_from, tx_to)?;
        }
        for index in self.inverteds() {
            index.prune(tx_from, tx_to)?;
        }

        self.collated_steps.store(step_num + 1, Ordering::SeqCst);
        self.set_state(StepState::Hot)?;
        tracing::info!(step = step_num, tx_from, tx_to, "Collated step");
        Ok(())
    }

    fn build_step_files(&self, step_num: u64, tx_from: u64, tx_to: u64) -> Result<StepFiles<'_>> {
        let mut built = StepFiles::default();
        for domain in self.domains() {
            let values = domain.collate(step_num).map_err(|e| built.discard(e))?;
            let touches = domain
                .history()
                .collate(tx_from, tx_to)
                .map_err(|e| built.discard(e))?;
            let kv = domain
                .build_files(step_num, &values)
                .map_err(|e| built.discard(e))?;
            let history_files = match domain.history().build_files(step_num, &touches) {
                Ok(files) => files,
                Err(e) => {
                    kv.retire();
                    return Err(built.discard(e));
                }
            };
            built.domains.push((domain, kv, history_files));
        }
        for index in self.inverteds() {
            let collation: BTreeMap<Vec<u8>, Vec<u64>> = index
                .collate(tx_from, tx_to)
                .map_err(|e| built.discard(e))?;
            let segment = index
                .build_files(step_num, &collation)
                .map_err(|e| built.discard(e))?;
            built.inverteds.push((index, segment));
        }
        Ok(built)
    }

    /// Run at most one discrete merge per component pair. Returns whether
    /// anything merged; callers drain by looping until `false`.
    pub fn merge_once(&self) -> Result<bool> {
        self.set_state(StepState::MergePending)?;
        let outcome = self.run_merges();
        // Inputs are retired inside the registry swaps, so a completed round
        // lands on Retired; an empty or failed round falls back to Hot so a
        // later tick can retry.
        match &outcome {
            Ok(true) => self.set_state(StepState::Retired)?,
            _ => self.set_state(StepState::Hot)?,
        }
        outcome
    }

    fn run_merges(&self) -> Result<bool> {
        let watermark = self.watermark()?;
        let mut merged = false;

        for domain in self.domains() {
            if domain.merge_once(watermark)?.is_some() {
                merged = true;
            }
        }
        for index in self.inverteds() {
            if let Some((from, to)) = index.find_merge_range(watermark)? {
                index.merge(from, to)?;
                merged = true;
            }
        }
        Ok(merged)
    }

    /// Drain every due merge, returning how many rounds ran.
    pub fn merge_loop(&self) -> Result<u64> {
        let mut rounds = 0u64;
        while self.merge_once()? {
            rounds += 1;
        }
        Ok(rounds)
    }

    /// Flush everything that is due and stop. Hot rows of incomplete steps
    /// are volatile and rebuilt by replay on the next open.
    pub fn close(&self) -> Result<()> {
        let collated = self.flush_if_due()?;
        tracing::info!(collated, tx_num = self.tx_num(), "Closed aggregator");
        Ok(())
    }

    /// Note a background task failure; surfaced through [`status`] and
    /// retried on the task's next tick.
    ///
    /// [`status`]: Aggregator::status
    pub fn record_background_error(&self, error: &Error) {
        if let Ok(mut slot) = self.last_error.write() {
            *slot = Some(error.to_string());
        }
    }

    pub fn status(&self) -> Result<AggregatorStatus> {
        let segment_counts = vec![
            ("accounts", self.accounts.segment_count()?),
            ("storage", self.storage.segment_count()?),
            ("code", self.code.segment_count()?),
            ("commitment", self.commitment.segment_count()?),
            ("logaddrs", self.log_addrs.segment_count()?),
            ("logtopics", self.log_topics.segment_count()?),
        ];
        Ok(AggregatorStatus {
            tx_num: self.tx_num(),
            collated_steps: self.collated_steps.load(Ordering::SeqCst),
            watermark: self.watermark()?,
            state: *self.state.read().map_err(|_| Error::LockPoisoned)?,
            segment_counts,
            last_background_error: self.last_error.read().map_err(|_| Error::LockPoisoned)?.clone(),
        })
    }
}

/// Per-step build artifacts, held back until every component succeeded.
#[derive(Default)]
struct StepFiles<'a> {
    domains: Vec<(&'a Domain, Arc<Segment>, crate::history::HistoryFiles)>,
    inverteds: Vec<(&'a InvertedIndex, Arc<Segment>)>,
}

impl StepFiles<'_> {
    /// Retire everything built so far and hand the error back.
    fn discard(&mut self, error: Error) -> Error {
        for (_, kv, history_files) in self.domains.drain(..) {
            kv.retire();
            history_files.ef.retire();
            history_files.values.retire();
        }
        for (_, segment) in self.inverteds.drain(..) {
            segment.retire();
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::new(dir)
            .aggregation_step(4)
            .keep_steps_hot(0)
            .max_span_steps(1 << 16)
    }

    fn write_at(agg: &Aggregator, tx: u64, kind: DomainKind, key: &[u8], value: &[u8]) {
        while agg.tx_num() < tx {
            agg.finish_step();
        }
        agg.put(kind, key, value, tx).unwrap();
    }

    #[test]
    fn test_put_get_across_collation() {
        let dir = TempDir::new().unwrap();
        let agg = Aggregator::open(test_config(dir.path())).unwrap();

        write_at(&agg, 1, DomainKind::Accounts, b"alice", b"100");
        write_at(&agg, 2, DomainKind::Code, b"alice", b"\x60\x01");
        write_at(&agg, 3, DomainKind::Accounts, b"alice", b"90");

        assert_eq!(
            agg.get(DomainKind::Accounts, b"alice", None).unwrap(),
            Some(b"90".to_vec())
        );

        while agg.tx_num() < 4 {
            agg.finish_step();
        }
        assert_eq!(agg.flush_if_due().unwrap(), 1);

        // Reads are unchanged by collation.
        assert_eq!(
            agg.get(DomainKind::Accounts, b"alice", None).unwrap(),
            Some(b"90".to_vec())
        );
        assert_eq!(
            agg.get(DomainKind::Code, b"alice", None).unwrap(),
            Some(b"\x60\x01".to_vec())
        );
        assert_eq!(agg.watermark().unwrap(), 4);
    }

    #[test]
    fn test_two_step_write_collate_history() {
        let dir = TempDir::new().unwrap();
        let agg = Aggregator::open(test_config(dir.path())).unwrap();

        write_at(&agg, 1, DomainKind::Accounts, b"k1", b"v1");
        write_at(&agg, 2, DomainKind::Accounts, b"k2", b"v2");
        while agg.tx_num() < 4 {
            agg.finish_step();
        }
        agg.flush_if_due().unwrap();
        assert_eq!(
            agg.get(DomainKind::Accounts, b"k1", None).unwrap(),
            Some(b"v1".to_vec())
        );

        write_at(&agg, 5, DomainKind::Accounts, b"k1", b"v3");
        while agg.tx_num() < 8 {
            agg.finish_step();
        }
        agg.flush_if_due().unwrap();

        assert_eq!(
            agg.history_get(DomainKind::Accounts, b"k1", 5).unwrap(),
            HistoryReadout::Value(b"v1".to_vec())
        );
        assert_eq!(
            agg.get(DomainKind::Accounts, b"k1", None).unwrap(),
            Some(b"v3".to_vec())
        );
    }

    #[test]
    fn test_as_of_reads() {
        let dir = TempDir::new().unwrap();
        let agg = Aggregator::open(test_config(dir.path())).unwrap();

        write_at(&agg, 1, DomainKind::Accounts, b"alice", b"100");
        write_at(&agg, 5, DomainKind::Accounts, b"alice", b"90");
        write_at(&agg, 6, DomainKind::Accounts, b"bob", b"7");
        while agg.tx_num() < 8 {
            agg.finish_step();
        }
        agg.flush_if_due().unwrap();

        // Before the first write the key did not exist.
        assert_eq!(agg.get(DomainKind::Accounts, b"alice", Some(1)).unwrap(), None);
        // Between the writes the original value is visible.
        assert_eq!(
            agg.get(DomainKind::Accounts, b"alice", Some(3)).unwrap(),
            Some(b"100".to_vec())
        );
        // No change at or after as_of: fall through to the latest value.
        assert_eq!(
            agg.get(DomainKind::Accounts, b"alice", Some(7)).unwrap(),
            Some(b"90".to_vec())
        );
        assert_eq!(
            agg.history_get(DomainKind::Accounts, b"alice", 7).unwrap(),
            HistoryReadout::NoHistory
        );
    }

    #[test]
    fn test_flush_not_due_below_keep_hot() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path()).keep_steps_hot(1);
        let agg = Aggregator::open(config).unwrap();

        write_at(&agg, 1, DomainKind::Accounts, b"k", b"v");
        while agg.tx_num() < 4 {
            agg.finish_step();
        }
        // Step 0 is complete but stays hot.
        assert_eq!(agg.flush_if_due().unwrap(), 0);

        while agg.tx_num() < 8 {
            agg.finish_step();
        }
        assert_eq!(agg.flush_if_due().unwrap(), 1);
    }

    #[test]
    fn test_log_touches_survive_collation() {
        let dir = TempDir::new().unwrap();
        let agg = Aggregator::open(test_config(dir.path())).unwrap();

        agg.add_log(LogKind::Addresses, 1, b"addr1");
        agg.add_log(LogKind::Addresses, 3, b"addr1");
        agg.add_log(LogKind::Topics, 2, b"topic1");
        while agg.tx_num() < 4 {
            agg.finish_step();
        }
        agg.flush_if_due().unwrap();

        assert_eq!(agg.seek_log(LogKind::Addresses, b"addr1", 2).unwrap(), Some(3));
        assert_eq!(agg.seek_log(LogKind::Topics, b"topic1", 0).unwrap(), Some(2));
        assert_eq!(agg.seek_log(LogKind::Topics, b"topic1", 3).unwrap(), None);
    }

    #[test]
    fn test_merge_loop_terminates() {
        let dir = TempDir::new().unwrap();
        let agg = Aggregator::open(test_config(dir.path())).unwrap();

        for step in 0u64..4 {
            let tx = step * 4 + 1;
            write_at(&agg, tx, DomainKind::Accounts, b"alice", format!("v{}", step).as_bytes());
            agg.add_log(LogKind::Addresses, tx, b"addr1");
            while agg.tx_num() < (step + 1) * 4 {
                agg.finish_step();
            }
            agg.flush_if_due().unwrap();
        }

        let rounds = agg.merge_loop().unwrap();
        assert!(rounds > 0);
        assert!(!agg.merge_once().unwrap());

        // Fully merged: one segment per touched component.
        assert_eq!(
            agg.get(DomainKind::Accounts, b"alice", None).unwrap(),
            Some(b"v3".to_vec())
        );
        let status = agg.status().unwrap();
        let counts: std::collections::HashMap<_, _> =
            status.segment_counts.iter().cloned().collect();
        assert_eq!(counts["accounts"], 1);
        assert_eq!(counts["logaddrs"], 1);
    }

    #[test]
    fn test_failed_merge_returns_to_hot() {
        let dir = TempDir::new().unwrap();
        let broken: BranchMerge =
            Arc::new(|_: &[u8], _: &[u8]| Err(Error::InvalidState("combiner outage".into())));
        let agg = Aggregator::open_with(test_config(dir.path()), broken).unwrap();

        for step in 0u64..2 {
            write_at(&agg, step * 4 + 1, DomainKind::Commitment, b"branch", b"x");
            while agg.tx_num() < (step + 1) * 4 {
                agg.finish_step();
            }
            agg.flush_if_due().unwrap();
        }

        // The round fails but the state machine does not stay wedged on
        // MergePending; the next tick is free to retry.
        assert!(agg.merge_once().is_err());
        assert_eq!(agg.status().unwrap().state, StepState::Hot);
    }

    #[test]
    fn test_reopen_resumes_from_watermark() {
        let dir = TempDir::new().unwrap();
        {
            let agg = Aggregator::open(test_config(dir.path())).unwrap();
            write_at(&agg, 1, DomainKind::Accounts, b"alice", b"100");
            while agg.tx_num() < 4 {
                agg.finish_step();
            }
            agg.flush_if_due().unwrap();
            agg.close().unwrap();
        }
        let agg = Aggregator::open(test_config(dir.path())).unwrap();
        assert_eq!(agg.tx_num(), 4);
        assert_eq!(
            agg.get(DomainKind::Accounts, b"alice", None).unwrap(),
            Some(b"100".to_vec())
        );
        let status = agg.status().unwrap();
        assert_eq!(status.collated_steps, 1);
        assert_eq!(status.watermark, 4);
    }

    #[test]
    fn test_storage_prefix_iteration() {
        let dir = TempDir::new().unwrap();
        let agg = Aggregator::open(test_config(dir.path())).unwrap();

        let addr = [0xAAu8; STORAGE_PREFIX_LEN];
        let mut slot1 = addr.to_vec();
        slot1.extend_from_slice(b"slot1");
        let mut slot2 = addr.to_vec();
        slot2.extend_from_slice(b"slot2");

        // Marker first, then the slots under it.
        agg.put(DomainKind::Storage, &addr, b"", 1).unwrap();
        agg.put(DomainKind::Storage, &slot1, b"s1", 1).unwrap();
        agg.put(DomainKind::Storage, &slot2, b"s2", 2).unwrap();
        while agg.tx_num() < 4 {
            agg.finish_step();
        }
        agg.flush_if_due().unwrap();
        agg.delete(DomainKind::Storage, &slot2, 5).unwrap();

        let entries = agg.iterate_storage(&addr).unwrap();
        assert_eq!(entries, vec![(slot1, b"s1".to_vec())]);

        // The marker key survives the merge even though its value is empty.
        while agg.tx_num() < 8 {
            agg.finish_step();
        }
        agg.flush_if_due().unwrap();
        agg.merge_loop().unwrap();
        let snapshot = agg.storage.history().inverted().snapshot().unwrap();
        assert!(!snapshot.is_empty());
        assert_eq!(agg.iterate_storage(&addr).unwrap().len(), 1);
    }

    #[test]
    fn test_commitment_branch_merge() {
        let dir = TempDir::new().unwrap();
        let combine: BranchMerge = Arc::new(|older: &[u8], newer: &[u8]| {
            let mut out = older.to_vec();
            out.extend_from_slice(newer);
            Ok(out)
        });
        let agg = Aggregator::open_with(test_config(dir.path()), combine).unwrap();

        write_at(&agg, 1, DomainKind::Commitment, b"branch", b"a");
        while agg.tx_num() < 4 {
            agg.finish_step();
        }
        agg.flush_if_due().unwrap();
        write_at(&agg, 5, DomainKind::Commitment, b"branch", b"b");
        while agg.tx_num() < 8 {
            agg.finish_step();
        }
        agg.flush_if_due().unwrap();

        agg.merge_loop().unwrap();
        assert_eq!(
            agg.get(DomainKind::Commitment, b"branch", None).unwrap(),
            Some(b"ab".to_vec())
        );
    }
}

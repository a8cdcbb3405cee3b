use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the segment engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding segment files
    pub dir: PathBuf,

    /// Transaction-number slots collated into one segment (default: 8192)
    pub aggregation_step: u64,

    /// Completed steps kept un-collated in the hot store for cheap unwind
    /// (default: 1)
    pub keep_steps_hot: u64,

    /// Merge span cap, in steps (default: 32)
    pub max_span_steps: u64,

    /// Branching factor of the static search tree (default: 256)
    pub branching_factor: u64,

    /// How often the background task checks for due collations (default: 3s)
    pub collation_interval: Duration,

    /// How often the background task looks for mergeable ranges (default: 10s)
    pub merge_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./stratadb"),
            aggregation_step: 8192,
            keep_steps_hot: 1,
            max_span_steps: 32,
            branching_factor: 256,
            collation_interval: Duration::from_secs(3),
            merge_interval: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the aggregation step
    pub fn aggregation_step(mut self, step: u64) -> Self {
        self.aggregation_step = step;
        self
    }

    /// Set how many completed steps stay in the hot store
    pub fn keep_steps_hot(mut self, steps: u64) -> Self {
        self.keep_steps_hot = steps;
        self
    }

    /// Set the merge span cap in steps
    pub fn max_span_steps(mut self, steps: u64) -> Self {
        self.max_span_steps = steps;
        self
    }

    /// Set the static tree branching factor
    pub fn branching_factor(mut self, m: u64) -> Self {
        self.branching_factor = m;
        self
    }

    /// Set the collation check interval
    pub fn collation_interval(mut self, interval: Duration) -> Self {
        self.collation_interval = interval;
        self
    }

    /// Set the merge check interval
    pub fn merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    /// Merge span cap in transaction numbers
    pub fn max_span(&self) -> u64 {
        self.max_span_steps * self.aggregation_step
    }
}

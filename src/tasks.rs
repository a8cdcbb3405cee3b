//! Background tasks: periodic collation and merge draining.
//!
//! Both tasks poll rather than react; a failed run is recorded on the
//! aggregator's status and retried on the next tick instead of taking the
//! process down.

use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::Aggregator;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

/// Collates every step that has fallen behind the hot-step allowance.
pub struct CollationTask {
    aggregator: Arc<Aggregator>,
    interval: Duration,
}

impl CollationTask {
    pub fn new(aggregator: Arc<Aggregator>, interval: Duration) -> Self {
        Self {
            aggregator,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CollationTask {
    fn name(&self) -> &'static str {
        "collation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let aggregator = Arc::clone(&self.aggregator);
        let collated = tokio::task::spawn_blocking(move || {
            let result = aggregator.flush_if_due();
            if let Err(e) = &result {
                aggregator.record_background_error(e);
            }
            result
        })
        .await
        .map_err(|e| crate::Error::InvalidState(format!("collation task join error: {}", e)))??;

        if collated > 0 {
            tracing::info!(collated, "Background collation finished");
        }
        Ok(())
    }
}

/// Drains due merges one discrete merge at a time, yielding to shutdown
/// between rounds.
pub struct MergeTask {
    aggregator: Arc<Aggregator>,
    interval: Duration,
}

impl MergeTask {
    pub fn new(aggregator: Arc<Aggregator>, interval: Duration) -> Self {
        Self {
            aggregator,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MergeTask {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, mut ctx: Context) -> Result<()> {
        let mut rounds = 0u64;
        loop {
            // Stop between discrete merges when shutdown was signalled.
            if ctx.shutdown.try_recv().is_ok() {
                tracing::info!(rounds, "Merge draining interrupted by shutdown");
                break;
            }

            let aggregator = Arc::clone(&self.aggregator);
            let merged = tokio::task::spawn_blocking(move || {
                let result = aggregator.merge_once();
                if let Err(e) = &result {
                    aggregator.record_background_error(e);
                }
                result
            })
            .await
            .map_err(|e| crate::Error::InvalidState(format!("merge task join error: {}", e)))??;

            if !merged {
                break;
            }
            rounds += 1;
        }
        if rounds > 0 {
            tracing::info!(rounds, "Background merge drained");
        }
        Ok(())
    }
}

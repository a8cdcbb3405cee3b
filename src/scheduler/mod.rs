//! Timer loops for the engine's maintenance work.
//!
//! Collation and merging run off-thread on fixed intervals taken from
//! [`EngineConfig`](crate::config::EngineConfig). Each registered task gets
//! its own loop; a broadcast shutdown channel stops every loop and also
//! reaches into a running task so it can stop between discrete units of
//! work (a merge task checks it between segment merges).

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Handed to a maintenance task on every tick. The shutdown receiver lets
/// long runs bail out between units of work instead of finishing the whole
/// backlog first.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Periodic engine maintenance: collation sweeps, merge rounds.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tick period, normally one of the `EngineConfig` intervals.
    fn interval(&self) -> Duration;

    /// One tick's worth of work. Errors are logged, never fatal; the task
    /// runs again on the next tick.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Owns the timer loops and the shutdown channel they all listen on.
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Spawn a timer loop for `task`.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<()> {
        let handle = self.spawn_timer_loop(task);
        self.tasks
            .write()
            .map_err(|_| Error::LockPoisoned)?
            .push(handle);
        Ok(())
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Signal every loop to stop and wait for them to drain.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.write().map_err(|_| Error::LockPoisoned)?;
            tasks.drain(..).collect()
        };
        for task in handles {
            task.await
                .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

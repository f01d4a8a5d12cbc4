//! Retention and recovery policies, run periodically by a
//! [`HousekeepingWorker`].
//!
//! Every strategy is idempotent and never deletes a running record.

mod dead;
mod retention;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use super::error::JobsError;

pub use dead::{ClearDeadLocks, StopDeadJobs};
pub use retention::{DeleteSkippedJobs, KeepLastJobs, RetentionScope};

/// A cleanup policy. Returns the number of records (or locks) it touched.
pub trait CleanupStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self) -> Result<usize, JobsError>;
}

/// Handle to control and join the housekeeping thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Runs a fixed list of strategies, one after another.
#[derive(Default)]
pub struct HousekeepingWorker {
    strategies: Vec<Box<dyn CleanupStrategy>>,
}

impl core::fmt::Debug for HousekeepingWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HousekeepingWorker")
            .field("strategies", &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl HousekeepingWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy<S>(mut self, strategy: S) -> Self
    where
        S: CleanupStrategy + 'static,
    {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Runs every strategy once. A failing strategy is logged and does not
    /// keep the others from running.
    pub fn run_once(&self) -> usize {
        let mut total = 0;
        for strategy in &self.strategies {
            match strategy.run() {
                Ok(0) => debug!(strategy = strategy.name(), "nothing to clean up"),
                Ok(count) => {
                    info!(strategy = strategy.name(), count, "cleanup finished");
                    total += count;
                }
                Err(err) => error!(strategy = strategy.name(), error = %err, "cleanup failed"),
            }
        }
        total
    }

    /// Runs immediately, then every `interval` until shut down.
    pub fn spawn(self, interval: Duration) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("housekeeping".to_string())
            .spawn(move || {
                loop {
                    self.run_once();
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

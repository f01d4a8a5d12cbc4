use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info};

use jobwarden_core::{Clock, JobMessage};
use jobwarden_events::{JobEventPublisher, SharedJobBus};

use super::definition::{JobDefinition, JobRunnable};
use super::error::JobsError;
use super::runner::JobRunner;
use super::service::{JobService, StartOutcome};

/// Entry point for whatever decides that a job should run (HTTP handler,
/// timer). Retrying on [`StartOutcome::AlreadyRunning`] is the caller's job.
pub struct JobTrigger {
    service: Arc<JobService>,
    bus: SharedJobBus,
    clock: Arc<dyn Clock>,
    runnables: Vec<Arc<dyn JobRunnable>>,
    keep_alive: Duration,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl core::fmt::Debug for JobTrigger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobTrigger")
            .field("job_types", &self.definitions().iter().map(|d| &d.job_type).collect::<Vec<_>>())
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl JobTrigger {
    pub fn new(service: Arc<JobService>, bus: SharedJobBus, keep_alive: Duration) -> Self {
        let clock = service.clock().clone();
        Self {
            service,
            bus,
            clock,
            runnables: Vec::new(),
            keep_alive,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn register<R>(mut self, runnable: R) -> Self
    where
        R: JobRunnable + 'static,
    {
        self.runnables.push(Arc::new(runnable));
        self
    }

    pub fn register_shared(mut self, runnable: Arc<dyn JobRunnable>) -> Self {
        self.runnables.push(runnable);
        self
    }

    pub fn definitions(&self) -> Vec<&JobDefinition> {
        self.runnables.iter().map(|r| r.definition()).collect()
    }

    /// Starts `job_type` (matched case-insensitively) on its own thread.
    pub fn try_start(&self, job_type: &str) -> Result<StartOutcome, JobsError> {
        let runnable = self
            .runnables
            .iter()
            .find(|r| r.definition().matches(job_type))
            .cloned()
            .ok_or_else(|| JobsError::UnknownJobType(job_type.to_string()))?;
        let job_type = runnable.definition().job_type.clone();

        let job_id = match self.service.try_start(&job_type)? {
            StartOutcome::Started(job_id) => job_id,
            other => {
                info!(job_type = %job_type, outcome = ?other, "job not started");
                return Ok(other);
            }
        };

        let publisher = JobEventPublisher::new(self.bus.clone(), self.clock.clone(), job_id.clone(), &job_type);
        match JobRunner::new(runnable, publisher, self.keep_alive).spawn() {
            Ok(handle) => {
                let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
                running.retain(|h| !h.is_finished());
                running.push(handle);
                Ok(StartOutcome::Started(job_id))
            }
            Err(err) => {
                error!(job_id = %job_id, job_type = %job_type, error = %err, "failed to spawn job thread");
                let message = JobMessage::error(format!("Failed to start job: {err}"), self.clock.now());
                self.service.append_message(&job_id, &message)?;
                self.service.stop(&job_id)?;
                Err(JobsError::Spawn(err.to_string()))
            }
        }
    }

    /// Waits for every job started so far to finish.
    pub fn join_all(&self) {
        let handles: Vec<_> = {
            let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
            running.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("job thread panicked");
            }
        }
    }
}

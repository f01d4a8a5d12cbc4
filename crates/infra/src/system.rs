//! Process-level wiring of the job tracking components.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use jobwarden_core::{Clock, SystemClock};
use jobwarden_events::{JobEvent, ListenerBus, LoggingJobEventListener, SharedJobBus};

use crate::config::{JobsConfig, build_store};
use crate::jobs::{
    ClearDeadLocks, DeleteSkippedJobs, HousekeepingWorker, JobRunnable, JobService, JobStatusIndicator, JobTrigger,
    JobsError, KeepLastJobs, MutexGroups, StartOutcome, StatusCalculator, StatusDetail, StopDeadJobs, WorkerHandle,
};

pub struct JobSystemBuilder {
    config: JobsConfig,
    clock: Arc<dyn Clock>,
    mutex_groups: MutexGroups,
    runnables: Vec<Arc<dyn JobRunnable>>,
    calculators: Vec<(String, usize, usize)>,
    status_overrides: Vec<(String, String)>,
    housekeeping: bool,
}

impl JobSystemBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mutex_groups(mut self, mutex_groups: MutexGroups) -> Self {
        self.mutex_groups = mutex_groups;
        self
    }

    pub fn register<R>(mut self, runnable: R) -> Self
    where
        R: JobRunnable + 'static,
    {
        self.runnables.push(Arc::new(runnable));
        self
    }

    /// Adds a status calculator under `key`, usable in overrides.
    pub fn status_calculator(mut self, key: impl Into<String>, num_jobs: usize, max_failed: usize) -> Self {
        self.calculators.push((key.into(), num_jobs, max_failed));
        self
    }

    /// Judges `job_type` with the calculator registered under `key`.
    pub fn status_override(mut self, job_type: impl Into<String>, key: impl Into<String>) -> Self {
        self.status_overrides.push((job_type.into(), key.into()));
        self
    }

    /// Leaves cleanup to the caller (tests drive strategies directly).
    pub fn without_housekeeping(mut self) -> Self {
        self.housekeeping = false;
        self
    }

    pub fn start(self) -> anyhow::Result<JobSystem> {
        let config = self.config;
        config.validate().context("invalid job configuration")?;

        let store = build_store(&config).with_context(|| format!("failed to open the {} job store", config.store))?;
        let service = Arc::new(
            JobService::new(store, self.clock, &config.hostname).with_mutex_groups(self.mutex_groups),
        );

        let bus = Arc::new(
            ListenerBus::<JobEvent>::builder()
                .listener(crate::jobs::PersistenceJobEventListener::new(service.clone()))
                .listener(LoggingJobEventListener)
                .delivery_timeout(config.delivery_timeout())
                .build()
                .context("failed to start job event listeners")?,
        );
        let shared: SharedJobBus = bus.clone();

        let trigger = self
            .runnables
            .into_iter()
            .fold(JobTrigger::new(service.clone(), shared, config.keep_alive()), JobTrigger::register_shared);

        let mut indicator = JobStatusIndicator::new(StatusCalculator::warning_on_last_job_failed(service.clone()))
            .with_calculator(StatusCalculator::error_on_last_job_failed(service.clone()))
            .with_definitions(trigger.definitions());
        for (key, num_jobs, max_failed) in self.calculators {
            let calculator = StatusCalculator::new(key, num_jobs, max_failed, service.clone())
                .context("invalid status calculator")?;
            indicator = indicator.with_calculator(calculator);
        }
        for (job_type, key) in self.status_overrides {
            indicator = indicator
                .with_override(&job_type, &key)
                .with_context(|| format!("invalid status override for `{job_type}`"))?;
        }

        let housekeeping = if self.housekeeping {
            let handle = HousekeepingWorker::new()
                .with_strategy(StopDeadJobs::new(service.clone(), config.mark_dead_after()))
                .with_strategy(ClearDeadLocks::new(service.clone(), config.mark_dead_after()))
                .with_strategy(KeepLastJobs::per_type(service.clone(), config.keep_last_jobs))
                .with_strategy(DeleteSkippedJobs::new(service.clone(), config.keep_skipped_jobs))
                .spawn(config.cleanup_interval())
                .context("failed to spawn housekeeping worker")?;
            Some(handle)
        } else {
            None
        };

        info!(
            store = %config.store,
            hostname = %config.hostname,
            job_types = trigger.definitions().len(),
            "job system started"
        );

        Ok(JobSystem {
            service,
            bus,
            trigger,
            indicator,
            housekeeping,
        })
    }
}

/// A running set of job tracking components sharing one store and one bus.
pub struct JobSystem {
    service: Arc<JobService>,
    bus: Arc<ListenerBus<JobEvent>>,
    trigger: JobTrigger,
    indicator: JobStatusIndicator,
    housekeeping: Option<WorkerHandle>,
}

impl core::fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobSystem")
            .field("service", &self.service)
            .field("bus", &self.bus)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl JobSystem {
    pub fn builder(config: JobsConfig) -> JobSystemBuilder {
        JobSystemBuilder {
            config,
            clock: Arc::new(SystemClock),
            mutex_groups: MutexGroups::default(),
            runnables: Vec::new(),
            calculators: Vec::new(),
            status_overrides: Vec::new(),
            housekeeping: true,
        }
    }

    pub fn try_start(&self, job_type: &str) -> Result<StartOutcome, JobsError> {
        self.trigger.try_start(job_type)
    }

    pub fn status_for(&self, job_type: &str) -> StatusDetail {
        self.indicator.status_for(job_type)
    }

    pub fn service(&self) -> &Arc<JobService> {
        &self.service
    }

    pub fn bus(&self) -> &Arc<ListenerBus<JobEvent>> {
        &self.bus
    }

    pub fn trigger(&self) -> &JobTrigger {
        &self.trigger
    }

    pub fn indicator(&self) -> &JobStatusIndicator {
        &self.indicator
    }

    /// Waits for running jobs, then stops housekeeping and the bus.
    pub fn shutdown(self) {
        self.trigger.join_all();
        if let Some(handle) = self.housekeeping {
            handle.shutdown();
        }
        self.bus.shutdown();
        info!("job system stopped");
    }
}

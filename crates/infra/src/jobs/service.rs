//! Job lifecycle service.
//!
//! Owns the start path (disabled check, lock acquisition, record creation)
//! and every state transition of a [`JobRecord`]. Transitions are applied as
//! read → pure transition → conditional replace, so concurrent writers never
//! lose updates and a stopped record is never touched again.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use jobwarden_core::{Clock, DisabledJob, DomainResult, JobId, JobMessage, JobRecord, RunningJob};

use super::error::JobsError;
use super::lock::RunLockManager;
use super::mutex::MutexGroups;
use crate::job_store::JobStore;
use crate::repository::{JobMetaRepository, JobRepository, UpdateOutcome};

/// Result of asking to start a job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(JobId),
    AlreadyRunning,
    Disabled,
}

/// Result of applying a transition to a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The record was already stopped; nothing changed.
    AlreadyStopped,
    JobNotFound,
    /// A conditional kill found a fresh update; the job keeps running.
    StillAlive,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

#[derive(Debug, Clone)]
pub struct JobService {
    jobs: JobRepository,
    meta: JobMetaRepository,
    locks: RunLockManager,
    mutex_groups: MutexGroups,
    clock: Arc<dyn Clock>,
    hostname: String,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, hostname: impl Into<String>) -> Self {
        Self {
            jobs: JobRepository::new(store.clone()),
            meta: JobMetaRepository::new(store.clone()),
            locks: RunLockManager::new(store, clock.clone()),
            mutex_groups: MutexGroups::default(),
            clock,
            hostname: hostname.into(),
        }
    }

    pub fn with_mutex_groups(mut self, mutex_groups: MutexGroups) -> Self {
        self.mutex_groups = mutex_groups;
        self
    }

    /// Starts a job of `job_type` unless it is disabled or already running.
    ///
    /// On success the record exists and the run locks are held by the new id.
    pub fn try_start(&self, job_type: &str) -> Result<StartOutcome, JobsError> {
        let meta = self.meta.get(job_type)?;
        if meta.is_disabled() {
            info!(job_type, comment = meta.disabled_comment(), "job type is disabled, not starting");
            return Ok(StartOutcome::Disabled);
        }

        let job_id = JobId::new();
        let lock_set = self.mutex_groups.lock_set(job_type);
        if !self.locks.acquire_as(Some(&job_id), &lock_set) {
            debug!(job_type, "job type is already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        if let Err(err) = self.record_start(&job_id, job_type, self.clock.now()) {
            error!(job_id = %job_id, job_type, error = %err, "failed to create job record, releasing locks");
            self.release_run(&job_id, job_type);
            return Err(err);
        }

        info!(job_id = %job_id, job_type, "job started");
        Ok(StartOutcome::Started(job_id))
    }

    /// Creates the running record for `job_id`. Returns `false` if it
    /// already exists, which makes a repeated START harmless.
    pub fn record_start(&self, job_id: &JobId, job_type: &str, at: DateTime<Utc>) -> Result<bool, JobsError> {
        let record = JobRecord::new(job_id.clone(), job_type, &self.hostname, at);
        if !self.jobs.create(&record)? {
            debug!(job_id = %job_id, job_type, "job record already exists");
            return Ok(false);
        }
        self.meta.set_running(job_type, Some(job_id))?;
        Ok(true)
    }

    pub fn keep_alive(&self, job_id: &JobId) -> Result<TransitionOutcome, JobsError> {
        let now = self.clock.now();
        self.transition(job_id, |r| r.keep_alive(now))
    }

    /// Appends a message while the job is running. An `ERROR` message sets
    /// the record's status to `ERROR`.
    pub fn append_message(&self, job_id: &JobId, message: &JobMessage) -> Result<TransitionOutcome, JobsError> {
        if self.jobs.append_message(job_id, message)? {
            return Ok(TransitionOutcome::Applied);
        }
        match self.jobs.find_one(job_id)? {
            Some(_) => {
                debug!(job_id = %job_id, "ignoring message for stopped job");
                Ok(TransitionOutcome::AlreadyStopped)
            }
            None => Ok(TransitionOutcome::JobNotFound),
        }
    }

    pub fn restart(&self, job_id: &JobId) -> Result<TransitionOutcome, JobsError> {
        let now = self.clock.now();
        self.transition(job_id, |r| r.restart(now))
    }

    pub fn skip(&self, job_id: &JobId) -> Result<TransitionOutcome, JobsError> {
        let now = self.clock.now();
        self.finish(job_id, |r| r.skip(now))
    }

    pub fn stop(&self, job_id: &JobId) -> Result<TransitionOutcome, JobsError> {
        let now = self.clock.now();
        self.finish(job_id, |r| r.stop(now))
    }

    /// Forces a running record to `DEAD` and releases its locks.
    pub fn mark_dead(&self, job_id: &JobId) -> Result<TransitionOutcome, JobsError> {
        let now = self.clock.now();
        let outcome = self.finish(job_id, |r| r.kill(now))?;
        if outcome.is_applied() {
            warn!(job_id = %job_id, "job marked dead");
        }
        Ok(outcome)
    }

    /// Marks the job dead only while its last update is before `cutoff`.
    ///
    /// The check runs inside the versioned write, so a heartbeat landing
    /// between the sweep's scan and this call keeps the job alive.
    pub fn mark_dead_if_stale(&self, job_id: &JobId, cutoff: DateTime<Utc>) -> Result<TransitionOutcome, JobsError> {
        let now = self.clock.now();
        let outcome = self.finish(job_id, |r| r.kill_if_stale(cutoff, now))?;
        if outcome.is_applied() {
            warn!(job_id = %job_id, cutoff = %cutoff, "job marked dead");
        }
        Ok(outcome)
    }

    pub fn disable_job_type(&self, job_type: &str, comment: Option<&str>) -> Result<(), JobsError> {
        self.meta.disable(job_type, comment)?;
        info!(job_type, comment, "job type disabled");
        Ok(())
    }

    pub fn enable_job_type(&self, job_type: &str) -> Result<(), JobsError> {
        self.meta.enable(job_type)?;
        info!(job_type, "job type enabled");
        Ok(())
    }

    pub fn disabled_job_types(&self) -> Result<Vec<DisabledJob>, JobsError> {
        Ok(self.meta.disabled_job_types()?)
    }

    /// Running jobs as seen from the lock table, the source of truth.
    pub fn running_jobs(&self) -> Result<Vec<RunningJob>, JobsError> {
        Ok(self
            .locks
            .held_locks()?
            .into_iter()
            .map(|lock| RunningJob {
                job_id: lock.owner,
                job_type: lock.job_type,
            })
            .collect())
    }

    pub fn find_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, JobsError> {
        Ok(self.jobs.find_one(job_id)?)
    }

    /// The `n` most recently started records, optionally of one type.
    pub fn find_jobs(&self, job_type: Option<&str>, n: usize) -> Result<Vec<JobRecord>, JobsError> {
        Ok(match job_type {
            Some(job_type) => self.jobs.find_latest_by(job_type, n)?,
            None => self.jobs.find_latest(n)?,
        })
    }

    pub fn find_by_type(&self, job_type: &str) -> Result<Vec<JobRecord>, JobsError> {
        Ok(self.jobs.find_by_type(job_type)?)
    }

    pub fn find_latest_jobs_distinct(&self) -> Result<Vec<JobRecord>, JobsError> {
        Ok(self.jobs.find_latest_jobs_distinct()?)
    }

    pub fn find_running_without_update_since(&self, since: DateTime<Utc>) -> Result<Vec<JobRecord>, JobsError> {
        Ok(self.jobs.find_running_without_update_since(since)?)
    }

    /// Every job type that has records or metadata.
    pub fn job_types(&self) -> Result<BTreeSet<String>, JobsError> {
        let mut types = self.jobs.distinct_job_types()?;
        types.extend(self.meta.find_all_job_types()?);
        Ok(types)
    }

    /// Administrative purge of stopped records. Running records stay.
    pub fn delete_jobs(&self, job_type: Option<&str>) -> Result<usize, JobsError> {
        let ids: Vec<JobId> = self
            .jobs
            .find_stopped(job_type)?
            .iter()
            .map(|r| r.id().clone())
            .collect();
        let deleted = self.jobs.delete_many(&ids)?;
        info!(job_type, deleted, "deleted stopped jobs");
        Ok(deleted)
    }

    pub fn set_value(&self, job_type: &str, key: &str, value: &str) -> Result<(), JobsError> {
        Ok(self.meta.set_value(job_type, key, value)?)
    }

    /// Returns `false` if the key was already set.
    pub fn create_value(&self, job_type: &str, key: &str, value: &str) -> Result<bool, JobsError> {
        Ok(self.meta.create_value(job_type, key, value)?)
    }

    pub fn get_value(&self, job_type: &str, key: &str) -> Result<Option<String>, JobsError> {
        Ok(self.meta.get_value(job_type, key)?)
    }

    pub fn jobs(&self) -> &JobRepository {
        &self.jobs
    }

    pub fn meta(&self) -> &JobMetaRepository {
        &self.meta
    }

    pub fn locks(&self) -> &RunLockManager {
        &self.locks
    }

    pub fn mutex_groups(&self) -> &MutexGroups {
        &self.mutex_groups
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn transition<F>(&self, job_id: &JobId, transition: F) -> Result<TransitionOutcome, JobsError>
    where
        F: FnMut(&mut JobRecord) -> DomainResult<()>,
    {
        match self.jobs.update(job_id, transition)? {
            UpdateOutcome::Updated(()) => Ok(TransitionOutcome::Applied),
            UpdateOutcome::NotFound => Ok(TransitionOutcome::JobNotFound),
            UpdateOutcome::Rejected(err) if err.is_invalid_transition() => {
                debug!(job_id = %job_id, reason = %err, "ignoring late transition");
                Ok(TransitionOutcome::AlreadyStopped)
            }
            UpdateOutcome::Rejected(err) => Err(err.into()),
        }
    }

    // Terminal transitions release the run only if they actually applied.
    fn finish<F>(&self, job_id: &JobId, mut transition: F) -> Result<TransitionOutcome, JobsError>
    where
        F: FnMut(&mut JobRecord) -> DomainResult<()>,
    {
        let outcome = self.jobs.update(job_id, |record| {
            transition(record)?;
            Ok(record.job_type().to_string())
        })?;
        match outcome {
            UpdateOutcome::Updated(job_type) => {
                self.release_run(job_id, &job_type);
                Ok(TransitionOutcome::Applied)
            }
            UpdateOutcome::NotFound => Ok(TransitionOutcome::JobNotFound),
            UpdateOutcome::Rejected(err) if err.is_invalid_transition() => {
                debug!(job_id = %job_id, reason = %err, "ignoring late transition");
                Ok(TransitionOutcome::AlreadyStopped)
            }
            UpdateOutcome::Rejected(err) if err.is_still_alive() => {
                debug!(job_id = %job_id, reason = %err, "job updated since the cutoff, not terminating");
                Ok(TransitionOutcome::StillAlive)
            }
            UpdateOutcome::Rejected(err) => Err(err.into()),
        }
    }

    // The mirror is cleared while the lock is still held, so it never races
    // the next run's start. Failures leave an orphaned lock for
    // ClearDeadLocks to pick up.
    fn release_run(&self, job_id: &JobId, job_type: &str) {
        if let Err(err) = self.meta.clear_running(job_type, job_id) {
            warn!(job_id = %job_id, job_type, error = %err, "failed to clear running job");
        }
        let lock_set = self.mutex_groups.lock_set(job_type);
        if let Err(err) = self.locks.release_owned(job_id, &lock_set) {
            error!(job_id = %job_id, job_type, error = %err, "failed to release run locks");
        }
    }
}

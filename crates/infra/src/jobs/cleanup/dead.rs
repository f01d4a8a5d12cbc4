use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use super::CleanupStrategy;
use crate::jobs::error::JobsError;
use crate::jobs::service::JobService;

/// Marks running records `DEAD` once their last update is older than
/// `alive_for`, releasing their locks.
#[derive(Debug, Clone)]
pub struct StopDeadJobs {
    service: Arc<JobService>,
    alive_for: Duration,
}

impl StopDeadJobs {
    pub fn new(service: Arc<JobService>, alive_for: Duration) -> Self {
        Self { service, alive_for }
    }
}

impl CleanupStrategy for StopDeadJobs {
    fn name(&self) -> &str {
        "stop-dead-jobs"
    }

    fn run(&self) -> Result<usize, JobsError> {
        let cutoff = self.service.clock().now() - self.alive_for;
        let mut killed = 0;
        for record in self.service.find_running_without_update_since(cutoff)? {
            if self.service.mark_dead_if_stale(record.id(), cutoff)?.is_applied() {
                killed += 1;
            }
        }
        Ok(killed)
    }
}

/// Releases locks whose owning job is gone or already stopped.
///
/// Covers a crash between stopping a record and releasing its locks.
/// Anonymous locks carry no owner to check and are left alone. A lock whose
/// owner has no record yet is only cleared once it is older than `grace`:
/// starting a job takes the lock before it writes the record.
#[derive(Debug, Clone)]
pub struct ClearDeadLocks {
    service: Arc<JobService>,
    grace: Duration,
}

impl ClearDeadLocks {
    pub fn new(service: Arc<JobService>, grace: Duration) -> Self {
        Self { service, grace }
    }
}

impl CleanupStrategy for ClearDeadLocks {
    fn name(&self) -> &str {
        "clear-dead-locks"
    }

    fn run(&self) -> Result<usize, JobsError> {
        let settled_before = self.service.clock().now() - self.grace;
        let mut cleared = 0;
        for lock in self.service.locks().held_locks()? {
            let Some(owner) = lock.owner else { continue };
            let orphaned = match self.service.find_job(&owner)? {
                Some(record) => record.is_stopped(),
                None => lock.created_at < settled_before,
            };
            if !orphaned {
                continue;
            }

            warn!(job_type = %lock.job_type, job_id = %owner, "releasing lock of finished job");
            self.service
                .locks()
                .release_owned(&owner, &BTreeSet::from([lock.job_type.clone()]))?;
            self.service.meta().clear_running(&lock.job_type, &owner)?;
            cleared += 1;
        }
        if cleared > 0 {
            info!(cleared, "cleared dead locks");
        }
        Ok(cleared)
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use jobwarden_core::{JobId, JobRecord, JobStatus};

use super::CleanupStrategy;
use crate::jobs::error::JobsError;
use crate::jobs::service::JobService;

/// Which records a [`KeepLastJobs`] count applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionScope {
    /// The count applies to each job type separately.
    PerType,
    /// The count applies across all job types.
    Global,
    /// Only records of this job type are considered.
    JobType(String),
}

/// Keeps the `keep` most recently started stopped records and deletes the
/// older ones. The newest `OK` record of each job type is always kept so a
/// run of failures cannot erase the last success.
#[derive(Debug, Clone)]
pub struct KeepLastJobs {
    service: Arc<JobService>,
    keep: usize,
    scope: RetentionScope,
}

impl KeepLastJobs {
    pub fn new(service: Arc<JobService>, keep: usize, scope: RetentionScope) -> Self {
        Self { service, keep, scope }
    }

    pub fn per_type(service: Arc<JobService>, keep: usize) -> Self {
        Self::new(service, keep, RetentionScope::PerType)
    }

    fn expendable(&self, stopped: Vec<JobRecord>) -> Vec<JobId> {
        let last_success: BTreeSet<JobId> = latest_per_type(
            stopped.iter().filter(|r| r.status() == JobStatus::Ok),
        );

        let groups: Vec<Vec<&JobRecord>> = match self.scope {
            RetentionScope::PerType => group_by_type(&stopped).into_values().collect(),
            RetentionScope::Global | RetentionScope::JobType(_) => vec![stopped.iter().collect()],
        };

        groups
            .into_iter()
            .flat_map(|group| group.into_iter().skip(self.keep))
            .filter(|r| !last_success.contains(r.id()))
            .map(|r| r.id().clone())
            .collect()
    }
}

impl CleanupStrategy for KeepLastJobs {
    fn name(&self) -> &str {
        "keep-last-jobs"
    }

    fn run(&self) -> Result<usize, JobsError> {
        let job_type = match &self.scope {
            RetentionScope::JobType(job_type) => Some(job_type.as_str()),
            _ => None,
        };
        let stopped = self.service.jobs().find_stopped(job_type)?;
        let ids = self.expendable(stopped);
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.service.jobs().delete_many(&ids)?)
    }
}

/// Keeps the `keep` newest skipped records of each job type.
#[derive(Debug, Clone)]
pub struct DeleteSkippedJobs {
    service: Arc<JobService>,
    keep: usize,
}

impl DeleteSkippedJobs {
    pub fn new(service: Arc<JobService>, keep: usize) -> Self {
        Self { service, keep }
    }
}

impl CleanupStrategy for DeleteSkippedJobs {
    fn name(&self) -> &str {
        "delete-skipped-jobs"
    }

    fn run(&self) -> Result<usize, JobsError> {
        let skipped = self.service.jobs().find_stopped_with_status(JobStatus::Skipped)?;
        let ids: Vec<JobId> = group_by_type(&skipped)
            .into_values()
            .flat_map(|group| group.into_iter().skip(self.keep))
            .map(|r| r.id().clone())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.service.jobs().delete_many(&ids)?)
    }
}

// Input is newest first; so is every group.
fn group_by_type(records: &[JobRecord]) -> BTreeMap<&str, Vec<&JobRecord>> {
    let mut groups: BTreeMap<&str, Vec<&JobRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.job_type()).or_default().push(record);
    }
    groups
}

fn latest_per_type<'a>(records: impl Iterator<Item = &'a JobRecord>) -> BTreeSet<JobId> {
    let mut seen = BTreeSet::new();
    records
        .filter(|r| seen.insert(r.job_type().to_string()))
        .map(|r| r.id().clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::InMemoryJobStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use jobwarden_core::{JobMessage, ManualClock};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn service() -> Arc<JobService> {
        Arc::new(JobService::new(
            InMemoryJobStore::arc(),
            Arc::new(ManualClock::new(t0())),
            "host-a",
        ))
    }

    // Creates a stopped record started `i` seconds after t0.
    fn finished(svc: &JobService, id: &str, job_type: &str, i: i64, status: JobStatus) -> JobId {
        let id: JobId = id.parse().unwrap();
        svc.record_start(&id, job_type, t0() + Duration::seconds(i)).unwrap();
        match status {
            JobStatus::Ok => {}
            JobStatus::Error => {
                svc.append_message(&id, &JobMessage::error("failed", t0())).unwrap();
            }
            JobStatus::Skipped => {
                svc.skip(&id).unwrap();
                return id;
            }
            JobStatus::Dead => {
                svc.mark_dead(&id).unwrap();
                return id;
            }
        }
        svc.stop(&id).unwrap();
        id
    }

    fn remaining(svc: &JobService) -> Vec<String> {
        let mut ids: Vec<String> = svc.jobs().find_all().unwrap().iter().map(|r| r.id().to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn keeps_last_success_outside_window() {
        let svc = service();
        finished(&svc, "ok", "ingest", 0, JobStatus::Ok);
        for i in 1..=4 {
            finished(&svc, &format!("err{i}"), "ingest", i, JobStatus::Error);
        }

        let strategy = KeepLastJobs::per_type(svc.clone(), 2);
        assert_eq!(strategy.run().unwrap(), 2);
        assert_eq!(remaining(&svc), vec!["err3", "err4", "ok"]);

        assert_eq!(strategy.run().unwrap(), 0);
    }

    #[test]
    fn running_records_are_never_deleted() {
        let svc = service();
        let running: JobId = "running".parse().unwrap();
        svc.record_start(&running, "ingest", t0()).unwrap();
        finished(&svc, "a", "ingest", 1, JobStatus::Error);
        finished(&svc, "b", "ingest", 2, JobStatus::Error);

        KeepLastJobs::per_type(svc.clone(), 0).run().unwrap();
        assert_eq!(remaining(&svc), vec!["running"]);
    }

    #[test]
    fn scopes_limit_what_is_considered() {
        let svc = service();
        finished(&svc, "a1", "a", 0, JobStatus::Error);
        finished(&svc, "a2", "a", 1, JobStatus::Error);
        finished(&svc, "b1", "b", 2, JobStatus::Error);

        KeepLastJobs::new(svc.clone(), 0, RetentionScope::JobType("b".into())).run().unwrap();
        assert_eq!(remaining(&svc), vec!["a1", "a2"]);

        KeepLastJobs::new(svc.clone(), 1, RetentionScope::Global).run().unwrap();
        assert_eq!(remaining(&svc), vec!["a2"]);
    }

    #[test]
    fn delete_skipped_keeps_newest_per_type() {
        let svc = service();
        for i in 0..3 {
            finished(&svc, &format!("s{i}"), "ingest", i, JobStatus::Skipped);
        }
        finished(&svc, "ok", "ingest", 5, JobStatus::Ok);

        assert_eq!(DeleteSkippedJobs::new(svc.clone(), 1).run().unwrap(), 2);
        assert_eq!(remaining(&svc), vec!["ok", "s2"]);
    }
}

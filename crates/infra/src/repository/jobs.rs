use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use jobwarden_core::{DomainResult, JobId, JobMessage, JobRecord, JobStatus, Level};

use super::{UpdateOutcome, decode, encode, update_with};
use crate::job_store::{AppendOptions, Collection, Condition, JobStore, ScanQuery, StoreError};

pub const FIELD_JOB_TYPE: &str = "job_type";
pub const FIELD_STARTED: &str = "started";
pub const FIELD_LAST_UPDATED: &str = "last_updated";
pub const FIELD_STOPPED: &str = "stopped";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_MESSAGES: &str = "messages";

/// Persistence of [`JobRecord`]s, keyed by job id.
#[derive(Debug, Clone)]
pub struct JobRepository {
    store: Arc<dyn JobStore>,
}

impl JobRepository {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Returns `false` if a record with this id already exists.
    pub fn create(&self, record: &JobRecord) -> Result<bool, StoreError> {
        self.store
            .create_if_absent(Collection::Jobs, record.id().as_str(), encode(record)?)
    }

    pub fn find_one(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        self.store
            .get(Collection::Jobs, id.as_str())?
            .map(|doc| decode(Collection::Jobs, &doc))
            .transpose()
    }

    /// The `n` most recently started records of any type.
    pub fn find_latest(&self, n: usize) -> Result<Vec<JobRecord>, StoreError> {
        self.query(ScanQuery::all().newest_first(FIELD_STARTED).limit(n))
    }

    /// The `n` most recently started records of one type.
    pub fn find_latest_by(&self, job_type: &str, n: usize) -> Result<Vec<JobRecord>, StoreError> {
        self.query(
            ScanQuery::all()
                .filter(Condition::eq(FIELD_JOB_TYPE, job_type))
                .newest_first(FIELD_STARTED)
                .limit(n),
        )
    }

    /// All records of one type, newest first.
    pub fn find_by_type(&self, job_type: &str) -> Result<Vec<JobRecord>, StoreError> {
        self.query(
            ScanQuery::all()
                .filter(Condition::eq(FIELD_JOB_TYPE, job_type))
                .newest_first(FIELD_STARTED),
        )
    }

    pub fn find_all(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.query(ScanQuery::all().newest_first(FIELD_STARTED))
    }

    /// Stopped records, optionally of one type, newest first.
    pub fn find_stopped(&self, job_type: Option<&str>) -> Result<Vec<JobRecord>, StoreError> {
        let mut query = ScanQuery::all().filter(Condition::exists(FIELD_STOPPED));
        if let Some(job_type) = job_type {
            query = query.filter(Condition::eq(FIELD_JOB_TYPE, job_type));
        }
        self.query(query.newest_first(FIELD_STARTED))
    }

    /// Stopped records with the given status, newest first.
    pub fn find_stopped_with_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError> {
        self.query(
            ScanQuery::all()
                .filter(Condition::exists(FIELD_STOPPED))
                .filter(Condition::eq(FIELD_STATUS, status.as_str()))
                .newest_first(FIELD_STARTED),
        )
    }

    /// Running records whose `last_updated` is strictly before `since`.
    pub fn find_running_without_update_since(&self, since: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        self.query(
            ScanQuery::all()
                .filter(Condition::missing(FIELD_STOPPED))
                .filter(Condition::before(FIELD_LAST_UPDATED, since))
                .newest_first(FIELD_STARTED),
        )
    }

    /// The latest record of every job type.
    pub fn find_latest_jobs_distinct(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut seen = BTreeSet::new();
        Ok(self
            .find_all()?
            .into_iter()
            .filter(|r| seen.insert(r.job_type().to_string()))
            .collect())
    }

    pub fn distinct_job_types(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .find_all()?
            .into_iter()
            .map(|r| r.job_type().to_string())
            .collect())
    }

    /// Read-modify-write of one record through a pure transition.
    pub fn update<R, F>(&self, id: &JobId, transition: F) -> Result<UpdateOutcome<R>, StoreError>
    where
        F: FnMut(&mut JobRecord) -> DomainResult<R>,
    {
        update_with(self.store.as_ref(), Collection::Jobs, id.as_str(), transition)
    }

    /// Appends a message while the record is still running.
    ///
    /// One atomic store write: append, move `last_updated` forward, and force
    /// `ERROR` status for error-level messages. Returns `false` if the record
    /// is missing or already stopped.
    pub fn append_message(&self, id: &JobId, message: &JobMessage) -> Result<bool, StoreError> {
        let mut options = AppendOptions::new()
            .only_if(Condition::missing(FIELD_STOPPED))
            .advance(FIELD_LAST_UPDATED, message.timestamp);
        if message.level == Level::Error {
            options = options.set(FIELD_STATUS, json!(JobStatus::Error.as_str()));
        }
        self.store
            .append_to_list(Collection::Jobs, id.as_str(), FIELD_MESSAGES, encode(message)?, &options)
    }

    /// Deletes the record only if it is stopped. Stopped is absorbing, so the
    /// check cannot be invalidated between read and delete.
    pub fn remove_if_stopped(&self, id: &JobId) -> Result<bool, StoreError> {
        match self.find_one(id)? {
            Some(record) if record.is_stopped() => self.store.delete(Collection::Jobs, id.as_str()),
            _ => Ok(false),
        }
    }

    /// Deletes records by id. Callers must only pass stopped records.
    pub fn delete_many(&self, ids: &[JobId]) -> Result<usize, StoreError> {
        let keys: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        self.store.delete_batch(Collection::Jobs, &keys)
    }

    fn query(&self, query: ScanQuery) -> Result<Vec<JobRecord>, StoreError> {
        self.store
            .scan(Collection::Jobs, &query)?
            .iter()
            .map(|doc| decode(Collection::Jobs, doc))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::InMemoryJobStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn repo() -> JobRepository {
        JobRepository::new(Arc::new(InMemoryJobStore::new()))
    }

    fn record(id: &str, job_type: &str, started: DateTime<Utc>) -> JobRecord {
        JobRecord::new(id.parse().unwrap(), job_type, "host", started)
    }

    #[test]
    fn create_is_exactly_once() {
        let repo = repo();
        let r = record("J1", "ingest", t0());
        assert!(repo.create(&r).unwrap());
        assert!(!repo.create(&r).unwrap());
        assert_eq!(repo.find_one(r.id()).unwrap(), Some(r));
    }

    #[test]
    fn append_message_sets_error_and_refuses_stopped_records() {
        let repo = repo();
        let r = record("J1", "ingest", t0());
        repo.create(&r).unwrap();

        let msg = JobMessage::error("disk full", t0() + Duration::seconds(3));
        assert!(repo.append_message(r.id(), &msg).unwrap());

        let stored = repo.find_one(r.id()).unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Error);
        assert_eq!(stored.messages(), &[msg]);
        assert_eq!(stored.last_updated(), t0() + Duration::seconds(3));

        repo.update(r.id(), |rec| rec.stop(t0() + Duration::seconds(4))).unwrap();
        let late = JobMessage::info("late", t0() + Duration::seconds(5));
        assert!(!repo.append_message(r.id(), &late).unwrap());
        assert_eq!(repo.find_one(r.id()).unwrap().unwrap().messages().len(), 1);
    }

    #[test]
    fn update_reports_missing_and_rejected() {
        let repo = repo();
        let missing: JobId = "nope".parse().unwrap();
        assert!(matches!(
            repo.update(&missing, |r| r.stop(t0())).unwrap(),
            UpdateOutcome::NotFound
        ));

        let r = record("J1", "ingest", t0());
        repo.create(&r).unwrap();
        assert!(matches!(
            repo.update(r.id(), |r| r.stop(t0())).unwrap(),
            UpdateOutcome::Updated(())
        ));
        assert!(matches!(
            repo.update(r.id(), |r| r.stop(t0())).unwrap(),
            UpdateOutcome::Rejected(_)
        ));
    }

    #[test]
    fn latest_queries_are_newest_first() {
        let repo = repo();
        for (i, ty) in ["a", "b", "a", "b"].iter().enumerate() {
            repo.create(&record(&format!("J{i}"), ty, t0() + Duration::seconds(i as i64)))
                .unwrap();
        }

        let latest: Vec<_> = repo.find_latest(2).unwrap().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(latest, vec!["J3", "J2"]);

        let by_type: Vec<_> = repo.find_latest_by("a", 5).unwrap().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(by_type, vec!["J2", "J0"]);

        let distinct: Vec<_> = repo
            .find_latest_jobs_distinct()
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(distinct, vec!["J3", "J2"]);
    }

    #[test]
    fn running_without_update_uses_strict_threshold() {
        let repo = repo();
        repo.create(&record("old", "a", t0())).unwrap();
        repo.create(&record("fresh", "b", t0() + Duration::seconds(10))).unwrap();

        let stale = repo.find_running_without_update_since(t0() + Duration::seconds(10)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id().as_str(), "old");
    }

    #[test]
    fn remove_if_stopped_leaves_running_records() {
        let repo = repo();
        let r = record("J1", "ingest", t0());
        repo.create(&r).unwrap();
        assert!(!repo.remove_if_stopped(r.id()).unwrap());

        repo.update(r.id(), |rec| rec.stop(t0())).unwrap();
        assert!(repo.remove_if_stopped(r.id()).unwrap());
        assert!(repo.find_one(r.id()).unwrap().is_none());
    }
}

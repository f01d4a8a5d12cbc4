use std::collections::BTreeSet;
use std::sync::Arc;

use jobwarden_core::{DisabledJob, DomainError, JobId, JobMeta};

use super::{UpdateOutcome, decode, encode, update_with};
use crate::job_store::{Collection, JobStore, ScanQuery, StoreError};

/// Per-job-type control state. Documents are created lazily on first access.
#[derive(Debug, Clone)]
pub struct JobMetaRepository {
    store: Arc<dyn JobStore>,
}

impl JobMetaRepository {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, job_type: &str) -> Result<JobMeta, StoreError> {
        match self.store.get(Collection::JobMeta, job_type)? {
            Some(doc) => decode(Collection::JobMeta, &doc),
            None => {
                let meta = JobMeta::new(job_type);
                self.store
                    .create_if_absent(Collection::JobMeta, job_type, encode(&meta)?)?;
                Ok(meta)
            }
        }
    }

    /// Records (or clears) the advisory running-job mirror.
    pub fn set_running(&self, job_type: &str, job_id: Option<&JobId>) -> Result<(), StoreError> {
        let job_id = job_id.cloned();
        self.modify(job_type, |meta| {
            meta.running_job_id = job_id.clone();
            Ok(())
        })
        .map(|_| ())
    }

    /// Clears the mirror only if it still names `job_id`.
    pub fn clear_running(&self, job_type: &str, job_id: &JobId) -> Result<(), StoreError> {
        self.modify(job_type, |meta| {
            if meta.running_job_id.as_ref() == Some(job_id) {
                meta.running_job_id = None;
            }
            Ok(())
        })
        .map(|_| ())
    }

    pub fn disable(&self, job_type: &str, comment: Option<&str>) -> Result<(), StoreError> {
        let comment = comment.filter(|c| !c.trim().is_empty()).map(str::to_string);
        self.modify(job_type, |meta| {
            meta.disabled = true;
            meta.disabled_comment = comment.clone();
            Ok(())
        })
        .map(|_| ())
    }

    pub fn enable(&self, job_type: &str) -> Result<(), StoreError> {
        self.modify(job_type, |meta| {
            meta.disabled = false;
            meta.disabled_comment = None;
            Ok(())
        })
        .map(|_| ())
    }

    /// Upserts a job-specific attribute.
    pub fn set_value(&self, job_type: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.modify(job_type, |meta| {
            meta.attributes.insert(key.to_string(), value.to_string());
            Ok(())
        })
        .map(|_| ())
    }

    /// Creates an attribute exactly once. Returns `false` if it already existed.
    pub fn create_value(&self, job_type: &str, key: &str, value: &str) -> Result<bool, StoreError> {
        self.modify(job_type, |meta| {
            if meta.attributes.contains_key(key) {
                return Err(DomainError::validation(format!("attribute `{key}` already set")));
            }
            meta.attributes.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    pub fn get_value(&self, job_type: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(job_type)?.attribute(key).map(str::to_string))
    }

    pub fn find_all(&self) -> Result<Vec<JobMeta>, StoreError> {
        self.store
            .scan(Collection::JobMeta, &ScanQuery::all())?
            .iter()
            .map(|doc| decode(Collection::JobMeta, doc))
            .collect()
    }

    pub fn find_all_job_types(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.find_all()?.into_iter().map(|m| m.job_type).collect())
    }

    pub fn disabled_job_types(&self) -> Result<Vec<DisabledJob>, StoreError> {
        Ok(self
            .find_all()?
            .into_iter()
            .filter(JobMeta::is_disabled)
            .map(|m| DisabledJob {
                comment: m.disabled_comment().to_string(),
                job_type: m.job_type,
            })
            .collect())
    }

    // `Ok(false)` when the transition declined to write.
    fn modify<F>(&self, job_type: &str, transition: F) -> Result<bool, StoreError>
    where
        F: FnMut(&mut JobMeta) -> jobwarden_core::DomainResult<()>,
    {
        self.get(job_type)?;
        match update_with(self.store.as_ref(), Collection::JobMeta, job_type, transition)? {
            UpdateOutcome::Updated(()) => Ok(true),
            UpdateOutcome::Rejected(_) => Ok(false),
            // Removed between the lazy create and the update.
            UpdateOutcome::NotFound => Err(StoreError::conflict(Collection::JobMeta, job_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::InMemoryJobStore;

    fn repo() -> JobMetaRepository {
        JobMetaRepository::new(Arc::new(InMemoryJobStore::new()))
    }

    #[test]
    fn meta_is_created_lazily() {
        let repo = repo();
        assert!(repo.find_all().unwrap().is_empty());
        let meta = repo.get("ingest").unwrap();
        assert_eq!(meta, JobMeta::new("ingest"));
        assert_eq!(repo.find_all_job_types().unwrap().len(), 1);
    }

    #[test]
    fn create_value_is_exactly_once() {
        let repo = repo();
        assert!(repo.create_value("ingest", "cursor", "1").unwrap());
        assert!(!repo.create_value("ingest", "cursor", "2").unwrap());
        assert_eq!(repo.get_value("ingest", "cursor").unwrap().as_deref(), Some("1"));

        repo.set_value("ingest", "cursor", "3").unwrap();
        assert_eq!(repo.get_value("ingest", "cursor").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn disable_and_enable() {
        let repo = repo();
        repo.disable("ingest", Some("maintenance")).unwrap();
        repo.disable("export", None).unwrap();

        let mut disabled = repo.disabled_job_types().unwrap();
        disabled.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        assert_eq!(
            disabled,
            vec![
                DisabledJob { job_type: "export".into(), comment: String::new() },
                DisabledJob { job_type: "ingest".into(), comment: "maintenance".into() },
            ]
        );

        repo.enable("ingest").unwrap();
        assert_eq!(repo.disabled_job_types().unwrap().len(), 1);
    }

    #[test]
    fn clear_running_only_clears_matching_owner() {
        let repo = repo();
        let a: JobId = "A".parse().unwrap();
        let b: JobId = "B".parse().unwrap();
        repo.set_running("ingest", Some(&b)).unwrap();

        repo.clear_running("ingest", &a).unwrap();
        assert_eq!(repo.get("ingest").unwrap().running_job_id, Some(b.clone()));

        repo.clear_running("ingest", &b).unwrap();
        assert!(!repo.get("ingest").unwrap().is_running());
    }
}

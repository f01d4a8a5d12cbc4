use std::sync::Arc;

use jobwarden_core::RunLock;

use super::{decode, encode};
use crate::job_store::{Collection, JobStore, ScanQuery, StoreError};

/// Raw access to run-lock documents, keyed by job type.
///
/// Ordering and rollback live in [`RunLockManager`](crate::jobs::RunLockManager);
/// this type only maps documents.
#[derive(Debug, Clone)]
pub struct RunLockRepository {
    store: Arc<dyn JobStore>,
}

impl RunLockRepository {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Atomic create-if-absent; `false` means somebody else holds the lock.
    pub fn create(&self, lock: &RunLock) -> Result<bool, StoreError> {
        self.store
            .create_if_absent(Collection::RunLocks, &lock.job_type, encode(lock)?)
    }

    /// Returns `false` if there was no lock.
    pub fn delete(&self, job_type: &str) -> Result<bool, StoreError> {
        self.store.delete(Collection::RunLocks, job_type)
    }

    pub fn find(&self, job_type: &str) -> Result<Option<RunLock>, StoreError> {
        self.store
            .get(Collection::RunLocks, job_type)?
            .map(|doc| decode(Collection::RunLocks, &doc))
            .transpose()
    }

    pub fn find_all(&self) -> Result<Vec<RunLock>, StoreError> {
        self.store
            .scan(Collection::RunLocks, &ScanQuery::all())?
            .iter()
            .map(|doc| decode(Collection::RunLocks, doc))
            .collect()
    }
}

//! Cluster-wide run locks keyed by job type.
//!
//! A lock is a document in the `run_locks` collection created with the
//! store's atomic create-if-absent. Multi-type requests are acquired in one
//! fixed global order (case-insensitive, then by exact spelling) and released
//! in the reverse order, so overlapping requests can never wait on each other
//! in a cycle. A failed request rolls back whatever it acquired before
//! returning.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, warn};

use jobwarden_core::{Clock, JobId, RunLock};

use crate::job_store::{JobStore, StoreError};
use crate::repository::RunLockRepository;

/// Sorts and de-duplicates job types into acquisition order.
pub fn lock_order<'a, I>(job_types: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut order: Vec<&str> = job_types.into_iter().map(String::as_str).collect();
    order.sort_by(|a, b| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });
    order.dedup();
    order
}

#[derive(Debug, Clone)]
pub struct RunLockManager {
    locks: RunLockRepository,
    clock: Arc<dyn Clock>,
}

impl RunLockManager {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: RunLockRepository::new(store),
            clock,
        }
    }

    /// Acquires every lock in `job_types` or none of them.
    ///
    /// Store failures (including timeouts) count as "not acquired".
    pub fn acquire(&self, job_types: &BTreeSet<String>) -> bool {
        self.acquire_as(None, job_types)
    }

    /// Like [`acquire`](Self::acquire), recording `owner` on each lock.
    pub fn acquire_as(&self, owner: Option<&JobId>, job_types: &BTreeSet<String>) -> bool {
        let order = lock_order(job_types);
        let now = self.clock.now();
        let mut acquired: Vec<&str> = Vec::with_capacity(order.len());

        for &job_type in &order {
            let lock = RunLock::new(job_type, now, owner.cloned());
            match self.locks.create(&lock) {
                Ok(true) => acquired.push(job_type),
                Ok(false) => {
                    debug!(job_type, "run lock already held");
                    self.rollback(&acquired);
                    return false;
                }
                Err(err) => {
                    warn!(job_type, error = %err, "run lock acquisition failed");
                    self.rollback(&acquired);
                    return false;
                }
            }
        }
        true
    }

    /// Releases in reverse acquisition order. Unlocked types are skipped.
    ///
    /// Every lock is attempted even if an earlier delete fails; the first
    /// failure is returned.
    pub fn release(&self, job_types: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut first_error = None;
        for job_type in lock_order(job_types).into_iter().rev() {
            if let Err(err) = self.locks.delete(job_type) {
                error!(job_type, error = %err, "failed to release run lock");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn release_one(&self, job_type: &str) -> Result<bool, StoreError> {
        self.locks.delete(job_type)
    }

    /// Releases the locks in `job_types` that are anonymous or held by `owner`.
    /// Locks held by another job are left alone.
    pub fn release_owned(&self, owner: &JobId, job_types: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut first_error = None;
        for job_type in lock_order(job_types).into_iter().rev() {
            let result = match self.locks.find(job_type) {
                Ok(Some(lock)) if lock.owner.as_ref().is_none_or(|o| o == owner) => {
                    self.locks.delete(job_type).map(|_| ())
                }
                Ok(Some(lock)) => {
                    debug!(job_type, owner = ?lock.owner, job_id = %owner, "run lock belongs to another job");
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                error!(job_type, error = %err, "failed to release run lock");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_locked(&self, job_type: &str) -> Result<bool, StoreError> {
        Ok(self.locks.find(job_type)?.is_some())
    }

    pub fn held_locks(&self) -> Result<Vec<RunLock>, StoreError> {
        self.locks.find_all()
    }

    fn rollback(&self, acquired: &[&str]) {
        for job_type in acquired.iter().rev() {
            if let Err(err) = self.locks.delete(job_type) {
                error!(job_type, error = %err, "failed to roll back run lock");
            }
        }
    }
}

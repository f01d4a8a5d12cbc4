//! Domain error model.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::id::JobId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, state machine
/// violations). Storage concerns belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state-changing event arrived for a job that is already stopped.
    ///
    /// The stopped state is absorbing; callers treat this as "ignore".
    #[error("job {job_id} is already stopped, ignoring {attempted}")]
    InvalidTransition {
        job_id: JobId,
        attempted: &'static str,
    },

    /// A conditional kill found the job updated after the dead cutoff.
    #[error("job {job_id} was updated at {last_updated}, it is still alive")]
    StillAlive {
        job_id: JobId,
        last_updated: DateTime<Utc>,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(job_id: &JobId, attempted: &'static str) -> Self {
        Self::InvalidTransition {
            job_id: job_id.clone(),
            attempted,
        }
    }

    pub fn still_alive(job_id: &JobId, last_updated: DateTime<Utc>) -> Self {
        Self::StillAlive {
            job_id: job_id.clone(),
            last_updated,
        }
    }

    pub fn is_still_alive(&self) -> bool {
        matches!(self, Self::StillAlive { .. })
    }

    /// True for the "late event after termination" case.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

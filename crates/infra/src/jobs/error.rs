use thiserror::Error;

use jobwarden_core::DomainError;

use crate::job_store::StoreError;

/// Errors surfaced by the job tracking services.
///
/// Missing jobs and late transitions are not errors here; they are reported
/// through [`TransitionOutcome`](super::TransitionOutcome).
#[derive(Debug, Error)]
pub enum JobsError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

impl From<serde_json::Error> for JobsError {
    fn from(value: serde_json::Error) -> Self {
        JobsError::Codec(value.to_string())
    }
}

use std::time::Duration;

use thiserror::Error;

use jobwarden_events::JobEventPublisher;

/// Static description of a job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub job_type: String,
    pub job_name: String,
    pub description: String,
    /// A successful run older than this makes the job's status a warning.
    pub max_age: Option<Duration>,
    /// How often a failing body is retried before the job gives up.
    pub restarts: u32,
    pub retry_delay: Option<Duration>,
}

impl JobDefinition {
    pub fn new(job_type: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            job_name: job_name.into(),
            description: String::new(),
            max_age: None,
            restarts: 0,
            retry_delay: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_retries(mut self, restarts: u32, retry_delay: Duration) -> Self {
        self.restarts = restarts;
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.restarts > 0
    }

    pub fn matches(&self, job_type: &str) -> bool {
        self.job_type.eq_ignore_ascii_case(job_type)
    }
}

/// Failure of a job body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct JobFailure(String);

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// A unit of work that can be triggered by job type.
///
/// `execute` reports progress through `publisher`; returning `Ok(false)`
/// means there was nothing to do and the run is recorded as skipped.
pub trait JobRunnable: Send + Sync {
    fn definition(&self) -> &JobDefinition;

    fn execute(&self, publisher: &JobEventPublisher) -> Result<bool, JobFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_types_match_case_insensitively() {
        let def = JobDefinition::new("Ingest-Catalog", "Ingest catalog")
            .with_retries(2, Duration::from_millis(10));
        assert!(def.matches("ingest-catalog"));
        assert!(!def.matches("ingest"));
        assert!(def.is_retryable());
    }
}

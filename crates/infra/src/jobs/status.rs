//! Health verdicts computed from recent job history.
//!
//! A [`StatusCalculator`] looks at the newest executions of one job type and
//! turns them into a [`StatusDetail`]. The [`JobStatusIndicator`] assigns a
//! calculator to every registered job type and reports the worst verdict as
//! the overall status.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use jobwarden_core::{JobRecord, JobStatus};

use super::definition::JobDefinition;
use super::error::JobsError;
use super::service::JobService;

pub const SUCCESS_MESSAGE: &str = "Last job was successful";
pub const ERROR_MESSAGE: &str = "Job had an error";
pub const DEAD_MESSAGE: &str = "Job died";
pub const NO_EXECUTIONS_MESSAGE: &str = "No prior executions";
pub const LOAD_FAILED_MESSAGE: &str = "Failed to load job status";

pub const WARNING_ON_LAST_JOB_FAILED: &str = "warning-on-last-job-failed";
pub const ERROR_ON_LAST_JOB_FAILED: &str = "error-on-last-job-failed";
pub const ERROR_ON_LAST_NUM_JOBS_FAILED: &str = "error-on-last-num-jobs-failed";

/// Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetail {
    pub name: String,
    pub status: Status,
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl StatusDetail {
    pub fn new(name: impl Into<String>, status: Status, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Verdict over the last `num_jobs` executions of a job type, tolerating up
/// to `max_failed` failed ones.
#[derive(Debug, Clone)]
pub struct StatusCalculator {
    key: String,
    num_jobs: usize,
    max_failed: usize,
    service: Arc<JobService>,
}

impl StatusCalculator {
    pub fn new(
        key: impl Into<String>,
        num_jobs: usize,
        max_failed: usize,
        service: Arc<JobService>,
    ) -> Result<Self, JobsError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(JobsError::InvalidConfig("status calculator key must not be empty".into()));
        }
        if num_jobs == 0 {
            return Err(JobsError::InvalidConfig(format!(
                "status calculator `{key}` must consider at least one job"
            )));
        }
        if max_failed > num_jobs {
            return Err(JobsError::InvalidConfig(format!(
                "status calculator `{key}` allows {max_failed} failures out of only {num_jobs} jobs"
            )));
        }
        Ok(Self {
            key,
            num_jobs,
            max_failed,
            service,
        })
    }

    /// Warning if the last execution failed.
    pub fn warning_on_last_job_failed(service: Arc<JobService>) -> Self {
        Self {
            key: WARNING_ON_LAST_JOB_FAILED.to_string(),
            num_jobs: 1,
            max_failed: 1,
            service,
        }
    }

    /// Error if the last execution failed.
    pub fn error_on_last_job_failed(service: Arc<JobService>) -> Self {
        Self {
            key: ERROR_ON_LAST_JOB_FAILED.to_string(),
            num_jobs: 1,
            max_failed: 0,
            service,
        }
    }

    /// Error only if all of the last `n` executions failed.
    pub fn error_on_last_num_jobs_failed(n: usize, service: Arc<JobService>) -> Result<Self, JobsError> {
        Self::new(ERROR_ON_LAST_NUM_JOBS_FAILED, n, n.saturating_sub(1), service)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn num_jobs(&self) -> usize {
        self.num_jobs
    }

    pub fn max_failed(&self) -> usize {
        self.max_failed
    }

    /// Never fails: store errors become an `ERROR` verdict.
    pub fn status_detail(&self, definition: &JobDefinition) -> StatusDetail {
        self.compute(definition).unwrap_or_else(|err| {
            error!(
                job_type = %definition.job_type,
                calculator = %self.key,
                error = %err,
                "failed to load job status"
            );
            StatusDetail::new(&definition.job_name, Status::Error, LOAD_FAILED_MESSAGE)
        })
    }

    fn compute(&self, definition: &JobDefinition) -> Result<StatusDetail, JobsError> {
        let name = &definition.job_name;
        let meta = self.service.meta().get(&definition.job_type)?;
        if meta.is_disabled() {
            return Ok(StatusDetail::new(
                name,
                Status::Ok,
                format!("Job is deactivated: {}", meta.disabled_comment()),
            ));
        }

        let records = self
            .service
            .jobs()
            .find_latest_by(&definition.job_type, self.num_jobs + 1)?;
        let considered = self.considered(&records);
        let Some(last) = considered.first() else {
            return Ok(StatusDetail::new(name, Status::Ok, NO_EXECUTIONS_MESSAGE));
        };

        let failed = considered
            .iter()
            .filter(|r| r.status() == JobStatus::Error)
            .count();
        let failed_message = format!("{failed} out of {} job executions failed", considered.len());

        let (status, message) = match last.status() {
            JobStatus::Ok | JobStatus::Skipped => {
                if let Some(max_age) = self.overdue(last, definition) {
                    (Status::Warning, format!("Job didn't run in the past {max_age}"))
                } else if failed > self.max_failed {
                    (Status::Warning, failed_message)
                } else {
                    (Status::Ok, SUCCESS_MESSAGE.to_string())
                }
            }
            JobStatus::Error => {
                let status = if failed > self.max_failed {
                    Status::Error
                } else {
                    Status::Warning
                };
                let message = if self.num_jobs == 1 && self.max_failed <= 1 {
                    ERROR_MESSAGE.to_string()
                } else {
                    failed_message
                };
                (status, message)
            }
            JobStatus::Dead => (Status::Warning, DEAD_MESSAGE.to_string()),
        };

        let mut detail = StatusDetail::new(name, status, message)
            .with_detail("Started", last.started().to_rfc3339());
        if let Some(stopped) = last.stopped() {
            detail = detail.with_detail("Stopped", stopped.to_rfc3339());
        }
        Ok(detail)
    }

    // A run still in flight says nothing about health yet; judge the ones
    // before it.
    fn considered<'a>(&self, records: &'a [JobRecord]) -> &'a [JobRecord] {
        let skip_in_flight = records.len() > 1
            && records[0].is_running()
            && records[0].status() == JobStatus::Ok;
        let records = if skip_in_flight { &records[1..] } else { records };
        &records[..records.len().min(self.num_jobs)]
    }

    // The configured max age, rendered, if the last run finished too long ago.
    fn overdue(&self, last: &JobRecord, definition: &JobDefinition) -> Option<String> {
        let max_age = definition.max_age?;
        let stopped = last.stopped()?;
        let max_age_chrono = chrono::Duration::from_std(max_age).ok()?;
        if stopped + max_age_chrono < self.service.clock().now() {
            Some(format!("{} seconds", max_age.as_secs()))
        } else {
            None
        }
    }
}

/// Health of all registered job types.
#[derive(Debug, Clone)]
pub struct JobStatusIndicator {
    default: StatusCalculator,
    calculators: BTreeMap<String, StatusCalculator>,
    // lowercased job type -> calculator key
    overrides: BTreeMap<String, String>,
    definitions: Vec<JobDefinition>,
}

impl JobStatusIndicator {
    pub fn new(default: StatusCalculator) -> Self {
        Self {
            calculators: BTreeMap::from([(default.key().to_string(), default.clone())]),
            default,
            overrides: BTreeMap::new(),
            definitions: Vec::new(),
        }
    }

    pub fn with_calculator(mut self, calculator: StatusCalculator) -> Self {
        self.calculators.insert(calculator.key().to_string(), calculator);
        self
    }

    /// Routes `job_type` to the calculator registered under `key`.
    pub fn with_override(mut self, job_type: &str, key: &str) -> Result<Self, JobsError> {
        if !self.calculators.contains_key(key) {
            return Err(JobsError::InvalidConfig(format!(
                "no status calculator `{key}` for job type `{job_type}`"
            )));
        }
        self.overrides.insert(job_type.to_lowercase(), key.to_string());
        Ok(self)
    }

    pub fn with_definition(mut self, definition: JobDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn with_definitions<'a>(mut self, definitions: impl IntoIterator<Item = &'a JobDefinition>) -> Self {
        self.definitions.extend(definitions.into_iter().cloned());
        self
    }

    /// Status of one job type. Unregistered types are judged under their
    /// own name with no max age.
    pub fn status_for(&self, job_type: &str) -> StatusDetail {
        match self.definitions.iter().find(|d| d.matches(job_type)) {
            Some(definition) => self.calculator_for(job_type).status_detail(definition),
            None => self
                .calculator_for(job_type)
                .status_detail(&JobDefinition::new(job_type, job_type)),
        }
    }

    /// One detail per registered job definition.
    pub fn details(&self) -> Vec<StatusDetail> {
        self.definitions
            .iter()
            .map(|d| self.calculator_for(&d.job_type).status_detail(d))
            .collect()
    }

    /// The worst status over all registered job types.
    pub fn overall(&self) -> Status {
        self.details()
            .into_iter()
            .map(|d| d.status)
            .max()
            .unwrap_or(Status::Ok)
    }

    fn calculator_for(&self, job_type: &str) -> &StatusCalculator {
        self.overrides
            .get(&job_type.to_lowercase())
            .and_then(|key| self.calculators.get(key))
            .unwrap_or(&self.default)
    }
}

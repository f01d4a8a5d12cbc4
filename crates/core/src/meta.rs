//! Per-job-type control state and run locks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Control state of a job type, independent of individual executions.
///
/// `running_job_id` is a best-effort mirror of the run lock. Whenever
/// correctness matters, lock existence is the ground truth, not this field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobMeta {
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_job_id: Option<JobId>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_comment: Option<String>,
    /// Free-form job-specific bookkeeping.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl JobMeta {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_job_id.is_some()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn disabled_comment(&self) -> &str {
        self.disabled_comment.as_deref().unwrap_or("")
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A disabled job type together with the operator's comment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisabledJob {
    pub job_type: String,
    pub comment: String,
}

/// A lock record: its existence means a job of `job_type` may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLock {
    pub job_type: String,
    pub created_at: DateTime<Utc>,
    /// Job execution holding the lock, if the acquirer named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<JobId>,
}

impl RunLock {
    pub fn new(job_type: impl Into<String>, created_at: DateTime<Utc>, owner: Option<JobId>) -> Self {
        Self {
            job_type: job_type.into(),
            created_at,
            owner,
        }
    }
}

/// A currently running job, as seen from the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunningJob {
    pub job_id: Option<JobId>,
    pub job_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_defaults_from_sparse_document() {
        let meta: JobMeta = serde_json::from_value(serde_json::json!({"job_type": "ingest"})).unwrap();
        assert_eq!(meta, JobMeta::new("ingest"));
        assert!(!meta.is_running());
        assert!(!meta.is_disabled());
        assert_eq!(meta.disabled_comment(), "");
    }
}

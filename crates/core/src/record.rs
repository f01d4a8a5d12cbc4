//! Job execution records and their state machine.
//!
//! A [`JobRecord`] is either running (no `stopped` timestamp) or stopped.
//! Health is tracked orthogonally by [`JobStatus`]. Stopped is absorbing:
//! every transition method refuses to touch a stopped record and returns
//! [`DomainError::InvalidTransition`] instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

pub const RESTART_MESSAGE: &str = "Restarting job ..";
pub const SKIPPED_MESSAGE: &str = "Skipped job ..";
pub const DEAD_MESSAGE: &str = "Job didn't receive updates for a while, considering it dead";

/// Severity of a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

/// Health of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Ok,
    Error,
    Dead,
    /// Terminated without doing any work.
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ok => "OK",
            JobStatus::Error => "ERROR",
            JobStatus::Dead => "DEAD",
            JobStatus::Skipped => "SKIPPED",
        }
    }
}

/// One entry of a job's append-only message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub level: Level,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(level: Level, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            level,
            text: text.into(),
            timestamp,
        }
    }

    pub fn info(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Level::Info, text, timestamp)
    }

    pub fn warning(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Level::Warning, text, timestamp)
    }

    pub fn error(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Level::Error, text, timestamp)
    }
}

/// One execution of a job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    id: JobId,
    job_type: String,
    hostname: String,
    started: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stopped: Option<DateTime<Utc>>,
    status: JobStatus,
    #[serde(default)]
    messages: Vec<JobMessage>,
    #[serde(default)]
    restarts: u32,
}

impl JobRecord {
    /// A freshly started, running record with status `OK`.
    pub fn new(
        id: JobId,
        job_type: impl Into<String>,
        hostname: impl Into<String>,
        started: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            hostname: hostname.into(),
            started,
            last_updated: started,
            stopped: None,
            status: JobStatus::Ok,
            messages: Vec::new(),
            restarts: 0,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn stopped(&self) -> Option<DateTime<Utc>> {
        self.stopped
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn messages(&self) -> &[JobMessage] {
        &self.messages
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.stopped.is_none()
    }

    /// Heartbeat: advances `last_updated`, nothing else.
    pub fn keep_alive(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running("keep-alive")?;
        self.touch(now);
        Ok(())
    }

    /// Appends a message. An `ERROR` message forces status `ERROR`.
    pub fn append_message(&mut self, message: JobMessage) -> DomainResult<()> {
        self.ensure_running("message")?;
        if message.level == Level::Error {
            self.status = JobStatus::Error;
        }
        self.touch(message.timestamp);
        self.messages.push(message);
        Ok(())
    }

    /// A retry attempt is starting after an internal failure. Status is unaffected.
    pub fn restart(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running("restart")?;
        self.restarts += 1;
        self.messages.push(JobMessage::warning(RESTART_MESSAGE, now));
        self.touch(now);
        Ok(())
    }

    /// Terminates the record without work having been done.
    pub fn skip(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running("skip")?;
        self.messages.push(JobMessage::info(SKIPPED_MESSAGE, now));
        self.status = JobStatus::Skipped;
        self.finish(now);
        Ok(())
    }

    /// Regular termination. Status stays whatever the messages made it.
    pub fn stop(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running("stop")?;
        self.finish(now);
        Ok(())
    }

    /// Forced termination by the dead-job sweep.
    pub fn kill(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running("dead")?;
        self.status = JobStatus::Dead;
        self.messages.push(JobMessage::warning(DEAD_MESSAGE, now));
        self.finish(now);
        Ok(())
    }

    /// Like [`kill`](Self::kill), but refuses with
    /// [`DomainError::StillAlive`] if the record was updated at or after
    /// `cutoff`.
    pub fn kill_if_stale(&mut self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running("dead")?;
        if self.last_updated >= cutoff {
            return Err(DomainError::still_alive(&self.id, self.last_updated));
        }
        self.kill(now)
    }

    fn ensure_running(&self, attempted: &'static str) -> DomainResult<()> {
        if self.is_stopped() {
            return Err(DomainError::invalid_transition(&self.id, attempted));
        }
        Ok(())
    }

    // last_updated never moves backwards and never precedes `started`.
    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.touch(now);
        self.stopped = Some(self.last_updated);
    }
}

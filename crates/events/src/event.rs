//! Job lifecycle events.
//!
//! Two kinds travel over the bus: state changes (start, heartbeat, stop, ...)
//! and free-text messages. Both identify the job execution they belong to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwarden_core::{JobId, Level};

/// State change reported by (or on behalf of) a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Start,
    /// Liveness heartbeat.
    KeepAlive,
    Restart,
    /// Terminal failure of the job body; carries the error text.
    Failed,
    Dead,
    Skipped,
    Stop,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Start => "START",
            State::KeepAlive => "KEEP_ALIVE",
            State::Restart => "RESTART",
            State::Failed => "FAILED",
            State::Dead => "DEAD",
            State::Skipped => "SKIPPED",
            State::Stop => "STOP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub state: State,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StateChangeEvent {
    pub fn new(job_id: JobId, job_type: impl Into<String>, state: State, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            state,
            timestamp,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub level: Level,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageEvent {
    pub fn new(
        job_id: JobId,
        job_type: impl Into<String>,
        level: Level,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            level,
            text: text.into(),
            timestamp,
        }
    }
}

/// Everything published on the job event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    StateChange(StateChangeEvent),
    Message(MessageEvent),
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::StateChange(e) => &e.job_id,
            JobEvent::Message(e) => &e.job_id,
        }
    }

    pub fn job_type(&self) -> &str {
        match self {
            JobEvent::StateChange(e) => &e.job_type,
            JobEvent::Message(e) => &e.job_type,
        }
    }

    /// Stable event name (e.g. "state.KEEP_ALIVE", "message.ERROR").
    pub fn event_type(&self) -> String {
        match self {
            JobEvent::StateChange(e) => format!("state.{}", e.state.as_str()),
            JobEvent::Message(e) => format!("message.{}", e.level.as_str()),
        }
    }

    /// When the event occurred at the publisher.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            JobEvent::StateChange(e) => e.timestamp,
            JobEvent::Message(e) => e.timestamp,
        }
    }
}

impl From<StateChangeEvent> for JobEvent {
    fn from(value: StateChangeEvent) -> Self {
        JobEvent::StateChange(value)
    }
}

impl From<MessageEvent> for JobEvent {
    fn from(value: MessageEvent) -> Self {
        JobEvent::Message(value)
    }
}

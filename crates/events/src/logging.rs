use tracing::{info, warn};

use jobwarden_core::Level;

use crate::event::{JobEvent, State};
use crate::listener_bus::{EventListener, ListenerError};

/// Mirrors job events into the process log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingJobEventListener;

impl EventListener<JobEvent> for LoggingJobEventListener {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_event(&self, event: &JobEvent) -> Result<(), ListenerError> {
        match event {
            // Heartbeats would drown everything else.
            JobEvent::StateChange(e) if e.state == State::KeepAlive => {}
            JobEvent::StateChange(e) => match (e.state, e.message.as_deref()) {
                (State::Failed | State::Dead, message) => warn!(
                    job_id = %e.job_id,
                    job_type = %e.job_type,
                    state = e.state.as_str(),
                    message = message.unwrap_or(""),
                    "job state changed"
                ),
                (_, message) => info!(
                    job_id = %e.job_id,
                    job_type = %e.job_type,
                    state = e.state.as_str(),
                    message = message.unwrap_or(""),
                    "job state changed"
                ),
            },
            JobEvent::Message(m) => match m.level {
                Level::Info => info!(job_id = %m.job_id, job_type = %m.job_type, "{}", m.text),
                Level::Warning | Level::Error => warn!(
                    job_id = %m.job_id,
                    job_type = %m.job_type,
                    level = m.level.as_str(),
                    "{}",
                    m.text
                ),
            },
        }
        Ok(())
    }
}

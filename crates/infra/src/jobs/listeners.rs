use std::sync::Arc;

use tracing::{debug, error, warn};

use jobwarden_core::JobMessage;
use jobwarden_events::{EventListener, JobEvent, ListenerError, State};

use super::error::JobsError;
use super::service::{JobService, TransitionOutcome};

pub const FAILED_MESSAGE: &str = "Job failed";

/// Applies job events to the job records through the [`JobService`].
///
/// Late and duplicate events are expected (delivery is at-least-once) and
/// are dropped quietly. Store failures are logged and reported to the bus,
/// which keeps the listener registered.
#[derive(Debug, Clone)]
pub struct PersistenceJobEventListener {
    service: Arc<JobService>,
}

impl PersistenceJobEventListener {
    pub fn new(service: Arc<JobService>) -> Self {
        Self { service }
    }

    fn apply(&self, event: &JobEvent) -> Result<TransitionOutcome, JobsError> {
        let svc = &self.service;
        match event {
            JobEvent::StateChange(e) => match e.state {
                State::Start => Ok(if svc.record_start(&e.job_id, &e.job_type, e.timestamp)? {
                    TransitionOutcome::Applied
                } else {
                    TransitionOutcome::AlreadyStopped
                }),
                State::KeepAlive => svc.keep_alive(&e.job_id),
                State::Restart => svc.restart(&e.job_id),
                State::Failed => {
                    let text = e.message.as_deref().unwrap_or(FAILED_MESSAGE);
                    svc.append_message(&e.job_id, &JobMessage::error(text, e.timestamp))
                }
                State::Dead => svc.mark_dead(&e.job_id),
                State::Skipped => svc.skip(&e.job_id),
                State::Stop => svc.stop(&e.job_id),
            },
            JobEvent::Message(m) => svc.append_message(&m.job_id, &JobMessage::new(m.level, &m.text, m.timestamp)),
        }
    }
}

impl EventListener<JobEvent> for PersistenceJobEventListener {
    fn name(&self) -> &str {
        "persistence"
    }

    fn on_event(&self, event: &JobEvent) -> Result<(), ListenerError> {
        match self.apply(event) {
            Ok(TransitionOutcome::Applied) => Ok(()),
            Ok(TransitionOutcome::AlreadyStopped | TransitionOutcome::StillAlive) => {
                debug!(
                    job_id = %event.job_id(),
                    event_type = %event.event_type(),
                    "event had no effect, job already recorded or stopped"
                );
                Ok(())
            }
            Ok(TransitionOutcome::JobNotFound) => {
                warn!(
                    job_id = %event.job_id(),
                    job_type = event.job_type(),
                    event_type = %event.event_type(),
                    "dropping event for unknown job"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    job_id = %event.job_id(),
                    job_type = event.job_type(),
                    event_type = %event.event_type(),
                    error = %err,
                    "failed to persist job event"
                );
                Err(ListenerError::new(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::InMemoryJobStore;
    use chrono::{TimeZone, Utc};
    use jobwarden_core::{JobId, JobStatus, Level, ManualClock};
    use jobwarden_events::{MessageEvent, StateChangeEvent};

    fn listener() -> (PersistenceJobEventListener, Arc<JobService>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()));
        let service = Arc::new(JobService::new(InMemoryJobStore::arc(), clock, "host-a"));
        (PersistenceJobEventListener::new(service.clone()), service)
    }

    fn state(id: &JobId, state: State) -> JobEvent {
        StateChangeEvent::new(id.clone(), "ingest", state, Utc::now()).into()
    }

    #[test]
    fn failed_event_becomes_error_message() {
        let (listener, service) = listener();
        let id: JobId = "J1".parse().unwrap();
        listener.on_event(&state(&id, State::Start)).unwrap();

        let failed = StateChangeEvent::new(id.clone(), "ingest", State::Failed, Utc::now()).with_message("boom");
        listener.on_event(&failed.into()).unwrap();
        listener.on_event(&state(&id, State::Stop)).unwrap();

        let record = service.find_job(&id).unwrap().unwrap();
        assert_eq!(record.status(), JobStatus::Error);
        assert_eq!(record.messages()[0].text, "boom");
        assert!(record.is_stopped());
    }

    #[test]
    fn unknown_and_late_events_are_not_errors() {
        let (listener, service) = listener();
        let id: JobId = "J1".parse().unwrap();
        listener.on_event(&state(&id, State::KeepAlive)).unwrap();

        listener.on_event(&state(&id, State::Start)).unwrap();
        listener.on_event(&state(&id, State::Skipped)).unwrap();
        listener.on_event(&state(&id, State::Stop)).unwrap();
        listener
            .on_event(&MessageEvent::new(id.clone(), "ingest", Level::Error, "late", Utc::now()).into())
            .unwrap();

        let record = service.find_job(&id).unwrap().unwrap();
        assert_eq!(record.status(), JobStatus::Skipped);
        assert_eq!(record.messages().len(), 1);
    }
}

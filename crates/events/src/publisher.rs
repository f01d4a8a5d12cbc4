//! Publisher handle passed explicitly to job bodies.

use std::sync::Arc;

use jobwarden_core::{Clock, JobId, Level};
use tracing::warn;

use crate::bus::EventBus;
use crate::event::{JobEvent, MessageEvent, State, StateChangeEvent};
use crate::listener_bus::BusError;

/// The job event bus as shared across components.
pub type SharedJobBus = Arc<dyn EventBus<JobEvent, Error = BusError>>;

/// Publishes events on behalf of one job execution.
///
/// Publication failures are logged and swallowed: reporting progress must
/// never fail the job itself.
#[derive(Clone)]
pub struct JobEventPublisher {
    bus: SharedJobBus,
    clock: Arc<dyn Clock>,
    job_id: JobId,
    job_type: String,
}

impl core::fmt::Debug for JobEventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobEventPublisher")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .finish_non_exhaustive()
    }
}

impl JobEventPublisher {
    pub fn new(bus: SharedJobBus, clock: Arc<dyn Clock>, job_id: JobId, job_type: impl Into<String>) -> Self {
        Self {
            bus,
            clock,
            job_id,
            job_type: job_type.into(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn state_changed(&self, state: State) {
        let event = StateChangeEvent::new(self.job_id.clone(), &self.job_type, state, self.clock.now());
        self.publish(event.into());
    }

    pub fn state_changed_with_message(&self, state: State, message: impl Into<String>) {
        let event = StateChangeEvent::new(self.job_id.clone(), &self.job_type, state, self.clock.now())
            .with_message(message);
        self.publish(event.into());
    }

    pub fn keep_alive(&self) {
        self.state_changed(State::KeepAlive);
    }

    pub fn message(&self, level: Level, text: impl Into<String>) {
        let event = MessageEvent::new(self.job_id.clone(), &self.job_type, level, text, self.clock.now());
        self.publish(event.into());
    }

    pub fn info(&self, text: impl Into<String>) {
        self.message(Level::Info, text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.message(Level::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.message(Level::Error, text);
    }

    fn publish(&self, event: JobEvent) {
        let event_type = event.event_type();
        if let Err(err) = self.bus.publish(event) {
            warn!(
                job_id = %self.job_id,
                job_type = %self.job_type,
                event_type = %event_type,
                error = %err,
                "failed to publish job event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener_bus::ListenerBus;
    use chrono::{TimeZone, Utc};
    use jobwarden_core::ManualClock;

    #[test]
    fn publishes_events_stamped_with_clock() {
        let bus: Arc<ListenerBus<JobEvent>> = Arc::new(ListenerBus::builder().build().unwrap());
        let sub = bus.subscribe();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let publisher = JobEventPublisher::new(
            bus.clone(),
            Arc::new(ManualClock::new(now)),
            "J1".parse().unwrap(),
            "ingest",
        );

        publisher.state_changed(State::Start);
        publisher.error("disk full");

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "state.START");
        assert_eq!(events[0].occurred_at(), now);
        match &events[1] {
            JobEvent::Message(m) => {
                assert_eq!(m.level, Level::Error);
                assert_eq!(m.text, "disk full");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn closed_bus_does_not_fail_the_caller() {
        let bus: Arc<ListenerBus<JobEvent>> = Arc::new(ListenerBus::builder().build().unwrap());
        bus.shutdown();
        let publisher = JobEventPublisher::new(bus, Arc::new(ManualClock::new(Utc::now())), JobId::new(), "ingest");
        publisher.keep_alive();
    }
}

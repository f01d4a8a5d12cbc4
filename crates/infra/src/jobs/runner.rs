//! Executes one job run and reports its lifecycle on the event bus.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use jobwarden_events::{JobEventPublisher, State};

use super::definition::{JobFailure, JobRunnable};

/// Drives a [`JobRunnable`] through START, heartbeats, bounded restarts and
/// a final STOP.
///
/// Termination is cooperative: nothing interrupts a running body. A body
/// that hangs stops sending heartbeats only if the whole process dies, at
/// which point the dead-job sweep takes over.
pub struct JobRunner {
    runnable: Arc<dyn JobRunnable>,
    publisher: JobEventPublisher,
    keep_alive: Duration,
}

impl core::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("job_type", &self.runnable.definition().job_type)
            .field("publisher", &self.publisher)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl JobRunner {
    pub fn new(runnable: Arc<dyn JobRunnable>, publisher: JobEventPublisher, keep_alive: Duration) -> Self {
        Self {
            runnable,
            publisher,
            keep_alive,
        }
    }

    /// Runs on a dedicated thread named after the job type.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("job-{}", self.publisher.job_type()))
            .spawn(move || self.run())
    }

    pub fn run(&self) {
        self.publisher.state_changed(State::Start);

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let heartbeat = self.spawn_heartbeat(stop_rx);

        let result = self.execute_with_restarts();

        drop(stop_tx);
        if let Some(handle) = heartbeat {
            let _ = handle.join();
        }

        match result {
            Ok(true) => {}
            Ok(false) => self.publisher.state_changed(State::Skipped),
            Err(failure) => {
                error!(
                    job_id = %self.publisher.job_id(),
                    job_type = self.publisher.job_type(),
                    error = %failure,
                    "job failed"
                );
                self.publisher.state_changed_with_message(State::Failed, failure.message());
            }
        }
        self.publisher.state_changed(State::Stop);
    }

    fn execute_with_restarts(&self) -> Result<bool, JobFailure> {
        let definition = self.runnable.definition();
        let mut attempt = 0;
        loop {
            let outcome = catch_unwind(AssertUnwindSafe(|| self.runnable.execute(&self.publisher)))
                .unwrap_or_else(|panic| Err(JobFailure::new(panic_message(panic.as_ref()))));

            match outcome {
                Ok(done) => return Ok(done),
                Err(failure) if attempt < definition.restarts => {
                    attempt += 1;
                    warn!(
                        job_id = %self.publisher.job_id(),
                        job_type = self.publisher.job_type(),
                        attempt,
                        error = %failure,
                        "job failed, restarting"
                    );
                    self.publisher.warn(failure.message());
                    self.publisher.state_changed(State::Restart);
                    if let Some(delay) = definition.retry_delay {
                        thread::sleep(delay);
                    }
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    fn spawn_heartbeat(&self, stop: mpsc::Receiver<()>) -> Option<thread::JoinHandle<()>> {
        let publisher = self.publisher.clone();
        let interval = self.keep_alive;
        let spawned = thread::Builder::new()
            .name(format!("keep-alive-{}", publisher.job_type()))
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(interval) {
                    publisher.keep_alive();
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(
                    job_id = %self.publisher.job_id(),
                    error = %err,
                    "failed to spawn keep-alive thread, running without heartbeats"
                );
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::definition::JobDefinition;
    use jobwarden_core::{JobId, SystemClock};
    use jobwarden_events::{EventBus, JobEvent, ListenerBus, SharedJobBus, Subscription};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        definition: JobDefinition,
        failures_left: AtomicU32,
        result: bool,
        pause: Duration,
    }

    impl Scripted {
        fn new(definition: JobDefinition, failures: u32, result: bool) -> Self {
            Self {
                definition,
                failures_left: AtomicU32::new(failures),
                result,
                pause: Duration::ZERO,
            }
        }
    }

    impl JobRunnable for Scripted {
        fn definition(&self) -> &JobDefinition {
            &self.definition
        }

        fn execute(&self, publisher: &JobEventPublisher) -> Result<bool, JobFailure> {
            thread::sleep(self.pause);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(JobFailure::new("flaky"));
            }
            publisher.info("working");
            Ok(self.result)
        }
    }

    struct Panicking(JobDefinition);

    impl JobRunnable for Panicking {
        fn definition(&self) -> &JobDefinition {
            &self.0
        }

        fn execute(&self, _: &JobEventPublisher) -> Result<bool, JobFailure> {
            panic!("kaboom")
        }
    }

    fn run(runnable: impl JobRunnable + 'static, keep_alive: Duration) -> Vec<String> {
        let bus: SharedJobBus = Arc::new(ListenerBus::<JobEvent>::builder().build().unwrap());
        let sub: Subscription<JobEvent> = bus.subscribe();
        let publisher = JobEventPublisher::new(bus, Arc::new(SystemClock), JobId::new(), "ingest");

        JobRunner::new(Arc::new(runnable), publisher, keep_alive).run();
        sub.drain().iter().map(JobEvent::event_type).collect()
    }

    #[test]
    fn successful_run_starts_and_stops() {
        let events = run(Scripted::new(JobDefinition::new("ingest", "Ingest"), 0, true), Duration::from_secs(3600));
        assert_eq!(events, vec!["state.START", "message.INFO", "state.STOP"]);
    }

    #[test]
    fn restarts_are_bounded() {
        let def = JobDefinition::new("ingest", "Ingest").with_retries(1, Duration::from_millis(1));
        let events = run(Scripted::new(def.clone(), 1, true), Duration::from_secs(3600));
        assert_eq!(
            events,
            vec!["state.START", "message.WARNING", "state.RESTART", "message.INFO", "state.STOP"]
        );

        let events = run(Scripted::new(def, 5, true), Duration::from_secs(3600));
        assert_eq!(
            events,
            vec!["state.START", "message.WARNING", "state.RESTART", "state.FAILED", "state.STOP"]
        );
    }

    #[test]
    fn nothing_to_do_is_skipped() {
        let events = run(Scripted::new(JobDefinition::new("ingest", "Ingest"), 0, false), Duration::from_secs(3600));
        assert_eq!(events, vec!["state.START", "message.INFO", "state.SKIPPED", "state.STOP"]);
    }

    #[test]
    fn panic_is_reported_as_failure() {
        let events = run(Panicking(JobDefinition::new("ingest", "Ingest")), Duration::from_secs(3600));
        assert_eq!(events, vec!["state.START", "state.FAILED", "state.STOP"]);
    }

    #[test]
    fn heartbeats_while_body_runs() {
        let mut slow = Scripted::new(JobDefinition::new("ingest", "Ingest"), 0, true);
        slow.pause = Duration::from_millis(80);
        let events = run(slow, Duration::from_millis(10));

        assert_eq!(events.first().map(String::as_str), Some("state.START"));
        assert_eq!(events.last().map(String::as_str), Some("state.STOP"));
        assert!(events.iter().any(|e| e == "state.KEEP_ALIVE"));
    }
}

//! Integration tests for the job tracking pipeline.
//!
//! Tests: Event → ListenerBus → PersistenceListener → JobService → JobStore
//!
//! Verifies:
//! - Locks, records and status agree across a full job run
//! - Stopped records absorb late events
//! - Concurrent lock requests stay exclusive and never deadlock
//! - Cleanup and the dead-job sweep respect their thresholds

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use jobwarden_core::{Clock, JobId, JobStatus, ManualClock};
    use jobwarden_events::{
        EventListener, JobEvent, JobEventPublisher, ListenerBus, ListenerError, SharedJobBus, State,
    };

    use crate::config::JobsConfig;
    use crate::job_store::InMemoryJobStore;
    use crate::jobs::{
        CleanupStrategy, JobDefinition, JobFailure, JobRunnable, JobService, KeepLastJobs, PersistenceJobEventListener,
        RunLockManager, StartOutcome, Status, StatusCalculator, StopDeadJobs,
    };
    use crate::system::JobSystem;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 6, 0, 0).unwrap()
    }

    fn types(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
        service: Arc<JobService>,
        bus: SharedJobBus,
    }

    impl Harness {
        fn new() -> Self {
            jobwarden_observability::init();
            let store = InMemoryJobStore::arc();
            let clock = Arc::new(ManualClock::new(t0()));
            let service = Arc::new(JobService::new(store.clone(), clock.clone(), "host-a"));
            let bus: SharedJobBus = Arc::new(
                ListenerBus::<JobEvent>::builder()
                    .listener(PersistenceJobEventListener::new(service.clone()))
                    .build()
                    .unwrap(),
            );
            Self {
                store,
                clock,
                service,
                bus,
            }
        }

        fn locks(&self) -> RunLockManager {
            RunLockManager::new(self.store.clone(), self.clock.clone())
        }

        fn publisher(&self, id: &str, job_type: &str) -> JobEventPublisher {
            JobEventPublisher::new(self.bus.clone(), self.clock.clone(), id.parse().unwrap(), job_type)
        }
    }

    #[test]
    fn end_to_end_job_run() {
        let h = Harness::new();
        let first = h.locks();
        let second = h.locks();
        assert!(first.acquire(&types(&["ingest"])));

        let job = h.publisher("J1", "ingest");
        job.state_changed(State::Start);
        let record = h.service.find_job(job.job_id()).unwrap().unwrap();
        assert_eq!(record.status(), JobStatus::Ok);
        assert!(record.stopped().is_none());

        h.clock.advance(Duration::seconds(2));
        job.error("disk full");
        assert_eq!(h.service.find_job(job.job_id()).unwrap().unwrap().status(), JobStatus::Error);

        h.clock.advance(Duration::seconds(2));
        job.state_changed(State::Stop);
        let record = h.service.find_job(job.job_id()).unwrap().unwrap();
        assert_eq!(record.stopped(), Some(t0() + Duration::seconds(4)));
        assert_eq!(record.status(), JobStatus::Error);

        assert!(second.acquire(&types(&["ingest"])));

        let detail = StatusCalculator::error_on_last_job_failed(h.service.clone())
            .status_detail(&JobDefinition::new("ingest", "Ingest"));
        assert_eq!(detail.status, Status::Error);
    }

    #[test]
    fn stopped_record_absorbs_late_events() {
        let h = Harness::new();
        let job = h.publisher("J1", "ingest");
        job.state_changed(State::Start);
        job.info("working");
        job.state_changed(State::Stop);
        let snapshot = h.service.find_job(job.job_id()).unwrap().unwrap();

        h.clock.advance(Duration::minutes(5));
        job.keep_alive();
        job.error("too late");
        job.state_changed(State::Restart);
        job.state_changed(State::Skipped);
        job.state_changed(State::Dead);
        job.state_changed_with_message(State::Failed, "still too late");
        job.state_changed(State::Stop);
        job.state_changed(State::Start);

        assert_eq!(h.service.find_job(job.job_id()).unwrap().unwrap(), snapshot);
    }

    #[test]
    fn duplicate_events_are_harmless() {
        let h = Harness::new();
        let job = h.publisher("J1", "ingest");
        job.state_changed(State::Start);
        job.state_changed(State::Start);
        job.state_changed(State::Stop);
        job.state_changed(State::Stop);

        let records = h.service.find_jobs(Some("ingest"), 10).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_stopped());
    }

    struct Exploding;

    impl EventListener<JobEvent> for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn on_event(&self, _: &JobEvent) -> Result<(), ListenerError> {
            panic!("listener bug")
        }
    }

    #[test]
    fn broken_listener_does_not_block_persistence() {
        let h = Harness::new();
        let bus: SharedJobBus = Arc::new(
            ListenerBus::<JobEvent>::builder()
                .listener(Exploding)
                .listener(PersistenceJobEventListener::new(h.service.clone()))
                .build()
                .unwrap(),
        );
        let job = JobEventPublisher::new(bus, h.clock.clone(), "J1".parse().unwrap(), "ingest");
        job.state_changed(State::Start);
        job.state_changed(State::Stop);
        job.state_changed(State::Start);

        assert!(h.service.find_job(job.job_id()).unwrap().unwrap().is_stopped());
    }

    #[test]
    fn dead_sweep_respects_threshold_and_frees_the_lock() {
        let h = Harness::new();
        let threshold = Duration::seconds(30);

        let StartOutcome::Started(stale) = h.service.try_start("ingest").unwrap() else {
            panic!("ingest did not start");
        };
        h.clock.advance(Duration::seconds(2));
        let StartOutcome::Started(fresh) = h.service.try_start("export").unwrap() else {
            panic!("export did not start");
        };

        // ingest: last update 31s ago, export: 29s ago.
        h.clock.advance(Duration::seconds(29));
        let sweep = StopDeadJobs::new(h.service.clone(), threshold);
        assert_eq!(sweep.run().unwrap(), 1);

        let dead = h.service.find_job(&stale).unwrap().unwrap();
        assert_eq!(dead.status(), JobStatus::Dead);
        assert_eq!(dead.stopped(), Some(h.clock.now()));
        assert!(h.service.find_job(&fresh).unwrap().unwrap().is_running());

        assert!(matches!(h.service.try_start("ingest").unwrap(), StartOutcome::Started(_)));
        assert_eq!(h.service.try_start("export").unwrap(), StartOutcome::AlreadyRunning);
    }

    #[test]
    fn retention_never_drops_the_last_success() {
        let h = Harness::new();
        for i in 0..5 {
            let job = h.publisher(&format!("J{i}"), "ingest");
            h.clock.advance(Duration::seconds(1));
            job.state_changed(State::Start);
            if i > 0 {
                job.error("failed");
            }
            job.state_changed(State::Stop);
        }

        let deleted = KeepLastJobs::per_type(h.service.clone(), 2).run().unwrap();
        assert_eq!(deleted, 2);

        let remaining: Vec<String> = h
            .service
            .find_jobs(Some("ingest"), 10)
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(remaining, vec!["J4", "J3", "J0"]);
    }

    #[test]
    fn overlapping_lock_sets_never_deadlock() {
        let store = InMemoryJobStore::arc();
        let holding_a = Arc::new(AtomicBool::new(false));
        let requests = [types(&["jobB", "jobA"]), types(&["jobA", "jobC"])];

        let handles: Vec<_> = requests
            .into_iter()
            .map(|wanted| {
                let locks = RunLockManager::new(store.clone(), Arc::new(jobwarden_core::SystemClock));
                let holding_a = holding_a.clone();
                thread::spawn(move || {
                    let mut acquired = 0;
                    for _ in 0..500 {
                        if locks.acquire(&wanted) {
                            assert!(!holding_a.swap(true, Ordering::SeqCst), "jobA held twice");
                            acquired += 1;
                            holding_a.store(false, Ordering::SeqCst);
                            locks.release(&wanted).unwrap();
                        }
                    }
                    acquired
                })
            })
            .collect();

        let acquired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(acquired > 0);
        assert!(RunLockManager::new(store, Arc::new(jobwarden_core::SystemClock))
            .held_locks()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn concurrent_starts_are_mutually_exclusive() {
        let h = Harness::new();
        let holders = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = h.service.clone();
                let holders = holders.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        if let StartOutcome::Started(id) = service.try_start("ingest").unwrap() {
                            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            holders.fetch_sub(1, Ordering::SeqCst);
                            service.stop(&id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(h.service.running_jobs().unwrap().is_empty());
        assert!(h.service.find_jobs(None, 1_000).unwrap().iter().all(|r| r.is_stopped()));
    }

    struct Script {
        definition: JobDefinition,
        fail: bool,
    }

    impl JobRunnable for Script {
        fn definition(&self) -> &JobDefinition {
            &self.definition
        }

        fn execute(&self, publisher: &JobEventPublisher) -> Result<bool, JobFailure> {
            publisher.info("importing");
            if self.fail {
                return Err(JobFailure::new("upstream returned 503"));
            }
            Ok(true)
        }
    }

    #[test]
    fn job_system_runs_jobs_and_reports_status() {
        jobwarden_observability::init();
        let system = JobSystem::builder(JobsConfig::default())
            .register(Script {
                definition: JobDefinition::new("ingest", "Ingest"),
                fail: false,
            })
            .register(Script {
                definition: JobDefinition::new("export", "Export"),
                fail: true,
            })
            .status_calculator("strict", 1, 0)
            .status_override("export", "strict")
            .without_housekeeping()
            .start()
            .unwrap();

        assert!(matches!(system.try_start("ingest").unwrap(), StartOutcome::Started(_)));
        assert!(matches!(system.try_start("EXPORT").unwrap(), StartOutcome::Started(_)));
        system.trigger().join_all();

        assert_eq!(system.status_for("ingest").status, Status::Ok);
        let export = system.status_for("export");
        assert_eq!(export.status, Status::Error);

        let failed: JobId = system.service().find_jobs(Some("export"), 1).unwrap()[0].id().clone();
        let record = system.service().find_job(&failed).unwrap().unwrap();
        assert!(record.is_stopped());
        assert!(record.messages().iter().any(|m| m.text == "upstream returned 503"));

        assert_eq!(system.indicator().overall(), Status::Error);
        system.shutdown();
    }

    #[test]
    fn job_system_rejects_unknown_status_override() {
        let result = JobSystem::builder(JobsConfig::default())
            .status_override("ingest", "missing")
            .without_housekeeping()
            .start();
        assert!(result.is_err());
    }
}

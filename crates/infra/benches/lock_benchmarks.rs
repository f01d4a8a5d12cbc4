use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use jobwarden_core::{JobMessage, SystemClock};
use jobwarden_infra::job_store::InMemoryJobStore;
use jobwarden_infra::jobs::{JobService, RunLockManager, StartOutcome};
use std::collections::BTreeSet;
use std::sync::Arc;

fn lock_set(size: usize) -> BTreeSet<String> {
    (0..size).map(|i| format!("job-{i:03}")).collect()
}

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_lock_acquire_release");

    for size in [1usize, 4, 16] {
        let locks = RunLockManager::new(InMemoryJobStore::arc(), Arc::new(SystemClock));
        let wanted = lock_set(size);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wanted, |b, wanted| {
            b.iter(|| {
                assert!(locks.acquire(black_box(wanted)));
                locks.release(wanted).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_contended_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_lock_contended");

    // The last lock is taken, so every attempt acquires and rolls back the rest.
    for size in [2usize, 8] {
        let store = InMemoryJobStore::arc();
        let holder = RunLockManager::new(store.clone(), Arc::new(SystemClock));
        let caller = RunLockManager::new(store, Arc::new(SystemClock));
        let wanted = lock_set(size);
        let last = wanted.iter().next_back().cloned().unwrap();
        assert!(holder.acquire(&BTreeSet::from([last])));

        group.bench_with_input(BenchmarkId::from_parameter(size), &wanted, |b, wanted| {
            b.iter(|| assert!(!caller.acquire(black_box(wanted))));
        });
    }

    group.finish();
}

fn bench_job_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_lifecycle");

    group.bench_function("start_message_stop", |b| {
        let service = JobService::new(InMemoryJobStore::arc(), Arc::new(SystemClock), "bench");
        b.iter(|| {
            let StartOutcome::Started(id) = service.try_start(black_box("ingest")).unwrap() else {
                panic!("ingest should be free");
            };
            service
                .append_message(&id, &JobMessage::info("working", chrono::Utc::now()))
                .unwrap();
            service.stop(&id).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_contended_acquire, bench_job_lifecycle);
criterion_main!(benches);

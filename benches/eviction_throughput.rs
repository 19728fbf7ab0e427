//! Eviction throughput benchmarks.
//!
//! Measures allocation cost with and without eviction, and the cost of a
//! full purge under critical memory pressure.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use discardable_host::memory::{
    ClientView, InProcessBackend, ManualClock, CURRENT_PROCESS,
};
use discardable_host::{
    ClientId, DiscardableMemoryManager, ManagerConfig, MemoryPressureLevel, SegmentId,
};

const SEGMENT_SIZE: usize = 4096;

fn manager(memory_limit: usize) -> (DiscardableMemoryManager<InProcessBackend>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let config = ManagerConfig {
        memory_limit,
        ..ManagerConfig::default()
    };
    let manager = DiscardableMemoryManager::with_clock(config, InProcessBackend::new(), clock.clone());
    (manager, clock)
}

fn bench_allocate_within_budget(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_within_budget");
    group.throughput(Throughput::Elements(1));

    group.bench_function("allocate_delete", |b| {
        let (manager, _clock) = manager(usize::MAX / 2);
        let mut id = 0u32;
        b.iter(|| {
            let shared = manager
                .allocate_locked_segment(&CURRENT_PROCESS, ClientId(1), SEGMENT_SIZE, SegmentId(id))
                .unwrap();
            black_box(shared);
            manager.delete_segment(ClientId(1), SegmentId(id)).unwrap();
            id = id.wrapping_add(1);
        })
    });

    group.finish();
}

fn bench_allocate_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_with_eviction");

    for live in [64usize, 1024, 8192] {
        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("live_segments", live), |b| {
            // Budget holds exactly `live` segments; each allocation evicts one.
            let (manager, clock) = manager(live * SEGMENT_SIZE);
            let mut id = 0u32;
            b.iter(|| {
                let mut view = manager
                    .allocate_locked_segment(&CURRENT_PROCESS, ClientId(1), SEGMENT_SIZE, SegmentId(id))
                    .unwrap()
                    .into_view();
                view.unlock(clock.advance(1));
                clock.advance(1);
                id = id.wrapping_add(1);
            })
        });
    }

    group.finish();
}

fn bench_critical_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("critical_pressure");

    for count in [128usize, 2048] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::new("purge_all", count), |b| {
            b.iter_batched(
                || {
                    let (manager, clock) = manager(usize::MAX / 2);
                    for id in 0..count as u32 {
                        let mut view = manager
                            .allocate_locked_segment(&CURRENT_PROCESS, ClientId(1), SEGMENT_SIZE, SegmentId(id))
                            .unwrap()
                            .into_view();
                        view.unlock(clock.advance(1));
                    }
                    clock.advance(1);
                    manager
                },
                |manager| {
                    let report = manager.on_memory_pressure(MemoryPressureLevel::Critical);
                    black_box(report);
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_within_budget,
    bench_allocate_with_eviction,
    bench_critical_pressure
);
criterion_main!(benches);

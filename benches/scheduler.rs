//! Benchmarks for scheduler post and drain hot paths.
//!
//! Run with:
//! - `cargo bench --bench scheduler`
//! - `cargo bench scheduler_drain`

use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use looper::{DispatcherRegistry, Endpoint, IdleState, Runnable, Scheduler, SchedulerConfig};

const SIZES: [u64; 3] = [100, 1_000, 10_000];

fn paused_config() -> SchedulerConfig {
    SchedulerConfig {
        idle_state: Some(IdleState::Paused),
        ..SchedulerConfig::default()
    }
}

fn counting_task() -> (Arc<AtomicU64>, Runnable) {
    let counter = Arc::new(AtomicU64::new(0));
    let task = {
        let counter = Arc::clone(&counter);
        Runnable::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };
    (counter, task)
}

fn delay_for(index: u64) -> i64 {
    i64::try_from(index.wrapping_mul(7_919) % 1_000).unwrap_or(0)
}

fn bench_post_paused(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_post");
    for size in SIZES {
        group.throughput(Throughput::Elements(size));
        group.bench_function(BenchmarkId::new("paused_delayed", size), |b| {
            let (_, task) = counting_task();
            b.iter_batched(
                || Scheduler::with_config(&paused_config()),
                |scheduler| {
                    for index in 0..size {
                        scheduler
                            .post_delayed(task.clone(), delay_for(index))
                            .unwrap_or(false);
                    }
                    black_box(scheduler.size())
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_drain");
    for size in SIZES {
        group.throughput(Throughput::Elements(size));
        group.bench_function(BenchmarkId::new("advance_to_last", size), |b| {
            let (counter, task) = counting_task();
            b.iter_batched(
                || {
                    let scheduler = Scheduler::with_config(&paused_config());
                    for index in 0..size {
                        scheduler
                            .post_delayed(task.clone(), delay_for(index))
                            .unwrap_or(false);
                    }
                    scheduler
                },
                |scheduler| {
                    scheduler.advance_to_last_posted_runnable();
                    black_box(scheduler.current_time())
                },
                BatchSize::SmallInput,
            );
            black_box(counter.load(Ordering::Relaxed));
        });
    }
    group.finish();
}

fn bench_unpaused_inline(c: &mut Criterion) {
    let registry = DispatcherRegistry::default();
    let endpoint = Endpoint::new(registry.main());
    let (counter, task) = counting_task();

    let mut group = c.benchmark_group("scheduler_inline");
    group.bench_function("post_runs_inline", |b| {
        b.iter(|| black_box(endpoint.post(task.clone())));
    });
    group.bench_function("front_post_runs_inline", |b| {
        b.iter(|| black_box(endpoint.post_at_front_of_queue(task.clone())));
    });
    group.finish();
    black_box(counter.load(Ordering::Relaxed));
}

criterion_group!(
    benches,
    bench_post_paused,
    bench_drain,
    bench_unpaused_inline
);
criterion_main!(benches);

#![allow(clippy::all)]

//! Resilience Benchmarks
//!
//! Benchmarks for the metrics window, circuit breaker, bulkhead and full
//! command executions.

use bulwark::*;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Metrics Window Benchmarks
// =============================================================================

fn bench_metrics_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics_window");

    let window = RollingWindow::new(10, Duration::from_secs(1));

    group.bench_function("record", |b| b.iter(|| window.record(black_box(Outcome::Success))));

    group.bench_function("snapshot", |b| b.iter(|| black_box(window.snapshot())));

    for buckets in [10u32, 60] {
        let window = RollingWindow::new(buckets, Duration::from_millis(100));
        for _ in 0..1000 {
            window.record(Outcome::Failure);
        }
        group.bench_with_input(BenchmarkId::new("stats", buckets), &window, |b, window| {
            b.iter(|| black_box(window.stats()))
        });
    }

    group.finish();
}

// =============================================================================
// Circuit Breaker Benchmarks
// =============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new("bench"),
        Arc::new(RollingWindow::new(10, Duration::from_secs(1))),
    );

    group.bench_function("try_acquire_closed", |b| {
        b.iter(|| black_box(breaker.try_acquire()))
    });

    group.bench_function("record_success", |b| b.iter(|| breaker.record(Outcome::Success)));

    let open = CircuitBreaker::new(
        CircuitBreakerConfig::new("open").sleep_window(Duration::from_secs(3600)),
        Arc::new(RollingWindow::new(10, Duration::from_secs(1))),
    );
    open.force_open();

    group.bench_function("try_acquire_open", |b| b.iter(|| black_box(open.try_acquire())));

    group.finish();
}

// =============================================================================
// Bulkhead Benchmarks
// =============================================================================

fn bench_bulkhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulkhead");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let bulkhead = Bulkhead::new(BulkheadConfig::new("bench", 100));

    group.bench_function("try_enter_drop", |b| {
        b.iter(|| black_box(bulkhead.try_enter().is_ok()))
    });

    group.bench_function("acquire_permit", |b| {
        b.to_async(&rt).iter(|| {
            let bulkhead = bulkhead.clone();
            async move {
                let ticket = bulkhead.try_enter().unwrap();
                black_box(ticket.acquire().await.is_ok())
            }
        })
    });

    let full = Bulkhead::new(BulkheadConfig::new("full", 1).queue_depth(0));
    let _held = full.try_enter().unwrap();

    group.bench_function("reject_full", |b| {
        b.iter(|| black_box(full.try_enter().is_err()))
    });

    group.finish();
}

// =============================================================================
// Engine Benchmarks
// =============================================================================

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let engine = CommandEngine::with_handle(EngineConfig::default(), rt.handle().clone()).unwrap();
    engine
        .configure_group(
            "inline",
            GroupConfig::new()
                .isolation(IsolationStrategy::Inline)
                .pool_capacity(1000),
        )
        .unwrap();
    engine
        .configure_group("pooled", GroupConfig::new().pool_capacity(1000))
        .unwrap();

    for key in ["inline", "pooled"] {
        let command = Arc::new(FnCommand::new(key, |x: u64, _ctx| async move {
            Ok::<_, BoxError>(x + 1)
        }));

        group.bench_with_input(BenchmarkId::new("execute", key), &command, |b, command| {
            b.to_async(&rt)
                .iter(|| engine.execute(command.clone(), black_box(1)))
        });
    }

    let short_circuited = Arc::new(
        FnCommand::new("tripped", |x: u64, _ctx| async move { Ok::<_, BoxError>(x) })
            .with_fallback(|_, _| async { Ok(0) }),
    );
    engine
        .configure_group(
            "tripped",
            GroupConfig::new().sleep_window(Duration::from_secs(3600)),
        )
        .unwrap()
        .breaker()
        .force_open();

    group.bench_function("execute_short_circuited", |b| {
        b.to_async(&rt)
            .iter(|| engine.execute(short_circuited.clone(), black_box(1)))
    });

    group.finish();
    engine.shutdown();
}

criterion_group!(
    benches,
    bench_metrics_window,
    bench_circuit_breaker,
    bench_bulkhead,
    bench_engine,
);

criterion_main!(benches);

//! Benchmarks for the hot paths of the job service using criterion.
//!
//! - Single create → claim → start → complete lifecycle
//! - Claim contention: many orchestrators racing for the same queue
//! - Quota consumption under concurrent callers
//! - Rate-limit admission

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures::future::join_all;
use jobgate::{
    InMemoryRateLimiter, OrchestratorId, QuotaConfig, QuotaManager, RateLimitConfig, RateLimitKey,
    RateLimiter, Resource, UserId,
};
use jobgate_testkit::{TestHarness, script_job};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn unbounded_quota() -> QuotaConfig {
    let mut config = QuotaConfig::default();
    config.executions.limit = u64::MAX;
    config.api_calls.limit = u64::MAX;
    config
}

/// Benchmark: one job through its whole lifecycle.
fn bench_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("lifecycle");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let harness = TestHarness::with_quota(unbounded_quota());
        let orchestrator = OrchestratorId::new("bench-orch");
        let owner = UserId::new();

        b.to_async(&rt).iter(|| async {
            let job = harness
                .service
                .create_job(script_job(owner))
                .await
                .expect("create should succeed");
            harness
                .service
                .claim_job(job.id, &orchestrator)
                .await
                .expect("claim should succeed");
            harness
                .service
                .start_job(job.id, &orchestrator)
                .await
                .expect("start should succeed");
            harness
                .service
                .complete_job(job.id, &orchestrator, None)
                .await
                .expect("complete should succeed");
        });
    });

    group.finish();
}

/// Benchmark: N orchestrators draining a queue of 100 jobs via `claim_next`.
fn bench_claim_contention(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("claim_contention");
    group.sample_size(20);
    group.throughput(Throughput::Elements(100));

    for orchestrators in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(orchestrators),
            &orchestrators,
            |b, &orchestrators| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = std::time::Duration::ZERO;
                    for _ in 0..iters {
                        let harness = TestHarness::with_quota(unbounded_quota());
                        let owner = UserId::new();
                        for _ in 0..100 {
                            harness
                                .service
                                .create_job(script_job(owner))
                                .await
                                .expect("create should succeed");
                        }

                        let start = std::time::Instant::now();
                        let claimers = (0..orchestrators).map(|i| {
                            let service = Arc::clone(&harness.service);
                            let orchestrator = OrchestratorId::new(format!("bench-{i}"));
                            tokio::spawn(async move {
                                let mut claimed = 0usize;
                                while let Ok(Some(_)) = service.claim_next(&orchestrator).await {
                                    claimed += 1;
                                }
                                claimed
                            })
                        });
                        let claimed: usize = join_all(claimers)
                            .await
                            .into_iter()
                            .map(|r| r.expect("claimer panicked"))
                            .sum();
                        total += start.elapsed();
                        assert_eq!(claimed, 100);
                    }
                    total
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: concurrent quota consumption against one counter.
fn bench_quota_consume(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("quota_consume");
    group.throughput(Throughput::Elements(64));

    group.bench_function("64_concurrent", |b| {
        let harness = TestHarness::with_quota(unbounded_quota());
        let owner = UserId::new();

        b.to_async(&rt).iter(|| {
            let quota = Arc::clone(&harness.quota);
            async move {
                let calls = (0..64).map(|_| {
                    let quota = Arc::clone(&quota);
                    tokio::spawn(async move { quota.consume(owner, Resource::ApiCalls, 1).await })
                });
                for result in join_all(calls).await {
                    result
                        .expect("consumer panicked")
                        .expect("consume should succeed");
                }
            }
        });
    });

    group.finish();
}

/// Benchmark: rate-limit admission for distinct and shared keys.
fn bench_rate_limit(c: &mut Criterion) {
    let rt = create_runtime();
    let config = RateLimitConfig::new(u64::MAX, 60);

    let mut group = c.benchmark_group("rate_limit");

    group.bench_function("shared_key", |b| {
        let limiter = InMemoryRateLimiter::new();
        let key = RateLimitKey::user(UserId::new());
        b.to_async(&rt).iter(|| async {
            limiter
                .check_and_increment(&key, "jobs", &config)
                .await
                .expect("check should succeed");
        });
    });

    group.bench_function("distinct_keys", |b| {
        let limiter = InMemoryRateLimiter::new();
        b.to_async(&rt).iter(|| async {
            let key = RateLimitKey::user(UserId::new());
            limiter
                .check_and_increment(&key, "jobs", &config)
                .await
                .expect("check should succeed");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lifecycle,
    bench_claim_contention,
    bench_quota_consume,
    bench_rate_limit
);
criterion_main!(benches);

//! End-to-end walkthrough on the in-memory backend.
//!
//! Loads configuration, starts an orchestrator runtime with a small
//! executor, admits and submits a few jobs, cancels one while it runs, and finally
//! prints a usage report.
//!
//! Run with: `cargo run --example in_memory_lifecycle`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobgate::*;
use tokio_util::sync::CancellationToken;

/// Executor that sleeps for the number of milliseconds found in
/// `metadata.sleep_ms` and fails jobs tagged `metadata.fail`.
struct DemoExecutor;

#[async_trait]
impl JobExecutor for DemoExecutor {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionOutcome {
        let sleep_ms = job
            .metadata
            .get("sleep_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(50);
        println!("[EXECUTOR] job {} attempt {} ({}ms)", job.id, job.attempts, sleep_ms);

        tokio::select! {
            _ = cancel.cancelled() => {
                println!("[EXECUTOR] job {} cancelled", job.id);
                ExecutionOutcome::Cancelled
            }
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                if job.metadata.contains_key("fail") {
                    ExecutionOutcome::Failed { error: "demo failure".into() }
                } else {
                    ExecutionOutcome::Succeeded {
                        output: Some(serde_json::json!({ "slept_ms": sleep_ms })),
                    }
                }
            }
        }
    }
}

fn demo_job(user_id: UserId, metadata: serde_json::Value) -> NewJob {
    NewJob {
        event_id: EventId::new(),
        user_id,
        job_type: JobType::Script,
        payload: JobPayload {
            script: Some(ScriptSpec {
                kind: ScriptKind::Bash,
                content: "echo demo".into(),
                working_directory: None,
            }),
            ..Default::default()
        },
        metadata: metadata.as_object().cloned().unwrap_or_default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = JobGateConfig::load(None)?;
    jobgate::telemetry::init_tracing(&config.log_filter)?;

    let quota = Arc::new(InMemoryQuotaManager::new(config.quota.clone()));
    let service = Arc::new(
        JobService::new(Arc::new(InMemoryJobStore::new()), quota.clone())
            .with_config(config.service.clone()),
    );

    let registry = Arc::new(HeartbeatRegistry::new(config.recovery.heartbeat_timeout()));
    let runtime = OrchestratorRuntimeBuilder::new("demo-orchestrator", config.worker.clone())
        .with_service(Arc::clone(&service))
        .with_executor(Arc::new(DemoExecutor))
        .with_heartbeats(Arc::clone(&registry))
        .build()?;

    let shutdown = CancellationToken::new();
    let recovery = RecoveryManager::new(Arc::clone(&service), registry, config.recovery.clone())
        .spawn(shutdown.clone());

    let gate = RequestGate::new(
        Arc::new(InMemoryRateLimiter::new()),
        config.rate_limits.clone(),
    );
    let sweeper = gate.spawn_cleanup(shutdown.clone());

    let user = UserId::new();
    let caller = Caller::user(user);
    for _ in 0..3 {
        gate.admit(&RateLimitKey::user(user), "jobs").await?;
    }
    let quick = service
        .create_job(demo_job(user, serde_json::json!({ "sleep_ms": 100 })))
        .await?;
    let failing = service
        .create_job(demo_job(user, serde_json::json!({ "fail": true })))
        .await?;
    let slow = service
        .create_job(demo_job(user, serde_json::json!({ "sleep_ms": 60_000 })))
        .await?;

    runtime.start().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let cancelled = service.cancel_job(&caller, slow.id).await?;
    println!("[MAIN] cancelled {} (now {})", cancelled.id, cancelled.status);
    tokio::time::sleep(Duration::from_millis(300)).await;

    for id in [quick.id, failing.id, slow.id] {
        let job = service.get_job(&caller, id).await?;
        println!(
            "[MAIN] job {} -> {} (attempts {}, error {:?})",
            job.id, job.status, job.attempts, job.last_error
        );
    }

    let stats = service.get_job_stats(user).await?;
    println!("[MAIN] stats: {stats:?}");

    let reporter = UsageReporter::new(quota);
    let report = reporter.report(user, ReportPeriod::Day).await?;
    println!("{}", UsageReporter::export_csv(&report));

    runtime.shutdown().await?;
    shutdown.cancel();
    recovery.await?;
    sweeper.await?;
    Ok(())
}

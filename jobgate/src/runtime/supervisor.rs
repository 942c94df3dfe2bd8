use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::JobGateError;
use crate::events::JobEventPayload;
use crate::job::{Job, JobId, JobStatus, OrchestratorId};
use crate::recovery::HeartbeatRegistry;
use crate::service::JobService;
use crate::telemetry;

use super::worker::WorkerConfig;

/// Result of running a job's payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded {
        #[serde(default)]
        output: Option<serde_json::Value>,
    },
    Failed {
        error: String,
    },
    /// The executor stopped because its cancellation token fired.
    Cancelled,
}

/// Runs the payload of a claimed job.
///
/// Cancellation is cooperative: the token fires when the job is cancelled
/// or times out, and the executor is expected to stop soon after and return
/// [`ExecutionOutcome::Cancelled`].
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionOutcome;
}

#[derive(Clone)]
struct WorkerContext {
    orchestrator_id: OrchestratorId,
    config: WorkerConfig,
    service: Arc<JobService>,
    executor: Arc<dyn JobExecutor>,
    running: Arc<DashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Orchestrator side of the job lifecycle.
///
/// Worker loops claim ready jobs, start them, hand them to the executor and
/// report the outcome. A listener on the service's event bus and a per-job
/// status watcher trip the job's token when it is cancelled.
pub struct OrchestratorRuntime {
    ctx: WorkerContext,
    heartbeats: Option<Arc<HeartbeatRegistry>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("orchestrator_id", &self.ctx.orchestrator_id)
            .field("config", &self.ctx.config)
            .field("running_jobs", &self.ctx.running.len())
            .field("task_count", &task_count)
            .field("heartbeats", &self.heartbeats.is_some())
            .field("shutdown_cancelled", &self.ctx.shutdown.is_cancelled())
            .finish()
    }
}

impl OrchestratorRuntime {
    pub(crate) fn new(
        orchestrator_id: OrchestratorId,
        config: WorkerConfig,
        service: Arc<JobService>,
        executor: Arc<dyn JobExecutor>,
        heartbeats: Option<Arc<HeartbeatRegistry>>,
    ) -> Self {
        Self {
            ctx: WorkerContext {
                orchestrator_id,
                config,
                service,
                executor,
                running: Arc::new(DashMap::new()),
                shutdown: CancellationToken::new(),
            },
            heartbeats,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator_id(&self) -> &OrchestratorId {
        &self.ctx.orchestrator_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    pub fn service(&self) -> Arc<JobService> {
        Arc::clone(&self.ctx.service)
    }

    /// Jobs currently executing on this instance.
    pub fn running_jobs(&self) -> Vec<JobId> {
        self.ctx.running.iter().map(|entry| *entry.key()).collect()
    }

    /// Trips the token of a job executing here. Returns `false` if the job
    /// is not running on this instance.
    pub fn cancel_running(&self, job_id: JobId) -> bool {
        match self.ctx.running.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Starts heartbeats, the cancellation listener and the configured
    /// number of workers.
    pub async fn start(&self) {
        info!(
            orchestrator_id = %self.ctx.orchestrator_id,
            workers = self.ctx.config.worker_count,
            "starting orchestrator runtime"
        );
        if let Some(registry) = &self.heartbeats {
            self.spawn_heartbeat(Arc::clone(registry)).await;
        }
        self.spawn_cancellation_listener().await;
        self.spawn_workers(self.ctx.config.worker_count).await;
    }

    pub async fn spawn_workers(&self, count: usize) {
        let mut handles = self.handles.lock().await;
        let first = handles.len();
        for worker in first..first + count {
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(worker_loop(ctx, worker)));
        }
    }

    /// Stops claiming new work and waits up to `shutdown_timeout` for every
    /// task. Jobs still running after that are left `RUNNING` for orphan
    /// recovery to pick up.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!(orchestrator_id = %self.ctx.orchestrator_id, "shutting down orchestrator runtime");
        self.ctx.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_timeout();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("runtime task failed: {e:?}"),
                Err(_) => {
                    warn!("runtime task timed out during shutdown");
                    handle.abort();
                }
            }
        }

        info!(orchestrator_id = %self.ctx.orchestrator_id, "orchestrator runtime stopped");
        Ok(())
    }

    async fn spawn_heartbeat(&self, registry: Arc<HeartbeatRegistry>) {
        let orchestrator_id = self.ctx.orchestrator_id.clone();
        let interval = self.ctx.config.heartbeat_interval();
        let shutdown = self.ctx.shutdown.clone();

        let handle = tokio::spawn(async move {
            registry.beat(&orchestrator_id);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => registry.beat(&orchestrator_id),
                }
            }
        });
        self.handles.lock().await.push(handle);
    }

    async fn spawn_cancellation_listener(&self) {
        let mut rx = self.ctx.service.events().subscribe();
        let running = Arc::clone(&self.ctx.running);
        let shutdown = self.ctx.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            if let JobEventPayload::Cancelled { job_id, .. } = event.payload {
                                if let Some(token) = running.get(&job_id) {
                                    debug!(%job_id, "cancel event received for running job");
                                    token.cancel();
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("cancellation listener lagged, skipped {skipped} events");
                        }
                    }
                }
            }
        });
        self.handles.lock().await.push(handle);
    }
}

async fn worker_loop(ctx: WorkerContext, worker: usize) {
    debug!(orchestrator_id = %ctx.orchestrator_id, worker, "worker started");
    loop {
        if ctx.shutdown.is_cancelled() {
            break;
        }

        let claimed = ctx
            .service
            .claim_next(&ctx.orchestrator_id)
            .instrument(telemetry::claim_span(&ctx.orchestrator_id, worker))
            .await;

        let idle = match claimed {
            Ok(Some(job)) => {
                process_job(&ctx, job).await;
                continue;
            }
            Ok(None) => ctx.config.poll_interval(),
            Err(err) => {
                warn!(orchestrator_id = %ctx.orchestrator_id, worker, error = %err, "claim failed");
                ctx.config.error_backoff()
            }
        };

        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = tokio::time::sleep(idle) => {}
        }
    }
    debug!(orchestrator_id = %ctx.orchestrator_id, worker, "worker stopped");
}

async fn process_job(ctx: &WorkerContext, job: Job) {
    let job_id = job.id;
    let token = CancellationToken::new();
    ctx.running.insert(job_id, token.clone());

    let started = match ctx.service.start_job(job_id, &ctx.orchestrator_id).await {
        Ok(started) => started,
        Err(JobGateError::InvalidStateTransition {
            from: JobStatus::Cancelled,
            ..
        }) => {
            debug!(%job_id, "job cancelled before it started");
            ctx.running.remove(&job_id);
            return;
        }
        Err(err) => {
            error!(%job_id, error = %err, "failed to start claimed job");
            ctx.running.remove(&job_id);
            let released = ctx
                .service
                .release_claim(job_id, &ctx.orchestrator_id, "start failed")
                .await;
            if let Err(err) = released {
                error!(%job_id, error = %err, "could not release claim, job waits for recovery");
            }
            return;
        }
    };

    let watcher = tokio::spawn(watch_for_cancellation(
        Arc::clone(&ctx.service),
        job_id,
        token.clone(),
        ctx.shutdown.clone(),
        ctx.config.cancel_poll_interval(),
    ));

    let timeout_secs = started
        .payload
        .timeout_secs
        .unwrap_or(ctx.config.default_timeout_secs);
    let execution = async {
        tokio::select! {
            outcome = ctx.executor.execute(&started, token.clone()) => outcome,
            _ = tokio::time::sleep(std::time::Duration::from_secs(timeout_secs)) => {
                token.cancel();
                ExecutionOutcome::Failed {
                    error: format!("job timed out after {timeout_secs}s"),
                }
            }
        }
    };
    let outcome =
        telemetry::instrument_execution(job_id, started.job_type, started.attempts, execution).await;

    watcher.abort();
    ctx.running.remove(&job_id);
    report(ctx, &started, outcome).await;
}

async fn report(ctx: &WorkerContext, job: &Job, outcome: ExecutionOutcome) {
    let job_id = job.id;
    let orchestrator_id = &ctx.orchestrator_id;
    let result = match outcome {
        ExecutionOutcome::Succeeded { output } => {
            ctx.service.complete_job(job_id, orchestrator_id, output).await
        }
        ExecutionOutcome::Failed { error } => {
            ctx.service.fail_job(job_id, orchestrator_id, error).await
        }
        ExecutionOutcome::Cancelled => match ctx.service.job_status(job_id).await {
            Ok(JobStatus::Cancelled) => {
                info!(%job_id, "job execution stopped after cancellation");
                return;
            }
            _ => {
                ctx.service
                    .fail_job(job_id, orchestrator_id, "execution cancelled by executor")
                    .await
            }
        },
    };

    match result {
        Ok(_) => {}
        Err(JobGateError::InvalidStateTransition {
            from: JobStatus::Cancelled,
            ..
        }) => debug!(%job_id, "job was cancelled while executing, outcome dropped"),
        Err(err) => error!(%job_id, error = %err, "failed to report job outcome"),
    }
}

/// Polls the job's status and trips `token` once it reads `CANCELLED`.
/// Covers cancellations made through another process. Stops with the
/// runtime, since an aborted worker never gets to abort its watcher.
async fn watch_for_cancellation(
    service: Arc<JobService>,
    job_id: JobId,
    token: CancellationToken,
    shutdown: CancellationToken,
    interval: std::time::Duration,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match service.job_status(job_id).await {
            Ok(JobStatus::Cancelled) => {
                debug!(%job_id, "status watcher observed cancellation");
                token.cancel();
                return;
            }
            Ok(status) if status.is_terminal() => return,
            Ok(_) => {}
            Err(err) => warn!(%job_id, error = %err, "status watcher read failed"),
        }
    }
}

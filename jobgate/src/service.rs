use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, error, info, warn};

use crate::auth::Caller;
use crate::claim::{MAX_ORPHAN_BATCH, RecoveryOutcome, RecoveryPolicy, decide_orphan};
use crate::clock::{Clock, SystemClock, bounded_seconds};
use crate::error::{JobGateError, JobGateResult};
use crate::events::{JobEventBus, JobEventPayload};
use crate::execution::{ExecutionLog, LogStatus, LogUpdate};
use crate::job::{
    Job, JobFilter, JobId, JobPage, JobStats, JobStatus, NewJob, OrchestratorId, UserId,
};
use crate::quota::{QuotaManager, Resource};
use crate::store::{JobBackend, JobCompletion, TransitionOutcome};
use crate::telemetry;

/// Largest page `list_jobs` will return.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// How long per-user stats stay cached. Zero disables caching.
    pub stats_ttl_secs: u64,
    /// Quota resource charged one unit per created job.
    pub job_resource: Resource,
    pub recovery: RecoveryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stats_ttl_secs: 5,
            job_resource: Resource::Executions,
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// What one `recover_orphans` pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub requeued: usize,
    pub failed: usize,
    /// Jobs that changed hands or state before recovery reached them.
    pub skipped: usize,
}

impl RecoverySummary {
    pub fn handled(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Client- and orchestrator-facing API over a job backend.
pub struct JobService {
    store: Arc<dyn JobBackend>,
    quota: Arc<dyn QuotaManager>,
    events: JobEventBus,
    config: ServiceConfig,
    stats_cache: DashMap<UserId, (JobStats, DateTime<Utc>)>,
    /// Bumped before every invalidation; counts read under an older epoch
    /// are returned but never cached.
    stats_epoch: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for JobService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobService")
            .field("store", &self.store)
            .field("quota", &self.quota)
            .field("events", &self.events)
            .field("config", &self.config)
            .field("cached_stats", &self.stats_cache.len())
            .finish()
    }
}

fn backend(context: &'static str) -> impl FnOnce(anyhow::Error) -> JobGateError {
    move |err| {
        error!(error = %err, context, "job backend failure");
        JobGateError::Internal(err.context(context))
    }
}

impl JobService {
    pub fn new(store: Arc<dyn JobBackend>, quota: Arc<dyn QuotaManager>) -> Self {
        Self {
            store,
            quota,
            events: JobEventBus::default(),
            config: ServiceConfig::default(),
            stats_cache: DashMap::new(),
            stats_epoch: AtomicU64::new(0),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: JobEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(&self) -> &JobEventBus {
        &self.events
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn quota(&self) -> &Arc<dyn QuotaManager> {
        &self.quota
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- client operations ----

    /// Validates, charges quota, stores the job as `QUEUED` and returns it.
    pub async fn create_job(&self, request: NewJob) -> JobGateResult<Job> {
        request
            .payload
            .validate(request.job_type)
            .map_err(JobGateError::Validation)?;

        let user_id = request.user_id;
        let resource = self.config.job_resource;
        self.quota.consume(user_id, resource, 1).await?;

        let now = self.clock.now();
        let job = match self.store.insert(Job::queued(request, now)).await {
            Ok(job) => job,
            Err(err) => {
                if let Err(release_err) = self.quota.release(user_id, resource, 1).await {
                    warn!(%user_id, error = %release_err, "failed to release quota after insert failure");
                }
                return Err(backend("insert job")(err));
            }
        };

        self.store
            .open_log(ExecutionLog::pending_for(&job, now))
            .await
            .map_err(backend("open execution log"))?;

        self.invalidate_stats(user_id);
        self.events.publish(
            user_id,
            JobEventPayload::Created {
                job_id: job.id,
                event_id: job.event_id,
                job_type: job.job_type,
            },
            now,
        );
        telemetry::record_job_created(job.id, job.job_type);
        Ok(job)
    }

    pub async fn get_job(&self, caller: &Caller, job_id: JobId) -> JobGateResult<Job> {
        let job = self.load(job_id).await?;
        caller.ensure_owner(job.user_id)?;
        Ok(job)
    }

    /// Newest first; `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn list_jobs(
        &self,
        filter: JobFilter,
        limit: usize,
        offset: usize,
    ) -> JobGateResult<JobPage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let (jobs, total) = self
            .store
            .list(&filter, limit, offset)
            .await
            .map_err(backend("list jobs"))?;
        Ok(JobPage {
            jobs,
            total,
            limit,
            offset,
        })
    }

    /// Like [`JobService::list_jobs`] but scoped to the caller's own jobs
    /// unless the caller is an administrator.
    pub async fn list_jobs_for(
        &self,
        caller: &Caller,
        mut filter: JobFilter,
        limit: usize,
        offset: usize,
    ) -> JobGateResult<JobPage> {
        match filter.user_id {
            Some(owner) => caller.ensure_owner(owner)?,
            None if !caller.is_admin() => filter.user_id = Some(caller.user_id),
            None => {}
        }
        self.list_jobs(filter, limit, offset).await
    }

    /// Cancels a job on behalf of its owner.
    ///
    /// Cancelling an already cancelled job returns it unchanged; cancelling a
    /// completed or failed job is an `InvalidStateTransition`.
    pub async fn cancel_job(&self, caller: &Caller, job_id: JobId) -> JobGateResult<Job> {
        async {
            let job = self.load(job_id).await?;
            caller.ensure_owner(job.user_id)?;

            let now = self.clock.now();
            match self
                .store
                .cancel(job_id, now)
                .await
                .map_err(backend("cancel job"))?
            {
                TransitionOutcome::Applied(cancelled) => {
                    self.mirror_log(job_id, LogUpdate::status(LogStatus::Cancelled, now))
                        .await;
                    self.invalidate_stats(cancelled.user_id);
                    self.events.publish(
                        cancelled.user_id,
                        JobEventPayload::Cancelled {
                            job_id,
                            from: job.status,
                        },
                        now,
                    );
                    telemetry::record_job_finished(job_id, cancelled.job_type, JobStatus::Cancelled);
                    Ok(cancelled)
                }
                TransitionOutcome::Unchanged(job) => Ok(job),
                TransitionOutcome::Conflict(current) | TransitionOutcome::WrongOrchestrator(current) => {
                    Err(JobGateError::invalid_transition(current.status, "cancel"))
                }
                TransitionOutcome::Missing => Err(JobGateError::not_found("job", job_id)),
            }
        }
        .instrument(telemetry::job_span(job_id, "cancel"))
        .await
    }

    /// Per-status counts for a user, cached for `stats_ttl_secs`.
    pub async fn get_job_stats(&self, user_id: UserId) -> JobGateResult<JobStats> {
        let now = self.clock.now();
        let ttl = bounded_seconds(self.config.stats_ttl_secs);
        if let Some(cached) = self.stats_cache.get(&user_id) {
            let (stats, computed_at) = cached.value();
            if now - *computed_at < ttl {
                return Ok(stats.clone());
            }
        }

        let epoch = self.stats_epoch.load(Ordering::SeqCst);
        let counts = self
            .store
            .status_counts(user_id)
            .await
            .map_err(backend("count jobs"))?;
        let stats = JobStats::from_counts(counts);
        if !ttl.is_zero() {
            // The shard lock held by `entry` orders this check against
            // `invalidate_stats`, which bumps the epoch before removing.
            let entry = self.stats_cache.entry(user_id);
            if self.stats_epoch.load(Ordering::SeqCst) == epoch {
                entry.insert((stats.clone(), now));
            }
        }
        Ok(stats)
    }

    pub async fn job_logs(&self, caller: &Caller, job_id: JobId) -> JobGateResult<Vec<ExecutionLog>> {
        self.get_job(caller, job_id).await?;
        self.store
            .logs_for(job_id)
            .await
            .map_err(backend("load execution logs"))
    }

    // ---- orchestrator operations ----

    /// Claims a specific queued job. Exactly one of several concurrent
    /// claimants succeeds; the others get `InvalidStateTransition`.
    pub async fn claim_job(&self, job_id: JobId, orchestrator_id: &OrchestratorId) -> JobGateResult<Job> {
        let now = self.clock.now();
        match self
            .store
            .claim(job_id, orchestrator_id, now)
            .await
            .map_err(backend("claim job"))?
        {
            Some(job) => {
                self.on_claimed(&job, orchestrator_id, now);
                Ok(job)
            }
            None => {
                let current = self.load(job_id).await?;
                telemetry::record_claim_conflict(job_id, orchestrator_id);
                Err(JobGateError::invalid_transition(current.status, "claim"))
            }
        }
    }

    /// Claims the oldest job that is ready to run, if any.
    pub async fn claim_next(&self, orchestrator_id: &OrchestratorId) -> JobGateResult<Option<Job>> {
        let now = self.clock.now();
        let claimed = self
            .store
            .claim_next(orchestrator_id, now)
            .await
            .map_err(backend("claim next job"))?;
        if let Some(job) = &claimed {
            self.on_claimed(job, orchestrator_id, now);
        }
        Ok(claimed)
    }

    pub async fn start_job(&self, job_id: JobId, orchestrator_id: &OrchestratorId) -> JobGateResult<Job> {
        let now = self.clock.now();
        let outcome = self
            .store
            .start(job_id, orchestrator_id, now)
            .await
            .map_err(backend("start job"))?;
        let job = self.expect_applied(job_id, orchestrator_id, "start", outcome)?;

        self.mirror_log(job_id, LogUpdate::status(LogStatus::Running, now))
            .await;
        self.invalidate_stats(job.user_id);
        self.events.publish(
            job.user_id,
            JobEventPayload::Started {
                job_id,
                orchestrator_id: orchestrator_id.clone(),
                attempt: job.attempts,
            },
            now,
        );
        Ok(job)
    }

    /// Hands a job this orchestrator holds but will not run back to the
    /// queue, immediately available. Returns `false` when the job is no
    /// longer held by `orchestrator_id`.
    pub async fn release_claim(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        reason: &str,
    ) -> JobGateResult<bool> {
        let now = self.clock.now();
        let outcome = self
            .store
            .requeue_orphan(job_id, orchestrator_id, now, reason, now)
            .await
            .map_err(backend("release claim"))?;
        let Some(job) = outcome.applied() else {
            debug!(%job_id, %orchestrator_id, "claim already gone, nothing to release");
            return Ok(false);
        };

        info!(%job_id, %orchestrator_id, reason, "claim released back to the queue");
        self.invalidate_stats(job.user_id);
        self.events.publish(
            job.user_id,
            JobEventPayload::Requeued {
                job_id,
                previous_orchestrator: orchestrator_id.clone(),
                available_at: job.available_at,
            },
            now,
        );
        Ok(true)
    }

    pub async fn complete_job(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        output: Option<serde_json::Value>,
    ) -> JobGateResult<Job> {
        self.finish(job_id, orchestrator_id, JobCompletion::Completed { output })
            .await
    }

    pub async fn fail_job(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        error: impl Into<String>,
    ) -> JobGateResult<Job> {
        self.finish(
            job_id,
            orchestrator_id,
            JobCompletion::Failed {
                error: error.into(),
            },
        )
        .await
    }

    async fn finish(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        completion: JobCompletion,
    ) -> JobGateResult<Job> {
        let now = self.clock.now();
        let action = match completion {
            JobCompletion::Completed { .. } => "complete",
            JobCompletion::Failed { .. } => "fail",
        };
        let outcome = self
            .store
            .finish(job_id, orchestrator_id, &completion, now)
            .await
            .map_err(backend("finish job"))?;
        let job = self.expect_applied(job_id, orchestrator_id, action, outcome)?;

        let (update, payload) = match completion {
            JobCompletion::Completed { output } => (
                LogUpdate::status(LogStatus::Completed, now).with_output(output),
                JobEventPayload::Completed { job_id },
            ),
            JobCompletion::Failed { error } => (
                LogUpdate::status(LogStatus::Failed, now).with_error(error.clone()),
                JobEventPayload::Failed {
                    job_id,
                    error,
                    recovered: false,
                },
            ),
        };
        self.mirror_log(job_id, update).await;
        self.invalidate_stats(job.user_id);
        self.events.publish(job.user_id, payload, now);

        telemetry::record_job_finished(job_id, job.job_type, job.status);
        if let Some(started) = job.started_at {
            let secs = (now - started).num_milliseconds() as f64 / 1000.0;
            telemetry::observe_job_duration(job.job_type, job.status, secs);
        }
        Ok(job)
    }

    /// Current status of a job, without ownership checks.
    pub async fn job_status(&self, job_id: JobId) -> JobGateResult<JobStatus> {
        self.store
            .status(job_id)
            .await
            .map_err(backend("read job status"))?
            .ok_or_else(|| JobGateError::not_found("job", job_id))
    }

    // ---- orphan recovery ----

    /// `CLAIMED`/`RUNNING` jobs still attributed to `orchestrator_id`,
    /// at most [`MAX_ORPHAN_BATCH`].
    pub async fn orphaned_jobs(
        &self,
        orchestrator_id: &OrchestratorId,
        limit: usize,
    ) -> JobGateResult<Vec<Job>> {
        let limit = limit.clamp(1, MAX_ORPHAN_BATCH);
        self.store
            .orphaned(orchestrator_id, limit)
            .await
            .map_err(backend("list orphaned jobs"))
    }

    /// Requeues or fails one batch of jobs held by an orchestrator that is
    /// gone. Every update is conditional on the job still being held by
    /// that orchestrator, so running this twice is harmless.
    pub async fn recover_orphans(&self, orchestrator_id: &OrchestratorId) -> JobGateResult<RecoverySummary> {
        async {
            let orphans = self.orphaned_jobs(orchestrator_id, MAX_ORPHAN_BATCH).await?;
            let mut summary = RecoverySummary::default();

            for job in orphans {
                let now = self.clock.now();
                let decision = decide_orphan(&job, now, &self.config.recovery);
                let result = match &decision {
                    RecoveryOutcome::Requeued { delay_ms } => {
                        let available_at = now + Duration::milliseconds(*delay_ms as i64);
                        self.store
                            .requeue_orphan(job.id, orchestrator_id, available_at, "orchestrator lost", now)
                            .await
                    }
                    RecoveryOutcome::Failed { reason } => {
                        self.store.fail_orphan(job.id, orchestrator_id, reason, now).await
                    }
                };

                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(job_id = %job.id, error = %err, "orphan recovery failed, will retry");
                        summary.skipped += 1;
                        continue;
                    }
                };

                let Some(updated) = outcome.applied().cloned() else {
                    debug!(job_id = %job.id, "orphan changed before recovery reached it");
                    summary.skipped += 1;
                    continue;
                };

                match decision {
                    RecoveryOutcome::Requeued { .. } => {
                        if job.status == JobStatus::Running {
                            self.mirror_log(
                                job.id,
                                LogUpdate::status(LogStatus::Failed, now)
                                    .with_error("orchestrator lost"),
                            )
                            .await;
                            if let Err(err) = self
                                .store
                                .open_log(ExecutionLog::pending_for(&updated, now))
                                .await
                            {
                                warn!(job_id = %job.id, error = %err, "failed to open retry log");
                            }
                        }
                        self.events.publish(
                            updated.user_id,
                            JobEventPayload::Requeued {
                                job_id: job.id,
                                previous_orchestrator: orchestrator_id.clone(),
                                available_at: updated.available_at,
                            },
                            now,
                        );
                        summary.requeued += 1;
                    }
                    RecoveryOutcome::Failed { reason } => {
                        self.mirror_log(
                            job.id,
                            LogUpdate::status(LogStatus::Failed, now).with_error(reason.clone()),
                        )
                        .await;
                        self.events.publish(
                            updated.user_id,
                            JobEventPayload::Failed {
                                job_id: job.id,
                                error: reason,
                                recovered: true,
                            },
                            now,
                        );
                        telemetry::record_job_finished(job.id, updated.job_type, JobStatus::Failed);
                        summary.failed += 1;
                    }
                }
                self.invalidate_stats(updated.user_id);
            }

            if summary.handled() > 0 {
                telemetry::record_orphans_recovered(orchestrator_id, summary.requeued, summary.failed);
            }
            Ok(summary)
        }
        .instrument(telemetry::recovery_span(orchestrator_id))
        .await
    }

    // ---- helpers ----

    async fn load(&self, job_id: JobId) -> JobGateResult<Job> {
        self.store
            .get(job_id)
            .await
            .map_err(backend("load job"))?
            .ok_or_else(|| JobGateError::not_found("job", job_id))
    }

    fn expect_applied(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        action: &'static str,
        outcome: TransitionOutcome,
    ) -> JobGateResult<Job> {
        match outcome {
            TransitionOutcome::Applied(job) | TransitionOutcome::Unchanged(job) => Ok(job),
            TransitionOutcome::Conflict(current) => {
                Err(JobGateError::invalid_transition(current.status, action))
            }
            TransitionOutcome::WrongOrchestrator(current) => {
                debug!(
                    %job_id,
                    orchestrator_id = %orchestrator_id,
                    holder = ?current.orchestrator_id,
                    action,
                    "orchestrator does not hold job"
                );
                Err(JobGateError::forbidden(format!(
                    "job {job_id} is not held by orchestrator {orchestrator_id}"
                )))
            }
            TransitionOutcome::Missing => Err(JobGateError::not_found("job", job_id)),
        }
    }

    fn on_claimed(&self, job: &Job, orchestrator_id: &OrchestratorId, now: DateTime<Utc>) {
        info!(job_id = %job.id, orchestrator_id = %orchestrator_id, "job claimed");
        self.invalidate_stats(job.user_id);
        self.events.publish(
            job.user_id,
            JobEventPayload::Claimed {
                job_id: job.id,
                orchestrator_id: orchestrator_id.clone(),
            },
            now,
        );
    }

    /// Log mirroring is best effort; the job row is the source of truth.
    async fn mirror_log(&self, job_id: JobId, update: LogUpdate) {
        if let Err(err) = self.store.update_latest(job_id, update).await {
            warn!(%job_id, error = %err, "failed to update execution log");
        }
    }

    fn invalidate_stats(&self, user_id: UserId) {
        self.stats_epoch.fetch_add(1, Ordering::SeqCst);
        self.stats_cache.remove(&user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EventId, HttpSpec, JobPayload, JobType};
    use crate::memory::InMemoryJobStore;
    use crate::quota::{InMemoryQuotaManager, QuotaConfig, QuotaLimit};

    fn http_job(user_id: UserId) -> NewJob {
        NewJob {
            event_id: EventId::new(),
            user_id,
            job_type: JobType::HttpRequest,
            payload: JobPayload {
                http: Some(HttpSpec {
                    method: "GET".into(),
                    url: "https://example.com/health".into(),
                    headers: Default::default(),
                    body: None,
                }),
                ..Default::default()
            },
            metadata: Default::default(),
        }
    }

    fn service_with(quota: QuotaConfig) -> JobService {
        JobService::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryQuotaManager::new(quota)),
        )
    }

    fn service() -> JobService {
        service_with(QuotaConfig::default())
    }

    #[tokio::test]
    async fn test_create_opens_pending_log() {
        let service = service();
        let user = UserId::new();
        let job = service.create_job(http_job(user)).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let logs = service.job_logs(&Caller::user(user), job.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Pending);
        assert_eq!(logs[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_payload() {
        let service = service();
        let mut request = http_job(UserId::new());
        request.job_type = JobType::Script;
        let err = service.create_job(request).await.unwrap_err();
        assert!(matches!(err, JobGateError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_enforces_quota() {
        let service = service_with(
            QuotaConfig::default().with_limit(Resource::Executions, QuotaLimit::daily(1)),
        );
        let user = UserId::new();
        service.create_job(http_job(user)).await.unwrap();
        let err = service.create_job(http_job(user)).await.unwrap_err();
        assert!(matches!(
            err,
            JobGateError::QuotaExceeded {
                resource: Resource::Executions,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_get_job_checks_owner() {
        let service = service();
        let owner = UserId::new();
        let job = service.create_job(http_job(owner)).await.unwrap();

        assert!(service.get_job(&Caller::user(owner), job.id).await.is_ok());
        let err = service
            .get_job(&Caller::user(UserId::new()), job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, JobGateError::PermissionDenied(_)));

        let err = service
            .get_job(&Caller::user(owner), JobId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobGateError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_wrong_orchestrator_cannot_start() {
        let service = service();
        let job = service.create_job(http_job(UserId::new())).await.unwrap();
        service.claim_job(job.id, &"orch-a".into()).await.unwrap();

        let err = service.start_job(job.id, &"orch-b".into()).await.unwrap_err();
        assert!(matches!(err, JobGateError::PermissionDenied(_)));

        let running = service.start_job(job.id, &"orch-a".into()).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_completion_mirrors_log() {
        let service = service();
        let user = UserId::new();
        let orch: OrchestratorId = "orch-a".into();
        let job = service.create_job(http_job(user)).await.unwrap();
        service.claim_job(job.id, &orch).await.unwrap();
        service.start_job(job.id, &orch).await.unwrap();
        let done = service
            .complete_job(job.id, &orch, Some(serde_json::json!({"status": 200})))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.orchestrator_id.is_none());

        let logs = service.job_logs(&Caller::user(user), job.id).await.unwrap();
        assert_eq!(logs[0].status, LogStatus::Completed);
        assert_eq!(logs[0].output, Some(serde_json::json!({"status": 200})));
    }

    #[tokio::test]
    async fn test_stats_cache_invalidated_on_transition() {
        let service = service().with_config(ServiceConfig {
            stats_ttl_secs: 3600,
            ..Default::default()
        });
        let user = UserId::new();
        let job = service.create_job(http_job(user)).await.unwrap();
        let stats = service.get_job_stats(user).await.unwrap();
        assert_eq!(stats.count(JobStatus::Queued), 1);

        service.cancel_job(&Caller::user(user), job.id).await.unwrap();
        let stats = service.get_job_stats(user).await.unwrap();
        assert_eq!(stats.count(JobStatus::Queued), 0);
        assert_eq!(stats.count(JobStatus::Cancelled), 1);
    }

    #[tokio::test]
    async fn test_list_jobs_for_scopes_plain_users() {
        let service = service();
        let alice = UserId::new();
        let bob = UserId::new();
        service.create_job(http_job(alice)).await.unwrap();
        service.create_job(http_job(bob)).await.unwrap();

        let page = service
            .list_jobs_for(&Caller::user(alice), JobFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert!(
            service
                .list_jobs_for(&Caller::user(alice), JobFilter::for_user(bob), 10, 0)
                .await
                .is_err()
        );

        let all = service
            .list_jobs_for(&Caller::admin(UserId::new()), JobFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(all.total, 2);
    }
}

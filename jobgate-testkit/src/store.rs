use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobgate::{
    ExecutionLog, ExecutionLogStore, InMemoryJobStore, Job, JobCompletion, JobFilter, JobId,
    JobStatus, JobStore, LogUpdate, OrchestratorId, TransitionOutcome, UserId,
};
use tokio::sync::Notify;

/// In-memory store with switches for the failures a real backend can produce.
///
/// - `fail_next_starts(n)` makes the next `n` start updates error out
///   before touching the job
/// - `hold_status_counts()` makes `status_counts` take its snapshot, signal
///   [`FaultyJobStore::counts_taken`], and wait for
///   [`FaultyJobStore::release_status_counts`] before returning
#[derive(Debug, Clone, Default)]
pub struct FaultyJobStore {
    inner: InMemoryJobStore,
    faults: Arc<Faults>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_starts: AtomicUsize,
    hold_counts: AtomicBool,
    counts_taken: Notify,
    counts_released: Notify,
}

impl FaultyJobStore {
    pub fn new(inner: InMemoryJobStore) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    pub fn inner(&self) -> &InMemoryJobStore {
        &self.inner
    }

    pub fn fail_next_starts(&self, count: usize) {
        self.faults.failing_starts.store(count, Ordering::SeqCst);
    }

    pub fn hold_status_counts(&self) {
        self.faults.hold_counts.store(true, Ordering::SeqCst);
    }

    /// Resolves once a held `status_counts` call has read its snapshot.
    pub async fn counts_taken(&self) {
        self.faults.counts_taken.notified().await;
    }

    pub fn release_status_counts(&self) {
        self.faults.hold_counts.store(false, Ordering::SeqCst);
        self.faults.counts_released.notify_one();
    }
}

#[async_trait]
impl JobStore for FaultyJobStore {
    async fn insert(&self, job: Job) -> anyhow::Result<Job> {
        self.inner.insert(job).await
    }

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<Job>> {
        self.inner.get(job_id).await
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<(Vec<Job>, u64)> {
        self.inner.list(filter, limit, offset).await
    }

    async fn claim(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        self.inner.claim(job_id, orchestrator_id, now).await
    }

    async fn claim_next(
        &self,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        self.inner.claim_next(orchestrator_id, now).await
    }

    async fn start(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        let failing = self
            .faults
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection reset while starting job {job_id}");
        }
        self.inner.start(job_id, orchestrator_id, now).await
    }

    async fn finish(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        completion: &JobCompletion,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        self.inner.finish(job_id, orchestrator_id, completion, now).await
    }

    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> anyhow::Result<TransitionOutcome> {
        self.inner.cancel(job_id, now).await
    }

    async fn requeue_orphan(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        available_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        self.inner
            .requeue_orphan(job_id, orchestrator_id, available_at, reason, now)
            .await
    }

    async fn fail_orphan(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        self.inner.fail_orphan(job_id, orchestrator_id, reason, now).await
    }

    async fn orphaned(
        &self,
        orchestrator_id: &OrchestratorId,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>> {
        self.inner.orphaned(orchestrator_id, limit).await
    }

    async fn status_counts(&self, user_id: UserId) -> anyhow::Result<Vec<(JobStatus, u64)>> {
        let counts = self.inner.status_counts(user_id).await?;
        if self.faults.hold_counts.load(Ordering::SeqCst) {
            self.faults.counts_taken.notify_one();
            self.faults.counts_released.notified().await;
        }
        Ok(counts)
    }
}

#[async_trait]
impl ExecutionLogStore for FaultyJobStore {
    async fn open_log(&self, log: ExecutionLog) -> anyhow::Result<()> {
        self.inner.open_log(log).await
    }

    async fn update_latest(
        &self,
        job_id: JobId,
        update: LogUpdate,
    ) -> anyhow::Result<Option<ExecutionLog>> {
        self.inner.update_latest(job_id, update).await
    }

    async fn logs_for(&self, job_id: JobId) -> anyhow::Result<Vec<ExecutionLog>> {
        self.inner.logs_for(job_id).await
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionLogStore;
use crate::job::{Job, JobFilter, JobId, JobStatus, OrchestratorId, UserId};

/// How a running job ended, as reported by its orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobCompletion {
    Completed {
        #[serde(default)]
        output: Option<serde_json::Value>,
    },
    Failed {
        error: String,
    },
}

impl JobCompletion {
    pub fn target_status(&self) -> JobStatus {
        match self {
            JobCompletion::Completed { .. } => JobStatus::Completed,
            JobCompletion::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Result of a conditional status update.
///
/// Every mutating store call either applies atomically or reports why it
/// did not, so callers never need a separate read to detect a lost race.
#[derive(Clone, Debug, PartialEq)]
pub enum TransitionOutcome {
    /// The update matched its precondition and was written.
    Applied(Job),
    /// The job already sits in the requested state; nothing was written.
    Unchanged(Job),
    /// The job's current state does not allow the transition.
    Conflict(Job),
    /// The job is held by a different orchestrator (or by none).
    WrongOrchestrator(Job),
    /// No job with that identifier exists.
    Missing,
}

impl TransitionOutcome {
    /// The written job, if the update was applied.
    pub fn applied(&self) -> Option<&Job> {
        match self {
            TransitionOutcome::Applied(job) => Some(job),
            _ => None,
        }
    }

    /// The job as the store saw it, whether or not anything was written.
    /// `None` only for [`TransitionOutcome::Missing`].
    pub fn job(&self) -> Option<&Job> {
        match self {
            TransitionOutcome::Applied(job)
            | TransitionOutcome::Unchanged(job)
            | TransitionOutcome::Conflict(job)
            | TransitionOutcome::WrongOrchestrator(job) => Some(job),
            TransitionOutcome::Missing => None,
        }
    }
}

/// Storage backend for jobs.
///
/// Implementations must make every transition a single conditional update:
/// the precondition (current status, holding orchestrator) and the write
/// happen atomically, so that of N concurrent claimants exactly one wins.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job.
    async fn insert(&self, job: Job) -> anyhow::Result<Job>;

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<Job>>;

    /// Current status only; used by cancellation watchers.
    async fn status(&self, job_id: JobId) -> anyhow::Result<Option<JobStatus>> {
        Ok(self.get(job_id).await?.map(|job| job.status))
    }

    /// One page of matching jobs, newest first, plus the total match count.
    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<(Vec<Job>, u64)>;

    /// `QUEUED -> CLAIMED` for a specific job. `None` means another caller
    /// won, the job is no longer queued, or it does not exist.
    async fn claim(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>>;

    /// Claim the oldest queued job whose `available_at` has passed.
    async fn claim_next(
        &self,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>>;

    /// `CLAIMED -> RUNNING`, only for the holding orchestrator.
    async fn start(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome>;

    /// `RUNNING -> COMPLETED | FAILED`, only for the holding orchestrator.
    async fn finish(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        completion: &JobCompletion,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome>;

    /// `QUEUED | CLAIMED | RUNNING -> CANCELLED`. An already cancelled job
    /// reports `Unchanged`.
    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> anyhow::Result<TransitionOutcome>;

    /// Recovery edge `CLAIMED | RUNNING -> QUEUED`, conditional on the job
    /// still being held by `orchestrator_id`.
    async fn requeue_orphan(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        available_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome>;

    /// Recovery edge `CLAIMED | RUNNING -> FAILED`, same precondition as
    /// [`JobStore::requeue_orphan`].
    async fn fail_orphan(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome>;

    /// `CLAIMED`/`RUNNING` jobs held by `orchestrator_id`, oldest claim first.
    async fn orphaned(
        &self,
        orchestrator_id: &OrchestratorId,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>>;

    /// Job counts per status for one user. Statuses with no jobs may be omitted.
    async fn status_counts(&self, user_id: UserId) -> anyhow::Result<Vec<(JobStatus, u64)>>;
}

/// Everything the job service needs from storage.
pub trait JobBackend: JobStore + ExecutionLogStore + std::fmt::Debug {}

impl<T> JobBackend for T where T: JobStore + ExecutionLogStore + std::fmt::Debug {}

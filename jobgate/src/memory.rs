//! In-process job store.
//!
//! All jobs and execution logs live behind a single mutex, which makes every
//! transition trivially atomic. Suitable for tests and single-instance
//! deployments; state is lost on restart.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::execution::{ExecutionLog, ExecutionLogStore, LogUpdate};
use crate::job::{Job, JobFilter, JobId, JobStatus, OrchestratorId, UserId};
use crate::store::{JobCompletion, JobStore, TransitionOutcome};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    logs: HashMap<JobId, Vec<ExecutionLog>>,
}

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &inner.jobs.len())
            .field("logged_jobs", &inner.logs.len())
            .finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored job, in no particular order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.inner.lock().jobs.values().cloned().collect()
    }

    fn transition<F>(&self, job_id: JobId, apply: F) -> TransitionOutcome
    where
        F: FnOnce(&mut Job) -> TransitionOutcome,
    {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(job) => apply(job),
            None => TransitionOutcome::Missing,
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> anyhow::Result<Job> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            anyhow::bail!("job {} already exists", job.id);
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&job_id).cloned())
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<(Vec<Job>, u64)> {
        let inner = self.inner.lock();
        let mut matching: Vec<&Job> = inner.jobs.values().filter(|job| filter.matches(job)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn claim(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Queued {
            return Ok(None);
        }
        job.mark_claimed(orchestrator_id.clone(), now)?;
        Ok(Some(job.clone()))
    }

    async fn claim_next(
        &self,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let mut inner = self.inner.lock();
        let next = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.available_at <= now)
            .min_by(|a, b| {
                a.available_at
                    .cmp(&b.available_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|job| job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.mark_claimed(orchestrator_id.clone(), now)?;
        Ok(Some(job.clone()))
    }

    async fn start(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        Ok(self.transition(job_id, |job| {
            if job.status != JobStatus::Claimed {
                return TransitionOutcome::Conflict(job.clone());
            }
            if !job.is_held_by(orchestrator_id) {
                return TransitionOutcome::WrongOrchestrator(job.clone());
            }
            match job.mark_running(now) {
                Ok(()) => TransitionOutcome::Applied(job.clone()),
                Err(_) => TransitionOutcome::Conflict(job.clone()),
            }
        }))
    }

    async fn finish(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        completion: &JobCompletion,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        Ok(self.transition(job_id, |job| {
            if job.status != JobStatus::Running {
                return TransitionOutcome::Conflict(job.clone());
            }
            if !job.is_held_by(orchestrator_id) {
                return TransitionOutcome::WrongOrchestrator(job.clone());
            }
            let result = match completion {
                JobCompletion::Completed { .. } => job.mark_completed(now),
                JobCompletion::Failed { error } => job.mark_failed(error.clone(), now),
            };
            match result {
                Ok(()) => TransitionOutcome::Applied(job.clone()),
                Err(_) => TransitionOutcome::Conflict(job.clone()),
            }
        }))
    }

    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> anyhow::Result<TransitionOutcome> {
        Ok(self.transition(job_id, |job| match job.status {
            JobStatus::Cancelled => TransitionOutcome::Unchanged(job.clone()),
            JobStatus::Completed | JobStatus::Failed => TransitionOutcome::Conflict(job.clone()),
            _ => match job.mark_cancelled(now) {
                Ok(()) => TransitionOutcome::Applied(job.clone()),
                Err(_) => TransitionOutcome::Conflict(job.clone()),
            },
        }))
    }

    async fn requeue_orphan(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        available_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        Ok(self.transition(job_id, |job| {
            if !job.status.holds_orchestrator() {
                return TransitionOutcome::Conflict(job.clone());
            }
            if !job.is_held_by(orchestrator_id) {
                return TransitionOutcome::WrongOrchestrator(job.clone());
            }
            match job.requeue_orphan(available_at, reason, now) {
                Ok(()) => TransitionOutcome::Applied(job.clone()),
                Err(_) => TransitionOutcome::Conflict(job.clone()),
            }
        }))
    }

    async fn fail_orphan(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        Ok(self.transition(job_id, |job| {
            if !job.status.holds_orchestrator() {
                return TransitionOutcome::Conflict(job.clone());
            }
            if !job.is_held_by(orchestrator_id) {
                return TransitionOutcome::WrongOrchestrator(job.clone());
            }
            match job.fail_orphan(reason, now) {
                Ok(()) => TransitionOutcome::Applied(job.clone()),
                Err(_) => TransitionOutcome::Conflict(job.clone()),
            }
        }))
    }

    async fn orphaned(
        &self,
        orchestrator_id: &OrchestratorId,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>> {
        let inner = self.inner.lock();
        let mut held: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| job.status.holds_orchestrator() && job.is_held_by(orchestrator_id))
            .collect();
        held.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at).then(a.id.cmp(&b.id)));
        Ok(held.into_iter().take(limit).cloned().collect())
    }

    async fn status_counts(&self, user_id: UserId) -> anyhow::Result<Vec<(JobStatus, u64)>> {
        let inner = self.inner.lock();
        let mut counts: HashMap<JobStatus, u64> = HashMap::new();
        for job in inner.jobs.values().filter(|job| job.user_id == user_id) {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

#[async_trait]
impl ExecutionLogStore for InMemoryJobStore {
    async fn open_log(&self, log: ExecutionLog) -> anyhow::Result<()> {
        self.inner.lock().logs.entry(log.job_id).or_default().push(log);
        Ok(())
    }

    async fn update_latest(
        &self,
        job_id: JobId,
        update: LogUpdate,
    ) -> anyhow::Result<Option<ExecutionLog>> {
        let mut inner = self.inner.lock();
        let Some(latest) = inner.logs.get_mut(&job_id).and_then(|logs| logs.last_mut()) else {
            return Ok(None);
        };
        if latest.apply(&update) {
            Ok(Some(latest.clone()))
        } else {
            Ok(None)
        }
    }

    async fn logs_for(&self, job_id: JobId) -> anyhow::Result<Vec<ExecutionLog>> {
        Ok(self
            .inner
            .lock()
            .logs
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EventId, JobPayload, JobType, NewJob, ScriptKind, ScriptSpec};

    fn new_job(user_id: UserId, at: DateTime<Utc>) -> Job {
        Job::queued(
            NewJob {
                event_id: EventId::new(),
                user_id,
                job_type: JobType::Script,
                payload: JobPayload {
                    script: Some(ScriptSpec {
                        kind: ScriptKind::Bash,
                        content: "true".into(),
                        working_directory: None,
                    }),
                    ..Default::default()
                },
                metadata: Default::default(),
            },
            at,
        )
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job(UserId::new(), now)).await.unwrap();

        let a: OrchestratorId = "orch-a".into();
        let b: OrchestratorId = "orch-b".into();
        assert!(store.claim(job.id, &a, now).await.unwrap().is_some());
        assert!(store.claim(job.id, &b, now).await.unwrap().is_none());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert!(stored.is_held_by(&a));
    }

    #[tokio::test]
    async fn test_claim_next_respects_available_at() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let orch: OrchestratorId = "orch-a".into();

        let mut later = new_job(UserId::new(), now);
        later.available_at = now + chrono::Duration::seconds(30);
        store.insert(later).await.unwrap();
        assert!(store.claim_next(&orch, now).await.unwrap().is_none());

        let ready = store.insert(new_job(UserId::new(), now)).await.unwrap();
        let claimed = store.claim_next(&orch, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, ready.id);
    }

    #[tokio::test]
    async fn test_start_requires_holder() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job(UserId::new(), now)).await.unwrap();
        store.claim(job.id, &"orch-a".into(), now).await.unwrap();

        let outcome = store.start(job.id, &"orch-b".into(), now).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::WrongOrchestrator(_)));

        let outcome = store.start(job.id, &"orch-a".into(), now).await.unwrap();
        assert_eq!(outcome.applied().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_list_pages_newest_first() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();
        let base = Utc::now();
        for i in 0..5 {
            store
                .insert(new_job(user, base + chrono::Duration::seconds(i)))
                .await
                .unwrap();
        }

        let (page, total) = store.list(&JobFilter::for_user(user), 2, 1).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].created_at, base + chrono::Duration::seconds(3));
        assert_eq!(page[1].created_at, base + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_update_latest_targets_newest_log() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job(UserId::new(), now)).await.unwrap();

        let first = ExecutionLog::pending_for(&job, now);
        store.open_log(first).await.unwrap();
        store
            .update_latest(job.id, LogUpdate::status(crate::execution::LogStatus::Failed, now))
            .await
            .unwrap();

        let mut retried = job.clone();
        retried.attempts = 1;
        store.open_log(ExecutionLog::pending_for(&retried, now)).await.unwrap();
        let updated = store
            .update_latest(job.id, LogUpdate::status(crate::execution::LogStatus::Running, now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.attempt, 2);

        let logs = store.logs_for(job.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, crate::execution::LogStatus::Failed);
    }
}

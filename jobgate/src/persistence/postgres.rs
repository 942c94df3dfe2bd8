use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::execution::{ExecutionLog, ExecutionLogStore, LogId, LogStatus, LogUpdate};
use crate::job::{EventId, Job, JobFilter, JobId, JobStatus, OrchestratorId, UserId};
use crate::store::{JobCompletion, JobStore, TransitionOutcome};

const JOB_COLUMNS: &str = "id, user_id, event_id, job_type, payload, status, orchestrator_id, \
     attempts, last_error, metadata, available_at, created_at, updated_at, claimed_at, \
     started_at, completed_at";

const LOG_COLUMNS: &str = "id, job_id, event_id, user_id, attempt, status, output, error, \
     created_at, started_at, ended_at, duration_ms";

/// PostgreSQL-backed job and execution-log store.
///
/// Every transition is one conditional `UPDATE ... WHERE status = ...
/// RETURNING`, so the row lock taken by Postgres serializes racing callers
/// and exactly one of them sees the returned row. When nothing is returned a
/// follow-up read classifies why.
#[derive(Clone, Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool from configuration and applies pending migrations.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(StdDuration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("jobgate migrations applied");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explains why a conditional update touched no row.
    async fn classify(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        expected: &[JobStatus],
    ) -> anyhow::Result<TransitionOutcome> {
        let Some(job) = self.get(job_id).await? else {
            return Ok(TransitionOutcome::Missing);
        };
        if expected.contains(&job.status) && !job.is_held_by(orchestrator_id) {
            Ok(TransitionOutcome::WrongOrchestrator(job))
        } else {
            Ok(TransitionOutcome::Conflict(job))
        }
    }
}

fn job_from_row(row: &PgRow) -> anyhow::Result<Job> {
    let status: String = row.try_get("status")?;
    let job_type: String = row.try_get("job_type")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let metadata: serde_json::Value = row.try_get("metadata")?;
    let attempts: i32 = row.try_get("attempts")?;
    let orchestrator_id: Option<String> = row.try_get("orchestrator_id")?;

    let metadata = match metadata {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => anyhow::bail!("job metadata must be an object, got {other}"),
    };

    Ok(Job {
        id: JobId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        event_id: EventId(row.try_get("event_id")?),
        job_type: job_type.parse()?,
        payload: serde_json::from_value(payload)?,
        status: status.parse()?,
        orchestrator_id: orchestrator_id.map(OrchestratorId::new),
        attempts: u32::try_from(attempts)?,
        last_error: row.try_get("last_error")?,
        metadata,
        available_at: row.try_get("available_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        claimed_at: row.try_get("claimed_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn log_from_row(row: &PgRow) -> anyhow::Result<ExecutionLog> {
    let status: String = row.try_get("status")?;
    let attempt: i32 = row.try_get("attempt")?;

    Ok(ExecutionLog {
        id: LogId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        event_id: EventId(row.try_get("event_id")?),
        user_id: UserId(row.try_get("user_id")?),
        attempt: u32::try_from(attempt)?,
        status: LogStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("invalid log status: {status}"))?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> anyhow::Result<Job> {
        let payload = serde_json::to_value(&job.payload)?;
        let metadata = serde_json::Value::Object(job.metadata.clone());

        sqlx::query(
            r#"
            INSERT INTO jobgate_jobs (
                id, user_id, event_id, job_type, payload, status, orchestrator_id,
                attempts, last_error, metadata, available_at, created_at, updated_at,
                claimed_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.0)
        .bind(job.user_id.0)
        .bind(job.event_id.0)
        .bind(job.job_type.as_str())
        .bind(&payload)
        .bind(job.status.as_str())
        .bind(job.orchestrator_id.as_ref().map(OrchestratorId::as_str))
        .bind(i32::try_from(job.attempts)?)
        .bind(&job.last_error)
        .bind(&metadata)
        .bind(job.available_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.claimed_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobgate_jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn status(&self, job_id: JobId) -> anyhow::Result<Option<JobStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobgate_jobs WHERE id = $1")
                .bind(job_id.0)
                .fetch_optional(&self.pool)
                .await?;
        status.map(|s| s.parse()).transpose()
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<(Vec<Job>, u64)> {
        let user_id = filter.user_id.map(|id| id.0);
        let status = filter.status.map(|s| s.as_str());
        let event_id = filter.event_id.map(|id| id.0);
        let predicate = "($1::uuid IS NULL OR user_id = $1) \
             AND ($2::text IS NULL OR status = $2) \
             AND ($3::uuid IS NULL OR event_id = $3)";

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM jobgate_jobs WHERE {predicate}"))
                .bind(user_id)
                .bind(status)
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobgate_jobs WHERE {predicate} \
             ORDER BY created_at DESC, id DESC LIMIT $4 OFFSET $5"
        ))
        .bind(user_id)
        .bind(status)
        .bind(event_id)
        .bind(i64::try_from(limit)?)
        .bind(i64::try_from(offset)?)
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows.iter().map(job_from_row).collect::<anyhow::Result<Vec<_>>>()?;
        Ok((jobs, u64::try_from(total)?))
    }

    async fn claim(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobgate_jobs
            SET status = 'CLAIMED',
                orchestrator_id = $2,
                claimed_at = $3,
                updated_at = $3
            WHERE id = $1
              AND status = 'QUEUED'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(orchestrator_id.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            debug!(%job_id, %orchestrator_id, "claim matched no queued row");
        }
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next(
        &self,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobgate_jobs
            SET status = 'CLAIMED',
                orchestrator_id = $1,
                claimed_at = $2,
                updated_at = $2
            WHERE id = (
                SELECT id
                FROM jobgate_jobs
                WHERE status = 'QUEUED'
                  AND available_at <= $2
                ORDER BY available_at ASC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(orchestrator_id.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn start(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobgate_jobs
            SET status = 'RUNNING',
                attempts = attempts + 1,
                started_at = $3,
                updated_at = $3
            WHERE id = $1
              AND status = 'CLAIMED'
              AND orchestrator_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(orchestrator_id.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(job_from_row(&row)?)),
            None => {
                self.classify(job_id, orchestrator_id, &[JobStatus::Claimed])
                    .await
            }
        }
    }

    async fn finish(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        completion: &JobCompletion,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        let error = match completion {
            JobCompletion::Completed { .. } => None,
            JobCompletion::Failed { error } => Some(error.as_str()),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobgate_jobs
            SET status = $3,
                orchestrator_id = NULL,
                last_error = COALESCE($5, last_error),
                completed_at = $4,
                updated_at = $4
            WHERE id = $1
              AND status = 'RUNNING'
              AND orchestrator_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(orchestrator_id.as_str())
        .bind(completion.target_status().as_str())
        .bind(now)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(job_from_row(&row)?)),
            None => {
                self.classify(job_id, orchestrator_id, &[JobStatus::Running])
                    .await
            }
        }
    }

    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> anyhow::Result<TransitionOutcome> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobgate_jobs
            SET status = 'CANCELLED',
                orchestrator_id = NULL,
                completed_at = $2,
                updated_at = $2
            WHERE id = $1
              AND status IN ('QUEUED', 'CLAIMED', 'RUNNING')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(TransitionOutcome::Applied(job_from_row(&row)?));
        }
        Ok(match self.get(job_id).await? {
            None => TransitionOutcome::Missing,
            Some(job) if job.status == JobStatus::Cancelled => TransitionOutcome::Unchanged(job),
            Some(job) => TransitionOutcome::Conflict(job),
        })
    }

    async fn requeue_orphan(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        available_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobgate_jobs
            SET status = 'QUEUED',
                orchestrator_id = NULL,
                claimed_at = NULL,
                started_at = NULL,
                last_error = $4,
                available_at = $3,
                updated_at = $5
            WHERE id = $1
              AND status IN ('CLAIMED', 'RUNNING')
              AND orchestrator_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(orchestrator_id.as_str())
        .bind(available_at)
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(job_from_row(&row)?)),
            None => {
                self.classify(
                    job_id,
                    orchestrator_id,
                    &[JobStatus::Claimed, JobStatus::Running],
                )
                .await
            }
        }
    }

    async fn fail_orphan(
        &self,
        job_id: JobId,
        orchestrator_id: &OrchestratorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TransitionOutcome> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobgate_jobs
            SET status = 'FAILED',
                orchestrator_id = NULL,
                last_error = $3,
                completed_at = $4,
                updated_at = $4
            WHERE id = $1
              AND status IN ('CLAIMED', 'RUNNING')
              AND orchestrator_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(orchestrator_id.as_str())
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(job_from_row(&row)?)),
            None => {
                self.classify(
                    job_id,
                    orchestrator_id,
                    &[JobStatus::Claimed, JobStatus::Running],
                )
                .await
            }
        }
    }

    async fn orphaned(
        &self,
        orchestrator_id: &OrchestratorId,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobgate_jobs
            WHERE orchestrator_id = $1
              AND status IN ('CLAIMED', 'RUNNING')
            ORDER BY claimed_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(orchestrator_id.as_str())
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn status_counts(&self, user_id: UserId) -> anyhow::Result<Vec<(JobStatus, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM jobgate_jobs
            WHERE user_id = $1
            GROUP BY status
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> anyhow::Result<(JobStatus, u64)> {
                let status: String = row.try_get("status")?;
                let count: i64 = row.try_get("count")?;
                Ok((status.parse()?, u64::try_from(count)?))
            })
            .collect()
    }
}

#[async_trait]
impl ExecutionLogStore for PostgresJobStore {
    async fn open_log(&self, log: ExecutionLog) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO jobgate_execution_logs ({LOG_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(log.id.0)
        .bind(log.job_id.0)
        .bind(log.event_id.0)
        .bind(log.user_id.0)
        .bind(i32::try_from(log.attempt)?)
        .bind(log.status.as_str())
        .bind(&log.output)
        .bind(&log.error)
        .bind(log.created_at)
        .bind(log.started_at)
        .bind(log.ended_at)
        .bind(log.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_latest(
        &self,
        job_id: JobId,
        update: LogUpdate,
    ) -> anyhow::Result<Option<ExecutionLog>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM jobgate_execution_logs WHERE job_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1 FOR UPDATE"
        ))
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut log = log_from_row(&row)?;
        if !log.apply(&update) {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE jobgate_execution_logs
            SET status = $2,
                output = $3,
                error = $4,
                started_at = $5,
                ended_at = $6,
                duration_ms = $7
            WHERE id = $1
            "#,
        )
        .bind(log.id.0)
        .bind(log.status.as_str())
        .bind(&log.output)
        .bind(&log.error)
        .bind(log.started_at)
        .bind(log.ended_at)
        .bind(log.duration_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(log))
    }

    async fn logs_for(&self, job_id: JobId) -> anyhow::Result<Vec<ExecutionLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM jobgate_execution_logs WHERE job_id = $1 \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_from_row).collect()
    }
}

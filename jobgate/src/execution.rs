//! Execution log records.
//!
//! Each job owns one log per execution attempt. The first log is opened as
//! `Pending` when the job is created; orphan recovery opens a fresh one for
//! the next attempt. Job status changes are mirrored onto the latest log.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{EventId, Job, JobId, JobStatus, UserId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub Uuid);

impl LogId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "PENDING",
            LogStatus::Running => "RUNNING",
            LogStatus::Completed => "COMPLETED",
            LogStatus::Failed => "FAILED",
            LogStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(LogStatus::Pending),
            "RUNNING" => Some(LogStatus::Running),
            "COMPLETED" => Some(LogStatus::Completed),
            "FAILED" => Some(LogStatus::Failed),
            "CANCELLED" => Some(LogStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LogStatus::Completed | LogStatus::Failed | LogStatus::Cancelled
        )
    }
}

impl From<JobStatus> for LogStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued | JobStatus::Claimed => LogStatus::Pending,
            JobStatus::Running => LogStatus::Running,
            JobStatus::Completed => LogStatus::Completed,
            JobStatus::Failed => LogStatus::Failed,
            JobStatus::Cancelled => LogStatus::Cancelled,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: LogId,
    pub job_id: JobId,
    pub event_id: EventId,
    pub user_id: UserId,
    /// 1-based attempt this log belongs to.
    pub attempt: u32,
    pub status: LogStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl ExecutionLog {
    /// A pending log for the job's next attempt.
    pub fn pending_for(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            id: LogId::new(),
            job_id: job.id,
            event_id: job.event_id,
            user_id: job.user_id,
            attempt: job.attempts + 1,
            status: LogStatus::Pending,
            output: None,
            error: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_ms: None,
        }
    }

    /// Applies an update in place. Terminal logs are left untouched.
    pub fn apply(&mut self, update: &LogUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = update.status;
        if update.status == LogStatus::Running && self.started_at.is_none() {
            self.started_at = Some(update.at);
        }
        if update.output.is_some() {
            self.output = update.output.clone();
        }
        if update.error.is_some() {
            self.error = update.error.clone();
        }
        if update.status.is_terminal() {
            self.ended_at = Some(update.at);
            self.duration_ms = self
                .started_at
                .map(|started| (update.at - started).num_milliseconds());
        }
        true
    }
}

/// Change applied to the latest log of a job.
#[derive(Clone, Debug, PartialEq)]
pub struct LogUpdate {
    pub status: LogStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl LogUpdate {
    pub fn status(status: LogStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            output: None,
            error: None,
            at,
        }
    }

    pub fn with_output(mut self, output: Option<serde_json::Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn open_log(&self, log: ExecutionLog) -> anyhow::Result<()>;

    /// Updates the most recent log of `job_id`. Returns `None` when the job
    /// has no log or its latest log is already terminal.
    async fn update_latest(
        &self,
        job_id: JobId,
        update: LogUpdate,
    ) -> anyhow::Result<Option<ExecutionLog>>;

    /// All logs of a job, oldest attempt first.
    async fn logs_for(&self, job_id: JobId) -> anyhow::Result<Vec<ExecutionLog>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn log() -> ExecutionLog {
        ExecutionLog {
            id: LogId::new(),
            job_id: JobId::new(),
            event_id: EventId::new(),
            user_id: UserId::new(),
            attempt: 1,
            status: LogStatus::Pending,
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
        }
    }

    #[test]
    fn test_apply_tracks_duration() {
        let mut log = log();
        let start = Utc::now();
        assert!(log.apply(&LogUpdate::status(LogStatus::Running, start)));
        let end = start + Duration::milliseconds(1500);
        assert!(log.apply(
            &LogUpdate::status(LogStatus::Completed, end)
                .with_output(Some(serde_json::json!({"exit_code": 0})))
        ));
        assert_eq!(log.duration_ms, Some(1500));
        assert_eq!(log.ended_at, Some(end));
        assert!(log.output.is_some());
    }

    #[test]
    fn test_terminal_log_is_frozen() {
        let mut log = log();
        let now = Utc::now();
        assert!(log.apply(&LogUpdate::status(LogStatus::Cancelled, now)));
        assert!(log.duration_ms.is_none());
        assert!(!log.apply(&LogUpdate::status(LogStatus::Running, now)));
        assert_eq!(log.status, LogStatus::Cancelled);
    }

    #[test]
    fn test_log_status_mirrors_job_status() {
        assert_eq!(LogStatus::from(JobStatus::Claimed), LogStatus::Pending);
        assert_eq!(LogStatus::from(JobStatus::Failed), LogStatus::Failed);
        for status in [LogStatus::Pending, LogStatus::Cancelled] {
            assert_eq!(LogStatus::parse(status.as_str()), Some(status));
        }
    }
}

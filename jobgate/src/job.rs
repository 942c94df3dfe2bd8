use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
///
/// Version 7, so ids sort by creation time.
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    /// Generates a fresh, time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the user owning jobs, quotas and rate-limit keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Random id; real deployments take user ids from their auth layer.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the event (script, HTTP call, tool action) that produced a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Random id for an event that has none yet.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an orchestrator instance that claims and executes jobs.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrchestratorId(String);

impl OrchestratorId {
    /// Wraps an instance name, e.g. `"orch-eu-1"`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw instance name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OrchestratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrchestratorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OrchestratorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a job.
///
/// `QUEUED -> CLAIMED -> RUNNING -> {COMPLETED | FAILED | CANCELLED}`, with
/// `QUEUED` and `CLAIMED` also allowed to go straight to `CANCELLED`. The only
/// backward edge (`CLAIMED | RUNNING -> QUEUED`) belongs to orphan recovery and
/// is not reachable through [`JobStatus::can_transition_to`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Claimed,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Claimed,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Claimed => "CLAIMED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States a user may still cancel from.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Claimed | JobStatus::Running
        )
    }

    /// States in which an orchestrator identifier must be attached.
    pub fn holds_orchestrator(&self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }

    /// Forward transitions of the lifecycle state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Claimed)
                | (Queued, Cancelled)
                | (Claimed, Running)
                | (Claimed, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Position in the lifecycle, used to check monotonicity.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Claimed => 1,
            JobStatus::Running => 2,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 3,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("invalid job status: {s}"))
    }
}

/// What a job executes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Script,
    HttpRequest,
    ToolAction,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Script => "SCRIPT",
            JobType::HttpRequest => "HTTP_REQUEST",
            JobType::ToolAction => "TOOL_ACTION",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCRIPT" => Ok(JobType::Script),
            "HTTP_REQUEST" => Ok(JobType::HttpRequest),
            "TOOL_ACTION" => Ok(JobType::ToolAction),
            other => Err(anyhow::anyhow!("invalid job type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptKind {
    Bash,
    Python,
    Node,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub kind: ScriptKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub tool: String,
    pub action: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Where the payload runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    #[default]
    Local,
    Server {
        server_id: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of execution attempts allowed, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

/// Longest execution timeout a payload may request (7 days).
pub const MAX_JOB_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Execution instructions carried by a job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolSpec>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub target: Target,
    /// Execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub input_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    /// Checks that the payload carries the section its job type needs.
    pub fn validate(&self, job_type: JobType) -> Result<(), String> {
        match job_type {
            JobType::Script => match &self.script {
                Some(script) if !script.content.trim().is_empty() => {}
                Some(_) => return Err("script content is empty".into()),
                None => return Err("script job requires a script section".into()),
            },
            JobType::HttpRequest => match &self.http {
                Some(http) if http.url.trim().is_empty() => {
                    return Err("http job requires a url".into());
                }
                Some(http) if http.method.trim().is_empty() => {
                    return Err("http job requires a method".into());
                }
                Some(_) => {}
                None => return Err("http job requires an http section".into()),
            },
            JobType::ToolAction => match &self.tool {
                Some(tool) if tool.tool.is_empty() || tool.action.is_empty() => {
                    return Err("tool job requires tool and action".into());
                }
                Some(_) => {}
                None => return Err("tool job requires a tool section".into()),
            },
        }

        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".into());
        }
        match self.timeout_secs {
            Some(0) => return Err("timeout_secs must be positive".into()),
            Some(secs) if secs > MAX_JOB_TIMEOUT_SECS => {
                return Err(format!("timeout_secs must not exceed {MAX_JOB_TIMEOUT_SECS}"));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Request to create a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewJob {
    pub event_id: EventId,
    pub user_id: UserId,
    pub job_type: JobType,
    pub payload: JobPayload,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A unit of scheduled or on-demand work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub orchestrator_id: Option<OrchestratorId>,
    /// Number of execution attempts that reached `RUNNING`.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Earliest time the job may be claimed; pushed forward on requeue.
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Error returned when an in-place transition is not allowed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IllegalTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

impl Job {
    /// Builds a freshly queued job from a creation request.
    pub fn queued(request: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            user_id: request.user_id,
            event_id: request.event_id,
            job_type: request.job_type,
            payload: request.payload,
            status: JobStatus::Queued,
            orchestrator_id: None,
            attempts: 0,
            last_error: None,
            metadata: request.metadata,
            available_at: now,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.payload.retry.max_attempts.max(1)
    }

    pub fn has_retries_left(&self) -> bool {
        self.attempts < self.max_attempts()
    }

    /// Whether the job has been running longer than its payload timeout.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match (self.started_at, self.payload.timeout_secs) {
            (Some(started), Some(secs)) => {
                match chrono::TimeDelta::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)) {
                    Some(limit) => now - started > limit,
                    // Beyond chrono's range the deadline is never reached.
                    None => false,
                }
            }
            _ => false,
        }
    }

    pub fn is_held_by(&self, orchestrator_id: &OrchestratorId) -> bool {
        self.orchestrator_id.as_ref() == Some(orchestrator_id)
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(to) {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_claimed(
        &mut self,
        orchestrator_id: OrchestratorId,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalTransition> {
        self.transition(JobStatus::Claimed, now)?;
        self.orchestrator_id = Some(orchestrator_id);
        self.claimed_at = Some(now);
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), IllegalTransition> {
        self.transition(JobStatus::Running, now)?;
        self.attempts += 1;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), IllegalTransition> {
        self.transition(JobStatus::Completed, now)?;
        self.orchestrator_id = None;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalTransition> {
        self.transition(JobStatus::Failed, now)?;
        self.orchestrator_id = None;
        self.last_error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), IllegalTransition> {
        self.transition(JobStatus::Cancelled, now)?;
        self.orchestrator_id = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Recovery-only edge: hands an orphaned job back to the queue.
    pub fn requeue_orphan(
        &mut self,
        available_at: DateTime<Utc>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalTransition> {
        if !self.status.holds_orchestrator() {
            return Err(IllegalTransition {
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.status = JobStatus::Queued;
        self.orchestrator_id = None;
        self.claimed_at = None;
        self.started_at = None;
        self.last_error = Some(reason.into());
        self.available_at = available_at;
        self.updated_at = now;
        Ok(())
    }

    /// Recovery-only edge: forces an orphaned job to `FAILED`.
    pub fn fail_orphan(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalTransition> {
        if !self.status.holds_orchestrator() {
            return Err(IllegalTransition {
                from: self.status,
                to: JobStatus::Failed,
            });
        }
        self.status = JobStatus::Failed;
        self.orchestrator_id = None;
        self.last_error = Some(reason.into());
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Verifies the orchestrator-attribution invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        let holds = self.status.holds_orchestrator();
        match (holds, self.orchestrator_id.is_some()) {
            (true, false) => Err(format!(
                "job {} is {} without an orchestrator",
                self.id, self.status
            )),
            (false, true) => Err(format!(
                "job {} is {} but still attributed to an orchestrator",
                self.id, self.status
            )),
            _ => Ok(()),
        }
    }
}

/// Filter for listing jobs. Unset fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub user_id: Option<UserId>,
    pub status: Option<JobStatus>,
    pub event_id: Option<EventId>,
}

impl JobFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_event(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.user_id.is_none_or(|user| job.user_id == user)
            && self.status.is_none_or(|status| job.status == status)
            && self.event_id.is_none_or(|event| job.event_id == event)
    }
}

/// One page of a job listing plus the total number of matching jobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

/// Per-status job counts for one user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
}

impl JobStats {
    pub fn from_counts(counts: impl IntoIterator<Item = (JobStatus, u64)>) -> Self {
        let mut stats = JobStats::default();
        for status in JobStatus::ALL {
            stats.counts.insert(status.as_str().to_string(), 0);
        }
        for (status, count) in counts {
            *stats.counts.entry(status.as_str().to_string()).or_insert(0) += count;
            stats.total += count;
        }
        stats
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        self.counts.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_job() -> Job {
        Job::queued(
            NewJob {
                event_id: EventId::new(),
                user_id: UserId::new(),
                job_type: JobType::Script,
                payload: JobPayload {
                    script: Some(ScriptSpec {
                        kind: ScriptKind::Bash,
                        content: "echo hi".into(),
                        working_directory: None,
                    }),
                    ..Default::default()
                },
                metadata: Default::default(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_status_round_trips_through_wire_form() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_forward_transitions() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Claimed));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Claimed.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_lifecycle_keeps_orchestrator_invariant() {
        let mut job = script_job();
        let now = Utc::now();
        job.check_invariants().unwrap();

        job.mark_claimed("orch-a".into(), now).unwrap();
        job.check_invariants().unwrap();
        assert!(job.is_held_by(&"orch-a".into()));

        job.mark_running(now).unwrap();
        assert_eq!(job.attempts, 1);
        job.check_invariants().unwrap();

        job.mark_completed(now).unwrap();
        job.check_invariants().unwrap();
        assert!(job.orchestrator_id.is_none());

        let err = job.mark_cancelled(now).unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
    }

    #[test]
    fn test_requeue_orphan_only_from_held_states() {
        let mut job = script_job();
        let now = Utc::now();
        assert!(job.requeue_orphan(now, "x", now).is_err());

        job.mark_claimed("orch-a".into(), now).unwrap();
        job.requeue_orphan(now, "orchestrator lost", now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        job.check_invariants().unwrap();
    }

    #[test]
    fn test_payload_validation() {
        let payload = JobPayload::default();
        assert!(payload.validate(JobType::Script).is_err());
        assert!(payload.validate(JobType::HttpRequest).is_err());

        let http = JobPayload {
            http: Some(HttpSpec {
                method: "POST".into(),
                url: "https://example.com/hook".into(),
                headers: BTreeMap::new(),
                body: None,
            }),
            ..Default::default()
        };
        assert!(http.validate(JobType::HttpRequest).is_ok());

        let zero_attempts = JobPayload {
            retry: RetryPolicy { max_attempts: 0 },
            ..http
        };
        assert!(zero_attempts.validate(JobType::HttpRequest).is_err());

        let at_ceiling = JobPayload {
            timeout_secs: Some(MAX_JOB_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            ..zero_attempts
        };
        assert!(at_ceiling.validate(JobType::HttpRequest).is_ok());

        let too_long = JobPayload {
            timeout_secs: Some(10_000_000_000_000_000),
            ..at_ceiling
        };
        let err = too_long.validate(JobType::HttpRequest).unwrap_err();
        assert!(err.contains("timeout_secs"));
    }

    #[test]
    fn test_out_of_range_timeout_is_never_overdue() {
        let mut job = script_job();
        job.payload.timeout_secs = Some(u64::MAX);
        let start = Utc::now();
        job.mark_claimed("orch-a".into(), start).unwrap();
        job.mark_running(start).unwrap();

        assert!(!job.is_overdue(start + chrono::Duration::days(365 * 100)));
    }

    #[test]
    fn test_stats_report_every_status() {
        let stats = JobStats::from_counts([(JobStatus::Queued, 2), (JobStatus::Failed, 1)]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(JobStatus::Queued), 2);
        assert_eq!(stats.count(JobStatus::Running), 0);
        assert_eq!(stats.counts.len(), 6);
    }
}

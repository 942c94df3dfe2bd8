use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{EventId, JobId, JobStatus, JobType, OrchestratorId, UserId};

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_uuid: Uuid,
    /// `<job id>:<transition>`; stable across redeliveries of the same change.
    pub idempotency_key: String,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(user_id: UserId, idempotency_key: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            event_uuid: Uuid::now_v7(),
            idempotency_key: idempotency_key.into(),
            user_id,
            timestamp,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        self.payload.job_id()
    }
}

/// Lifecycle transitions observable on the bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    Created {
        job_id: JobId,
        event_id: EventId,
        job_type: JobType,
    },
    Claimed {
        job_id: JobId,
        orchestrator_id: OrchestratorId,
    },
    Started {
        job_id: JobId,
        orchestrator_id: OrchestratorId,
        attempt: u32,
    },
    Completed {
        job_id: JobId,
    },
    Failed {
        job_id: JobId,
        error: String,
        /// Set when the failure was forced by orphan recovery.
        recovered: bool,
    },
    Cancelled {
        job_id: JobId,
        /// State the job was in when it was cancelled.
        from: JobStatus,
    },
    Requeued {
        job_id: JobId,
        previous_orchestrator: OrchestratorId,
        available_at: DateTime<Utc>,
    },
}

impl JobEventPayload {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEventPayload::Created { job_id, .. }
            | JobEventPayload::Claimed { job_id, .. }
            | JobEventPayload::Started { job_id, .. }
            | JobEventPayload::Completed { job_id }
            | JobEventPayload::Failed { job_id, .. }
            | JobEventPayload::Cancelled { job_id, .. }
            | JobEventPayload::Requeued { job_id, .. } => *job_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobEventPayload::Created { .. } => "created",
            JobEventPayload::Claimed { .. } => "claimed",
            JobEventPayload::Started { .. } => "started",
            JobEventPayload::Completed { .. } => "completed",
            JobEventPayload::Failed { .. } => "failed",
            JobEventPayload::Cancelled { .. } => "cancelled",
            JobEventPayload::Requeued { .. } => "requeued",
        }
    }
}

/// In-process broadcast of job lifecycle events.
///
/// Publishing never blocks. Events published with no subscribers are
/// dropped, and a subscriber that falls more than `capacity` events behind
/// receives `RecvError::Lagged`.
#[derive(Clone)]
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl fmt::Debug for JobEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl JobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, user_id: UserId, payload: JobEventPayload, at: DateTime<Utc>) {
        let key = format!("{}:{}", payload.job_id(), payload.label());
        let event = JobEvent {
            meta: EventMeta::new(user_id, key, at),
            payload,
        };
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

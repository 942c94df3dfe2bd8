use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::JobStatus;
use crate::quota::Resource;

pub type JobGateResult<T> = Result<T, JobGateError>;

/// Error taxonomy surfaced by every public operation.
#[derive(Debug, Error)]
pub enum JobGateError {
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("cannot {action} a job in state {from}")]
    InvalidStateTransition { from: JobStatus, action: &'static str },

    #[error("quota exceeded for {resource}: {used}/{limit} used, {requested} requested")]
    QuotaExceeded {
        resource: Resource,
        limit: u64,
        used: u64,
        requested: u64,
    },

    #[error("rate limit exceeded, retry after {retry_after}")]
    RateLimited { retry_after: DateTime<Utc> },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal failure: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification used for logging, metrics and HTTP mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidStateTransition,
    QuotaExceeded,
    RateLimited,
    Validation,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Validation => "validation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobGateError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    pub fn invalid_transition(from: JobStatus, action: &'static str) -> Self {
        Self::InvalidStateTransition { from, action }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            JobGateError::NotFound { .. } => ErrorKind::NotFound,
            JobGateError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            JobGateError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            JobGateError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            JobGateError::RateLimited { .. } => ErrorKind::RateLimited,
            JobGateError::Validation(_) => ErrorKind::Validation,
            JobGateError::Unauthorized => ErrorKind::Unauthorized,
            JobGateError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand to callers; internal causes are not echoed.
    pub fn public_message(&self) -> String {
        match self {
            JobGateError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

//! Internal HTTP surface used by orchestrators.
//!
//! Every route requires `Authorization: Bearer <token>` matching
//! [`InternalApiConfig::token`](crate::config::InternalApiConfig).

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::claim::MAX_ORPHAN_BATCH;
use crate::error::{ErrorKind, JobGateError, JobGateResult};
use crate::job::{Job, OrchestratorId};
use crate::service::JobService;

pub const ORPHANED_JOBS_PATH: &str = "/internal/jobs/orphaned";

#[derive(Clone)]
struct InternalApiState {
    service: Arc<JobService>,
    token: Option<Arc<str>>,
}

/// Builds the internal router. With `token` unset every request is refused.
pub fn router(service: Arc<JobService>, token: Option<String>) -> Router {
    let state = InternalApiState {
        service,
        token: token.filter(|t| !t.is_empty()).map(Arc::from),
    };

    let router = Router::new().route(ORPHANED_JOBS_PATH, get(orphaned_jobs));
    #[cfg(feature = "metrics")]
    let router = router.route("/internal/metrics", get(metrics));
    router.with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrphanedJobsQuery {
    orchestrator_id: Option<String>,
    /// Kept as text so a malformed value is reported after authorization.
    limit: Option<String>,
}

async fn orphaned_jobs(
    State(state): State<InternalApiState>,
    headers: HeaderMap,
    Query(query): Query<OrphanedJobsQuery>,
) -> JobGateResult<Json<Vec<Job>>> {
    authorize(&state, &headers)?;

    let orchestrator_id = query
        .orchestrator_id
        .filter(|id| !id.trim().is_empty())
        .map(OrchestratorId::new)
        .ok_or_else(|| JobGateError::validation("orchestratorId query parameter is required"))?;
    let limit = match query.limit.as_deref() {
        None => MAX_ORPHAN_BATCH,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| JobGateError::validation("limit must be a positive integer"))?,
    };

    let jobs = state.service.orphaned_jobs(&orchestrator_id, limit).await?;
    debug!(%orchestrator_id, count = jobs.len(), "served orphaned jobs");
    Ok(Json(jobs))
}

#[cfg(feature = "metrics")]
async fn metrics(State(state): State<InternalApiState>, headers: HeaderMap) -> JobGateResult<String> {
    authorize(&state, &headers)?;
    Ok(crate::metrics::gather_metrics()?)
}

fn authorize(state: &InternalApiState, headers: &HeaderMap) -> JobGateResult<()> {
    let Some(expected) = state.token.as_deref() else {
        warn!("internal request refused, no token configured");
        return Err(JobGateError::Unauthorized);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(JobGateError::Unauthorized)?;

    if constant_time_eq::constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(JobGateError::Unauthorized)
    }
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::InvalidStateTransition => StatusCode::CONFLICT,
            ErrorKind::QuotaExceeded | ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for JobGateError {
    fn into_response(self) -> Response {
        let status = self.kind().status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "internal api request failed");
        }
        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "status": status.as_u16(),
            }
        }));

        let mut response = (status, body).into_response();
        if let JobGateError::RateLimited { retry_after } = &self {
            let secs = (*retry_after - chrono::Utc::now()).num_seconds().max(1);
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            JobGateError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            JobGateError::not_found("job", "x").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            JobGateError::invalid_transition(crate::job::JobStatus::Completed, "cancel")
                .into_response()
                .status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let err = JobGateError::RateLimited {
            retry_after: chrono::Utc::now() + chrono::Duration::seconds(30),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}

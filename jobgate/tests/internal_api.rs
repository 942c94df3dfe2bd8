#![cfg(feature = "http")]
//! The orchestrator-facing orphan listing over HTTP.

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use jobgate::internal_api::{ORPHANED_JOBS_PATH, router};
use jobgate::{OrchestratorId, UserId};
use jobgate_testkit::{TestHarness, script_job};
use serde_json::Value;
use tower::ServiceExt;

const TOKEN: &str = "internal-test-token-0123456789";

fn app(harness: &TestHarness) -> Router {
    router(harness.service.clone(), Some(TOKEN.to_string()))
}

fn request(query: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(format!("{ORPHANED_JOBS_PATH}{query}"));
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_or_wrong_token_is_unauthorized() {
    let harness = TestHarness::new();

    for token in [None, Some("wrong-token-wrong-token"), Some("")] {
        let response = app(&harness)
            .oneshot(request("?orchestratorId=orch-a", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["error"]["status"], 401);
    }

    let basic = Request::builder()
        .uri(format!("{ORPHANED_JOBS_PATH}?orchestratorId=orch-a"))
        .header(header::AUTHORIZATION, format!("Basic {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let response = app(&harness).oneshot(basic).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unconfigured_token_refuses_everything() {
    let harness = TestHarness::new();
    let response = router(harness.service.clone(), None)
        .oneshot(request("?orchestratorId=orch-a", Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authorization_is_checked_before_parameters() {
    let harness = TestHarness::new();
    let response = app(&harness)
        .oneshot(request("?limit=abc", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn orchestrator_id_is_required() {
    let harness = TestHarness::new();

    for query in ["", "?orchestratorId=", "?orchestratorId=%20%20"] {
        let response = app(&harness)
            .oneshot(request(query, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {query:?}");
    }

    let response = app(&harness)
        .oneshot(request("?orchestratorId=orch-a&limit=abc", Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lists_only_jobs_held_by_the_orchestrator() {
    let harness = TestHarness::new();
    let owner = UserId::new();
    let a = OrchestratorId::new("orch-a");
    let b = OrchestratorId::new("orch-b");

    let mut held_by_a = Vec::new();
    for _ in 0..3 {
        let job = harness.service.create_job(script_job(owner)).await.unwrap();
        harness.service.claim_job(job.id, &a).await.unwrap();
        held_by_a.push(job.id);
    }
    harness.service.start_job(held_by_a[0], &a).await.unwrap();
    let other = harness.service.create_job(script_job(owner)).await.unwrap();
    harness.service.claim_job(other.id, &b).await.unwrap();
    harness.service.create_job(script_job(owner)).await.unwrap();

    let response = app(&harness)
        .oneshot(request("?orchestratorId=orch-a", Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 3);
    for job in jobs {
        assert_eq!(job["orchestratorId"], "orch-a");
        let id = job["id"].as_str().unwrap();
        assert!(held_by_a.iter().any(|held| held.to_string() == id));
    }

    let response = app(&harness)
        .oneshot(request("?orchestratorId=orch-a&limit=2", Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 2);

    let response = app(&harness)
        .oneshot(request("?orchestratorId=orch-unknown", Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json_body(response).await.as_array().unwrap().is_empty());
}

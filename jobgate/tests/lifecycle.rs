//! Job lifecycle tests against the in-memory backend.
//!
//! Covers claim exclusivity, cancellation rules, listing, stats and the
//! orphan query.

use std::sync::Arc;

use futures::future::join_all;
use jobgate::{
    Caller, JobFilter, JobGateError, JobStatus, LogStatus, MAX_ORPHAN_BATCH, OrchestratorId,
    ServiceConfig, UserId,
};
use jobgate_testkit::{JobFixture, TestHarness, script_job};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let harness = TestHarness::new();
    let job = harness
        .service
        .create_job(script_job(UserId::new()))
        .await
        .unwrap();

    let attempts = (0..16).map(|i| {
        let service = Arc::clone(&harness.service);
        let orchestrator = OrchestratorId::new(format!("orch-{i}"));
        tokio::spawn(async move { service.claim_job(job.id, &orchestrator).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(
                err,
                JobGateError::InvalidStateTransition {
                    from: JobStatus::Claimed,
                    ..
                }
            ));
        }
    }

    let stored = harness.store.snapshot().pop().unwrap();
    assert_eq!(stored.status, JobStatus::Claimed);
    assert_eq!(stored.orchestrator_id, winners[0].orchestrator_id);
}

#[tokio::test]
async fn second_orchestrator_cannot_claim_or_drive_a_claimed_job() {
    let harness = TestHarness::new();
    let a = OrchestratorId::new("orch-a");
    let b = OrchestratorId::new("orch-b");
    let job = harness
        .service
        .create_job(script_job(UserId::new()))
        .await
        .unwrap();

    harness.service.claim_job(job.id, &a).await.unwrap();

    let err = harness.service.claim_job(job.id, &b).await.unwrap_err();
    assert!(matches!(err, JobGateError::InvalidStateTransition { .. }));

    let err = harness.service.start_job(job.id, &b).await.unwrap_err();
    assert!(matches!(err, JobGateError::PermissionDenied(_)));

    let started = harness.service.start_job(job.id, &a).await.unwrap();
    assert_eq!(started.status, JobStatus::Running);
    assert_eq!(started.attempts, 1);

    let err = harness
        .service
        .complete_job(job.id, &b, None)
        .await
        .unwrap_err();
    assert!(matches!(err, JobGateError::PermissionDenied(_)));

    let completed = harness
        .service
        .complete_job(job.id, &a, Some(serde_json::json!({"exit_code": 0})))
        .await
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.orchestrator_id, None);
    assert!(completed.completed_at.is_some());
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let harness = TestHarness::new();
    let owner = UserId::new();
    let caller = Caller::user(owner);
    let job = harness.service.create_job(script_job(owner)).await.unwrap();

    let first = harness.service.cancel_job(&caller, job.id).await.unwrap();
    let second = harness.service.cancel_job(&caller, job.id).await.unwrap();

    assert_eq!(first.status, JobStatus::Cancelled);
    assert_eq!(second.status, JobStatus::Cancelled);
    assert_eq!(first.updated_at, second.updated_at);
}

#[tokio::test]
async fn cancelling_a_finished_job_is_rejected() {
    let harness = TestHarness::new();
    let owner = UserId::new();
    let orchestrator = OrchestratorId::new("orch-a");
    let job = harness.service.create_job(script_job(owner)).await.unwrap();

    harness.service.claim_job(job.id, &orchestrator).await.unwrap();
    harness.service.start_job(job.id, &orchestrator).await.unwrap();
    harness
        .service
        .fail_job(job.id, &orchestrator, "exit code 1")
        .await
        .unwrap();

    let err = harness
        .service
        .cancel_job(&Caller::user(owner), job.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JobGateError::InvalidStateTransition {
            from: JobStatus::Failed,
            action: "cancel"
        }
    ));
}

#[tokio::test]
async fn cancel_while_queued_blocks_later_claims() {
    let harness = TestHarness::new();
    let owner = UserId::new();
    let job = harness.service.create_job(script_job(owner)).await.unwrap();

    harness
        .service
        .cancel_job(&Caller::user(owner), job.id)
        .await
        .unwrap();

    let err = harness
        .service
        .claim_job(job.id, &OrchestratorId::new("orch-a"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JobGateError::InvalidStateTransition {
            from: JobStatus::Cancelled,
            ..
        }
    ));
    assert!(
        harness
            .service
            .claim_next(&OrchestratorId::new("orch-a"))
            .await
            .unwrap()
            .is_none()
    );

    let logs = harness
        .service
        .job_logs(&Caller::user(owner), job.id)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Cancelled);
}

#[tokio::test]
async fn only_owner_or_admin_may_cancel() {
    let harness = TestHarness::new();
    let owner = UserId::new();
    let job = harness.service.create_job(script_job(owner)).await.unwrap();

    let err = harness
        .service
        .cancel_job(&Caller::user(UserId::new()), job.id)
        .await
        .unwrap_err();
    assert!(matches!(err, JobGateError::PermissionDenied(_)));

    let cancelled = harness
        .service
        .cancel_job(&Caller::admin(UserId::new()), job.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn listing_filters_pages_and_counts() {
    let harness = TestHarness::new();
    let owner = UserId::new();
    let other = UserId::new();
    let orchestrator = OrchestratorId::new("orch-a");

    let mut created = Vec::new();
    for _ in 0..7 {
        created.push(harness.service.create_job(script_job(owner)).await.unwrap());
        harness.clock.advance(chrono::Duration::seconds(1));
    }
    harness.service.create_job(script_job(other)).await.unwrap();
    for job in &created[..3] {
        harness.service.claim_job(job.id, &orchestrator).await.unwrap();
    }

    let page = harness
        .service
        .list_jobs(JobFilter::for_user(owner), 5, 0)
        .await
        .unwrap();
    assert_eq!(page.total, 7);
    assert_eq!(page.jobs.len(), 5);
    assert_eq!(page.jobs[0].id, created[6].id);

    let tail = harness
        .service
        .list_jobs(JobFilter::for_user(owner), 5, 5)
        .await
        .unwrap();
    assert_eq!(tail.total, 7);
    assert_eq!(tail.jobs.len(), 2);

    let past_end = harness
        .service
        .list_jobs(JobFilter::for_user(owner), 5, 50)
        .await
        .unwrap();
    assert_eq!(past_end.total, 7);
    assert!(past_end.jobs.is_empty());

    let claimed = harness
        .service
        .list_jobs(
            JobFilter::for_user(owner).with_status(JobStatus::Claimed),
            100,
            0,
        )
        .await
        .unwrap();
    assert_eq!(claimed.total, 3);
    assert!(claimed.jobs.iter().all(|j| j.status == JobStatus::Claimed));

    let clamped = harness
        .service
        .list_jobs(JobFilter::default(), 10_000, 0)
        .await
        .unwrap();
    assert_eq!(clamped.limit, 100);
    assert_eq!(clamped.total, 8);
}

#[tokio::test]
async fn stats_count_every_status() {
    let harness = TestHarness::new();
    let owner = UserId::new();
    let orchestrator = OrchestratorId::new("orch-a");

    let a = harness.service.create_job(script_job(owner)).await.unwrap();
    let b = harness.service.create_job(script_job(owner)).await.unwrap();
    harness.service.create_job(script_job(owner)).await.unwrap();

    harness.service.claim_job(a.id, &orchestrator).await.unwrap();
    harness.service.start_job(a.id, &orchestrator).await.unwrap();
    harness
        .service
        .cancel_job(&Caller::user(owner), b.id)
        .await
        .unwrap();

    let stats = harness.service.get_job_stats(owner).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.count(JobStatus::Queued), 1);
    assert_eq!(stats.count(JobStatus::Running), 1);
    assert_eq!(stats.count(JobStatus::Cancelled), 1);
    assert_eq!(stats.count(JobStatus::Completed), 0);
}

#[tokio::test]
async fn orphan_query_is_scoped_and_capped() {
    let harness = TestHarness::new();
    let owner = UserId::new();
    let a = OrchestratorId::new("orch-a");
    let b = OrchestratorId::new("orch-b");

    for _ in 0..(MAX_ORPHAN_BATCH + 5) {
        let job = harness.service.create_job(script_job(owner)).await.unwrap();
        harness.service.claim_job(job.id, &a).await.unwrap();
    }
    let finished = harness.service.create_job(script_job(owner)).await.unwrap();
    harness.service.claim_job(finished.id, &a).await.unwrap();
    harness.service.start_job(finished.id, &a).await.unwrap();
    harness.service.complete_job(finished.id, &a, None).await.unwrap();

    let foreign = harness.service.create_job(script_job(owner)).await.unwrap();
    harness.service.claim_job(foreign.id, &b).await.unwrap();

    let orphans = harness.service.orphaned_jobs(&a, 1_000).await.unwrap();
    assert_eq!(orphans.len(), MAX_ORPHAN_BATCH);
    assert!(orphans.iter().all(|job| job.is_held_by(&a)));
    assert!(orphans.iter().all(|job| job.status.holds_orchestrator()));

    let for_b = harness.service.orphaned_jobs(&b, 10).await.unwrap();
    assert_eq!(for_b.len(), 1);
    assert_eq!(for_b[0].id, foreign.id);
}

#[tokio::test]
async fn job_fixtures_validate_for_every_type() {
    let harness = TestHarness::new();
    let owner = UserId::new();

    for request in [
        JobFixture::script(owner).build(),
        JobFixture::http(owner, "https://example.com/hook").build(),
        JobFixture::tool(owner, "slack", "send_message").build(),
    ] {
        let job = harness.service.create_job(request).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_read_racing_a_transition_is_not_cached() {
    let (harness, store) = TestHarness::with_faulty_store(ServiceConfig {
        stats_ttl_secs: 3600,
        ..Default::default()
    });
    let owner = UserId::new();
    let job = harness.service.create_job(script_job(owner)).await.unwrap();

    store.hold_status_counts();
    let reader = {
        let service = Arc::clone(&harness.service);
        tokio::spawn(async move { service.get_job_stats(owner).await.unwrap() })
    };
    store.counts_taken().await;
    harness
        .service
        .cancel_job(&Caller::user(owner), job.id)
        .await
        .unwrap();
    store.release_status_counts();

    let before_cancel = reader.await.unwrap();
    assert_eq!(before_cancel.count(JobStatus::Queued), 1);

    let after_cancel = harness.service.get_job_stats(owner).await.unwrap();
    assert_eq!(after_cancel.count(JobStatus::Queued), 0);
    assert_eq!(after_cancel.count(JobStatus::Cancelled), 1);
}

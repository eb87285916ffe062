//! End-to-end reconciler ticks against a temp factory root.
//!
//! Every test drives `Reconciler::tick` with in-process fakes for the Worker
//! and QC tool, then checks the resulting state, decision and on-disk logs.
//!
//! Run:
//!   cargo test -p control-plane --test reconciler_test -- --nocapture

mod common;

use serde_json::json;
use std::time::Duration;

use common::{
    write_report, write_valid_outputs, FakeQcTool, FakeWorker, Harness, QcMode, WorkerMode,
};
use control_plane::reconciler::{ReconcileError, TickOptions, TickOutcome};
use shared_types::{
    FailureClass, GateStatus, JobEventKind, JobStatus, RoutingAction,
    REASON_ALL_REQUIRED_GATES_PASSED, REASON_POLICY_OR_REPORT_UNREADABLE,
    REASON_RETRY_BUDGET_EXHAUSTED, REASON_WORKER_INVOCATION_FAILED,
};

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fresh_job_renders_and_completes() {
    let h = Harness::new();
    let contract = h.simple_contract("job-7");
    let worker = FakeWorker::new(WorkerMode::WriteValidOutputs);
    let qc = FakeQcTool::always(QcMode::Report(GateStatus::Pass));
    let reconciler = h.reconciler(worker.clone(), Some(qc.clone()));

    let report = reconciler
        .tick(&contract, TickOptions::default())
        .await
        .expect("tick");

    assert_eq!(report.outcome, TickOutcome::Advanced);
    assert_eq!(report.status(), Some(JobStatus::Completed));
    assert!(report.worker_invoked);
    assert_eq!(worker.calls(), 1);
    assert_eq!(qc.calls(), 1);

    let decision = report.decision.expect("decision");
    assert_eq!(decision.action, RoutingAction::Finalize);
    assert_eq!(decision.reason, REASON_ALL_REQUIRED_GATES_PASSED);

    let artifacts = h.artifacts("job-7");
    assert!(artifacts.decision_path().exists());
    assert!(artifacts.lineage_path().exists());
    assert!(!artifacts.lock_dir.exists(), "lock must be released");

    let statuses: Vec<JobStatus> = h
        .events("job-7")
        .await
        .into_iter()
        .filter_map(|e| match e.event {
            JobEventKind::Transition { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Locked,
            JobStatus::FastPathCheck,
            JobStatus::Rendering,
            JobStatus::Verifying,
            JobStatus::QcEvaluating,
            JobStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn test_valid_existing_outputs_skip_worker() {
    let h = Harness::new();
    let contract = h.simple_contract("job-8");
    let artifacts = h.artifacts("job-8");
    write_valid_outputs(&artifacts.output_dir, "job-8");
    write_report(&artifacts.qc_report_path(), "job-8", GateStatus::Pass, None);

    let worker = FakeWorker::new(WorkerMode::WriteValidOutputs);
    let report = h
        .reconciler(worker.clone(), None)
        .tick(&contract, TickOptions::default())
        .await
        .expect("tick");

    assert_eq!(report.status(), Some(JobStatus::Completed));
    assert!(!report.worker_invoked);
    assert_eq!(worker.calls(), 0);
}

#[tokio::test]
async fn test_transient_failures_retry_then_escalate() {
    let h = Harness::new();
    let contract = h.simple_contract("job-9");
    let worker = FakeWorker::new(WorkerMode::WriteValidOutputs);
    let qc = FakeQcTool::always(QcMode::Report(GateStatus::Fail));
    let reconciler = h.reconciler(worker.clone(), Some(qc));

    let first = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    let d1 = first.decision.clone().unwrap();
    assert_eq!(first.status(), Some(JobStatus::RetryScheduled));
    assert_eq!(d1.action, RoutingAction::Retry);
    assert_eq!(d1.failure_class, Some(FailureClass::Transient));
    assert_eq!(d1.budget.attempts_consumed, 0);
    assert_eq!(d1.budget.max_retries, 2);

    let second = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(second.status(), Some(JobStatus::RetryScheduled));
    assert_eq!(second.decision.unwrap().action, RoutingAction::Retry);

    let third = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    let d3 = third.decision.clone().unwrap();
    assert_eq!(third.status(), Some(JobStatus::Escalated));
    assert_eq!(d3.action, RoutingAction::Escalate);
    assert_eq!(d3.reason, REASON_RETRY_BUDGET_EXHAUSTED);

    let state = third.state.unwrap();
    assert_eq!(state.retries_consumed, 2);
    assert_eq!(state.worker_attempts, 3);
    assert!(state.last_error.is_some());
    assert_eq!(worker.calls(), 3);

    // Terminal: further ticks are no-ops.
    let events_before = std::fs::read(h.artifacts("job-9").events_path()).unwrap();
    let fourth = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(fourth.outcome, TickOutcome::Unchanged);
    assert_eq!(worker.calls(), 3);
    let events_after = std::fs::read(h.artifacts("job-9").events_path()).unwrap();
    assert_eq!(events_before, events_after);

    let decisions = std::fs::read_to_string(h.artifacts("job-9").decisions_log_path()).unwrap();
    assert_eq!(decisions.lines().count(), 3);
}

#[tokio::test]
async fn test_cli_budget_override_wins() {
    let h = Harness::new();
    let contract = h.write_contract(
        "job-10",
        json!({"schema_version": 1, "recipe": "slideshow", "max_retries": 5}),
    );
    let reconciler = h.reconciler(
        FakeWorker::new(WorkerMode::WriteValidOutputs),
        Some(FakeQcTool::always(QcMode::Report(GateStatus::Fail))),
    );

    let report = reconciler
        .tick(&contract, TickOptions { max_retries: Some(0) })
        .await
        .unwrap();
    assert_eq!(report.status(), Some(JobStatus::Escalated));
    assert_eq!(report.decision.unwrap().reason, REASON_RETRY_BUDGET_EXHAUSTED);
}

#[tokio::test]
async fn test_quality_degradation_moves_to_fallback_recipe() {
    let h = Harness::with_gate_class("quality-degradation");
    let contract = h.write_contract(
        "job-11",
        json!({
            "schema_version": 1,
            "recipe": "slideshow",
            "fallback_recipes": ["static-card"]
        }),
    );
    let worker = FakeWorker::new(WorkerMode::WriteValidOutputs);
    let qc = FakeQcTool::scripted(
        vec![QcMode::Report(GateStatus::Fail)],
        QcMode::Report(GateStatus::Pass),
    );
    let reconciler = h.reconciler(worker.clone(), Some(qc));

    let first = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(first.status(), Some(JobStatus::FallbackScheduled));
    assert_eq!(first.decision.unwrap().action, RoutingAction::RetryWithFallback);
    assert_eq!(first.state.unwrap().recipe_index, 1);

    // The fast path re-measures the old artifacts first; they pass now, so
    // the job completes without another render.
    let second = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(second.status(), Some(JobStatus::Completed));
    assert_eq!(worker.recipes(), vec!["slideshow".to_string()]);
}

#[tokio::test]
async fn test_fallback_recipe_is_used_for_next_render() {
    let h = Harness::with_gate_class("quality-degradation");
    let contract = h.write_contract(
        "job-12",
        json!({
            "schema_version": 1,
            "recipe": "slideshow",
            "fallback_recipes": ["static-card"]
        }),
    );
    let worker = FakeWorker::new(WorkerMode::WriteValidOutputs);
    // fail: tick 1 render, tick 2 fast path; pass: tick 2 after render
    let qc = FakeQcTool::scripted(
        vec![QcMode::Report(GateStatus::Fail), QcMode::Report(GateStatus::Fail)],
        QcMode::Report(GateStatus::Pass),
    );
    let reconciler = h.reconciler(worker.clone(), Some(qc));

    reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    let second = reconciler.tick(&contract, TickOptions::default()).await.unwrap();

    assert_eq!(second.status(), Some(JobStatus::Completed));
    assert_eq!(
        worker.recipes(),
        vec!["slideshow".to_string(), "static-card".to_string()]
    );
}

// ─── Fail-closed ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_report_escalates() {
    let h = Harness::new();
    let contract = h.simple_contract("job-13");
    let report = h
        .reconciler(FakeWorker::new(WorkerMode::WriteValidOutputs), None)
        .tick(&contract, TickOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status(), Some(JobStatus::Escalated));
    let decision = report.decision.unwrap();
    assert_eq!(decision.action, RoutingAction::Escalate);
    assert_eq!(decision.reason, REASON_POLICY_OR_REPORT_UNREADABLE);
}

#[tokio::test]
async fn test_corrupt_report_escalates() {
    let h = Harness::new();
    let contract = h.simple_contract("job-14");
    let report = h
        .reconciler(
            FakeWorker::new(WorkerMode::WriteValidOutputs),
            Some(FakeQcTool::always(QcMode::Garbage)),
        )
        .tick(&contract, TickOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status(), Some(JobStatus::Escalated));
    assert_eq!(
        report.decision.unwrap().reason,
        REASON_POLICY_OR_REPORT_UNREADABLE
    );
}

#[tokio::test]
async fn test_crashed_qc_tool_does_not_reuse_old_report() {
    let h = Harness::new();
    let contract = h.simple_contract("job-15");
    // A passing report from some earlier run is lying around.
    write_report(
        &h.artifacts("job-15").qc_report_path(),
        "job-15",
        GateStatus::Pass,
        None,
    );
    let report = h
        .reconciler(
            FakeWorker::new(WorkerMode::WriteValidOutputs),
            Some(FakeQcTool::always(QcMode::Crash)),
        )
        .tick(&contract, TickOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status(), Some(JobStatus::Escalated));
    assert_eq!(
        report.decision.unwrap().reason,
        REASON_POLICY_OR_REPORT_UNREADABLE
    );
}

#[tokio::test]
async fn test_missing_policy_escalates() {
    let h = Harness::new();
    std::fs::remove_file(&h.policy_path).unwrap();
    let contract = h.simple_contract("job-16");
    let report = h
        .reconciler(
            FakeWorker::new(WorkerMode::WriteValidOutputs),
            Some(FakeQcTool::always(QcMode::Report(GateStatus::Pass))),
        )
        .tick(&contract, TickOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status(), Some(JobStatus::Escalated));
}

#[tokio::test]
async fn test_lineage_failure_blocks_finalize() {
    let h = Harness::new();
    let contract = h.simple_contract("job-17");
    // Worker "succeeds" but writes nothing; the QC tool still says pass.
    let report = h
        .reconciler(
            FakeWorker::new(WorkerMode::WriteNothing),
            Some(FakeQcTool::always(QcMode::Report(GateStatus::Pass))),
        )
        .tick(&contract, TickOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status(), Some(JobStatus::RetryScheduled));
    let decision = report.decision.unwrap();
    assert_eq!(decision.failing_gate.as_deref(), Some("lineage"));
}

// ─── Worker failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_worker_timeout_is_retried() {
    let h = Harness::new();
    let contract = h.simple_contract("job-18");
    let mut settings = h.settings();
    settings.worker_timeout = Duration::from_millis(50);
    let reconciler = h.reconciler_with(FakeWorker::new(WorkerMode::Hang), None, settings);

    let report = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(report.status(), Some(JobStatus::RetryScheduled));
    let decision = report.decision.unwrap();
    assert_eq!(decision.reason, REASON_WORKER_INVOCATION_FAILED);
    assert_eq!(decision.failure_class, Some(FailureClass::Transient));

    let timed_out = h.events("job-18").await.into_iter().any(|e| {
        matches!(
            e.event,
            JobEventKind::WorkerFinished {
                timed_out: true,
                success: false,
                ..
            }
        )
    });
    assert!(timed_out);
}

#[tokio::test]
async fn test_worker_exit_failures_exhaust_budget() {
    let h = Harness::new();
    let contract = h.simple_contract("job-19");
    let worker = FakeWorker::new(WorkerMode::Exit(3));
    let reconciler = h.reconciler(worker.clone(), None);

    let statuses = [
        reconciler.tick(&contract, TickOptions::default()).await.unwrap().status(),
        reconciler.tick(&contract, TickOptions::default()).await.unwrap().status(),
        reconciler.tick(&contract, TickOptions::default()).await.unwrap().status(),
    ];
    assert_eq!(
        statuses,
        [
            Some(JobStatus::RetryScheduled),
            Some(JobStatus::RetryScheduled),
            Some(JobStatus::Escalated)
        ]
    );
    assert_eq!(worker.calls(), 3);
}

#[tokio::test]
async fn test_unspawnable_worker_fails_job() {
    let h = Harness::new();
    let contract = h.simple_contract("job-20");
    let report = h
        .reconciler(FakeWorker::new(WorkerMode::Unspawnable), None)
        .tick(&contract, TickOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status(), Some(JobStatus::Failed));
    let state = report.state.unwrap();
    assert!(state
        .last_error
        .unwrap_or_default()
        .contains("worker cannot run"));
}

// ─── Contract handling ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_contract_writes_nothing() {
    let h = Harness::new();
    let worker = FakeWorker::new(WorkerMode::WriteValidOutputs);
    let reconciler = h.reconciler(worker.clone(), None);

    for (job_id, body) in [
        ("job-21", json!({"schema_version": 1, "recipe": "slideshow", "priority": 9})),
        ("job-22", json!({"schema_version": 2, "recipe": "slideshow"})),
        ("job-23", json!({"schema_version": 1, "recipe": "  "})),
    ] {
        let contract = h.write_contract(job_id, body);
        let err = reconciler
            .tick(&contract, TickOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ContractInvalid(_)), "{job_id}: {err}");
    }

    assert_eq!(worker.calls(), 0);
    assert!(!h.roots.log_root.exists());
    assert!(!h.roots.lock_root.exists());
}

#[tokio::test]
async fn test_identity_mismatch_is_recorded_and_filename_wins() {
    let h = Harness::new();
    let contract = h.write_contract(
        "job-24",
        json!({"schema_version": 1, "job_id": "job-99", "recipe": "slideshow"}),
    );
    let report = h
        .reconciler(
            FakeWorker::new(WorkerMode::WriteValidOutputs),
            Some(FakeQcTool::always(QcMode::Report(GateStatus::Pass))),
        )
        .tick(&contract, TickOptions::default())
        .await
        .unwrap();

    assert_eq!(report.job_id, "job-24");
    assert_eq!(report.status(), Some(JobStatus::Completed));
    let recorded = h.events("job-24").await.into_iter().any(|e| {
        matches!(
            e.event,
            JobEventKind::ContractIdentityMismatch { ref embedded, ref canonical }
                if embedded == "job-99" && canonical == "job-24"
        )
    });
    assert!(recorded);
}

// ─── Idempotency and publish ─────────────────────────────────────────────────

#[tokio::test]
async fn test_completed_job_tick_is_noop_until_published() {
    let h = Harness::new();
    let contract = h.simple_contract("job-25");
    let worker = FakeWorker::new(WorkerMode::WriteValidOutputs);
    let reconciler = h.reconciler(
        worker.clone(),
        Some(FakeQcTool::always(QcMode::Report(GateStatus::Pass))),
    );

    reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    let artifacts = h.artifacts("job-25");
    let events_before = std::fs::read(artifacts.events_path()).unwrap();

    let again = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(again.outcome, TickOutcome::Unchanged);
    assert_eq!(again.status(), Some(JobStatus::Completed));
    assert_eq!(worker.calls(), 1);
    assert_eq!(std::fs::read(artifacts.events_path()).unwrap(), events_before);

    // A confirmation for another job is ignored.
    std::fs::create_dir_all(&h.roots.publish_root).unwrap();
    std::fs::write(
        &artifacts.publish_confirmation,
        serde_json::to_vec(&json!({"job_id": "job-99"})).unwrap(),
    )
    .unwrap();
    let ignored = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(ignored.status(), Some(JobStatus::Completed));

    std::fs::write(
        &artifacts.publish_confirmation,
        serde_json::to_vec(&json!({"job_id": "job-25", "url": "https://cdn.example/job-25"}))
            .unwrap(),
    )
    .unwrap();
    let posted = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(posted.outcome, TickOutcome::Advanced);
    assert_eq!(posted.status(), Some(JobStatus::Posted));

    let after_posted = reconciler.tick(&contract, TickOptions::default()).await.unwrap();
    assert_eq!(after_posted.outcome, TickOutcome::Unchanged);
    assert_eq!(worker.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_ticks_run_worker_once() {
    let h = Harness::new();
    let contract = h.simple_contract("job-26");
    let worker = FakeWorker::slow(WorkerMode::WriteValidOutputs, Duration::from_millis(300));
    let reconciler = h.reconciler(
        worker.clone(),
        Some(FakeQcTool::always(QcMode::Report(GateStatus::Pass))),
    );

    let (a, b) = tokio::join!(
        reconciler.tick(&contract, TickOptions::default()),
        reconciler.tick(&contract, TickOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(
        [a.is_contended(), b.is_contended()]
            .iter()
            .filter(|c| **c)
            .count(),
        1
    );
    let winner = if a.is_contended() { b } else { a };
    assert_eq!(winner.status(), Some(JobStatus::Completed));
    assert_eq!(worker.calls(), 1);
}

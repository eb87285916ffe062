//! Tick phases: fast path, render, verify, decide.

use shared_types::{
    Decision, JobEventKind, JobStatus, LineageRecord, RetryBudget, RoutingAction,
};
use std::time::Instant;

use super::{ReconcileError, Reconciler, TickContext};
use crate::lineage::verify_lineage;
use crate::quality::{decide_from_inputs, decide_worker_failure, load_policy, load_report};
use crate::worker::{QcRequest, RenderRequest, WorkerError};

impl Reconciler {
    /// Returns true when existing artifacts were accepted and the job is
    /// `COMPLETED` without invoking the Worker.
    pub(super) async fn fast_path(&self, ctx: &mut TickContext) -> Result<bool, ReconcileError> {
        self.transition(ctx, JobStatus::FastPathCheck, "checking existing artifacts")
            .await?;

        let lineage = self.check_lineage(ctx).await?;
        if !lineage.passed {
            let summary = lineage.failure_summary().unwrap_or_default();
            self.transition(
                ctx,
                JobStatus::Rendering,
                format!("fast path: lineage incomplete: {summary}"),
            )
            .await?;
            return Ok(false);
        }

        let attempt = ctx.log.state().worker_attempts;
        let expected = (attempt > 0).then_some(attempt);
        let decision = self.evaluate(ctx, attempt, expected, &lineage).await;
        if decision.action == RoutingAction::Finalize {
            self.record_decision(ctx, decision).await?;
            self.transition(
                ctx,
                JobStatus::Completed,
                "fast path: existing artifacts pass lineage and quality gates",
            )
            .await?;
            return Ok(true);
        }

        self.transition(
            ctx,
            JobStatus::Rendering,
            format!("fast path declined: {}", decision.reason),
        )
        .await?;
        Ok(false)
    }

    /// Invoke the Worker once. Returns true when it succeeded and the tick
    /// should go on to verification.
    pub(super) async fn render(&self, ctx: &mut TickContext) -> Result<bool, ReconcileError> {
        let state = ctx.log.state();
        let recipe = ctx.job.contract.recipe_at(state.recipe_index).to_string();
        let attempt = state.worker_attempts + 1;

        ctx.log
            .append(JobEventKind::WorkerInvoked {
                attempt,
                recipe: recipe.clone(),
            })
            .await?;
        ctx.worker_invoked = true;

        let request = RenderRequest {
            job_id: ctx.job.job_id.clone(),
            contract_path: ctx.job.path.clone(),
            output_dir: ctx.artifacts.output_dir.clone(),
            log_dir: ctx.artifacts.log_dir.clone(),
            recipe,
            attempt,
            log_path: ctx.artifacts.worker_log_path(attempt),
        };
        let timeout = self.settings.worker_timeout;
        let started = Instant::now();
        // Expiry only drops the call; stopping the process is the Worker's job.
        let result = match tokio::time::timeout(timeout, self.worker.render(&request)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout { after: timeout }),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let err = match result {
            Ok(outcome) => {
                ctx.log
                    .append(JobEventKind::WorkerFinished {
                        attempt,
                        success: true,
                        exit_code: outcome.exit_code,
                        timed_out: false,
                        duration_ms,
                        detail: None,
                    })
                    .await?;
                self.transition(
                    ctx,
                    JobStatus::Verifying,
                    format!("worker attempt {attempt} finished"),
                )
                .await?;
                return Ok(true);
            }
            Err(err) => err,
        };

        tracing::warn!(
            job_id = %ctx.job.job_id,
            attempt,
            error = %err,
            "Worker invocation failed"
        );
        ctx.log
            .append(JobEventKind::WorkerFinished {
                attempt,
                success: false,
                exit_code: err.exit_code(),
                timed_out: err.is_timeout(),
                duration_ms,
                detail: Some(err.to_string()),
            })
            .await?;

        if err.is_unrecoverable() {
            self.transition(ctx, JobStatus::Failed, format!("worker cannot run: {err}"))
                .await?;
            return Ok(false);
        }

        let decision = decide_worker_failure(self.budget(ctx), &err.to_string());
        self.record_decision(ctx, decision.clone()).await?;
        self.apply_decision(ctx, &decision).await?;
        Ok(false)
    }

    pub(super) async fn verify_and_decide(
        &self,
        ctx: &mut TickContext,
    ) -> Result<(), ReconcileError> {
        let lineage = self.check_lineage(ctx).await?;
        let reason = match lineage.failure_summary() {
            None => "lineage verified".to_string(),
            Some(summary) => format!("lineage failed: {summary}"),
        };
        self.transition(ctx, JobStatus::QcEvaluating, reason).await?;

        let attempt = ctx.log.state().worker_attempts;
        let decision = self.evaluate(ctx, attempt, Some(attempt), &lineage).await;
        self.record_decision(ctx, decision.clone()).await?;
        self.apply_decision(ctx, &decision).await
    }

    fn budget(&self, ctx: &TickContext) -> RetryBudget {
        RetryBudget::new(ctx.max_retries, ctx.log.state().retries_consumed)
    }

    async fn check_lineage(&self, ctx: &mut TickContext) -> Result<LineageRecord, ReconcileError> {
        let record = verify_lineage(&ctx.job, &ctx.artifacts).await;
        ctx.log.record_lineage(&record).await?;
        ctx.log
            .append(JobEventKind::LineageVerified {
                passed: record.passed,
                failed_checks: record
                    .failed_required()
                    .map(|check| check.name.clone())
                    .collect(),
            })
            .await?;
        Ok(record)
    }

    /// Run the QC tool (if any), load policy and report, and decide. Never
    /// fails: unreadable inputs become a fail-closed decision.
    async fn evaluate(
        &self,
        ctx: &TickContext,
        attempt: u32,
        expected_attempt: Option<u32>,
        lineage: &LineageRecord,
    ) -> Decision {
        let report_path = ctx.artifacts.qc_report_path();

        if let Some(qc_tool) = &self.qc_tool {
            // A report left from an earlier run must not stand in for this one.
            if let Err(e) = tokio::fs::remove_file(&report_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %report_path.display(),
                        error = %e,
                        "Failed to clear old QC report"
                    );
                }
            }
            let request = QcRequest {
                job_id: ctx.job.job_id.clone(),
                contract_path: ctx.job.path.clone(),
                output_dir: ctx.artifacts.output_dir.clone(),
                log_dir: ctx.artifacts.log_dir.clone(),
                report_path: report_path.clone(),
                attempt,
                log_path: ctx.artifacts.qc_log_path(attempt),
            };
            let timeout = self.settings.qc_timeout;
            match tokio::time::timeout(timeout, qc_tool.evaluate(&request)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(job_id = %ctx.job.job_id, attempt, error = %e, "QC tool failed");
                }
                Err(_) => {
                    tracing::warn!(
                        job_id = %ctx.job.job_id,
                        attempt,
                        timeout_secs = timeout.as_secs(),
                        "QC tool timed out"
                    );
                }
            }
        }

        let policy = load_policy(&self.settings.qc_policy_path).await;
        let report = load_report(&report_path, Some(&ctx.job.job_id), expected_attempt).await;
        for err in [policy.as_ref().err(), report.as_ref().err()]
            .into_iter()
            .flatten()
        {
            tracing::warn!(
                job_id = %ctx.job.job_id,
                error = %err,
                "QC input unavailable; failing closed"
            );
        }
        decide_from_inputs(&policy, &report, Some(lineage), self.budget(ctx))
    }

    async fn record_decision(
        &self,
        ctx: &mut TickContext,
        decision: Decision,
    ) -> Result<(), ReconcileError> {
        ctx.log.record_decision(&decision).await?;
        tracing::info!(
            job_id = %ctx.job.job_id,
            action = decision.action.as_str(),
            reason = %decision.reason,
            failing_gate = decision.failing_gate.as_deref().unwrap_or(""),
            retries_consumed = decision.budget.attempts_consumed,
            max_retries = decision.budget.max_retries,
            "Quality decision"
        );
        ctx.log
            .append(JobEventKind::QualityDecision {
                decision: decision.clone(),
            })
            .await?;
        ctx.decision = Some(decision);
        Ok(())
    }

    async fn apply_decision(
        &self,
        ctx: &mut TickContext,
        decision: &Decision,
    ) -> Result<(), ReconcileError> {
        let reason = transition_reason(decision);
        match decision.action {
            RoutingAction::Finalize => self.transition(ctx, JobStatus::Completed, reason).await,
            RoutingAction::Retry => self.transition(ctx, JobStatus::RetryScheduled, reason).await,
            RoutingAction::Escalate => self.transition(ctx, JobStatus::Escalated, reason).await,
            RoutingAction::RetryWithFallback => {
                let index = ctx.log.state().recipe_index;
                if ctx.job.contract.has_recipe_after(index) {
                    let next = index + 1;
                    let recipe = ctx.job.contract.recipe_at(next).to_string();
                    self.transition(
                        ctx,
                        JobStatus::FallbackScheduled,
                        format!("{reason}; next recipe '{recipe}'"),
                    )
                    .await?;
                    ctx.log
                        .append(JobEventKind::RecipeSelected {
                            index: next,
                            recipe,
                        })
                        .await?;
                    Ok(())
                } else {
                    let recipe = ctx.job.contract.recipe_at(index).to_string();
                    self.transition(
                        ctx,
                        JobStatus::FallbackScheduled,
                        format!("{reason}; no fallback recipe left, re-running '{recipe}'"),
                    )
                    .await
                }
            }
        }
    }
}

fn transition_reason(decision: &Decision) -> String {
    let mut reason = decision.reason.clone();
    if let Some(gate) = &decision.failing_gate {
        reason.push_str(&format!(": gate {gate}"));
    }
    if let Some(class) = decision.failure_class {
        reason.push_str(&format!(" ({})", class.as_str()));
    }
    if decision.action == RoutingAction::Escalate {
        reason.push_str(" | ");
        reason.push_str(&decision.reason_chain.join("; "));
    }
    reason
}

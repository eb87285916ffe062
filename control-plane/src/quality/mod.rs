//! Quality decision engine.
//!
//! `decide` is a pure function of (policy, report, retry budget). It never
//! reads the clock, the filesystem or the environment, and the `Decision` it
//! returns contains no maps, so identical inputs serialize to identical bytes.
//!
//! Evaluation:
//! 1. every policy gate is checked against the report (missing required gate
//!    fails, `unknown` fails, a `pass` that violates its threshold fails)
//! 2. the worst failing required gate is picked (severity, then failure class,
//!    then gate id)
//! 3. its failure class is mapped through the routing table
//! 4. a retry action with no budget left becomes `escalate`
//!
//! Missing inputs fail closed with `policy-or-report-unreadable`.

pub mod inputs;
pub mod routing;

use shared_types::{
    CheckStatus, Decision, FailureClass, GateResult, GateStatus, LineageRecord, QcGate, QcPolicy,
    QcReport, RetryBudget, RoutingAction, Severity, LINEAGE_GATE_ID,
    REASON_ALL_REQUIRED_GATES_PASSED, REASON_GATE_FAILED, REASON_POLICY_OR_REPORT_UNREADABLE,
    REASON_RETRY_BUDGET_EXHAUSTED, REASON_WORKER_INVOCATION_FAILED,
};

pub use inputs::{load_policy, load_report, QualityInputError};
use routing::{route, select_worst, FailingGate};

pub const GATE_MISSING_FROM_REPORT: &str = "gate-missing-from-report";

pub fn decide(
    policy: Option<&QcPolicy>,
    report: Option<&QcReport>,
    budget: RetryBudget,
) -> Decision {
    let (policy, report) = match (policy, report) {
        (Some(policy), Some(report)) => (policy, report),
        (policy, report) => {
            let mut chain = Vec::new();
            if policy.is_none() {
                chain.push("qc policy unavailable".to_string());
            }
            if report.is_none() {
                chain.push("qc report unavailable".to_string());
            }
            return fail_closed(chain, budget, report);
        }
    };

    let mut chain = vec![format!(
        "policy {} with {} gate(s); budget {}/{} consumed",
        policy.policy_version,
        policy.gates.len(),
        budget.attempts_consumed,
        budget.max_retries
    )];

    let mut failing = Vec::new();
    for gate in &policy.gates {
        match evaluate_gate(gate, report.gate(&gate.id)) {
            Ok(()) => {}
            Err(detail) if gate.required => {
                chain.push(format!("gate {} failed: {detail}", gate.id));
                failing.push(FailingGate { gate, detail });
            }
            Err(detail) => {
                chain.push(format!("optional gate {} failed (ignored): {detail}", gate.id));
            }
        }
    }
    for result in &report.gates {
        if policy.gate(&result.gate_id).is_none() {
            chain.push(format!(
                "report gate {} not in policy (ignored)",
                result.gate_id
            ));
        }
    }

    let advisory_action = report.recommended_action.clone();

    let Some(worst) = select_worst(&failing) else {
        chain.push("all required gates passed".to_string());
        return Decision {
            action: RoutingAction::Finalize,
            failure_class: None,
            failing_gate: None,
            reason: REASON_ALL_REQUIRED_GATES_PASSED.to_string(),
            reason_chain: chain,
            budget,
            advisory_action,
        };
    };

    let class = worst.gate.failure_class;
    let routed = route(class);
    chain.push(format!(
        "worst gate {} (severity {:?}, class {}) routes to {}",
        worst.gate.id,
        worst.gate.severity,
        class.as_str(),
        routed.as_str()
    ));
    let (action, reason) = apply_budget(routed, budget, &mut chain);

    Decision {
        action,
        failure_class: Some(class),
        failing_gate: Some(worst.gate.id.clone()),
        reason: reason.unwrap_or(REASON_GATE_FAILED).to_string(),
        reason_chain: chain,
        budget,
        advisory_action,
    }
}

/// Decide with the lineage verdict folded in as the implicit `lineage` gate.
pub fn decide_with_lineage(
    policy: Option<&QcPolicy>,
    report: Option<&QcReport>,
    lineage: &LineageRecord,
    budget: RetryBudget,
) -> Decision {
    match (policy, report) {
        (Some(policy), Some(report)) => {
            let (policy, report) = with_lineage(policy, report, lineage);
            decide(Some(&policy), Some(&report), budget)
        }
        _ => decide(policy, report, budget),
    }
}

/// Same as [`decide_with_lineage`] but keeps the load error text in the
/// reason chain when an input could not be read.
pub fn decide_from_inputs(
    policy: &Result<QcPolicy, QualityInputError>,
    report: &Result<QcReport, QualityInputError>,
    lineage: Option<&LineageRecord>,
    budget: RetryBudget,
) -> Decision {
    match (policy, report) {
        (Ok(policy), Ok(report)) => match lineage {
            Some(lineage) => decide_with_lineage(Some(policy), Some(report), lineage, budget),
            None => decide(Some(policy), Some(report), budget),
        },
        _ => {
            let chain = [policy.as_ref().err(), report.as_ref().err()]
                .into_iter()
                .flatten()
                .map(|e| e.to_string())
                .collect();
            fail_closed(chain, budget, report.as_ref().ok())
        }
    }
}

/// A failed Worker run is a `transient` failure routed through the same
/// table and budget check as a failing gate.
pub fn decide_worker_failure(budget: RetryBudget, detail: &str) -> Decision {
    let class = FailureClass::Transient;
    let mut chain = vec![
        format!("worker invocation failed: {detail}"),
        format!(
            "class {} routes to {}; budget {}/{} consumed",
            class.as_str(),
            route(class).as_str(),
            budget.attempts_consumed,
            budget.max_retries
        ),
    ];
    let (action, reason) = apply_budget(route(class), budget, &mut chain);
    Decision {
        action,
        failure_class: Some(class),
        failing_gate: None,
        reason: reason.unwrap_or(REASON_WORKER_INVOCATION_FAILED).to_string(),
        reason_chain: chain,
        budget,
        advisory_action: None,
    }
}

/// Add the implicit `lineage` gate to the policy (unless declared) and the
/// lineage verdict to the report (replacing any reported value).
pub fn with_lineage(
    policy: &QcPolicy,
    report: &QcReport,
    lineage: &LineageRecord,
) -> (QcPolicy, QcReport) {
    let mut policy = policy.clone();
    if policy.gate(LINEAGE_GATE_ID).is_none() {
        policy.gates.push(QcGate {
            id: LINEAGE_GATE_ID.to_string(),
            threshold: None,
            direction: Default::default(),
            severity: Severity::Critical,
            failure_class: policy
                .lineage_failure_class
                .unwrap_or(FailureClass::Transient),
            required: true,
        });
    }

    let mut report = report.clone();
    report.gates.retain(|gate| gate.gate_id != LINEAGE_GATE_ID);
    let status = if lineage.passed {
        GateStatus::Pass
    } else if lineage
        .failed_required()
        .any(|check| check.status == CheckStatus::Fail)
    {
        GateStatus::Fail
    } else {
        GateStatus::Unknown
    };
    report.gates.push(GateResult {
        gate_id: LINEAGE_GATE_ID.to_string(),
        score: None,
        status,
        detail: lineage.failure_summary(),
    });
    (policy, report)
}

fn evaluate_gate(gate: &QcGate, result: Option<&GateResult>) -> Result<(), String> {
    let Some(result) = result else {
        return Err(GATE_MISSING_FROM_REPORT.to_string());
    };
    let detail = result
        .detail
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default();
    match result.status {
        GateStatus::Fail => Err(format!("reported fail{detail}")),
        GateStatus::Unknown => Err(format!("status unknown{detail}")),
        GateStatus::Pass => match (gate.threshold, result.score) {
            (Some(threshold), Some(score)) if !gate.direction.satisfied(score, threshold) => {
                Err(format!(
                    "score {score} violates threshold {threshold} ({:?})",
                    gate.direction
                ))
            }
            _ => Ok(()),
        },
    }
}

/// Returns the final action plus an overriding reason code when the budget
/// forced escalation.
fn apply_budget(
    routed: RoutingAction,
    budget: RetryBudget,
    chain: &mut Vec<String>,
) -> (RoutingAction, Option<&'static str>) {
    if routed.is_retry() && budget.exhausted() {
        chain.push(format!(
            "retry budget exhausted ({}/{}), escalating",
            budget.attempts_consumed, budget.max_retries
        ));
        (RoutingAction::Escalate, Some(REASON_RETRY_BUDGET_EXHAUSTED))
    } else {
        (routed, None)
    }
}

fn fail_closed(mut chain: Vec<String>, budget: RetryBudget, report: Option<&QcReport>) -> Decision {
    chain.push("failing closed: escalate".to_string());
    Decision {
        action: RoutingAction::Escalate,
        failure_class: None,
        failing_gate: None,
        reason: REASON_POLICY_OR_REPORT_UNREADABLE.to_string(),
        reason_chain: chain,
        budget,
        advisory_action: report.and_then(|r| r.recommended_action.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{LineageCheck, ThresholdDirection};
    use std::path::PathBuf;

    fn gate(id: &str, severity: Severity, class: FailureClass) -> QcGate {
        QcGate {
            id: id.to_string(),
            threshold: None,
            direction: ThresholdDirection::HigherIsBetter,
            severity,
            failure_class: class,
            required: true,
        }
    }

    fn policy(gates: Vec<QcGate>) -> QcPolicy {
        QcPolicy {
            schema_version: 1,
            policy_version: "test-v1".to_string(),
            gates,
            lineage_failure_class: None,
        }
    }

    fn result(id: &str, status: GateStatus, score: Option<f64>) -> GateResult {
        GateResult {
            gate_id: id.to_string(),
            score,
            status,
            detail: None,
        }
    }

    fn report(gates: Vec<GateResult>) -> QcReport {
        QcReport {
            schema_version: 1,
            job_id: "job-7".to_string(),
            attempt: None,
            gates,
            recommended_action: Some("finalize".to_string()),
        }
    }

    fn lineage(passed: bool) -> LineageRecord {
        LineageRecord::new(
            "job-7",
            vec![LineageCheck {
                name: "final.mp4:exists".to_string(),
                artifact: "final.mp4".to_string(),
                required: true,
                status: if passed { CheckStatus::Pass } else { CheckStatus::Fail },
                reason: if passed { "present" } else { "missing" }.to_string(),
            }],
        )
    }

    #[test]
    fn test_all_gates_pass_finalizes() {
        let p = policy(vec![gate("audio", Severity::High, FailureClass::Transient)]);
        let r = report(vec![result("audio", GateStatus::Pass, Some(0.9))]);
        let d = decide(Some(&p), Some(&r), RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::Finalize);
        assert_eq!(d.reason, REASON_ALL_REQUIRED_GATES_PASSED);
        assert_eq!(d.advisory_action.as_deref(), Some("finalize"));
    }

    #[test]
    fn test_transient_failure_retries_until_budget_exhausted() {
        let p = policy(vec![gate("audio", Severity::High, FailureClass::Transient)]);
        let r = report(vec![result("audio", GateStatus::Fail, None)]);

        let first = decide(Some(&p), Some(&r), RetryBudget::new(2, 0));
        assert_eq!(first.action, RoutingAction::Retry);
        assert_eq!(first.failure_class, Some(FailureClass::Transient));
        assert_eq!(first.failing_gate.as_deref(), Some("audio"));

        let second = decide(Some(&p), Some(&r), RetryBudget::new(2, 1));
        assert_eq!(second.action, RoutingAction::Retry);

        let third = decide(Some(&p), Some(&r), RetryBudget::new(2, 2));
        assert_eq!(third.action, RoutingAction::Escalate);
        assert_eq!(third.reason, REASON_RETRY_BUDGET_EXHAUSTED);
        assert_eq!(third.failure_class, Some(FailureClass::Transient));
    }

    #[test]
    fn test_decision_is_byte_identical() {
        let p = policy(vec![
            gate("audio", Severity::High, FailureClass::Transient),
            gate("sharpness", Severity::High, FailureClass::QualityDegradation),
        ]);
        let r = report(vec![
            result("audio", GateStatus::Fail, None),
            result("sharpness", GateStatus::Pass, Some(0.1)),
        ]);
        let a = serde_json::to_vec(&decide(Some(&p), Some(&r), RetryBudget::new(2, 1))).unwrap();
        let b = serde_json::to_vec(&decide(Some(&p), Some(&r), RetryBudget::new(2, 1))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_inputs_fail_closed() {
        let p = policy(vec![]);
        let r = report(vec![]);
        for d in [
            decide(None, Some(&r), RetryBudget::new(2, 0)),
            decide(Some(&p), None, RetryBudget::new(2, 0)),
            decide(None, None, RetryBudget::new(2, 0)),
        ] {
            assert_eq!(d.action, RoutingAction::Escalate);
            assert_eq!(d.reason, REASON_POLICY_OR_REPORT_UNREADABLE);
        }
    }

    #[test]
    fn test_load_error_is_kept_in_reason_chain() {
        let p = Ok(policy(vec![]));
        let r = Err(QualityInputError::Missing {
            kind: "qc report",
            path: PathBuf::from("/logs/job-7/qc_report.json"),
        });
        let d = decide_from_inputs(&p, &r, None, RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::Escalate);
        assert_eq!(d.reason, REASON_POLICY_OR_REPORT_UNREADABLE);
        assert!(d.reason_chain[0].contains("qc_report.json"));
    }

    #[test]
    fn test_required_gate_missing_from_report_fails() {
        let p = policy(vec![gate("duration", Severity::Medium, FailureClass::Structural)]);
        let r = report(vec![]);
        let d = decide(Some(&p), Some(&r), RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::Escalate);
        assert_eq!(d.reason, REASON_GATE_FAILED);
        assert!(d
            .reason_chain
            .iter()
            .any(|line| line.contains(GATE_MISSING_FROM_REPORT)));
    }

    #[test]
    fn test_pass_with_violated_threshold_fails() {
        let mut loudness = gate("loudness", Severity::Medium, FailureClass::QualityDegradation);
        loudness.threshold = Some(-14.0);
        loudness.direction = ThresholdDirection::LowerIsBetter;
        let p = policy(vec![loudness]);

        let loud = report(vec![result("loudness", GateStatus::Pass, Some(-9.5))]);
        let d = decide(Some(&p), Some(&loud), RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::RetryWithFallback);

        let quiet = report(vec![result("loudness", GateStatus::Pass, Some(-16.0))]);
        let d = decide(Some(&p), Some(&quiet), RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::Finalize);
    }

    #[test]
    fn test_unknown_status_fails_and_optional_gates_do_not_block() {
        let mut optional = gate("captions", Severity::Critical, FailureClass::Unrecoverable);
        optional.required = false;
        let p = policy(vec![optional.clone()]);
        let r = report(vec![result("captions", GateStatus::Unknown, None)]);
        let d = decide(Some(&p), Some(&r), RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::Finalize);

        optional.required = true;
        let p = policy(vec![optional]);
        let d = decide(Some(&p), Some(&r), RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::Escalate);
        assert_eq!(d.failure_class, Some(FailureClass::Unrecoverable));
    }

    #[test]
    fn test_structural_escalates_even_with_budget() {
        let p = policy(vec![gate("container", Severity::Low, FailureClass::Structural)]);
        let r = report(vec![result("container", GateStatus::Fail, None)]);
        let d = decide(Some(&p), Some(&r), RetryBudget::new(5, 0));
        assert_eq!(d.action, RoutingAction::Escalate);
        assert_eq!(d.reason, REASON_GATE_FAILED);
    }

    #[test]
    fn test_lineage_failure_becomes_critical_gate() {
        let p = policy(vec![gate("audio", Severity::High, FailureClass::QualityDegradation)]);
        let r = report(vec![result("audio", GateStatus::Fail, None)]);
        let d = decide_with_lineage(Some(&p), Some(&r), &lineage(false), RetryBudget::new(2, 0));
        assert_eq!(d.failing_gate.as_deref(), Some(LINEAGE_GATE_ID));
        assert_eq!(d.action, RoutingAction::Retry);

        let r = report(vec![result("audio", GateStatus::Pass, None)]);
        let d = decide_with_lineage(Some(&p), Some(&r), &lineage(true), RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::Finalize);
    }

    #[test]
    fn test_policy_can_reclassify_lineage() {
        let mut p = policy(vec![]);
        p.lineage_failure_class = Some(FailureClass::Structural);
        let r = report(vec![]);
        let d = decide_with_lineage(Some(&p), Some(&r), &lineage(false), RetryBudget::new(2, 0));
        assert_eq!(d.action, RoutingAction::Escalate);
        assert_eq!(d.failure_class, Some(FailureClass::Structural));
    }

    #[test]
    fn test_worker_failure_is_transient() {
        let d = decide_worker_failure(RetryBudget::new(1, 0), "timed out after 900s");
        assert_eq!(d.action, RoutingAction::Retry);
        assert_eq!(d.reason, REASON_WORKER_INVOCATION_FAILED);

        let d = decide_worker_failure(RetryBudget::new(1, 1), "exit status 3");
        assert_eq!(d.action, RoutingAction::Escalate);
        assert_eq!(d.reason, REASON_RETRY_BUDGET_EXHAUSTED);
    }
}

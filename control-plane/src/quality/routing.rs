//! Failure-class routing table and worst-gate selection.

use shared_types::{FailureClass, QcGate, RoutingAction};
use std::cmp::Ordering;

/// Fixed routing table, in lexical order of failure-class identifiers.
pub const ROUTING_TABLE: [(FailureClass, RoutingAction); 4] = [
    (FailureClass::QualityDegradation, RoutingAction::RetryWithFallback),
    (FailureClass::Structural, RoutingAction::Escalate),
    (FailureClass::Transient, RoutingAction::Retry),
    (FailureClass::Unrecoverable, RoutingAction::Escalate),
];

pub fn route(class: FailureClass) -> RoutingAction {
    ROUTING_TABLE
        .iter()
        .find(|(c, _)| *c == class)
        .map(|(_, action)| *action)
        .unwrap_or(RoutingAction::Escalate)
}

/// A required gate that did not pass, with the reason it failed.
#[derive(Debug, Clone)]
pub struct FailingGate<'a> {
    pub gate: &'a QcGate,
    pub detail: String,
}

/// Orders failing gates from worst to best: highest severity first, then
/// failure-class identifier ascending, then gate id ascending. The order is
/// total, so the same inputs always pick the same gate.
fn worst_first(a: &FailingGate<'_>, b: &FailingGate<'_>) -> Ordering {
    b.gate
        .severity
        .cmp(&a.gate.severity)
        .then_with(|| a.gate.failure_class.as_str().cmp(b.gate.failure_class.as_str()))
        .then_with(|| a.gate.id.cmp(&b.gate.id))
}

pub fn select_worst<'a, 'b>(failing: &'b [FailingGate<'a>]) -> Option<&'b FailingGate<'a>> {
    failing.iter().min_by(|a, b| worst_first(a, b))
}

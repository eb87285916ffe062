//! Shared types for the content factory control plane
//!
//! These types are used by:
//! - the reconciler (state machine, decision engine, audit log)
//! - external collaborators that read or write the files-as-bus artifacts
//!   (Planner, Worker, QC tool, Ops dashboards)
//!
//! Everything here is serializable with serde and round-trips through the
//! JSON files on disk. Nothing in this crate performs I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Job Lifecycle
// ============================================================================

/// Reconciler status of a single job identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Locked,
    FastPathCheck,
    Rendering,
    Verifying,
    QcEvaluating,
    RetryScheduled,
    FallbackScheduled,
    Escalated,
    Completed,
    Posted,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Locked => "LOCKED",
            Self::FastPathCheck => "FAST_PATH_CHECK",
            Self::Rendering => "RENDERING",
            Self::Verifying => "VERIFYING",
            Self::QcEvaluating => "QC_EVALUATING",
            Self::RetryScheduled => "RETRY_SCHEDULED",
            Self::FallbackScheduled => "FALLBACK_SCHEDULED",
            Self::Escalated => "ESCALATED",
            Self::Completed => "COMPLETED",
            Self::Posted => "POSTED",
            Self::Failed => "FAILED",
        }
    }

    /// Terminal for the orchestration loop. `Completed` can still move to
    /// `Posted`, but only on an external publish signal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Escalated | Self::Failed | Self::Posted
        )
    }

    /// Phases that only exist while a tick holds the lock. Seeing one of these
    /// in a recovered snapshot means the previous tick died mid-flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Locked
                | Self::FastPathCheck
                | Self::Rendering
                | Self::Verifying
                | Self::QcEvaluating
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (*self, next) {
            (Completed | Escalated | Failed | Posted, Failed) => false,
            (_, Failed) => true,
            (Pending | RetryScheduled | FallbackScheduled, Locked) => true,
            (current, Locked) => current.is_in_flight(),
            (Locked, FastPathCheck | Rendering) => true,
            (FastPathCheck, Completed | Rendering) => true,
            (Rendering, Verifying | RetryScheduled | Escalated) => true,
            (Verifying, QcEvaluating) => true,
            (QcEvaluating, RetryScheduled | FallbackScheduled | Escalated | Completed) => true,
            (Completed, Posted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current-state snapshot for one job identity.
///
/// Owned by the reconciler. Only ever changed by folding a [`JobEvent`]
/// through [`JobState::apply`], so a snapshot and a replay of the event
/// stream always agree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    /// Reconciler ticks that made it past the lock.
    pub orchestrator_attempts: u32,
    /// External Worker invocations.
    pub worker_attempts: u32,
    /// Retry / fallback transitions taken so far (the retry budget counter).
    pub retries_consumed: u32,
    /// Index into `[recipe] ++ fallback_recipes`.
    pub recipe_index: usize,
    pub last_error: Option<String>,
    pub last_action: Option<RoutingAction>,
    /// First time each phase was entered, keyed by status name; re-entries
    /// overwrite with the latest entry time.
    pub phase_entered_at: BTreeMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sequence number of the last event folded into this snapshot.
    pub last_seq: u64,
}

impl JobState {
    pub fn new(job_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            orchestrator_attempts: 0,
            worker_attempts: 0,
            retries_consumed: 0,
            recipe_index: 0,
            last_error: None,
            last_action: None,
            phase_entered_at: BTreeMap::new(),
            created_at,
            updated_at: created_at,
            last_seq: 0,
        }
    }

    /// Rebuild state from an ordered event stream.
    pub fn replay<'a>(job_id: &str, events: impl IntoIterator<Item = &'a JobEvent>) -> Self {
        let mut events = events.into_iter().peekable();
        let created_at = events
            .peek()
            .map(|event| event.timestamp)
            .unwrap_or_else(Utc::now);
        let mut state = Self::new(job_id, created_at);
        for event in events {
            state.apply(event);
        }
        state
    }

    pub fn apply(&mut self, event: &JobEvent) {
        if self.last_seq == 0 {
            self.created_at = event.timestamp;
        }
        match &event.event {
            JobEventKind::TickStarted { .. } => {
                self.orchestrator_attempts += 1;
            }
            JobEventKind::Transition { to, reason, .. } => {
                self.status = *to;
                self.phase_entered_at
                    .insert(to.as_str().to_string(), event.timestamp);
                match to {
                    JobStatus::RetryScheduled | JobStatus::FallbackScheduled => {
                        self.retries_consumed += 1;
                        self.last_error = Some(reason.clone());
                    }
                    JobStatus::Escalated | JobStatus::Failed => {
                        self.last_error = Some(reason.clone());
                    }
                    JobStatus::Completed => {
                        self.last_error = None;
                    }
                    _ => {}
                }
            }
            JobEventKind::RecipeSelected { index, .. } => {
                self.recipe_index = *index;
            }
            JobEventKind::WorkerInvoked { attempt, .. } => {
                self.worker_attempts = self.worker_attempts.max(*attempt);
            }
            JobEventKind::WorkerFinished {
                success: false,
                detail,
                ..
            } => {
                self.last_error = Some(
                    detail
                        .clone()
                        .unwrap_or_else(|| "worker invocation failed".to_string()),
                );
            }
            JobEventKind::QualityDecision { decision } => {
                self.last_action = Some(decision.action);
            }
            JobEventKind::WorkerFinished { .. }
            | JobEventKind::LineageVerified { .. }
            | JobEventKind::ContractIdentityMismatch { .. }
            | JobEventKind::StaleLockBroken { .. }
            | JobEventKind::PublishConfirmed { .. } => {}
        }
        self.last_seq = event.seq;
        self.updated_at = event.timestamp;
    }
}

// ============================================================================
// Event System
// ============================================================================

/// Append-only audit log entry for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    /// Per-job sequence number (strictly increasing, starts at 1)
    pub seq: u64,

    /// Unique event ID (ULID)
    pub event_id: String,

    pub timestamp: DateTime<Utc>,

    pub job_id: String,

    pub event: JobEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", content = "payload")]
pub enum JobEventKind {
    #[serde(rename = "job.tick_started")]
    TickStarted { resumed_from: Option<JobStatus> },

    #[serde(rename = "job.transition")]
    Transition {
        from: JobStatus,
        to: JobStatus,
        reason: String,
    },

    #[serde(rename = "job.recipe_selected")]
    RecipeSelected { index: usize, recipe: String },

    #[serde(rename = "worker.invoked")]
    WorkerInvoked { attempt: u32, recipe: String },

    #[serde(rename = "worker.finished")]
    WorkerFinished {
        attempt: u32,
        success: bool,
        exit_code: Option<i32>,
        timed_out: bool,
        duration_ms: u64,
        detail: Option<String>,
    },

    #[serde(rename = "lineage.verified")]
    LineageVerified {
        passed: bool,
        failed_checks: Vec<String>,
    },

    #[serde(rename = "quality.decision")]
    QualityDecision { decision: Decision },

    #[serde(rename = "contract.identity_mismatch")]
    ContractIdentityMismatch { embedded: String, canonical: String },

    #[serde(rename = "lock.stale_broken")]
    StaleLockBroken {
        age_secs: u64,
        previous_owner: Option<String>,
    },

    #[serde(rename = "publish.confirmed")]
    PublishConfirmed { confirmation: String },
}

impl JobEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TickStarted { .. } => EVENT_JOB_TICK_STARTED,
            Self::Transition { .. } => EVENT_JOB_TRANSITION,
            Self::RecipeSelected { .. } => EVENT_JOB_RECIPE_SELECTED,
            Self::WorkerInvoked { .. } => EVENT_WORKER_INVOKED,
            Self::WorkerFinished { .. } => EVENT_WORKER_FINISHED,
            Self::LineageVerified { .. } => EVENT_LINEAGE_VERIFIED,
            Self::QualityDecision { .. } => EVENT_QUALITY_DECISION,
            Self::ContractIdentityMismatch { .. } => EVENT_CONTRACT_IDENTITY_MISMATCH,
            Self::StaleLockBroken { .. } => EVENT_LOCK_STALE_BROKEN,
            Self::PublishConfirmed { .. } => EVENT_PUBLISH_CONFIRMED,
        }
    }
}

// ============================================================================
// Quality Decision
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingAction {
    Finalize,
    Retry,
    RetryWithFallback,
    Escalate,
}

impl RoutingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finalize => "finalize",
            Self::Retry => "retry",
            Self::RetryWithFallback => "retry-with-fallback",
            Self::Escalate => "escalate",
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry | Self::RetryWithFallback)
    }
}

/// Category label on a failing gate, used to pick a routing action.
///
/// Variant order is the lexical order of the identifiers, which is also the
/// tie-break order when two failing gates share a severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    QualityDegradation,
    Structural,
    Transient,
    Unrecoverable,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QualityDegradation => "quality-degradation",
            Self::Structural => "structural",
            Self::Transient => "transient",
            Self::Unrecoverable => "unrecoverable",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RetryBudget {
    pub max_retries: u32,
    pub attempts_consumed: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32, attempts_consumed: u32) -> Self {
        Self {
            max_retries,
            attempts_consumed,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts_consumed >= self.max_retries
    }

    pub fn remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempts_consumed)
    }
}

/// Authoritative routing output for one reconciliation tick.
///
/// Contains no timestamps or map types so the same inputs always serialize
/// to the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: RoutingAction,
    pub failure_class: Option<FailureClass>,
    pub failing_gate: Option<String>,
    /// Short machine-readable reason code (see `REASON_*`).
    pub reason: String,
    /// Human-readable reasoning steps, in evaluation order.
    pub reason_chain: Vec<String>,
    pub budget: RetryBudget,
    /// The QC report's own recommendation, kept for audit only.
    pub advisory_action: Option<String>,
}

// ============================================================================
// Quality Policy / Report
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    #[default]
    HigherIsBetter,
    LowerIsBetter,
}

impl ThresholdDirection {
    pub fn satisfied(&self, score: f64, threshold: f64) -> bool {
        match self {
            Self::HigherIsBetter => score >= threshold,
            Self::LowerIsBetter => score <= threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QcGate {
    pub id: String,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub direction: ThresholdDirection,
    pub severity: Severity,
    pub failure_class: FailureClass,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QcPolicy {
    pub schema_version: u32,
    pub policy_version: String,
    pub gates: Vec<QcGate>,
    /// Failure class used for the implicit `lineage` gate.
    #[serde(default)]
    pub lineage_failure_class: Option<FailureClass>,
}

impl QcPolicy {
    pub fn gate(&self, id: &str) -> Option<&QcGate> {
        self.gates.iter().find(|gate| gate.id == id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pass,
    Fail,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GateResult {
    pub gate_id: String,
    #[serde(default)]
    pub score: Option<f64>,
    pub status: GateStatus,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QcReport {
    pub schema_version: u32,
    pub job_id: String,
    /// Worker attempt this report measured, if the QC tool knows it.
    #[serde(default)]
    pub attempt: Option<u32>,
    pub gates: Vec<GateResult>,
    /// Advisory only; the decision engine derives the real action.
    #[serde(default)]
    pub recommended_action: Option<String>,
}

impl QcReport {
    pub fn gate(&self, gate_id: &str) -> Option<&GateResult> {
        self.gates.iter().find(|gate| gate.gate_id == gate_id)
    }
}

// ============================================================================
// Lineage
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineageCheck {
    /// e.g. `result.json:parseable`
    pub name: String,
    pub artifact: String,
    pub required: bool,
    pub status: CheckStatus,
    pub reason: String,
}

/// Result of one lineage walk. Produced fresh on every call; persisted only
/// as a log artifact, never read back as authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineageRecord {
    pub job_id: String,
    pub passed: bool,
    pub checks: Vec<LineageCheck>,
}

impl LineageRecord {
    pub fn new(job_id: impl Into<String>, checks: Vec<LineageCheck>) -> Self {
        let passed = checks
            .iter()
            .filter(|check| check.required)
            .all(|check| check.status == CheckStatus::Pass);
        Self {
            job_id: job_id.into(),
            passed,
            checks,
        }
    }

    pub fn failed_required(&self) -> impl Iterator<Item = &LineageCheck> {
        self.checks
            .iter()
            .filter(|check| check.required && check.status != CheckStatus::Pass)
    }

    pub fn failure_summary(&self) -> Option<String> {
        let failed: Vec<String> = self
            .failed_required()
            .map(|check| format!("{} ({})", check.name, check.reason))
            .collect();
        if failed.is_empty() {
            None
        } else {
            Some(failed.join("; "))
        }
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Event types
pub const EVENT_JOB_TICK_STARTED: &str = "job.tick_started";
pub const EVENT_JOB_TRANSITION: &str = "job.transition";
pub const EVENT_JOB_RECIPE_SELECTED: &str = "job.recipe_selected";
pub const EVENT_WORKER_INVOKED: &str = "worker.invoked";
pub const EVENT_WORKER_FINISHED: &str = "worker.finished";
pub const EVENT_LINEAGE_VERIFIED: &str = "lineage.verified";
pub const EVENT_QUALITY_DECISION: &str = "quality.decision";
pub const EVENT_CONTRACT_IDENTITY_MISMATCH: &str = "contract.identity_mismatch";
pub const EVENT_LOCK_STALE_BROKEN: &str = "lock.stale_broken";
pub const EVENT_PUBLISH_CONFIRMED: &str = "publish.confirmed";

/// Decision reason codes
pub const REASON_ALL_REQUIRED_GATES_PASSED: &str = "all-required-gates-passed";
pub const REASON_POLICY_OR_REPORT_UNREADABLE: &str = "policy-or-report-unreadable";
pub const REASON_RETRY_BUDGET_EXHAUSTED: &str = "retry-budget-exhausted";
pub const REASON_GATE_FAILED: &str = "required-gate-failed";
pub const REASON_WORKER_INVOCATION_FAILED: &str = "worker-invocation-failed";

/// Name of the implicit gate that carries the lineage verdict.
pub const LINEAGE_GATE_ID: &str = "lineage";

/// Only contract / policy / report schema understood by this build.
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Tests
// ============================================================================

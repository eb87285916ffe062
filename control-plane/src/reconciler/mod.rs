//! Job reconciler.
//!
//! One `tick` is a full pass for a single job identity:
//! load contract → lock → recover state → fast path or render → verify
//! lineage → decide → transition → persist → unlock.
//!
//! Every state change goes through [`Reconciler::transition`], which checks
//! the transition table and appends a `job.transition` event. The lock guard
//! lives for the whole tick and is released on every exit path.

mod phases;
pub mod protocol;

use serde_json::Value;
use shared_types::{JobEventKind, JobStatus, LineageRecord};
use std::path::Path;
use std::sync::Arc;

pub use protocol::{ReconcileError, ReconcilerSettings, TickOptions, TickOutcome, TickReport};

use crate::config::Config;
use crate::contract::{load_contract, LoadedContract};
use crate::event_log::{recover, EventLog};
use crate::fs_util::read_optional;
use crate::layout::{ArtifactRoots, ArtifactSet};
use crate::lineage::verify_lineage;
use crate::lock::{LockAcquisition, LockManager, LockOwner};
use crate::worker::{CommandQcTool, CommandWorker, SharedQcTool, SharedWorker};

#[derive(Clone)]
pub struct Reconciler {
    roots: ArtifactRoots,
    locks: LockManager,
    worker: SharedWorker,
    qc_tool: Option<SharedQcTool>,
    settings: ReconcilerSettings,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("roots", &self.roots)
            .field("settings", &self.settings)
            .field("qc_tool", &self.qc_tool.is_some())
            .finish()
    }
}

/// Everything one tick needs, threaded through the phases.
struct TickContext {
    job: LoadedContract,
    artifacts: ArtifactSet,
    log: EventLog,
    max_retries: u32,
    decision: Option<shared_types::Decision>,
    worker_invoked: bool,
}

impl Reconciler {
    pub fn new(
        roots: ArtifactRoots,
        locks: LockManager,
        worker: SharedWorker,
        qc_tool: Option<SharedQcTool>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            roots,
            locks,
            worker,
            qc_tool,
            settings,
        }
    }

    /// Production wiring: command-backed Worker and QC tool from config.
    pub fn from_config(config: &Config) -> Self {
        let qc_tool = config
            .qc_spec()
            .map(|spec| Arc::new(CommandQcTool::new(spec)) as SharedQcTool);
        Self::new(
            config.roots(),
            LockManager::new(&config.lock_root, config.lock_policy()),
            Arc::new(CommandWorker::new(config.worker_spec())),
            qc_tool,
            ReconcilerSettings::from(config),
        )
    }

    pub fn roots(&self) -> &ArtifactRoots {
        &self.roots
    }

    pub async fn tick(
        &self,
        contract_path: &Path,
        options: TickOptions,
    ) -> Result<TickReport, ReconcileError> {
        let job = load_contract(contract_path).await?;
        let job_id = job.job_id.clone();
        let artifacts = self.roots.for_job(&job_id);

        let (guard, broke_stale) = match self.locks.try_acquire(&job_id)? {
            LockAcquisition::Acquired { guard, broke_stale } => (guard, broke_stale),
            LockAcquisition::Contended { owner, age } => {
                tracing::info!(
                    job_id = %job_id,
                    owner = owner.as_ref().map(LockOwner::describe).unwrap_or_default(),
                    age_secs = age.map(|a| a.as_secs()).unwrap_or_default(),
                    "Job locked by another attempt; skipping"
                );
                return Ok(TickReport {
                    job_id,
                    outcome: TickOutcome::Contended {
                        owner: owner.as_ref().map(LockOwner::describe),
                    },
                    state: None,
                    decision: None,
                    worker_invoked: false,
                });
            }
        };

        let log = EventLog::open(&artifacts).await?;
        let status = log.state().status;

        if matches!(
            status,
            JobStatus::Escalated | JobStatus::Failed | JobStatus::Posted
        ) {
            tracing::debug!(job_id = %job_id, status = %status, "Job is terminal; nothing to do");
            return Ok(unchanged(job_id, log));
        }

        let max_retries = options
            .max_retries
            .or(job.contract.max_retries)
            .unwrap_or(self.settings.max_retries);
        let mut ctx = TickContext {
            job,
            artifacts,
            log,
            max_retries,
            decision: None,
            worker_invoked: false,
        };

        if status == JobStatus::Completed {
            let posted = self.check_published(&mut ctx).await?;
            release(guard);
            return Ok(if posted {
                ctx.into_report(TickOutcome::Advanced)
            } else {
                unchanged(job_id, ctx.log)
            });
        }

        if let Some(stale) = broke_stale {
            ctx.log
                .append(JobEventKind::StaleLockBroken {
                    age_secs: stale.age.as_secs(),
                    previous_owner: stale.previous_owner.as_ref().map(LockOwner::describe),
                })
                .await?;
        }
        if let Some(embedded) = ctx.job.identity_mismatch.clone() {
            ctx.log
                .append(JobEventKind::ContractIdentityMismatch {
                    embedded,
                    canonical: job_id.clone(),
                })
                .await?;
        }

        let resumed_from = status.is_in_flight().then_some(status);
        if let Some(previous) = resumed_from {
            tracing::warn!(
                job_id = %job_id,
                status = %previous,
                "Previous tick was interrupted mid-flight; resuming"
            );
        }
        ctx.log
            .append(JobEventKind::TickStarted { resumed_from })
            .await?;
        self.transition(&mut ctx, JobStatus::Locked, "lock acquired")
            .await?;

        self.run_phases(&mut ctx).await?;

        release(guard);
        Ok(ctx.into_report(TickOutcome::Advanced))
    }

    async fn run_phases(&self, ctx: &mut TickContext) -> Result<(), ReconcileError> {
        if self.fast_path(ctx).await? {
            return Ok(());
        }
        if !self.render(ctx).await? {
            return Ok(());
        }
        self.verify_and_decide(ctx).await
    }

    /// Checked transition: the table in [`JobStatus::can_transition_to`]
    /// is the only authority on legal moves.
    async fn transition(
        &self,
        ctx: &mut TickContext,
        to: JobStatus,
        reason: impl Into<String>,
    ) -> Result<(), ReconcileError> {
        let from = ctx.log.state().status;
        if !from.can_transition_to(to) {
            return Err(ReconcileError::InvalidTransition {
                job_id: ctx.job.job_id.clone(),
                from,
                to,
            });
        }
        let reason = reason.into();
        ctx.log
            .append(JobEventKind::Transition {
                from,
                to,
                reason: reason.clone(),
            })
            .await?;

        if matches!(to, JobStatus::Escalated | JobStatus::Failed) {
            tracing::warn!(
                job_id = %ctx.job.job_id,
                from = %from,
                to = %to,
                reason = %reason,
                "Job transition"
            );
        } else {
            tracing::info!(
                job_id = %ctx.job.job_id,
                from = %from,
                to = %to,
                reason = %reason,
                "Job transition"
            );
        }
        Ok(())
    }

    /// `COMPLETED` only moves on an external publish confirmation.
    async fn check_published(&self, ctx: &mut TickContext) -> Result<bool, ReconcileError> {
        let path = ctx.artifacts.publish_confirmation.clone();
        let bytes = match read_optional(&path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Publish confirmation unreadable"
                );
                return Ok(false);
            }
        };
        let confirmation = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(path = %path.display(), "Publish confirmation is not a JSON object");
                return Ok(false);
            }
        };
        if let Some(found) = confirmation.get("job_id") {
            if found.as_str() != Some(ctx.job.job_id.as_str()) {
                tracing::warn!(
                    job_id = %ctx.job.job_id,
                    path = %path.display(),
                    found = %found,
                    "Publish confirmation names another job; ignoring"
                );
                return Ok(false);
            }
        }

        ctx.log
            .append(JobEventKind::PublishConfirmed {
                confirmation: path.display().to_string(),
            })
            .await?;
        self.transition(ctx, JobStatus::Posted, "publish confirmation found")
            .await?;
        Ok(true)
    }

    /// Read-only lineage check for a contract, without taking the lock.
    pub async fn verify(&self, contract_path: &Path) -> Result<LineageRecord, ReconcileError> {
        let job = load_contract(contract_path).await?;
        let artifacts = self.roots.for_job(&job.job_id);
        Ok(verify_lineage(&job, &artifacts).await)
    }

    pub async fn status(&self, job_id: &str) -> Result<shared_types::JobState, ReconcileError> {
        Ok(recover(&self.roots.for_job(job_id)).await?)
    }
}

impl TickContext {
    fn into_report(self, outcome: TickOutcome) -> TickReport {
        TickReport {
            job_id: self.job.job_id,
            outcome,
            state: Some(self.log.state().clone()),
            decision: self.decision,
            worker_invoked: self.worker_invoked,
        }
    }
}

fn unchanged(job_id: String, log: EventLog) -> TickReport {
    TickReport {
        job_id,
        outcome: TickOutcome::Unchanged,
        state: Some(log.state().clone()),
        decision: None,
        worker_invoked: false,
    }
}

fn release(guard: crate::lock::LockGuard) {
    let job_id = guard.job_id().to_string();
    if let Err(e) = guard.release() {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to release job lock");
    }
}

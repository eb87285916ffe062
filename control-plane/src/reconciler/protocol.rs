//! Reconciler errors and tick results.

use shared_types::{Decision, JobState, JobStatus};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::contract::ContractError;
use crate::event_log::EventLogError;
use crate::lock::LockError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    ContractInvalid(#[from] ContractError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error("illegal transition {from} -> {to} for job {job_id}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another attempt holds the job lock; nothing was read or written.
    Contended { owner: Option<String> },
    /// The job was already terminal; nothing was written.
    Unchanged,
    /// The state machine advanced and the log was updated.
    Advanced,
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub job_id: String,
    pub outcome: TickOutcome,
    /// State after the tick. `None` when contended.
    pub state: Option<JobState>,
    /// Decision written by this tick, if any.
    pub decision: Option<Decision>,
    pub worker_invoked: bool,
}

impl TickReport {
    pub fn status(&self) -> Option<JobStatus> {
        self.state.as_ref().map(|state| state.status)
    }

    pub fn is_contended(&self) -> bool {
        matches!(self.outcome, TickOutcome::Contended { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOptions {
    /// Overrides the contract's and the configured retry ceiling.
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub qc_policy_path: PathBuf,
    pub worker_timeout: Duration,
    pub qc_timeout: Duration,
    pub max_retries: u32,
}

impl From<&Config> for ReconcilerSettings {
    fn from(config: &Config) -> Self {
        Self {
            qc_policy_path: config.qc_policy_path.clone(),
            worker_timeout: config.worker_timeout,
            qc_timeout: config.qc_timeout,
            max_retries: config.max_retries,
        }
    }
}

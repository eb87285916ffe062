//! Directory layout of the files-as-bus.
//!
//! Ownership is partitioned by directory: contracts belong to the Planner,
//! the output directory to the Worker, the log directory to the reconciler
//! (and the QC tool that drops its report there), publish confirmations to
//! the distribution layer. The reconciler only ever writes under
//! `log_root` and `lock_root`.

use std::path::{Path, PathBuf};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const SNAPSHOT_FILE: &str = "state.json";
pub const DECISION_FILE: &str = "decision.json";
pub const DECISIONS_LOG_FILE: &str = "decisions.jsonl";
pub const LINEAGE_FILE: &str = "lineage.json";
pub const QC_REPORT_FILE: &str = "qc_report.json";
pub const LOCK_OWNER_FILE: &str = "owner.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRoots {
    pub contracts_dir: PathBuf,
    pub output_root: PathBuf,
    pub log_root: PathBuf,
    pub lock_root: PathBuf,
    pub publish_root: PathBuf,
}

impl ArtifactRoots {
    /// Conventional layout below a single factory root.
    pub fn under(root: &Path) -> Self {
        let log_root = root.join("logs");
        Self {
            contracts_dir: root.join("contracts"),
            output_root: root.join("output"),
            lock_root: log_root.join(".locks"),
            log_root,
            publish_root: root.join("published"),
        }
    }

    pub fn for_job(&self, job_id: &str) -> ArtifactSet {
        ArtifactSet {
            job_id: job_id.to_string(),
            output_dir: self.output_root.join(job_id),
            log_dir: self.log_root.join(job_id),
            lock_dir: self.lock_root.join(format!("{job_id}.lock")),
            publish_confirmation: self.publish_root.join(format!("{job_id}.json")),
        }
    }
}

/// Resolved paths for one job identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub job_id: String,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub publish_confirmation: PathBuf,
}

impl ArtifactSet {
    pub fn events_path(&self) -> PathBuf {
        self.log_dir.join(EVENTS_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.log_dir.join(SNAPSHOT_FILE)
    }

    pub fn decision_path(&self) -> PathBuf {
        self.log_dir.join(DECISION_FILE)
    }

    pub fn decisions_log_path(&self) -> PathBuf {
        self.log_dir.join(DECISIONS_LOG_FILE)
    }

    pub fn lineage_path(&self) -> PathBuf {
        self.log_dir.join(LINEAGE_FILE)
    }

    pub fn qc_report_path(&self) -> PathBuf {
        self.log_dir.join(QC_REPORT_FILE)
    }

    pub fn worker_log_path(&self, attempt: u32) -> PathBuf {
        self.log_dir.join(format!("worker-{attempt}.log"))
    }

    pub fn qc_log_path(&self, attempt: u32) -> PathBuf {
        self.log_dir.join(format!("qc-{attempt}.log"))
    }
}

//! Loading of the externally supplied QC policy and per-attempt QC report.
//!
//! Both loaders are strict: anything missing, unparseable or inconsistent is
//! an error, and the caller turns that error into a fail-closed escalation.

use shared_types::{QcPolicy, QcReport, SCHEMA_VERSION};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::fs_util::read_optional;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QualityInputError {
    #[error("{kind} missing at {path}")]
    Missing { kind: &'static str, path: PathBuf },
    #[error("{kind} unreadable at {path}: {detail}")]
    Unreadable {
        kind: &'static str,
        path: PathBuf,
        detail: String,
    },
    #[error("{kind} at {path} is malformed: {detail}")]
    Malformed {
        kind: &'static str,
        path: PathBuf,
        detail: String,
    },
    #[error("{kind} at {path} is invalid: {detail}")]
    Invalid {
        kind: &'static str,
        path: PathBuf,
        detail: String,
    },
}

const POLICY: &str = "qc policy";
const REPORT: &str = "qc report";

async fn read_input(kind: &'static str, path: &Path) -> Result<Vec<u8>, QualityInputError> {
    match read_optional(path).await {
        Ok(Some(bytes)) => Ok(bytes),
        Ok(None) => Err(QualityInputError::Missing {
            kind,
            path: path.to_path_buf(),
        }),
        Err(e) => Err(QualityInputError::Unreadable {
            kind,
            path: path.to_path_buf(),
            detail: e.to_string(),
        }),
    }
}

pub async fn load_policy(path: &Path) -> Result<QcPolicy, QualityInputError> {
    let bytes = read_input(POLICY, path).await?;
    parse_policy(path, &bytes)
}

pub fn parse_policy(path: &Path, bytes: &[u8]) -> Result<QcPolicy, QualityInputError> {
    let invalid = |detail: String| QualityInputError::Invalid {
        kind: POLICY,
        path: path.to_path_buf(),
        detail,
    };
    let policy: QcPolicy =
        serde_json::from_slice(bytes).map_err(|e| QualityInputError::Malformed {
            kind: POLICY,
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

    if policy.schema_version != SCHEMA_VERSION {
        return Err(invalid(format!(
            "unsupported schema_version {}",
            policy.schema_version
        )));
    }
    if policy.policy_version.trim().is_empty() {
        return Err(invalid("policy_version must be non-empty".to_string()));
    }
    let mut ids = HashSet::new();
    for gate in &policy.gates {
        if gate.id.trim().is_empty() {
            return Err(invalid("gate ids must be non-empty".to_string()));
        }
        if !ids.insert(gate.id.as_str()) {
            return Err(invalid(format!("gate '{}' declared twice", gate.id)));
        }
        if gate.threshold.is_some_and(|t| !t.is_finite()) {
            return Err(invalid(format!("gate '{}' has a non-finite threshold", gate.id)));
        }
    }
    Ok(policy)
}

/// Load a QC report. With `job_id` set, a report for another job is
/// rejected; with `expected_attempt` set, a report naming a different
/// attempt is stale and rejected.
pub async fn load_report(
    path: &Path,
    job_id: Option<&str>,
    expected_attempt: Option<u32>,
) -> Result<QcReport, QualityInputError> {
    let bytes = read_input(REPORT, path).await?;
    parse_report(path, &bytes, job_id, expected_attempt)
}

pub fn parse_report(
    path: &Path,
    bytes: &[u8],
    job_id: Option<&str>,
    expected_attempt: Option<u32>,
) -> Result<QcReport, QualityInputError> {
    let invalid = |detail: String| QualityInputError::Invalid {
        kind: REPORT,
        path: path.to_path_buf(),
        detail,
    };
    let report: QcReport =
        serde_json::from_slice(bytes).map_err(|e| QualityInputError::Malformed {
            kind: REPORT,
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

    if report.schema_version != SCHEMA_VERSION {
        return Err(invalid(format!(
            "unsupported schema_version {}",
            report.schema_version
        )));
    }
    if let Some(job_id) = job_id.filter(|id| *id != report.job_id) {
        return Err(invalid(format!(
            "report is for '{}', expected '{job_id}'",
            report.job_id
        )));
    }
    if let (Some(expected), Some(found)) = (expected_attempt, report.attempt) {
        if expected != found {
            return Err(invalid(format!(
                "report measures attempt {found}, current attempt is {expected}"
            )));
        }
    }
    let mut ids = HashSet::new();
    for gate in &report.gates {
        if !ids.insert(gate.gate_id.as_str()) {
            return Err(invalid(format!("gate '{}' reported twice", gate.gate_id)));
        }
    }
    Ok(report)
}

//! Lineage verifier.
//!
//! Walks contract → output directory → log directory for one job and
//! reports, per expected artifact, whether it exists, is non-empty, parses,
//! and carries the canonical job identity. Read-only and infallible: I/O
//! problems become failing or unknown checks, never errors.

use serde_json::Value;
use shared_types::{CheckStatus, JobState, LineageCheck, LineageRecord};
use std::io;
use std::path::Path;
use tokio::fs;

use crate::contract::{ArtifactKind, LoadedContract, OutputSpec};
use crate::layout::ArtifactSet;

const NOT_EVALUATED: &str = "not evaluated: earlier check failed";

struct Checks {
    checks: Vec<LineageCheck>,
}

impl Checks {
    fn push(
        &mut self,
        name: String,
        artifact: &str,
        required: bool,
        status: CheckStatus,
        reason: impl Into<String>,
    ) {
        self.checks.push(LineageCheck {
            name,
            artifact: artifact.to_string(),
            required,
            status,
            reason: reason.into(),
        });
    }

    /// Record `<artifact>:<check>` for one expected output.
    fn artifact(
        &mut self,
        spec: &OutputSpec,
        check: &str,
        status: CheckStatus,
        reason: impl Into<String>,
    ) {
        let name = format!("{}:{check}", spec.path);
        self.push(name, &spec.path, spec.required, status, reason);
    }
}

pub async fn verify_lineage(job: &LoadedContract, artifacts: &ArtifactSet) -> LineageRecord {
    let mut checks = Checks { checks: Vec::new() };

    match &job.identity_mismatch {
        None => checks.push(
            "contract:identity".to_string(),
            "contract",
            false,
            CheckStatus::Pass,
            "contract identity matches filename",
        ),
        Some(embedded) => checks.push(
            "contract:identity".to_string(),
            "contract",
            false,
            CheckStatus::Fail,
            format!("contract embeds job_id '{embedded}', filename says '{}'", job.job_id),
        ),
    }

    let output_dir_present = fs::metadata(&artifacts.output_dir)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    checks.push(
        "output_dir:exists".to_string(),
        "output_dir",
        true,
        if output_dir_present {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        },
        if output_dir_present {
            "output directory present".to_string()
        } else {
            format!("{} does not exist", artifacts.output_dir.display())
        },
    );

    for spec in job.contract.expected_outputs() {
        check_output(&mut checks, &job.job_id, &artifacts.output_dir, &spec).await;
    }

    check_snapshot(&mut checks, &job.job_id, artifacts).await;

    LineageRecord::new(job.job_id.clone(), checks.checks)
}

async fn check_output(checks: &mut Checks, job_id: &str, output_dir: &Path, spec: &OutputSpec) {
    let path = output_dir.join(&spec.path);
    let needs_parse = matches!(spec.kind, ArtifactKind::Metadata | ArtifactKind::Captions);
    let needs_identity = spec.kind == ArtifactKind::Metadata;

    let skip_from = |checks: &mut Checks, first: &str, reason: &str| {
        let rest = ["non_empty", "parseable", "identity"];
        let start = rest.iter().position(|c| *c == first).unwrap_or(rest.len());
        for check in &rest[start..] {
            let applies = match *check {
                "parseable" => needs_parse,
                "identity" => needs_identity,
                _ => true,
            };
            if applies {
                checks.artifact(spec, check, CheckStatus::Unknown, reason);
            }
        }
    };

    let meta = match fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => {
            checks.artifact(spec, "exists", CheckStatus::Fail, "not a regular file");
            skip_from(checks, "non_empty", NOT_EVALUATED);
            return;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound && !spec.required => {
            let reason = "optional artifact absent";
            checks.artifact(spec, "exists", CheckStatus::Unknown, reason);
            skip_from(checks, "non_empty", reason);
            return;
        }
        Err(e) => {
            checks.artifact(spec, "exists", CheckStatus::Fail, e.to_string());
            skip_from(checks, "non_empty", NOT_EVALUATED);
            return;
        }
    };
    checks.artifact(spec, "exists", CheckStatus::Pass, "present");

    if meta.len() == 0 {
        checks.artifact(spec, "non_empty", CheckStatus::Fail, "file is empty");
        skip_from(checks, "parseable", NOT_EVALUATED);
        return;
    }
    let size = format!("{} bytes", meta.len());
    checks.artifact(spec, "non_empty", CheckStatus::Pass, size);

    if !needs_parse {
        return;
    }
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            checks.artifact(spec, "parseable", CheckStatus::Fail, e.to_string());
            skip_from(checks, "identity", NOT_EVALUATED);
            return;
        }
    };

    match spec.kind {
        ArtifactKind::Captions => match std::str::from_utf8(&bytes) {
            Ok(_) => checks.artifact(spec, "parseable", CheckStatus::Pass, "valid UTF-8 text"),
            Err(e) => checks.artifact(
                spec,
                "parseable",
                CheckStatus::Fail,
                format!("not UTF-8: {e}"),
            ),
        },
        ArtifactKind::Metadata => {
            let value = match serde_json::from_slice::<Value>(&bytes) {
                Ok(value @ Value::Object(_)) => value,
                Ok(_) => {
                    checks.artifact(spec, "parseable", CheckStatus::Fail, "JSON is not an object");
                    skip_from(checks, "identity", NOT_EVALUATED);
                    return;
                }
                Err(e) => {
                    checks.artifact(
                        spec,
                        "parseable",
                        CheckStatus::Fail,
                        format!("invalid JSON: {e}"),
                    );
                    skip_from(checks, "identity", NOT_EVALUATED);
                    return;
                }
            };
            checks.artifact(spec, "parseable", CheckStatus::Pass, "valid JSON object");

            let (status, reason) = match value.get("job_id").and_then(Value::as_str) {
                Some(embedded) if embedded == job_id => {
                    (CheckStatus::Pass, "job_id matches".to_string())
                }
                Some(embedded) => (
                    CheckStatus::Fail,
                    format!("job_id '{embedded}' does not match '{job_id}'"),
                ),
                None => (CheckStatus::Fail, "no string job_id field".to_string()),
            };
            checks.artifact(spec, "identity", status, reason);
        }
        ArtifactKind::Media => {}
    }
}

async fn check_snapshot(checks: &mut Checks, job_id: &str, artifacts: &ArtifactSet) {
    let name = "log:snapshot_identity".to_string();
    let (status, reason) = match fs::read(artifacts.snapshot_path()).await {
        Ok(raw) => match serde_json::from_slice::<JobState>(&raw) {
            Ok(state) if state.job_id == job_id => {
                (CheckStatus::Pass, "snapshot job_id matches".to_string())
            }
            Ok(state) => (
                CheckStatus::Fail,
                format!("snapshot belongs to '{}'", state.job_id),
            ),
            Err(e) => (CheckStatus::Unknown, format!("snapshot unreadable: {e}")),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            (CheckStatus::Unknown, "no snapshot yet".to_string())
        }
        Err(e) => (CheckStatus::Unknown, e.to_string()),
    };
    checks.push(name, "log_dir", false, status, reason);
}

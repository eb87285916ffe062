//! Shared fixtures for control-plane integration tests: a temp factory
//! root, contract/policy writers, and in-process fake Worker / QC tool
//! implementations that count their invocations.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use control_plane::event_log::read_events;
use control_plane::layout::{ArtifactRoots, ArtifactSet};
use control_plane::lock::{LockManager, LockPolicy};
use control_plane::reconciler::{Reconciler, ReconcilerSettings};
use control_plane::worker::{
    QcRequest, QcTool, RenderRequest, RunOutcome, SharedQcTool, SharedWorker, Worker, WorkerError,
};
use shared_types::{GateStatus, JobEvent};

pub const GATE_ID: &str = "audio_loudness";

// ─── Factory root ────────────────────────────────────────────────────────────

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub roots: ArtifactRoots,
    pub policy_path: PathBuf,
}

impl Harness {
    /// Temp root with a contracts dir and a one-gate policy whose gate fails
    /// as `transient`.
    pub fn new() -> Self {
        Self::with_gate_class("transient")
    }

    pub fn with_gate_class(failure_class: &str) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let roots = ArtifactRoots::under(tmp.path());
        std::fs::create_dir_all(&roots.contracts_dir).expect("contracts dir");
        let policy_path = tmp.path().join("config").join("qc_policy.json");
        std::fs::create_dir_all(policy_path.parent().unwrap()).expect("config dir");
        std::fs::write(
            &policy_path,
            serde_json::to_vec_pretty(&json!({
                "schema_version": 1,
                "policy_version": "test-2024-06",
                "gates": [{
                    "id": GATE_ID,
                    "threshold": -23.0,
                    "direction": "higher_is_better",
                    "severity": "high",
                    "failure_class": failure_class,
                }]
            }))
            .unwrap(),
        )
        .expect("write policy");
        Self {
            tmp,
            roots,
            policy_path,
        }
    }

    pub fn write_contract(&self, job_id: &str, body: serde_json::Value) -> PathBuf {
        let path = self.roots.contracts_dir.join(format!("{job_id}.json"));
        std::fs::write(&path, serde_json::to_vec_pretty(&body).unwrap()).expect("write contract");
        path
    }

    pub fn simple_contract(&self, job_id: &str) -> PathBuf {
        self.write_contract(
            job_id,
            json!({
                "schema_version": 1,
                "job_id": job_id,
                "recipe": "slideshow",
                "params": {"topic": "tide pools"}
            }),
        )
    }

    pub fn artifacts(&self, job_id: &str) -> ArtifactSet {
        self.roots.for_job(job_id)
    }

    pub fn settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            qc_policy_path: self.policy_path.clone(),
            worker_timeout: Duration::from_secs(10),
            qc_timeout: Duration::from_secs(10),
            max_retries: 2,
        }
    }

    pub fn reconciler(&self, worker: SharedWorker, qc_tool: Option<SharedQcTool>) -> Reconciler {
        self.reconciler_with(worker, qc_tool, self.settings())
    }

    pub fn reconciler_with(
        &self,
        worker: SharedWorker,
        qc_tool: Option<SharedQcTool>,
        settings: ReconcilerSettings,
    ) -> Reconciler {
        Reconciler::new(
            self.roots.clone(),
            LockManager::new(&self.roots.lock_root, LockPolicy::default()),
            worker,
            qc_tool,
            settings,
        )
    }

    pub async fn events(&self, job_id: &str) -> Vec<JobEvent> {
        read_events(&self.artifacts(job_id).events_path())
            .await
            .expect("readable event log")
            .events
    }
}

// ─── Artifact writers ────────────────────────────────────────────────────────

pub fn write_valid_outputs(output_dir: &Path, job_id: &str) {
    std::fs::create_dir_all(output_dir).expect("output dir");
    std::fs::write(output_dir.join("final.mp4"), b"\x00\x00\x00\x18ftypmp42").unwrap();
    std::fs::write(
        output_dir.join("result.json"),
        serde_json::to_vec(&json!({"job_id": job_id, "duration_secs": 42.5})).unwrap(),
    )
    .unwrap();
    std::fs::write(
        output_dir.join("captions.srt"),
        "1\n00:00:00,000 --> 00:00:02,000\nHello\n",
    )
    .unwrap();
}

pub fn write_report(path: &Path, job_id: &str, status: GateStatus, attempt: Option<u32>) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let score = match status {
        GateStatus::Pass => -16.0,
        _ => -31.0,
    };
    std::fs::write(
        path,
        serde_json::to_vec_pretty(&json!({
            "schema_version": 1,
            "job_id": job_id,
            "attempt": attempt,
            "gates": [{"gate_id": GATE_ID, "score": score, "status": status}],
            "recommended_action": "finalize"
        }))
        .unwrap(),
    )
    .unwrap();
}

// ─── Fake Worker ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum WorkerMode {
    /// Write a complete, consistent output set.
    WriteValidOutputs,
    /// Exit successfully without producing anything.
    WriteNothing,
    Exit(i32),
    /// Binary missing.
    Unspawnable,
    /// Never returns.
    Hang,
}

pub struct FakeWorker {
    mode: WorkerMode,
    delay: Option<Duration>,
    calls: AtomicU32,
    recipes: Mutex<Vec<String>>,
}

impl FakeWorker {
    pub fn new(mode: WorkerMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            delay: None,
            calls: AtomicU32::new(0),
            recipes: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(mode: WorkerMode, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode,
            delay: Some(delay),
            calls: AtomicU32::new(0),
            recipes: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recipes(&self) -> Vec<String> {
        self.recipes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn render(&self, request: &RenderRequest) -> Result<RunOutcome, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.recipes.lock().unwrap().push(request.recipe.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let ok = RunOutcome {
            exit_code: Some(0),
            duration: Duration::from_millis(5),
        };
        match self.mode {
            WorkerMode::WriteValidOutputs => {
                write_valid_outputs(&request.output_dir, &request.job_id);
                Ok(ok)
            }
            WorkerMode::WriteNothing => Ok(ok),
            WorkerMode::Exit(code) => Err(WorkerError::Exited {
                program: "fake-render".to_string(),
                code: Some(code),
            }),
            WorkerMode::Unspawnable => Err(WorkerError::Spawn {
                program: "fake-render".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            WorkerMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ok)
            }
        }
    }
}

// ─── Fake QC tool ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcMode {
    Report(GateStatus),
    /// Write bytes that are not a report.
    Garbage,
    /// Exit non-zero without writing a report.
    Crash,
}

/// Plays back `script` one entry per call, then repeats `then` forever.
pub struct FakeQcTool {
    script: Mutex<VecDeque<QcMode>>,
    then: QcMode,
    calls: AtomicU32,
}

impl FakeQcTool {
    pub fn always(mode: QcMode) -> Arc<Self> {
        Self::scripted(Vec::new(), mode)
    }

    pub fn scripted(script: Vec<QcMode>, then: QcMode) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            then,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QcTool for FakeQcTool {
    async fn evaluate(&self, request: &QcRequest) -> Result<RunOutcome, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.script.lock().unwrap().pop_front().unwrap_or(self.then);
        match mode {
            QcMode::Report(status) => {
                write_report(
                    &request.report_path,
                    &request.job_id,
                    status,
                    Some(request.attempt),
                );
            }
            QcMode::Garbage => {
                std::fs::create_dir_all(request.report_path.parent().unwrap()).unwrap();
                let truncated = b"{\"schema_version\": 1, \"gates\": [";
                std::fs::write(&request.report_path, truncated).unwrap();
            }
            QcMode::Crash => {
                return Err(WorkerError::Exited {
                    program: "fake-qc".to_string(),
                    code: Some(1),
                });
            }
        }
        Ok(RunOutcome {
            exit_code: Some(0),
            duration: Duration::from_millis(1),
        })
    }
}

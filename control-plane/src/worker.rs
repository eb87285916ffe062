//! External process seams: the render Worker and the QC tool.
//!
//! Both are traits so the reconciler can be driven by in-process fakes in
//! tests. The production implementations spawn a configured command with
//! `tokio::process` and send stdout and stderr to a per-attempt log file in
//! the job's log directory.
//!
//! The reconciler never signals a child. It only stops awaiting the call when
//! its timeout expires. Process lifetime belongs to the implementation behind
//! the trait: [`CommandWorker`] and [`CommandQcTool`] own their child and
//! kill it when the call is abandoned, so no orphan keeps writing into the
//! output directory after the tick has moved on.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub job_id: String,
    pub contract_path: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub recipe: String,
    pub attempt: u32,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcRequest {
    pub job_id: String,
    pub contract_path: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub report_path: PathBuf,
    pub attempt: u32,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no command configured")]
    NotConfigured,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {}", exit_label(.code))]
    Exited { program: String, code: Option<i32> },
    #[error("timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },
    #[error("worker I/O failed: {0}")]
    Io(#[from] io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    code.map(|c| format!("status {c}"))
        .unwrap_or_else(|| "a signal".to_string())
}

impl WorkerError {
    /// Failures no retry can fix: nothing to run, or the binary cannot be
    /// executed at all.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::NotConfigured => true,
            Self::Spawn { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => *code,
            _ => None,
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    /// Produce the job's artifacts into `request.output_dir`.
    ///
    /// The caller may drop the returned future at any point; an
    /// implementation that starts a process must not leave it running then.
    async fn render(&self, request: &RenderRequest) -> Result<RunOutcome, WorkerError>;
}

#[async_trait]
pub trait QcTool: Send + Sync {
    /// Measure the job's artifacts and write a report to `request.report_path`.
    async fn evaluate(&self, request: &QcRequest) -> Result<RunOutcome, WorkerError>;
}

pub type SharedWorker = Arc<dyn Worker>;
pub type SharedQcTool = Arc<dyn QcTool>;

/// A command line with `{placeholder}` substitution in its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Split a configured argv (`["render.sh", "--job", "{job_id}"]`).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn expand(&self, vars: &BTreeMap<&'static str, String>) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect()
    }

    async fn run(
        &self,
        vars: BTreeMap<&'static str, String>,
        log_path: &std::path::Path,
    ) -> Result<RunOutcome, WorkerError> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = tokio::fs::File::create(log_path).await?.into_std().await;
        let log_err = log.try_clone()?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(self.expand(&vars))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            // the wrapper owns the child; an abandoned call takes it down
            .kill_on_drop(true);
        for (key, value) in &vars {
            command.env(format!("FACTORY_{}", key.to_ascii_uppercase()), value);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let status = child.wait().await?;
        let outcome = RunOutcome {
            exit_code: status.code(),
            duration: started.elapsed(),
        };
        if status.success() {
            Ok(outcome)
        } else {
            Err(WorkerError::Exited {
                program: self.program.clone(),
                code: status.code(),
            })
        }
    }
}

fn path_string(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Worker backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    spec: Option<CommandSpec>,
}

impl CommandWorker {
    pub fn new(spec: Option<CommandSpec>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn render(&self, request: &RenderRequest) -> Result<RunOutcome, WorkerError> {
        let spec = self.spec.as_ref().ok_or(WorkerError::NotConfigured)?;
        let vars = BTreeMap::from([
            ("job_id", request.job_id.clone()),
            ("contract", path_string(&request.contract_path)),
            ("output_dir", path_string(&request.output_dir)),
            ("log_dir", path_string(&request.log_dir)),
            ("recipe", request.recipe.clone()),
            ("attempt", request.attempt.to_string()),
        ]);
        tracing::info!(
            job_id = %request.job_id,
            attempt = request.attempt,
            recipe = %request.recipe,
            program = %spec.program,
            "Spawning worker"
        );
        spec.run(vars, &request.log_path).await
    }
}

/// QC tool backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandQcTool {
    spec: CommandSpec,
}

impl CommandQcTool {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl QcTool for CommandQcTool {
    async fn evaluate(&self, request: &QcRequest) -> Result<RunOutcome, WorkerError> {
        let vars = BTreeMap::from([
            ("job_id", request.job_id.clone()),
            ("contract", path_string(&request.contract_path)),
            ("output_dir", path_string(&request.output_dir)),
            ("log_dir", path_string(&request.log_dir)),
            ("report_path", path_string(&request.report_path)),
            ("attempt", request.attempt.to_string()),
        ]);
        tracing::info!(
            job_id = %request.job_id,
            attempt = request.attempt,
            program = %self.spec.program,
            "Spawning QC tool"
        );
        self.spec.run(vars, &request.log_path).await
    }
}

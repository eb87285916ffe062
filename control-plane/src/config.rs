//! Runtime configuration.
//!
//! Layers, lowest to highest precedence: built-in defaults, an optional TOML
//! file (`--config` or `FACTORY_CONFIG`), `FACTORY_*` environment variables
//! (a `.env` file is loaded first), then CLI flags applied by the binary.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::layout::ArtifactRoots;
use crate::lock::LockPolicy;
use crate::worker::CommandSpec;

pub const DEFAULT_ROOT: &str = "./factory";
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_QC_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_STALE_LOCK_AFTER_SECS: u64 = 3600;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// On-disk TOML shape. Every field is optional; missing fields fall through
/// to the environment and then to defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub root: Option<PathBuf>,
    pub contracts_dir: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub log_root: Option<PathBuf>,
    pub lock_root: Option<PathBuf>,
    pub publish_root: Option<PathBuf>,
    pub qc_policy_path: Option<PathBuf>,
    pub worker_command: Option<Vec<String>>,
    pub worker_timeout_secs: Option<u64>,
    pub qc_command: Option<Vec<String>>,
    pub qc_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub stale_lock_after_secs: Option<u64>,
    pub break_stale_locks: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub max_concurrent_jobs: Option<usize>,
}

impl ConfigFile {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid config file")
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("in {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub root: PathBuf,
    pub contracts_dir: PathBuf,
    pub output_root: PathBuf,
    pub log_root: PathBuf,
    pub lock_root: PathBuf,
    pub publish_root: PathBuf,
    pub qc_policy_path: PathBuf,
    /// Worker argv with `{placeholder}` arguments; empty means unconfigured.
    pub worker_command: Vec<String>,
    pub worker_timeout: Duration,
    /// QC tool argv; empty means the report is expected to appear on its own.
    pub qc_command: Vec<String>,
    pub qc_timeout: Duration,
    pub max_retries: u32,
    pub stale_lock_after: Duration,
    pub break_stale_locks: bool,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::under(DEFAULT_ROOT)
    }
}

impl Config {
    /// Defaults rooted at `root`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let roots = ArtifactRoots::under(&root);
        Self {
            qc_policy_path: root.join("config").join("qc_policy.json"),
            contracts_dir: roots.contracts_dir,
            output_root: roots.output_root,
            log_root: roots.log_root,
            lock_root: roots.lock_root,
            publish_root: roots.publish_root,
            root,
            worker_command: Vec::new(),
            worker_timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS),
            qc_command: Vec::new(),
            qc_timeout: Duration::from_secs(DEFAULT_QC_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            stale_lock_after: Duration::from_secs(DEFAULT_STALE_LOCK_AFTER_SECS),
            break_stale_locks: true,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }

    /// Load from the process environment and an optional TOML file.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FACTORY_CONFIG").map(PathBuf::from));
        let file = match path {
            Some(path) => ConfigFile::read(&path)?,
            None => ConfigFile::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with an environment lookup. Env wins over file.
    pub fn resolve(
        file: ConfigFile,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let root = env("FACTORY_ROOT")
            .map(PathBuf::from)
            .or(file.root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        let base = Self::under(&root);

        let path_setting = |key: &str, from_file: Option<PathBuf>, default: PathBuf| {
            env(key).map(PathBuf::from).or(from_file).unwrap_or(default)
        };
        let log_root = path_setting("FACTORY_LOG_ROOT", file.log_root, base.log_root);
        let lock_default = log_root.join(".locks");

        Ok(Self {
            contracts_dir: path_setting(
                "FACTORY_CONTRACTS_DIR",
                file.contracts_dir,
                base.contracts_dir,
            ),
            output_root: path_setting("FACTORY_OUTPUT_ROOT", file.output_root, base.output_root),
            lock_root: path_setting("FACTORY_LOCK_ROOT", file.lock_root, lock_default),
            log_root,
            publish_root: path_setting(
                "FACTORY_PUBLISH_ROOT",
                file.publish_root,
                base.publish_root,
            ),
            qc_policy_path: path_setting(
                "FACTORY_QC_POLICY",
                file.qc_policy_path,
                base.qc_policy_path,
            ),
            worker_command: env("FACTORY_WORKER_COMMAND")
                .map(|v| split_command(&v))
                .or(file.worker_command)
                .unwrap_or_default(),
            worker_timeout: Duration::from_secs(env_parse(
                &env,
                "FACTORY_WORKER_TIMEOUT_SECS",
                file.worker_timeout_secs,
                DEFAULT_WORKER_TIMEOUT_SECS,
            )?),
            qc_command: env("FACTORY_QC_COMMAND")
                .map(|v| split_command(&v))
                .or(file.qc_command)
                .unwrap_or_default(),
            qc_timeout: Duration::from_secs(env_parse(
                &env,
                "FACTORY_QC_TIMEOUT_SECS",
                file.qc_timeout_secs,
                DEFAULT_QC_TIMEOUT_SECS,
            )?),
            max_retries: env_parse(
                &env,
                "FACTORY_MAX_RETRIES",
                file.max_retries,
                DEFAULT_MAX_RETRIES,
            )?,
            stale_lock_after: Duration::from_secs(env_parse(
                &env,
                "FACTORY_STALE_LOCK_AFTER_SECS",
                file.stale_lock_after_secs,
                DEFAULT_STALE_LOCK_AFTER_SECS,
            )?),
            break_stale_locks: env_parse(
                &env,
                "FACTORY_BREAK_STALE_LOCKS",
                file.break_stale_locks,
                true,
            )?,
            poll_interval: Duration::from_millis(env_parse(
                &env,
                "FACTORY_POLL_INTERVAL_MS",
                file.poll_interval_ms,
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            max_concurrent_jobs: env_parse(
                &env,
                "FACTORY_MAX_CONCURRENT_JOBS",
                file.max_concurrent_jobs,
                DEFAULT_MAX_CONCURRENT_JOBS,
            )?
            .max(1),
            root,
        })
    }

    pub fn roots(&self) -> ArtifactRoots {
        ArtifactRoots {
            contracts_dir: self.contracts_dir.clone(),
            output_root: self.output_root.clone(),
            log_root: self.log_root.clone(),
            lock_root: self.lock_root.clone(),
            publish_root: self.publish_root.clone(),
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            stale_after: self.stale_lock_after,
            break_stale: self.break_stale_locks,
        }
    }

    pub fn worker_spec(&self) -> Option<CommandSpec> {
        CommandSpec::from_argv(&self.worker_command)
    }

    pub fn qc_spec(&self) -> Option<CommandSpec> {
        CommandSpec::from_argv(&self.qc_command)
    }
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(ToString::to_string).collect()
}

fn env_parse<T: std::str::FromStr>(
    env: impl Fn(&str) -> Option<String>,
    key: &str,
    from_file: Option<T>,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        None => Ok(from_file.unwrap_or(default)),
    }
}

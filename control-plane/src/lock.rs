//! Per-job idempotency lock.
//!
//! A lock is a directory `<lock_root>/<job_id>.lock/` created with
//! `create_dir`, which is atomic and fails with `AlreadyExists` when another
//! holder got there first. The holder writes `owner.json` inside it for
//! diagnostics and stale detection.
//!
//! Breaking a stale lock happens under a second directory lock,
//! `<job_id>.lock.breaking`, and re-checks the holder before moving anything.
//!
//! This is single-host mutual exclusion only. Two hosts sharing a lock root
//! over a filesystem without atomic `mkdir` get no guarantee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::layout::LOCK_OWNER_FILE;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| "unknown-host".to_string()),
            acquired_at: Utc::now(),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "pid {} on {} since {}",
            self.pid,
            self.host,
            self.acquired_at.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Age after which a held lock is considered abandoned.
    pub stale_after: Duration,
    /// Force-break abandoned locks instead of reporting contention.
    pub break_stale: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(3600),
            break_stale: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleLockInfo {
    pub age: Duration,
    pub previous_owner: Option<LockOwner>,
}

#[derive(Debug)]
pub enum LockAcquisition {
    Acquired {
        guard: LockGuard,
        broke_stale: Option<StaleLockInfo>,
    },
    /// Another attempt is in flight. Not an error: the caller backs off.
    Contended {
        owner: Option<LockOwner>,
        age: Option<Duration>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to prepare lock root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create lock {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to break stale lock {path}: {source}")]
    BreakStale {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held lock. Dropping it removes the lock directory, so every exit path
/// (success, `?` early return, panic unwind) releases it.
#[derive(Debug)]
pub struct LockGuard {
    job_id: String,
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly and surface the I/O result.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        remove_lock_dir(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_lock_dir(&self.path) {
            tracing::warn!(
                job_id = %self.job_id,
                path = %self.path.display(),
                error = %e,
                "Failed to release job lock"
            );
        }
    }
}

fn remove_lock_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    root: PathBuf,
    policy: LockPolicy,
}

impl LockManager {
    pub fn new(root: impl Into<PathBuf>, policy: LockPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn lock_path(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{job_id}.lock"))
    }

    pub fn try_acquire(&self, job_id: &str) -> Result<LockAcquisition, LockError> {
        fs::create_dir_all(&self.root).map_err(|source| LockError::Root {
            path: self.root.clone(),
            source,
        })?;
        let path = self.lock_path(job_id);

        match create_lock(&path, job_id) {
            Ok(guard) => {
                tracing::debug!(job_id = %job_id, "Acquired job lock");
                return Ok(LockAcquisition::Acquired {
                    guard,
                    broke_stale: None,
                });
            }
            Err(e) if lost_race(&e) => {}
            Err(source) => return Err(LockError::Create { path, source }),
        }

        let (owner, age) = inspect_lock(&path);
        if !self.is_stale(age) {
            tracing::debug!(
                job_id = %job_id,
                owner = owner.as_ref().map(LockOwner::describe).unwrap_or_default(),
                "Job lock held by another attempt"
            );
            return Ok(LockAcquisition::Contended { owner, age });
        }

        if !self.policy.break_stale {
            tracing::warn!(
                job_id = %job_id,
                age_secs = age.unwrap_or_default().as_secs(),
                "Stale job lock detected; breaking disabled by policy"
            );
            return Ok(LockAcquisition::Contended { owner, age });
        }

        self.break_stale(job_id, &path, owner, age.unwrap_or_default())
    }

    fn is_stale(&self, age: Option<Duration>) -> bool {
        age.is_some_and(|age| age >= self.policy.stale_after)
    }

    fn breaker_path(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{job_id}.lock.breaking"))
    }

    /// Breakers are serialized through a second `create_dir` lock, so at most
    /// one process ever moves a lock directory it does not own.
    fn break_stale(
        &self,
        job_id: &str,
        path: &Path,
        owner: Option<LockOwner>,
        age: Duration,
    ) -> Result<LockAcquisition, LockError> {
        let breaker = self.breaker_path(job_id);
        match fs::create_dir(&breaker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.clear_abandoned_breaker(job_id, &breaker);
                return Ok(LockAcquisition::Contended {
                    owner,
                    age: Some(age),
                });
            }
            Err(source) => {
                return Err(LockError::BreakStale {
                    path: breaker,
                    source,
                })
            }
        }

        let result = self.break_stale_exclusive(job_id, path, owner);
        if let Err(e) = fs::remove_dir(&breaker) {
            tracing::warn!(path = %breaker.display(), error = %e, "Failed to remove lock breaker");
        }
        result
    }

    fn break_stale_exclusive(
        &self,
        job_id: &str,
        path: &Path,
        seen: Option<LockOwner>,
    ) -> Result<LockAcquisition, LockError> {
        // The lock may have been released and retaken since it was inspected.
        let (owner, age) = inspect_lock(path);
        if owner != seen || !self.is_stale(age) {
            return Ok(LockAcquisition::Contended { owner, age });
        }
        let age = age.unwrap_or_default();

        tracing::warn!(
            job_id = %job_id,
            age_secs = age.as_secs(),
            owner = owner.as_ref().map(LockOwner::describe).unwrap_or_default(),
            "Force-breaking stale job lock"
        );
        let tombstone = self
            .root
            .join(format!("{job_id}.lock.stale-{}", ulid::Ulid::new()));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(LockAcquisition::Contended {
                    owner: None,
                    age: None,
                });
            }
            Err(source) => {
                return Err(LockError::BreakStale {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        // Released and retaken between the check and the rename: put it back.
        let (moved, _) = inspect_lock(&tombstone);
        if moved != owner {
            if let Err(e) = fs::rename(&tombstone, path) {
                tracing::warn!(
                    job_id = %job_id,
                    path = %tombstone.display(),
                    error = %e,
                    "Failed to restore a live lock moved while breaking"
                );
            }
            return Ok(LockAcquisition::Contended {
                owner: moved,
                age: None,
            });
        }
        if let Err(e) = fs::remove_dir_all(&tombstone) {
            tracing::warn!(
                path = %tombstone.display(),
                error = %e,
                "Failed to clean up broken lock tombstone"
            );
        }

        match create_lock(path, job_id) {
            Ok(guard) => Ok(LockAcquisition::Acquired {
                guard,
                broke_stale: Some(StaleLockInfo {
                    age,
                    previous_owner: owner,
                }),
            }),
            Err(e) if lost_race(&e) => {
                let (owner, age) = inspect_lock(path);
                Ok(LockAcquisition::Contended { owner, age })
            }
            Err(source) => Err(LockError::Create {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// A breaker left behind by a crash mid-break is cleared once it is as
    /// old as a stale lock; the next attempt can then break the lock.
    fn clear_abandoned_breaker(&self, job_id: &str, breaker: &Path) {
        let age = fs::metadata(breaker)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());
        if !self.is_stale(age) {
            return;
        }
        tracing::warn!(
            job_id = %job_id,
            path = %breaker.display(),
            "Removing abandoned lock breaker"
        );
        if let Err(e) = fs::remove_dir(breaker) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %breaker.display(),
                    error = %e,
                    "Failed to remove lock breaker"
                );
            }
        }
    }

    /// Current holder and lock age, if the lock exists.
    pub fn inspect(&self, job_id: &str) -> Option<(Option<LockOwner>, Option<Duration>)> {
        let path = self.lock_path(job_id);
        path.exists().then(|| inspect_lock(&path))
    }
}

fn create_lock(path: &Path, job_id: &str) -> io::Result<LockGuard> {
    fs::create_dir(path)?;
    let mut guard = LockGuard {
        job_id: job_id.to_string(),
        path: path.to_path_buf(),
        released: false,
    };
    let owner = serde_json::to_vec(&LockOwner::current())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    // On failure the guard drops and removes the half-made lock, unless the
    // directory is already gone and the path may belong to someone else.
    if let Err(e) = fs::write(path.join(LOCK_OWNER_FILE), owner) {
        if e.kind() == io::ErrorKind::NotFound {
            guard.released = true;
        }
        return Err(e);
    }
    Ok(guard)
}

/// Another attempt created the lock first, or moved ours away mid-create.
fn lost_race(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AlreadyExists | io::ErrorKind::NotFound
    )
}

fn inspect_lock(path: &Path) -> (Option<LockOwner>, Option<Duration>) {
    let owner = fs::read(path.join(LOCK_OWNER_FILE))
        .ok()
        .and_then(|raw| serde_json::from_slice::<LockOwner>(&raw).ok());

    let age = match &owner {
        Some(owner) => (Utc::now() - owner.acquired_at).to_std().ok(),
        None => fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok()),
    };
    (owner, age)
}

//! Per-job append-only event log plus current-state snapshot.
//!
//! `events.jsonl` is the history; `state.json` is a cache of folding that
//! history through [`JobState::apply`]. Every append is followed by an atomic
//! snapshot rewrite (temp + rename), so a crash leaves either the previous
//! snapshot or the new one, never a half-written file.
//!
//! Recovery prefers the snapshot and replays any events it has not yet seen.
//! If the snapshot is missing or unparseable the whole log is replayed.

use chrono::Utc;
use shared_types::{Decision, JobEvent, JobEventKind, JobState, LineageRecord};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::fs_util::{append_json_line, read_optional, write_json_atomic};
use crate::layout::ArtifactSet;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log {path} is corrupt at line {line}: {detail}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        detail: String,
    },
    #[error("event log I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl EventLogError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Events read back from `events.jsonl`.
#[derive(Debug, Default)]
pub struct LoadedEvents {
    pub events: Vec<JobEvent>,
    /// Byte offset where an unterminated, unparseable final line starts.
    pub torn_tail_at: Option<u64>,
    /// The last event parsed but its line lost the trailing newline.
    pub missing_newline: bool,
}

/// Parse an events file. Every complete line must decode and `seq` must be
/// strictly increasing; only an unterminated last line may be garbage.
pub fn parse_events(path: &Path, bytes: &[u8]) -> Result<LoadedEvents, EventLogError> {
    let mut loaded = LoadedEvents::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let (line, terminated) = match rest.iter().position(|b| *b == b'\n') {
            Some(end) => (&rest[..end], true),
            None => (rest, false),
        };
        let line_start = offset;
        offset += line.len() + usize::from(terminated);

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match serde_json::from_slice::<JobEvent>(line) {
            Ok(event) => {
                if let Some(prev) = loaded.events.last() {
                    if event.seq <= prev.seq {
                        return Err(EventLogError::Corrupt {
                            path: path.to_path_buf(),
                            line: line_no,
                            detail: format!(
                                "seq {} does not follow {}",
                                event.seq, prev.seq
                            ),
                        });
                    }
                }
                loaded.events.push(event);
                loaded.missing_newline = !terminated;
            }
            Err(e) if !terminated => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %e,
                    "Ignoring torn final event line"
                );
                loaded.torn_tail_at = Some(line_start as u64);
            }
            Err(e) => {
                return Err(EventLogError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    detail: e.to_string(),
                });
            }
        }
    }
    Ok(loaded)
}

pub async fn read_events(path: &Path) -> Result<LoadedEvents, EventLogError> {
    match read_optional(path).await {
        Ok(Some(bytes)) => parse_events(path, &bytes),
        Ok(None) => Ok(LoadedEvents::default()),
        Err(e) => Err(EventLogError::io(path, e)),
    }
}

async fn read_snapshot(path: &Path, job_id: &str) -> Result<Option<JobState>, EventLogError> {
    let bytes = match read_optional(path).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(None),
        Err(e) => return Err(EventLogError::io(path, e)),
    };
    match serde_json::from_slice::<JobState>(&bytes) {
        Ok(state) if state.job_id == job_id => Ok(Some(state)),
        Ok(state) => {
            tracing::warn!(
                path = %path.display(),
                job_id = %job_id,
                snapshot_job_id = %state.job_id,
                "Snapshot belongs to another job; replaying events"
            );
            Ok(None)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Snapshot unparseable; replaying events"
            );
            Ok(None)
        }
    }
}

/// Writer for one job's log directory. Only created while the job lock is
/// held, so there is exactly one writer per job at a time.
#[derive(Debug)]
pub struct EventLog {
    artifacts: ArtifactSet,
    state: JobState,
    torn_tail_at: Option<u64>,
    missing_newline: bool,
}

impl EventLog {
    /// Recover current state without creating anything on disk.
    pub async fn open(artifacts: &ArtifactSet) -> Result<Self, EventLogError> {
        let job_id = artifacts.job_id.as_str();
        let loaded = read_events(&artifacts.events_path()).await?;
        let snapshot = read_snapshot(&artifacts.snapshot_path(), job_id).await?;

        let state = match snapshot {
            Some(mut state) => {
                let mut caught_up = 0usize;
                let last_seq = state.last_seq;
                for event in loaded.events.iter().filter(|e| e.seq > last_seq) {
                    state.apply(event);
                    caught_up += 1;
                }
                if caught_up > 0 {
                    tracing::warn!(
                        job_id = %job_id,
                        caught_up,
                        "Snapshot lagged the event log; applied missing events"
                    );
                }
                state
            }
            None if loaded.events.is_empty() => JobState::new(job_id, Utc::now()),
            None => JobState::replay(job_id, &loaded.events),
        };

        Ok(Self {
            artifacts: artifacts.clone(),
            state,
            torn_tail_at: loaded.torn_tail_at,
            missing_newline: loaded.missing_newline,
        })
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn artifacts(&self) -> &ArtifactSet {
        &self.artifacts
    }

    /// Append one event, fold it into state, then rewrite the snapshot.
    pub async fn append(&mut self, kind: JobEventKind) -> Result<JobEvent, EventLogError> {
        let events_path = self.artifacts.events_path();
        if let Some(offset) = self.torn_tail_at.take() {
            truncate(&events_path, offset).await?;
        }
        if std::mem::take(&mut self.missing_newline) {
            terminate_last_line(&events_path).await?;
        }

        let event = JobEvent {
            seq: self.state.last_seq + 1,
            event_id: ulid::Ulid::new().to_string(),
            timestamp: Utc::now(),
            job_id: self.artifacts.job_id.clone(),
            event: kind,
        };
        append_json_line(&events_path, &event)
            .await
            .map_err(|e| EventLogError::io(&events_path, e))?;

        self.state.apply(&event);
        self.write_snapshot().await?;

        tracing::debug!(
            job_id = %event.job_id,
            seq = event.seq,
            event_type = event.event.event_type(),
            status = %self.state.status,
            "Event appended"
        );
        Ok(event)
    }

    async fn write_snapshot(&self) -> Result<(), EventLogError> {
        let path = self.artifacts.snapshot_path();
        write_json_atomic(&path, &self.state)
            .await
            .map_err(|e| EventLogError::io(&path, e))
    }

    /// Persist the tick's decision: `decision.json` holds the latest,
    /// `decisions.jsonl` keeps one line per tick.
    pub async fn record_decision(&self, decision: &Decision) -> Result<(), EventLogError> {
        let latest = self.artifacts.decision_path();
        write_json_atomic(&latest, decision)
            .await
            .map_err(|e| EventLogError::io(&latest, e))?;
        let history = self.artifacts.decisions_log_path();
        append_json_line(&history, decision)
            .await
            .map_err(|e| EventLogError::io(&history, e))
    }

    pub async fn record_lineage(&self, record: &LineageRecord) -> Result<(), EventLogError> {
        let path = self.artifacts.lineage_path();
        write_json_atomic(&path, record)
            .await
            .map_err(|e| EventLogError::io(&path, e))
    }
}

async fn truncate(path: &Path, offset: u64) -> Result<(), EventLogError> {
    tracing::warn!(path = %path.display(), offset, "Truncating torn event line");
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| EventLogError::io(path, e))?;
    file.set_len(offset)
        .await
        .map_err(|e| EventLogError::io(path, e))?;
    file.sync_all().await.map_err(|e| EventLogError::io(path, e))
}

/// Finish a complete final event whose newline never reached the disk.
async fn terminate_last_line(path: &Path) -> Result<(), EventLogError> {
    tracing::warn!(path = %path.display(), "Terminating final event line");
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|e| EventLogError::io(path, e))?;
    file.write_all(b"\n")
        .await
        .map_err(|e| EventLogError::io(path, e))?;
    file.sync_data().await.map_err(|e| EventLogError::io(path, e))
}

/// Read-only view of a job's state, for `status` and diagnostics.
pub async fn recover(artifacts: &ArtifactSet) -> Result<JobState, EventLogError> {
    Ok(EventLog::open(artifacts).await?.state)
}

//! ScanLoopActor - long-lived reconciliation loop.
//!
//! Periodically lists the contracts directory and runs one reconciler tick
//! per contract. Ticks for different jobs run concurrently, bounded by a
//! semaphore; a job with a tick already in flight in this process is skipped
//! until that tick reports back. Cross-process exclusion is still the
//! filesystem lock taken inside the tick.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::JobStatus;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::contract::derive_job_id;
use crate::reconciler::{Reconciler, TickOptions};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct ScanLoopActor;

#[derive(Debug, Clone)]
pub struct ScanLoopArguments {
    pub reconciler: Arc<Reconciler>,
    pub contracts_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub tick_options: TickOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub scans: u64,
    pub ticks_started: u64,
    pub ticks_finished: u64,
    pub contended: u64,
    pub errors: u64,
    /// Jobs whose last finished tick left them terminal.
    pub terminal: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickSummary {
    Finished(Option<JobStatus>),
    Contended,
    Failed(String),
}

#[derive(Debug)]
pub enum ScanLoopMsg {
    /// Internal trigger to scan the contracts directory.
    ScanNow,
    TickFinished {
        job_id: String,
        summary: TickSummary,
    },
    GetStats {
        reply: RpcReplyPort<ScanStats>,
    },
}

pub struct ScanLoopState {
    reconciler: Arc<Reconciler>,
    contracts_dir: PathBuf,
    tick_options: TickOptions,
    semaphore: Arc<Semaphore>,
    in_flight: HashSet<String>,
    stats: ScanStats,
    ticker: Option<JoinHandle<()>>,
}

#[async_trait]
impl Actor for ScanLoopActor {
    type Msg = ScanLoopMsg;
    type State = ScanLoopState;
    type Arguments = ScanLoopArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            contracts_dir = %args.contracts_dir.display(),
            poll_interval_ms = args.poll_interval.as_millis() as u64,
            max_concurrent_jobs = args.max_concurrent_jobs,
            "ScanLoopActor starting"
        );

        // Kick off background periodic scans; the first tick fires at once.
        let interval = args.poll_interval.max(MIN_POLL_INTERVAL);
        let tick_ref = myself.clone();
        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tick_ref.cast(ScanLoopMsg::ScanNow).is_err() {
                    break;
                }
            }
        });

        Ok(ScanLoopState {
            reconciler: args.reconciler,
            contracts_dir: args.contracts_dir,
            tick_options: args.tick_options,
            semaphore: Arc::new(Semaphore::new(args.max_concurrent_jobs.max(1))),
            in_flight: HashSet::new(),
            stats: ScanStats::default(),
            ticker: Some(ticker),
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        tracing::info!(
            scans = state.stats.scans,
            ticks_finished = state.stats.ticks_finished,
            in_flight = state.in_flight.len(),
            "ScanLoopActor stopped"
        );
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ScanLoopMsg::ScanNow => {
                if let Err(err) = self.scan(&myself, state).await {
                    state.stats.errors += 1;
                    tracing::warn!(
                        contracts_dir = %state.contracts_dir.display(),
                        error = %err,
                        "Contract scan failed"
                    );
                }
            }
            ScanLoopMsg::TickFinished { job_id, summary } => {
                state.in_flight.remove(&job_id);
                state.stats.ticks_finished += 1;
                match summary {
                    TickSummary::Finished(Some(status)) if status.is_terminal() => {
                        state.stats.terminal += 1;
                    }
                    TickSummary::Finished(_) => {}
                    TickSummary::Contended => state.stats.contended += 1,
                    TickSummary::Failed(error) => {
                        state.stats.errors += 1;
                        tracing::warn!(job_id = %job_id, error = %error, "Tick failed");
                    }
                }
            }
            ScanLoopMsg::GetStats { reply } => {
                let mut stats = state.stats.clone();
                stats.in_flight = state.in_flight.len();
                let _ = reply.send(stats);
            }
        }
        Ok(())
    }
}

impl ScanLoopActor {
    async fn scan(
        &self,
        myself: &ActorRef<ScanLoopMsg>,
        state: &mut ScanLoopState,
    ) -> std::io::Result<()> {
        state.stats.scans += 1;
        let contracts = list_contracts(&state.contracts_dir).await?;

        for path in contracts {
            let job_id = match derive_job_id(&path) {
                Ok(job_id) => job_id,
                Err(e) => {
                    state.stats.errors += 1;
                    tracing::warn!(path = %path.display(), error = %e, "Skipping contract");
                    continue;
                }
            };
            if !state.in_flight.insert(job_id.clone()) {
                continue;
            }
            state.stats.ticks_started += 1;

            let reconciler = state.reconciler.clone();
            let semaphore = state.semaphore.clone();
            let options = state.tick_options;
            let reply_to = myself.clone();
            tokio::spawn(async move {
                let summary = match semaphore.acquire_owned().await {
                    Ok(_permit) => summarize(reconciler.tick(&path, options).await),
                    Err(e) => TickSummary::Failed(e.to_string()),
                };
                let _ = reply_to.cast(ScanLoopMsg::TickFinished { job_id, summary });
            });
        }
        Ok(())
    }
}

fn summarize(
    result: Result<crate::reconciler::TickReport, crate::reconciler::ReconcileError>,
) -> TickSummary {
    match result {
        Ok(report) if report.is_contended() => TickSummary::Contended,
        Ok(report) => TickSummary::Finished(report.status()),
        Err(e) => TickSummary::Failed(e.to_string()),
    }
}

/// `*.json` files directly under `dir`, sorted by path.
pub async fn list_contracts(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut contracts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        if is_json && entry.file_type().await?.is_file() {
            contracts.push(path);
        }
    }
    contracts.sort();
    Ok(contracts)
}

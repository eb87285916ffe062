//! `reconciler` - command-line entry point for the content factory control plane.

use clap::{Parser, Subcommand};
use control_plane::actors::{ScanLoopActor, ScanLoopArguments, ScanLoopMsg};
use control_plane::quality::{decide_from_inputs, load_policy, load_report};
use control_plane::reconciler::ReconcileError;
use control_plane::{Config, Reconciler, TickOptions, TickOutcome};
use ractor::Actor;
use serde_json::json;
use shared_types::{JobStatus, RetryBudget, RoutingAction};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_OK: u8 = 0;
const EXIT_JOB_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_INTERNAL: u8 = 70;
const EXIT_TRY_AGAIN: u8 = 75;

/// Deterministic reconciler for content factory jobs.
#[derive(Debug, Parser)]
#[command(name = "reconciler")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file.
    #[arg(long, global = true, env = "FACTORY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation tick for a contract.
    Tick {
        contract: PathBuf,
        /// Retry ceiling for this job; overrides contract and config.
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Scan the contracts directory until interrupted.
    Watch {
        #[arg(long)]
        contracts_dir: Option<PathBuf>,
    },
    /// Print the recovered state of a job.
    Status { job_id: String },
    /// Print the lineage record for a contract.
    Verify { contract: PathBuf },
    /// Evaluate a policy and report without touching any job state.
    Decide {
        #[arg(long)]
        policy: PathBuf,
        #[arg(long)]
        report: PathBuf,
        #[arg(long)]
        max_retries: u32,
        #[arg(long, default_value_t = 0)]
        attempts_consumed: u32,
        /// Reject a report written for another job.
        #[arg(long)]
        job_id: Option<String>,
    },
}

fn init_tracing() {
    let json = std::env::var("FACTORY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let (json_layer, text_layer) = if json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
        )
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "control_plane=info,reconciler=info".into()),
        )
        .with(json_layer)
        .with(text_layer)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let code = match cli.command {
        Commands::Tick {
            contract,
            max_retries,
        } => tick(&config, contract, max_retries).await,
        Commands::Watch { contracts_dir } => watch(&config, contracts_dir).await,
        Commands::Status { job_id } => status(&config, &job_id).await,
        Commands::Verify { contract } => verify(&config, contract).await,
        Commands::Decide {
            policy,
            report,
            max_retries,
            attempts_consumed,
            job_id,
        } => {
            decide(
                policy,
                report,
                RetryBudget::new(max_retries, attempts_consumed),
                job_id,
            )
            .await
        }
    };
    ExitCode::from(code)
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}

fn error_exit(err: &ReconcileError) -> u8 {
    eprintln!("error: {err}");
    match err {
        ReconcileError::ContractInvalid(_) => EXIT_USAGE,
        _ => EXIT_INTERNAL,
    }
}

fn status_exit(status: JobStatus) -> u8 {
    match status {
        JobStatus::Completed | JobStatus::Posted => EXIT_OK,
        JobStatus::Escalated | JobStatus::Failed => EXIT_JOB_FAILED,
        JobStatus::RetryScheduled | JobStatus::FallbackScheduled => EXIT_TRY_AGAIN,
        _ => EXIT_INTERNAL,
    }
}

async fn tick(config: &Config, contract: PathBuf, max_retries: Option<u32>) -> u8 {
    let reconciler = Reconciler::from_config(config);
    let report = match reconciler.tick(&contract, TickOptions { max_retries }).await {
        Ok(report) => report,
        Err(e) => return error_exit(&e),
    };

    let outcome = match &report.outcome {
        TickOutcome::Contended { .. } => "contended",
        TickOutcome::Unchanged => "unchanged",
        TickOutcome::Advanced => "advanced",
    };
    print_json(&json!({
        "job_id": report.job_id,
        "outcome": outcome,
        "status": report.status(),
        "worker_invoked": report.worker_invoked,
        "decision": report.decision,
    }));

    match (&report.outcome, report.status()) {
        (TickOutcome::Contended { .. }, _) => EXIT_TRY_AGAIN,
        (_, Some(status)) => status_exit(status),
        (_, None) => EXIT_INTERNAL,
    }
}

async fn watch(config: &Config, contracts_dir: Option<PathBuf>) -> u8 {
    let args = ScanLoopArguments {
        reconciler: Arc::new(Reconciler::from_config(config)),
        contracts_dir: contracts_dir.unwrap_or_else(|| config.contracts_dir.clone()),
        poll_interval: config.poll_interval,
        max_concurrent_jobs: config.max_concurrent_jobs,
        tick_options: TickOptions::default(),
    };
    let spawned = Actor::spawn(Some("scan-loop".to_string()), ScanLoopActor, args).await;
    let (scan_ref, handle) = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
            eprintln!("failed to start scan loop: {e}");
            return EXIT_INTERNAL;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C; stopping");
    }
    tracing::info!("Shutting down scan loop");
    if let Ok(stats) = ractor::call!(scan_ref, |reply| ScanLoopMsg::GetStats { reply }) {
        tracing::info!(
            scans = stats.scans,
            ticks_finished = stats.ticks_finished,
            contended = stats.contended,
            errors = stats.errors,
            "Scan loop stats"
        );
    }
    scan_ref.stop(None);
    let _ = handle.await;
    EXIT_OK
}

async fn status(config: &Config, job_id: &str) -> u8 {
    match Reconciler::from_config(config).status(job_id).await {
        Ok(state) => {
            print_json(&state);
            EXIT_OK
        }
        Err(e) => error_exit(&e),
    }
}

async fn verify(config: &Config, contract: PathBuf) -> u8 {
    match Reconciler::from_config(config).verify(&contract).await {
        Ok(record) => {
            print_json(&record);
            if record.passed {
                EXIT_OK
            } else {
                EXIT_JOB_FAILED
            }
        }
        Err(e) => error_exit(&e),
    }
}

async fn decide(
    policy: PathBuf,
    report: PathBuf,
    budget: RetryBudget,
    job_id: Option<String>,
) -> u8 {
    let policy = load_policy(&policy).await;
    let report = load_report(&report, job_id.as_deref(), None).await;
    let decision = decide_from_inputs(&policy, &report, None, budget);
    print_json(&decision);
    match decision.action {
        RoutingAction::Finalize => EXIT_OK,
        RoutingAction::Escalate => EXIT_JOB_FAILED,
        RoutingAction::Retry | RoutingAction::RetryWithFallback => EXIT_TRY_AGAIN,
    }
}

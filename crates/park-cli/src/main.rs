use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use park_core::{now_local, PartitionId};
use park_sync::{telemetry, JobOutcome, RegistrySyncOptions, SyncConfig, SyncPipeline};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "park-cli")]
#[command(about = "New Taipei parking feed sync")]
struct Cli {
    /// Print the resolved configuration before running.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the parking-lot registry against the latest snapshot.
    SyncParking {
        /// Skip reconciliation when the snapshot matches the previous run.
        #[arg(long)]
        skip_unchanged: bool,
    },
    /// Append the current availability readings to this month's partition.
    SyncAvailability,
    /// Registry counts and availability partition summary.
    Stats {
        #[arg(long, requires = "month")]
        year: Option<i32>,
        #[arg(long, requires = "year")]
        month: Option<u32>,
    },
    /// List the newest audited API responses.
    Responses {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let _log_guard = match telemetry::init(&config.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialise logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: SyncConfig) -> Result<ExitCode> {
    if cli.debug {
        for (key, value) in config.summary() {
            println!("{key:<30} {value}");
        }
    }

    let pipeline = SyncPipeline::new(config)?;
    match cli.command {
        Commands::SyncParking { skip_unchanged } => {
            let outcome = pipeline
                .sync_parking(RegistrySyncOptions { skip_unchanged })
                .await?;
            Ok(report(outcome, |result| {
                if result.skipped_unchanged {
                    println!("sync-parking: snapshot unchanged, skipped");
                } else {
                    println!(
                        "sync-parking: inserted={} updated={} deleted={} processed={} errors={}",
                        result.inserted,
                        result.updated,
                        result.deleted,
                        result.total_processed,
                        result.errors.len()
                    );
                }
                print_errors(&result.errors)
            }))
        }
        Commands::SyncAvailability => {
            let outcome = pipeline.sync_availability().await?;
            Ok(report(outcome, |result| {
                println!(
                    "sync-availability: inserted={} skipped_invalid={} downloaded={} errors={}",
                    result.inserted,
                    result.skipped_invalid,
                    result.total_downloaded,
                    result.errors.len()
                );
                print_errors(&result.errors)
            }))
        }
        Commands::Stats { year, month } => {
            let partition = match (year, month) {
                (Some(year), Some(month)) => PartitionId::new(year, month)
                    .with_context(|| format!("invalid month {year}-{month}"))?,
                _ => PartitionId::for_time(&now_local()),
            };
            let stats = pipeline.stats(partition).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).context("rendering stats")?
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Responses { limit } => {
            let files = pipeline.recent_responses(limit).await?;
            if files.is_empty() {
                println!("no audited responses under {}", pipeline.config().responses_dir.display());
            }
            for file in files {
                println!("{}", file.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Lock contention is a clean exit; any recorded error is a failure.
fn report<T>(outcome: JobOutcome<T>, print: impl FnOnce(&T) -> bool) -> ExitCode {
    match outcome {
        JobOutcome::AlreadyRunning { holder_pid } => {
            match holder_pid {
                Some(pid) => println!("already running (pid {pid}), nothing to do"),
                None => println!("already running, nothing to do"),
            }
            ExitCode::SUCCESS
        }
        JobOutcome::Completed { run_id, result } => {
            println!("run_id={run_id}");
            if print(&result) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// True when there was nothing to print.
fn print_errors(errors: &[String]) -> bool {
    for message in errors {
        eprintln!("  {message}");
    }
    errors.is_empty()
}

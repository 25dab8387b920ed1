use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lrc_extract::JsonFileReader;
use lrc_sync::{
    connect_store, load_name_extractor, load_task, ReconcilePipeline, RunConfig, RunMode, RunSummary,
    ScheduledRuns,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lrc-cli")]
#[command(about = "Reconcile a legacy export against the target store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct TaskArgs {
    /// Task name under tasks/ or a path to a task YAML file.
    #[arg(long)]
    task: String,
    /// Legacy export, already converted to JSON.
    #[arg(long)]
    source: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify source records against the store without writing.
    Diff(TaskArgs),
    /// Insert missing and correct changed records.
    Apply {
        #[command(flatten)]
        task: TaskArgs,
        /// Send rendered SQL through the store's statement channel.
        #[arg(long)]
        via_statements: bool,
    },
    /// Fill placeholder names from the legacy notes.
    RepairNames {
        #[command(flatten)]
        task: TaskArgs,
        /// Write the repairs; without it only a report is produced.
        #[arg(long)]
        apply: bool,
    },
    /// Render the corrective statements into a script instead of applying them.
    EmitScript {
        #[command(flatten)]
        task: TaskArgs,
        #[arg(long)]
        out: PathBuf,
        /// Emit name repairs instead of the reconciliation mutations.
        #[arg(long)]
        names: bool,
    },
    /// Print the name found in notes text (argument or stdin).
    ExtractName { text: Option<String> },
    /// Reconcile on a cron schedule until interrupted.
    Schedule {
        #[command(flatten)]
        task: TaskArgs,
        #[arg(long)]
        cron: Option<String>,
        /// Classify only, never write.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = RunConfig::from_env()?;

    match cli.command {
        Commands::ExtractName { text } => {
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("reading notes from stdin")?;
                    buf
                }
            };
            let extractor = load_name_extractor(&config)?;
            match extractor.extract(&text) {
                Some(name) => println!("{name}"),
                None => println!("no name found"),
            }
        }
        Commands::Diff(args) => {
            let summary = run_reconcile(config, &args, RunMode::DryRun).await?;
            print_summary(&summary);
        }
        Commands::Apply { task, via_statements } => {
            let mode = if via_statements {
                RunMode::Statements
            } else {
                RunMode::Apply
            };
            let summary = run_reconcile(config, &task, mode).await?;
            print_summary(&summary);
        }
        Commands::RepairNames { task, apply } => {
            let mode = if apply { RunMode::Apply } else { RunMode::DryRun };
            let summary = run_repair(config, &task, mode).await?;
            print_summary(&summary);
        }
        Commands::EmitScript { task, out, names } => {
            let mode = RunMode::Script(out);
            let summary = if names {
                run_repair(config, &task, mode).await?
            } else {
                run_reconcile(config, &task, mode).await?
            };
            print_summary(&summary);
        }
        Commands::Schedule { task, cron, dry_run } => {
            config.scheduler_enabled = true;
            if let Some(cron) = cron {
                config.sync_cron = cron;
            }
            let entity_task = load_task(&config.task_path(&task.task))?;
            let reader = JsonFileReader::new(&task.source);
            let pipeline = build_pipeline(config, cancel_on_ctrl_c()).await?;
            let mode = if dry_run { RunMode::DryRun } else { RunMode::Apply };

            let Some(ScheduledRuns { scheduler: mut sched, mut ticks }) =
                pipeline.maybe_build_scheduler().await?
            else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running, Ctrl-C to stop");
            let runs = pipeline
                .run_scheduled(&entity_task, &reader, &mode, &mut ticks)
                .await;
            info!(runs, "scheduler stopping");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

/// Cancels the returned token on the first Ctrl-C; running batches finish,
/// remaining ones are skipped.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current batch");
            token.cancel();
        }
    });
    cancel
}

async fn build_pipeline(config: RunConfig, cancel: CancellationToken) -> Result<ReconcilePipeline> {
    let connected = connect_store(&config).await?;
    Ok(ReconcilePipeline::from_connected(config, connected).with_cancellation(cancel))
}

async fn run_reconcile(config: RunConfig, args: &TaskArgs, mode: RunMode) -> Result<RunSummary> {
    let task = load_task(&config.task_path(&args.task))?;
    let reader = JsonFileReader::new(&args.source);
    let pipeline = build_pipeline(config, cancel_on_ctrl_c()).await?;
    pipeline.reconcile(&task, &reader, &mode).await
}

async fn run_repair(config: RunConfig, args: &TaskArgs, mode: RunMode) -> Result<RunSummary> {
    let task = load_task(&config.task_path(&args.task))?;
    let extractor = load_name_extractor(&config)?;
    let reader = JsonFileReader::new(&args.source);
    let pipeline = build_pipeline(config, cancel_on_ctrl_c()).await?;
    pipeline.repair_names(&task, &reader, &extractor, &mode).await
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} missing={} changed={} unchanged={} planned={} reports={}",
        summary.mode,
        summary.run_id,
        summary.missing,
        summary.changed,
        summary.unchanged,
        summary.planned_mutations,
        summary.reports_dir
    );
    if let Some(repairs) = &summary.repairs {
        println!(
            "names: planned={} already_named={} no_name_found={} unmatched={}",
            repairs.planned, repairs.already_named, repairs.no_name_found, repairs.unmatched
        );
    }
    if let Some(sync) = &summary.sync {
        println!(
            "writes: applied={} retries={} failed={} skipped={}",
            sync.applied(),
            sync.retries,
            sync.failed.len(),
            sync.skipped
        );
        for failed in &sync.failed {
            println!("  failed {} (legacy {}): {}", failed.target_id, failed.legacy_id, failed.error);
        }
    }
    if let Some(script) = &summary.script {
        println!("script: {} ({} statements)", script.path, script.statements);
    }
}

//! CLI command definitions for apply_forge.
//!
//! `run` drives a pipeline run to completion; `status`, `health` and
//! `checkpoints` inspect it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointStore, FsKvStore, RunCounters};
use crate::metrics::{export_metrics, init_metrics, MetricsObserver};
use crate::pipeline::{
    collaborators_for, Collaborators, ErrorRecord, ItemStatus, LoggingObserver, MasterController,
    RunConfig, RunReport, RunState, RunStatus, RunSummary,
};

/// Default configuration file.
const DEFAULT_CONFIG: &str = "apply-forge.yaml";

/// Exit code for a run that could not start (invalid configuration).
const EXIT_CONFIG_ERROR: i32 = 2;

/// Job application pipeline orchestrator.
#[derive(Parser)]
#[command(name = "apply-forge")]
#[command(about = "Turn job search results into ranked, scored and submitted applications")]
#[command(version)]
#[command(
    long_about = "apply-forge pulls candidates from a search collaborator, enriches and scores them,\ndecides a tier for each and submits the best ones, checkpointing as it goes.\n\nExample usage:\n  apply-forge run --config apply-forge.yaml --dry-run\n  apply-forge status --config apply-forge.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline to completion. Ctrl-C cancels cooperatively.
    Run(RunArgs),

    /// Show counts from the latest checkpoint of a run.
    Status(StatusArgs),

    /// Probe every collaborator.
    Health(HealthArgs),

    /// Inspect or prune stored checkpoints.
    Checkpoints(CheckpointsArgs),
}

/// Arguments for `apply-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run configuration (YAML).
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Override the configured run id.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Resume from the latest checkpoint of the run.
    #[arg(long)]
    pub resume: bool,

    /// Simulate submissions; scoring and decisions still run.
    #[arg(long)]
    pub dry_run: bool,

    /// Resume even if the configuration changed since the checkpoint.
    #[arg(long)]
    pub allow_config_drift: bool,

    /// JSON array of candidates to use instead of the search service.
    #[arg(long)]
    pub candidates: Option<PathBuf>,

    /// Resume document (JSON) passed to matching and submission.
    #[arg(long)]
    pub resume_file: Option<PathBuf>,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `apply-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `apply-forge health`.
#[derive(Parser, Debug)]
pub struct HealthArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `apply-forge checkpoints`.
#[derive(Parser, Debug)]
pub struct CheckpointsArgs {
    #[command(subcommand)]
    pub command: CheckpointsSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum CheckpointsSubcommand {
    /// List checkpoints of a run, oldest first.
    List(StatusArgs),

    /// Delete checkpoints outside the configured retention policy.
    Prune(StatusArgs),
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI and return the process exit code.
pub async fn run() -> anyhow::Result<i32> {
    let cli = parse_cli();
    run_with_cli(cli).await
}

/// Run the CLI with pre-parsed arguments and return the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await,
        Commands::Status(args) => run_status_command(args).await.map(|_| 0),
        Commands::Health(args) => run_health_command(args).await,
        Commands::Checkpoints(args) => match args.command {
            CheckpointsSubcommand::List(args) => {
                run_checkpoints_list_command(args).await.map(|_| 0)
            }
            CheckpointsSubcommand::Prune(args) => {
                run_checkpoints_prune_command(args).await.map(|_| 0)
            }
        },
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn load_config(path: &Path, run_id: Option<String>) -> anyhow::Result<RunConfig> {
    let mut config = RunConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    if let Some(run_id) = run_id {
        config.run_id = run_id;
    }
    Ok(config)
}

fn checkpoint_store(config: &RunConfig) -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(Arc::new(FsKvStore::new(
        &config.checkpoint_dir,
    ))))
}

fn load_resume_document(path: Option<&PathBuf>) -> anyhow::Result<Value> {
    let Some(path) = path else {
        return Ok(Value::Null);
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read resume document {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Resume document {} is not valid JSON", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output =
        serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json_output);
    Ok(())
}

// ============================================================================
// run
// ============================================================================

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    run_id: &'a str,
    state: RunState,
    exit_code: i32,
    abort_reason: Option<&'a str>,
    summary: RunSummary,
    counters: &'a RunCounters,
    last_checkpoint_sequence: Option<u64>,
    peak_concurrency: usize,
    errors: &'a [ErrorRecord],
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<i32> {
    let json = args.json;
    let metrics_file = args.metrics_file.clone();
    let (config, collaborators, resume) = match prepare_run(args) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!(error = %e, "Invalid run setup");
            eprintln!("Error: {:#}", e);
            return Ok(EXIT_CONFIG_ERROR);
        }
    };

    let mut controller =
        MasterController::new(collaborators, checkpoint_store(&config)).with_resume(resume);
    controller.register_observer(Arc::new(LoggingObserver::new()));
    if metrics_file.is_some() {
        init_metrics().context("Failed to initialize metrics")?;
        controller.register_observer(Arc::new(MetricsObserver::new()));
    }

    let handle = match controller.start_run(config).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Run could not start");
            eprintln!("Error: {}", e);
            return Ok(e.exit_code());
        }
    };

    let control = handle.control();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            control.cancel();
        }
    });

    let report = handle.wait().await;
    ctrl_c.abort();
    let report = match report {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Run failed");
            eprintln!("Error: {}", e);
            return Ok(e.exit_code());
        }
    };

    if let Some(path) = &metrics_file {
        std::fs::write(path, export_metrics())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics written");
    }

    print_run_report(&report, json)?;
    Ok(report.exit_code())
}

/// Applies CLI overrides to the configuration and builds the collaborators.
fn prepare_run(args: RunArgs) -> anyhow::Result<(RunConfig, Collaborators, Value)> {
    let mut config = load_config(&args.config, args.run_id)?;
    config.resume |= args.resume;
    config.dry_run |= args.dry_run;
    config.allow_config_drift |= args.allow_config_drift;
    if let Some(candidates) = args.candidates {
        config.collaborators.candidates_file = Some(candidates);
    }
    if let Some(resume_file) = args.resume_file {
        config.collaborators.resume_file = Some(resume_file);
    }

    let resume = load_resume_document(config.collaborators.resume_file.as_ref())?;
    let collaborators = collaborators_for(&config).context("Failed to set up collaborators")?;
    Ok((config, collaborators, resume))
}

fn print_run_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    let summary = report.summary();
    if json {
        return print_json(&RunOutput {
            run_id: &report.run_id,
            state: report.state,
            exit_code: report.exit_code(),
            abort_reason: report.abort_reason.as_deref(),
            summary,
            counters: &report.counters,
            last_checkpoint_sequence: report.status.last_checkpoint_sequence,
            peak_concurrency: report.peak_concurrency,
            errors: &report.errors,
        });
    }

    println!("\n=== Run {} {} ===", report.run_id, report.state);
    if let Some(reason) = &report.abort_reason {
        println!("Aborted:        {}", reason);
    }
    println!("Items:          {}", summary.total);
    println!("Succeeded:      {}", summary.succeeded);
    println!("Rejected:       {}", summary.rejected);
    println!("Failed:         {}", summary.failed);
    println!("Escalated:      {}", summary.escalated);
    println!("Unfinished:     {}", summary.unfinished);
    println!(
        "Submissions:    {} ({} simulated)",
        report.counters.submissions, report.counters.simulated_submissions
    );
    println!("Retries:        {}", report.counters.retries);
    if let Some(sequence) = report.status.last_checkpoint_sequence {
        println!("Checkpoint:     #{}", sequence);
    }
    if !report.errors.is_empty() {
        println!("\nErrors:");
        for record in &report.errors {
            println!(
                "  {} [{}] {} attempt {}: {}",
                record.item_id, record.stage, record.category, record.attempt, record.message
            );
        }
    }
    Ok(())
}

// ============================================================================
// status / health
// ============================================================================

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config, args.run_id)?;
    let store = checkpoint_store(&config);
    let checkpoint = store
        .latest(&config.run_id)
        .await?
        .with_context(|| format!("No checkpoints for run '{}'", config.run_id))?;

    let unfinished = checkpoint
        .state
        .items
        .iter()
        .any(|item| !item.status.is_terminal());
    // Checkpoints do not record why a run stopped; unfinished work reads as running.
    let state = if unfinished {
        RunState::Running
    } else {
        RunState::Completed
    };
    let status = RunStatus::from_checkpoint(&checkpoint, state);

    if args.json {
        return print_json(&status);
    }

    println!("Run:             {}", status.run_id);
    println!("State:           {}", status.state);
    for item_status in ItemStatus::ALL {
        println!(
            "  {:<14} {}",
            format!("{}:", item_status),
            status.count(item_status)
        );
    }
    println!("Tiers:");
    for (tier, count) in &status.counts_by_tier {
        println!("  {:<14} {}", format!("{}:", tier), count);
    }
    println!("Escalated:       {}", status.escalated);
    println!("Backlog:         {} ({} deferred)", status.backlog, status.deferred);
    println!("Stage steps:     {}", status.stage_steps);
    if let Some(at) = status.last_checkpoint_at {
        println!(
            "Last checkpoint: #{} at {}",
            status.last_checkpoint_sequence.unwrap_or_default(),
            at.to_rfc3339()
        );
    }
    Ok(())
}

async fn run_health_command(args: HealthArgs) -> anyhow::Result<i32> {
    let config = load_config(&args.config, None)?;
    let collaborators =
        collaborators_for(&config).context("Failed to set up collaborators")?;
    let controller = MasterController::new(collaborators, checkpoint_store(&config));
    let report = controller.health_check().await;

    if args.json {
        print_json(&report)?;
    } else {
        for collaborator in &report.collaborators {
            match &collaborator.error {
                None => println!("✓ {}", collaborator.name),
                Some(e) => println!("✗ {}: {}", collaborator.name, e),
            }
        }
        println!("Backlog: {}", report.backlog);
    }
    Ok(if report.healthy { 0 } else { 1 })
}

// ============================================================================
// checkpoints
// ============================================================================

async fn run_checkpoints_list_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config, args.run_id)?;
    let metas = checkpoint_store(&config).list(&config.run_id).await?;

    if args.json {
        return print_json(&metas);
    }
    if metas.is_empty() {
        println!("No checkpoints for run '{}'", config.run_id);
    }
    for meta in &metas {
        println!(
            "#{:<6} {}  {} items  {}",
            meta.sequence,
            meta.created_at.to_rfc3339(),
            meta.items,
            meta.key
        );
    }
    Ok(())
}

async fn run_checkpoints_prune_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config, args.run_id)?;
    let deleted = checkpoint_store(&config)
        .prune(&config.run_id, &config.retention)
        .await?;

    if args.json {
        return print_json(&serde_json::json!({ "run_id": config.run_id, "deleted": deleted }));
    }
    println!("Deleted {} checkpoint(s) for run '{}'", deleted, config.run_id);
    Ok(())
}

//! CLI command definitions and handlers.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::collaborators::{FileUsageReporter, ShareConfig, StaticShareConfig, DEFAULT_GROUP_SHARE};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    sweep_once, HistoryConfig, MatchOutcome, SchedulerConfig, SchedulerFacade, ShareSweeper,
    SharesCorrector,
};
use crate::storage::{MigrationRunner, PgTaskQueueStore, QueueFilter};
use crate::taskqueue::{Capabilities, JobRequirements};

/// Grid task-queue matchmaker.
#[derive(Parser)]
#[command(name = "gridmatch")]
#[command(about = "Group pending grid jobs into task queues and match resources to them")]
#[command(version)]
#[command(
    long_about = "gridmatch keeps pending jobs in task queues keyed by their requirements and hands one job at a time to resources whose capabilities match, weighted by fair-share priorities.\n\nJSON documents may be passed inline or as @path.\n\nExample usage:\n  gridmatch insert --job-id 42 --requirements '{\"ownerIdentity\":\"/CN=alice\",\"ownerGroup\":\"biomed_user\",\"setup\":\"Production\",\"cpuTime\":1000}'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// YAML file with per-group shares.
    #[arg(long, env = "GRIDMATCH_SHARES_FILE", global = true)]
    pub shares: Option<PathBuf>,

    /// YAML file with the history correction windows. Needs --usage.
    #[arg(long, env = "GRIDMATCH_HISTORY_FILE", global = true)]
    pub history: Option<PathBuf>,

    /// YAML usage export read by the history correction.
    #[arg(long, env = "GRIDMATCH_USAGE_FILE", global = true)]
    pub usage: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Create or inspect the database schema.
    Migrate(MigrateArgs),

    /// Queue a job.
    Insert(InsertArgs),

    /// Extract one job for a resource.
    Match(MatchArgs),

    /// Remove jobs and clean up the task queues they leave empty.
    #[command(alias = "rm")]
    Delete(DeleteArgs),

    /// Change job priorities.
    Reprioritize(ReprioritizeArgs),

    /// Recompute the priority of every task queue.
    Recalculate,

    /// List task queues.
    #[command(alias = "tq")]
    Queues(QueuesArgs),

    /// Keep task-queue priorities in line with shares and usage history.
    Sweep(SweepArgs),

    /// Print the metric families exported by gridmatch.
    Metrics,
}

/// Arguments for `gridmatch migrate`.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// List applied migrations instead of running them.
    #[arg(long)]
    pub list: bool,

    /// Drop every gridmatch table before migrating.
    #[arg(long)]
    pub reset: bool,
}

/// Arguments for `gridmatch insert`.
#[derive(Parser, Debug)]
pub struct InsertArgs {
    /// Unique job identifier.
    #[arg(long)]
    pub job_id: String,

    /// Requirements JSON document, inline or @path.
    #[arg(short = 'r', long)]
    pub requirements: String,

    /// Submitted job priority.
    #[arg(short = 'p', long, default_value = "1", allow_hyphen_values = true)]
    pub priority: i64,
}

/// Arguments for `gridmatch match`.
#[derive(Parser, Debug)]
pub struct MatchArgs {
    /// Capabilities JSON document, inline or @path.
    #[arg(short = 'c', long, default_value = "{}")]
    pub capabilities: String,
}

/// Arguments for `gridmatch delete`.
#[derive(Parser, Debug)]
pub struct DeleteArgs {
    /// Job identifiers to remove.
    #[arg(required = true)]
    pub job_ids: Vec<String>,
}

/// Arguments for `gridmatch reprioritize`.
#[derive(Parser, Debug)]
pub struct ReprioritizeArgs {
    /// Updates as JOB_ID=PRIORITY.
    #[arg(required = true, value_parser = parse_priority_update)]
    pub updates: Vec<(String, i64)>,
}

/// Arguments for `gridmatch queues`.
#[derive(Parser, Debug)]
pub struct QueuesArgs {
    /// Only queues of this owner group.
    #[arg(short = 'g', long)]
    pub group: Option<String>,

    /// Only queues of this owner identity.
    #[arg(long)]
    pub owner: Option<String>,

    /// Only queues of this setup.
    #[arg(short = 's', long)]
    pub setup: Option<String>,

    /// Show the ranked candidates for a capabilities document instead.
    #[arg(short = 'm', long)]
    pub matching: Option<String>,

    /// Delete enabled empty task queues first.
    #[arg(long)]
    pub clean: bool,

    /// Only print the owner groups holding task queues.
    #[arg(long, conflicts_with_all = ["matching", "clean"])]
    pub groups: bool,
}

/// Arguments for `gridmatch sweep`.
#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Run a single sweep and exit.
    #[arg(long)]
    pub once: bool,

    /// Seconds between sweeps, overriding GRIDMATCH_SHARE_SWEEP_SECS.
    #[arg(long, conflicts_with = "once")]
    pub interval_secs: Option<u64>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Metrics => {
            init_metrics().context("failed to initialize metrics")?;
            print!("{}", export_metrics());
            Ok(())
        }
        Commands::Migrate(args) => run_migrate_command(&cli, args).await,
        command => {
            let scheduler = build_scheduler(&cli).await?;
            match command {
                Commands::Insert(args) => run_insert_command(&scheduler, args).await,
                Commands::Match(args) => run_match_command(&scheduler, args).await,
                Commands::Delete(args) => {
                    print_json(&scheduler.delete_jobs(&args.job_ids).await?)
                }
                Commands::Reprioritize(args) => {
                    print_json(&scheduler.modify_priorities(&args.updates).await?)
                }
                Commands::Recalculate => {
                    let groups = scheduler.recalculate_all().await?;
                    print_json(&serde_json::json!({ "groups": groups }))
                }
                Commands::Queues(args) => run_queues_command(&scheduler, args).await,
                Commands::Sweep(args) => run_sweep_command(&scheduler, args).await,
                Commands::Metrics | Commands::Migrate(_) => Ok(()),
            }
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn connect(cli: &Cli) -> anyhow::Result<PgTaskQueueStore> {
    let url = cli
        .database_url
        .as_deref()
        .context("--database-url or DATABASE_URL is required")?;
    Ok(PgTaskQueueStore::connect(url).await?)
}

async fn build_scheduler(cli: &Cli) -> anyhow::Result<SchedulerFacade> {
    let store = Arc::new(connect(cli).await?);
    let shares: Arc<dyn ShareConfig> = match &cli.shares {
        Some(path) => Arc::new(
            StaticShareConfig::from_file(path)
                .with_context(|| format!("failed to load shares from {}", path.display()))?,
        ),
        None => Arc::new(StaticShareConfig::new(DEFAULT_GROUP_SHARE)),
    };
    let config = SchedulerConfig::from_env()?;
    Ok(SchedulerFacade::new(config, store, shares, build_corrector(cli)?)?)
}

fn build_corrector(cli: &Cli) -> anyhow::Result<Option<Arc<SharesCorrector>>> {
    let Some(history_path) = &cli.history else {
        return Ok(None);
    };
    let usage_path = cli
        .usage
        .as_ref()
        .context("--history needs --usage (or GRIDMATCH_USAGE_FILE)")?;
    let history = HistoryConfig::from_file(history_path)
        .with_context(|| format!("failed to load history from {}", history_path.display()))?;
    info!(
        windows = history.windows.len(),
        usage = %usage_path.display(),
        "History correction enabled"
    );
    let reporter = Arc::new(FileUsageReporter::new(usage_path));
    Ok(Some(Arc::new(SharesCorrector::new(history, reporter))))
}

async fn run_migrate_command(cli: &Cli, args: &MigrateArgs) -> anyhow::Result<()> {
    let store = connect(cli).await?;
    let runner = MigrationRunner::new(store.pool().clone());

    if args.list {
        for migration in runner.list_applied_migrations().await? {
            println!("{}\t{}\t{}", migration.version, migration.name, migration.applied_at);
        }
        for migration in runner.pending_migrations().await? {
            println!("{}\t{}\tpending", migration.version, migration.name);
        }
        return Ok(());
    }

    if args.reset {
        runner.reset_database().await?;
        info!("Dropped gridmatch tables");
    }
    let applied = runner.run_migrations().await?;
    info!(applied, "Schema is up to date");
    Ok(())
}

async fn run_sweep_command(scheduler: &SchedulerFacade, args: &SweepArgs) -> anyhow::Result<()> {
    if args.once {
        let recomputed = sweep_once(scheduler.calculator()).await?;
        return print_json(&serde_json::json!({ "recomputed": recomputed }));
    }

    let mut sweeper = match args.interval_secs {
        Some(secs) => ShareSweeper::new(
            Arc::clone(scheduler.calculator()),
            Duration::from_secs(secs.max(1)),
        ),
        None => scheduler.sweeper(),
    };
    sweeper.start()?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Interrupted, stopping share sweeper");
    sweeper.shutdown().await?;
    Ok(())
}

async fn run_insert_command(scheduler: &SchedulerFacade, args: &InsertArgs) -> anyhow::Result<()> {
    let requirements = JobRequirements::from_json_str(&read_document(&args.requirements)?)?;
    let task_queue_id = scheduler
        .insert_job(&args.job_id, &requirements, args.priority)
        .await?;
    print_json(&serde_json::json!({
        "jobId": args.job_id,
        "taskQueueId": task_queue_id,
    }))
}

async fn run_match_command(scheduler: &SchedulerFacade, args: &MatchArgs) -> anyhow::Result<()> {
    let capabilities = Capabilities::from_json_str(&read_document(&args.capabilities)?)?;
    let outcome = scheduler.match_job(&capabilities).await?;
    if let MatchOutcome::NoMatch = outcome {
        info!("No job matched");
    }
    print_json(&outcome)
}

async fn run_queues_command(scheduler: &SchedulerFacade, args: &QueuesArgs) -> anyhow::Result<()> {
    if args.groups {
        return print_json(&scheduler.groups_in_task_queues().await?);
    }

    if args.clean {
        let deleted = scheduler.clean_orphaned_task_queues().await?;
        info!(deleted = deleted.len(), "Cleaned orphaned task queues");
    }

    if let Some(document) = &args.matching {
        let capabilities = Capabilities::from_json_str(&read_document(document)?)?;
        return print_json(&scheduler.matching_task_queues(&capabilities).await?);
    }

    let mut filter = QueueFilter::new();
    if let Some(group) = &args.group {
        filter = filter.with_owner_group(group);
    }
    if let Some(owner) = &args.owner {
        filter = filter.with_owner_identity(owner);
    }
    if let Some(setup) = &args.setup {
        filter = filter.with_setup(setup);
    }
    print_json(&scheduler.retrieve_task_queues(&filter).await?)
}

// ============================================================================
// Helpers
// ============================================================================

/// Returns the document text, reading `@path` arguments from disk.
fn read_document(arg: &str) -> anyhow::Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("failed to read {}", path)),
        None => Ok(arg.to_string()),
    }
}

fn parse_priority_update(raw: &str) -> Result<(String, i64), String> {
    let (job_id, priority) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected JOB_ID=PRIORITY, got '{}'", raw))?;
    if job_id.is_empty() {
        return Err(format!("missing job id in '{}'", raw));
    }
    let priority = priority
        .parse::<i64>()
        .map_err(|e| format!("invalid priority in '{}': {}", raw, e))?;
    Ok((job_id.to_string(), priority))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

//! CLI command definitions for featbench.
//!
//! A single `run` command evaluates agents over an instance corpus, or with
//! `--mode build` only makes sure every instance image is available.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::config::{AgentDescriptor, HarnessConfig};
use crate::corpus::{load_corpus, loader::select_instances, Instance};
use crate::execution::{pull_images, BuildSummary, ContainerController, ContainerRuntime, DockerClient};
use crate::metrics::HarnessMetrics;
use crate::scheduler::{plan_tasks, EvaluationScheduler, RunSummary};
use crate::storage::{load_results, ResultKey, ResultsStore};

/// Default results file.
const DEFAULT_OUTPUT: &str = "./featbench-results/results.jsonl";

/// FeatBench evaluation harness.
#[derive(Parser)]
#[command(name = "featbench")]
#[command(about = "Evaluate coding agents on feature-implementation tasks in isolated containers")]
#[command(version)]
#[command(
    long_about = "featbench runs coding agents against FeatBench instances inside per-task Docker containers,\napplies the patch each agent produces, runs the Fail-to-Pass and Pass-to-Pass tests and\nappends one JSONL result per (agent, instance).\n\nExample usage:\n  featbench run --corpus featbench_v1.0.json --agents trae-agent --output ./results.jsonl"
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
    /// Evaluate agents over a corpus, or pull the images it needs.
    ///
    /// Pairs already present in the output file are skipped, so an
    /// interrupted run resumes where it stopped.
    Run(RunArgs),
}

/// What `run` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// Run agents and tests.
    Evaluate,
    /// Only resolve and pull instance images.
    Build,
}

/// Arguments for the run command.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Instance corpus (JSON array or JSONL).
    #[arg(short = 'd', long)]
    pub corpus: PathBuf,

    /// Agents to evaluate, comma separated. Defaults to every configured agent.
    #[arg(short = 'a', long, value_delimiter = ',')]
    pub agents: Vec<String>,

    /// Evaluate agents or only build/pull images.
    #[arg(short = 'm', long, value_enum, default_value_t = RunMode::Evaluate)]
    pub mode: RunMode,

    /// Results file (JSONL). Existing results are kept and skipped.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Harness configuration file (YAML).
    #[arg(short = 'c', long, env = "FEATBENCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of concurrent tasks (overrides the config file).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Only these instance ids, comma separated.
    #[arg(short = 'i', long, value_delimiter = ',')]
    pub instances: Vec<String>,

    /// Only the first N selected instances.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Host directory for workspaces and the agent source cache.
    #[arg(long)]
    pub work_root: Option<PathBuf>,

    /// Leave containers in place after each task for debugging.
    #[arg(long)]
    pub keep_containers: bool,

    /// Request NVIDIA GPUs for task containers.
    #[arg(long)]
    pub gpu: bool,

    /// List what would run (or be pulled) without doing it.
    #[arg(long)]
    pub dry_run: bool,

    /// Write Prometheus metrics here when the run ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print the summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments without running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Returns an error only for fatal misconfiguration. Task failures are
/// recorded in the results file and still exit successfully.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_run_command(args).await,
    }
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let agents = match args.mode {
        RunMode::Evaluate => config
            .select_agents(&args.agents)
            .context("Invalid agent selection")?,
        RunMode::Build => Vec::new(),
    };

    let instances = load_instances(&args)?;
    info!(
        instances = instances.len(),
        agents = agents.len(),
        mode = ?args.mode,
        "Loaded corpus"
    );

    if args.dry_run && args.mode == RunMode::Evaluate {
        return print_plan(&args, &instances, &agents).await;
    }

    let docker = DockerClient::new().context("Cannot connect to the Docker daemon")?;
    docker
        .ping()
        .await
        .context("Docker daemon is not reachable")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let metrics = Arc::new(HarnessMetrics::new().context("Failed to create metrics registry")?);

    match args.mode {
        RunMode::Build => {
            let summary = pull_images(
                Arc::clone(&runtime),
                &instances,
                &config.registry_prefix,
                config.pull_concurrency,
                args.dry_run,
            )
            .await;
            print_build_summary(&summary, args.json)?;
        }
        RunMode::Evaluate => {
            let config = Arc::new(config);
            let store = Arc::new(
                ResultsStore::open(&args.output)
                    .await
                    .context("Failed to open results file")?,
            );
            let controller = Arc::new(ContainerController::new(
                runtime,
                Arc::clone(&config),
                Arc::clone(&metrics),
            ));
            let scheduler = EvaluationScheduler::new(
                Arc::clone(&config),
                controller,
                store,
                Arc::clone(&metrics),
            )?;

            let shutdown = scheduler.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing running tasks");
                    shutdown.trigger();
                }
            });

            let summary = scheduler.run(&instances, &agents).await?;
            print_run_summary(&summary, &args.output, args.json)?;
        }
    }

    if let Some(path) = &args.metrics_file {
        write_metrics(&metrics, path)?;
    }
    Ok(())
}

/// Loads the config file (or defaults), applies flag overrides and validates.
fn load_config(args: &RunArgs) -> anyhow::Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(root) = &args.work_root {
        config.work_root = Some(root.clone());
    }
    if args.keep_containers {
        config.keep_containers = true;
    }
    if args.gpu {
        config.gpu = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Loads the corpus and narrows it to `--instances` and `--limit`.
fn load_instances(args: &RunArgs) -> anyhow::Result<Vec<Instance>> {
    let corpus = load_corpus(&args.corpus)
        .with_context(|| format!("Failed to load corpus {}", args.corpus.display()))?;

    let (mut instances, unknown) = select_instances(corpus, &args.instances);
    if !unknown.is_empty() {
        warn!(ids = ?unknown, "Requested instances not found in corpus");
    }
    if let Some(limit) = args.limit {
        instances.truncate(limit);
    }
    if instances.is_empty() {
        anyhow::bail!("No instances selected from {}", args.corpus.display());
    }
    Ok(instances)
}

async fn print_plan(
    args: &RunArgs,
    instances: &[Instance],
    agents: &[AgentDescriptor],
) -> anyhow::Result<()> {
    let recorded: HashSet<ResultKey> = load_results(&args.output)
        .await
        .context("Failed to read results file")?
        .iter()
        .map(|r| r.key())
        .collect();
    let (tasks, skipped) = plan_tasks(instances, agents, &recorded);

    if args.json {
        let keys: Vec<ResultKey> = tasks.iter().map(|t| t.key()).collect();
        let json = serde_json::json!({ "scheduled": keys, "skipped": skipped });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    println!("\n=== Planned Evaluations ===");
    println!("Scheduled: {}", tasks.len());
    println!("Skipped:   {} (already recorded)", skipped);
    for task in &tasks {
        println!("  {}", task.key());
    }
    Ok(())
}

fn print_build_summary(summary: &BuildSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("\n=== Image Build Summary ===");
    println!("Images:   {}", summary.total);
    println!("Present:  {}", summary.present);
    println!("Pulled:   {}", summary.pulled);
    println!("Missing:  {}", summary.missing);
    println!("Failed:   {}", summary.failed);
    for report in summary.reports.iter().filter(|r| r.error.is_some()) {
        if let Some(err) = &report.error {
            println!("  {} error: {}", report.image, err);
        }
    }
    Ok(())
}

fn print_run_summary(summary: &RunSummary, output: &Path, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("\n=== FeatBench Results ===");
    println!("Scheduled:    {}", summary.scheduled);
    println!("Skipped:      {}", summary.skipped);
    println!("Completed:    {}", summary.completed);
    println!("Resolved:     {}", summary.resolved);
    println!("Errored:      {}", summary.total_errored());
    for (kind, count) in &summary.errored {
        println!("  {kind}: {count}");
    }
    if summary.not_recorded > 0 {
        println!("Not recorded: {}", summary.not_recorded);
    }
    if summary.cancelled > 0 {
        println!("Cancelled:    {}", summary.cancelled);
    }
    println!(
        "Workers:      {} (avg {:.1}s per task)",
        summary.workers, summary.average_task_secs
    );
    println!();
    for (agent, totals) in &summary.per_agent {
        println!(
            "  {} resolved={}/{} errored={} rate={:.1}%",
            agent,
            totals.resolved,
            totals.completed + totals.errored,
            totals.errored,
            totals.resolve_rate * 100.0
        );
    }
    println!("\nResults: {}", output.display());
    Ok(())
}

fn write_metrics(metrics: &HarnessMetrics, path: &Path) -> anyhow::Result<()> {
    let text = metrics.export().context("Failed to encode metrics")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    info!(path = %path.display(), "Metrics written");
    Ok(())
}

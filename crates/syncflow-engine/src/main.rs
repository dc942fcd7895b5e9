//! Syncflow - run sync jobs from the command line

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use syncflow_common::logging::{init_logging, LogConfig, LogLevel};
use syncflow_engine::collection::default_vector_size;
use syncflow_engine::prelude::*;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "syncflow")]
#[command(author, version, about = "Sync records into a vector store")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run one sync job from a JSON lines file into an in-memory store
    Run {
        /// Records, one JSON object per line
        #[arg(short, long)]
        input: PathBuf,

        /// Transform graph definition
        #[arg(short, long)]
        graph: Option<PathBuf>,

        /// Organization the job runs for
        #[arg(long)]
        org: Option<Uuid>,

        /// Billing plan, selects the rate-limit quota
        #[arg(long, default_value = "developer")]
        plan: String,

        /// Worker count (overrides SYNC_WORKER_COUNT)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stream capacity (overrides SYNC_STREAM_CAPACITY)
        #[arg(short, long)]
        capacity: Option<usize>,
    },

    /// Build a transform graph and print its routes
    CheckGraph {
        #[arg(short, long)]
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("syncflow")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run {
            input,
            graph,
            org,
            plan,
            workers,
            capacity,
        } => {
            let mut config = SyncConfig::from_env()?;
            if let Some(workers) = workers {
                config.worker_count = workers;
            }
            if capacity.is_some() {
                config.stream_capacity = capacity;
            }
            config.validate()?;
            run(config, input, graph, org.unwrap_or_else(Uuid::new_v4), plan).await
        },
        Command::CheckGraph { graph } => check_graph(graph),
    }
}

async fn run(
    config: SyncConfig,
    input: PathBuf,
    graph: Option<PathBuf>,
    organization_id: Uuid,
    plan: String,
) -> Result<()> {
    let graph = match graph {
        Some(path) => GraphConfig::from_path(&path)?,
        None => GraphConfig::default(),
    };

    let dimensions = default_vector_size(&config.embedding);
    let embedder: Arc<dyn Embedder> = if config.embedding.api_key.is_some() {
        Arc::new(OpenAiEmbedder::from_config(&config.embedding)?)
    } else {
        Arc::new(HashingEmbedder::new(dimensions))
    };
    let memory = Arc::new(InMemoryDestination::new(dimensions));

    let mut connectors = ConnectorRegistry::with_builtins();
    connectors.register_memory_destination("memory", memory.clone());

    let config = Arc::new(config);
    let supervisor = Arc::new(JobSupervisor::new(
        config.clone(),
        Arc::new(RateLimiter::in_memory(config.rate_limit.clone())),
        Arc::new(ProgressHub::new(config.progress.channel_capacity)),
        Arc::new(StaticLiveness::default()),
    ));
    let service = SyncService::new(
        supervisor,
        connectors,
        NodeRegistry::with_builtins(),
        Arc::new(InMemoryStateProvider::new()),
        embedder,
    );

    let source = ConnectorRef::new("jsonl").with_config(serde_json::json!({
        "path": input.to_string_lossy(),
    }));
    let spec = JobSpec::new(organization_id, source, ConnectorRef::new("memory"))
        .with_plan(plan)
        .with_graph(graph);

    info!(input = %input.display(), collection = memory.collection(), "Starting sync");
    let job_id = service.start(spec).context("Job rejected")?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut progress = service.subscribe(job_id);
    let bar = pb.clone();
    let watcher = tokio::spawn(async move {
        while let Some(snapshot) = progress.next().await {
            bar.set_message(format!(
                "produced {} | inserted {} updated {} kept {} skipped {} failed {}",
                snapshot.produced,
                snapshot.inserted,
                snapshot.updated,
                snapshot.kept,
                snapshot.skipped,
                snapshot.failed,
            ));
        }
    });

    let report = service.wait(job_id).await?;
    watcher.abort();
    pb.finish_and_clear();

    let snapshot = &report.snapshot;
    println!("Job {} {}", report.job.id, report.status());
    println!(
        "  produced {}  inserted {}  updated {}  kept {}  skipped {}  failed {}  deleted {}",
        snapshot.produced,
        snapshot.inserted,
        snapshot.updated,
        snapshot.kept,
        snapshot.skipped,
        snapshot.failed,
        snapshot.deleted,
    );
    println!(
        "  workers {}  capacity {}  peak in flight {}  stream high water {}",
        report.stats.workers,
        report.stats.stream_capacity,
        report.stats.peak_in_flight,
        report.stats.stream_high_water,
    );
    println!("  {} points in {}", memory.len().await, memory.collection());

    match report.status() {
        JobStatus::Succeeded => Ok(()),
        status => anyhow::bail!(
            "Job ended {}: {}",
            status,
            report.failure_reason.as_deref().unwrap_or("no reason recorded")
        ),
    }
}

fn check_graph(path: PathBuf) -> Result<()> {
    let config = GraphConfig::from_path(&path)?;
    let graph = TransformGraph::build(&config, &NodeRegistry::with_builtins())
        .with_context(|| format!("Invalid graph {}", path.display()))?;

    for record_type in graph.routed_types() {
        let chain: Vec<&str> = graph
            .route(record_type)
            .iter()
            .map(|node| node.name.as_str())
            .collect();
        println!("{record_type}: {}", chain.join(" -> "));
    }
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use job_orchestrator::api::{run_api, ApiState};
use job_orchestrator::config::{load_dotenv, AppConfig, LockConfig, StoreConfig};
use job_orchestrator::lock::{DistributedLock, InMemoryLock};
use job_orchestrator::metrics::{MetricsSink, SchedulerMetrics};
use job_orchestrator::notify::{EmailNotifier, LogNotifier, NotificationHub, WebhookNotifier};
use job_orchestrator::scheduler::trigger::upcoming_by_job;
use job_orchestrator::scheduler::{validate_definitions, Collaborators, Scheduler};
use job_orchestrator::shutdown::install_shutdown_handler;
use job_orchestrator::store::{JobStore, JsonFileStore, MemoryJobStore};
use job_orchestrator::worker::DockerBackend;

#[derive(Parser, Debug)]
#[command(name = "job-orchestrator")]
#[command(version)]
#[command(about = "Cron-driven scheduler for containerised training jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler, its workers and the HTTP API
    Serve(ConfigArgs),

    /// Check a config file and its job graph without starting anything
    Validate(ConfigArgs),

    /// Print the upcoming fire times of every configured job
    Next {
        #[command(flatten)]
        config: ConfigArgs,

        /// Instants to show per job
        #[arg(long, short = 'n', default_value = "5")]
        count: usize,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Path to the YAML config file
    #[arg(long, short = 'c', env = "ORCHESTRATOR_CONFIG", default_value = "orchestrator.yaml")]
    config: PathBuf,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct UpcomingOutput {
    job_id: String,
    next: Vec<DateTime<Utc>>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn build_lock(config: &LockConfig) -> anyhow::Result<Arc<dyn DistributedLock>> {
    match config {
        LockConfig::Memory => Ok(Arc::new(InMemoryLock::new())),
        #[cfg(feature = "redis-lock")]
        LockConfig::Redis { url } => {
            let lock = job_orchestrator::lock::RedisLock::connect(url).await?;
            Ok(Arc::new(lock))
        }
        #[cfg(not(feature = "redis-lock"))]
        LockConfig::Redis { .. } => {
            anyhow::bail!("redis lock configured but this binary was built without the redis-lock feature")
        }
    }
}

async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryJobStore::new())),
        StoreConfig::File { dir } => Ok(Arc::new(JsonFileStore::open(dir.clone()).await?)),
    }
}

fn build_notifier(
    config: &AppConfig,
    metrics: Arc<dyn MetricsSink>,
) -> anyhow::Result<NotificationHub> {
    let mut hub = NotificationHub::new(config.scheduler.notify_timeout(), metrics)
        .with_channel(Arc::new(LogNotifier));
    if let Some(url) = &config.notifications.webhook_url {
        let webhook = WebhookNotifier::new(url.clone(), config.scheduler.notify_timeout())
            .context("invalid webhook notification settings")?;
        hub = hub.with_channel(Arc::new(webhook));
    }
    if let Some(email) = &config.notifications.email {
        let notifier = EmailNotifier::new(email, config.scheduler.notify_timeout())
            .context("invalid email notification settings")?;
        hub = hub.with_channel(Arc::new(notifier));
    }
    Ok(hub)
}

// =============================================================================
// Serve
// =============================================================================

async fn run_serve(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    init_tracing(&config.log_level);

    let metrics = Arc::new(SchedulerMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let notifier = Arc::new(build_notifier(&config, sink.clone())?);

    let collaborators = Collaborators {
        backend: Arc::new(DockerBackend::new(config.backend.clone())),
        store: build_store(&config.store).await?,
        notifier: notifier.clone(),
        lock: build_lock(&config.lock).await?,
        metrics: sink,
    };

    tracing::info!(
        instance_id = %config.scheduler.instance_id,
        max_workers = config.scheduler.max_workers,
        lock = collaborators.lock.backend_name(),
        notifiers = ?notifier.channel_names(),
        jobs = config.jobs.len(),
        "Starting job orchestrator"
    );

    let scheduler = Arc::new(Scheduler::new(&config, collaborators));
    for definition in config.jobs.iter().cloned() {
        let job_id = definition.job_id.clone();
        scheduler
            .register_definition(definition)
            .await
            .with_context(|| format!("failed to register job {job_id}"))?;
    }
    scheduler.start().await?;

    let shutdown = install_shutdown_handler();

    let api_handle = if config.api.enabled {
        let state = ApiState {
            scheduler: scheduler.clone(),
            metrics,
        };
        let addr = config.api.listen_addr;
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_api(addr, state, token).await {
                tracing::error!(addr = %addr, error = %e, "API server failed");
            }
        }))
    } else {
        None
    };

    shutdown.cancelled().await;
    scheduler.shutdown().await;
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "API task ended abnormally");
        }
    }
    tracing::info!("Job orchestrator stopped");
    Ok(())
}

// =============================================================================
// Offline Commands
// =============================================================================

fn run_validate(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let registry = validate_definitions(&config.jobs, config.retry.default_max_retries)?;

    println!("Config OK: {}", args.config.display());
    println!("{}", "=".repeat(40));
    println!("Workers:     {}", config.scheduler.max_workers);
    println!("Queue depth: {}", config.scheduler.max_queue_depth);
    println!("Jobs:        {}", registry.len());
    println!();
    if !registry.is_empty() {
        println!("{:<24} {:<10} {:<20} DEPENDS ON", "JOB ID", "PRIORITY", "SCHEDULE");
        println!("{}", "-".repeat(78));
        for scheduled in registry.all() {
            let deps = if scheduled.dependencies.is_empty() {
                "-".to_string()
            } else {
                scheduled
                    .dependencies
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(",")
            };
            println!(
                "{:<24} {:<10} {:<20} {}",
                scheduled.id(),
                scheduled.priority.to_string(),
                scheduled.job.schedule,
                deps
            );
        }
    }
    Ok(())
}

fn run_next(args: ConfigArgs, count: usize, output: &OutputFormat) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let upcoming = upcoming_by_job(&config.jobs, Utc::now(), count)?;

    match output {
        OutputFormat::Json => {
            let output: Vec<UpcomingOutput> = upcoming
                .into_iter()
                .map(|(job_id, next)| UpcomingOutput { job_id, next })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if upcoming.is_empty() {
                println!("No jobs configured.");
                return Ok(());
            }
            println!("{:<24} NEXT FIRE (UTC)", "JOB ID");
            println!("{}", "-".repeat(50));
            for (job_id, instants) in upcoming {
                for (i, instant) in instants.iter().enumerate() {
                    let label = if i == 0 { job_id.as_str() } else { "" };
                    println!("{:<24} {}", label, instant.format("%Y-%m-%d %H:%M:%S"));
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let args = Args::parse();

    match args.command {
        Commands::Serve(config) => run_serve(config).await?,
        Commands::Validate(config) => {
            init_tracing("warn");
            run_validate(config)?;
        }
        Commands::Next {
            config,
            count,
            output,
        } => {
            init_tracing("warn");
            run_next(config, count, &output)?;
        }
    }

    Ok(())
}

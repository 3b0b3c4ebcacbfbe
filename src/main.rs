use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use linksite::broadcast::{ChannelBroadcaster, EventBroadcaster, NoopBroadcaster};
use linksite::config::{Config, ScoreWeights, WeightKey};
use linksite::director::{self, Director};
use linksite::models::{NewTask, PriorityClass, TaskStatus, TaskType};
use linksite::ratelimit::BackoffStore;
use linksite::storage::{create_sqlite_store, SharedStore};
use linksite::worker::{BudgetGuard, PriorityWorker};

#[derive(Parser)]
#[command(
    name = "linksite",
    version,
    about = "Rotation director and priority enrichment worker for a community link board",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the director and the worker until interrupted
    Run {
        /// Only run the rotation director
        #[arg(long, conflicts_with = "worker_only")]
        director_only: bool,

        /// Only run the enrichment worker
        #[arg(long)]
        worker_only: bool,
    },

    /// Run a single director tick
    Tick {
        /// Also run a single worker tick
        #[arg(long, default_value = "false")]
        with_worker: bool,
    },

    /// End the current rotation; the next tick picks a new candidate
    Skip,

    /// Recompute candidate, source and tag scores from votes
    Propagate,

    /// Print rotation, backoff, queue and budget state as JSON
    Status {
        /// Append Prometheus metrics in text format
        #[arg(long, default_value = "false")]
        metrics: bool,
    },

    /// Queue an enrichment task for a candidate
    Enqueue {
        /// Candidate id
        candidate_id: i64,

        /// Task type (summarize, reddit_discussions, hn_discussions)
        #[arg(short = 't', long = "type")]
        task_type: TaskType,

        /// Priority class (reverse_lookup, user_submitted, recently_ingested, backlog)
        #[arg(short, long, default_value = "user_submitted")]
        priority: PriorityClass,
    },

    /// Inspect or change score weights
    Weights {
        #[command(subcommand)]
        action: WeightsAction,
    },
}

#[derive(Subcommand)]
enum WeightsAction {
    /// List every weight with its effective and default value
    List,

    /// Store a new value for one weight
    Set {
        /// Weight key, e.g. rotation_default_sec
        key: WeightKey,

        /// New value
        value: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());

    // Initialize tracing/logging
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    if let Err(e) = linksite::metrics::init_metrics() {
        tracing::warn!("Metrics initialization failed: {}", e);
    }

    let store = create_sqlite_store(&config.database.sqlite_path).with_context(|| {
        format!(
            "Failed to open database {}",
            config.database.sqlite_path.display()
        )
    })?;

    // Fail fast on bad weights; every tick re-reads them afterwards
    ScoreWeights::load(&*store).context("Invalid score weights")?;

    match cli.command {
        Commands::Run {
            director_only,
            worker_only,
        } => {
            tracing::info!(director_only, worker_only, "Starting run command");
            run(store, &config, !worker_only, !director_only).await?;
        }

        Commands::Tick { with_worker } => {
            tick(store, &config, with_worker).await?;
        }

        Commands::Skip => {
            let director = Director::new(store, Arc::new(NoopBroadcaster), config.director);
            if director.skip_at(Utc::now())? {
                println!("Rotation skipped; the next tick selects a new candidate");
            } else {
                println!("Nothing on stage");
            }
        }

        Commands::Propagate => {
            let director = Director::new(store, Arc::new(NoopBroadcaster), config.director);
            let report = director.propagate_now()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Status { metrics } => {
            status(store, &config, metrics)?;
        }

        Commands::Enqueue {
            candidate_id,
            task_type,
            priority,
        } => {
            tracing::info!(
                candidate_id,
                task_type = %task_type,
                priority = %priority,
                "Starting enqueue command"
            );
            if store.get_candidate(candidate_id)?.is_none() {
                anyhow::bail!("Candidate {candidate_id} does not exist");
            }
            match store.enqueue(&NewTask::new(candidate_id, task_type, priority))? {
                Some(id) => println!("Queued task {id}"),
                None => {
                    println!("An active {task_type} task already exists for {candidate_id}")
                }
            }
        }

        Commands::Weights { action } => weights(store, action)?,
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("linksite=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("linksite={level},warn"))
        })
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn run(
    store: SharedStore,
    config: &Config,
    with_director: bool,
    with_worker: bool,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broadcaster: Arc<dyn EventBroadcaster> = Arc::new(ChannelBroadcaster::default());

    let mut handles = Vec::new();

    if with_director {
        let director = Director::new(store.clone(), broadcaster.clone(), config.director.clone());
        handles.push(tokio::spawn(director.run(shutdown_rx.clone())));
    }

    if with_worker {
        let worker = PriorityWorker::from_config(store.clone(), broadcaster.clone(), config)?;
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    tracing::info!("linksite running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown requested, waiting for in-flight ticks");
    shutdown_tx.send(true).ok();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Loop task panicked");
        }
    }

    tracing::info!("linksite stopped");
    Ok(())
}

async fn tick(store: SharedStore, config: &Config, with_worker: bool) -> Result<()> {
    let mut director = Director::new(
        store.clone(),
        Arc::new(NoopBroadcaster),
        config.director.clone(),
    );
    let outcome = director.tick();
    let action = outcome.result?;
    println!("{}", serde_json::to_string_pretty(&action)?);

    if with_worker {
        let worker = PriorityWorker::from_config(store, Arc::new(NoopBroadcaster), config)?;
        worker.recover()?;
        let outcome = worker.tick().await;
        println!("{:#?}", outcome.result?);
    }

    Ok(())
}

fn status(store: SharedStore, config: &Config, with_metrics: bool) -> Result<()> {
    let now = Utc::now();
    let rotation = store.load_rotation()?;
    let remaining_secs = director::remaining(&rotation, now).map(|d| d.num_seconds());

    let backoff = BackoffStore::new(store.clone());
    let apis = config
        .apis
        .quotas()
        .into_iter()
        .map(|(api, _)| backoff.status_at(api, now))
        .collect::<linksite::error::Result<Vec<_>>>()?;

    let queue = store.queue_counts()?;
    let budget = BudgetGuard::new(store.clone(), config.worker.monthly_budget_usd);

    let snapshot = serde_json::json!({
        "rotation": rotation,
        "remaining_secs": remaining_secs,
        "apis": apis,
        "queue": {
            "pending": queue.get(TaskStatus::Pending),
            "in_progress": queue.get(TaskStatus::InProgress),
            "done": queue.get(TaskStatus::Done),
            "failed": queue.get(TaskStatus::Failed),
        },
        "ai_budget": {
            "spent_usd": budget.spent_at(now)?,
            "limit_usd": budget.monthly_limit_usd(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if with_metrics {
        let text = linksite::metrics::gather_metrics()
            .map_err(|e| anyhow::anyhow!("Failed to gather metrics: {e}"))?;
        println!("{text}");
    }

    Ok(())
}

fn weights(store: SharedStore, action: WeightsAction) -> Result<()> {
    match action {
        WeightsAction::List => {
            let weights = ScoreWeights::load(&*store)?;
            for key in WeightKey::ALL {
                println!(
                    "{:<28} {:>10} (default {})",
                    key.name(),
                    weights.get(key),
                    key.default_value()
                );
            }
        }
        WeightsAction::Set { key, value } => {
            let mut weights = ScoreWeights::load(&*store)?;
            weights.set(key, value);
            weights.validate()?;
            store.set_score_weight(key.name(), value)?;
            tracing::info!(key = %key, value, "Score weight updated");
            println!("{key} = {value}");
        }
    }
    Ok(())
}

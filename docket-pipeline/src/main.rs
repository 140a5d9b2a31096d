//! docket - document job pipeline
//!
//! One binary, several roles:
//! - `docket serve` runs the HTTP API (optionally with in-process workers)
//! - `docket worker <stage>` runs one stage consumer
//! - `docket sync` migrates completed jobs into the structured store
//! - `docket queues` prints queue depths
//!
//! Any number of processes may share the same data directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket_common::config::TomlConfig;
use docket_common::db::{init_archive_store, init_broker_store, init_pending_store, ConnectRetry};
use docket_common::events::EventBus;
use docket_common::messages::{ANALYSIS_QUEUE, INTAKE_QUEUE, RESULTS_QUEUE};
use docket_pipeline::broker::{MessageBroker, SqliteBroker};
use docket_pipeline::coordinator::Coordinator;
use docket_pipeline::db::{Archive, Ledger};
use docket_pipeline::migration::MigrationEngine;
use docket_pipeline::stages::{FileTextExtractor, HttpScorer};
use docket_pipeline::staging::StagingArea;
use docket_pipeline::workers::{Consumer, ExtractHandler, MessageHandler, ScoreHandler, StoreHandler};
use docket_pipeline::AppState;

#[derive(Parser, Debug)]
#[command(name = "docket")]
#[command(about = "Document job pipeline coordinator")]
#[command(version)]
struct Args {
    /// Bootstrap config file
    #[arg(short, long, global = true, env = "DOCKET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Overrides the configured port
        #[arg(short, long)]
        port: Option<u16>,

        /// Also run one consumer per stage in this process
        #[arg(long)]
        with_workers: bool,
    },
    /// Run a single stage consumer
    Worker {
        #[arg(value_enum)]
        stage: Stage,
    },
    /// Migrate completed jobs into the structured store
    Sync {
        /// Job to migrate
        #[arg(required_unless_present = "all")]
        job_id: Option<String>,

        /// Migrate every complete job
        #[arg(long, conflicts_with = "job_id")]
        all: bool,
    },
    /// Show queue depths
    Queues,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Extract,
    Score,
    Store,
}

/// Stores, broker and services shared by every role
struct Components {
    config: TomlConfig,
    coordinator: Coordinator,
    migration: MigrationEngine,
    broker: Arc<dyn MessageBroker>,
    event_bus: EventBus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "docket_pipeline={level},docket_common={level},tower_http=info",
                    level = config.logging.level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("docket {}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", config.data_dir.display());

    let components = connect(config).await?;

    match args.command {
        Command::Serve { port, with_workers } => serve(components, port, with_workers).await,
        Command::Worker { stage } => run_worker(components, stage).await,
        Command::Sync { job_id, all } => sync(components, job_id, all).await,
        Command::Queues => print_queues(components).await,
    }
}

async fn connect(config: TomlConfig) -> Result<Components> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    let retry = ConnectRetry::new(config.broker.connect_attempts, config.connect_retry_interval());
    let lock_wait = config.stores.max_lock_wait_ms;

    let pending_pool = init_pending_store(&config.pending_db_path(), retry)
        .await
        .context("Pending store unavailable")?;
    let archive_pool = init_archive_store(&config.archive_db_path(), retry)
        .await
        .context("Structured store unavailable")?;
    let broker_pool = init_broker_store(&config.broker_db_path(), retry)
        .await
        .context("Broker unavailable")?;
    info!("Stores connected");

    let ledger = Ledger::new(pending_pool, lock_wait);
    let archive = Archive::new(archive_pool, lock_wait);
    let broker: Arc<dyn MessageBroker> = Arc::new(SqliteBroker::new(
        broker_pool,
        Duration::from_secs(config.broker.lease_secs),
        lock_wait,
    ));
    let staging = StagingArea::new(config.staging_root(), config.limits.clone());
    let event_bus = EventBus::new(100);

    let coordinator = Coordinator::new(
        ledger.clone(),
        archive.clone(),
        broker.clone(),
        staging,
        event_bus.clone(),
    );
    let migration = MigrationEngine::new(ledger, archive, event_bus.clone());

    Ok(Components {
        config,
        coordinator,
        migration,
        broker,
        event_bus,
    })
}

fn handler_for(components: &Components, stage: Stage) -> Arc<dyn MessageHandler> {
    match stage {
        Stage::Extract => Arc::new(ExtractHandler::new(
            components.broker.clone(),
            Arc::new(FileTextExtractor::new()),
        )),
        Stage::Score => Arc::new(ScoreHandler::new(
            components.broker.clone(),
            Arc::new(HttpScorer::new(components.config.scoring.endpoint.clone())),
            Duration::from_secs(components.config.scoring.rate_limit_delay_secs),
        )),
        Stage::Store => Arc::new(StoreHandler::new(components.coordinator.clone())),
    }
}

fn consumer_for(components: &Components, stage: Stage) -> Consumer {
    let consumer_id = format!("{:?}-{}", stage, uuid::Uuid::new_v4()).to_lowercase();
    Consumer::new(
        components.broker.clone(),
        handler_for(components, stage),
        consumer_id,
        Duration::from_millis(components.config.broker.poll_interval_ms),
    )
}

async fn serve(components: Components, port: Option<u16>, with_workers: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut workers = JoinSet::new();
    if with_workers {
        for stage in [Stage::Extract, Stage::Score, Stage::Store] {
            workers.spawn(consumer_for(&components, stage).run(cancel.clone()));
        }
        info!("In-process workers started");
    }

    let port = port.unwrap_or(components.config.port);
    let state = AppState::new(
        components.coordinator,
        components.migration,
        components.broker,
        components.event_bus,
    );
    let app = docket_pipeline::build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_cancel.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task failed");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn run_worker(components: Components, stage: Stage) -> Result<()> {
    let cancel = CancellationToken::new();
    let consumer = consumer_for(&components, stage);
    let task = tokio::spawn(consumer.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    let stats = task.await.context("Worker task failed")?;
    info!(?stage, processed = stats.processed, dropped = stats.dropped, "Worker exited");
    Ok(())
}

async fn sync(components: Components, job_id: Option<String>, all: bool) -> Result<()> {
    if all {
        let reports = components.migration.migrate_all_complete().await?;
        let failed = reports.iter().filter(|r| r.is_err()).count();
        for report in reports.into_iter().flatten() {
            println!("{}", serde_json::to_string(&report)?);
        }
        if failed > 0 {
            anyhow::bail!("{} job(s) failed to migrate", failed);
        }
        return Ok(());
    }

    let job_id = job_id.context("job id required")?;
    let report = components
        .migration
        .migrate(&job_id)
        .await
        .with_context(|| format!("Failed to migrate job {}", job_id))?;
    if !report.pending_deleted {
        warn!(%job_id, "Pending entry left behind; the next sync will remove it");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn print_queues(components: Components) -> Result<()> {
    for queue in [INTAKE_QUEUE, ANALYSIS_QUEUE, RESULTS_QUEUE] {
        let depth = components.broker.depth(queue).await?;
        println!("{:<20} {}", queue, depth);
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

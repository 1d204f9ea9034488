//! Quake Server - Main entry point

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, ValueEnum};
use quake_common::logging::{init_logging, LogConfig};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quake_server::{
    broker::{BrokerSettings, InMemoryBroker, MessageBroker, PgBroker, QueueNames},
    config::{BrokerBackend, Config, DatabaseConfig},
    features::{self, ApiState},
    ingest::{
        pipeline::{FieldLayout, PgRecordSink, RecordSink},
        spawn_workers, worker_identity, JobManager, JobStore, ManagerSettings, PartitionPlanner, PgJobStore,
        WorkerSettings,
    },
    middleware,
};

/// Longest a single queue receive suspends before re-checking for shutdown
const RECEIVE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Submission and status HTTP API
    Api,
    /// Job-request consumer and reply aggregation
    Manager,
    /// Partition processing
    Worker,
    /// All three in one process
    Standalone,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Api => "api",
            Role::Manager => "manager",
            Role::Worker => "worker",
            Role::Standalone => "standalone",
        }
    }

    fn serves_api(self) -> bool {
        matches!(self, Role::Api | Role::Standalone)
    }

    fn runs_manager(self) -> bool {
        matches!(self, Role::Manager | Role::Standalone)
    }

    fn runs_workers(self) -> bool {
        matches!(self, Role::Worker | Role::Standalone)
    }
}

#[derive(Debug, Parser)]
#[command(name = "quake-server", version, about = "Partitioned earthquake CSV ingestion")]
struct Args {
    /// Which part of the pipeline this process runs
    #[arg(value_enum, env = "QUAKE_ROLE", default_value_t = Role::Standalone)]
    role: Role,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix(format!("quake-{}", args.role.name()))
        .filter_directives("quake_server=debug,tower_http=debug,sqlx=warn")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!(role = args.role.name(), "Starting Quake Server");

    let config = Config::load()?;
    if config.broker.backend == BrokerBackend::Memory && args.role != Role::Standalone {
        anyhow::bail!("BROKER_BACKEND=memory only works with the standalone role");
    }

    let db_pool = connect(&config.database, &config.database.url).await?;
    info!("Database connection pool established");

    let sink_pool = match &config.database.analytics_url {
        Some(url) => {
            let pool = connect(&config.database, url).await?;
            info!("Analytics database connection pool established");
            pool
        }
        None => db_pool.clone(),
    };

    let settings = BrokerSettings::from(&config.broker);
    let queues = QueueNames::from(&config.broker);
    let broker: Arc<dyn MessageBroker> = match config.broker.backend {
        BrokerBackend::Postgres => Arc::new(PgBroker::new(db_pool.clone(), settings)),
        BrokerBackend::Memory => Arc::new(InMemoryBroker::new(settings)),
    };
    let tracker: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));

    let cancel = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    if args.role.runs_manager() {
        let manager = JobManager::new(
            broker.clone(),
            queues.clone(),
            PartitionPlanner::from_config(&config.ingest),
            tracker.clone(),
            ManagerSettings {
                reply_timeout: config.ingest.reply_timeout(),
                max_concurrent_jobs: config.ingest.max_concurrent_jobs,
                poll_wait: RECEIVE_WAIT,
            },
        );
        background.push(tokio::spawn(manager.run(cancel.clone())));
        info!("Job manager started");
    }

    if args.role.runs_workers() {
        let layout = Arc::new(FieldLayout::usgs().context("Invalid CSV field layout")?);
        let sink: Arc<dyn RecordSink> = Arc::new(PgRecordSink::new(sink_pool));
        let identity = worker_identity(config.ingest.worker_id.as_deref());
        background.extend(spawn_workers(
            config.ingest.worker_count,
            broker.clone(),
            queues.clone(),
            sink,
            layout,
            WorkerSettings {
                identity: identity.clone(),
                chunk_size: config.ingest.chunk_size,
                poll_wait: RECEIVE_WAIT,
                lease: settings.visibility_timeout,
            },
            cancel.clone(),
        ));
        info!(workers = config.ingest.worker_count, identity = %identity, "Workers started");
    }

    if args.role.serves_api() {
        let app = create_router(
            ApiState {
                broker: broker.clone(),
                queues: queues.clone(),
                tracker: tracker.clone(),
            },
            &config,
        );

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Server listening on {}", addr);

        let shutdown = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                shutdown.cancel();
            })
            .await?;
    } else {
        shutdown_signal().await;
    }

    cancel.cancel();
    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    info!("Waiting up to {} seconds for background tasks", timeout.as_secs());
    if tokio::time::timeout(timeout, futures::future::join_all(background))
        .await
        .is_err()
    {
        warn!("Background tasks did not stop in time");
    }

    info!("Server shut down gracefully");
    Ok(())
}

async fn connect(database: &DatabaseConfig, url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .min_connections(database.min_connections)
        .acquire_timeout(Duration::from_secs(database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(database.idle_timeout_secs))
        .connect(url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    info!("Database migrations completed");

    Ok(pool)
}

/// Create the application router with middleware
fn create_router(state: ApiState, config: &Config) -> Router {
    features::router(state)
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(&config.cors))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}

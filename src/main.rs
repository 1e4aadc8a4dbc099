//! finance_core - ledger core server
//!
//! Event-sourced accounts and transfers behind a thin HTTP API. Runs on
//! PostgreSQL when `DATABASE_URL` is set, in memory otherwise.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finance_core::api::{self, AppState};
use finance_core::config::LogFormat;
use finance_core::connectors::{AssetRegistry, CustodianRegistry, StaticAssetRegistry};
use finance_core::event_store::{EventBus, EventLog, InMemoryEventLog, PgEventLog};
use finance_core::handlers::{AccountService, TransferService};
use finance_core::jobs::{self, JobContext, JobScheduler, JobSchedulerConfig};
use finance_core::projection::{
    BalanceProjector, InMemoryProjectionStore, PgProjectionStore, ProjectionStore,
    ProjectorRunner,
};
use finance_core::workflow::{
    EngineConfig, InMemoryWorkflowRepository, PgWorkflowRepository, WorkflowEngine,
    WorkflowRepository,
};
use finance_core::workflows::WorkflowCatalog;
use finance_core::{db, Config};

/// Initialize tracing/logging
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "finance_core=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Storage backends chosen at startup
struct Backends {
    log: Arc<dyn EventLog>,
    workflows: Arc<dyn WorkflowRepository>,
    projections: Arc<dyn ProjectionStore>,
    pool: Option<sqlx::PgPool>,
}

async fn backends(config: &Config, bus: EventBus) -> anyhow::Result<Backends> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using in-memory backends");
        return Ok(Backends {
            log: Arc::new(InMemoryEventLog::with_bus(bus)),
            workflows: Arc::new(InMemoryWorkflowRepository::new()),
            projections: Arc::new(InMemoryProjectionStore::new()),
            pool: None,
        });
    };

    tracing::info!("Connecting to database...");
    let pool = db::connect(config, database_url).await?;

    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }
    tracing::info!("Database connected successfully");

    Ok(Backends {
        log: Arc::new(PgEventLog::new(pool.clone(), bus)),
        workflows: Arc::new(PgWorkflowRepository::new(pool.clone())),
        projections: Arc::new(PgProjectionStore::new(pool.clone())),
        pool: Some(pool),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(environment = %config.environment, "Starting finance_core server");

    let backends = backends(&config, EventBus::new(config.event_bus_capacity)).await?;

    let accounts = AccountService::new(Arc::clone(&backends.log), config.append_retry());
    let engine = WorkflowEngine::new(
        Arc::clone(&backends.workflows),
        EngineConfig::from_config(&config),
    );
    let transfers = TransferService::new(accounts.clone(), engine.clone());
    let catalog = WorkflowCatalog::new(accounts.clone(), CustodianRegistry::new());
    let projector = BalanceProjector::new(Arc::clone(&backends.projections));

    // Subscribe before anything can append
    let runner = ProjectorRunner::new(projector.clone(), Arc::clone(&backends.log)).start();

    let job_context = JobContext {
        log: Arc::clone(&backends.log),
        engine: engine.clone(),
        catalog: catalog.clone(),
        transfers: transfers.clone(),
        projector: projector.clone(),
    };

    // Finish whatever a previous run left behind before taking traffic
    match jobs::recover_workflows(&job_context).await {
        Ok(report) if report.examined > 0 => {
            tracing::info!(resumed = report.resumed, failed = report.failed, "Startup recovery done")
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Startup recovery failed"),
    }

    let scheduler =
        JobScheduler::new(job_context, JobSchedulerConfig::from_config(&config)).start();

    let assets: Arc<dyn AssetRegistry> = Arc::new(StaticAssetRegistry::default());
    let app = api::create_router(AppState {
        accounts,
        transfers,
        engine,
        catalog,
        projections: backends.projections,
        assets,
    });

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutting down...");
    scheduler.abort();
    runner.abort();
    if let Some(pool) = backends.pool {
        pool.close().await;
        tracing::info!("Database connections closed");
    }
    tracing::info!("Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

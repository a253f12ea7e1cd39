use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roost_collect::{SourceRegistry, SourceRouter};
use roost_ingest::{IngestConfig, IngestWorker, NoopAlertMatcher};
use roost_store::{ListingStore, PgStore};
use roost_web::AppState;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "roost")]
#[command(about = "Roost listing ingestion worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion worker and the observe/trigger API.
    Serve,
    /// Run one ingestion cycle and exit.
    Sync,
    /// Apply store migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Sync => sync_once(config).await,
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to store")?;
            store.run_migrations().await.context("running migrations")?;
            println!("migrations applied");
            Ok(())
        }
    }
}

async fn connect_store(config: &IngestConfig) -> Result<Arc<dyn ListingStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to store")?;
    store.run_migrations().await.context("running migrations")?;
    Ok(Arc::new(store))
}

fn build_router(config: &IngestConfig) -> Result<SourceRouter> {
    let registry = SourceRegistry::load(&config.sources_path).context("loading source registry")?;
    registry.build_router(
        Duration::from_secs(config.router_cache_ttl_secs),
        Duration::from_secs(config.http_timeout_secs),
        &config.user_agent,
    )
}

async fn serve(config: IngestConfig) -> Result<()> {
    let store = connect_store(&config).await?;
    let router = build_router(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (worker, handle) = IngestWorker::new(
        config.clone(),
        store.clone(),
        router,
        Arc::new(NoopAlertMatcher),
        shutdown_rx.clone(),
    );
    let worker_task = tokio::spawn(worker.run());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = AppState {
        store,
        worker: handle,
        freshness: config.freshness_thresholds(),
    };
    roost_web::serve(state, config.web_port, shutdown_rx).await?;

    worker_task.await.context("joining worker task")??;
    Ok(())
}

async fn sync_once(config: IngestConfig) -> Result<()> {
    let store = connect_store(&config).await?;
    let router = build_router(&config)?;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let (mut worker, _handle) = IngestWorker::new(
        config,
        store,
        router,
        Arc::new(NoopAlertMatcher),
        shutdown_rx,
    );
    let summary = worker.run_cycle().await?;
    println!(
        "cycle complete: job_id={} listings={} errors={}",
        summary.job_id, summary.total_listings, summary.error_count
    );
    Ok(())
}

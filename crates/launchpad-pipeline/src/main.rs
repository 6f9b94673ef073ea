//! Launchpad mint worker
//!
//! Drains the mint queue under the global lock and serves metrics and health
//! endpoints until interrupted.

use anyhow::Result;
use clap::Parser;
use launchpad_pipeline::config::{ChainMode, PipelineConfig};
use launchpad_pipeline::core::{CachePort, ChainClient, LaunchStore, LockStore};
use launchpad_pipeline::infrastructure::{InMemoryContainer, PostgresContainer, ServiceContainer};
use launchpad_pipeline::metrics::start_metrics_server;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "launchpad-worker")]
#[command(about = "Launchpad allocation and mint-fulfillment worker")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "launchpad.toml")]
    config: String,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,

    /// Dry run mode (validate config, check backends and exit)
    #[arg(long)]
    dry_run: bool,

    /// Use in-memory backends and a mock chain
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_exists = std::path::Path::new(&cli.config).exists();
    let mut config = PipelineConfig::load(config_exists.then_some(cli.config.as_str()))?;

    // Override log level if provided
    if let Some(log_level) = cli.log_level {
        config.monitoring.log_level = log_level;
    }

    // Initialize logging
    init_logging(&config)?;

    if !config_exists {
        warn!("Config file not found, using defaults: {}", cli.config);
    }

    info!("Starting launchpad worker");
    info!("Chain RPC: {}", config.chain.rpc_url);
    info!("Minter: {}", config.chain.minter_address);

    config.validate()?;
    info!("Configuration validated successfully");

    if cli.mock || config.chain.mode == ChainMode::Mock {
        info!("Using in-memory backends");
        let container = InMemoryContainer::in_memory(config)?;
        run(container, cli.dry_run).await
    } else {
        info!("Initializing database connections...");
        let container = PostgresContainer::connect(config).await?;
        run(container, cli.dry_run).await
    }
}

async fn run<S, C, K>(container: ServiceContainer<S, C, K>, dry_run: bool) -> Result<()>
where
    S: LaunchStore + 'static,
    C: ChainClient + 'static,
    K: CachePort + LockStore + 'static,
{
    container.health_check().await?;

    if dry_run {
        info!("Dry run mode - configuration and backends are valid, exiting");
        container.shutdown().await;
        return Ok(());
    }

    // Start metrics server if enabled
    let _metrics_server = if container.config.monitoring.metrics_port > 0 {
        info!(
            "Starting metrics server on port {}",
            container.config.monitoring.metrics_port
        );
        Some(
            start_metrics_server(
                container.config.monitoring.metrics_port,
                container.metrics.clone(),
            )
            .await?,
        )
    } else {
        None
    };

    if !container.config.worker.enabled {
        info!("Worker disabled by configuration, serving metrics only");
    }
    let mut worker = container
        .config
        .worker
        .enabled
        .then(|| container.spawn_worker());

    // Wait for shutdown signal
    info!("Launchpad worker started successfully. Press Ctrl+C to shutdown.");
    let worker_finished = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = async {
            match worker.as_mut() {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            match result {
                Ok(Ok(())) => info!("Worker finished"),
                Ok(Err(e)) => error!("Worker error: {}", e),
                Err(e) => error!("Worker task error: {}", e),
            }
            true
        }
    };

    container.shutdown().await;
    if let (false, Some(handle)) = (worker_finished, worker) {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Worker error during shutdown: {}", e),
            Err(e) => error!("Worker task error during shutdown: {}", e),
        }
    }

    info!("Shutting down launchpad worker");
    Ok(())
}

fn init_logging(config: &PipelineConfig) -> Result<()> {
    let log_level = config
        .monitoring
        .log_level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("launchpad_pipeline={},launchpad_worker={}", log_level, log_level).into());

    if config.monitoring.structured_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

//! Funk agent - container log and stats shipper
//!
//! Runs next to a Docker daemon, follows the logs and stats of every
//! running container and uploads them in batches to a funk collector.

use anyhow::{Context, Result};
use funk_agent_lib::{
    collector::{
        resolve_host, ContainerRuntime, DiscoveryWatcher, DockerRuntime, TrackerRegistry,
    },
    geo::{GeoDbUpdater, GeoIpService},
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    sync::{MessageAssembler, UploadLoop, WebSocketTransport},
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::AgentConfig::load()?;

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(fmt::layer().json())
        .init();

    info!(server = %config.funk_server, "Starting funk-agent");

    let stats_mode = config.stats_mode()?;

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::DISCOVERY).await;
    health_registry.register(components::UPLOADER).await;
    health_registry.register(components::TRANSPORT).await;

    // Initialize metrics
    let metrics = AgentMetrics::new();
    metrics.set_trackers(0);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    // Container runtime and host identity
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect().context("Failed to connect to Docker")?);
    let host = resolve_host(runtime.as_ref()).await;

    // Initialize structured logger
    let logger = StructuredLogger::new(&host);
    logger.log_startup(AGENT_VERSION, &config.funk_server, &config.log_stats);

    // Trackers follow logs from this point on
    let registry = Arc::new(TrackerRegistry::new(Arc::clone(&runtime)).with_logger(logger.clone()));

    // Message assembly with optional geo enrichment
    let mut assembler = MessageAssembler::new(config.assembler_config(&host)?);
    if config.enable_geo_ip_inject {
        health_registry.register(components::GEOIP).await;
        let geo = Arc::new(GeoIpService::new());
        let updater = GeoDbUpdater::new(
            &config.geoip_database_path,
            config.geoip_reload_interval(),
            Arc::clone(&geo),
        )
        .with_health(health_registry.clone())
        .with_logger(logger.clone());
        tokio::spawn(updater.run(shutdown_tx.subscribe()));
        assembler = assembler.with_geo(geo);
    }

    let mut uploader = UploadLoop::new(
        WebSocketTransport::new(config.transport_config()),
        Arc::clone(&registry),
        assembler,
        config.upload_config(),
    )
    .with_health(health_registry.clone())
    .with_logger(logger.clone());

    // Start health and metrics server
    let app_state = Arc::new(
        api::AppState::new(health_registry.clone(), uploader.stats_handle())
            .with_registry(Arc::clone(&registry)),
    );
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %e, "API server failed");
        }
    });

    // Translate Ctrl-C into a shutdown broadcast
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        let _ = signal_tx.send(());
    });

    // Nothing else starts before the collector accepts a connection
    if !uploader.connect_until_ready(&mut shutdown_rx).await {
        logger.log_shutdown("SIGINT received before connecting");
        registry.shutdown();
        return Ok(());
    }

    // Discovery feeds the registry
    let (updates_tx, updates_rx) = mpsc::channel(16);
    let _watcher = DiscoveryWatcher::new(Arc::clone(&runtime), updates_tx)
        .with_health(health_registry.clone())
        .start(shutdown_tx.subscribe())
        .await?;
    let registry_task = tokio::spawn(Arc::clone(&registry).run(updates_rx, shutdown_tx.subscribe()));

    let upload_task = tokio::spawn(uploader.run(shutdown_tx.subscribe()));
    info!(stats_mode = ?stats_mode, "Agent running");

    // Wait for shutdown signal
    let _ = shutdown_rx.recv().await;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    if let Err(e) = upload_task.await {
        warn!(error = %e, "Upload loop ended abnormally");
    }
    if let Err(e) = registry_task.await {
        warn!(error = %e, "Tracker registry ended abnormally");
    }
    registry.shutdown();

    Ok(())
}

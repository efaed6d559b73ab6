//! wampd - WAMP dealer
//!
//! A TCP router offering routed remote procedure calls between sessions.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wampd_server::{
    run_metrics_server, Config, EventFilter, Metrics, Server, ServerConfig, TimeoutSweeper,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if WAMPD_CONFIG is set, then env overrides)
    let config_path = std::env::var("WAMPD_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid environment overrides ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting wampd");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Realm: {}", config.realm.name);
    tracing::info!("  Wire mode: {}", config.network.wire_mode.as_str());
    tracing::info!(
        "  Dealer: cancel={}, fan_out={}, disclose_caller={}, meta_api={}",
        config.dealer.default_cancel_mode,
        config.dealer.fan_out,
        config.dealer.disclose_caller,
        config.dealer.meta_api
    );

    let mut server_config = ServerConfig::from_config(&config);

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config));

    // Spawn metrics server
    let metrics_handle = metrics.clone().map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        })
    });

    // Log registration meta events at debug level
    let _event_logger = server.broadcaster().spawn_logger(EventFilter::default());

    // Spawn timeout sweeper
    let mut sweeper = TimeoutSweeper::new(server.dealer().clone(), config.dealer.timeout_sweep());
    if let Some(metrics) = metrics {
        sweeper = sweeper.with_metrics(metrics);
    }
    let sweeper = Arc::new(sweeper);
    let sweeper_handle = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move {
            sweeper.run().await;
        })
    };

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_sweeper = sweeper.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        shutdown_sweeper.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let _ = sweeper_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    let stats = server.dealer().stats().total().snapshot();
    tracing::info!(
        "Server stopped ({} calls, {} completed, {} errored, {} canceled)",
        stats.attempted,
        stats.completed,
        stats.errored,
        stats.canceled
    );
    Ok(())
}

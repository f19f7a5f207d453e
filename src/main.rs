//! chartd - Statechart Orchestration Service
//!
//! Hosts statechart definitions and running instances behind an HTTP API,
//! routing delayed sends between them and streaming transitions to subscribers.

use chartd_server::{BackendKind, Config, Server, ServerConfig, Service};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if CHARTD_CONFIG is set, then env overrides)
    let config_path = std::env::var("CHARTD_CONFIG").ok();
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
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("Configuration error: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting chartd");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Workspace: {}", config.storage.workspace_dir.display());
    tracing::info!("  Entry document: {}", config.storage.entry_document);
    match config.storage.backend {
        BackendKind::None => tracing::info!("  Storage backend: none (URLs only)"),
        BackendKind::Local => tracing::info!(
            "  Storage backend: local ({})",
            config.storage.local_root.display()
        ),
        BackendKind::ObjectStore => tracing::info!(
            "  Storage backend: object store ({})",
            config.storage.object_store.endpoint.as_deref().unwrap_or("-")
        ),
    }
    if config.routing.enabled {
        match config.routing.self_endpoint {
            Some(ref endpoint) => tracing::info!("  Routing: enabled (loopback via {})", endpoint),
            None => tracing::info!("  Routing: enabled (loopback in-process)"),
        }
    } else {
        tracing::info!("  Routing: disabled");
    }
    tracing::info!(
        "  Metrics: {}",
        if config.metrics.enabled { "enabled (/metrics)" } else { "disabled" }
    );

    let service = Arc::new(Service::from_config(&config).await?);
    let server = Arc::new(Server::new(ServerConfig::from_config(&config), service.clone()));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_service = service.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        // Ends open change streams so connections can drain.
        shutdown_service.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

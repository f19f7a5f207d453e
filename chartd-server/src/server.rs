//! HTTP listener.

use crate::api::Api;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::service::Service;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Time allowed for a client to send request headers.
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub metrics_enabled: bool,
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            metrics_enabled: config.metrics.enabled,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Connection counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connection_errors: AtomicU64,
}

/// Serves the API over HTTP/1.1.
pub struct Server {
    config: ServerConfig,
    api: Api,
    metrics: Arc<Metrics>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, service: Arc<Service>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let metrics = service.metrics().clone();
        let api = Api::new(service).with_metrics_enabled(config.metrics_enabled);
        Self {
            config,
            api,
            metrics,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serves on an already bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            self.metrics.connections_total.inc();
                            self.metrics.connections_active.inc();

                            let api = self.api.clone();
                            let stats = self.stats.clone();
                            let metrics = self.metrics.clone();
                            let header_timeout = self.config.idle_timeout;
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                tracing::debug!("Client connected: {}", addr);

                                let io = TokioIo::new(tcp_stream);
                                let service = service_fn(move |req| {
                                    let api = api.clone();
                                    async move { api.handle(req).await }
                                });
                                let conn = http1::Builder::new()
                                    .timer(TokioTimer::new())
                                    .header_read_timeout(header_timeout)
                                    .serve_connection(io, service);
                                tokio::pin!(conn);

                                let result = tokio::select! {
                                    result = conn.as_mut() => result,
                                    _ = conn_shutdown.recv() => {
                                        conn.as_mut().graceful_shutdown();
                                        conn.as_mut().await
                                    }
                                };

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                metrics.connections_active.dec();
                                tracing::debug!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting and asks open connections to finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::TRAFFIC_LIGHT;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    async fn start() -> (TempDir, Arc<Server>, SocketAddr) {
        let dir = TempDir::new().unwrap();
        let service = Service::builder()
            .with_workspace_dir(dir.path().join("ws"))
            .build()
            .await
            .unwrap();
        let config = ServerConfig {
            metrics_enabled: true,
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(config, Arc::new(service)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.run_with_listener(listener).await });

        (dir, server, addr)
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let (_dir, server, addr) = start().await;
        let client = reqwest::Client::new();
        let base = format!("http://{}/api/v1", addr);

        let response = client
            .put(format!("{}/light", base))
            .body(TRAFFIC_LIGHT)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);

        let response = client
            .post(format!("{}/light", base))
            .json(&json!({ "id": "one" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);

        let configuration: Value = client
            .post(format!("{}/light/one", base))
            .json(&json!({ "name": "system.start" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(configuration, json!(["red"]));

        let response = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        assert!(server.is_running());
        assert!(server.stats().connections_total.load(Ordering::Relaxed) >= 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let (_dir, server, _addr) = start().await;
        tokio::task::yield_now().await;

        for _ in 0..50 {
            if server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.is_running());

        server.shutdown();
        for _ in 0..50 {
            if !server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.is_running());
    }
}

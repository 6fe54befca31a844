//! Daemon Server Implementation
//!
//! The accept loop for the stylecast daemon:
//! - Accepts TCP connections and upgrades them to WebSocket
//! - Spawns one [`ConnectionHandler`] task per connection
//! - Tracks active connections and refuses new ones past the limit
//! - Aborts every connection on shutdown
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       browser         browser         script
//!       (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!       Session         Session         Session
//!          └───────────────┼───────────────┘
//!                          │
//!                Arc<dyn StyleEngine>
//! ```
//!
//! Sessions share nothing but the engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Notify};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn, Instrument};

use stylecast_core::{ConnectionHandler, ConnectionId, HandlerConfig, StyleEngine, StylecastConfig};

/// Upper bound on the WebSocket opening handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote address
    peer: SocketAddr,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_address: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Maximum WebSocket message and frame size in bytes
    pub max_message_size: usize,
    /// Per-connection streaming settings
    pub handler: HandlerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&StylecastConfig::default())
    }
}

impl From<&StylecastConfig> for ServerConfig {
    fn from(config: &StylecastConfig) -> Self {
        Self {
            bind_address: config.server.bind_address.clone(),
            max_connections: config.server.max_connections,
            max_message_size: config.server.max_message_size,
            handler: HandlerConfig::from(&config.stream),
        }
    }
}

impl ServerConfig {
    fn websocket_config(&self) -> WebSocketConfig {
        let mut ws = WebSocketConfig::default();
        ws.max_message_size = Some(self.max_message_size);
        ws.max_frame_size = Some(self.max_message_size);
        ws
    }
}

/// Lifetime counters for the server
#[derive(Debug, Default)]
struct ServerTotals {
    accepted: AtomicU64,
    refused: AtomicU64,
    handshake_failures: AtomicU64,
    transport_errors: AtomicU64,
}

/// The main daemon server
pub struct DaemonServer {
    /// Server configuration
    config: ServerConfig,
    /// Engine shared by every session
    engine: Arc<dyn StyleEngine>,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    totals: Arc<ServerTotals>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(config: ServerConfig, engine: Arc<dyn StyleEngine>) -> Self {
        Self {
            config,
            engine,
            connection_states: Arc::new(DashMap::new()),
            totals: Arc::new(ServerTotals::default()),
        }
    }

    /// Bind the configured address and serve until `shutdown` is notified
    pub async fn run(&mut self, shutdown: Arc<Notify>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_address))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&mut self, listener: TcpListener, shutdown: Arc<Notify>) -> Result<()> {
        let local = listener
            .local_addr()
            .context("Failed to read listener address")?;
        info!(address = %local, max_connections = self.config.max_connections, "Listening for connections");

        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.notified() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            // Check connection limit
            if self.connection_states.len() >= self.config.max_connections {
                self.totals.refused.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }

            let conn_id = ConnectionId::new();
            self.totals.accepted.fetch_add(1, Ordering::Relaxed);
            info!(
                conn_id = %conn_id,
                peer = %peer,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            // The task waits until it is tracked, so its own removal cannot
            // run before the insert below.
            let (registered_tx, registered_rx) = oneshot::channel();
            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    self.config.clone(),
                    Arc::clone(&self.engine),
                    Arc::clone(&self.connection_states),
                    Arc::clone(&self.totals),
                    registered_rx,
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            let _ = registered_tx.send(());
        }

        self.shutdown().await;
        Ok(())
    }

    /// Upgrade one TCP stream and run its session to completion
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: TcpStream,
        config: ServerConfig,
        engine: Arc<dyn StyleEngine>,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
        totals: Arc<ServerTotals>,
        registered: oneshot::Receiver<()>,
    ) {
        // Sender dropped means the server is going away
        if registered.await.is_err() {
            return;
        }

        let upgrade = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_async_with_config(stream, Some(config.websocket_config())),
        )
        .await;

        match upgrade {
            Ok(Ok(ws)) => {
                debug!("WebSocket handshake complete");
                let handler = ConnectionHandler::new(conn_id, config.handler, engine);
                if let Err(e) = handler.run(ws).await {
                    totals.transport_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Connection ended with transport error");
                }
            }
            Ok(Err(e)) => {
                totals.handshake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "WebSocket handshake failed");
            }
            Err(_) => {
                totals.handshake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(timeout = ?HANDSHAKE_TIMEOUT, "WebSocket handshake timed out");
            }
        }

        connection_states.remove(&conn_id);
        info!(
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) {
        info!(
            active_connections = self.connection_count(),
            "Initiating graceful shutdown"
        );

        // Abort all connection handlers
        for (conn_id, stats) in self.connection_stats() {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id = %conn_id,
                    peer = %stats.peer,
                    uptime_secs = stats.uptime_secs,
                    "Aborting connection"
                );
                conn_state.abort_handle.abort();
            }
        }

        // Give aborted handlers a moment to drop their sessions
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!(
            accepted = self.totals.accepted.load(Ordering::Relaxed),
            refused = self.totals.refused.load(Ordering::Relaxed),
            handshake_failures = self.totals.handshake_failures.load(Ordering::Relaxed),
            transport_errors = self.totals.transport_errors.load(Ordering::Relaxed),
            "Shutdown complete"
        );
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let conn_state = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        peer: conn_state.peer,
                        uptime_secs: conn_state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Remote address
    pub peer: SocketAddr,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use stylecast_core::{ColorTransferEngine, FrameRateConfig};
    use tokio_tungstenite::tungstenite::Message;

    async fn start(config: ServerConfig) -> (SocketAddr, Arc<Notify>, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let mut server = DaemonServer::new(config, Arc::new(ColorTransferEngine::default()));
        let notify = Arc::clone(&shutdown);
        let task = tokio::spawn(async move { server.serve(listener, notify).await });
        (addr, shutdown, task)
    }

    fn png_frame(shade: u8) -> Vec<u8> {
        let image = image::RgbImage::from_pixel(4, 4, image::Rgb([shade, shade, shade]));
        let mut out = std::io::Cursor::new(Vec::new());
        image.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.handler = config.handler.with_rate(FrameRateConfig::disabled());
        config
    }

    #[test]
    fn test_server_config_from_stylecast_config() {
        let mut stylecast = StylecastConfig::default();
        stylecast.server.max_connections = 3;
        stylecast.server.max_message_size = 1024;
        stylecast.stream.default_model = "sanet".into();

        let config = ServerConfig::from(&stylecast);
        assert_eq!(config.bind_address, "127.0.0.1:8765");
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.handler.default_model, "sanet");

        let ws = config.websocket_config();
        assert_eq!(ws.max_message_size, Some(1024));
        assert_eq!(ws.max_frame_size, Some(1024));
    }

    #[tokio::test]
    async fn test_serves_passthrough_frames() {
        let (addr, shutdown, task) = start(test_config()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/stream"))
            .await
            .unwrap();
        let frame = png_frame(40);
        ws.send(Message::Binary(frame.clone())).await.unwrap();
        assert_eq!(ws.next().await.unwrap().unwrap(), Message::Binary(frame));

        ws.close(None).await.unwrap();
        shutdown.notify_one();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_refuses_connections_over_limit() {
        let mut config = test_config();
        config.max_connections = 1;
        let (addr, shutdown, task) = start(config).await;

        let (mut first, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        // Round trip so the first connection is registered
        first
            .send(Message::Text(r#"{"type":"set_model","model":"sanet"}"#.into()))
            .await
            .unwrap();
        let frame = png_frame(0);
        first.send(Message::Binary(frame.clone())).await.unwrap();
        assert_eq!(first.next().await.unwrap().unwrap(), Message::Binary(frame));

        let second = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await;
        assert!(second.is_err(), "second connection should be refused");

        shutdown.notify_one();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_with_open_connection() {
        let (addr, shutdown, task) = start(test_config()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();

        // The aborted session drops the socket
        let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("connection left open");
        assert!(!matches!(next, Some(Ok(Message::Binary(_)))));
    }
}

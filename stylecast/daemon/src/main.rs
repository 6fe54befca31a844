//! Stylecast Daemon - Live Video Style Transfer Server
//!
//! Accepts WebSocket connections, streams frames through the stylecast core
//! and returns restyled frames.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:8765)
//! stylecast-daemon
//!
//! # Listen on all interfaces at 10 fps
//! stylecast-daemon --bind 0.0.0.0:8765 --max-fps 10
//!
//! # With config file
//! stylecast-daemon --config /etc/stylecast/stylecast.toml
//!
//! # Verbose logging
//! RUST_LOG=debug stylecast-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `STYLECAST_CONFIG`: Configuration file path
//! - `STYLECAST_BIND`, `STYLECAST_MAX_FPS`, `STYLECAST_DEFAULT_MODEL`,
//!   `STYLECAST_TRANSFORM_TIMEOUT_MS`, `STYLECAST_MAX_CONNECTIONS`,
//!   `STYLECAST_MAX_MESSAGE_SIZE`: override the config file
//! - `RUST_LOG`: Log filter (overrides `--log-level`)
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use stylecast_core::{
    default_config_path, load_config_from_path, ColorTransferEngine, ConfigOverrides, StyleEngine,
    StylecastConfig,
};

use server::{DaemonServer, ServerConfig};

/// Stylecast Daemon - live video style transfer over WebSocket
#[derive(Parser, Debug)]
#[command(name = "stylecast-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "STYLECAST_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<String>,

    /// Frames-per-second ceiling per connection (0 = unlimited)
    #[arg(long, value_name = "FPS")]
    max_fps: Option<f64>,

    /// Model new sessions start with
    #[arg(long, value_name = "MODEL")]
    default_model: Option<String>,

    /// Per-frame transform timeout in milliseconds (0 = none)
    #[arg(long, value_name = "MS")]
    transform_timeout_ms: Option<u64>,

    /// Maximum concurrent connections
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "STYLECAST_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_address: self.bind.clone(),
            max_fps: self.max_fps,
            default_model: self.default_model.clone(),
            transform_timeout_ms: self.transform_timeout_ms,
            max_connections: self.max_connections,
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "stylecast_daemon={level},stylecast_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Resolve configuration: defaults, file, environment, then CLI
fn resolve_config(args: &Args) -> Result<StylecastConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.clone())
        .with_context(|| format!("Failed to load configuration from {path:?}"))?;

    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(source = %config.source(), file = ?config.config_file_path, "Configuration resolved");
    Ok(config)
}

/// Wait for SIGINT or SIGTERM, then wake the server
fn spawn_signal_handler(shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
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
            () = ctrl_c => info!("Received SIGINT, initiating shutdown"),
            () = terminate => info!("Received SIGTERM, initiating shutdown"),
        }

        // notify_one stores a permit if the accept loop is not waiting yet
        shutdown.notify_one();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Stylecast daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;

    let engine = ColorTransferEngine::new(config.engine.clone());
    if !engine.supports_model(&config.stream.default_model) {
        anyhow::bail!(
            "Default model '{}' is not provided by the {} engine (available: {})",
            config.stream.default_model,
            engine.name(),
            engine.models().join(", ")
        );
    }
    info!(
        engine = engine.name(),
        default_model = %config.stream.default_model,
        max_fps = config.stream.max_fps,
        "Engine ready"
    );

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler(Arc::clone(&shutdown));

    let mut server = DaemonServer::new(ServerConfig::from(&config), Arc::new(engine));
    let result = server.run(shutdown).await;

    match result {
        Ok(()) => {
            info!("Stylecast daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

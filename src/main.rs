//! Session Gateway
//!
//! An axum server that resumes a server-side session for each request and
//! answers with a single buffered JSON envelope.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http::server (request id, trace, timeout)
//!                          │
//!                          ▼
//!                     http::coordinator ──▶ session::store ──▶ CacheBackend
//!                          │    (lazy open, save on completion)
//!                          ▼
//!                     api handler ──▶ auth (current user, memoized records)
//!                          │
//!                          ▼
//!                     http::translator (11000 / 12000 / HTTP / 500)
//!                          │
//!     Client Response      ▼
//!     ◀────────────── envelope ──▶ ChannelTransport
//!
//!     Cross-cutting: config (TOML + hot reload), observability
//!     (tracing + Prometheus), lifecycle (signals, graceful shutdown)
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use session_gateway::config::{load_config, ConfigWatcher, GatewayConfig};
use session_gateway::http::HttpServer;
use session_gateway::lifecycle::{spawn_signal_listener, Shutdown};
use session_gateway::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "session-gateway", version, about = "Session-backed JSON envelope gateway")]
struct Args {
    /// TOML configuration file, watched for changes.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.listener.bind_address = bind.clone();
    }

    logging::init_logging(&config.observability).context("installing log subscriber")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "session-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        session_id_name = %config.session.session_id_name,
        expire_seconds = config.session.expire_seconds,
        request_timeout_secs = config.timeouts.request_secs,
        users = config.users.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // Keep the watcher alive for the lifetime of the server.
    let (_watcher, config_updates) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => (Some(handle), updates),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    (None, updates)
                }
            }
        }
        None => {
            let (_, updates) = mpsc::unbounded_channel();
            (None, updates)
        }
    };

    let listener = TcpListener::bind(&config.listener.bind_address)
        .await
        .with_context(|| format!("binding {}", config.listener.bind_address))?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    spawn_signal_listener(&shutdown);

    let server = HttpServer::new(config);
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

//! Unified HTTP server binary.
//!
//! Serves every listener in the config file with a small demonstration
//! handler.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!   plain TCP ──────▶│ listener ─────────────────▶ HTTP/1.1 adapter │──┐
//!                    │                                              │  │
//!   TLS :8443 ──────▶│ listener ─▶ TLS frontend ─┬─▶ HTTP/1.1 adapter│──┤
//!                    │            (ALPN demux)   └─▶ HTTP/2 adapter  │──┤
//!                    └──────────────────────────────────────────────┘  │
//!                                                                       ▼
//!                                           NormalizedRequest → request handler
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use http::StatusCode;

use unified_http_server::config::loader::load_config;
use unified_http_server::config::ServerConfig;
use unified_http_server::http::{NormalizedRequest, PathFormat};
use unified_http_server::lifecycle::signals::stop_signal;
use unified_http_server::observability::{logging, metrics};
use unified_http_server::Server;

/// Protocol-unifying HTTP/1.1 and HTTP/2 server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter directive, overrides the config file.
    #[arg(long)]
    log_level: Option<String>,
}

async fn demo_handler(req: NormalizedRequest) {
    let result = match req.path_format() {
        PathFormat::PathDecoded => match req.path() {
            Some("") => req.respond(
                format!("hello from {} ({:?})\n", req.listener_id(), req.transport()),
                (),
            ),
            Some("health") => req.respond("ok\n", ()),
            _ => req.respond("not found\n", StatusCode::NOT_FOUND),
        },
        _ => req.respond("bad request target\n", StatusCode::BAD_REQUEST),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Response not sent");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config: ServerConfig = load_config(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    logging::init_logging(&config.logging);

    tracing::info!(
        config = %cli.config.display(),
        listeners = config.listeners.len(),
        "unified-http-server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    if let Some(address) = &config.metrics.address {
        match address.parse() {
            Ok(addr) => {
                metrics::init_metrics(addr);
            }
            Err(_) => tracing::error!(metrics_address = %address, "Failed to parse metrics address"),
        }
    }

    let server = Server::new(config.listeners.clone(), demo_handler)?;
    server.listen().await?;
    for id in server.listener_ids() {
        if let Some(addr) = server.local_addr(id) {
            tracing::info!(listener = id, address = %addr, "Listening for connections");
        }
    }

    let signal = stop_signal().await?;
    let grace = Duration::from_secs(config.shutdown.grace_period_secs);
    tracing::info!(signal = %signal, grace_period_secs = grace.as_secs(), "Shutting down");

    tokio::select! {
        result = tokio::time::timeout(grace, server.close()) => match result {
            Ok(closed) => closed?,
            Err(_) => {
                tracing::warn!("Grace period elapsed, destroying remaining connections");
                server.destroy()?;
            }
        },
        second = stop_signal() => {
            if let Ok(signal) = second {
                tracing::warn!(signal = %signal, "Second signal, destroying remaining connections");
            }
            server.destroy()?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

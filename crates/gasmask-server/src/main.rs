//! # gasmask-server
//!
//! Daemon for the gasmask telemetry pipeline.
//!
//! This binary provides:
//! - The link to the mask with automatic reconnect
//! - Reading history and danger alerts
//! - REST API for status, readings, alerts and settings
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, with a scripted mask
//! GASMASK_DEMO=1 cargo run --package gasmask-server --features mock-transport
//!
//! # Production (on Raspberry Pi)
//! ./gasmask-server
//! ```
//!
//! `GASMASK_CONFIG` points at a configuration file other than the default.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;

use anyhow::Context;
use gasmask_core::transport::{AnyTransport, NetworkTransport};
use gasmask_core::{Config, TransportKind};
use gasmask_server::api::create_router;
use gasmask_server::daemon::Daemon;
use gasmask_server::logging;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_settings = logging::LogSettings::from_env();
    let _log_guard = logging::init(&log_settings)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting gasmask-server");

    let (config, config_path) = load_config()?;
    let transport = build_transport(&config).await?;

    let daemon = Daemon::start(config.clone(), Some(config_path), transport);
    daemon.auto_connect().await;

    // Build the application router
    let app = create_router(daemon.state());

    // Bind to address
    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    daemon.shutdown().await;
    info!("gasmask-server stopped");

    Ok(())
}

/// Loads the configuration from `GASMASK_CONFIG` or the default path.
fn load_config() -> anyhow::Result<(Config, PathBuf)> {
    match std::env::var_os("GASMASK_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            let config = Config::load_from(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            info!(path = %path.display(), "Configuration loaded");
            Ok((config, path))
        }
        None => {
            let path = Config::config_path();
            let config = Config::load().context("Failed to load configuration")?;
            info!(path = %path.display(), "Configuration loaded");
            Ok((config, path))
        }
    }
}

/// Builds the configured link, or the scripted mask in demo mode.
async fn build_transport(config: &Config) -> anyhow::Result<AnyTransport> {
    if let Some(transport) = demo_transport() {
        return Ok(transport);
    }

    match config.transport.kind {
        TransportKind::Bluetooth => bluetooth_transport(config).await,
        TransportKind::Network => Ok(AnyTransport::Network(NetworkTransport::new(
            &config.transport.network,
            config.connect_timeout(),
        ))),
    }
}

/// The scripted mask, when `GASMASK_DEMO` is set.
#[cfg(feature = "mock-transport")]
fn demo_transport() -> Option<AnyTransport> {
    use gasmask_server::demo;

    std::env::var_os("GASMASK_DEMO")?;
    warn!("Demo mode: readings are synthetic");
    let transport = demo::transport();
    // Runs for the life of the process.
    drop(demo::spawn_feeder(transport.clone()));
    Some(AnyTransport::Mock(transport))
}

#[cfg(not(feature = "mock-transport"))]
const fn demo_transport() -> Option<AnyTransport> {
    None
}

#[cfg(feature = "bluetooth")]
async fn bluetooth_transport(config: &Config) -> anyhow::Result<AnyTransport> {
    use gasmask_core::transport::BluetoothTransport;

    let transport = BluetoothTransport::new(&config.transport.bluetooth)
        .await
        .context("Bluetooth adapter unavailable")?;
    Ok(AnyTransport::Bluetooth(transport))
}

#[cfg(not(feature = "bluetooth"))]
async fn bluetooth_transport(_config: &Config) -> anyhow::Result<AnyTransport> {
    anyhow::bail!("Built without Bluetooth support; set transport.kind = \"network\"")
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

//! Process entrypoint wiring a [`CacheCoordinator`] to an [`HttpBackend`] for manual exercising
//! and integration testing. Not a production S3 gateway: the S3 wire protocol, IAM, and
//! everything else in the out-of-scope list (see crate docs) live above this binary, not in it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use diskcache::{CacheConfig, CacheCoordinator, HttpBackend};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[command(
    name = "diskcache-server",
    about = "Runs a disk-backed object cache in front of an S3-compatible backend",
    version
)]
struct Cli {
    /// Path to a JSON `CacheConfig` document.
    #[arg(short, long, env = "DISKCACHE_CONFIG")]
    config: PathBuf,

    /// S3-compatible endpoint the cache fronts.
    #[arg(short, long, env = "DISKCACHE_BACKEND_ENDPOINT")]
    backend_endpoint: Url,

    /// Logging level.
    #[arg(short, long, value_enum, env = "DISKCACHE_LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::from(cli.log_level).to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_bytes = tokio::fs::read(&cli.config).await?;
    let config: CacheConfig = serde_json::from_slice(&config_bytes)?;

    let backend = Arc::new(HttpBackend::new(cli.backend_endpoint)?);
    let coordinator = Arc::new(CacheCoordinator::new(config, backend).await?);
    coordinator.run().await;
    tracing::info!(drives = coordinator.drive_count(), "cache coordinator running");

    wait_for_shutdown_signal(&coordinator).await;
    coordinator.shutdown().await;
    tracing::info!("shut down cleanly");
    Ok(())
}

/// Waits for `SIGTERM` (graceful stop) or `SIGINT` (Ctrl-C). A `SIGHUP` in between re-triggers
/// [`CacheCoordinator::reload_format`] without interrupting the wait.
#[cfg(unix)]
async fn wait_for_shutdown_signal(coordinator: &CacheCoordinator) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                return;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                return;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading on-disk format state");
                if let Err(e) = coordinator.reload_format().await {
                    tracing::error!(error = %e, "reload-format failed");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(_coordinator: &CacheCoordinator) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl-C, shutting down");
}

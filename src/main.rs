//! Motion camera event service.
//!
//! Watches the camera daemon's queue directory for completed raw events,
//! turns each one into a finished event (video, thumbnail, canonical
//! location), and keeps the event cache warm and within its retention
//! window.

use anyhow::{Context, Result};
use camtrap_events::cache::EventCache;
use camtrap_events::config::{LoggingConfig, ServiceConfig};
use camtrap_events::media::FfmpegTools;
use camtrap_events::processor::EventProcessor;
use camtrap_events::queue::QueueMonitor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        base_dir = %config.storage.base_dir.display(),
        "Starting event service"
    );

    let base_dir = config.storage.base_dir.clone();
    if !base_dir.is_dir() {
        anyhow::bail!("Base directory {} does not exist", base_dir.display());
    }

    // Single shared cache instance for the process lifetime.
    let cache = Arc::new(EventCache::new(base_dir.clone(), &config.cache));
    if config.cache.preload {
        let preload_cache = cache.clone();
        tokio::task::spawn_blocking(move || preload_cache.preload())
            .await
            .context("Cache preload failed")?;
    }

    // Finished events are handed to the cache through a channel so cache
    // population never blocks the monitor's poll loop.
    let (handoff_tx, mut handoff_rx) = mpsc::channel::<PathBuf>(config.queue.handoff_capacity);
    let handoff_cache = cache.clone();
    let handoff_task = tokio::spawn(async move {
        while let Some(path) = handoff_rx.recv().await {
            if handoff_cache.resolve(&path).is_none() {
                warn!(path = %path.display(), "Finished event could not be cached");
            }
        }
    });

    let tools = Arc::new(FfmpegTools::new(&config.processing));
    let processor = Arc::new(EventProcessor::new(
        tools,
        config.processing.timelapse_threshold,
        handoff_tx,
    ));
    let monitor = QueueMonitor::new(
        base_dir,
        config.storage.queue_dir(),
        &config.queue,
        processor,
    )
    .context("Queue monitor startup failed")?;

    let cancel = CancellationToken::new();
    let monitor_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    };

    info!("Event service started");

    shutdown_signal().await;

    info!("Shutting down, draining in-flight work");
    cancel.cancel();
    if let Err(e) = monitor_task.await {
        error!(error = %e, "Queue monitor task failed");
    }
    // The monitor owned the last handoff sender; the cache task drains the
    // channel and exits.
    if let Err(e) = handoff_task.await {
        error!(error = %e, "Cache handoff task failed");
    }

    info!("Event service stopped");

    Ok(())
}

/// Initialize tracing/logging.
fn init_tracing(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).init(),
        _ => registry.with(fmt::layer().json()).init(),
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

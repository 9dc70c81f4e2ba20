//! replica-syncd - Embedded replica sync daemon
//!
//! Composition root: reads the environment, opens the replica through the
//! registry, keeps it synchronized in the background and flushes pending
//! writes on Ctrl+C / SIGTERM.

use replica_sync::adapters::outbound::{DashMapSyncMonitor, HttpRemoteConnector};
use replica_sync::config::{load_config, ConcurrencyMode, Config};
use replica_sync::domain::ports::SyncMonitor;
use replica_sync::domain::ContextId;
use replica_sync::infrastructure::shutdown_signal;
use replica_sync::ConnectionRegistry;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let runtime = match cfg.concurrency {
        ConcurrencyMode::Serial => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
        ConcurrencyMode::Threaded => tokio::runtime::Builder::new_multi_thread()
            .worker_threads(cfg.max_workers)
            .enable_all()
            .build()?,
    };

    runtime.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let sync_config = cfg.sync_config()?;

    tracing::info!(
        "starting replica-syncd path={} remote={} interval={:?} concurrency={:?} workers={}",
        sync_config.local_path(),
        sync_config
            .remote_endpoint()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "none".to_string()),
        sync_config.sync_interval(),
        cfg.concurrency,
        cfg.max_workers
    );

    // 1. Outbound adapters
    let monitor = Arc::new(DashMapSyncMonitor::new());
    let registry = ConnectionRegistry::new(Arc::new(HttpRemoteConnector::new()), monitor.clone());

    // 2. The daemon's own context; starts the scheduler when enabled
    let context = ContextId::new("replica-syncd");
    let connection = registry.acquire(&context, &sync_config)?;

    // 3. Catch up with the remote before serving
    if connection.is_replicated() {
        match connection.sync().await {
            Ok(attempt) => tracing::info!(
                "initial sync ok, pulled {} frames in {:?}",
                attempt.transfer.frames_pulled,
                attempt.duration
            ),
            Err(e) => tracing::warn!("initial sync failed: {}", e),
        }
    }

    shutdown_signal(registry.shutdown_controller().clone()).await;

    // 4. Flush local writes that the last tick did not pick up
    if connection.is_replicated() && connection.dirty() > 0 {
        match connection.sync_with_deadline(cfg.drain_timeout()).await {
            Ok(attempt) => tracing::info!(
                "final sync pushed {} frames",
                attempt.transfer.frames_pushed
            ),
            Err(e) => tracing::error!(
                "final sync failed, {} writes remain local: {}",
                connection.dirty(),
                e
            ),
        }
    }

    let stats = monitor.stats(connection.id());
    tracing::info!(
        "sync stats: total={} ok={} transient={} fatal={} overruns={} mean={:?}",
        stats.total,
        stats.successes,
        stats.transient_failures,
        stats.fatal_failures,
        stats.overruns,
        stats.mean_duration
    );

    drop(connection);
    registry.shutdown(cfg.drain_timeout()).await;
    Ok(())
}

//! upstrail - UPS fleet telemetry poller
//!
//! Polls APC UPS units over SNMP or their web UI and writes normalized
//! snapshots to ClickHouse.

mod config;
mod db;
mod probe;
mod scheduler;

use config::ServerConfig;
use db::ClickHouseSink;
use probe::ApcAdapter;
use scheduler::{InsertQueue, Scheduler};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let cfg = ServerConfig::load()?;

    // Initialize logging
    let filter = cfg.log_filter(std::env::var("RUST_LOG").ok());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_new(filter)?)
        .init();

    let targets = config::load_targets(&cfg.targets_path)?;
    tracing::info!(
        "Starting upstrail with {} target(s) from {}",
        targets.len(),
        cfg.targets_path.display()
    );
    tracing::info!(
        "Writing to {}.{} at {}",
        cfg.clickhouse.database,
        cfg.table,
        cfg.clickhouse.url
    );

    let sink = Arc::new(ClickHouseSink::new(cfg.clickhouse.clone())?);
    let queue = Arc::new(InsertQueue::new(cfg.queue_limit, cfg.insert_batch_size));
    tracing::info!(
        "Insert queue holds up to {} records, batches of {}",
        queue.limit(),
        cfg.insert_batch_size
    );
    let mut scheduler = Scheduler::new(queue, sink, cfg.insert_policy());

    let defaults = cfg.poll_defaults();
    for target in targets {
        let adapter = ApcAdapter::new(&cfg.mib_path)?;
        scheduler.add_target(target, Box::new(adapter), defaults);
    }
    tracing::info!("Scheduler started for {} target(s)", scheduler.target_count());

    shutdown_signal().await;
    tracing::info!("Shutting down, flushing pending records");
    scheduler.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

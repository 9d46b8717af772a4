//! Escrow Relayer - EVM <-> Cardano escrow watching and settlement
//!
//! Watches escrow contracts on both chains, tracks each escrow's lifecycle and
//! releases the counterpart escrow on the opposite chain once one side is released.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod state;
mod tx;

use chain::{CardanoWatcher, ChainWatcher, EvmWatcher, ReconnectPolicy};
use config::{ExecutorMode, Settings};
use coordination::SettlementCoordinator;
use metrics::MetricsServer;
use tx::{DryRunExecutor, SettlementExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Escrow Relayer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!("Relayer instance {}", settings.relayer.instance_id);

    let policy = ReconnectPolicy::from_config(&settings.reconnect);
    let mut watchers: Vec<Arc<dyn ChainWatcher>> = Vec::new();
    if let Some(evm) = &settings.ethereum {
        watchers.push(Arc::new(EvmWatcher::from_config(evm, policy.clone())));
    }
    if let Some(cardano) = &settings.cardano {
        watchers.push(Arc::new(CardanoWatcher::from_config(cardano, policy.clone())));
    }

    let executor: Arc<dyn SettlementExecutor> = match settings.executor.mode {
        ExecutorMode::DryRun => Arc::new(DryRunExecutor::new()),
    };
    executor.initialize().await?;

    // Coordinator subscribes before the watchers produce anything
    let coordinator = Arc::new(SettlementCoordinator::new(
        settings.coordinator.clone(),
        watchers.clone(),
        executor,
    ));
    coordinator.start().await?;
    info!("Settlement coordinator started");

    for watcher in &watchers {
        match watcher.start().await {
            Ok(()) => info!("{} watcher started", watcher.chain()),
            Err(e) => error!("{} watcher failed to start: {}", watcher.chain(), e),
        }
    }

    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState::new(coordinator.clone(), watchers.clone());
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    let metrics_handle = settings.metrics.enabled.then(|| {
        let server = MetricsServer::new(settings.metrics.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    info!("Escrow Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    for watcher in &watchers {
        watcher.stop().await;
    }
    coordinator.stop().await;

    let counts = coordinator.status().await;
    if counts.pending + counts.retrying > 0 {
        warn!(
            "Stopping with {} unfinished settlements",
            counts.pending + counts.retrying
        );
    }

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Escrow Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,escrow_relayer=debug,hyper=warn"));

    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

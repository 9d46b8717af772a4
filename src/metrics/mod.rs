//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Watcher connection status and chain position
//! - Escrow event counts
//! - Settlement attempts, outcomes and latency

use crate::error::{RelayerError, RelayerResult};
use crate::events::{Chain, EscrowEventKind};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Watcher metrics
    pub static ref WATCHER_CONNECTED: GaugeVec = register_gauge_vec!(
        "escrow_relayer_watcher_connected",
        "Watcher stream status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref WATCHER_POSITION: GaugeVec = register_gauge_vec!(
        "escrow_relayer_watcher_position",
        "Last confirmed block number or slot per chain",
        &["chain"]
    ).unwrap();

    pub static ref RECONNECT_ATTEMPTS: CounterVec = register_counter_vec!(
        "escrow_relayer_reconnect_attempts_total",
        "Total stream reconnection attempts",
        &["chain"]
    ).unwrap();

    pub static ref ROLLBACKS: CounterVec = register_counter_vec!(
        "escrow_relayer_rollbacks_total",
        "Total chain rollbacks observed",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "escrow_relayer_events_received_total",
        "Total escrow events received by kind",
        &["chain", "kind"]
    ).unwrap();

    pub static ref DECODE_ERRORS: CounterVec = register_counter_vec!(
        "escrow_relayer_decode_errors_total",
        "Total chain messages dropped as undecodable",
        &["chain"]
    ).unwrap();

    // Settlement metrics
    pub static ref SETTLEMENT_ATTEMPTS: CounterVec = register_counter_vec!(
        "escrow_relayer_settlement_attempts_total",
        "Total settlement execution attempts by target chain",
        &["chain"]
    ).unwrap();

    pub static ref SETTLEMENTS: CounterVec = register_counter_vec!(
        "escrow_relayer_settlements_total",
        "Total finished settlements by target chain and outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref SETTLEMENT_LATENCY: HistogramVec = register_histogram_vec!(
        "escrow_relayer_settlement_latency_seconds",
        "Time from release observed to settlement completed",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_connection(chain: Chain, connected: bool) {
    WATCHER_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if connected { 1.0 } else { 0.0 });
}

pub fn record_position(chain: Chain, position: u64) {
    WATCHER_POSITION
        .with_label_values(&[chain.as_str()])
        .set(position as f64);
}

pub fn record_reconnect_attempt(chain: Chain) {
    RECONNECT_ATTEMPTS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_rollback(chain: Chain) {
    ROLLBACKS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_event(chain: Chain, kind: EscrowEventKind) {
    EVENTS_RECEIVED
        .with_label_values(&[chain.as_str(), kind.name()])
        .inc();
}

pub fn record_decode_error(chain: Chain) {
    DECODE_ERRORS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_settlement_attempt(chain: Chain) {
    SETTLEMENT_ATTEMPTS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_settlement_outcome(chain: Chain, success: bool) {
    let outcome = if success { "completed" } else { "failed" };
    SETTLEMENTS
        .with_label_values(&[chain.as_str(), outcome])
        .inc();
}

pub fn record_settlement_latency(chain: Chain, latency_secs: f64) {
    SETTLEMENT_LATENCY
        .with_label_values(&[chain.as_str()])
        .observe(latency_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_gathered() {
        record_event(Chain::Ethereum, EscrowEventKind::Released);
        record_settlement_outcome(Chain::Cardano, true);

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"escrow_relayer_events_received_total".to_string()));
        assert!(names.contains(&"escrow_relayer_settlements_total".to_string()));
    }

    #[tokio::test]
    async fn test_handler_renders_text_format() {
        record_connection(Chain::Cardano, true);
        let body = metrics_handler().await.unwrap();
        assert!(body.contains("escrow_relayer_watcher_connected"));
    }
}

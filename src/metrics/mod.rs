//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Source chain connectivity and watermark
//! - Ingestion outcomes
//! - Ledger size, transitions and evictions
//! - Resolver actions and notification delivery

use crate::error::{RelayerError, RelayerResult};
use crate::state::{EvictionReport, LifecycleState};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "escrow_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "escrow_relayer_processed_block_height",
        "Last fully processed block per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref BLOCKS_SKIPPED: CounterVec = register_counter_vec!(
        "escrow_relayer_blocks_skipped_total",
        "Blocks left unscanned because they fell outside the history window",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_CALL_LATENCY: HistogramVec = register_histogram_vec!(
        "escrow_relayer_chain_call_seconds",
        "Latency of outbound chain calls",
        &["operation", "outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // Ingestion metrics
    pub static ref EVENTS_INGESTED: CounterVec = register_counter_vec!(
        "escrow_relayer_events_total",
        "Escrow creation events by ingestion outcome",
        &["chain_id", "outcome"]
    ).unwrap();

    // Ledger metrics
    pub static ref LEDGER_SIZE: Gauge = register_gauge!(
        "escrow_relayer_ledger_records",
        "Swap records currently held"
    ).unwrap();

    pub static ref TRANSITIONS: CounterVec = register_counter_vec!(
        "escrow_relayer_transitions_total",
        "Lifecycle transitions applied",
        &["from", "to"]
    ).unwrap();

    pub static ref EVICTIONS: CounterVec = register_counter_vec!(
        "escrow_relayer_evictions_total",
        "Records evicted from the ledger",
        &["reason"]
    ).unwrap();

    pub static ref ACTIVE_EVICTIONS: CounterVec = register_counter_vec!(
        "escrow_relayer_active_evictions_total",
        "Non-terminal records evicted under capacity pressure",
        &["state"]
    ).unwrap();

    // Resolver metrics
    pub static ref RESOLVER_ACTIONS: CounterVec = register_counter_vec!(
        "escrow_relayer_resolver_actions_total",
        "Resolver actions by outcome",
        &["action", "outcome"]
    ).unwrap();

    pub static ref INTEGRITY_FAILURES: CounterVec = register_counter_vec!(
        "escrow_relayer_integrity_failures_total",
        "Integrity violations detected",
        &["operation"]
    ).unwrap();

    // Notification metrics
    pub static ref NOTIFICATIONS: CounterVec = register_counter_vec!(
        "escrow_relayer_notifications_total",
        "Notification deliveries by outcome",
        &["outcome"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "escrow_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "escrow_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
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
            .map_err(|e| RelayerError::Internal(format!("Failed to bind metrics server: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Text exposition of the default registry
pub fn render() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RelayerError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_blocks_skipped(chain_id: u64, count: u64) {
    BLOCKS_SKIPPED
        .with_label_values(&[&chain_id.to_string()])
        .inc_by(count as f64);
}

pub fn record_chain_call(operation: &str, elapsed: Duration, ok: bool) {
    CHAIN_CALL_LATENCY
        .with_label_values(&[operation, if ok { "ok" } else { "error" }])
        .observe(elapsed.as_secs_f64());
}

/// `outcome` is one of `inserted`, `duplicate` or `decode_failed`
pub fn record_event(chain_id: u64, outcome: &str) {
    EVENTS_INGESTED
        .with_label_values(&[&chain_id.to_string(), outcome])
        .inc();
}

pub fn set_ledger_size(size: usize) {
    LEDGER_SIZE.set(size as f64);
}

pub fn record_transition(from: LifecycleState, to: LifecycleState) {
    TRANSITIONS
        .with_label_values(&[from.as_str(), to.as_str()])
        .inc();
}

pub fn record_evictions(report: &EvictionReport) {
    EVICTIONS
        .with_label_values(&["retention"])
        .inc_by(report.expired.len() as f64);
    EVICTIONS
        .with_label_values(&["capacity"])
        .inc_by((report.trimmed.len() + report.displaced.len()) as f64);
}

pub fn record_active_eviction(state: LifecycleState) {
    ACTIVE_EVICTIONS.with_label_values(&[state.as_str()]).inc();
}

pub fn record_resolver_action(action: &str, ok: bool) {
    RESOLVER_ACTIONS
        .with_label_values(&[action, if ok { "ok" } else { "error" }])
        .inc();
}

pub fn record_integrity_failure(operation: &str) {
    INTEGRITY_FAILURES.with_label_values(&[operation]).inc();
}

pub fn record_notification(delivered: bool) {
    NOTIFICATIONS
        .with_label_values(&[if delivered { "delivered" } else { "failed" }])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

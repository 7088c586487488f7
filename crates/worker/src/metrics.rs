//! Prometheus metrics for observability.
//!
//! This module provides the worker's registry, holding:
//! - HTTP request metrics for the health endpoint
//! - Scheduler status (collected dynamically)
//! - Every core metric (claims, attempts, publishing, notifications)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "imaging_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("imaging_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

// =============================================================================
// Scheduler
// =============================================================================

/// Whether the poll loop is running (1) or not (0).
pub static SCHEDULER_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "imaging_scheduler_running",
        "Whether the scheduler poll loop is running",
    )
    .unwrap()
});

/// Poll cycles completed since start.
pub static SCHEDULER_CYCLES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "imaging_scheduler_cycles",
        "Poll cycles run since the worker started",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();

    // Scheduler
    registry
        .register(Box::new(SCHEDULER_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(SCHEDULER_CYCLES.clone()))
        .unwrap();

    // Core metrics (claims, attempts, publishing, notifications)
    for metric in imaging_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Update gauges from the current scheduler status.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let status = state.scheduler().status().await;
    SCHEDULER_RUNNING.set(if status.running { 1 } else { 0 });
    SCHEDULER_CYCLES.set(status.cycles as i64);
    imaging_core::metrics::LEASES_HELD.set(status.leases.len() as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/health", "200"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("imaging_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_core_metrics() {
        // Vector metrics only appear once a label set has been touched.
        imaging_core::metrics::CLAIMS_TOTAL
            .with_label_values(&["claimed"])
            .inc();
        imaging_core::metrics::LEASES_HELD.set(0);
        SCHEDULER_RUNNING.set(0);

        let output = encode_metrics();
        assert!(output.contains("imaging_claims_total"));
        assert!(output.contains("imaging_leases_held"));
        assert!(output.contains("imaging_scheduler_running"));
        assert!(output.contains("imaging_poll_cycles_total"));
    }
}

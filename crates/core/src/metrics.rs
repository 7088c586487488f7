//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Claims (attempts, conflicts, lost leases)
//! - Attempts (outcomes, per-stage durations)
//! - Publishing and notifications

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Claims
// =============================================================================

/// Claim attempts by result.
pub static CLAIMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("imaging_claims_total", "Total claim attempts"),
        &["result"], // "claimed", "conflict", "not_claimable", "error"
    )
    .unwrap()
});

/// Holder writes rejected because the record moved.
pub static LEASES_LOST_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imaging_leases_lost_total",
        "Conditional writes rejected after a lease expired",
    )
    .unwrap()
});

/// Leases currently held by this worker.
pub static LEASES_HELD: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("imaging_leases_held", "Leases currently held").unwrap()
});

// =============================================================================
// Attempts
// =============================================================================

/// Finished attempts by outcome.
pub static ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("imaging_attempts_total", "Total processing attempts"),
        &["outcome"], // "completed", "requeued", "failed", "interrupted", "abandoned"
    )
    .unwrap()
});

/// Tool stage duration in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "imaging_stage_duration_seconds",
            "Duration of each pipeline stage",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
        &["stage"],
    )
    .unwrap()
});

/// Poll cycles run by the scheduler.
pub static POLL_CYCLES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("imaging_poll_cycles_total", "Total scheduler poll cycles").unwrap()
});

// =============================================================================
// Publishing and notifications
// =============================================================================

/// Local publish retries.
pub static PUBLISH_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imaging_publish_retries_total",
        "Publish attempts retried after a transient failure",
    )
    .unwrap()
});

/// Failure notifications by delivery result.
pub static NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("imaging_notifications_total", "Total failure notifications"),
        &["result"], // "sent", "failed"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Claims
        Box::new(CLAIMS_TOTAL.clone()),
        Box::new(LEASES_LOST_TOTAL.clone()),
        Box::new(LEASES_HELD.clone()),
        // Attempts
        Box::new(ATTEMPTS_TOTAL.clone()),
        Box::new(STAGE_DURATION.clone()),
        Box::new(POLL_CYCLES_TOTAL.clone()),
        // Publishing
        Box::new(PUBLISH_RETRIES_TOTAL.clone()),
        Box::new(NOTIFICATIONS_TOTAL.clone()),
    ]
}

//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Jobs (outcomes, cache probes)
//! - Conversion stages (durations, retries)
//! - Uploads and the concurrency gate

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Jobs
// =============================================================================

/// Jobs reaching a terminal status, by outcome.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mps_relay_jobs_finished_total", "Jobs that reached a terminal status"),
        &["outcome"], // "succeeded", "failed", "skipped_cache_hit"
    )
    .unwrap()
});

/// Cache probes by result.
pub static CACHE_PROBES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mps_relay_cache_probes_total", "Output cache probes"),
        &["result"], // "hit", "miss"
    )
    .unwrap()
});

// =============================================================================
// Conversion stages
// =============================================================================

/// Duration of each stage attempt in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "mps_relay_stage_duration_seconds",
            "Duration of a conversion stage attempt",
        )
        .buckets(vec![
            1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0,
        ]),
        &["stage"],
    )
    .unwrap()
});

/// Stage retries after a transient failure.
pub static STAGE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mps_relay_stage_retries_total", "Conversion stage retries"),
        &["stage"],
    )
    .unwrap()
});

// =============================================================================
// Uploads and gate
// =============================================================================

/// Per-file upload outcomes.
pub static UPLOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mps_relay_uploads_total", "Output file upload attempts"),
        &["result"], // "done", "failed", "retried"
    )
    .unwrap()
});

/// Concurrency gate slots currently held, across all runs.
pub static GATE_SLOTS_IN_USE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "mps_relay_gate_slots_in_use",
        "Concurrency gate slots currently held",
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(JOBS_FINISHED.clone()),
        Box::new(CACHE_PROBES.clone()),
        Box::new(STAGE_DURATION.clone()),
        Box::new(STAGE_RETRIES.clone()),
        Box::new(UPLOADS_TOTAL.clone()),
        Box::new(GATE_SLOTS_IN_USE.clone()),
    ]
}

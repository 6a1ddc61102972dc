//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the relay server:
//! - HTTP request metrics (latency, counts)
//! - WebSocket connection metrics
//! - Run metrics (started, rejected, active)
//! - Core job, stage, upload and gate metrics (registered from the core crate)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

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
            "mps_relay_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mps_relay_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "mps_relay_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// WebSocket Metrics
// =============================================================================

/// Active WebSocket connections.
pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "mps_relay_ws_connections_active",
        "Number of active WebSocket connections",
    )
    .unwrap()
});

/// Total WebSocket connections (cumulative).
pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "mps_relay_ws_connections_total",
        "Total WebSocket connections since startup",
    )
    .unwrap()
});

/// WebSocket messages sent by type.
pub static WS_MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mps_relay_ws_messages_sent_total", "WebSocket messages sent"),
        &["type"],
    )
    .unwrap()
});

/// WebSocket lag events (when client falls behind).
pub static WS_LAG_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "mps_relay_ws_lag_events_total",
        "WebSocket lag events (client fell behind)",
    )
    .unwrap()
});

// =============================================================================
// Run Metrics
// =============================================================================

/// Runs accepted, by mode.
pub static RUNS_STARTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mps_relay_runs_started_total", "Runs accepted since startup"),
        &["mode"],
    )
    .unwrap()
});

/// Runs rejected before any job was created, by reason.
pub static RUNS_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mps_relay_runs_rejected_total", "Runs rejected at submission"),
        &["reason"],
    )
    .unwrap()
});

/// Runs with unfinished jobs (collected dynamically).
pub static RUNS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("mps_relay_runs_active", "Runs with unfinished jobs").unwrap()
});

fn register_metrics(registry: &Registry) {
    // HTTP metrics
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // WebSocket metrics
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry.register(Box::new(WS_MESSAGES_SENT.clone())).unwrap();
    registry.register(Box::new(WS_LAG_EVENTS.clone())).unwrap();

    // Run metrics
    registry
        .register(Box::new(RUNS_STARTED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(RUNS_REJECTED_TOTAL.clone()))
        .unwrap();
    registry.register(Box::new(RUNS_ACTIVE.clone())).unwrap();

    // Core metrics (jobs, stages, uploads, gate)
    for metric in mps_relay_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Update gauges that are derived from application state.
pub fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let active = state
        .run_summaries()
        .iter()
        .filter(|summary| !summary.finished)
        .count();
    RUNS_ACTIVE.set(active as i64);
}

static UUID_RE: Lazy<regex_lite::Regex> = Lazy::new(|| {
    regex_lite::Regex::new(
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
    )
    .unwrap()
});

static NUMERIC_RE: Lazy<regex_lite::Regex> =
    Lazy::new(|| regex_lite::Regex::new(r"/\d+(/|$)").unwrap());

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    let result = UUID_RE.replace_all(path, "{id}");
    let result = NUMERIC_RE.replace_all(&result, "/{id}$1");
    result.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_run_id() {
        let path = "/api/v1/runs/550e8400-e29b-41d4-a716-446655440000/cancel";
        assert_eq!(normalize_path(path), "/api/v1/runs/{id}/cancel");
    }

    #[test]
    fn test_normalize_path_numeric() {
        assert_eq!(normalize_path("/api/v1/runs/12345"), "/api/v1/runs/{id}");
    }

    #[test]
    fn test_normalize_path_no_ids() {
        let path = "/api/v1/health";
        assert_eq!(normalize_path(path), "/api/v1/health");
    }

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("mps_relay_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_core_metrics() {
        // Prometheus only outputs metrics that have been touched
        RUNS_ACTIVE.set(0);
        WS_CONNECTIONS_TOTAL.inc();
        mps_relay_core::metrics::GATE_SLOTS_IN_USE.set(0);
        mps_relay_core::metrics::JOBS_FINISHED
            .with_label_values(&["succeeded"])
            .inc_by(0);

        let output = encode_metrics();
        assert!(output.contains("mps_relay_runs_active"));
        assert!(output.contains("mps_relay_ws_connections_total"));
        assert!(output.contains("mps_relay_gate_slots_in_use"));
        assert!(output.contains("mps_relay_jobs_finished_total"));
    }
}

//! Prometheus metrics.
//!
//! The recorder is installed without its own HTTP listener; the proxy
//! serves the rendered text on `GET /metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `loom_requests_total` | Counter | `pattern`, `status` |
//! | `loom_upstream_duration_seconds` | Histogram | `pattern` |
//! | `loom_in_flight_requests` | Gauge | - |
//! | `loom_stream_bytes_total` | Counter | - |
//! | `loom_turns_finalized_total` | Counter | `outcome` |
//! | `loom_turn_calls` | Histogram | - |
//! | `loom_open_turns` | Gauge | - |
//! | `loom_compact_rewrites_total` | Counter | `phase` |
//! | `loom_quota_utilization` | Gauge | `window` |

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether metrics are recorded.
    pub enabled: bool,

    /// Buckets for upstream duration. Streams can run for minutes.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_buckets: vec![
                0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
            ],
        }
    }
}

/// Installs the global Prometheus recorder.
///
/// # Errors
///
/// Returns `TelemetryError::MetricsInit` if a recorder is already installed
/// or the buckets are rejected.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("loom_upstream_duration_seconds".to_string()),
            &config.duration_buckets,
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?
        .install_recorder()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let _ = METRICS_HANDLE.set(handle);
    register_metric_descriptions();

    Ok(())
}

/// Renders metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!(
        "loom_requests_total",
        "Proxied requests by selected pattern and response status"
    );
    describe_histogram!(
        "loom_upstream_duration_seconds",
        "Time from upstream dispatch to the end of the response body"
    );
    describe_gauge!(
        "loom_in_flight_requests",
        "Requests currently being proxied, including open streams"
    );
    describe_counter!(
        "loom_stream_bytes_total",
        "Bytes relayed to clients from streaming responses"
    );
    describe_counter!(
        "loom_turns_finalized_total",
        "Turns finalized by outcome"
    );
    describe_histogram!("loom_turn_calls", "Upstream calls per finalized turn");
    describe_gauge!("loom_open_turns", "Turns currently open");
    describe_counter!(
        "loom_compact_rewrites_total",
        "Compaction rewrites applied by phase"
    );
    describe_gauge!(
        "loom_quota_utilization",
        "Upstream rate-limit utilization reported per window"
    );
}

/// Records a finished request.
pub fn record_request(pattern: &str, status_code: u16) {
    counter!(
        "loom_requests_total",
        "pattern" => pattern.to_string(),
        "status" => status_code.to_string()
    )
    .increment(1);
}

/// Records how long an upstream exchange took.
pub fn record_upstream_duration(pattern: &str, duration: Duration) {
    histogram!(
        "loom_upstream_duration_seconds",
        "pattern" => pattern.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Adds relayed stream bytes.
pub fn record_stream_bytes(bytes: u64) {
    counter!("loom_stream_bytes_total").increment(bytes);
}

/// Records a finalized turn.
pub fn record_turn_finalized(outcome: &str, call_count: u32) {
    counter!("loom_turns_finalized_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("loom_turn_calls").record(f64::from(call_count));
}

/// Sets the number of open turns.
pub fn set_open_turns(count: usize) {
    gauge!("loom_open_turns").set(count as f64);
}

/// Records one applied compaction rewrite.
pub fn record_compact_rewrite(phase: &str) {
    counter!("loom_compact_rewrites_total", "phase" => phase.to_string()).increment(1);
}

/// Sets the last reported utilization for a quota window.
pub fn set_quota_utilization(window: &str, utilization: f64) {
    gauge!("loom_quota_utilization", "window" => window.to_string()).set(utilization);
}

/// Keeps `loom_in_flight_requests` accurate for as long as it lives.
///
/// Streaming responses move the guard into the body so the gauge covers
/// the whole stream, not just the handler.
pub struct InFlightGuard {
    _private: (),
}

impl InFlightGuard {
    /// Creates a new guard and increments the in-flight gauge.
    #[must_use]
    pub fn new() -> Self {
        gauge!("loom_in_flight_requests").increment(1.0);
        Self { _private: () }
    }
}

impl Default for InFlightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        gauge!("loom_in_flight_requests").decrement(1.0);
    }
}

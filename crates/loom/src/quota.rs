//! Upstream rate-limit observation.
//!
//! Every upstream response carries the unified rate-limit headers for the
//! five-hour and seven-day windows. They are logged and exported as gauges;
//! nothing acts on them.

use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;
use serde::Serialize;
use tracing::{debug, warn};

const WINDOWS: [&str; 2] = ["5h", "7d"];

/// One rate-limit window as reported upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaWindow {
    /// Window label (`5h` or `7d`).
    pub window: &'static str,
    /// Fraction used, 0.0 to 1.0.
    pub utilization: Option<f64>,
    /// When the window resets.
    pub reset: Option<DateTime<Utc>>,
    /// `allowed`, `allowed_warning` or `rejected`.
    pub status: Option<String>,
}

impl QuotaWindow {
    fn is_empty(&self) -> bool {
        self.utilization.is_none() && self.reset.is_none() && self.status.is_none()
    }

    /// Whether upstream flagged this window.
    pub fn is_warning(&self) -> bool {
        self.status.as_deref().is_some_and(|s| s != "allowed")
    }
}

/// Read the quota windows present in `headers`.
pub fn parse(headers: &HeaderMap) -> Vec<QuotaWindow> {
    WINDOWS
        .iter()
        .map(|&window| {
            let get = |field: &str| {
                headers
                    .get(format!("anthropic-ratelimit-unified-{window}-{field}"))
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
            };

            QuotaWindow {
                window,
                utilization: get("utilization").and_then(|v| v.parse().ok()),
                reset: get("reset")
                    .and_then(|v| v.parse::<i64>().ok())
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                status: get("status").map(str::to_string),
            }
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Log and gauge the quota windows of an upstream response.
pub fn observe(headers: &HeaderMap) -> Vec<QuotaWindow> {
    let windows = parse(headers);

    for window in &windows {
        if let Some(utilization) = window.utilization {
            loom_telemetry::metrics::set_quota_utilization(window.window, utilization);
        }

        let reset = window.reset.map(|r| r.to_rfc3339()).unwrap_or_default();
        if window.is_warning() {
            warn!(
                window = window.window,
                utilization = window.utilization,
                status = window.status.as_deref().unwrap_or(""),
                reset = %reset,
                "Upstream quota warning"
            );
        } else {
            debug!(
                window = window.window,
                utilization = window.utilization,
                reset = %reset,
                "Upstream quota"
            );
        }
    }

    windows
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_parse_windows() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "anthropic-ratelimit-unified-5h-utilization",
            HeaderValue::from_static("0.42"),
        );
        headers.insert(
            "anthropic-ratelimit-unified-5h-reset",
            HeaderValue::from_static("1760000000"),
        );
        headers.insert(
            "anthropic-ratelimit-unified-5h-status",
            HeaderValue::from_static("allowed"),
        );
        headers.insert(
            "anthropic-ratelimit-unified-7d-status",
            HeaderValue::from_static("allowed_warning"),
        );

        let windows = observe(&headers);
        assert_eq!(windows.len(), 2);

        assert_eq!(windows[0].window, "5h");
        assert_eq!(windows[0].utilization, Some(0.42));
        assert_eq!(windows[0].reset.unwrap().timestamp(), 1_760_000_000);
        assert!(!windows[0].is_warning());

        assert_eq!(windows[1].window, "7d");
        assert!(windows[1].utilization.is_none());
        assert!(windows[1].is_warning());
    }

    #[test]
    fn test_no_quota_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        assert!(parse(&headers).is_empty());
    }

    #[test]
    fn test_garbage_values_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "anthropic-ratelimit-unified-5h-utilization",
            HeaderValue::from_static("lots"),
        );
        headers.insert(
            "anthropic-ratelimit-unified-5h-status",
            HeaderValue::from_static("rejected"),
        );

        let windows = parse(&headers);
        assert_eq!(windows.len(), 1);
        assert!(windows[0].utilization.is_none());
        assert!(windows[0].is_warning());
    }
}

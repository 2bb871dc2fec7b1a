//! Observability bootstrap for the Loom proxy.
//!
//! Loom sits between an LLM client and the upstream API, so everything it
//! records has to line up with the client's own traces:
//!
//! - **Logging**: structured JSON (or pretty) output through `tracing-subscriber`
//! - **Tracing**: OpenTelemetry spans exported over OTLP, W3C `traceparent`
//!   propagation in and out
//! - **Metrics**: Prometheus-format counters, gauges and histograms through
//!   the `metrics` facade
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          loom proxy                          │
//! │                                                              │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │                    loom-telemetry                      │  │
//! │  │                                                        │  │
//! │  │  ┌─────────────┐  ┌──────────────┐  ┌─────────────┐   │  │
//! │  │  │   Metrics   │  │   Tracing    │  │   Logging   │   │  │
//! │  │  │ (Prometheus)│  │(OpenTelemetry)│ │ (JSON/text) │   │  │
//! │  │  └──────┬──────┘  └──────┬───────┘  └──────┬──────┘   │  │
//! │  └─────────┼────────────────┼─────────────────┼──────────┘  │
//! └────────────┼────────────────┼─────────────────┼─────────────┘
//!              ▼                ▼                 ▼
//!        ┌──────────┐    ┌──────────┐      ┌──────────┐
//!        │ /metrics │    │   OTLP   │      │  stdout  │
//!        └──────────┘    │ Collector│      └──────────┘
//!                        └──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use loom_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::builder()
//!     .service_name("loom")
//!     .otlp_endpoint("http://localhost:4317")
//!     .build();
//!
//! let _guard = init_telemetry(config)?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod tracing;

pub use config::{TelemetryConfig, TelemetryConfigBuilder};
pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig};
pub use metrics::{init_metrics, render_metrics, MetricsConfig};
pub use tracing::{context_from_traceparent, init_tracing, HeaderExtractor, HeaderInjector, TracingConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Guard that shuts down telemetry providers on drop.
///
/// Keep it alive for the lifetime of the process. Dropping it flushes
/// spans still queued in the batch exporter.
pub struct TelemetryGuard {
    tracer_provider: Option<opentelemetry_sdk::trace::TracerProvider>,
}

impl TelemetryGuard {
    /// Creates a new telemetry guard.
    #[must_use]
    pub fn new(tracer_provider: Option<opentelemetry_sdk::trace::TracerProvider>) -> Self {
        Self { tracer_provider }
    }

    /// Whether spans are being exported.
    pub fn exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            for result in provider.force_flush() {
                if let Err(e) = result {
                    eprintln!("Error flushing tracer provider: {e}");
                }
            }
            if let Err(e) = provider.shutdown() {
                eprintln!("Error shutting down tracer provider: {e}");
            }
        }
    }
}

/// Initializes logging, metrics and tracing, in that order.
///
/// # Errors
///
/// Returns `TelemetryError` if any subsystem fails to initialize.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryResult<TelemetryGuard> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    let tracer_provider = init_tracing(&config.tracing)?;

    Ok(TelemetryGuard::new(tracer_provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_guard_creation() {
        let guard = TelemetryGuard::new(None);
        assert!(!guard.exporting());
        drop(guard);
    }

    #[test]
    fn test_telemetry_config_builder() {
        let config = TelemetryConfig::builder()
            .service_name("loom-test")
            .service_version("1.0.0")
            .environment("test")
            .build();

        assert_eq!(config.service_name, "loom-test");
        assert_eq!(config.tracing.service_version, "1.0.0");
        assert_eq!(config.tracing.environment, "test");
    }
}

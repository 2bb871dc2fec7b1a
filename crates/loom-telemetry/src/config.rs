//! Telemetry configuration.

use crate::logging::LogConfig;
use crate::metrics::MetricsConfig;
use crate::tracing::TracingConfig;

/// Configuration for all telemetry subsystems.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name (used in traces and logs).
    pub service_name: String,

    /// Metrics configuration.
    pub metrics: MetricsConfig,

    /// Tracing configuration.
    pub tracing: TracingConfig,

    /// Logging configuration.
    pub logging: LogConfig,
}

impl TelemetryConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> TelemetryConfigBuilder {
        TelemetryConfigBuilder::new()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "loom".to_string(),
            metrics: MetricsConfig::default(),
            tracing: TracingConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Builder for [`TelemetryConfig`].
#[derive(Debug, Default)]
pub struct TelemetryConfigBuilder {
    service_name: Option<String>,
    service_version: Option<String>,
    environment: Option<String>,
    log_level: Option<String>,
    json_logs: Option<bool>,
    otlp_endpoint: Option<String>,
    sample_ratio: Option<f64>,
    metrics_enabled: Option<bool>,
}

impl TelemetryConfigBuilder {
    /// Creates a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the service name.
    #[must_use]
    pub fn service_name(mut self, name: &str) -> Self {
        self.service_name = Some(name.to_string());
        self
    }

    /// Sets the service version reported on the trace resource.
    #[must_use]
    pub fn service_version(mut self, version: &str) -> Self {
        self.service_version = Some(version.to_string());
        self
    }

    /// Sets the deployment environment.
    #[must_use]
    pub fn environment(mut self, env: &str) -> Self {
        self.environment = Some(env.to_string());
        self
    }

    /// Sets the log filter directive.
    #[must_use]
    pub fn log_level(mut self, level: &str) -> Self {
        self.log_level = Some(level.to_string());
        self
    }

    /// Chooses JSON or human-readable log output.
    #[must_use]
    pub fn json_logs(mut self, json: bool) -> Self {
        self.json_logs = Some(json);
        self
    }

    /// Sets the OTLP endpoint and enables span export.
    #[must_use]
    pub fn otlp_endpoint(mut self, endpoint: &str) -> Self {
        self.otlp_endpoint = Some(endpoint.to_string());
        self
    }

    /// Sets the trace sampling ratio.
    #[must_use]
    pub fn sample_ratio(mut self, ratio: f64) -> Self {
        self.sample_ratio = Some(ratio);
        self
    }

    /// Enables or disables the Prometheus recorder.
    #[must_use]
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = Some(enabled);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> TelemetryConfig {
        let defaults = TelemetryConfig::default();
        let service_name = self.service_name.unwrap_or(defaults.service_name);

        let mut metrics = defaults.metrics;
        if let Some(enabled) = self.metrics_enabled {
            metrics.enabled = enabled;
        }

        let mut tracing = defaults.tracing;
        tracing.service_name = service_name.clone();
        if let Some(version) = self.service_version {
            tracing.service_version = version;
        }
        if let Some(environment) = self.environment {
            tracing.environment = environment;
        }
        if let Some(ratio) = self.sample_ratio {
            tracing.sample_ratio = ratio;
        }
        tracing.otlp_endpoint = self.otlp_endpoint;

        let mut logging = defaults.logging;
        logging.service_name = service_name.clone();
        if let Some(level) = self.log_level {
            logging.level = level;
        }
        if let Some(json) = self.json_logs {
            logging.json_format = json;
        }

        TelemetryConfig {
            service_name,
            metrics,
            tracing,
            logging,
        }
    }
}

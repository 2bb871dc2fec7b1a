//! OpenTelemetry distributed tracing.
//!
//! The W3C trace-context propagator is always installed so a client's
//! `traceparent` can be honoured even when no collector is configured.
//! With an OTLP endpoint, spans are batched and exported over gRPC.

use std::collections::HashMap;

use crate::error::TelemetryError;
use crate::TelemetryResult;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// OTLP endpoint (e.g. `http://localhost:4317`). `None` disables export.
    pub otlp_endpoint: Option<String>,

    /// Service name for spans.
    pub service_name: String,

    /// Service version.
    pub service_version: String,

    /// Deployment environment.
    pub environment: String,

    /// Sampling ratio (0.0 to 1.0).
    pub sample_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "loom".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            sample_ratio: 1.0,
        }
    }
}

/// Installs the propagator and, when an endpoint is configured, the
/// exporting tracer provider.
///
/// Returns the provider so the caller can flush it on shutdown.
///
/// # Errors
///
/// Returns `TelemetryError::TracingInit` if the exporter cannot be built.
pub fn init_tracing(config: &TracingConfig) -> TelemetryResult<Option<TracerProvider>> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let Some(endpoint) = config.otlp_endpoint.as_deref() else {
        return Ok(None);
    };

    if !(0.0..=1.0).contains(&config.sample_ratio) {
        return Err(TelemetryError::InvalidConfig(format!(
            "sample_ratio must be within 0.0..=1.0, got {}",
            config.sample_ratio
        )));
    }

    let resource = Resource::new([
        KeyValue::new(
            opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
            config.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
            config.service_version.clone(),
        ),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ]);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracingInit(e.to_string()))?;

    let sampler = if config.sample_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sample_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(config.sample_ratio)))
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_sampler(sampler)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(Some(provider))
}

/// Returns the process-wide tracer.
#[must_use]
pub fn tracer(name: &'static str) -> global::BoxedTracer {
    global::tracer(name)
}

/// Builds a remote parent context from a W3C `traceparent` value.
///
/// Returns `None` when the value does not parse into a valid span context.
/// Parsing does not depend on the globally installed propagator.
pub fn context_from_traceparent(traceparent: &str) -> Option<Context> {
    let mut carrier = HashMap::with_capacity(1);
    carrier.insert("traceparent".to_string(), traceparent.trim().to_string());

    let cx = TraceContextPropagator::new().extract(&carrier);
    if cx.span().span_context().is_valid() {
        Some(cx)
    } else {
        None
    }
}

/// Injects `context` into outgoing headers through the global propagator.
pub fn inject_context(context: &Context, headers: &mut http::HeaderMap) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(context, &mut HeaderInjector(headers));
    });
}

/// Injects `context` as W3C trace context regardless of global state.
pub fn inject_traceparent(context: &Context, headers: &mut http::HeaderMap) {
    TraceContextPropagator::new().inject_context(context, &mut HeaderInjector(headers));
}

/// HTTP header extractor for `http::HeaderMap`.
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl opentelemetry::propagation::Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(http::HeaderName::as_str).collect()
    }
}

/// HTTP header injector for `http::HeaderMap`.
pub struct HeaderInjector<'a>(pub &'a mut http::HeaderMap);

impl opentelemetry::propagation::Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(val)) = (
            http::header::HeaderName::try_from(key),
            http::header::HeaderValue::try_from(&value),
        ) {
            self.0.insert(name, val);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::propagation::{Extractor, Injector};

    const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert!(config.otlp_endpoint.is_none());
        assert!((config.sample_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_context_from_traceparent() {
        let cx = context_from_traceparent(TRACEPARENT).unwrap();
        let span = cx.span();
        let span_context = span.span_context();

        assert!(span_context.is_remote());
        assert_eq!(
            span_context.trace_id().to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        assert_eq!(span_context.span_id().to_string(), "b7ad6b7169203331");
        assert!(span_context.is_sampled());
    }

    #[test]
    fn test_context_from_invalid_traceparent() {
        assert!(context_from_traceparent("").is_none());
        assert!(context_from_traceparent("00-zz-yy-01").is_none());
        assert!(context_from_traceparent(
            "00-00000000000000000000000000000000-b7ad6b7169203331-01"
        )
        .is_none());
    }

    #[test]
    fn test_inject_traceparent_round_trip() {
        let cx = context_from_traceparent(TRACEPARENT).unwrap();
        let mut headers = http::HeaderMap::new();
        inject_traceparent(&cx, &mut headers);

        assert_eq!(headers.get("traceparent").unwrap(), TRACEPARENT);
    }

    #[test]
    fn test_header_extractor() {
        let mut headers = http::HeaderMap::new();
        headers.insert("traceparent", TRACEPARENT.parse().unwrap());

        let extractor = HeaderExtractor(&headers);
        assert_eq!(extractor.get("traceparent"), Some(TRACEPARENT));
        assert!(extractor.get("tracestate").is_none());
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }

    #[test]
    fn test_header_injector() {
        let mut headers = http::HeaderMap::new();

        {
            let mut injector = HeaderInjector(&mut headers);
            injector.set("traceparent", TRACEPARENT.to_string());
        }

        assert_eq!(headers.get("traceparent").unwrap(), TRACEPARENT);
    }

    #[test]
    fn test_disabled_export() {
        let result = init_tracing(&TracingConfig::default());
        assert!(result.unwrap().is_none());
    }
}

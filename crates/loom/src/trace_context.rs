//! Span lifecycle for proxied calls and turns.
//!
//! A request span is created as a child of the open turn, or of the
//! client's `traceparent`, or as a new root. It lives inside the response
//! body, which outlives the handler, so it is carried as an explicit
//! [`Context`] and never as an attached guard. [`Attached`] enters the
//! context around each poll of the body stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use futures_util::Stream;
use http::HeaderMap;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tracing::debug;

use crate::canary::MetadataRecord;

/// How a span ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanOutcome {
    /// The call finished normally.
    Ok,
    /// The call failed.
    Error(String),
    /// The client went away first.
    Cancelled,
}

impl SpanOutcome {
    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error(_) => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Set the final status on the span in `cx` and end it.
pub fn end_span(cx: &Context, outcome: &SpanOutcome) {
    let span = cx.span();
    match outcome {
        SpanOutcome::Ok => span.set_status(Status::Ok),
        SpanOutcome::Error(message) => span.set_status(Status::error(message.clone())),
        SpanOutcome::Cancelled => span.set_attribute(KeyValue::new("loom.cancelled", true)),
    }
    span.end();
}

/// Hex trace id of the span in `cx`, if it is valid.
pub fn trace_id_of(cx: &Context) -> Option<String> {
    let span = cx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// Creates turn and request spans.
pub struct TraceContextManager {
    tracer: BoxedTracer,
}

impl std::fmt::Debug for TraceContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceContextManager").finish_non_exhaustive()
    }
}

impl Default for TraceContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceContextManager {
    /// Use the global `loom` tracer.
    pub fn new() -> Self {
        Self {
            tracer: loom_telemetry::tracing::tracer("loom"),
        }
    }

    /// The client's trace context from metadata, if it parses.
    pub fn parent_for(&self, metadata: &MetadataRecord) -> Option<Context> {
        let traceparent = metadata.traceparent.as_deref()?;
        let cx = loom_telemetry::context_from_traceparent(traceparent);
        if cx.is_none() {
            debug!("Ignoring unparsable traceparent");
        }
        cx
    }

    /// Start the aggregate span for a turn.
    ///
    /// The client's span has usually ended already; the child still joins
    /// its trace because assembly is by identifier.
    pub fn start_turn(&self, metadata: &MetadataRecord) -> Context {
        let parent = self.parent_for(metadata).unwrap_or_else(Context::new);
        let mut attributes = Vec::with_capacity(2);
        if let Some(session_id) = &metadata.session_id {
            attributes.push(KeyValue::new("session.id", session_id.clone()));
        }
        if let Some(source) = &metadata.source {
            attributes.push(KeyValue::new("loom.source", source.clone()));
        }

        let span = self
            .tracer
            .span_builder("loom.turn")
            .with_kind(SpanKind::Internal)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &parent);
        parent.with_span(span)
    }

    /// Start the span for one upstream call.
    ///
    /// `parent` is the open turn's context; without one the client's
    /// `traceparent` is used, and without that the span is a new root.
    pub fn start_request(&self, metadata: &MetadataRecord, parent: Option<&Context>) -> RequestSpan {
        let parent = parent
            .cloned()
            .or_else(|| self.parent_for(metadata))
            .unwrap_or_else(Context::new);

        let mut attributes = vec![KeyValue::new("gen_ai.system", "anthropic")];
        if let Some(session_id) = &metadata.session_id {
            attributes.push(KeyValue::new("session.id", session_id.clone()));
        }

        let span = self
            .tracer
            .span_builder("loom.upstream")
            .with_kind(SpanKind::Client)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &parent);

        RequestSpan {
            cx: parent.with_span(span),
            finished: AtomicBool::new(false),
            started: Instant::now(),
        }
    }
}

/// The span of one upstream call.
///
/// Ends exactly once: through [`finish`](Self::finish) or, failing that,
/// as cancelled on drop.
pub struct RequestSpan {
    cx: Context,
    finished: AtomicBool,
    started: Instant,
}

impl std::fmt::Debug for RequestSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSpan")
            .field("trace_id", &self.trace_id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl RequestSpan {
    /// The span's context.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Hex trace id, if the span is sampled into a valid context.
    pub fn trace_id(&self) -> Option<String> {
        trace_id_of(&self.cx)
    }

    /// Write `traceparent` for this span into outbound headers.
    pub fn inject(&self, headers: &mut HeaderMap) {
        loom_telemetry::tracing::inject_traceparent(&self.cx, headers);
    }

    /// Attach the model and token usage.
    pub fn record_usage(&self, model: Option<&str>, input_tokens: u64, output_tokens: u64) {
        let span = self.cx.span();
        if let Some(model) = model {
            span.set_attribute(KeyValue::new("gen_ai.request.model", model.to_string()));
        }
        span.set_attribute(KeyValue::new(
            "gen_ai.usage.input_tokens",
            i64::try_from(input_tokens).unwrap_or(i64::MAX),
        ));
        span.set_attribute(KeyValue::new(
            "gen_ai.usage.output_tokens",
            i64::try_from(output_tokens).unwrap_or(i64::MAX),
        ));
    }

    /// Record the upstream status code.
    pub fn record_status(&self, status: u16) {
        self.cx
            .span()
            .set_attribute(KeyValue::new("http.response.status_code", i64::from(status)));
    }

    /// Whether the span has ended.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// End the span. Returns `false` if it had already ended.
    pub fn finish(&self, outcome: SpanOutcome) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            debug!(
                outcome = outcome.as_str(),
                "Span already finished; ignoring detach race"
            );
            return false;
        }

        self.cx.span().set_attribute(KeyValue::new(
            "loom.duration_ms",
            i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX),
        ));
        end_span(&self.cx, &outcome);
        true
    }
}

impl Drop for RequestSpan {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.finish(SpanOutcome::Cancelled);
        }
    }
}

/// Makes a context current while an inner stream is polled.
///
/// The guard never crosses a suspension point: it is taken and released
/// within each `poll_next`.
pub struct Attached<S> {
    inner: S,
    cx: Context,
}

impl<S> Attached<S> {
    /// Wrap `inner`.
    pub fn new(inner: S, cx: Context) -> Self {
        Self { inner, cx }
    }
}

impl<S> Stream for Attached<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let _guard = this.cx.clone().attach();
        Pin::new(&mut this.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

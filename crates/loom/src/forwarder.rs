//! Upstream forwarding.
//!
//! Streaming bodies are relayed chunk by chunk without modification while a
//! copy of each chunk feeds the [`SseDecoder`]. Whatever ends the stream
//! (upstream end, upstream error, or the client dropping the body) runs the
//! call's completion exactly once.

use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use loom_telemetry::logging::fields;
use loom_telemetry::metrics::InFlightGuard;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::UpstreamSettings;
use crate::error::{LoomError, LoomResult};
use crate::headers::filter_response_headers;
use crate::pattern::{Pattern, RequestContext};
use crate::sse::{summarize_message, SseDecoder, StreamSummary};
use crate::trace_context::{Attached, RequestSpan, SpanOutcome, TraceContextManager};
use crate::turns::{TurnHandle, TurnTracker};

/// Response body type produced by the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, LoomError>;

/// Longest upstream error body logged.
const ERROR_PREVIEW_LEN: usize = 512;

/// A fully buffered body.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// HTTP client for the upstream API.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl UpstreamClient {
    /// Create a client from settings.
    pub fn new(settings: &UpstreamSettings) -> LoomResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| LoomError::internal(format!("failed to create upstream client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            timeout: settings.timeout,
        })
    }

    /// Send a request and wait for the response head.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> LoomResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);

        self.client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LoomError::upstream_timeout(format!("upstream timed out: {e}"))
                } else {
                    LoomError::upstream_unavailable(format!("upstream request failed: {e}"))
                }
            })
    }

    /// Upstream base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Total timeout per exchange.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Closes out one upstream call: span, turn and metrics.
///
/// Exactly one of [`complete`](Self::complete) or [`fail`](Self::fail)
/// takes effect; dropping the guard first fails the call as cancelled.
pub struct CallCompletion {
    tracker: Arc<TurnTracker>,
    turn: Option<TurnHandle>,
    span: RequestSpan,
    pattern: &'static str,
    started: Instant,
    done: bool,
    _in_flight: InFlightGuard,
}

impl std::fmt::Debug for CallCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCompletion")
            .field("turn", &self.turn)
            .field("pattern", &self.pattern)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl CallCompletion {
    /// Start tracking a call.
    pub fn new(
        tracker: Arc<TurnTracker>,
        turn: Option<TurnHandle>,
        span: RequestSpan,
        pattern: &'static str,
    ) -> Self {
        Self {
            tracker,
            turn,
            span,
            pattern,
            started: Instant::now(),
            done: false,
            _in_flight: InFlightGuard::new(),
        }
    }

    /// The call's span.
    pub fn span(&self) -> &RequestSpan {
        &self.span
    }

    /// The call finished; `summary` says what the model answered.
    pub fn complete(&mut self, summary: &StreamSummary) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        self.record_duration();

        self.span.record_usage(
            summary.model.as_deref(),
            summary.input_tokens,
            summary.output_tokens,
        );
        let outcome = match &summary.error {
            Some(error) => SpanOutcome::Error(error.clone()),
            None => SpanOutcome::Ok,
        };
        self.span.finish(outcome);

        if let Some(turn) = &self.turn {
            self.tracker.complete_call(turn, summary);
        }
    }

    /// The call failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.finish_failed(SpanOutcome::Error(reason.clone()), &reason);
    }

    fn finish_failed(&mut self, outcome: SpanOutcome, reason: &str) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        self.record_duration();
        self.span.finish(outcome);

        if let Some(turn) = &self.turn {
            self.tracker.fail_call(turn, reason);
        }
    }

    fn record_duration(&self) {
        loom_telemetry::metrics::record_upstream_duration(self.pattern, self.started.elapsed());
    }
}

impl Drop for CallCompletion {
    fn drop(&mut self) {
        if !self.done {
            debug!(pattern = self.pattern, "Call dropped before completion");
            self.finish_failed(SpanOutcome::Cancelled, "client disconnected");
        }
    }
}

/// Relays an upstream byte stream while decoding a copy of it.
pub struct ObservedStream<S> {
    inner: S,
    decoder: SseDecoder,
    completion: Option<CallCompletion>,
    bytes: u64,
}

impl<S> ObservedStream<S> {
    /// Observe `inner`, completing `completion` when it ends.
    pub fn new(inner: S, completion: CallCompletion) -> Self {
        Self {
            inner,
            decoder: SseDecoder::new(),
            completion: Some(completion),
            bytes: 0,
        }
    }

    /// Bytes relayed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl<S, E> Stream for ObservedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    type Item = Result<Bytes, LoomError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.decoder.feed(&chunk);
                this.bytes += chunk.len() as u64;
                loom_telemetry::metrics::record_stream_bytes(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let message = format!("upstream stream failed: {e}");
                warn!(relayed = this.bytes, error = %e, "Upstream stream interrupted");
                if let Some(mut completion) = this.completion.take() {
                    completion.fail(message.clone());
                }
                Poll::Ready(Some(Err(LoomError::stream_interrupted(message))))
            }
            Poll::Ready(None) => {
                if let Some(mut completion) = this.completion.take() {
                    let summary = std::mem::take(&mut this.decoder).finish();
                    debug!(
                        relayed = this.bytes,
                        completed = summary.completed,
                        tool_use = summary.has_tool_use(),
                        "Upstream stream finished"
                    );
                    if summary.completed || summary.error.is_some() {
                        completion.complete(&summary);
                    } else {
                        warn!(relayed = this.bytes, "Upstream stream ended before message_stop");
                        completion.fail("stream ended before message_stop");
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sends transformed requests upstream and relays the responses.
pub struct Forwarder {
    client: UpstreamClient,
    tracker: Arc<TurnTracker>,
    traces: Arc<TraceContextManager>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

/// An outbound request after transformation.
#[derive(Debug)]
pub struct Outbound {
    /// Method.
    pub method: Method,
    /// Path and query.
    pub path: String,
    /// Filtered headers.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Bytes,
}

impl Forwarder {
    /// Create a forwarder.
    pub fn new(
        client: UpstreamClient,
        tracker: Arc<TurnTracker>,
        traces: Arc<TraceContextManager>,
    ) -> Self {
        Self {
            client,
            tracker,
            traces,
        }
    }

    /// The turn tracker.
    pub fn tracker(&self) -> &Arc<TurnTracker> {
        &self.tracker
    }

    /// Forward a request and build the client response.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        pattern: &dyn Pattern,
        outbound: Outbound,
    ) -> LoomResult<Response<ProxyBody>> {
        let metadata = &ctx.metadata;
        let turn = metadata
            .turn_key()
            .map(|key| self.tracker.begin_call(&key, metadata));
        let span = self
            .traces
            .start_request(metadata, turn.as_ref().map(TurnHandle::span));

        if let Some(trace_id) = span.trace_id() {
            tracing::Span::current().record(fields::TRACE_ID, trace_id.as_str());
        }

        let mut headers = outbound.headers;
        span.inject(&mut headers);
        let mut completion = CallCompletion::new(Arc::clone(&self.tracker), turn, span, pattern.name());

        let response = match self
            .client
            .send(outbound.method, &outbound.path, headers, outbound.body)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                completion.fail(e.to_string());
                return Err(e);
            }
        };

        let status = response.status();
        completion.span().record_status(status.as_u16());
        crate::quota::observe(response.headers());
        let mut headers = filter_response_headers(response.headers());

        if !status.is_success() {
            return self
                .relay_error(ctx, pattern, status, headers, response, completion)
                .await;
        }

        if is_event_stream(&headers) {
            if let Err(e) = pattern.transform_response(ctx, &mut headers, None) {
                completion.fail(e.to_string());
                return Err(e);
            }

            let span_cx = completion.span().context().clone();
            let observed = ObservedStream::new(Box::pin(response.bytes_stream()), completion);
            let body = StreamBody::new(Attached::new(observed, span_cx).map_ok(Frame::data));
            return Ok(build_response(status, headers, body.boxed_unsync()));
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = LoomError::upstream_unavailable(format!("failed to read upstream body: {e}"));
                completion.fail(err.to_string());
                return Err(err);
            }
        };

        let (summary, bytes) = match serde_json::from_slice::<Value>(&bytes) {
            Ok(mut value) => {
                let summary = summarize_message(&value);
                let original = value.clone();
                if let Err(e) = pattern.transform_response(ctx, &mut headers, Some(&mut value)) {
                    completion.fail(e.to_string());
                    return Err(e);
                }
                let bytes = if value == original {
                    bytes
                } else {
                    Bytes::from(serde_json::to_vec(&value)?)
                };
                (summary, bytes)
            }
            Err(_) => {
                if let Err(e) = pattern.transform_response(ctx, &mut headers, None) {
                    completion.fail(e.to_string());
                    return Err(e);
                }
                let summary = StreamSummary {
                    completed: true,
                    ..Default::default()
                };
                (summary, bytes)
            }
        };

        completion.complete(&summary);
        Ok(build_response(status, headers, full_body(bytes)))
    }

    async fn relay_error(
        &self,
        ctx: &RequestContext,
        pattern: &dyn Pattern,
        status: StatusCode,
        mut headers: HeaderMap,
        response: reqwest::Response,
        mut completion: CallCompletion,
    ) -> LoomResult<Response<ProxyBody>> {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(status = status.as_u16(), error = %e, "Failed to read upstream error body");
                Bytes::new()
            }
        };
        warn!(
            status = status.as_u16(),
            preview = %preview(&bytes),
            "Upstream returned an error"
        );
        completion.fail(format!("upstream returned {status}"));

        if let Err(e) = pattern.transform_response(ctx, &mut headers, None) {
            warn!(error = %e, "Response transform failed on upstream error; relaying untouched");
        }
        Ok(build_response(status, headers, full_body(bytes)))
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("text/event-stream"))
}

fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(ERROR_PREVIEW_LEN);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn build_response(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

//! Proxy HTTP server.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use loom_telemetry::logging::fields;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn, Instrument};

use crate::canary::{CanaryExtractor, MetadataRecord};
use crate::collab::{
    ContextSource, EventSink, HttpMemoryLookup, LogSink, MemorablesSource, MemoryLookup,
    NoMemorables, NoMemories, RedisContextSource, RedisMemorablesSource, RedisSink, StaticContext,
};
use crate::config::LoomConfig;
use crate::envelope::RequestEnvelope;
use crate::error::{ErrorResponse, LoomError, LoomResult};
use crate::forwarder::{full_body, Forwarder, Outbound, ProxyBody, UpstreamClient};
use crate::headers::{filter_request_headers, PropagatedHeaders, HEADER_REQUEST_ID};
use crate::pattern::{
    IdentityPattern, IdentityPrompts, NoiseScrubber, PatternId, PatternRegistry, ProbePattern,
    RequestContext,
};
use crate::trace_context::TraceContextManager;
use crate::turns::TurnTracker;
use crate::watcher::TranscriptWatcher;

/// Budget for one memory search; a slow lookup only costs memories.
const MEMORY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// The external services the proxy talks to besides the upstream API.
#[derive(Clone)]
pub struct Collaborators {
    /// Receives finalized turns and transcript lines.
    pub sink: Arc<dyn EventSink>,
    /// Supplies identity context.
    pub context: Arc<dyn ContextSource>,
    /// Looks up memories.
    pub memories: Arc<dyn MemoryLookup>,
    /// Supplies per-session memorables.
    pub memorables: Arc<dyn MemorablesSource>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            sink: Arc::new(LogSink),
            context: Arc::new(StaticContext::default()),
            memories: Arc::new(NoMemories),
            memorables: Arc::new(NoMemorables),
        }
    }
}

impl Collaborators {
    /// Connect the collaborators named in configuration.
    ///
    /// Redis being unreachable at startup degrades to logging and empty
    /// context rather than refusing to proxy.
    pub async fn connect(config: &LoomConfig) -> LoomResult<Self> {
        let settings = &config.collaborators;
        let mut collaborators = Self::default();

        if let Some(url) = settings.redis_url.as_deref() {
            match RedisSink::connect(url).await {
                Ok(sink) => collaborators.sink = Arc::new(sink),
                Err(e) => warn!(error = %e, "Redis sink unavailable; logging turns instead"),
            }
            match RedisContextSource::connect(url).await {
                Ok(source) => collaborators.context = Arc::new(source),
                Err(e) => warn!(error = %e, "Redis context unavailable; using empty context"),
            }
            match RedisMemorablesSource::connect(url).await {
                Ok(source) => collaborators.memorables = Arc::new(source),
                Err(e) => warn!(error = %e, "Redis memorables unavailable; skipping them"),
            }
        }

        if let Some(url) = settings.memory_url.as_deref() {
            collaborators.memories = Arc::new(HttpMemoryLookup::new(url, MEMORY_LOOKUP_TIMEOUT)?);
        }

        Ok(collaborators)
    }
}

/// Shared per-process state.
struct ProxyState {
    config: Arc<LoomConfig>,
    extractor: CanaryExtractor,
    registry: PatternRegistry,
    forwarder: Forwarder,
    tracker: Arc<TurnTracker>,
    watcher: Option<TranscriptWatcher>,
}

/// The proxy server.
pub struct LoomServer {
    state: Arc<ProxyState>,
}

impl LoomServer {
    /// Create a server, connecting collaborators from configuration.
    pub async fn new(config: LoomConfig) -> LoomResult<Self> {
        let collaborators = Collaborators::connect(&config).await?;
        Self::with_collaborators(config, collaborators)
    }

    /// Create a server with the given collaborators.
    pub fn with_collaborators(config: LoomConfig, collaborators: Collaborators) -> LoomResult<Self> {
        let config = Arc::new(config);
        let traces = Arc::new(TraceContextManager::new());
        let tracker = Arc::new(TurnTracker::new(
            config.turns,
            Arc::clone(&traces),
            Arc::clone(&collaborators.sink),
        ));
        let forwarder = Forwarder::new(
            UpstreamClient::new(&config.upstream)?,
            Arc::clone(&tracker),
            traces,
        );

        let registry = build_registry(&config, &collaborators)?;

        let watcher = config.collaborators.transcripts.then(|| {
            TranscriptWatcher::new(
                Arc::clone(&collaborators.sink),
                config.collaborators.transcript_idle_timeout,
                config.collaborators.transcript_poll_interval,
            )
        });

        Ok(Self {
            state: Arc::new(ProxyState {
                extractor: CanaryExtractor::new(config.canary_markers()),
                config,
                registry,
                forwarder,
                tracker,
                watcher,
            }),
        })
    }

    /// The turn tracker.
    pub fn tracker(&self) -> &Arc<TurnTracker> {
        &self.state.tracker
    }

    /// Bind the configured address and serve until ctrl-c.
    pub async fn run(self) -> LoomResult<()> {
        let server = &self.state.config.server;
        let ip = server
            .listen_addr
            .parse()
            .map_err(|e| LoomError::config(format!("invalid listen address: {e}")))?;
        let addr = SocketAddr::new(ip, server.listen_port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LoomError::server(format!("failed to bind {addr}: {e}")))?;

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    ///
    /// Open connections are left to finish on their own.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> LoomResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let state = self.state;
        let addr = listener.local_addr()?;
        info!(addr = %addr, upstream = %state.config.upstream.url, "Loom listening");
        info!(
            patterns = ?state.registry.ids(),
            default = ?state.registry.default_pattern(),
            "Patterns ready"
        );

        state.tracker.spawn_sweeper()?;
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                () = &mut shutdown => break,
            };

            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| handle_request(req, Arc::clone(&state), peer_addr));

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(error = %e, "Connection error");
                }
            });
        }

        state.tracker.stop_sweeper().await;
        if let Some(watcher) = &state.watcher {
            watcher.shutdown();
        }
        info!(open_turns = state.tracker.open_turns(), "Loom stopped");
        Ok(())
    }
}

fn build_registry(config: &LoomConfig, collaborators: &Collaborators) -> LoomResult<PatternRegistry> {
    let settings = &config.patterns;
    let registry = PatternRegistry::new();

    let scrubber = if settings.identity.scrub_noise {
        Some(NoiseScrubber::new()?)
    } else {
        None
    };
    let identity = IdentityPattern::new(
        IdentityPrompts::load(&settings.identity),
        Arc::clone(&collaborators.context),
        Arc::clone(&collaborators.memories),
    )
    .with_machine_name(settings.identity.machine_name.clone())
    .with_memory_limit(config.collaborators.memory_limit)
    .with_memorables(Arc::clone(&collaborators.memorables))
    .with_scrubber(scrubber);
    registry.register(Arc::new(identity));
    registry.register(Arc::new(ProbePattern::from_settings(&settings.probe)?));

    registry.set_default(config.default_pattern())?;
    Ok(registry)
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    peer_addr: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map_or_else(|| "/".to_string(), ToString::to_string);

    let propagated = PropagatedHeaders::from_inbound(req.headers());
    let request_id = propagated.request_id.clone();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path,
        peer = %peer_addr,
        pattern = tracing::field::Empty,
        session_id = tracing::field::Empty,
        trace_id = tracing::field::Empty,
    );

    async move {
        let internal = match (&method, req.uri().path()) {
            (&Method::GET, "/health") => Some(health(&state)),
            (&Method::GET, "/metrics") => Some(metrics()),
            _ => None,
        };
        let (label, result) = match internal {
            Some(response) => ("internal", Ok(response)),
            None => proxy(&state, req, propagated).await,
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_error() {
                    warn!(error = %e, "Request rejected");
                } else {
                    error!(error = %e, "Request failed");
                }
                error_response(&e, &request_id)
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(HEADER_REQUEST_ID.clone(), value);
        }

        let status = response.status().as_u16();
        if label != "internal" {
            loom_telemetry::metrics::record_request(label, status);
        }
        info!(
            status,
            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Request completed"
        );

        Ok(response)
    }
    .instrument(span)
    .await
}

/// Run one request through the pipeline.
///
/// Returns the pattern label for metrics along with the response.
async fn proxy(
    state: &ProxyState,
    req: Request<Incoming>,
    propagated: PropagatedHeaders,
) -> (&'static str, LoomResult<Response<ProxyBody>>) {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), ToString::to_string);

    let limit = state.config.server.max_request_body_size;
    let bytes = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return (
                "none",
                Err(LoomError::invalid_request(format!("failed to read request body: {e}"))),
            );
        }
    };

    let mut envelope = RequestEnvelope::new(parts.method, path, parts.headers, bytes);
    if *envelope.method() != Method::POST || !envelope.is_json() {
        return ("passthrough", forward_verbatim(state, envelope, propagated).await);
    }

    let metadata = envelope.extract_canary(&state.extractor);
    let current = tracing::Span::current();
    if let Some(session_id) = &metadata.session_id {
        current.record(fields::SESSION_ID, session_id.as_str());
    }

    let selection = match state.registry.select(envelope.headers(), &metadata) {
        Ok(selection) => selection,
        Err(e) => return ("none", Err(e)),
    };
    let pattern = selection.pattern;
    let name = pattern.name();
    current.record(fields::PATTERN, name);
    debug!(source = ?selection.source, model = envelope.model().unwrap_or(""), "Pattern selected");

    if let (Some(watcher), Some(session_id), Some(transcript)) = (
        &state.watcher,
        metadata.session_id.as_deref(),
        metadata.transcript_path.as_deref(),
    ) {
        watcher.watch(session_id, transcript);
    }

    let propagated = propagated.with_session_id(metadata.session_id.clone());
    let ctx = RequestContext::new(propagated.request_id.clone(), Arc::new(metadata));

    if let Err(e) = pattern.transform_request(&ctx, &mut envelope).await {
        let err = match e {
            e @ LoomError::Transform { .. } => e,
            other => LoomError::transform(name, other.to_string()),
        };
        return (name, Err(err));
    }

    let outbound = match to_outbound(envelope, &propagated) {
        Ok(outbound) => outbound,
        Err(e) => return (name, Err(e)),
    };
    (name, state.forwarder.forward(&ctx, pattern.as_ref(), outbound).await)
}

/// Forward a request the pipeline does not apply to.
async fn forward_verbatim(
    state: &ProxyState,
    envelope: RequestEnvelope,
    propagated: PropagatedHeaders,
) -> LoomResult<Response<ProxyBody>> {
    let pattern = state
        .registry
        .get(PatternId::Passthrough)
        .ok_or_else(|| LoomError::internal("passthrough pattern missing"))?;
    let ctx = RequestContext::new(propagated.request_id.clone(), Arc::new(MetadataRecord::default()));
    let outbound = to_outbound(envelope, &propagated)?;
    state.forwarder.forward(&ctx, pattern.as_ref(), outbound).await
}

fn to_outbound(envelope: RequestEnvelope, propagated: &PropagatedHeaders) -> LoomResult<Outbound> {
    let (method, path, headers, body) = envelope.into_parts()?;
    let mut headers = filter_request_headers(&headers);
    propagated.add_to_headers(&mut headers);

    Ok(Outbound {
        method,
        path,
        headers,
        body,
    })
}

fn health(state: &ProxyState) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "open_turns": state.tracker.open_turns(),
    });
    json_response(StatusCode::OK, &body)
}

fn metrics() -> Response<ProxyBody> {
    let text = loom_telemetry::render_metrics().unwrap_or_default();
    let mut response = Response::new(full_body(text));
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

/// Create a JSON response.
fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<ProxyBody> {
    let json = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());

    let mut response = Response::new(full_body(Bytes::from(json)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Create an error response.
fn error_response(err: &LoomError, request_id: &str) -> Response<ProxyBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponse::from(err).with_request_id(request_id);
    json_response(status, &body)
}

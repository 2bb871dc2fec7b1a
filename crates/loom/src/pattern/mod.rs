//! Request/response transform patterns.
//!
//! A pattern decides what the upstream sees and what the client gets back.
//! Exactly one pattern handles a request. Patterns are built once at
//! startup and shared across requests; per-session state, if a pattern
//! ever needs it, is keyed by session ID inside the pattern.
//!
//! # Example
//!
//! ```ignore
//! use loom::pattern::{BoxFuture, Pattern, PatternId, RequestContext};
//!
//! struct Shouting;
//!
//! impl Pattern for Shouting {
//!     fn id(&self) -> PatternId { PatternId::Passthrough }
//!
//!     fn transform_request<'a>(
//!         &'a self,
//!         _ctx: &'a RequestContext,
//!         envelope: &'a mut RequestEnvelope,
//!     ) -> BoxFuture<'a, LoomResult<()>> {
//!         Box::pin(async move {
//!             envelope.modify(|body| { /* ... */ true });
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use http::HeaderMap;
use serde_json::Value;

use crate::canary::MetadataRecord;
use crate::envelope::RequestEnvelope;
use crate::error::{LoomError, LoomResult};

pub mod identity;
pub mod passthrough;
pub mod probe;
pub mod router;
pub mod scrub;

pub use identity::{IdentityPattern, IdentityPrompts};
pub use passthrough::PassthroughPattern;
pub use probe::ProbePattern;
pub use router::{PatternRegistry, Selection, SelectionSource};
pub use scrub::NoiseScrubber;

/// A boxed future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identifier of a registered pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternId {
    /// No-op.
    Passthrough,
    /// Identity composition.
    Identity,
    /// Debug variant.
    Probe,
}

impl PatternId {
    /// Every identifier.
    pub const ALL: [Self; 3] = [Self::Passthrough, Self::Identity, Self::Probe];

    /// Identifier as used in headers and config.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Identity => "identity",
            Self::Probe => "probe",
        }
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternId {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| LoomError::unknown_pattern(name))
    }
}

/// Per-request values shared with the pattern.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request ID.
    pub request_id: String,
    /// Metadata extracted from the canary block.
    pub metadata: Arc<MetadataRecord>,
}

impl RequestContext {
    /// Create a request context.
    pub fn new(request_id: impl Into<String>, metadata: Arc<MetadataRecord>) -> Self {
        Self {
            request_id: request_id.into(),
            metadata,
        }
    }
}

/// A request/response transform.
pub trait Pattern: Send + Sync {
    /// Identifier of this pattern.
    fn id(&self) -> PatternId;

    /// Name used in logs and metrics.
    fn name(&self) -> &'static str {
        self.id().as_str()
    }

    /// Transform the outbound request.
    ///
    /// An error fails the request; nothing is forwarded.
    fn transform_request<'a>(
        &'a self,
        ctx: &'a RequestContext,
        envelope: &'a mut RequestEnvelope,
    ) -> BoxFuture<'a, LoomResult<()>>;

    /// Transform the response.
    ///
    /// `body` is the parsed JSON body of a buffered response, or `None`
    /// for streams and non-JSON bodies.
    fn transform_response(
        &self,
        _ctx: &RequestContext,
        _headers: &mut HeaderMap,
        _body: Option<&mut Value>,
    ) -> LoomResult<()> {
        Ok(())
    }
}

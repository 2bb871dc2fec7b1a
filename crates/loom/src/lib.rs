//! Loom - transparent LLM reverse proxy
//!
//! Loom sits between an agent client and the upstream messages API. The
//! client's requests and responses keep their shape; on the way through the
//! proxy can weave identity into the prompt, strip the metadata the client
//! smuggled in, and trace every model call.
//!
//! # Architecture
//!
//! ```text
//!   client ──► canary ──► router ──► pattern ──► forwarder ──► upstream
//!                 │                                  │
//!                 ▼                                  ▼
//!            metadata ──────► trace context ──► turn tracker ──► event sink
//! ```
//!
//! - [`canary`] pulls the metadata block out of the user message.
//! - [`pattern`] holds the pluggable transforms and the router choosing
//!   between them.
//! - [`compact`] rewrites the client's context-compaction requests.
//! - [`forwarder`] relays the upstream response, streaming or not, while a
//!   copy of the stream feeds the [`sse`] decoder.
//! - [`trace_context`] and [`turns`] group calls into spans and turns.
//!
//! # Example Usage
//!
//! ```bash
//! # Run with a configuration file
//! $ loom --config /etc/loom/loom.toml
//!
//! # Point at a different upstream
//! $ LOOM_UPSTREAM_URL=http://localhost:9000 loom
//! ```

#![doc(html_root_url = "https://docs.rs/loom/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod canary;
pub mod collab;
pub mod compact;
pub mod config;
pub mod envelope;
pub mod error;
pub mod forwarder;
pub mod headers;
pub mod pattern;
pub mod quota;
pub mod server;
pub mod sse;
pub mod trace_context;
pub mod turns;
pub mod watcher;

pub use canary::{CanaryExtractor, MetadataRecord};
pub use collab::{ContextSource, EventSink, MemorablesSource, MemoryLookup};
pub use config::{LoomConfig, LoomConfigBuilder};
pub use error::{LoomError, LoomResult};
pub use pattern::{Pattern, PatternId, PatternRegistry, RequestContext};
pub use server::{Collaborators, LoomServer};
pub use turns::{FinalizedTurn, TurnOutcome, TurnTracker};

/// Loom version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

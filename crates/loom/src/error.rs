//! Error types for the Loom proxy.

use std::fmt;

use thiserror::Error;

/// Errors raised while proxying a request.
#[derive(Debug, Error)]
pub enum LoomError {
    /// A canary marker was found but its payload did not parse.
    ///
    /// Never surfaced to the client: extraction degrades to empty metadata.
    #[error("Malformed metadata: {message}")]
    MalformedMetadata {
        /// Error message.
        message: String,
    },

    /// An explicit selector named a pattern that is not registered.
    #[error("Unknown pattern: {name}")]
    UnknownPattern {
        /// The identifier as given by the client.
        name: String,
    },

    /// The inbound request could not be read.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Error message.
        message: String,
    },

    /// The upstream could not be reached or did not answer in time.
    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable {
        /// Error message.
        message: String,
        /// Whether the failure was a timeout.
        timed_out: bool,
    },

    /// The response stream was closed by one side before it finished.
    #[error("Stream interrupted: {message}")]
    StreamInterrupted {
        /// Error message.
        message: String,
    },

    /// A pattern failed to transform the request or response.
    #[error("Pattern {pattern} failed: {message}")]
    Transform {
        /// Pattern identifier.
        pattern: &'static str,
        /// Error message.
        message: String,
    },

    /// An external collaborator failed.
    #[error("{service} error: {message}")]
    Collaborator {
        /// Collaborator name.
        service: &'static str,
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// Server startup error.
    #[error("Server error: {message}")]
    Server {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request client error.
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl LoomError {
    /// Create a malformed metadata error.
    pub fn malformed_metadata(message: impl Into<String>) -> Self {
        Self::MalformedMetadata {
            message: message.into(),
        }
    }

    /// Create an unknown pattern error.
    pub fn unknown_pattern(name: impl Into<String>) -> Self {
        Self::UnknownPattern { name: name.into() }
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an upstream unavailable error.
    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create an upstream timeout error.
    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
            timed_out: true,
        }
    }

    /// Create a stream interrupted error.
    pub fn stream_interrupted(message: impl Into<String>) -> Self {
        Self::StreamInterrupted {
            message: message.into(),
        }
    }

    /// Create a transform error.
    pub fn transform(pattern: &'static str, message: impl Into<String>) -> Self {
        Self::Transform {
            pattern,
            message: message.into(),
        }
    }

    /// Create a collaborator error.
    pub fn collaborator(service: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            service,
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error.
    #[allow(clippy::match_same_arms)]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedMetadata { .. } => 400,
            Self::UnknownPattern { .. } => 400,
            Self::InvalidRequest { .. } => 400,
            Self::UpstreamUnavailable { timed_out, .. } => {
                if *timed_out {
                    504
                } else {
                    502
                }
            }
            Self::StreamInterrupted { .. } => 502,
            Self::Transform { .. } => 500,
            Self::Collaborator { .. } => 502,
            Self::Config { .. } => 500,
            Self::Server { .. } => 500,
            Self::Io(_) => 500,
            Self::Http(_) => 500,
            Self::Json(_) => 400,
            Self::Request(_) => 502,
            Self::Internal { .. } => 500,
        }
    }

    /// Whether the client caused this error.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Get the error category for metrics and error bodies.
    pub fn category(&self) -> &'static str {
        match self {
            Self::MalformedMetadata { .. } => "malformed_metadata",
            Self::UnknownPattern { .. } => "unknown_pattern",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::StreamInterrupted { .. } => "stream_interrupted",
            Self::Transform { .. } => "transform",
            Self::Collaborator { .. } => "collaborator",
            Self::Config { .. } => "config",
            Self::Server { .. } => "server",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::Json(_) => "json",
            Self::Request(_) => "request",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type for proxy operations.
pub type LoomResult<T> = Result<T, LoomError>;

/// JSON body for errors the proxy originates itself.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    /// Error category.
    pub error: String,
    /// Human-readable message.
    pub message: String,
    /// Request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// Set the request ID.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<&LoomError> for ErrorResponse {
    fn from(err: &LoomError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error, self.message)
    }
}

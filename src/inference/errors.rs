//! Model client error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to
//! build meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to a model provider.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the provider endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The provider did not respond within the request timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the provider.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// A tool call's accumulated arguments were not valid JSON.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_arguments: String, reason: String },

    /// No provider with this name is configured.
    #[error("unknown provider: '{name}'")]
    UnknownProvider { name: String },

    /// The provider exists but has no usable API key.
    #[error("provider '{name}' has no API key configured")]
    MissingCredentials { name: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether the failure is on the transport side (worth surfacing as
    /// "provider unreachable" rather than a model error).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. } | InferenceError::Timeout { .. }
        )
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}

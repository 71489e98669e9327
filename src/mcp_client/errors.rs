//! Remote tool source error types.

use thiserror::Error;

/// Errors that can occur while talking to remote tool sources.
#[derive(Debug, Error)]
pub enum McpError {
    /// A source process failed to start.
    #[error("failed to spawn source '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("source '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for source '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Source returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool reported a failure (`isError: true`).
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// No configuration for the named source, or it is disabled.
    #[error("unknown remote source: '{name}'")]
    UnknownSource { name: String },
}

//! Agent Core error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors that fail a turn or a store operation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model stream failed. Not retried inside the agent.
    #[error("stream error: {0}")]
    StreamError(#[from] InferenceError),

    /// Conversation store operation failed.
    #[error("persistence error: {reason}")]
    PersistenceError { reason: String },

    /// Conversation not found.
    #[error("conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: i64 },

    /// Message not found.
    #[error("message not found: {message_id}")]
    MessageNotFound { message_id: i64 },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// Nested agents would exceed the configured depth.
    #[error("agent depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    /// Settings or wiring problem.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::PersistenceError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

/// Errors from a single tool call.
///
/// These never fail the turn; the model sees the message as an error result.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool ran and failed.
    #[error("{reason}")]
    ExecutionFailed { tool: String, reason: String },

    /// The human declined the call.
    #[error("User denied permission for {tool}")]
    ConsentDeclined { tool: String },

    /// Arguments did not match the tool's schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool exists but is disabled for this turn.
    #[error("tool '{tool}' is disabled")]
    Disabled { tool: String },

    /// No tool with this name is registered.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// A path argument resolves outside the project root.
    #[error("path '{path}' is outside the project directory")]
    PathEscapesRoot { path: String },

    /// A nested agent failed.
    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl ToolError {
    pub fn failed(tool: &str, reason: impl Into<String>) -> Self {
        ToolError::ExecutionFailed {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_args(tool: &str, reason: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_consent_declined(&self) -> bool {
        matches!(self, ToolError::ConsentDeclined { .. })
    }
}

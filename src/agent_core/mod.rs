//! Agent Core — the tool-augmented streaming agent.
//!
//! Submodules:
//! - `agent`: One streaming turn: step loop, reasoning markers, cancellation
//! - `manager`: Agent bookkeeping, nested agents, knowledge aggregation
//! - `tool` / `tool_registry`: Tool contract and the per-turn namespaced tool set
//! - `remote_tools`: Wrapper exposing remote-source tools as regular tools
//! - `builtin_tools`: File, summary and nesting tools
//! - `consent` / `permissions`: Human approval of tool calls and always-allow grants
//! - `context_window`: History conversion and budget truncation
//! - `tokens`: Token estimation for context window budgets
//! - `store` / `database`: Conversation persistence (in-memory and SQLite)
//! - `markup`: Transcript markup helpers
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod agent;
pub mod builtin_tools;
pub mod consent;
pub mod context_window;
pub mod database;
pub mod errors;
pub mod manager;
pub mod markup;
pub mod permissions;
pub mod remote_tools;
pub mod store;
pub mod tokens;
pub mod tool;
pub mod tool_registry;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use agent::{Agent, AgentOptions, TurnOutput, UiSink};
pub use consent::ConsentGate;
pub use database::SqliteConversationStore;
pub use errors::{AgentError, ToolError};
pub use manager::{AgentManager, ManagerParts};
pub use permissions::PermissionStore;
pub use store::{ConversationStore, InMemoryConversationStore};
pub use tool::{ConsentPolicy, ToolDefinition, TurnContext};
pub use tool_registry::ToolRegistry;
pub use types::{
    AgentPhase, ConsentDecision, ConsentRequest, ContextBudget, Conversation, ConversationUpdate,
    NewMessage, StoredMessage, TurnOutcome,
};

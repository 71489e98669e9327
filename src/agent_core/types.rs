//! Shared types for the agent core.
//!
//! Stored conversation messages, store update payloads, UI broadcast
//! payloads, consent request/decision types, and turn bookkeeping.

use serde::{Deserialize, Serialize};

use crate::inference::types::{Role, TokenUsage};

// ─── Conversation Messages ──────────────────────────────────────────────────

/// A single message stored in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Auto-incremented row ID (set by the store on insert).
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    /// Displayed transcript (plain text plus markup tags).
    pub content: String,
    /// Compact JSON of the exact provider messages, for replay.
    pub provider_snapshot: Option<String>,
    /// Largest token usage reported while producing this message.
    pub max_tokens_used: Option<u32>,
    /// ISO 8601 timestamp.
    pub created_at: String,
}

/// Input for inserting a message (no store-assigned fields).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Empty assistant message the agent streams into.
    pub fn placeholder() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
        }
    }
}

/// Partial update of a stored message. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub provider_snapshot: Option<String>,
    pub max_tokens_used: Option<u32>,
}

/// Conversation-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub project_id: i64,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub created_at: String,
}

// ─── UI Broadcast ───────────────────────────────────────────────────────────

/// Payload broadcast to the UI after each transcript change.
///
/// Clients apply last-write-wins per conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    pub conversation_id: i64,
    pub messages: Vec<StoredMessage>,
}

// ─── Consent ────────────────────────────────────────────────────────────────

/// Request sent to the consent UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRequest {
    /// Unique ID used to route the decision back.
    pub request_id: String,
    pub conversation_id: i64,
    pub tool_name: String,
    pub tool_description: String,
    /// Human-readable preview of what the call will do.
    pub input_preview: Option<String>,
}

/// Human decision for a consent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsentDecision {
    AcceptOnce,
    AcceptAlways,
    Decline,
}

impl ConsentDecision {
    pub fn is_allowed(self) -> bool {
        !matches!(self, ConsentDecision::Decline)
    }
}

// ─── Context Budget ─────────────────────────────────────────────────────────

/// Token budget for one turn's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    /// Total context window size in tokens.
    pub context_window: u32,
    /// Tokens reserved for the model's output.
    pub reserved_output: u32,
    /// Tokens used by the system prompt.
    pub system_prompt: u32,
    /// Tokens never filled.
    pub safety_buffer: u32,
    /// Tokens available for conversation history.
    pub available: u32,
}

// ─── Turn Lifecycle ─────────────────────────────────────────────────────────

/// Phase of an agent turn.
///
/// `Idle → Streaming → Finishing | Aborted | Errored`; the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Streaming,
    Finishing,
    Aborted,
    Errored,
}

impl AgentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentPhase::Finishing | AgentPhase::Aborted | AgentPhase::Errored
        )
    }
}

/// Result of a completed (or aborted) turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// `Finishing` or `Aborted`.
    pub phase: AgentPhase,
    /// Committed transcript at the end of the turn.
    pub full_response: String,
    /// Usage reported by the last model step, if any.
    pub usage: Option<TokenUsage>,
    /// Model steps executed.
    pub steps: usize,
}

impl TurnOutcome {
    pub fn was_aborted(&self) -> bool {
        self.phase == AgentPhase::Aborted
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

//! Chat commands: the entry points a UI shell calls.
//!
//! `stream_chat` runs one top-level turn: it records the user message and an
//! empty assistant placeholder, hands the turn to a fresh agent, and reports
//! the outcome. Progress reaches the UI through the `UiSink` passed in.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent_core::agent::{AgentOptions, TurnOutput, UiSink};
use crate::agent_core::permissions::PermissionGrant;
use crate::agent_core::tool::ToolDefinition;
use crate::agent_core::types::{MessageUpdate, NewMessage};
use crate::agent_core::{AgentError, AgentPhase, ConsentDecision, ConversationUpdate, TurnOutcome};
use crate::AppState;

/// Appended to the transcript of a turn the user stopped.
pub const CANCELLED_SUFFIX: &str = "\n\n[Response cancelled by user]";

/// Default system prompt for top-level turns.
pub(crate) const SYSTEM_PROMPT: &str = "\
You are Codiner, an AI coding assistant working inside the user's project. \
Use the available tools to read and change files instead of guessing their content. \
Keep answers short and explain what you changed.";

// ─── Request / Response ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub conversation_id: i64,
    pub prompt: String,
    /// Directory file tools operate in.
    pub project_root: PathBuf,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamResponse {
    pub user_message_id: i64,
    pub assistant_message_id: i64,
    pub phase: AgentPhase,
    pub steps: usize,
    pub tokens_used: Option<u32>,
}

// ─── Commands ───────────────────────────────────────────────────────────────

/// Run one turn of `request.conversation_id`.
///
/// The turn's own agent is deregistered afterwards whatever the outcome;
/// other turns on the same conversation stay cancellable. A cancelled turn
/// keeps its partial transcript with a cancellation note appended.
pub async fn stream_chat(
    state: &AppState,
    request: ChatStreamRequest,
    ui: Arc<dyn UiSink>,
) -> Result<ChatStreamResponse, AgentError> {
    let store = Arc::clone(state.manager.store());
    let conversation_id = request.conversation_id;
    let conversation = store.conversation(conversation_id).await?;

    let user_message_id = store
        .insert_message(conversation_id, NewMessage::user(request.prompt.as_str()))
        .await?;
    let assistant_message_id = store
        .insert_message(conversation_id, NewMessage::placeholder())
        .await?;
    ui.emit(ConversationUpdate {
        conversation_id,
        messages: store.read(conversation_id).await?,
    });

    tracing::info!(
        conversation_id,
        user_message_id,
        assistant_message_id,
        prompt_chars = request.prompt.chars().count(),
        "chat turn started"
    );

    let remote_tools = state.manager.get_remote_tools().await;
    let mut options = AgentOptions::for_conversation(
        conversation_id,
        conversation.project_id,
        request.project_root,
        request.system_prompt.unwrap_or_else(|| SYSTEM_PROMPT.to_string()),
        assistant_message_id,
    );
    options.provider = request.provider;
    options.model = request.model;

    let outcome = run_turn(state, options, Arc::clone(&ui), remote_tools).await?;

    if outcome.was_aborted() {
        let content = format!("{}{CANCELLED_SUFFIX}", outcome.full_response);
        store
            .update(
                assistant_message_id,
                MessageUpdate {
                    content: Some(content),
                    ..Default::default()
                },
            )
            .await?;
        ui.emit(ConversationUpdate {
            conversation_id,
            messages: store.read(conversation_id).await?,
        });
    }

    tracing::info!(
        conversation_id,
        phase = ?outcome.phase,
        steps = outcome.steps,
        response_chars = outcome.full_response.chars().count(),
        "chat turn finished"
    );
    Ok(ChatStreamResponse {
        user_message_id,
        assistant_message_id,
        phase: outcome.phase,
        steps: outcome.steps,
        tokens_used: outcome.usage.map(|u| u.total_tokens),
    })
}

async fn run_turn(
    state: &AppState,
    options: AgentOptions,
    ui: Arc<dyn UiSink>,
    remote_tools: Vec<Arc<dyn ToolDefinition>>,
) -> Result<TurnOutcome, AgentError> {
    let conversation_id = options.conversation_id;
    let mut agent =
        state
            .manager
            .create_agent(options, CancellationToken::new(), TurnOutput::Conversation { ui })?;
    let result = agent.run(remote_tools).await;
    state.manager.unregister(conversation_id, agent.id());
    result
}

/// Deliver the user's answer to a pending consent request.
///
/// Returns `false` when the request is unknown (already answered, or its
/// turn ended).
pub fn resolve_consent(state: &AppState, request_id: &str, decision: ConsentDecision) -> bool {
    tracing::info!(request_id, decision = ?decision, "consent response received");
    state.manager.consent().resolve(request_id, decision)
}

/// Stop every running agent of a conversation. Returns how many were signalled.
pub fn cancel_chat(state: &AppState, conversation_id: i64) -> usize {
    let cancelled = state.manager.cancel_conversation(conversation_id);
    tracing::info!(conversation_id, cancelled, "chat cancellation requested");
    cancelled
}

/// Stop every agent of a conversation and drop its bookkeeping, e.g. when
/// the conversation is reset. Returns how many entries were removed.
pub fn reset_chat(state: &AppState, conversation_id: i64) -> usize {
    state.manager.cancel_conversation(conversation_id);
    state.manager.consent().clear_pending_for_conversation(conversation_id);
    let removed = state.manager.clear_agents(conversation_id);
    tracing::info!(conversation_id, removed, "chat reset");
    removed
}

/// Always-allow grants recorded for a conversation.
pub fn list_tool_permissions(state: &AppState, conversation_id: i64) -> Vec<PermissionGrant> {
    state
        .manager
        .consent()
        .permissions()
        .list_for_conversation(conversation_id)
}

/// Withdraw an always-allow grant. Returns `false` if none existed.
pub fn revoke_tool_permission(state: &AppState, conversation_id: i64, tool_name: &str) -> bool {
    state
        .manager
        .consent()
        .permissions()
        .revoke(conversation_id, tool_name)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

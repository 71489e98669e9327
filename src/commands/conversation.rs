//! Conversation commands: create, load, and inspect the context budget.

use serde::Serialize;

use super::chat::SYSTEM_PROMPT;
use crate::agent_core::tokens::{estimate_system_prompt_tokens, truncate_utf8};
use crate::agent_core::{AgentError, ContextBudget, Conversation, StoredMessage};
use crate::inference::types::Role;
use crate::AppState;

/// Longest first-prompt preview returned with a conversation.
const PREVIEW_MAX_BYTES: usize = 80;

/// A conversation with its full message log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub conversation: Conversation,
    pub messages: Vec<StoredMessage>,
    /// First user prompt, shortened for list displays.
    pub preview: Option<String>,
}

/// Start a new conversation in a project. Returns its id.
pub async fn create_conversation(state: &AppState, project_id: i64) -> Result<i64, AgentError> {
    let id = state.manager.store().create_conversation(project_id).await?;
    tracing::info!(conversation_id = id, project_id, "conversation created");
    Ok(id)
}

pub async fn load_conversation(
    state: &AppState,
    conversation_id: i64,
) -> Result<ConversationView, AgentError> {
    let store = state.manager.store();
    let conversation = store.conversation(conversation_id).await?;
    let messages = store.read(conversation_id).await?;
    let preview = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| {
            if m.content.len() > PREVIEW_MAX_BYTES {
                format!("{}…", truncate_utf8(&m.content, PREVIEW_MAX_BYTES - 3))
            } else {
                m.content.clone()
            }
        });
    Ok(ConversationView {
        conversation,
        messages,
        preview,
    })
}

/// History budget a turn on `provider` would get with the default prompt.
pub fn get_context_budget(
    state: &AppState,
    provider: Option<&str>,
) -> Result<ContextBudget, AgentError> {
    let model = state
        .manager
        .factory()
        .resolve(provider, None)
        .map_err(|e| AgentError::ConfigError {
            reason: e.to_string(),
        })?;
    Ok(ContextBudget::compute(
        model.context_window,
        model.max_tokens,
        estimate_system_prompt_tokens(SYSTEM_PROMPT),
        state.manager.limits().safety_buffer_tokens,
    ))
}

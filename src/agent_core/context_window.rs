//! Conversation history and context window management.
//!
//! Converts stored messages into provider-agnostic history, computes the
//! per-turn token budget, and truncates history to the newest messages
//! that fit.

use crate::inference::types::{ModelMessage, Role};

use super::types::{ContextBudget, StoredMessage};

// ─── History Conversion ─────────────────────────────────────────────────────

/// Convert one stored message into model messages.
///
/// Messages with a provider snapshot replay it exactly. Otherwise the
/// displayed content is sent as plain text; empty messages yield nothing.
pub fn stored_to_model_messages(message: &StoredMessage) -> Vec<ModelMessage> {
    if let Some(ref snapshot) = message.provider_snapshot {
        match serde_json::from_str::<Vec<ModelMessage>>(snapshot) {
            Ok(messages) if !messages.is_empty() => return messages,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    message_id = message.id,
                    error = %e,
                    "unreadable provider snapshot, falling back to content"
                );
            }
        }
    }

    if message.content.is_empty() {
        return Vec::new();
    }
    vec![ModelMessage::text(message.role, message.content.clone())]
}

/// Build the full provider-agnostic history of a conversation.
///
/// `exclude` skips one message id (the placeholder being streamed into).
pub fn build_history(messages: &[StoredMessage], exclude: Option<i64>) -> Vec<ModelMessage> {
    messages
        .iter()
        .filter(|m| Some(m.id) != exclude)
        .flat_map(stored_to_model_messages)
        .collect()
}

// ─── Budget ─────────────────────────────────────────────────────────────────

impl ContextBudget {
    /// `available = context_window - reserved_output - system_prompt - safety_buffer`,
    /// saturating at zero.
    pub fn compute(
        context_window: u32,
        reserved_output: u32,
        system_prompt: u32,
        safety_buffer: u32,
    ) -> Self {
        let available = context_window
            .saturating_sub(reserved_output)
            .saturating_sub(system_prompt)
            .saturating_sub(safety_buffer);
        Self {
            context_window,
            reserved_output,
            system_prompt,
            safety_buffer,
            available,
        }
    }
}

// ─── Truncation ─────────────────────────────────────────────────────────────

/// History retained for a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedHistory {
    pub messages: Vec<ModelMessage>,
    /// Number of oldest messages dropped.
    pub dropped: usize,
    /// Estimated tokens of the retained messages.
    pub tokens: u32,
}

/// Keep the longest contiguous suffix of `messages` whose estimated token
/// sum is at most `budget`, accumulating newest-first.
///
/// If the newest message alone exceeds the budget the result is empty.
pub fn truncate_history<F>(messages: Vec<ModelMessage>, budget: u32, estimate: F) -> TruncatedHistory
where
    F: Fn(&ModelMessage) -> u32,
{
    let total = messages.len();
    let mut used: u64 = 0;
    let mut keep = 0usize;

    for message in messages.iter().rev() {
        let cost = u64::from(estimate(message));
        if used + cost > u64::from(budget) {
            break;
        }
        used += cost;
        keep += 1;
    }

    let dropped = total - keep;
    if dropped > 0 {
        if keep == 0 {
            tracing::warn!(
                budget,
                message_count = total,
                "newest message alone exceeds the history budget, sending no history"
            );
        } else {
            tracing::warn!(
                budget,
                dropped,
                kept = keep,
                "history truncated to fit the context window"
            );
        }
    }

    let messages = messages.into_iter().skip(dropped).collect();
    TruncatedHistory {
        messages,
        dropped,
        tokens: used as u32,
    }
}

/// Drop leading tool-result messages whose originating call was truncated away.
///
/// Providers reject a `tool` message that does not follow its assistant call.
pub fn drop_orphaned_tool_results(history: &mut TruncatedHistory) {
    let orphans = history
        .messages
        .iter()
        .take_while(|m| m.role == Role::Tool)
        .count();
    if orphans > 0 {
        history.messages.drain(..orphans);
        history.dropped += orphans;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

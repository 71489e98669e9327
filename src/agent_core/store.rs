//! Conversation Store contract and an in-memory implementation.
//!
//! The agent reads the ordered message log of a conversation and updates a
//! single assistant message as the turn progresses. `SqliteConversationStore`
//! in `database.rs` is the persistent implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::errors::AgentError;
use super::types::{Conversation, MessageUpdate, NewMessage, StoredMessage};

/// Ordered message log per conversation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation scoped to a project and return its id.
    async fn create_conversation(&self, project_id: i64) -> Result<i64, AgentError>;

    /// Conversation metadata.
    async fn conversation(&self, conversation_id: i64) -> Result<Conversation, AgentError>;

    /// All messages of a conversation, ordered by id.
    async fn read(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, AgentError>;

    /// Append a message and return its id.
    async fn insert_message(
        &self,
        conversation_id: i64,
        message: NewMessage,
    ) -> Result<i64, AgentError>;

    /// Apply a partial update to one message.
    async fn update(&self, message_id: i64, update: MessageUpdate) -> Result<(), AgentError>;

    async fn set_summary(&self, conversation_id: i64, summary: &str) -> Result<(), AgentError>;
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─── In-memory ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    next_conversation_id: i64,
    next_message_id: i64,
    conversations: BTreeMap<i64, Conversation>,
    messages: BTreeMap<i64, StoredMessage>,
}

/// Process-local store. Ids start at 1 and increase monotonically.
#[derive(Default)]
pub struct InMemoryConversationStore {
    state: Mutex<MemoryState>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, AgentError> {
        self.state.lock().map_err(|_| AgentError::PersistenceError {
            reason: "in-memory store lock poisoned".into(),
        })
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self, project_id: i64) -> Result<i64, AgentError> {
        let mut state = self.lock()?;
        state.next_conversation_id += 1;
        let id = state.next_conversation_id;
        state.conversations.insert(
            id,
            Conversation {
                id,
                project_id,
                title: None,
                summary: None,
                created_at: now_rfc3339(),
            },
        );
        Ok(id)
    }

    async fn conversation(&self, conversation_id: i64) -> Result<Conversation, AgentError> {
        self.lock()?
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(AgentError::ConversationNotFound { conversation_id })
    }

    async fn read(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, AgentError> {
        let state = self.lock()?;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(AgentError::ConversationNotFound { conversation_id });
        }
        Ok(state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn insert_message(
        &self,
        conversation_id: i64,
        message: NewMessage,
    ) -> Result<i64, AgentError> {
        let mut state = self.lock()?;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(AgentError::ConversationNotFound { conversation_id });
        }
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.insert(
            id,
            StoredMessage {
                id,
                conversation_id,
                role: message.role,
                content: message.content,
                provider_snapshot: None,
                max_tokens_used: None,
                created_at: now_rfc3339(),
            },
        );
        Ok(id)
    }

    async fn update(&self, message_id: i64, update: MessageUpdate) -> Result<(), AgentError> {
        let mut state = self.lock()?;
        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or(AgentError::MessageNotFound { message_id })?;
        if let Some(content) = update.content {
            message.content = content;
        }
        if let Some(snapshot) = update.provider_snapshot {
            message.provider_snapshot = Some(snapshot);
        }
        if let Some(tokens) = update.max_tokens_used {
            message.max_tokens_used = Some(tokens);
        }
        Ok(())
    }

    async fn set_summary(&self, conversation_id: i64, summary: &str) -> Result<(), AgentError> {
        let mut state = self.lock()?;
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AgentError::ConversationNotFound { conversation_id })?;
        conversation.summary = Some(summary.to_string());
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;

    #[tokio::test]
    async fn test_insert_and_read_in_order() {
        let store = InMemoryConversationStore::new();
        let conv = store.create_conversation(1).await.unwrap();
        let a = store.insert_message(conv, NewMessage::user("hi")).await.unwrap();
        let b = store.insert_message(conv, NewMessage::placeholder()).await.unwrap();
        assert!(b > a);

        let messages = store.read(conv).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "");
    }

    #[tokio::test]
    async fn test_read_is_scoped_to_conversation() {
        let store = InMemoryConversationStore::new();
        let c1 = store.create_conversation(1).await.unwrap();
        let c2 = store.create_conversation(1).await.unwrap();
        store.insert_message(c1, NewMessage::user("one")).await.unwrap();
        store.insert_message(c2, NewMessage::user("two")).await.unwrap();
        let messages = store.read(c2).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "two");
    }

    #[tokio::test]
    async fn test_partial_update_leaves_other_fields() {
        let store = InMemoryConversationStore::new();
        let conv = store.create_conversation(1).await.unwrap();
        let id = store.insert_message(conv, NewMessage::placeholder()).await.unwrap();

        store
            .update(id, MessageUpdate { content: Some("partial".into()), ..Default::default() })
            .await
            .unwrap();
        store
            .update(id, MessageUpdate { max_tokens_used: Some(42), ..Default::default() })
            .await
            .unwrap();

        let msg = &store.read(conv).await.unwrap()[0];
        assert_eq!(msg.content, "partial");
        assert_eq!(msg.max_tokens_used, Some(42));
        assert!(msg.provider_snapshot.is_none());
    }

    #[tokio::test]
    async fn test_missing_ids_are_errors() {
        let store = InMemoryConversationStore::new();
        assert!(matches!(
            store.read(99).await,
            Err(AgentError::ConversationNotFound { conversation_id: 99 })
        ));
        assert!(matches!(
            store.update(5, MessageUpdate::default()).await,
            Err(AgentError::MessageNotFound { message_id: 5 })
        ));
    }

    #[tokio::test]
    async fn test_set_summary() {
        let store = InMemoryConversationStore::new();
        let conv = store.create_conversation(3).await.unwrap();
        store.set_summary(conv, "Fix login").await.unwrap();
        let meta = store.conversation(conv).await.unwrap();
        assert_eq!(meta.summary.as_deref(), Some("Fix login"));
        assert_eq!(meta.project_id, 3);
    }
}

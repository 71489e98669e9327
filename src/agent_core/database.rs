//! SQLite implementation of the Conversation Store.
//!
//! Uses `rusqlite` synchronously behind a mutex; every call holds the lock
//! for one short statement batch and never across an await point.
//! WAL mode is enabled for concurrent reads during streaming.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::errors::AgentError;
use super::store::{now_rfc3339, ConversationStore};
use super::types::{Conversation, MessageUpdate, NewMessage, StoredMessage};
use crate::inference::types::Role;

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite-backed conversation store.
pub struct SqliteConversationStore {
    conn: Mutex<Connection>,
}

impl SqliteConversationStore {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AgentError> {
        self.conn.lock().map_err(|_| AgentError::PersistenceError {
            reason: "database lock poisoned".into(),
        })
    }

    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                title TEXT,
                summary TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                provider_snapshot TEXT,
                max_tokens_used INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, id);
            ",
        )?;
        Ok(())
    }

    fn conversation_exists(conn: &Connection, conversation_id: i64) -> Result<bool, AgentError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_conversation(&self, project_id: i64) -> Result<i64, AgentError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conversations (project_id, created_at) VALUES (?1, ?2)",
            params![project_id, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn conversation(&self, conversation_id: i64) -> Result<Conversation, AgentError> {
        self.conn()?
            .query_row(
                "SELECT id, project_id, title, summary, created_at
                 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        title: row.get(2)?,
                        summary: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or(AgentError::ConversationNotFound { conversation_id })
    }

    async fn read(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, AgentError> {
        let conn = self.conn()?;
        if !Self::conversation_exists(&conn, conversation_id)? {
            return Err(AgentError::ConversationNotFound { conversation_id });
        }

        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, provider_snapshot,
                    max_tokens_used, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    async fn insert_message(
        &self,
        conversation_id: i64,
        message: NewMessage,
    ) -> Result<i64, AgentError> {
        let conn = self.conn()?;
        if !Self::conversation_exists(&conn, conversation_id)? {
            return Err(AgentError::ConversationNotFound { conversation_id });
        }
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation_id,
                message.role.as_str(),
                message.content,
                now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update(&self, message_id: i64, update: MessageUpdate) -> Result<(), AgentError> {
        let changed = self.conn()?.execute(
            "UPDATE messages SET
                content = COALESCE(?2, content),
                provider_snapshot = COALESCE(?3, provider_snapshot),
                max_tokens_used = COALESCE(?4, max_tokens_used)
             WHERE id = ?1",
            params![
                message_id,
                update.content,
                update.provider_snapshot,
                update.max_tokens_used
            ],
        )?;
        if changed == 0 {
            return Err(AgentError::MessageNotFound { message_id });
        }
        Ok(())
    }

    async fn set_summary(&self, conversation_id: i64, summary: &str) -> Result<(), AgentError> {
        let changed = self.conn()?.execute(
            "UPDATE conversations SET summary = ?2 WHERE id = ?1",
            params![conversation_id, summary],
        )?;
        if changed == 0 {
            return Err(AgentError::ConversationNotFound { conversation_id });
        }
        Ok(())
    }
}

// ─── Row Mapping ────────────────────────────────────────────────────────────

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: Role::parse(&role),
        content: row.get(3)?,
        provider_snapshot: row.get(4)?,
        max_tokens_used: row.get(5)?,
        created_at: row.get(6)?,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

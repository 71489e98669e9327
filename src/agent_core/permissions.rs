//! Permission Store — "always allow" grants for tool execution.
//!
//! A grant is keyed by (conversation id, tool name) and lives for the rest of
//! the process. The consent gate checks `PermissionStore::check()` before
//! prompting; an active grant skips the prompt.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

// ─── Types ──────────────────────────────────────────────────────────────────

/// A single permission grant.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionGrant {
    pub conversation_id: i64,
    pub tool_name: String,
    /// ISO 8601 timestamp when the grant was created.
    pub granted_at: String,
}

/// Result of checking a tool's permission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// An always-allow grant exists; skip the prompt.
    Allowed,
    /// No grant; ask the human.
    NeedsConfirmation,
}

// ─── PermissionStore ────────────────────────────────────────────────────────

/// In-memory grants shared by every turn of the process.
#[derive(Default)]
pub struct PermissionStore {
    grants: Mutex<HashMap<(i64, String), PermissionGrant>>,
}

impl PermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `tool_name` is always allowed in `conversation_id`.
    pub fn check(&self, conversation_id: i64, tool_name: &str) -> PermissionStatus {
        let allowed = self
            .grants
            .lock()
            .map(|g| g.contains_key(&(conversation_id, tool_name.to_string())))
            .unwrap_or(false);
        if allowed {
            PermissionStatus::Allowed
        } else {
            PermissionStatus::NeedsConfirmation
        }
    }

    /// Record an always-allow grant.
    pub fn grant(&self, conversation_id: i64, tool_name: &str) {
        let grant = PermissionGrant {
            conversation_id,
            tool_name: tool_name.to_string(),
            granted_at: chrono::Utc::now().to_rfc3339(),
        };
        match self.grants.lock() {
            Ok(mut grants) => {
                grants.insert((conversation_id, tool_name.to_string()), grant);
                tracing::info!(conversation_id, tool = tool_name, "permission granted");
            }
            Err(_) => {
                tracing::warn!(tool = tool_name, "permission store lock poisoned, grant dropped");
            }
        }
    }

    /// Revoke a grant. Returns whether one existed.
    pub fn revoke(&self, conversation_id: i64, tool_name: &str) -> bool {
        let removed = self
            .grants
            .lock()
            .map(|mut g| g.remove(&(conversation_id, tool_name.to_string())).is_some())
            .unwrap_or(false);
        if removed {
            tracing::info!(conversation_id, tool = tool_name, "permission revoked");
        }
        removed
    }

    /// Grants recorded for one conversation, sorted by tool name.
    pub fn list_for_conversation(&self, conversation_id: i64) -> Vec<PermissionGrant> {
        let mut grants: Vec<PermissionGrant> = self
            .grants
            .lock()
            .map(|g| {
                g.values()
                    .filter(|grant| grant.conversation_id == conversation_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        grants.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        grants
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

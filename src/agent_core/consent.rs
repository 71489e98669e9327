//! Consent Gate — human approval before a tool runs.
//!
//! Each request gets a oneshot channel parked under a fresh request id and
//! is published on an outbound channel for the UI. The UI answers through
//! `resolve()`. Waits end on a decision, on turn cancellation, or when the
//! conversation's pending requests are cleared; the last two count as a
//! decline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::permissions::{PermissionStatus, PermissionStore};
use super::types::{ConsentDecision, ConsentRequest};

struct PendingConsent {
    conversation_id: i64,
    respond: oneshot::Sender<ConsentDecision>,
}

/// Routes consent requests to the UI and decisions back to waiting tools.
pub struct ConsentGate {
    permissions: Arc<PermissionStore>,
    pending: Mutex<HashMap<String, PendingConsent>>,
    outbound: mpsc::UnboundedSender<ConsentRequest>,
}

impl ConsentGate {
    /// Create a gate and the receiver the UI layer drains.
    pub fn new(
        permissions: Arc<PermissionStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ConsentRequest>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let gate = Self {
            permissions,
            pending: Mutex::new(HashMap::new()),
            outbound,
        };
        (gate, rx)
    }

    pub fn permissions(&self) -> &Arc<PermissionStore> {
        &self.permissions
    }

    /// Ask for consent to run `tool_name`, waiting for the human.
    ///
    /// Returns immediately when an always-allow grant exists for this
    /// conversation and tool.
    pub async fn request(
        &self,
        conversation_id: i64,
        tool_name: &str,
        tool_description: &str,
        input_preview: Option<String>,
        cancel: &CancellationToken,
    ) -> ConsentDecision {
        if self.permissions.check(conversation_id, tool_name) == PermissionStatus::Allowed {
            tracing::debug!(conversation_id, tool = tool_name, "consent skipped, always allowed");
            return ConsentDecision::AcceptAlways;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(
                    request_id.clone(),
                    PendingConsent {
                        conversation_id,
                        respond: tx,
                    },
                );
            }
            Err(_) => {
                tracing::warn!(tool = tool_name, "consent state poisoned, declining");
                return ConsentDecision::Decline;
            }
        }

        let request = ConsentRequest {
            request_id: request_id.clone(),
            conversation_id,
            tool_name: tool_name.to_string(),
            tool_description: tool_description.to_string(),
            input_preview,
        };
        if self.outbound.send(request).is_err() {
            tracing::warn!(tool = tool_name, "no consent listener, declining");
            self.take_pending(&request_id);
            return ConsentDecision::Decline;
        }
        tracing::info!(conversation_id, tool = tool_name, request_id = %request_id, "awaiting consent");

        let decision = tokio::select! {
            result = rx => result.unwrap_or(ConsentDecision::Decline),
            _ = cancel.cancelled() => {
                self.take_pending(&request_id);
                ConsentDecision::Decline
            }
        };

        if decision == ConsentDecision::AcceptAlways {
            self.permissions.grant(conversation_id, tool_name);
        }
        tracing::info!(
            conversation_id,
            tool = tool_name,
            decision = ?decision,
            "consent resolved"
        );
        decision
    }

    /// Deliver a human decision. Returns `false` if the request is unknown.
    pub fn resolve(&self, request_id: &str, decision: ConsentDecision) -> bool {
        match self.take_pending(request_id) {
            Some(pending) => pending.respond.send(decision).is_ok(),
            None => {
                tracing::warn!(request_id, "no pending consent request, decision ignored");
                false
            }
        }
    }

    /// Decline every pending request of a conversation. Returns how many.
    pub fn clear_pending_for_conversation(&self, conversation_id: i64) -> usize {
        let drained: Vec<PendingConsent> = match self.pending.lock() {
            Ok(mut pending) => {
                let ids: Vec<String> = pending
                    .iter()
                    .filter(|(_, p)| p.conversation_id == conversation_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.iter().filter_map(|id| pending.remove(id)).collect()
            }
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.respond.send(ConsentDecision::Decline);
        }
        if count > 0 {
            tracing::info!(conversation_id, cleared = count, "pending consent requests cleared");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn take_pending(&self, request_id: &str) -> Option<PendingConsent> {
        self.pending.lock().ok()?.remove(request_id)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

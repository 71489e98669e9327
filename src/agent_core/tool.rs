//! Tool contract shared by built-in and remote tools.
//!
//! A tool declares its schema, its default consent policy, how to preview
//! and render a call, and how to execute it against a `TurnContext`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::consent::ConsentGate;
use super::errors::ToolError;
use super::manager::AgentManager;
use super::store::ConversationStore;
use super::types::ConsentDecision;
use crate::inference::types::ToolSchema;

// ─── Consent Policy ─────────────────────────────────────────────────────────

/// Whether a tool needs human approval before each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentPolicy {
    Always,
    Ask,
}

// ─── Markup Events ──────────────────────────────────────────────────────────

/// Transcript output produced while a tool runs.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkupEvent {
    /// Replaces the uncommitted preview shown after the transcript.
    Preview(String),
    /// Appended to the transcript (followed by a newline); clears the preview.
    Complete(String),
}

// ─── Turn Context ───────────────────────────────────────────────────────────

/// Flags shared by every tool call of one turn.
#[derive(Debug, Default)]
pub struct TurnFlags {
    files_changed: AtomicBool,
}

impl TurnFlags {
    pub fn mark_files_changed(&self) {
        self.files_changed.store(true, Ordering::Relaxed);
    }

    pub fn files_changed(&self) -> bool {
        self.files_changed.load(Ordering::Relaxed)
    }
}

/// Everything a tool may use while executing.
#[derive(Clone)]
pub struct TurnContext {
    pub conversation_id: i64,
    pub project_id: i64,
    pub project_root: PathBuf,
    /// Message the turn streams into. `None` for nested agents.
    pub message_id: Option<i64>,
    /// Nesting depth: 0 for a top-level turn.
    pub depth: u32,
    pub cancel: CancellationToken,
    pub store: Arc<dyn ConversationStore>,
    pub manager: Arc<AgentManager>,
    pub flags: Arc<TurnFlags>,
    consent: Arc<ConsentGate>,
    markup: mpsc::UnboundedSender<MarkupEvent>,
}

/// Construction parameters for a [`TurnContext`].
pub struct TurnContextParts {
    pub conversation_id: i64,
    pub project_id: i64,
    pub project_root: PathBuf,
    pub message_id: Option<i64>,
    pub depth: u32,
    pub cancel: CancellationToken,
    pub store: Arc<dyn ConversationStore>,
    pub manager: Arc<AgentManager>,
    pub consent: Arc<ConsentGate>,
}

impl TurnContext {
    /// Create a context and the receiver for the markup it emits.
    pub fn new(parts: TurnContextParts) -> (Self, mpsc::UnboundedReceiver<MarkupEvent>) {
        let (markup, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            conversation_id: parts.conversation_id,
            project_id: parts.project_id,
            project_root: parts.project_root,
            message_id: parts.message_id,
            depth: parts.depth,
            cancel: parts.cancel,
            store: parts.store,
            manager: parts.manager,
            flags: Arc::new(TurnFlags::default()),
            consent: parts.consent,
            markup,
        };
        (ctx, rx)
    }

    /// Replace the streaming preview.
    pub fn emit_preview(&self, markup: impl Into<String>) {
        let _ = self.markup.send(MarkupEvent::Preview(markup.into()));
    }

    /// Commit a finished block to the transcript.
    pub fn emit_complete(&self, markup: impl Into<String>) {
        let _ = self.markup.send(MarkupEvent::Complete(markup.into()));
    }

    /// Sender nested agents forward their progress through.
    pub fn markup_sender(&self) -> mpsc::UnboundedSender<MarkupEvent> {
        self.markup.clone()
    }

    /// Ask the human whether `tool_name` may run.
    pub async fn request_consent(
        &self,
        tool_name: &str,
        tool_description: &str,
        input_preview: Option<String>,
    ) -> ConsentDecision {
        self.consent
            .request(
                self.conversation_id,
                tool_name,
                tool_description,
                input_preview,
                &self.cancel,
            )
            .await
    }
}

// ─── Tool Definition ────────────────────────────────────────────────────────

/// A named capability the model can invoke mid-stream.
#[async_trait]
pub trait ToolDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn input_schema(&self) -> Value;

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Ask
    }

    fn is_enabled(&self, _ctx: &TurnContext) -> bool {
        true
    }

    /// One-line description of what this call will do, shown when asking.
    fn consent_preview(&self, _args: &Value) -> Option<String> {
        None
    }

    /// Markup for this call. `complete` is false while arguments stream in.
    fn build_markup(&self, _args: &Value, _complete: bool) -> Option<String> {
        None
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.input_schema(),
        }
    }
}

/// Deserialize tool arguments into a typed struct.
pub fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::invalid_args(tool, e.to_string()))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consent_policy_yaml_names() {
        let p: ConsentPolicy = serde_yaml::from_str("ask").unwrap();
        assert_eq!(p, ConsentPolicy::Ask);
        let p: ConsentPolicy = serde_yaml::from_str("always").unwrap();
        assert_eq!(p, ConsentPolicy::Always);
    }

    #[test]
    fn test_turn_flags() {
        let flags = TurnFlags::default();
        assert!(!flags.files_changed());
        flags.mark_files_changed();
        assert!(flags.files_changed());
    }

    #[derive(Debug, serde::Deserialize)]
    struct PathArgs {
        path: String,
    }

    #[test]
    fn test_parse_args() {
        let ok: PathArgs = parse_args("read_file", serde_json::json!({"path": "a"})).unwrap();
        assert_eq!(ok.path, "a");
        let err = parse_args::<PathArgs>("read_file", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}

//! Tool Registry — one namespaced tool set per turn.
//!
//! Dispatch order for a model-issued call:
//! 1. Look the tool up and check it is enabled
//! 2. Resolve the effective consent policy (settings override, else default)
//! 3. Ask for consent when the policy is `ask`
//! 4. Execute, then commit the tool's completed markup
//! 5. Truncate the result before it goes back to the model
//!
//! Failures commit an error record to the transcript and are returned so the
//! agent can hand them to the model as an error result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use super::errors::ToolError;
use super::markup::{parse_partial_json, tool_error_markup};
use super::tokens::truncate_utf8;
use super::tool::{ConsentPolicy, ToolDefinition, TurnContext};
use crate::inference::types::{ToolCall, ToolSchema};

/// Separator between the source and tool parts of a remote tool key.
pub const NAMESPACE_SEPARATOR: &str = "__";

// ─── Namespacing ────────────────────────────────────────────────────────────

/// Map a name onto `[A-Za-z0-9_-]` injectively.
///
/// ASCII letters and digits pass through. Every other byte, `-` included,
/// becomes `-xx` (lowercase hex). `_` passes through unless it is the last
/// character or is followed by another `_`, in which case it is escaped.
/// The output therefore never contains `__` and never ends with `_`.
pub fn sanitize(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = String::with_capacity(name.len());
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => out.push(char::from(b)),
            b'_' => {
                let next = bytes.get(i + 1);
                if next.is_none() || next == Some(&b'_') {
                    out.push_str("-5f");
                } else {
                    out.push('_');
                }
            }
            _ => out.push_str(&format!("-{b:02x}")),
        }
    }
    out
}

/// Registry key for a tool exposed by a remote source.
pub fn namespaced_key(source: &str, tool: &str) -> String {
    format!("{}{NAMESPACE_SEPARATOR}{}", sanitize(source), sanitize(tool))
}

/// Split a namespaced key into its sanitized source and tool parts.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(NAMESPACE_SEPARATOR)
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Ordered set of tools available to one turn.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolDefinition>>,
    index: HashMap<String, usize>,
    consent_overrides: HashMap<String, ConsentPolicy>,
    result_max_chars: usize,
}

impl ToolRegistry {
    pub fn new(consent_overrides: HashMap<String, ConsentPolicy>, result_max_chars: usize) -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
            consent_overrides,
            result_max_chars,
        }
    }

    /// Add a tool. A second tool with the same name is rejected.
    pub fn register(&mut self, tool: Arc<dyn ToolDefinition>) -> bool {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            tracing::warn!(tool = %name, "duplicate tool name, keeping the first registration");
            return false;
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        true
    }

    pub fn extend(&mut self, tools: impl IntoIterator<Item = Arc<dyn ToolDefinition>>) {
        for tool in tools {
            self.register(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolDefinition>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Schemas of the tools enabled for this turn, in registration order.
    pub fn schemas(&self, ctx: &TurnContext) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .filter(|t| t.is_enabled(ctx))
            .map(|t| t.schema())
            .collect()
    }

    /// Settings override if present, else the tool's own default.
    pub fn effective_policy(&self, tool: &dyn ToolDefinition) -> ConsentPolicy {
        self.consent_overrides
            .get(tool.name())
            .copied()
            .unwrap_or_else(|| tool.consent_policy())
    }

    /// Partial markup for a call whose arguments are still streaming.
    pub fn preview_markup(&self, name: &str, raw_arguments: &str) -> Option<String> {
        let tool = self.get(name)?;
        let args = parse_partial_json(raw_arguments).unwrap_or(Value::Object(Default::default()));
        tool.build_markup(&args, false)
    }

    /// Run one model-issued call through consent and execution.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &TurnContext) -> Result<String, ToolError> {
        match self.dispatch(call, ctx).await {
            Ok(output) => Ok(self.truncate_result(&call.name, output)),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                ctx.emit_complete(tool_error_markup(&call.name, &e.to_string()));
                Err(e)
            }
        }
    }

    async fn dispatch(&self, call: &ToolCall, ctx: &TurnContext) -> Result<String, ToolError> {
        let tool = self.get(&call.name).ok_or_else(|| ToolError::UnknownTool {
            name: call.name.clone(),
        })?;
        if !tool.is_enabled(ctx) {
            return Err(ToolError::Disabled {
                tool: call.name.clone(),
            });
        }

        if self.effective_policy(tool.as_ref()) == ConsentPolicy::Ask {
            let decision = ctx
                .request_consent(
                    tool.name(),
                    tool.description(),
                    tool.consent_preview(&call.arguments),
                )
                .await;
            if !decision.is_allowed() {
                return Err(ToolError::ConsentDeclined {
                    tool: call.name.clone(),
                });
            }
        }

        let started = Instant::now();
        let output = tool.execute(call.arguments.clone(), ctx).await?;
        if let Some(markup) = tool.build_markup(&call.arguments, true) {
            ctx.emit_complete(markup);
        }
        tracing::info!(
            tool = %call.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            output_len = output.len(),
            "tool call completed"
        );
        Ok(output)
    }

    fn truncate_result(&self, tool: &str, output: String) -> String {
        if output.len() <= self.result_max_chars {
            return output;
        }
        tracing::debug!(tool, len = output.len(), "tool result truncated");
        format!(
            "{}\n... (output truncated, {} bytes total)",
            truncate_utf8(&output, self.result_max_chars),
            output.len()
        )
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::test_support::{fixture, EchoTool};
    use crate::agent_core::types::ConsentDecision;
    use serde_json::json;

    fn decode(s: &str) -> Vec<u8> {
        let bytes = s.as_bytes();
        let mut out = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'-' {
                out.push(u8::from_str_radix(&s[i + 1..i + 3], 16).unwrap());
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        out
    }

    #[test]
    fn test_sanitize_identifier_safe() {
        for name in ["my server", "a.b/c", "ünï", "x__y", "tool_", "-", ""] {
            let s = sanitize(name);
            assert!(s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
            assert!(!s.contains("__"), "{name} -> {s}");
            assert!(!s.ends_with('_'));
            assert_eq!(decode(&s), name.as_bytes());
        }
    }

    #[test]
    fn test_sanitize_keeps_plain_names() {
        assert_eq!(sanitize("read_file"), "read_file");
        assert_eq!(sanitize("github"), "github");
        assert_eq!(sanitize("my-server"), "my-2dserver");
    }

    #[test]
    fn test_namespaced_keys_distinct() {
        let names = ["a", "a_", "a__", "_a", "a_b", "a-b", "a b", "a.b", "b", "", "__", "a__b"];
        let mut seen = std::collections::HashMap::new();
        for source in names {
            for tool in names {
                let key = namespaced_key(source, tool);
                if let Some(prev) = seen.insert(key.clone(), (source, tool)) {
                    panic!("{key} produced by {prev:?} and {:?}", (source, tool));
                }
                let (s, t) = split_key(&key).unwrap();
                assert_eq!(s, sanitize(source));
                assert_eq!(t, sanitize(tool));
            }
        }
    }

    #[test]
    fn test_classic_collision_is_avoided() {
        // Naive replacement would map both pairs to "a_b__c".
        assert_ne!(namespaced_key("a_b", "c"), namespaced_key("a", "b__c"));
        assert_ne!(namespaced_key("a.b", "c"), namespaced_key("a_b", "c"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new(HashMap::new(), 1000);
        assert!(registry.register(Arc::new(EchoTool::new("echo", ConsentPolicy::Always))));
        assert!(!registry.register(Arc::new(EchoTool::new("echo", ConsentPolicy::Ask))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_always_policy_runs_and_commits_markup() {
        let fx = fixture();
        let (ctx, mut markup) = fx.context(0);
        let mut registry = ToolRegistry::new(HashMap::new(), 1000);
        registry.register(Arc::new(EchoTool::new("echo", ConsentPolicy::Always)));

        let call = ToolCall { id: "1".into(), name: "echo".into(), arguments: json!({"text": "hi"}) };
        assert_eq!(registry.execute_call(&call, &ctx).await.unwrap(), "hi");
        let event = markup.try_recv().unwrap();
        assert_eq!(
            event,
            crate::agent_core::tool::MarkupEvent::Complete("<echo>hi</echo>".into())
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_emits_error_record() {
        let fx = fixture();
        let (ctx, mut markup) = fx.context(0);
        let registry = ToolRegistry::new(HashMap::new(), 1000);
        let call = ToolCall { id: "1".into(), name: "nope".into(), arguments: json!({}) };
        let err = registry.execute_call(&call, &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool { .. }));
        match markup.try_recv().unwrap() {
            crate::agent_core::tool::MarkupEvent::Complete(m) => {
                assert!(m.starts_with("<codiner-output type=\"error\" message=\"Tool 'nope' failed"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_declined_then_always() {
        let mut fx = fixture();
        let (ctx, _markup) = fx.context(0);
        let mut registry = ToolRegistry::new(HashMap::new(), 1000);
        registry.register(Arc::new(EchoTool::new("danger", ConsentPolicy::Ask)));
        let registry = Arc::new(registry);
        let call = ToolCall { id: "1".into(), name: "danger".into(), arguments: json!({"text": "x"}) };

        let (r, c, k) = (Arc::clone(&registry), ctx.clone(), call.clone());
        let first = tokio::spawn(async move { r.execute_call(&k, &c).await });
        let request = fx.consent_rx.recv().await.unwrap();
        fx.consent.resolve(&request.request_id, ConsentDecision::Decline);
        assert!(first.await.unwrap().unwrap_err().is_consent_declined());

        let (r, c, k) = (Arc::clone(&registry), ctx.clone(), call.clone());
        let second = tokio::spawn(async move { r.execute_call(&k, &c).await });
        let request = fx.consent_rx.recv().await.unwrap();
        fx.consent.resolve(&request.request_id, ConsentDecision::AcceptAlways);
        assert_eq!(second.await.unwrap().unwrap(), "x");

        for _ in 0..3 {
            assert_eq!(registry.execute_call(&call, &ctx).await.unwrap(), "x");
        }
        assert!(fx.consent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_settings_override_policy() {
        let fx = fixture();
        let (ctx, _markup) = fx.context(0);
        let mut overrides = HashMap::new();
        overrides.insert("danger".to_string(), ConsentPolicy::Always);
        let mut registry = ToolRegistry::new(overrides, 1000);
        registry.register(Arc::new(EchoTool::new("danger", ConsentPolicy::Ask)));
        let call = ToolCall { id: "1".into(), name: "danger".into(), arguments: json!({"text": "ok"}) };
        assert_eq!(registry.execute_call(&call, &ctx).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_result_truncated() {
        let fx = fixture();
        let (ctx, _markup) = fx.context(0);
        let mut registry = ToolRegistry::new(HashMap::new(), 10);
        registry.register(Arc::new(EchoTool::new("echo", ConsentPolicy::Always)));
        let call = ToolCall {
            id: "1".into(),
            name: "echo".into(),
            arguments: json!({"text": "abcdefghijklmnop"}),
        };
        let out = registry.execute_call(&call, &ctx).await.unwrap();
        assert!(out.starts_with("abcdefghij\n... (output truncated"));
    }

    #[test]
    fn test_preview_markup_from_partial_args() {
        let mut registry = ToolRegistry::new(HashMap::new(), 1000);
        registry.register(Arc::new(EchoTool::new("echo", ConsentPolicy::Always)));
        assert_eq!(
            registry.preview_markup("echo", r#"{"text":"hal"#).as_deref(),
            Some("<echo>hal")
        );
        assert_eq!(registry.preview_markup("missing", "{}"), None);
    }
}

//! Adapter exposing remote-source tools through the common tool contract.
//!
//! Remote tools are wrapped once at discovery time; dispatch treats them
//! exactly like built-in tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::ToolError;
use super::markup::{element, escape_xml_content, open_tag};
use super::tokens::truncate_utf8;
use super::tool::{ConsentPolicy, ToolDefinition, TurnContext};
use super::tool_registry::namespaced_key;
use crate::mcp_client::{McpToolDefinition, ToolSource};

/// Longest argument preview shown in a consent prompt.
const PREVIEW_MAX_BYTES: usize = 500;

/// A tool exposed by a remote source.
pub struct RemoteTool {
    key: String,
    source: String,
    tool: String,
    description: String,
    input_schema: Value,
    sources: Arc<dyn ToolSource>,
}

impl RemoteTool {
    pub fn new(source: &str, definition: McpToolDefinition, sources: Arc<dyn ToolSource>) -> Self {
        let description = definition
            .description
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| format!("{} (from {source})", definition.name));
        let input_schema = match definition.input_schema {
            Value::Object(_) => definition.input_schema,
            _ => serde_json::json!({ "type": "object", "properties": {} }),
        };
        Self {
            key: namespaced_key(source, &definition.name),
            source: source.to_string(),
            tool: definition.name,
            description,
            input_schema,
            sources,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn remote_name(&self) -> &str {
        &self.tool
    }
}

#[async_trait]
impl ToolDefinition for RemoteTool {
    fn name(&self) -> &str {
        &self.key
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Ask
    }

    fn consent_preview(&self, args: &Value) -> Option<String> {
        let text = args.to_string();
        Some(truncate_utf8(&text, PREVIEW_MAX_BYTES).to_string())
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let pretty = serde_json::to_string_pretty(&args).unwrap_or_else(|_| args.to_string());
        let attrs = [("server", self.source.as_str()), ("tool", self.tool.as_str())];
        ctx.emit_complete(format!(
            "{}\n{}\n</codiner-mcp-tool-call>",
            open_tag("codiner-mcp-tool-call", &attrs, false),
            escape_xml_content(&pretty)
        ));

        let result = self
            .sources
            .call_tool(&self.source, &self.tool, args)
            .await
            .map_err(|e| ToolError::failed(&self.key, e.to_string()))?;

        ctx.emit_complete(element(
            "codiner-mcp-tool-result",
            &attrs,
            &format!("\n{}\n", escape_xml_content(&result)),
        ));
        Ok(result)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

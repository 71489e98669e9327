//! `set_chat_summary`: record a short title for the conversation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent_core::errors::ToolError;
use crate::agent_core::markup::{element, escape_xml_content, str_arg};
use crate::agent_core::tool::{parse_args, ConsentPolicy, ToolDefinition, TurnContext};

#[derive(Debug, Deserialize)]
struct SummaryArgs {
    summary: String,
}

pub struct SetChatSummaryTool;

#[async_trait]
impl ToolDefinition for SetChatSummaryTool {
    fn name(&self) -> &str {
        "set_chat_summary"
    }

    fn description(&self) -> &str {
        "Set a short summary of what this conversation is about"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "One-line summary of the conversation" }
            },
            "required": ["summary"]
        })
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn build_markup(&self, args: &Value, _complete: bool) -> Option<String> {
        let summary = str_arg(args, "summary")?;
        Some(element("codiner-chat-summary", &[], &escape_xml_content(summary)))
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: SummaryArgs = parse_args(self.name(), args)?;
        let summary = args.summary.trim();
        ctx.store.set_summary(ctx.conversation_id, summary).await?;
        Ok(format!("Chat summary set to: {summary}"))
    }
}

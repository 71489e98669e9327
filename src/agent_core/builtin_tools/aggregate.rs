//! `aggregate_ai_knowledge`: ask every connected provider the same question.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::nesting_allowed;
use crate::agent_core::errors::ToolError;
use crate::agent_core::manager::format_aggregation;
use crate::agent_core::tool::{parse_args, ConsentPolicy, ToolDefinition, TurnContext};

const NO_PROVIDERS: &str = "No AI providers are currently connected with API keys.";

#[derive(Debug, Deserialize)]
struct AggregateArgs {
    query: String,
}

pub struct AggregateKnowledgeTool;

#[async_trait]
impl ToolDefinition for AggregateKnowledgeTool {
    fn name(&self) -> &str {
        "aggregate_ai_knowledge"
    }

    fn description(&self) -> &str {
        "Query every connected AI provider about a topic and combine their answers"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The question or topic to research across AI providers." }
            },
            "required": ["query"]
        })
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn is_enabled(&self, ctx: &TurnContext) -> bool {
        nesting_allowed(ctx)
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: AggregateArgs = parse_args(self.name(), args)?;
        let answers = ctx.manager.aggregate_knowledge(ctx, &args.query).await?;
        if answers.is_empty() {
            return Ok(NO_PROVIDERS.to_string());
        }
        Ok(format_aggregation(&answers))
    }
}

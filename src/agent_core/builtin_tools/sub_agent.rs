//! `spawn_sub_agent`: delegate a sub-task to a nested agent.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::nesting_allowed;
use crate::agent_core::errors::ToolError;
use crate::agent_core::tool::{parse_args, ConsentPolicy, ToolDefinition, TurnContext};

#[derive(Debug, Deserialize)]
struct SpawnArgs {
    task: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    provider: Option<String>,
}

pub struct SpawnSubAgentTool;

#[async_trait]
impl ToolDefinition for SpawnSubAgentTool {
    fn name(&self) -> &str {
        "spawn_sub_agent"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to handle a specific sub-task or more complex operation. Returns the result of the sub-agent's work."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "The specific task for the sub-agent to perform." },
                "model": { "type": "string", "description": "Optional model name to use for the sub-agent." },
                "provider": { "type": "string", "description": "Optional provider name to use for the sub-agent." }
            },
            "required": ["task"]
        })
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn is_enabled(&self, ctx: &TurnContext) -> bool {
        nesting_allowed(ctx)
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: SpawnArgs = parse_args(self.name(), args)?;
        let result = ctx
            .manager
            .spawn_sub_agent(ctx, &args.task, args.provider, args.model)
            .await?;
        Ok(result)
    }
}

//! `get_database_schema`: registered so the name stays reserved, never enabled.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent_core::errors::ToolError;
use crate::agent_core::tool::{ConsentPolicy, ToolDefinition, TurnContext};

const XML_TAG: &str = "<codiner-database-schema></codiner-database-schema>";

pub struct DatabaseSchemaTool;

#[async_trait]
impl ToolDefinition for DatabaseSchemaTool {
    fn name(&self) -> &str {
        "get_database_schema"
    }

    fn description(&self) -> &str {
        "Fetch the database schema of the project (no database integration is configured)"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn is_enabled(&self, _ctx: &TurnContext) -> bool {
        false
    }

    fn consent_preview(&self, _args: &Value) -> Option<String> {
        Some("Get database schema".to_string())
    }

    fn build_markup(&self, _args: &Value, _complete: bool) -> Option<String> {
        Some(XML_TAG.to_string())
    }

    async fn execute(&self, _args: Value, _ctx: &TurnContext) -> Result<String, ToolError> {
        Err(ToolError::Disabled {
            tool: self.name().to_string(),
        })
    }
}

//! Built-in tools available to every agent.
//!
//! File tools operate inside the project root only; any path that would
//! resolve outside it is rejected before touching the filesystem.

mod aggregate;
mod chat_summary;
mod database_schema;
mod file_ops;
mod sub_agent;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::errors::ToolError;
use super::tool::{ToolDefinition, TurnContext};

pub use aggregate::AggregateKnowledgeTool;
pub use chat_summary::SetChatSummaryTool;
pub use database_schema::DatabaseSchemaTool;
pub use file_ops::{
    DeleteFileTool, ListFilesTool, ReadFileTool, RenameFileTool, SearchReplaceTool, WriteFileTool,
};
pub use sub_agent::SpawnSubAgentTool;

/// The static tool set, in registration order.
pub fn builtin_tools() -> Vec<Arc<dyn ToolDefinition>> {
    vec![
        Arc::new(ReadFileTool),
        Arc::new(ListFilesTool),
        Arc::new(WriteFileTool),
        Arc::new(DeleteFileTool),
        Arc::new(RenameFileTool),
        Arc::new(SearchReplaceTool),
        Arc::new(SetChatSummaryTool),
        Arc::new(DatabaseSchemaTool),
        Arc::new(SpawnSubAgentTool),
        Arc::new(AggregateKnowledgeTool),
    ]
}

/// Join `relative` onto `root`, refusing absolute paths and `..` escapes.
///
/// Resolution is lexical; symlinks inside the root are not followed.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    let escapes = || ToolError::PathEscapesRoot {
        path: relative.to_string(),
    };
    let mut joined = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(escapes());
                }
                joined.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(escapes()),
        }
    }
    Ok(joined)
}

/// Whether nested agents may still be started from this context.
pub(crate) fn nesting_allowed(ctx: &TurnContext) -> bool {
    ctx.depth < ctx.manager.limits().max_agent_depth
}

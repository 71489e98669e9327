//! Project file tools: read, list, write, delete, rename, search/replace.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::safe_join;
use crate::agent_core::errors::ToolError;
use crate::agent_core::markup::{element, escape_xml_content, open_tag, str_arg};
use crate::agent_core::tool::{parse_args, ConsentPolicy, ToolDefinition, TurnContext};

/// Entries skipped when listing a project tree.
const IGNORED_DIRS: &[&str] = &["node_modules", "target", "dist", "build"];

/// Upper bound on entries returned by one `list_files` call.
const MAX_LIST_ENTRIES: usize = 2000;

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: String,
}

fn io_failed(tool: &str, path: &str, e: std::io::Error) -> ToolError {
    ToolError::failed(tool, format!("{path}: {e}"))
}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": { "path": { "type": "string", "description": description } },
        "required": ["path"]
    })
}

/// Create the parent directory of `path` if it is missing.
async fn ensure_parent(tool: &str, display: &str, path: &Path) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_failed(tool, display, e))?;
    }
    Ok(())
}

// ─── read_file ──────────────────────────────────────────────────────────────

pub struct ReadFileTool;

#[async_trait]
impl ToolDefinition for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the content of a file in the project"
    }

    fn input_schema(&self) -> Value {
        path_schema("File path relative to the project root")
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn consent_preview(&self, args: &Value) -> Option<String> {
        str_arg(args, "path").map(|p| format!("Read {p}"))
    }

    fn build_markup(&self, args: &Value, _complete: bool) -> Option<String> {
        let path = str_arg(args, "path")?;
        Some(element("codiner-read", &[("path", path)], ""))
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: PathArgs = parse_args(self.name(), args)?;
        let full = safe_join(&ctx.project_root, &args.path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| io_failed(self.name(), &args.path, e))
    }
}

// ─── list_files ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListArgs {
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    recursive: bool,
}

pub struct ListFilesTool;

impl ListFilesTool {
    /// Relative paths under `dir`, directories suffixed with `/`.
    ///
    /// Hidden entries and common build directories are skipped. Directories
    /// sort before files at each level.
    async fn walk(root: &Path, dir: &Path, recursive: bool) -> std::io::Result<Vec<String>> {
        let mut out = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = Vec::new();
            let mut read_dir = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let is_dir = entry.file_type().await?.is_dir();
                if is_dir && IGNORED_DIRS.contains(&name.as_str()) {
                    continue;
                }
                entries.push((is_dir, name, entry.path()));
            }
            entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.to_lowercase().cmp(&b.1.to_lowercase())));

            for (is_dir, _, path) in entries {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                if is_dir {
                    out.push(format!("{rel}/"));
                    if recursive {
                        pending.push(path);
                    }
                } else {
                    out.push(rel);
                }
                if out.len() >= MAX_LIST_ENTRIES {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ToolDefinition for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in a project directory"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "directory": { "type": "string", "description": "Directory relative to the project root (default: root)" },
                "recursive": { "type": "boolean", "description": "Include subdirectories" }
            }
        })
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn build_markup(&self, args: &Value, _complete: bool) -> Option<String> {
        let directory = str_arg(args, "directory").unwrap_or(".");
        Some(element("codiner-list-files", &[("directory", directory)], ""))
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: ListArgs = parse_args(self.name(), args)?;
        let directory = args.directory.unwrap_or_default();
        let full = safe_join(&ctx.project_root, &directory)?;
        let entries = Self::walk(&ctx.project_root, &full, args.recursive)
            .await
            .map_err(|e| io_failed(self.name(), &directory, e))?;
        if entries.is_empty() {
            return Ok("(empty directory)".to_string());
        }
        Ok(entries.join("\n"))
    }
}

// ─── write_file ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
    #[serde(default)]
    description: Option<String>,
}

pub struct WriteFileTool;

#[async_trait]
impl ToolDefinition for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the project with the given content"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the project root" },
                "content": { "type": "string", "description": "Full file content" },
                "description": { "type": "string", "description": "Short summary of the change" }
            },
            "required": ["path", "content"]
        })
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn consent_preview(&self, args: &Value) -> Option<String> {
        str_arg(args, "path").map(|p| format!("Write to {p}"))
    }

    fn build_markup(&self, args: &Value, complete: bool) -> Option<String> {
        let path = str_arg(args, "path")?;
        let description = str_arg(args, "description").unwrap_or("");
        let content = str_arg(args, "content").unwrap_or("");
        let open = open_tag("codiner-write", &[("path", path), ("description", description)], false);
        if complete {
            Some(format!("{open}\n{content}\n</codiner-write>"))
        } else {
            Some(format!("{open}\n{content}"))
        }
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: WriteArgs = parse_args(self.name(), args)?;
        let full = safe_join(&ctx.project_root, &args.path)?;
        ensure_parent(self.name(), &args.path, &full).await?;
        tokio::fs::write(&full, args.content.as_bytes())
            .await
            .map_err(|e| io_failed(self.name(), &args.path, e))?;
        ctx.flags.mark_files_changed();

        tracing::info!(
            conversation_id = ctx.conversation_id,
            path = %args.path,
            bytes = args.content.len(),
            description = args.description.as_deref().unwrap_or(""),
            "file written"
        );
        Ok(format!("Successfully wrote {}", args.path))
    }
}

// ─── delete_file ────────────────────────────────────────────────────────────

pub struct DeleteFileTool;

#[async_trait]
impl ToolDefinition for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file from the project"
    }

    fn input_schema(&self) -> Value {
        path_schema("File path relative to the project root")
    }

    fn consent_preview(&self, args: &Value) -> Option<String> {
        str_arg(args, "path").map(|p| format!("Delete {p}"))
    }

    fn build_markup(&self, args: &Value, _complete: bool) -> Option<String> {
        let path = str_arg(args, "path")?;
        Some(element("codiner-delete", &[("path", path)], ""))
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: PathArgs = parse_args(self.name(), args)?;
        let full = safe_join(&ctx.project_root, &args.path)?;
        if full == ctx.project_root {
            return Err(ToolError::failed(self.name(), "refusing to delete the project root"));
        }
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|e| io_failed(self.name(), &args.path, e))?;
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        removed.map_err(|e| io_failed(self.name(), &args.path, e))?;
        ctx.flags.mark_files_changed();

        tracing::info!(conversation_id = ctx.conversation_id, path = %args.path, "file deleted");
        Ok(format!("Successfully deleted {}", args.path))
    }
}

// ─── rename_file ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RenameArgs {
    from: String,
    to: String,
}

pub struct RenameFileTool;

#[async_trait]
impl ToolDefinition for RenameFileTool {
    fn name(&self) -> &str {
        "rename_file"
    }

    fn description(&self) -> &str {
        "Rename or move a file in the project"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "from": { "type": "string", "description": "The current file path" },
                "to": { "type": "string", "description": "The new file path" }
            },
            "required": ["from", "to"]
        })
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn consent_preview(&self, args: &Value) -> Option<String> {
        let from = str_arg(args, "from")?;
        let to = str_arg(args, "to")?;
        Some(format!("Rename {from} to {to}"))
    }

    fn build_markup(&self, args: &Value, _complete: bool) -> Option<String> {
        let from = str_arg(args, "from")?;
        let to = str_arg(args, "to")?;
        Some(element("codiner-rename", &[("from", from), ("to", to)], ""))
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: RenameArgs = parse_args(self.name(), args)?;
        let from = safe_join(&ctx.project_root, &args.from)?;
        let to = safe_join(&ctx.project_root, &args.to)?;

        if tokio::fs::metadata(&from).await.is_err() {
            return Err(ToolError::failed(
                self.name(),
                format!("Source file does not exist: {}", args.from),
            ));
        }
        ensure_parent(self.name(), &args.to, &to).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| io_failed(self.name(), &args.from, e))?;
        ctx.flags.mark_files_changed();

        tracing::info!(
            conversation_id = ctx.conversation_id,
            from = %args.from,
            to = %args.to,
            "file renamed"
        );
        Ok(format!("Successfully renamed {} to {}", args.from, args.to))
    }
}

// ─── search_replace ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchReplaceArgs {
    path: String,
    search: String,
    replace: String,
}

pub struct SearchReplaceTool;

#[async_trait]
impl ToolDefinition for SearchReplaceTool {
    fn name(&self) -> &str {
        "search_replace"
    }

    fn description(&self) -> &str {
        "Replace one exact, unique occurrence of text in a file"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the project root" },
                "search": { "type": "string", "description": "Exact text to find; must occur once" },
                "replace": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "search", "replace"]
        })
    }

    fn consent_policy(&self) -> ConsentPolicy {
        ConsentPolicy::Always
    }

    fn consent_preview(&self, args: &Value) -> Option<String> {
        str_arg(args, "path").map(|p| format!("Edit {p}"))
    }

    fn build_markup(&self, args: &Value, complete: bool) -> Option<String> {
        let path = str_arg(args, "path")?;
        let open = open_tag("codiner-search-replace", &[("path", path)], false);
        if !complete {
            return Some(open);
        }
        let search = str_arg(args, "search").unwrap_or("");
        let replace = str_arg(args, "replace").unwrap_or("");
        Some(format!(
            "{open}\n<<<<<<< SEARCH\n{}\n=======\n{}\n>>>>>>> REPLACE\n</codiner-search-replace>",
            escape_xml_content(search),
            escape_xml_content(replace)
        ))
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> Result<String, ToolError> {
        let args: SearchReplaceArgs = parse_args(self.name(), args)?;
        if args.search.is_empty() {
            return Err(ToolError::invalid_args(self.name(), "search text is empty"));
        }
        let full = safe_join(&ctx.project_root, &args.path)?;
        let original = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| io_failed(self.name(), &args.path, e))?;

        match original.matches(args.search.as_str()).count() {
            0 => {
                return Err(ToolError::failed(
                    self.name(),
                    format!("Search text not found in {}", args.path),
                ))
            }
            1 => {}
            n => {
                return Err(ToolError::failed(
                    self.name(),
                    format!("Search text matches {n} times in {}; make it unique", args.path),
                ))
            }
        }

        let updated = original.replacen(args.search.as_str(), &args.replace, 1);
        tokio::fs::write(&full, updated.as_bytes())
            .await
            .map_err(|e| io_failed(self.name(), &args.path, e))?;
        ctx.flags.mark_files_changed();

        tracing::info!(conversation_id = ctx.conversation_id, path = %args.path, "file edited");
        Ok(format!("Successfully edited {}", args.path))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

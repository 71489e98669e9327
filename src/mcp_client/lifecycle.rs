//! Remote source process lifecycle.
//!
//! Spawns a source as a child process, performs the MCP handshake over its
//! stdio, and shuts it down again. Protocol calls that don't depend on the
//! process (`handshake`, `list_tools`, `call_tool`) take a `LineTransport`
//! so they can be exercised against in-memory pipes.

use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::{extract_result, LineTransport};
use super::types::{InitializeResult, ListToolsResult, McpToolDefinition, ServerConfig, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a killed source to be reaped.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages.
const MAX_LIST_PAGES: usize = 20;

// ─── RemoteSource ────────────────────────────────────────────────────────────

/// A running remote tool source.
pub struct RemoteSource {
    pub name: String,
    process: Mutex<Child>,
    pub transport: LineTransport,
    pub server_info: InitializeResult,
}

impl RemoteSource {
    /// Kill the process and reap it.
    pub async fn shutdown(&self) {
        let mut child = self.process.lock().await;
        let _ = child.start_kill();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await.is_err() {
            tracing::warn!(source = %self.name, "remote source did not exit after kill");
        }
        tracing::info!(source = %self.name, "remote source stopped");
    }

    /// Whether the process is still running.
    pub async fn is_alive(&self) -> bool {
        matches!(self.process.lock().await.try_wait(), Ok(None))
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a remote source process and perform the initialization handshake.
pub async fn spawn_source(
    name: &str,
    config: &ServerConfig,
    working_dir: Option<&str>,
) -> Result<RemoteSource, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = config.cwd.as_deref().or(working_dir) {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr_handle = child.stderr.take();

    let transport = LineTransport::new(name, stdin, stdout);

    let server_info = match tokio::time::timeout(INIT_TIMEOUT, handshake(&transport, name)).await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
            let _ = child.kill().await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
            });
        }
        Err(_) => {
            let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
            let _ = child.kill().await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!(
                    "initialization timed out after {}s{}",
                    INIT_TIMEOUT.as_secs(),
                    format_stderr_suffix(&stderr_ctx)
                ),
            });
        }
    };

    tracing::info!(
        source = name,
        server = ?server_info.server_info.as_ref().and_then(|s| s.name.clone()),
        protocol = ?server_info.protocol_version,
        "remote source initialized"
    );

    Ok(RemoteSource {
        name: name.to_string(),
        process: Mutex::new(child),
        transport,
        server_info,
    })
}

/// Read available stderr from a failed source, bounded in time and size.
async fn read_stderr_on_failure(stderr_handle: Option<tokio::process::ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => crate::agent_core::tokens::truncate_utf8(&buf, 2000).to_string(),
        _ => String::new(),
    }
}

fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Protocol ────────────────────────────────────────────────────────────────

/// `initialize` request followed by the `notifications/initialized` notification.
pub async fn handshake(
    transport: &LineTransport,
    source_name: &str,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;
    let info: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: source_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;
    Ok(info)
}

/// List all tools, following pagination cursors.
pub async fn list_tools(
    transport: &LineTransport,
    source_name: &str,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));
        let response = transport.request("tools/list", params).await?;
        let page: ListToolsResult =
            serde_json::from_value(extract_result(response)?).map_err(|e| {
                McpError::TransportError {
                    server: source_name.to_string(),
                    reason: format!("failed to parse tools/list response: {e}"),
                }
            })?;
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(source = source_name, "tools/list pagination limit reached");
    Ok(tools)
}

/// Invoke a tool and return its raw `tools/call` result.
///
/// A result flagged `isError` is turned into `McpError::ToolFailed`.
pub async fn call_tool(
    transport: &LineTransport,
    tool_name: &str,
    arguments: serde_json::Value,
) -> Result<serde_json::Value, McpError> {
    let params = serde_json::json!({
        "name": tool_name,
        "arguments": arguments,
    });
    let response = transport.request("tools/call", Some(params)).await?;
    let result = extract_result(response)?;

    if result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Err(McpError::ToolFailed {
            tool: tool_name.to_string(),
            message: result_text(&result),
        });
    }
    Ok(result)
}

/// Flatten a `tools/call` result into text for the model.
///
/// Text content items are joined by newlines; anything else is pretty-printed.
pub fn result_text(result: &serde_json::Value) -> String {
    if let Some(items) = result.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    if let Some(structured) = result.get("structuredContent") {
        return structured.to_string();
    }
    serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

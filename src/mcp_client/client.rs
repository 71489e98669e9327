//! Remote tool sources: high-level interface used by the agent manager.
//!
//! Sources are started lazily on first use and cached while their process
//! stays alive. The agent side only depends on the `ToolSource` trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::errors::McpError;
use super::lifecycle::{self, RemoteSource};
use super::types::{McpToolDefinition, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for a single `tools/call`.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

// ─── ToolSource ──────────────────────────────────────────────────────────────

/// Discovery and invocation of tools exposed by named remote sources.
#[async_trait]
pub trait ToolSource: Send + Sync {
    /// Names of enabled sources, sorted.
    fn enabled_sources(&self) -> Vec<String>;

    /// Tools currently exposed by `source`.
    async fn list_tools(&self, source: &str) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Call `tool` on `source` and return its flattened text result.
    async fn call_tool(
        &self,
        source: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<String, McpError>;
}

// ─── RemoteToolSources ───────────────────────────────────────────────────────

/// Process-backed `ToolSource` over the configured remote sources.
pub struct RemoteToolSources {
    configs: HashMap<String, ServerConfig>,
    working_dir: Option<String>,
    running: Mutex<HashMap<String, Arc<RemoteSource>>>,
    call_timeout: Duration,
}

impl RemoteToolSources {
    pub fn new(configs: HashMap<String, ServerConfig>, working_dir: Option<String>) -> Self {
        Self {
            configs,
            working_dir,
            running: Mutex::new(HashMap::new()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Return a live connection to `name`, starting the process if needed.
    async fn connect(&self, name: &str) -> Result<Arc<RemoteSource>, McpError> {
        let config = self
            .configs
            .get(name)
            .filter(|c| c.enabled)
            .ok_or_else(|| McpError::UnknownSource {
                name: name.to_string(),
            })?;

        let mut running = self.running.lock().await;
        if let Some(existing) = running.get(name) {
            if existing.is_alive().await {
                return Ok(Arc::clone(existing));
            }
            tracing::warn!(source = name, "remote source exited, restarting");
            running.remove(name);
        }

        let source = Arc::new(lifecycle::spawn_source(name, config, self.working_dir.as_deref()).await?);
        running.insert(name.to_string(), Arc::clone(&source));
        Ok(source)
    }

    /// Stop every running source.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<RemoteSource>> =
            self.running.lock().await.drain().map(|(_, s)| s).collect();
        for source in drained {
            source.shutdown().await;
        }
    }
}

#[async_trait]
impl ToolSource for RemoteToolSources {
    fn enabled_sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    async fn list_tools(&self, source: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let remote = self.connect(source).await?;
        lifecycle::list_tools(&remote.transport, source).await
    }

    async fn call_tool(
        &self,
        source: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<String, McpError> {
        let remote = self.connect(source).await?;
        let result = tokio::time::timeout(
            self.call_timeout,
            lifecycle::call_tool(&remote.transport, tool, arguments),
        )
        .await
        .map_err(|_| McpError::Timeout {
            tool: tool.to_string(),
            timeout_ms: self.call_timeout.as_millis() as u64,
        })??;
        Ok(lifecycle::result_text(&result))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

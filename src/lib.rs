pub mod agent_core;
pub mod commands;
pub mod inference;
pub mod mcp_client;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use agent_core::{
    AgentError, AgentManager, ConsentGate, ConsentRequest, ManagerParts, PermissionStore,
    SqliteConversationStore,
};
use inference::config::{find_settings_path, load_settings};
use inference::{Settings, SettingsClientFactory};
use mcp_client::RemoteToolSources;

/// Shared state every command receives.
pub struct AppState {
    pub manager: Arc<AgentManager>,
    /// Remote tool sources, kept so their processes can be shut down.
    sources: Option<Arc<RemoteToolSources>>,
}

impl AppState {
    pub fn new(manager: Arc<AgentManager>) -> Self {
        Self {
            manager,
            sources: None,
        }
    }

    /// Stop every remote tool source process.
    pub async fn shutdown(&self) {
        if let Some(sources) = &self.sources {
            sources.shutdown_all().await;
        }
        tracing::info!("codiner agent shut down");
    }
}

/// Return the platform-standard data directory for Codiner.
///
/// - macOS: `~/Library/Application Support/codiner/`
/// - Windows: `{FOLDERID_RoamingAppData}\codiner\`
/// - Linux: `$XDG_DATA_HOME/codiner/` (fallback `~/.local/share/codiner/`)
///
/// Falls back to `~/.codiner/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("codiner");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codiner")
}

// ─── Logging ────────────────────────────────────────────────────────────────

/// Install the global tracing subscriber, writing to `{log_dir}/agent.log`.
///
/// Previous logs are rotated first (agent.log → .1 → .2 → .3). The filter
/// comes from `RUST_LOG`, defaulting to `codiner_agent=info,warn`. Returns
/// the log file path.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("agent.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("codiner_agent=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Codiner agent starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |i: u32| format!("{}.{i}", base_path.display());
    let _ = std::fs::remove_file(numbered(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// File writer that flushes after every write so no log line is lost on crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }

    fn locked(&self) -> std::io::Result<std::sync::MutexGuard<'_, std::fs::File>> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.locked()?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.locked()?.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Wiring ─────────────────────────────────────────────────────────────────

/// Build the application state from loaded settings.
///
/// Returns the state and the receiver consent requests are delivered on;
/// the UI shell must drain it and answer via `commands::chat::resolve_consent`.
pub fn build_app_state(
    settings: Settings,
    db_path: &Path,
    working_dir: Option<String>,
) -> Result<(AppState, mpsc::UnboundedReceiver<ConsentRequest>), AgentError> {
    let store = Arc::new(SqliteConversationStore::open(&db_path.to_string_lossy())?);
    let sources = Arc::new(RemoteToolSources::new(
        settings.remote_sources.clone(),
        working_dir,
    ));
    let (gate, consent_rx) = ConsentGate::new(Arc::new(PermissionStore::new()));

    let limits = settings.agent.clone();
    let tool_consents = settings.tool_consents.clone();
    let connected = settings.connected_providers();
    let manager = AgentManager::new(ManagerParts {
        factory: Arc::new(SettingsClientFactory::new(Arc::new(settings))),
        store,
        consent: Arc::new(gate),
        tool_sources: sources.clone(),
        limits,
        tool_consents,
    });

    tracing::info!(
        db_path = %db_path.display(),
        providers = ?connected,
        "agent state initialized"
    );
    let state = AppState {
        manager,
        sources: Some(sources),
    };
    Ok((state, consent_rx))
}

/// Start the agent from the platform data directory.
///
/// Installs logging, loads `settings.yaml` (see `find_settings_path`), and
/// opens `agent.db` next to it.
pub fn start() -> Result<(AppState, mpsc::UnboundedReceiver<ConsentRequest>), AgentError> {
    let dir = data_dir();
    if let Err(e) = init_tracing(&dir) {
        eprintln!("codiner: logging disabled: {e}");
    }

    let settings = find_settings_path(&dir)
        .and_then(|path| load_settings(&path))
        .map_err(|e| AgentError::ConfigError {
            reason: e.to_string(),
        })?;
    build_app_state(settings, &dir.join("agent.db"), None)
}

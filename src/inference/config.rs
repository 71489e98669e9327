//! Settings loading and validation.
//!
//! Reads `settings.yaml` and resolves environment variables. Settings are the
//! single source of truth for provider endpoints and credentials, remote tool
//! sources, consent policy overrides, and agent limits.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;
use crate::agent_core::tool::ConsentPolicy;
use crate::mcp_client::types::ServerConfig;

// ─── Public Types ────────────────────────────────────────────────────────────

/// One model provider's runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Model name sent in requests.
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Output tokens reserved per generation step.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ProviderConfig {
    /// Whether a non-empty API key is configured.
    pub fn has_credentials(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }
}

fn default_context_window() -> u32 {
    128_000
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.0
}
fn default_request_timeout() -> u64 {
    300
}

/// Limits applied to every agent turn.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentLimits {
    /// Hard cap on sequential model steps (tool-call rounds) per turn.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Tokens kept free on top of system prompt and reserved output.
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer_tokens: u32,
    /// Maximum nesting of sub-agents and aggregation children.
    #[serde(default = "default_max_agent_depth")]
    pub max_agent_depth: u32,
    /// Provider message snapshots larger than this are not persisted.
    #[serde(default = "default_max_snapshot_bytes")]
    pub max_snapshot_bytes: usize,
    /// Tool results longer than this are truncated before reaching the model.
    #[serde(default = "default_tool_result_max_chars")]
    pub tool_result_max_chars: usize,
}

fn default_max_steps() -> usize {
    25
}
fn default_safety_buffer() -> u32 {
    2000
}
fn default_max_agent_depth() -> u32 {
    2
}
fn default_max_snapshot_bytes() -> usize {
    1024 * 1024
}
fn default_tool_result_max_chars() -> usize {
    20_000
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            safety_buffer_tokens: default_safety_buffer(),
            max_agent_depth: default_max_agent_depth(),
            max_snapshot_bytes: default_max_snapshot_bytes(),
            tool_result_max_chars: default_tool_result_max_chars(),
        }
    }
}

/// Top-level settings (mirrors `settings.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Provider used when a turn does not name one.
    #[serde(default)]
    pub active_provider: String,
    /// Provider name → configuration. Ordered so provider listings are stable.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Remote tool source name → launch configuration.
    #[serde(default)]
    pub remote_sources: HashMap<String, ServerConfig>,
    /// Per-tool overrides of the tool's default consent policy.
    #[serde(default)]
    pub tool_consents: HashMap<String, ConsentPolicy>,
    #[serde(default)]
    pub agent: AgentLimits,
}

impl Settings {
    /// Names of providers with usable credentials, in name order.
    pub fn connected_providers(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|(_, p)| p.has_credentials())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Look up a provider, falling back to `active_provider` when `name` is `None`.
    pub fn provider(&self, name: Option<&str>) -> Result<(&str, &ProviderConfig), InferenceError> {
        let key = name.unwrap_or(&self.active_provider);
        self.providers
            .get_key_value(key)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| InferenceError::UnknownProvider {
                name: key.to_string(),
            })
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `settings.yaml`.
///
/// Checks `CODINER_SETTINGS` first, then `{data_dir}/settings.yaml`.
pub fn find_settings_path(data_dir: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(path) = std::env::var("CODINER_SETTINGS") {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = data_dir.join("settings.yaml");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find settings.yaml in {}", data_dir.display()),
    })
}

/// Load and parse the settings file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_settings(path: &Path) -> Result<Settings, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_settings(&raw)
}

/// Parse settings from YAML text (after env interpolation).
pub fn parse_settings(raw: &str) -> Result<Settings, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let settings: Settings =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse settings: {e}"),
        })?;

    if !settings.active_provider.is_empty()
        && !settings.providers.contains_key(&settings.active_provider)
    {
        return Err(InferenceError::ConfigError {
            reason: format!(
                "active provider '{}' is not configured",
                settings.active_provider
            ),
        });
    }

    Ok(settings)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

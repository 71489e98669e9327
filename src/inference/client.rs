//! Model client seam and the OpenAI-compatible implementation.
//!
//! The agent only sees `ModelClient` (one streaming generation step) and
//! `ModelClientFactory` (pick a client for a provider/model). The concrete
//! client speaks the OpenAI Chat Completions API over SSE, which covers
//! hosted providers and local runtimes alike.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;

use super::config::{ProviderConfig, Settings};
use super::errors::InferenceError;
use super::streaming::parse_sse_stream;
use super::types::{
    ChatCompletionRequest, ChatMessage, GenerationEvent, GenerationRequest, ModelMessage, Role,
    StreamOptions, ToolDefinitionWire,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Ordered stream of generation events for one model step.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<GenerationEvent, InferenceError>> + Send>>;

/// A provider that can stream one generation step.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start a streaming generation. The stream ends early once `cancel` fires.
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, InferenceError>;
}

/// A client bound to a concrete provider and model, with its limits.
#[derive(Clone)]
pub struct ResolvedModel {
    pub client: Arc<dyn ModelClient>,
    pub provider: String,
    pub model: String,
    pub context_window: u32,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl std::fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("context_window", &self.context_window)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Resolves model clients by provider and lists connected providers.
pub trait ModelClientFactory: Send + Sync {
    /// Resolve a client. `None` selects the active provider / its default model.
    fn resolve(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<ResolvedModel, InferenceError>;

    /// Providers currently configured with valid credentials.
    fn connected_providers(&self) -> Vec<String>;
}

// ─── Settings-backed factory ─────────────────────────────────────────────────

/// Builds `OpenAiCompatibleClient`s from `Settings`.
pub struct SettingsClientFactory {
    settings: Arc<Settings>,
}

impl SettingsClientFactory {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }
}

impl ModelClientFactory for SettingsClientFactory {
    fn resolve(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<ResolvedModel, InferenceError> {
        let (name, config) = self.settings.provider(provider)?;
        let model_name = model.unwrap_or(&config.model).to_string();
        let client = OpenAiCompatibleClient::new(name, config, &model_name)?;

        Ok(ResolvedModel {
            client: Arc::new(client),
            provider: name.to_string(),
            model: model_name,
            context_window: config.context_window,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn connected_providers(&self) -> Vec<String> {
        self.settings.connected_providers()
    }
}

// ─── OpenAiCompatibleClient ──────────────────────────────────────────────────

/// Streaming client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatibleClient {
    http: HttpClient,
    provider: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl OpenAiCompatibleClient {
    /// Create a client for `model` on the given provider.
    pub fn new(provider: &str, config: &ProviderConfig, model: &str) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            provider: provider.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout_secs: config.request_timeout_secs,
        })
    }

    /// Build the wire request body for a generation step.
    pub fn build_request(&self, request: &GenerationRequest) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.extend(ChatMessage::from_model_message(&ModelMessage::text(
                Role::System,
                request.system_prompt.clone(),
            )));
        }
        for message in &request.messages {
            messages.extend(ChatMessage::from_model_message(message));
        }

        let tools: Option<Vec<ToolDefinitionWire>> = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(ToolDefinitionWire::from).collect())
        };

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request(&request);

        // Request metadata only; the body can be huge
        tracing::info!(
            provider = %self.provider,
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "model request"
        );

        let mut builder = self
            .http
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream");
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let events = parse_sse_stream(response.bytes_stream()).take_until(cancel.cancelled_owned());
        Ok(Box::pin(events))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

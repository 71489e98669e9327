//! Model Client: provider-agnostic generation over OpenAI-compatible APIs.
//!
//! This module handles all communication with model providers:
//! - Provider settings loading from `settings.yaml` (with env interpolation)
//! - The `ModelClient` / `ModelClientFactory` seams used by the agent
//! - Streaming chat completions and SSE parsing into generation events
//!
//! Switching providers is a settings change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{
    EventStream, ModelClient, ModelClientFactory, OpenAiCompatibleClient, ResolvedModel,
    SettingsClientFactory,
};
pub use config::{AgentLimits, ProviderConfig, Settings};
pub use errors::InferenceError;
pub use types::{
    ContentPart, GenerationEvent, GenerationRequest, ModelMessage, Role, TokenUsage, ToolCall,
    ToolSchema,
};

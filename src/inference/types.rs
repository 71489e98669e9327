//! Shared types for the model client.
//!
//! Two layers live here: the provider-agnostic conversation model the agent
//! works with (`ModelMessage`, `ContentPart`, `GenerationEvent`) and the
//! OpenAI Chat Completions wire types used by the streaming client.

use serde::{Deserialize, Serialize};

// ─── Provider-Agnostic Messages ──────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Stable lowercase name, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Parse a stored role name. Unknown names fall back to `User`.
    pub fn parse(s: &str) -> Self {
        match s {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        }
    }
}

/// One structured piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    /// Image by URL (remote or `data:` URL).
    Image {
        url: String,
    },
}

/// A message in provider-agnostic form, as exchanged with the model client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ModelMessage {
    /// A message with a single text part.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// Concatenated text parts (reasoning and tool parts excluded).
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Tool calls requested by this message, in order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// A complete tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this tool call (generated if the model doesn't provide one).
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage reported by the provider for one generation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

// ─── Generation ──────────────────────────────────────────────────────────────

/// Input for one streaming generation step.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSchema>,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Events yielded by a model client, in generation order.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    TextDelta(String),
    ReasoningStart,
    ReasoningDelta(String),
    ReasoningEnd,
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        arguments_delta: String,
    },
    ToolCallEnd(ToolCall),
    Finish {
        usage: Option<TokenUsage>,
        finish_reason: Option<String>,
    },
}

impl GenerationEvent {
    /// Whether this event belongs to a reasoning span.
    pub fn is_reasoning(&self) -> bool {
        matches!(
            self,
            GenerationEvent::ReasoningStart
                | GenerationEvent::ReasoningDelta(_)
                | GenerationEvent::ReasoningEnd
        )
    }
}

// ─── Wire Types: Request ─────────────────────────────────────────────────────

/// A single message in OpenAI wire format.
///
/// `content` is `""` rather than `null` for assistant messages that only
/// carry tool calls; several OpenAI-compatible servers reject `null`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

impl ChatMessage {
    fn plain(role: Role, text: String) -> Self {
        Self {
            role,
            content: serde_json::Value::String(text),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Convert a provider-agnostic message into one or more wire messages.
    ///
    /// Tool results fan out to one `tool` message per result. Reasoning parts
    /// are not sent back to the provider.
    pub fn from_model_message(message: &ModelMessage) -> Vec<ChatMessage> {
        match message.role {
            Role::Tool => message
                .content
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult { id, output, .. } => Some(ChatMessage {
                        role: Role::Tool,
                        content: serde_json::Value::String(output.clone()),
                        tool_call_id: Some(id.clone()),
                        tool_calls: None,
                    }),
                    _ => None,
                })
                .collect(),
            Role::Assistant => {
                let calls: Vec<ToolCallResponse> = message
                    .tool_calls()
                    .into_iter()
                    .map(|c| ToolCallResponse {
                        id: c.id,
                        r#type: "function".into(),
                        function: FunctionCallResponse {
                            name: c.name,
                            arguments: c.arguments.to_string(),
                        },
                    })
                    .collect();
                vec![ChatMessage {
                    role: Role::Assistant,
                    content: serde_json::Value::String(message.text_content()),
                    tool_call_id: None,
                    tool_calls: if calls.is_empty() { None } else { Some(calls) },
                }]
            }
            Role::System | Role::User => {
                let has_images = message
                    .content
                    .iter()
                    .any(|p| matches!(p, ContentPart::Image { .. }));
                if !has_images {
                    return vec![ChatMessage::plain(message.role, message.text_content())];
                }
                let parts: Vec<serde_json::Value> = message
                    .content
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => {
                            Some(serde_json::json!({"type": "text", "text": text}))
                        }
                        ContentPart::Image { url } => Some(
                            serde_json::json!({"type": "image_url", "image_url": {"url": url}}),
                        ),
                        _ => None,
                    })
                    .collect();
                vec![ChatMessage {
                    role: message.role,
                    content: serde_json::Value::Array(parts),
                    tool_call_id: None,
                    tool_calls: None,
                }]
            }
        }
    }
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinitionWire {
    pub r#type: String,
    pub function: ToolSchema,
}

impl From<&ToolSchema> for ToolDefinitionWire {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            r#type: "function".into(),
            function: schema.clone(),
        }
    }
}

/// Ask the server to report usage in the final stream chunk.
#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinitionWire>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub stream_options: StreamOptions,
}

/// Tool call as sent back in assistant history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

// ─── Wire Types: Streaming Response ──────────────────────────────────────────

/// Raw SSE chunk from the OpenAI API.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// A single choice within a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// The delta (incremental update) within a chunk choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    /// Chain-of-thought from reasoning models (Ollama, vLLM naming).
    #[serde(default)]
    pub reasoning: Option<String>,
    /// Chain-of-thought (DeepSeek naming).
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

/// A tool call fragment within a streaming delta.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkToolCall {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub function: Option<ChunkFunction>,
}

/// A function call fragment within a streaming tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkFunction {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

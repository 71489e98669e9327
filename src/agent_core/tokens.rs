//! Token estimation for context window management.
//!
//! Uses character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (conservative, overestimate is safer)
//! - JSON/structured content: ~2.8 chars/token (denser due to punctuation, short keys)
//!
//! Estimates are deterministic and monotonic in content length, which the
//! history truncation relies on.

use crate::inference::types::{ContentPart, ModelMessage};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Overhead for tool call JSON structure (per call).
const TOOL_CALL_OVERHEAD_TOKENS: u32 = 10;

/// Flat cost charged for an image part.
pub const IMAGE_TOKENS: u32 = 1000;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Public API ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token cost of a single content part.
pub fn estimate_part_tokens(part: &ContentPart) -> u32 {
    match part {
        ContentPart::Text { text } | ContentPart::Reasoning { text } => estimate_tokens(text),
        ContentPart::ToolCall {
            name, arguments, ..
        } => {
            TOOL_CALL_OVERHEAD_TOKENS
                + estimate_tokens(name)
                + estimate_json_tokens(&arguments.to_string())
        }
        ContentPart::ToolResult { name, output, .. } => {
            let body = if output.trim_start().starts_with(['{', '[']) {
                estimate_json_tokens(output)
            } else {
                estimate_tokens(output)
            };
            estimate_tokens(name) + body
        }
        ContentPart::Image { .. } => IMAGE_TOKENS,
    }
}

/// Estimate the token count for a `ModelMessage`, including per-message overhead.
pub fn estimate_model_message_tokens(message: &ModelMessage) -> u32 {
    MESSAGE_OVERHEAD_TOKENS
        + message
            .content
            .iter()
            .map(estimate_part_tokens)
            .sum::<u32>()
}

/// Estimate the token count for a system prompt string.
pub fn estimate_system_prompt_tokens(prompt: &str) -> u32 {
    MESSAGE_OVERHEAD_TOKENS + estimate_tokens(prompt)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_tokens_short() {
        // "hello" = 5 chars → ceil(5/3.2) = 2
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn test_estimate_tokens_longer() {
        // 100 chars → ceil(100/3.2) = 32
        assert_eq!(estimate_tokens(&"a".repeat(100)), 32);
    }

    #[test]
    fn test_estimate_json_tokens() {
        // 16 chars → ceil(16/2.8) = 6
        assert_eq!(estimate_json_tokens(r#"{"path": "/tmp"}"#), 6);
    }

    #[test]
    fn test_estimate_message_tokens_text_only() {
        // 4 overhead + ceil(13/3.2) = 5
        let msg = ModelMessage::user("Hello, world!");
        assert_eq!(estimate_model_message_tokens(&msg), 9);
    }

    #[test]
    fn test_image_part_is_flat_cost() {
        let msg = ModelMessage {
            role: Role::User,
            content: vec![ContentPart::Image {
                url: "data:image/png;base64,".to_string() + &"A".repeat(50_000),
            }],
        };
        assert_eq!(estimate_model_message_tokens(&msg), 4 + IMAGE_TOKENS);
    }

    #[test]
    fn test_tool_call_includes_overhead() {
        let part = ContentPart::ToolCall {
            id: "call_1".into(),
            name: "list_files".into(),
            arguments: serde_json::json!({"directory": "src"}),
        };
        assert!(estimate_part_tokens(&part) > TOOL_CALL_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_estimate_is_monotonic_in_length() {
        let short = ModelMessage::assistant("abc");
        let long = ModelMessage::assistant("abc".repeat(40));
        assert!(estimate_model_message_tokens(&long) > estimate_model_message_tokens(&short));
    }

    #[test]
    fn test_system_prompt_overhead() {
        assert_eq!(estimate_system_prompt_tokens(""), MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_truncate_utf8_ascii() {
        assert_eq!(truncate_utf8("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_utf8_within_multibyte() {
        // '═' is U+2550, 3 bytes
        let text = "═══";
        assert_eq!(truncate_utf8(text, 4), "═");
        assert_eq!(truncate_utf8(text, 6), "══");
    }

    #[test]
    fn test_truncate_utf8_no_truncation_needed() {
        assert_eq!(truncate_utf8("short", 100), "short");
    }
}

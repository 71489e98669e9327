//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads a response body as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each chunk as JSON, and turns the deltas into
//! ordered `GenerationEvent`s. Tool call fragments are accumulated across
//! deltas and emitted as a complete `ToolCallEnd` when the step finishes.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, GenerationEvent, TokenUsage, ToolCall};

// ─── SSE byte stream parser ──────────────────────────────────────────────────

/// Parse raw SSE bytes into `GenerationEvent`s.
///
/// The stream always ends with exactly one `Finish` event unless an error
/// is yielded first, after which the stream ends.
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<GenerationEvent, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = StreamState::new();

    stream::unfold(
        (byte_stream, state, Vec::<u8>::new()),
        |(mut byte_stream, mut state, mut buffer)| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), (byte_stream, state, buffer)));
                }
                if state.done {
                    return None;
                }

                // Complete SSE event already buffered
                if let Some(end) = find_event_boundary(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..end + 2).collect();
                    let text = String::from_utf8_lossy(&raw[..end]).into_owned();
                    if let Err(e) = state.process_event(&text) {
                        state.done = true;
                        return Some((Err(e), (byte_stream, state, buffer)));
                    }
                    continue;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, state, buffer),
                        ));
                    }
                    None => {
                        // Body ended: flush any trailing event, then finish
                        if !buffer.is_empty() {
                            let text = String::from_utf8_lossy(&buffer).into_owned();
                            buffer.clear();
                            if let Err(e) = state.process_event(text.trim()) {
                                state.done = true;
                                return Some((Err(e), (byte_stream, state, buffer)));
                            }
                        }
                        if !state.finished {
                            if let Err(e) = state.finalize() {
                                state.done = true;
                                return Some((Err(e), (byte_stream, state, buffer)));
                            }
                        }
                        state.done = true;
                    }
                }
            }
        },
    )
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

// ─── Stream State ────────────────────────────────────────────────────────────

/// A tool call being assembled from streamed fragments.
#[derive(Debug)]
struct PendingToolCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

/// Mutable state carried across SSE events.
struct StreamState {
    /// Events ready to be yielded.
    pending: VecDeque<GenerationEvent>,
    in_reasoning: bool,
    tool_calls: Vec<PendingToolCall>,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    /// `Finish` has been queued.
    finished: bool,
    /// Nothing more will be produced.
    done: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_reasoning: false,
            tool_calls: Vec::new(),
            usage: None,
            finish_reason: None,
            finished: false,
            done: false,
        }
    }

    /// Process a single SSE event string (may contain multiple `data:` lines).
    fn process_event(&mut self, event: &str) -> Result<(), InferenceError> {
        let mut data_content = String::new();

        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if data == "[DONE]" {
                    return self.finalize();
                }
                data_content.push_str(data);
            }
        }

        if data_content.is_empty() {
            return Ok(()); // keep-alive or comment
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
            })?;

        self.process_chunk(chunk);
        Ok(())
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk) {
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };
        let delta = choice.delta;

        let reasoning = delta
            .reasoning
            .or(delta.reasoning_content)
            .filter(|r| !r.is_empty());
        if let Some(text) = reasoning {
            if !self.in_reasoning {
                self.in_reasoning = true;
                self.pending.push_back(GenerationEvent::ReasoningStart);
            }
            self.pending.push_back(GenerationEvent::ReasoningDelta(text));
        }

        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            self.close_reasoning();
            self.pending.push_back(GenerationEvent::TextDelta(content));
        }

        if let Some(fragments) = delta.tool_calls {
            self.close_reasoning();
            for tc in fragments {
                let index = tc.index.unwrap_or(0);
                let name_part = tc.function.as_ref().and_then(|f| f.name.clone());
                let args_part = tc
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.clone())
                    .unwrap_or_default();

                let position = self.tool_calls.iter().position(|p| p.index == index);
                let id = match position {
                    Some(i) => {
                        let existing = &mut self.tool_calls[i];
                        if let Some(n) = name_part {
                            existing.name.push_str(&n);
                        }
                        existing.arguments.push_str(&args_part);
                        existing.id.clone()
                    }
                    None => {
                        let id = tc
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
                        let name = name_part.unwrap_or_default();
                        self.pending.push_back(GenerationEvent::ToolCallStart {
                            id: id.clone(),
                            name: name.clone(),
                        });
                        self.tool_calls.push(PendingToolCall {
                            index,
                            id: id.clone(),
                            name,
                            arguments: args_part.clone(),
                        });
                        id
                    }
                };
                if !args_part.is_empty() {
                    self.pending.push_back(GenerationEvent::ToolCallDelta {
                        id,
                        arguments_delta: args_part,
                    });
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }
    }

    fn close_reasoning(&mut self) {
        if self.in_reasoning {
            self.in_reasoning = false;
            self.pending.push_back(GenerationEvent::ReasoningEnd);
        }
    }

    /// Emit completed tool calls and the terminal `Finish` event.
    fn finalize(&mut self) -> Result<(), InferenceError> {
        if self.finished {
            return Ok(());
        }
        self.close_reasoning();

        for call in std::mem::take(&mut self.tool_calls) {
            let arguments = if call.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.arguments).map_err(|e| {
                    InferenceError::ToolCallParseError {
                        raw_arguments: call.arguments.clone(),
                        reason: format!("invalid JSON for '{}': {e}", call.name),
                    }
                })?
            };
            self.pending.push_back(GenerationEvent::ToolCallEnd(ToolCall {
                id: call.id,
                name: call.name,
                arguments,
            }));
        }

        self.pending.push_back(GenerationEvent::Finish {
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
        });
        self.finished = true;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: Vec<&'static str>) -> Vec<Result<GenerationEvent, InferenceError>> {
        let byte_stream = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(c.as_bytes().to_vec())),
        );
        parse_sse_stream(byte_stream).collect().await
    }

    fn ok_events(results: Vec<Result<GenerationEvent, InferenceError>>) -> Vec<GenerationEvent> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_text_deltas_then_finish() {
        let events = ok_events(
            collect(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: [DONE]\n\n",
            ])
            .await,
        );
        assert_eq!(
            events,
            vec![
                GenerationEvent::TextDelta("Hel".into()),
                GenerationEvent::TextDelta("lo".into()),
                GenerationEvent::Finish {
                    usage: None,
                    finish_reason: Some("stop".into()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_event_split_across_chunks() {
        let events = ok_events(
            collect(vec![
                "data: {\"choices\":[{\"delta\":{\"con",
                "tent\":\"Hi\"},\"finish_reason\":null}]}\r\n\r\n",
                "data: [DONE]\n\n",
            ])
            .await,
        );
        assert_eq!(events[0], GenerationEvent::TextDelta("Hi".into()));
        assert!(matches!(events[1], GenerationEvent::Finish { .. }));
    }

    #[tokio::test]
    async fn test_reasoning_span_closed_before_text() {
        let events = ok_events(
            collect(vec![
                "data: {\"choices\":[{\"delta\":{\"reasoning\":\"think\"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\" more\"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"answer\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: [DONE]\n\n",
            ])
            .await,
        );
        assert_eq!(events[0], GenerationEvent::ReasoningStart);
        assert_eq!(events[1], GenerationEvent::ReasoningDelta("think".into()));
        assert_eq!(events[2], GenerationEvent::ReasoningDelta(" more".into()));
        assert_eq!(events[3], GenerationEvent::ReasoningEnd);
        assert_eq!(events[4], GenerationEvent::TextDelta("answer".into()));
    }

    #[tokio::test]
    async fn test_tool_call_fragments_accumulate() {
        let events = ok_events(
            collect(vec![
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"read_file\",\"arguments\":\"{\\\"pa\"}}]},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"th\\\":\\\"a.rs\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3,\"total_tokens\":10}}\n\n",
                "data: [DONE]\n\n",
            ])
            .await,
        );
        assert_eq!(
            events[0],
            GenerationEvent::ToolCallStart {
                id: "call_1".into(),
                name: "read_file".into(),
            }
        );
        assert!(matches!(events[1], GenerationEvent::ToolCallDelta { .. }));
        assert!(matches!(events[2], GenerationEvent::ToolCallDelta { .. }));
        match &events[3] {
            GenerationEvent::ToolCallEnd(call) => {
                assert_eq!(call.id, "call_1");
                assert_eq!(call.arguments["path"], "a.rs");
            }
            other => panic!("expected ToolCallEnd, got {other:?}"),
        }
        match &events[4] {
            GenerationEvent::Finish {
                usage,
                finish_reason,
            } => {
                assert_eq!(usage.unwrap().total_tokens, 10);
                assert_eq!(finish_reason.as_deref(), Some("tool_calls"));
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_done_still_finishes() {
        let events = ok_events(
            collect(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"x\"},\"finish_reason\":\"stop\"}]}",
            ])
            .await,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], GenerationEvent::Finish { .. }));
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_error_and_ends_stream() {
        let results = collect(vec!["data: {not json}\n\n", "data: [DONE]\n\n"]).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(InferenceError::StreamError { .. })));
    }

    #[tokio::test]
    async fn test_invalid_tool_arguments_error() {
        let results = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c\",\"function\":{\"name\":\"t\",\"arguments\":\"{oops\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;
        assert!(matches!(
            results.last(),
            Some(Err(InferenceError::ToolCallParseError { .. }))
        ));
    }

    #[tokio::test]
    async fn test_keep_alive_comments_ignored() {
        let events = ok_events(collect(vec![": ping\n\n", "data: [DONE]\n\n"]).await);
        assert_eq!(events.len(), 1);
    }
}

//! Agent — drives exactly one conversational turn.
//!
//! A turn loads history, trims it to the context budget, then runs model
//! steps until the model stops calling tools, the step cap is reached, or
//! the turn is cancelled. Every transcript change is persisted to the
//! target message and broadcast to the UI, in generation order.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::builtin_tools::builtin_tools;
use super::context_window::{build_history, drop_orphaned_tool_results, truncate_history};
use super::errors::{AgentError, ToolError};
use super::manager::AgentManager;
use super::tokens::{estimate_model_message_tokens, estimate_system_prompt_tokens};
use super::tool::{MarkupEvent, ToolDefinition, TurnContext, TurnContextParts};
use super::tool_registry::ToolRegistry;
use super::types::{
    AgentPhase, ContextBudget, ConversationUpdate, MessageUpdate, StoredMessage, TurnOutcome,
};
use crate::inference::client::ResolvedModel;
use crate::inference::types::{
    ContentPart, GenerationEvent, GenerationRequest, ModelMessage, Role, TokenUsage, ToolCall,
};

/// Marker opening a reasoning span in the transcript.
pub const REASONING_OPEN: &str = "<think>";
/// Marker closing a reasoning span in the transcript.
pub const REASONING_CLOSE: &str = "</think>\n";

// ─── Output ─────────────────────────────────────────────────────────────────

/// Receives the updated message list after every transcript change.
pub trait UiSink: Send + Sync {
    fn emit(&self, update: ConversationUpdate);
}

/// Wraps a nested agent's transcript before it is shown in the parent.
pub type ForwardWrap = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Where an agent's progress goes.
#[derive(Clone)]
pub enum TurnOutput {
    /// Persist into the target message and broadcast the conversation.
    Conversation { ui: Arc<dyn UiSink> },
    /// Show progress as the parent turn's streaming preview.
    Forward {
        tx: mpsc::UnboundedSender<MarkupEvent>,
        wrap: ForwardWrap,
    },
    /// Collect the transcript only.
    Silent,
}

/// Where the turn's history comes from.
#[derive(Debug, Clone)]
pub enum HistorySource {
    /// The stored conversation log.
    Conversation,
    /// A fixed message list (nested agents).
    Inline(Vec<ModelMessage>),
}

/// Parameters of one agent.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub conversation_id: i64,
    pub project_id: i64,
    pub project_root: PathBuf,
    pub system_prompt: String,
    /// Assistant placeholder the transcript is written into.
    pub message_id: Option<i64>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Nesting depth: 0 for a top-level turn.
    pub depth: u32,
    pub history: HistorySource,
}

impl AgentOptions {
    /// A top-level turn streaming into `message_id`.
    pub fn for_conversation(
        conversation_id: i64,
        project_id: i64,
        project_root: impl Into<PathBuf>,
        system_prompt: impl Into<String>,
        message_id: i64,
    ) -> Self {
        Self {
            conversation_id,
            project_id,
            project_root: project_root.into(),
            system_prompt: system_prompt.into(),
            message_id: Some(message_id),
            provider: None,
            model: None,
            depth: 0,
            history: HistorySource::Conversation,
        }
    }
}

// ─── Turn State ─────────────────────────────────────────────────────────────

/// Transcript of the running turn.
///
/// `full_response` only grows. `streaming_preview` is shown after it but
/// never persisted.
#[derive(Debug, Default)]
pub struct TurnState {
    full_response: String,
    streaming_preview: String,
    in_reasoning: bool,
}

impl TurnState {
    pub fn full_response(&self) -> &str {
        &self.full_response
    }

    pub fn in_reasoning(&self) -> bool {
        self.in_reasoning
    }

    /// Transcript plus preview, as shown to the user.
    pub fn display(&self) -> String {
        format!("{}{}", self.full_response, self.streaming_preview)
    }

    /// Apply a generation event to the transcript.
    ///
    /// Returns whether the transcript changed.
    pub fn apply(&mut self, event: &GenerationEvent) -> bool {
        let mut chunk = String::new();
        if self.in_reasoning && !event.is_reasoning() {
            chunk.push_str(REASONING_CLOSE);
            self.in_reasoning = false;
        }
        match event {
            GenerationEvent::TextDelta(text) => chunk.push_str(text),
            GenerationEvent::ReasoningStart => self.open_reasoning(&mut chunk),
            GenerationEvent::ReasoningDelta(text) => {
                self.open_reasoning(&mut chunk);
                chunk.push_str(text);
            }
            GenerationEvent::ReasoningEnd => {
                if self.in_reasoning {
                    chunk.push_str(REASONING_CLOSE);
                    self.in_reasoning = false;
                }
            }
            GenerationEvent::ToolCallStart { .. }
            | GenerationEvent::ToolCallDelta { .. }
            | GenerationEvent::ToolCallEnd(_)
            | GenerationEvent::Finish { .. } => {}
        }
        if chunk.is_empty() {
            return false;
        }
        self.full_response.push_str(&chunk);
        true
    }

    fn open_reasoning(&mut self, chunk: &mut String) {
        if !self.in_reasoning {
            chunk.push_str(REASONING_OPEN);
            self.in_reasoning = true;
        }
    }

    /// Close an open reasoning span. Returns whether anything was appended.
    pub fn close_reasoning(&mut self) -> bool {
        if !self.in_reasoning {
            return false;
        }
        self.full_response.push_str(REASONING_CLOSE);
        self.in_reasoning = false;
        true
    }

    /// Commit a finished markup block and clear the preview.
    pub fn commit_markup(&mut self, markup: &str) {
        self.close_reasoning();
        self.full_response.push_str(markup);
        self.full_response.push('\n');
        self.streaming_preview.clear();
    }

    pub fn set_preview(&mut self, preview: String) {
        self.streaming_preview = preview;
    }

    pub fn clear_preview(&mut self) {
        self.streaming_preview.clear();
    }
}

// ─── Agent ──────────────────────────────────────────────────────────────────

/// Result of one model step.
struct StepOutput {
    assistant: ModelMessage,
    tool_calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
    aborted: bool,
}

/// One turn against one resolved model.
pub struct Agent {
    id: String,
    options: AgentOptions,
    model: ResolvedModel,
    cancel: CancellationToken,
    output: TurnOutput,
    manager: Arc<AgentManager>,
    state: TurnState,
    phase: AgentPhase,
    /// Messages loaded at turn start, re-broadcast with the live transcript.
    display_messages: Vec<StoredMessage>,
}

impl Agent {
    pub(crate) fn new(
        id: String,
        options: AgentOptions,
        model: ResolvedModel,
        cancel: CancellationToken,
        output: TurnOutput,
        manager: Arc<AgentManager>,
    ) -> Self {
        Self {
            id,
            options,
            model,
            cancel,
            output,
            manager,
            state: TurnState::default(),
            phase: AgentPhase::Idle,
            display_messages: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn full_response(&self) -> &str {
        self.state.full_response()
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Run the turn with the built-in tools plus `extra_tools`.
    pub async fn run(
        &mut self,
        extra_tools: Vec<Arc<dyn ToolDefinition>>,
    ) -> Result<TurnOutcome, AgentError> {
        self.phase = AgentPhase::Streaming;
        let result = self.run_inner(extra_tools).await;
        if let Err(ref e) = result {
            self.state.clear_preview();
            if self.state.close_reasoning() {
                self.commit().await;
            }
            self.phase = AgentPhase::Errored;
            tracing::error!(
                agent_id = %self.id,
                conversation_id = self.options.conversation_id,
                error = %e,
                "agent turn failed"
            );
        }
        result
    }

    async fn run_inner(
        &mut self,
        extra_tools: Vec<Arc<dyn ToolDefinition>>,
    ) -> Result<TurnOutcome, AgentError> {
        let limits = self.manager.limits().clone();

        // 1. History, trimmed to the budget
        let history = self.load_history().await?;
        let budget = ContextBudget::compute(
            self.model.context_window,
            self.model.max_tokens,
            estimate_system_prompt_tokens(&self.options.system_prompt),
            limits.safety_buffer_tokens,
        );
        let mut truncated =
            truncate_history(history, budget.available, estimate_model_message_tokens);
        drop_orphaned_tool_results(&mut truncated);

        // 2. Tool set
        let (ctx, mut markup_rx) = TurnContext::new(TurnContextParts {
            conversation_id: self.options.conversation_id,
            project_id: self.options.project_id,
            project_root: self.options.project_root.clone(),
            message_id: self.options.message_id,
            depth: self.options.depth,
            cancel: self.cancel.clone(),
            store: Arc::clone(self.manager.store()),
            manager: Arc::clone(&self.manager),
            consent: Arc::clone(self.manager.consent()),
        });
        let mut registry = ToolRegistry::new(
            self.manager.tool_consents().clone(),
            limits.tool_result_max_chars,
        );
        registry.extend(builtin_tools());
        registry.extend(extra_tools);
        let tools = registry.schemas(&ctx);

        tracing::info!(
            agent_id = %self.id,
            conversation_id = self.options.conversation_id,
            provider = %self.model.provider,
            model = %self.model.model,
            depth = self.options.depth,
            history_messages = truncated.messages.len(),
            history_tokens = truncated.tokens,
            budget = budget.available,
            tools = tools.len(),
            "agent turn started"
        );

        // 3. Step loop
        let mut messages = truncated.messages;
        let mut generated: Vec<ModelMessage> = Vec::new();
        let mut max_usage: Option<TokenUsage> = None;
        let mut last_usage: Option<TokenUsage> = None;
        let mut steps = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.abort(steps, last_usage).await);
            }
            if steps >= limits.max_steps {
                tracing::warn!(
                    agent_id = %self.id,
                    max_steps = limits.max_steps,
                    "step cap reached, ending turn"
                );
                break;
            }
            steps += 1;

            let request = GenerationRequest {
                system_prompt: self.options.system_prompt.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                max_output_tokens: self.model.max_tokens,
                temperature: self.model.temperature,
            };
            let step = self.stream_step(request, &registry).await?;

            if let Some(usage) = step.usage {
                last_usage = Some(usage);
                if max_usage.map_or(true, |m| usage.total_tokens > m.total_tokens) {
                    max_usage = Some(usage);
                }
            }
            if !step.assistant.content.is_empty() {
                messages.push(step.assistant.clone());
                generated.push(step.assistant);
            }
            if step.aborted {
                return Ok(self.abort(steps, last_usage).await);
            }
            if step.tool_calls.is_empty() {
                break;
            }

            let mut results = Vec::with_capacity(step.tool_calls.len());
            for call in &step.tool_calls {
                let Some(result) = self.run_tool(&registry, call, &ctx, &mut markup_rx).await else {
                    return Ok(self.abort(steps, last_usage).await);
                };
                let (output, is_error) = match result {
                    Ok(output) => (output, false),
                    Err(e) => (e.to_string(), true),
                };
                results.push(ContentPart::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output,
                    is_error,
                });
            }
            let tool_message = ModelMessage {
                role: Role::Tool,
                content: results,
            };
            messages.push(tool_message.clone());
            generated.push(tool_message);
        }

        // 4. Finish
        if self.state.close_reasoning() {
            self.commit().await;
        }
        self.phase = AgentPhase::Finishing;
        self.persist_finish(max_usage, &generated, limits.max_snapshot_bytes)
            .await;

        tracing::info!(
            agent_id = %self.id,
            steps,
            response_len = self.state.full_response().len(),
            total_tokens = last_usage.map(|u| u.total_tokens),
            "agent turn finished"
        );
        Ok(TurnOutcome {
            phase: AgentPhase::Finishing,
            full_response: self.state.full_response().to_string(),
            usage: last_usage,
            steps,
        })
    }

    // ─── History ────────────────────────────────────────────────────────

    async fn load_history(&mut self) -> Result<Vec<ModelMessage>, AgentError> {
        match &self.options.history {
            HistorySource::Inline(messages) => Ok(messages.clone()),
            HistorySource::Conversation => {
                let stored = self
                    .manager
                    .store()
                    .read(self.options.conversation_id)
                    .await?;
                let history = build_history(&stored, self.options.message_id);
                self.display_messages = stored;
                Ok(history)
            }
        }
    }

    // ─── Streaming ──────────────────────────────────────────────────────

    async fn stream_step(
        &mut self,
        request: GenerationRequest,
        registry: &ToolRegistry,
    ) -> Result<StepOutput, AgentError> {
        let mut stream = self
            .model
            .client
            .stream(request, self.cancel.clone())
            .await?;

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut pending_tool: Option<(String, String, String)> = None;
        let mut usage = None;
        let mut aborted = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                item = stream.next() => Some(item),
            };
            let item = match next {
                None => {
                    aborted = true;
                    break;
                }
                Some(None) => break,
                Some(Some(item)) => item,
            };
            let event = item?;
            if self.cancel.is_cancelled() {
                aborted = true;
                break;
            }

            if self.state.apply(&event) {
                self.commit().await;
            }

            match event {
                GenerationEvent::TextDelta(delta) => text.push_str(&delta),
                GenerationEvent::ReasoningDelta(delta) => reasoning.push_str(&delta),
                GenerationEvent::ToolCallStart { id, name } => {
                    self.preview_tool(registry, &name, "");
                    pending_tool = Some((id, name, String::new()));
                }
                GenerationEvent::ToolCallDelta {
                    id,
                    arguments_delta,
                } => {
                    if let Some((pending_id, name, args)) = pending_tool.as_mut() {
                        if *pending_id == id {
                            args.push_str(&arguments_delta);
                            let (name, args) = (name.clone(), args.clone());
                            self.preview_tool(registry, &name, &args);
                        }
                    }
                }
                GenerationEvent::ToolCallEnd(call) => {
                    pending_tool = None;
                    tool_calls.push(call);
                }
                GenerationEvent::Finish {
                    usage: reported,
                    finish_reason,
                } => {
                    tracing::debug!(agent_id = %self.id, finish_reason = ?finish_reason, "model step finished");
                    usage = reported;
                }
                GenerationEvent::ReasoningStart | GenerationEvent::ReasoningEnd => {}
            }
        }

        let mut content = Vec::new();
        if !reasoning.is_empty() {
            content.push(ContentPart::Reasoning { text: reasoning });
        }
        if !text.is_empty() {
            content.push(ContentPart::Text { text });
        }
        content.extend(tool_calls.iter().map(|c| ContentPart::ToolCall {
            id: c.id.clone(),
            name: c.name.clone(),
            arguments: c.arguments.clone(),
        }));

        Ok(StepOutput {
            assistant: ModelMessage {
                role: Role::Assistant,
                content,
            },
            tool_calls,
            usage,
            aborted,
        })
    }

    fn preview_tool(&mut self, registry: &ToolRegistry, name: &str, raw_args: &str) {
        if let Some(preview) = registry.preview_markup(name, raw_args) {
            self.state.set_preview(preview);
            self.broadcast();
        }
    }

    // ─── Tools ──────────────────────────────────────────────────────────

    /// Execute one call while applying its markup. `None` when cancelled.
    async fn run_tool(
        &mut self,
        registry: &ToolRegistry,
        call: &ToolCall,
        ctx: &TurnContext,
        markup_rx: &mut mpsc::UnboundedReceiver<MarkupEvent>,
    ) -> Option<Result<String, ToolError>> {
        tracing::info!(agent_id = %self.id, tool = %call.name, call_id = %call.id, "executing tool call");
        let exec = registry.execute_call(call, ctx);
        tokio::pin!(exec);

        let result = loop {
            tokio::select! {
                result = &mut exec => break Some(result),
                Some(event) = markup_rx.recv() => self.apply_markup(event).await,
                _ = self.cancel.cancelled() => break None,
            }
        };

        while let Ok(event) = markup_rx.try_recv() {
            self.apply_markup(event).await;
        }
        if self.state.streaming_preview.is_empty() {
            return result;
        }
        self.state.clear_preview();
        self.broadcast();
        result
    }

    async fn apply_markup(&mut self, event: MarkupEvent) {
        match event {
            MarkupEvent::Preview(preview) => {
                self.state.set_preview(preview);
                self.broadcast();
            }
            MarkupEvent::Complete(markup) => {
                self.state.commit_markup(&markup);
                self.commit().await;
            }
        }
    }

    // ─── Persistence and Broadcast ──────────────────────────────────────

    async fn abort(&mut self, steps: usize, usage: Option<TokenUsage>) -> TurnOutcome {
        let cleared = self
            .manager
            .consent()
            .clear_pending_for_conversation(self.options.conversation_id);
        self.state.clear_preview();
        self.state.close_reasoning();
        self.commit().await;
        self.phase = AgentPhase::Aborted;
        tracing::info!(
            agent_id = %self.id,
            conversation_id = self.options.conversation_id,
            steps,
            cleared_consents = cleared,
            "agent turn aborted"
        );
        TurnOutcome {
            phase: AgentPhase::Aborted,
            full_response: self.state.full_response().to_string(),
            usage,
            steps,
        }
    }

    /// Persist the committed transcript, then broadcast.
    async fn commit(&mut self) {
        self.persist(MessageUpdate {
            content: Some(self.state.full_response().to_string()),
            ..Default::default()
        })
        .await;
        self.broadcast();
    }

    async fn persist(&self, update: MessageUpdate) {
        let (TurnOutput::Conversation { .. }, Some(message_id)) =
            (&self.output, self.options.message_id)
        else {
            return;
        };
        if let Err(e) = self.manager.store().update(message_id, update).await {
            tracing::warn!(
                agent_id = %self.id,
                message_id,
                error = %e,
                "failed to persist transcript, continuing in memory"
            );
        }
    }

    fn broadcast(&mut self) {
        let display = self.state.display();
        match &self.output {
            TurnOutput::Conversation { ui } => {
                if let Some(message_id) = self.options.message_id {
                    if let Some(msg) = self
                        .display_messages
                        .iter_mut()
                        .find(|m| m.id == message_id)
                    {
                        msg.content = display;
                    }
                }
                ui.emit(ConversationUpdate {
                    conversation_id: self.options.conversation_id,
                    messages: self.display_messages.clone(),
                });
            }
            TurnOutput::Forward { tx, wrap } => {
                let _ = tx.send(MarkupEvent::Preview(wrap(&display)));
            }
            TurnOutput::Silent => {}
        }
    }

    async fn persist_finish(
        &self,
        usage: Option<TokenUsage>,
        generated: &[ModelMessage],
        max_snapshot_bytes: usize,
    ) {
        if let Some(usage) = usage {
            self.persist(MessageUpdate {
                max_tokens_used: Some(usage.total_tokens),
                ..Default::default()
            })
            .await;
        }

        if generated.is_empty() {
            return;
        }
        match serde_json::to_string(generated) {
            Ok(snapshot) if snapshot.len() <= max_snapshot_bytes => {
                self.persist(MessageUpdate {
                    provider_snapshot: Some(snapshot),
                    ..Default::default()
                })
                .await;
            }
            Ok(snapshot) => {
                tracing::warn!(
                    agent_id = %self.id,
                    size = snapshot.len(),
                    limit = max_snapshot_bytes,
                    "provider snapshot too large, not persisted"
                );
            }
            Err(e) => {
                tracing::warn!(agent_id = %self.id, error = %e, "failed to serialize provider snapshot");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::store::{ConversationStore, InMemoryConversationStore};
    use crate::agent_core::test_support::{
        fixture_with, manager_with_store, EchoTool, FailingStore, RecordingUi, ScriptedClient,
        ScriptedFactory, Step,
    };
    use crate::agent_core::tool::ConsentPolicy;
    use crate::agent_core::types::{ConsentDecision, NewMessage};
    use crate::inference::config::AgentLimits;
    use crate::inference::errors::InferenceError;
    use serde_json::json;

    fn finish(total: u32) -> GenerationEvent {
        GenerationEvent::Finish {
            usage: Some(TokenUsage {
                prompt_tokens: total - 1,
                completion_tokens: 1,
                total_tokens: total,
            }),
            finish_reason: Some("stop".into()),
        }
    }

    fn text(s: &str) -> GenerationEvent {
        GenerationEvent::TextDelta(s.into())
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> Vec<GenerationEvent> {
        vec![
            GenerationEvent::ToolCallStart { id: id.into(), name: name.into() },
            GenerationEvent::ToolCallDelta { id: id.into(), arguments_delta: args.to_string() },
            GenerationEvent::ToolCallEnd(ToolCall { id: id.into(), name: name.into(), arguments: args }),
            GenerationEvent::Finish { usage: None, finish_reason: Some("tool_calls".into()) },
        ]
    }

    fn count(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    struct Turn {
        fx: crate::agent_core::test_support::Fixture,
        conversation_id: i64,
        message_id: i64,
        ui: Arc<RecordingUi>,
    }

    async fn turn(client: Arc<ScriptedClient>, limits: AgentLimits) -> Turn {
        let fx = fixture_with(ScriptedFactory::single("test", client), limits);
        let conversation_id = fx.store_handle().create_conversation(1).await.unwrap();
        fx.store_handle()
            .insert_message(conversation_id, NewMessage::user("hello"))
            .await
            .unwrap();
        let message_id = fx
            .store_handle()
            .insert_message(conversation_id, NewMessage::placeholder())
            .await
            .unwrap();
        Turn { fx, conversation_id, message_id, ui: Arc::new(RecordingUi::default()) }
    }

    impl Turn {
        fn agent(&self, cancel: CancellationToken) -> Agent {
            let options = AgentOptions::for_conversation(
                self.conversation_id,
                1,
                self.fx.root.path(),
                "You are helpful.",
                self.message_id,
            );
            self.fx
                .manager
                .create_agent(options, cancel, TurnOutput::Conversation { ui: self.ui.clone() })
                .unwrap()
        }

        async fn stored(&self) -> StoredMessage {
            self.fx
                .store_handle()
                .read(self.conversation_id)
                .await
                .unwrap()
                .into_iter()
                .find(|m| m.id == self.message_id)
                .unwrap()
        }
    }

    // ─── Reasoning state machine ────────────────────────────────────────

    #[test]
    fn test_reasoning_markers_wrap_span() {
        let mut state = TurnState::default();
        for event in [
            GenerationEvent::ReasoningStart,
            GenerationEvent::ReasoningDelta("plan".into()),
            GenerationEvent::ReasoningEnd,
            text("answer"),
        ] {
            state.apply(&event);
        }
        assert_eq!(state.full_response(), "<think>plan</think>\nanswer");
    }

    #[test]
    fn test_reasoning_closed_by_text_without_end() {
        let mut state = TurnState::default();
        state.apply(&GenerationEvent::ReasoningDelta("a".into()));
        state.apply(&GenerationEvent::ReasoningDelta("b".into()));
        state.apply(&text("c"));
        assert_eq!(state.full_response(), "<think>ab</think>\nc");
        assert!(!state.in_reasoning());
    }

    #[test]
    fn test_commit_markup_closes_reasoning() {
        let mut state = TurnState::default();
        state.apply(&GenerationEvent::ReasoningDelta("x".into()));
        state.set_preview("<codiner-write".into());
        state.commit_markup("<codiner-write path=\"a\"></codiner-write>");
        assert_eq!(
            state.full_response(),
            "<think>x</think>\n<codiner-write path=\"a\"></codiner-write>\n"
        );
        assert_eq!(state.display(), state.full_response());
    }

    #[test]
    fn test_reasoning_markers_balanced_for_any_sequence() {
        // Deterministic pseudo-random event sequences.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..200 {
            let mut state = TurnState::default();
            for _ in 0..40 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let event = match seed % 6 {
                    0 => text("t"),
                    1 => GenerationEvent::ReasoningStart,
                    2 => GenerationEvent::ReasoningDelta("r".into()),
                    3 => GenerationEvent::ReasoningEnd,
                    4 => GenerationEvent::ToolCallStart { id: "c".into(), name: "n".into() },
                    _ => GenerationEvent::Finish { usage: None, finish_reason: None },
                };
                state.apply(&event);
                if seed % 11 == 0 {
                    state.commit_markup("<m></m>");
                }
            }
            state.close_reasoning();
            let out = state.full_response();
            assert_eq!(count(out, REASONING_OPEN), count(out, "</think>"));
            let mut depth = 0i32;
            let mut rest = out;
            while let Some(pos) = rest.find('<') {
                rest = &rest[pos..];
                if rest.starts_with(REASONING_OPEN) {
                    depth += 1;
                    assert_eq!(depth, 1, "nested open in {out}");
                } else if rest.starts_with("</think>") {
                    depth -= 1;
                    assert_eq!(depth, 0);
                }
                rest = &rest[1..];
            }
        }
    }

    // ─── Turns ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_text_turn_persists_and_broadcasts() {
        let client = ScriptedClient::new(vec![Step::Events(vec![
            GenerationEvent::ReasoningDelta("thinking".into()),
            text("Hello "),
            text("world"),
            finish(120),
        ])]);
        let t = turn(client.clone(), AgentLimits::default()).await;
        let mut agent = t.agent(CancellationToken::new());

        let outcome = agent.run(vec![]).await.unwrap();
        assert_eq!(outcome.phase, AgentPhase::Finishing);
        assert_eq!(outcome.full_response, "<think>thinking</think>\nHello world");
        assert_eq!(outcome.steps, 1);
        assert_eq!(agent.phase(), AgentPhase::Finishing);

        let stored = t.stored().await;
        assert_eq!(stored.content, outcome.full_response);
        assert_eq!(stored.max_tokens_used, Some(120));
        let snapshot: Vec<ModelMessage> =
            serde_json::from_str(stored.provider_snapshot.as_deref().unwrap()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text_content(), "Hello world");

        // Broadcasts grow monotonically and end with the final transcript.
        let contents = t.ui.contents_of(t.message_id);
        assert!(contents.len() >= 3);
        assert!(contents.windows(2).all(|w| w[1].starts_with(&w[0])));
        assert_eq!(contents.last().unwrap(), &outcome.full_response);

        // History sent to the model excludes the empty placeholder.
        let requests = client.requests();
        assert_eq!(requests[0].messages, vec![ModelMessage::user("hello")]);
        assert_eq!(requests[0].system_prompt, "You are helpful.");
    }

    #[tokio::test]
    async fn test_tool_round_feeds_result_back() {
        let mut first = vec![text("Let me check.")];
        first.extend(call("c1", "echo", json!({"text": "pong"})));
        let client = ScriptedClient::new(vec![
            Step::Events(first),
            Step::Events(vec![text("Done."), finish(300)]),
        ]);
        let t = turn(client.clone(), AgentLimits::default()).await;
        let mut agent = t.agent(CancellationToken::new());

        let outcome = agent
            .run(vec![Arc::new(EchoTool::new("echo", ConsentPolicy::Always))])
            .await
            .unwrap();
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.full_response, "Let me check.<echo>pong</echo>\nDone.");

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        let tool_msg = requests[1].messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(
            tool_msg.content[0],
            ContentPart::ToolResult {
                id: "c1".into(),
                name: "echo".into(),
                output: "pong".into(),
                is_error: false,
            }
        );
        assert!(requests[0].tools.iter().any(|t| t.name == "echo"));

        let stored = t.stored().await;
        let snapshot: Vec<ModelMessage> =
            serde_json::from_str(stored.provider_snapshot.as_deref().unwrap()).unwrap();
        assert_eq!(snapshot.len(), 3);
    }

    #[tokio::test]
    async fn test_declined_tool_does_not_fail_turn() {
        let client = ScriptedClient::new(vec![
            Step::Events(call("c1", "danger", json!({"text": "x"}))),
            Step::Events(vec![text("Okay, skipped."), finish(50)]),
        ]);
        let mut t = turn(client.clone(), AgentLimits::default()).await;
        let mut agent = t.agent(CancellationToken::new());
        let consent = Arc::clone(&t.fx.consent);
        let mut rx = std::mem::replace(&mut t.fx.consent_rx, mpsc::unbounded_channel().1);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                consent.resolve(&req.request_id, ConsentDecision::Decline);
            }
        });

        let outcome = agent
            .run(vec![Arc::new(EchoTool::new("danger", ConsentPolicy::Ask))])
            .await
            .unwrap();
        assert_eq!(outcome.phase, AgentPhase::Finishing);
        assert!(outcome.full_response.contains("User denied permission for danger"));
        assert!(outcome.full_response.ends_with("Okay, skipped."));

        let requests = client.requests();
        match &requests[1].messages.last().unwrap().content[0] {
            ContentPart::ToolResult { is_error, output, .. } => {
                assert!(*is_error);
                assert_eq!(output, "User denied permission for danger");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_step_cap_bounds_tool_loops() {
        let steps = (0..10)
            .map(|i| Step::Events(call(&format!("c{i}"), "echo", json!({"text": "again"}))))
            .collect();
        let client = ScriptedClient::new(steps);
        let limits = AgentLimits { max_steps: 3, ..AgentLimits::default() };
        let t = turn(client.clone(), limits).await;
        let mut agent = t.agent(CancellationToken::new());
        let outcome = agent
            .run(vec![Arc::new(EchoTool::new("echo", ConsentPolicy::Always))])
            .await
            .unwrap();
        assert_eq!(outcome.steps, 3);
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_error_fails_turn() {
        let client = ScriptedClient::new(vec![Step::FailAfter(
            vec![text("partial")],
            InferenceError::StreamError { reason: "reset".into() },
        )]);
        let t = turn(client, AgentLimits::default()).await;
        let mut agent = t.agent(CancellationToken::new());
        let err = agent.run(vec![]).await.unwrap_err();
        assert!(matches!(err, AgentError::StreamError(_)));
        assert_eq!(agent.phase(), AgentPhase::Errored);
        // Content generated before the failure stays persisted.
        assert_eq!(t.stored().await.content, "partial");
    }

    #[tokio::test]
    async fn test_stream_error_closes_open_reasoning() {
        let client = ScriptedClient::new(vec![Step::FailAfter(
            vec![GenerationEvent::ReasoningDelta("thinking".into())],
            InferenceError::StreamError { reason: "reset".into() },
        )]);
        let t = turn(client, AgentLimits::default()).await;
        let mut agent = t.agent(CancellationToken::new());
        agent.run(vec![]).await.unwrap_err();

        let stored = t.stored().await.content;
        assert_eq!(stored, "<think>thinking</think>\n");
        assert_eq!(count(&stored, REASONING_OPEN), count(&stored, "</think>"));
        assert_eq!(t.ui.contents_of(t.message_id).last().unwrap(), &stored);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_fail_turn() {
        let client = ScriptedClient::new(vec![Step::Events(vec![
            text("Hello "),
            text("world"),
            finish(50),
        ])]);
        let store = Arc::new(FailingStore::new(Arc::new(InMemoryConversationStore::new())));
        let conversation_id = store.create_conversation(1).await.unwrap();
        store.insert_message(conversation_id, NewMessage::user("hello")).await.unwrap();
        let message_id = store
            .insert_message(conversation_id, NewMessage::placeholder())
            .await
            .unwrap();
        let manager = manager_with_store(ScriptedFactory::single("test", client), store.clone());
        let ui = Arc::new(RecordingUi::default());
        let root = tempfile::tempdir().unwrap();

        let options = AgentOptions::for_conversation(
            conversation_id,
            1,
            root.path(),
            "You are helpful.",
            message_id,
        );
        let mut agent = manager
            .create_agent(options, CancellationToken::new(), TurnOutput::Conversation { ui: ui.clone() })
            .unwrap();
        let outcome = agent.run(vec![]).await.unwrap();

        assert_eq!(outcome.phase, AgentPhase::Finishing);
        assert_eq!(outcome.full_response, "Hello world");
        assert!(store.failed_updates() > 0);
        assert_eq!(ui.contents_of(message_id).last().unwrap(), "Hello world");
        // Nothing reached the store.
        let messages = store.read(conversation_id).await.unwrap();
        assert_eq!(messages[1].content, "");
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_stops_growth() {
        let client = ScriptedClient::new(vec![Step::Hang(vec![
            GenerationEvent::ReasoningDelta("hmm".into()),
            text("partial answer"),
        ])]);
        let t = turn(client, AgentLimits::default()).await;
        let cancel = CancellationToken::new();
        let mut agent = t.agent(cancel.clone());

        let canceller = {
            let ui = t.ui.clone();
            let cancel = cancel.clone();
            let message_id = t.message_id;
            tokio::spawn(async move {
                while !ui.contents_of(message_id).iter().any(|c| c.ends_with("partial answer")) {
                    tokio::task::yield_now().await;
                }
                cancel.cancel();
            })
        };

        let outcome = agent.run(vec![]).await.unwrap();
        canceller.await.unwrap();
        assert!(outcome.was_aborted());
        assert_eq!(outcome.full_response, "<think>hmm</think>\npartial answer");
        assert_eq!(t.stored().await.content, outcome.full_response);
        assert!(t.stored().await.provider_snapshot.is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_consent_clears_pending() {
        let client = ScriptedClient::new(vec![Step::Events(call("c1", "danger", json!({"text": "x"})))]);
        let mut t = turn(client, AgentLimits::default()).await;
        let cancel = CancellationToken::new();
        let mut agent = t.agent(cancel.clone());

        let mut rx = std::mem::replace(&mut t.fx.consent_rx, mpsc::unbounded_channel().1);
        let c = cancel.clone();
        tokio::spawn(async move {
            let _request = rx.recv().await;
            c.cancel();
        });

        let outcome = agent
            .run(vec![Arc::new(EchoTool::new("danger", ConsentPolicy::Ask))])
            .await
            .unwrap();
        assert!(outcome.was_aborted());
        assert_eq!(t.fx.consent.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_snapshot_not_persisted() {
        let client = ScriptedClient::new(vec![Step::Events(vec![text(&"x".repeat(500)), finish(10)])]);
        let limits = AgentLimits { max_snapshot_bytes: 100, ..AgentLimits::default() };
        let t = turn(client, limits).await;
        let mut agent = t.agent(CancellationToken::new());
        agent.run(vec![]).await.unwrap();
        let stored = t.stored().await;
        assert!(stored.provider_snapshot.is_none());
        assert_eq!(stored.max_tokens_used, Some(10));
    }

    #[tokio::test]
    async fn test_history_truncated_to_budget() {
        let client = ScriptedClient::new(vec![Step::Events(vec![text("ok"), finish(5)])]);
        let factory = ScriptedFactory::single("test", client.clone()).with_limits(2000, 100);
        let limits = AgentLimits { safety_buffer_tokens: 0, ..AgentLimits::default() };
        let fx = fixture_with(factory, limits);
        let store = fx.store_handle();
        let conv = store.create_conversation(1).await.unwrap();
        for _ in 0..10 {
            // ~1000 tokens each
            store.insert_message(conv, NewMessage::user("a".repeat(3200))).await.unwrap();
        }
        store.insert_message(conv, NewMessage::user("latest")).await.unwrap();
        let placeholder = store.insert_message(conv, NewMessage::placeholder()).await.unwrap();

        let options = AgentOptions::for_conversation(conv, 1, fx.root.path(), "sys", placeholder);
        let mut agent = fx
            .manager
            .create_agent(options, CancellationToken::new(), TurnOutput::Silent)
            .unwrap();
        agent.run(vec![]).await.unwrap();

        let sent = &client.requests()[0].messages;
        assert_eq!(sent.last().unwrap().text_content(), "latest");
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn test_forward_output_sends_wrapped_preview() {
        let client = ScriptedClient::new(vec![Step::Events(vec![text("sub result"), finish(5)])]);
        let fx = fixture_with(ScriptedFactory::single("test", client), AgentLimits::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = AgentOptions {
            conversation_id: 1,
            project_id: 1,
            project_root: fx.root.path().to_path_buf(),
            system_prompt: "sub".into(),
            message_id: None,
            provider: None,
            model: None,
            depth: 1,
            history: HistorySource::Inline(vec![ModelMessage::user("task")]),
        };
        let wrap: ForwardWrap = Arc::new(|s: &str| format!("[{s}]"));
        let mut agent = fx
            .manager
            .create_agent(options, CancellationToken::new(), TurnOutput::Forward { tx, wrap })
            .unwrap();
        let outcome = agent.run(vec![]).await.unwrap();
        assert_eq!(outcome.full_response, "sub result");
        assert_eq!(rx.try_recv().unwrap(), MarkupEvent::Preview("[sub result]".into()));
    }
}

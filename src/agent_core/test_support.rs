//! Test doubles shared by the agent core tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::agent::UiSink;
use super::consent::ConsentGate;
use super::errors::{AgentError, ToolError};
use super::manager::{AgentManager, ManagerParts};
use super::permissions::PermissionStore;
use super::store::{ConversationStore, InMemoryConversationStore};
use super::tool::{ConsentPolicy, MarkupEvent, ToolDefinition, TurnContext, TurnContextParts};
use super::types::{
    ConsentRequest, Conversation, ConversationUpdate, MessageUpdate, NewMessage, StoredMessage,
};
use crate::inference::client::{EventStream, ModelClient, ModelClientFactory, ResolvedModel};
use crate::inference::config::AgentLimits;
use crate::inference::errors::InferenceError;
use crate::inference::types::{GenerationEvent, GenerationRequest};
use crate::mcp_client::{McpError, McpToolDefinition, ToolSource};

// ─── Model ──────────────────────────────────────────────────────────────────

/// One scripted model step.
pub enum Step {
    Events(Vec<GenerationEvent>),
    /// `stream()` itself fails.
    Fail(InferenceError),
    /// Yield the events, then an error.
    FailAfter(Vec<GenerationEvent>, InferenceError),
    /// Yield the events, then never finish.
    Hang(Vec<GenerationEvent>),
}

/// Model client replaying scripted steps and recording requests.
pub struct ScriptedClient {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream(
        &self,
        request: GenerationRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream, InferenceError> {
        self.requests.lock().unwrap().push(request);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(|| {
            Step::Events(vec![GenerationEvent::Finish {
                usage: None,
                finish_reason: Some("stop".into()),
            }])
        });
        let events_stream: EventStream = match step {
            Step::Events(events) => Box::pin(stream::iter(events.into_iter().map(Ok))),
            Step::Fail(e) => return Err(e),
            Step::FailAfter(events, e) => Box::pin(
                stream::iter(events.into_iter().map(Ok)).chain(stream::iter(vec![Err(e)])),
            ),
            Step::Hang(events) => {
                Box::pin(stream::iter(events.into_iter().map(Ok)).chain(stream::pending()))
            }
        };
        Ok(events_stream)
    }
}

/// Factory over named scripted clients. Every provider counts as connected.
pub struct ScriptedFactory {
    clients: BTreeMap<String, Arc<ScriptedClient>>,
    context_window: u32,
    max_tokens: u32,
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self {
            clients: BTreeMap::new(),
            context_window: 128_000,
            max_tokens: 4096,
        }
    }
}

impl ScriptedFactory {
    pub fn single(provider: &str, client: Arc<ScriptedClient>) -> Self {
        Self::default().with_provider(provider, client)
    }

    pub fn with_provider(mut self, provider: &str, client: Arc<ScriptedClient>) -> Self {
        self.clients.insert(provider.to_string(), client);
        self
    }

    pub fn with_limits(mut self, context_window: u32, max_tokens: u32) -> Self {
        self.context_window = context_window;
        self.max_tokens = max_tokens;
        self
    }
}

impl ModelClientFactory for ScriptedFactory {
    fn resolve(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<ResolvedModel, InferenceError> {
        let (name, client) = match provider {
            Some(name) => self
                .clients
                .get_key_value(name)
                .ok_or_else(|| InferenceError::UnknownProvider { name: name.into() })?,
            None => self
                .clients
                .iter()
                .next()
                .ok_or_else(|| InferenceError::UnknownProvider { name: "<none>".into() })?,
        };
        let client: Arc<dyn ModelClient> = client.clone();
        Ok(ResolvedModel {
            client,
            provider: name.clone(),
            model: model.unwrap_or("scripted").to_string(),
            context_window: self.context_window,
            max_tokens: self.max_tokens,
            temperature: 0.0,
        })
    }

    fn connected_providers(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }
}

// ─── UI ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingUi {
    updates: Mutex<Vec<ConversationUpdate>>,
}

impl RecordingUi {
    /// Broadcast content of one message, in emission order.
    pub fn contents_of(&self, message_id: i64) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter_map(|u| u.messages.iter().find(|m| m.id == message_id))
            .map(|m| m.content.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl UiSink for RecordingUi {
    fn emit(&self, update: ConversationUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// Delegates to `inner` except that every `update` fails.
pub struct FailingStore {
    inner: Arc<dyn ConversationStore>,
    failed_updates: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn ConversationStore>) -> Self {
        Self {
            inner,
            failed_updates: AtomicUsize::new(0),
        }
    }

    pub fn failed_updates(&self) -> usize {
        self.failed_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationStore for FailingStore {
    async fn create_conversation(&self, project_id: i64) -> Result<i64, AgentError> {
        self.inner.create_conversation(project_id).await
    }

    async fn conversation(&self, conversation_id: i64) -> Result<Conversation, AgentError> {
        self.inner.conversation(conversation_id).await
    }

    async fn read(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, AgentError> {
        self.inner.read(conversation_id).await
    }

    async fn insert_message(
        &self,
        conversation_id: i64,
        message: NewMessage,
    ) -> Result<i64, AgentError> {
        self.inner.insert_message(conversation_id, message).await
    }

    async fn update(&self, _message_id: i64, _update: MessageUpdate) -> Result<(), AgentError> {
        self.failed_updates.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::PersistenceError {
            reason: "disk I/O error".into(),
        })
    }

    async fn set_summary(&self, conversation_id: i64, summary: &str) -> Result<(), AgentError> {
        self.inner.set_summary(conversation_id, summary).await
    }
}

// ─── Tools ──────────────────────────────────────────────────────────────────

/// Returns its `text` argument and renders `<echo>text</echo>`.
pub struct EchoTool {
    name: String,
    policy: ConsentPolicy,
}

impl EchoTool {
    pub fn new(name: &str, policy: ConsentPolicy) -> Self {
        Self {
            name: name.to_string(),
            policy,
        }
    }
}

#[async_trait]
impl ToolDefinition for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echo the text back"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }

    fn consent_policy(&self) -> ConsentPolicy {
        self.policy
    }

    fn build_markup(&self, args: &Value, complete: bool) -> Option<String> {
        let text = args.get("text").and_then(Value::as_str).unwrap_or("");
        Some(if complete {
            format!("<echo>{text}</echo>")
        } else {
            format!("<echo>{text}")
        })
    }

    async fn execute(&self, args: Value, _ctx: &TurnContext) -> Result<String, ToolError> {
        Ok(args
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

/// In-process tool source. `call_tool` echoes `source/tool: args`.
#[derive(Default)]
pub struct FakeToolSource {
    tools: BTreeMap<String, Vec<McpToolDefinition>>,
    failing: BTreeSet<String>,
}

impl FakeToolSource {
    pub fn failing(name: &str) -> Self {
        Self::default().with_failing(name)
    }

    pub fn with_failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn with_source(mut self, name: &str, tools: &[&str]) -> Self {
        let defs = tools
            .iter()
            .map(|t| McpToolDefinition {
                name: t.to_string(),
                description: Some(format!("{t} tool")),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect();
        self.tools.insert(name.to_string(), defs);
        self
    }

    fn check(&self, source: &str) -> Result<(), McpError> {
        if self.failing.contains(source) {
            return Err(McpError::TransportError {
                server: source.to_string(),
                reason: "connection closed".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ToolSource for FakeToolSource {
    fn enabled_sources(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.tools.keys().cloned().collect();
        names.extend(self.failing.iter().cloned());
        names.into_iter().collect()
    }

    async fn list_tools(&self, source: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        self.check(source)?;
        Ok(self.tools.get(source).cloned().unwrap_or_default())
    }

    async fn call_tool(&self, source: &str, tool: &str, arguments: Value) -> Result<String, McpError> {
        self.check(source)?;
        Ok(format!("{source}/{tool}: {arguments}"))
    }
}

// ─── Fixture ────────────────────────────────────────────────────────────────

pub struct Fixture {
    pub store: Arc<InMemoryConversationStore>,
    pub consent: Arc<ConsentGate>,
    pub consent_rx: mpsc::UnboundedReceiver<ConsentRequest>,
    pub manager: Arc<AgentManager>,
    pub root: tempfile::TempDir,
}

pub fn fixture() -> Fixture {
    fixture_with(
        ScriptedFactory::single("test", ScriptedClient::new(vec![])),
        AgentLimits::default(),
    )
}

pub fn fixture_with(factory: ScriptedFactory, limits: AgentLimits) -> Fixture {
    fixture_full(factory, limits, Arc::new(FakeToolSource::default()))
}

pub fn fixture_full(
    factory: ScriptedFactory,
    limits: AgentLimits,
    tool_sources: Arc<dyn ToolSource>,
) -> Fixture {
    let store = Arc::new(InMemoryConversationStore::new());
    let (gate, consent_rx) = ConsentGate::new(Arc::new(PermissionStore::new()));
    let consent = Arc::new(gate);
    let manager = AgentManager::new(ManagerParts {
        factory: Arc::new(factory),
        store: store.clone(),
        consent: Arc::clone(&consent),
        tool_sources,
        limits,
        tool_consents: Default::default(),
    });
    Fixture {
        store,
        consent,
        consent_rx,
        manager,
        root: tempfile::tempdir().unwrap(),
    }
}

/// Manager over `store` with default limits and no remote sources.
pub fn manager_with_store(
    factory: ScriptedFactory,
    store: Arc<dyn ConversationStore>,
) -> Arc<AgentManager> {
    let (gate, _consent_rx) = ConsentGate::new(Arc::new(PermissionStore::new()));
    AgentManager::new(ManagerParts {
        factory: Arc::new(factory),
        store,
        consent: Arc::new(gate),
        tool_sources: Arc::new(FakeToolSource::default()),
        limits: AgentLimits::default(),
        tool_consents: Default::default(),
    })
}

impl Fixture {
    pub fn store_handle(&self) -> Arc<dyn ConversationStore> {
        self.store.clone()
    }

    /// Context for conversation 1 at the given depth.
    pub fn context(&self, depth: u32) -> (TurnContext, mpsc::UnboundedReceiver<MarkupEvent>) {
        TurnContext::new(TurnContextParts {
            conversation_id: 1,
            project_id: 1,
            project_root: self.root.path().to_path_buf(),
            message_id: None,
            depth,
            cancel: CancellationToken::new(),
            store: self.store.clone(),
            manager: Arc::clone(&self.manager),
            consent: Arc::clone(&self.consent),
        })
    }
}

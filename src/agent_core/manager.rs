//! Agent Manager — creates agents and runs nested ones.
//!
//! Keeps per-conversation bookkeeping of running agents so a turn can be
//! cancelled from outside, discovers remote tools, and implements the two
//! operations that nest agents: sub-agent delegation and multi-provider
//! knowledge aggregation. Nesting depth is bounded by `max_agent_depth`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::agent::{Agent, AgentOptions, ForwardWrap, HistorySource, TurnOutput};
use super::consent::ConsentGate;
use super::errors::AgentError;
use super::markup::{element, escape_xml_attr, escape_xml_content, open_tag};
use super::remote_tools::RemoteTool;
use super::store::ConversationStore;
use super::tool::{ConsentPolicy, ToolDefinition, TurnContext};
use crate::inference::client::ModelClientFactory;
use crate::inference::config::AgentLimits;
use crate::inference::types::ModelMessage;
use crate::mcp_client::ToolSource;

/// Characters of each provider answer shown while aggregating.
const AGGREGATION_PREVIEW_CHARS: usize = 100;

/// Bookkeeping entry for a running agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub agent_id: String,
    pub depth: u32,
    pub cancel: CancellationToken,
}

/// Collaborators the manager wires into every agent.
pub struct ManagerParts {
    pub factory: Arc<dyn ModelClientFactory>,
    pub store: Arc<dyn ConversationStore>,
    pub consent: Arc<ConsentGate>,
    pub tool_sources: Arc<dyn ToolSource>,
    pub limits: AgentLimits,
    pub tool_consents: HashMap<String, ConsentPolicy>,
}

/// One provider's contribution to an aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderAnswer {
    pub provider: String,
    /// The answer, or `Error: ...` when that provider failed.
    pub response: String,
    pub ok: bool,
}

/// Label every answer and join them.
pub fn format_aggregation(answers: &[ProviderAnswer]) -> String {
    answers
        .iter()
        .map(|a| format!("### From {}:\n{}", a.provider, a.response))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct AgentManager {
    factory: Arc<dyn ModelClientFactory>,
    store: Arc<dyn ConversationStore>,
    consent: Arc<ConsentGate>,
    tool_sources: Arc<dyn ToolSource>,
    limits: AgentLimits,
    tool_consents: HashMap<String, ConsentPolicy>,
    agents: Mutex<HashMap<i64, Vec<AgentHandle>>>,
}

impl AgentManager {
    pub fn new(parts: ManagerParts) -> Arc<Self> {
        Arc::new(Self {
            factory: parts.factory,
            store: parts.store,
            consent: parts.consent,
            tool_sources: parts.tool_sources,
            limits: parts.limits,
            tool_consents: parts.tool_consents,
            agents: Mutex::new(HashMap::new()),
        })
    }

    pub fn factory(&self) -> &Arc<dyn ModelClientFactory> {
        &self.factory
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn consent(&self) -> &Arc<ConsentGate> {
        &self.consent
    }

    pub fn limits(&self) -> &AgentLimits {
        &self.limits
    }

    pub fn tool_consents(&self) -> &HashMap<String, ConsentPolicy> {
        &self.tool_consents
    }

    // ─── Agents ─────────────────────────────────────────────────────────

    /// Resolve the model, build an agent and register it under its conversation.
    pub fn create_agent(
        self: &Arc<Self>,
        options: AgentOptions,
        cancel: CancellationToken,
        output: TurnOutput,
    ) -> Result<Agent, AgentError> {
        if options.depth > self.limits.max_agent_depth {
            return Err(AgentError::DepthExceeded {
                depth: options.depth,
                max: self.limits.max_agent_depth,
            });
        }
        let model = self
            .factory
            .resolve(options.provider.as_deref(), options.model.as_deref())
            .map_err(|e| AgentError::ConfigError {
                reason: e.to_string(),
            })?;

        let agent_id = uuid::Uuid::new_v4().to_string();
        self.register(
            options.conversation_id,
            AgentHandle {
                agent_id: agent_id.clone(),
                depth: options.depth,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(
            agent_id = %agent_id,
            conversation_id = options.conversation_id,
            depth = options.depth,
            provider = %model.provider,
            "agent created"
        );
        Ok(Agent::new(
            agent_id,
            options,
            model,
            cancel,
            output,
            Arc::clone(self),
        ))
    }

    fn register(&self, conversation_id: i64, handle: AgentHandle) {
        if let Ok(mut agents) = self.agents.lock() {
            agents.entry(conversation_id).or_default().push(handle);
        }
    }

    /// Drop one agent's bookkeeping entry, leaving other agents of the
    /// conversation reachable by `cancel_conversation`.
    pub fn unregister(&self, conversation_id: i64, agent_id: &str) {
        if let Ok(mut agents) = self.agents.lock() {
            if let Some(list) = agents.get_mut(&conversation_id) {
                list.retain(|h| h.agent_id != agent_id);
                if list.is_empty() {
                    agents.remove(&conversation_id);
                }
            }
        }
    }

    /// Running agents of a conversation.
    pub fn active_agents(&self, conversation_id: i64) -> Vec<AgentHandle> {
        self.agents
            .lock()
            .ok()
            .and_then(|a| a.get(&conversation_id).cloned())
            .unwrap_or_default()
    }

    /// Drop a conversation's bookkeeping. Returns how many entries were removed.
    pub fn clear_agents(&self, conversation_id: i64) -> usize {
        let removed = self
            .agents
            .lock()
            .ok()
            .and_then(|mut a| a.remove(&conversation_id))
            .map_or(0, |list| list.len());
        if removed > 0 {
            tracing::debug!(conversation_id, removed, "agent bookkeeping cleared");
        }
        removed
    }

    /// Cancel every running agent of a conversation.
    pub fn cancel_conversation(&self, conversation_id: i64) -> usize {
        let handles = self.active_agents(conversation_id);
        for handle in &handles {
            handle.cancel.cancel();
        }
        if !handles.is_empty() {
            tracing::info!(conversation_id, agents = handles.len(), "conversation cancelled");
        }
        handles.len()
    }

    // ─── Providers and Remote Tools ─────────────────────────────────────

    pub fn get_connected_providers(&self) -> Vec<String> {
        self.factory.connected_providers()
    }

    /// Discover and wrap the tools of every enabled remote source.
    ///
    /// A source that fails to start or list is logged and skipped.
    pub async fn get_remote_tools(&self) -> Vec<Arc<dyn ToolDefinition>> {
        let mut tools: Vec<Arc<dyn ToolDefinition>> = Vec::new();
        for source in self.tool_sources.enabled_sources() {
            match self.tool_sources.list_tools(&source).await {
                Ok(definitions) => {
                    tracing::info!(source = %source, tools = definitions.len(), "remote tools discovered");
                    for definition in definitions {
                        tools.push(Arc::new(RemoteTool::new(
                            &source,
                            definition,
                            Arc::clone(&self.tool_sources),
                        )));
                    }
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "remote source unavailable, skipping");
                }
            }
        }
        tools
    }

    // ─── Nested Agents ──────────────────────────────────────────────────

    fn child_depth(&self, ctx: &TurnContext) -> Result<u32, AgentError> {
        let depth = ctx.depth + 1;
        if depth > self.limits.max_agent_depth {
            return Err(AgentError::DepthExceeded {
                depth,
                max: self.limits.max_agent_depth,
            });
        }
        Ok(depth)
    }

    fn child_options(
        ctx: &TurnContext,
        depth: u32,
        system_prompt: String,
        prompt: &str,
        provider: Option<String>,
        model: Option<String>,
    ) -> AgentOptions {
        AgentOptions {
            conversation_id: ctx.conversation_id,
            project_id: ctx.project_id,
            project_root: ctx.project_root.clone(),
            system_prompt,
            message_id: None,
            provider,
            model,
            depth,
            history: HistorySource::Inline(vec![ModelMessage::user(prompt)]),
        }
    }

    /// Delegate `task` to a child agent and return its transcript.
    ///
    /// The child's progress is shown inside the parent's transcript while
    /// it runs.
    pub async fn spawn_sub_agent(
        self: &Arc<Self>,
        ctx: &TurnContext,
        task: &str,
        provider: Option<String>,
        model: Option<String>,
    ) -> Result<String, AgentError> {
        let depth = self.child_depth(ctx)?;
        ctx.emit_complete(open_tag("codiner-sub-agent-spawn", &[("task", task)], true));

        let system_prompt = format!(
            "You are a sub-agent tasked with: {task}. Be concise and return only the results of your work."
        );
        let task_attr = escape_xml_attr(task);
        let wrap: ForwardWrap = Arc::new(move |progress: &str| {
            format!("<codiner-sub-agent task=\"{task_attr}\">\n{progress}\n</codiner-sub-agent>")
        });
        let output = TurnOutput::Forward {
            tx: ctx.markup_sender(),
            wrap,
        };
        let options = Self::child_options(ctx, depth, system_prompt, task, provider, model);

        let mut agent = self.create_agent(options, ctx.cancel.child_token(), output)?;
        let agent_id = agent.id().to_string();
        let outcome = agent.run(Vec::new()).await;
        self.unregister(ctx.conversation_id, &agent_id);
        let outcome = outcome?;

        tracing::info!(
            agent_id = %agent_id,
            depth,
            steps = outcome.steps,
            aborted = outcome.was_aborted(),
            "sub-agent finished"
        );
        ctx.emit_complete(element(
            "codiner-sub-agent-result",
            &[("task", task)],
            &format!("\n{}\n", outcome.full_response),
        ));
        Ok(outcome.full_response)
    }

    /// Ask every connected provider about `query` concurrently.
    ///
    /// A provider that fails contributes an `Error: ...` answer; the
    /// operation itself only fails on the depth limit.
    pub async fn aggregate_knowledge(
        self: &Arc<Self>,
        ctx: &TurnContext,
        query: &str,
    ) -> Result<Vec<ProviderAnswer>, AgentError> {
        let depth = self.child_depth(ctx)?;
        let providers = self.get_connected_providers();
        if providers.is_empty() {
            return Ok(Vec::new());
        }

        ctx.emit_complete(open_tag(
            "codiner-ai-aggregation",
            &[("query", query), ("providers", &providers.join(", "))],
            false,
        ));

        let system_prompt =
            format!("You are a specialist providing knowledge on: {query}. Be concise and factual.");
        let children = providers.iter().map(|provider| {
            let options = Self::child_options(
                ctx,
                depth,
                system_prompt.clone(),
                query,
                Some(provider.clone()),
                None,
            );
            async move {
                let result = self.run_silent(ctx, options).await;
                let answer = match result {
                    Ok(response) => ProviderAnswer {
                        provider: provider.clone(),
                        response,
                        ok: true,
                    },
                    Err(e) => {
                        tracing::warn!(provider = %provider, error = %e, "aggregation provider failed");
                        ProviderAnswer {
                            provider: provider.clone(),
                            response: format!("Error: {e}"),
                            ok: false,
                        }
                    }
                };
                let preview: String = answer.response.chars().take(AGGREGATION_PREVIEW_CHARS).collect();
                ctx.emit_complete(format!(
                    "  {}{}...</provider-response>",
                    open_tag("provider-response", &[("name", &answer.provider)], false),
                    escape_xml_content(&preview)
                ));
                answer
            }
        });
        let answers = join_all(children).await;

        ctx.emit_complete("</codiner-ai-aggregation>");
        tracing::info!(
            providers = answers.len(),
            failed = answers.iter().filter(|a| !a.ok).count(),
            "aggregation finished"
        );
        Ok(answers)
    }

    async fn run_silent(
        self: &Arc<Self>,
        ctx: &TurnContext,
        options: AgentOptions,
    ) -> Result<String, AgentError> {
        let mut agent = self.create_agent(options, ctx.cancel.child_token(), TurnOutput::Silent)?;
        let agent_id = agent.id().to_string();
        let outcome = agent.run(Vec::new()).await;
        self.unregister(ctx.conversation_id, &agent_id);
        Ok(outcome?.full_response)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

//! The Runner drives one agent turn against a resolved model, looping tool calls until the
//! provider stops requesting them.
//!
//! `Runner` is deliberately agent-shape-agnostic: it only depends on the [`RunnerAgent`] trait,
//! not on the concrete `Agent` struct in [`crate::agent`]. This mirrors how the teacher's
//! `orchestration.rs` already factors turn-taking out of `Agent` itself rather than inlining it.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, ToolDefinition};
use crate::cloudllm::cost_tracker::ModelRegistry;
use crate::cloudllm::llm_session::ConversationItem;
use crate::cloudllm::streaming::{AgentExport, ProviderStream, StreamingEvent};
use crate::cloudllm::tool_catalog::DynamicToolCatalog;
use crate::cloudllm::tool_protocol::ToolError;

/// A caller-supplied hint for how capable a model should be, independent of the agent's
/// statically configured `model`/`modelClass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intelligence {
    Low,
    Standard,
    High,
}

/// The three model tiers the Runner selects between. An agent's `modelClass` string maps onto
/// one of these; `Intelligence::Low`/`High` can override the mapping toward `Mini`/`Reasoning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelClass {
    Mini,
    Standard,
    Reasoning,
}

impl ModelClass {
    fn from_str_or_standard(s: Option<&str>) -> Self {
        match s {
            Some("mini") => ModelClass::Mini,
            Some("reasoning") => ModelClass::Reasoning,
            _ => ModelClass::Standard,
        }
    }

    fn adjusted_for(self, intelligence: Option<Intelligence>) -> Self {
        match intelligence {
            Some(Intelligence::Low) => ModelClass::Mini,
            Some(Intelligence::High) => ModelClass::Reasoning,
            Some(Intelligence::Standard) | None => self,
        }
    }
}

/// Minimal surface the Runner needs from an agent implementation. [`crate::agent::Agent`]
/// implements this trait; tests and other orchestrators can supply their own.
pub trait RunnerAgent: Send + Sync {
    fn id(&self) -> String;
    fn system_prompt(&self) -> String;
    /// Exact model id to use, bypassing class-based selection, if set.
    fn model(&self) -> Option<String>;
    fn model_class(&self) -> Option<String>;
    fn intelligence(&self) -> Option<Intelligence>;
    /// Cumulative tool-call budget across every round of one top-level invocation.
    fn max_tool_calls(&self) -> Option<usize>;
    /// Per-turn cap on follow-up reinvocations after a batch of tool calls.
    fn max_tool_call_rounds_per_turn(&self) -> Option<usize>;
    fn tool_definitions(&self) -> Vec<ToolDefinition>;
}

/// Errors surfaced by the Runner and the orchestrators built on top of it.
#[derive(Debug)]
pub enum RunnerError {
    Provider(Box<dyn StdError + Send + Sync>),
    AllModelsExhausted { class: String },
    ToolDispatch(ToolError),
    RetryBudgetExceeded { stage: String },
    InvalidStageGraph { stage: String },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::Provider(e) => write!(f, "provider error: {e}"),
            RunnerError::AllModelsExhausted { class } => write!(f, "all models exhausted for class '{class}'"),
            RunnerError::ToolDispatch(e) => write!(f, "tool dispatch error: {e}"),
            RunnerError::RetryBudgetExceeded { stage } => write!(f, "retry budget exceeded for stage '{stage}'"),
            RunnerError::InvalidStageGraph { stage } => write!(f, "invalid stage graph: unknown stage '{stage}'"),
        }
    }
}

impl StdError for RunnerError {}

/// Resolves a model id to the concrete client that should be used to talk to it. Kept separate
/// from [`ModelRegistry`] (which only knows pricing/capabilities) so the Runner can be wired up
/// against any client-construction strategy (pooled clients, per-call construction, etc).
pub trait ModelClientResolver: Send + Sync {
    fn resolve(&self, model_id: &str) -> Option<Arc<dyn ClientWrapper>>;
}

/// A simple `ModelClientResolver` backed by a static map, sufficient for tests and small
/// deployments that construct all provider clients up front.
#[derive(Default)]
pub struct StaticClientMap {
    clients: HashMap<String, Arc<dyn ClientWrapper>>,
}

impl StaticClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model_id: impl Into<String>, client: Arc<dyn ClientWrapper>) {
        self.clients.insert(model_id.into(), client);
    }
}

impl ModelClientResolver for StaticClientMap {
    fn resolve(&self, model_id: &str) -> Option<Arc<dyn ClientWrapper>> {
        self.clients.get(model_id).cloned()
    }
}

/// Optional lifecycle callbacks for [`Runner::run_streamed_with_tools`].
#[derive(Default)]
pub struct RunnerHandlers {
    pub on_event: Option<Arc<dyn Fn(&StreamingEvent) + Send + Sync>>,
    pub on_response: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_complete: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

/// Drives agent turns against resolved models, handling fallback and the tool-call loop.
pub struct Runner {
    registry: Arc<ModelRegistry>,
    clients: Arc<dyn ModelClientResolver>,
    /// Ordered candidate model ids per class, most-preferred first. The Runner skips disabled
    /// entries and, on provider failure, advances to the next candidate.
    class_candidates: HashMap<ModelClass, Vec<String>>,
    catalog: Arc<DynamicToolCatalog>,
}

impl Runner {
    pub fn new(
        registry: Arc<ModelRegistry>,
        clients: Arc<dyn ModelClientResolver>,
        class_candidates: HashMap<ModelClass, Vec<String>>,
        catalog: Arc<DynamicToolCatalog>,
    ) -> Self {
        Self { registry, clients, class_candidates, catalog }
    }

    fn candidate_models(&self, agent: &dyn RunnerAgent) -> Vec<String> {
        if let Some(model) = agent.model() {
            return vec![model];
        }
        let class = ModelClass::from_str_or_standard(agent.model_class().as_deref())
            .adjusted_for(agent.intelligence());
        self.class_candidates
            .get(&class)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| self.registry.find_model(id).map(|e| !e.disabled).unwrap_or(true))
            .collect()
    }

    /// Resolves a model for `agent`, emits `agent_start`, then runs the provider stream. On
    /// provider error it iterates the remaining fallback candidates in class order, emitting
    /// `agent_updated` on every switch; if all candidates fail it emits a single `error` event.
    pub async fn run_streamed(
        &self,
        agent: &dyn RunnerAgent,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Vec<StreamingEvent> {
        let candidates = self.candidate_models(agent);
        let agent_id = agent.id();

        if candidates.is_empty() {
            return vec![StreamingEvent::Error {
                agent: AgentExport { id: agent_id, name: String::new(), model: String::new() },
                error: "no candidate models available".to_string(),
            }];
        }

        let mut events = Vec::new();
        for (i, model_id) in candidates.iter().enumerate() {
            let export = AgentExport { id: agent_id.clone(), name: agent_id.clone(), model: model_id.clone() };
            if i == 0 {
                events.push(StreamingEvent::AgentStart { agent: export.clone() });
            } else {
                events.push(StreamingEvent::AgentUpdated { agent: export.clone() });
            }

            let client = match self.clients.resolve(model_id) {
                Some(c) => c,
                None => {
                    events.push(StreamingEvent::Error {
                        agent: export,
                        error: format!("no client registered for model '{model_id}'"),
                    });
                    continue;
                }
            };
            let stream = ProviderStream::new(client, export);
            let mut attempt = stream.run(messages, tools.clone()).await;
            let failed = attempt.iter().any(|e| matches!(e, StreamingEvent::Error { .. }));
            events.append(&mut attempt);
            if !failed {
                return events;
            }
        }
        events
    }

    /// Runs one top-level invocation, looping follow-up turns whenever the provider requests
    /// tool calls, bounded independently by `max_tool_call_rounds_per_turn` and
    /// `max_tool_calls`. Returns the accumulated final assistant text.
    pub async fn run_streamed_with_tools(
        &self,
        agent: &dyn RunnerAgent,
        input: &str,
        history: &mut Vec<ConversationItem>,
        handlers: &RunnerHandlers,
    ) -> Result<String, RunnerError> {
        if !input.is_empty() {
            history.push(ConversationItem::user(input));
        }

        let max_calls = agent.max_tool_calls();
        let max_rounds = agent.max_tool_call_rounds_per_turn();
        let mut total_calls = 0usize;
        let mut round = 0usize;
        let mut full_response = String::new();

        loop {
            let system = ConversationItem::system(agent.system_prompt());
            let wire: Vec<Message> = std::iter::once(system.to_wire_message().unwrap())
                .chain(history.iter().filter_map(ConversationItem::to_wire_message))
                .collect();

            let events = self.run_streamed(agent, &wire, Some(agent.tool_definitions())).await;

            let mut tool_calls = Vec::new();
            for event in &events {
                if let Some(cb) = &handlers.on_event {
                    cb(event);
                }
                match event {
                    StreamingEvent::MessageComplete { content, .. } => {
                        full_response.push_str(content);
                        if let Some(cb) = &handlers.on_response {
                            cb(content);
                        }
                    }
                    StreamingEvent::ToolStart { tool_calls: calls, .. } => {
                        tool_calls = calls.clone();
                    }
                    StreamingEvent::Error { error, .. } => {
                        return Err(RunnerError::Provider(error.clone().into()));
                    }
                    _ => {}
                }
            }

            if tool_calls.is_empty() {
                if let Some(cb) = &handlers.on_complete {
                    cb(&full_response);
                }
                return Ok(full_response);
            }

            if let Some(max) = max_calls {
                if total_calls >= max {
                    if let Some(cb) = &handlers.on_complete {
                        cb(&full_response);
                    }
                    return Ok(full_response);
                }
            }

            for call in &tool_calls {
                let output = self.catalog.dispatch(call).await;
                history.push(ConversationItem::FunctionCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                });
                history.push(ConversationItem::FunctionCallOutput {
                    call_id: call.id.clone(),
                    name: Some(call.name.clone()),
                    output,
                });
                total_calls += 1;
            }

            round += 1;
            if let Some(max) = max_rounds {
                if round >= max {
                    if let Some(cb) = &handlers.on_complete {
                        cb(&full_response);
                    }
                    return Ok(full_response);
                }
            }
        }
    }
}

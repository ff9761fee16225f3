//! Agent data model.
//!
//! An [`Agent`] binds identity (`agent_id`, `name`, `description`, `instructions`) to a tool
//! surface ([`DynamicToolCatalog`]), worker agents it can delegate to, model selection hints, and
//! the ambient integrations the teacher's agents have always carried: a [`LLMSession`] for
//! standalone use, a [`ThoughtChain`] for durable memory, a [`ContextStrategy`] for context-window
//! management, and an [`EventHandler`] for observability.
//!
//! Two invocation paths exist side by side:
//!
//! - [`Agent::invoke`] drives the agent directly against its own bound client/session — the
//!   teacher's original `send()` loop, generalized to dispatch through [`DynamicToolCatalog`]
//!   instead of a hand-parsed `{"tool_call": ...}` JSON fragment.
//! - [`RunnerAgent`] lets a [`Runner`](crate::cloudllm::runner::Runner) drive the agent with model
//!   fallback across providers, used when an agent is invoked as a worker tool or as part of an
//!   orchestration.

use std::error::Error;
use std::sync::{Arc, RwLock as StdRwLock};

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::cloudllm::client_wrapper::{ClientWrapper, ToolDefinition};
use crate::cloudllm::context_strategy::{ContextStrategy, TrimStrategy};
use crate::cloudllm::event::{AgentEvent, EventHandler};
use crate::cloudllm::llm_session::{ConversationItem, LLMSession};
use crate::cloudllm::runner::{Intelligence, RunnerAgent, RunnerHandlers};
use crate::cloudllm::thought_chain::{Thought, ThoughtChain, ThoughtType};
use crate::cloudllm::tool_adapters::AsyncToolFunction;
use crate::cloudllm::tool_catalog::DynamicToolCatalog;
use crate::cloudllm::tool_protocol::{ToolMetadata, ToolParameter, ToolParameterType, ToolResult};
use crate::cloudllm::tool_protocols::CustomToolProtocol;

/// Rewrites a worker invocation's raw JSON parameters into the task string handed to
/// [`Agent::invoke`]. Custom agents register one of these via
/// [`Agent::with_params_processor`] to present a domain-specific tool surface instead of the
/// default `{task, context?, warnings?, goal?, intelligence?}` schema.
pub type ParamsProcessor = Arc<dyn Fn(&Agent, &JsonValue) -> String + Send + Sync>;

/// The default parameter schema an agent exposes when projected via [`Agent::as_tool`], unless a
/// custom `params`/[`ParamsProcessor`] pair overrides it.
fn default_as_tool_parameters() -> Vec<ToolParameter> {
    vec![
        ToolParameter::new("task", ToolParameterType::String)
            .with_description("The task to delegate to this agent.")
            .required(),
        ToolParameter::new("context", ToolParameterType::String)
            .with_description("Additional background the agent needs to complete the task."),
        ToolParameter::new("warnings", ToolParameterType::String)
            .with_description("Known pitfalls or constraints the agent should avoid."),
        ToolParameter::new("goal", ToolParameterType::String)
            .with_description("The overarching goal this task serves."),
        ToolParameter::new("intelligence", ToolParameterType::String)
            .with_description("Hint for model capability: 'low', 'standard', or 'high'.")
            .with_default(JsonValue::String("standard".to_string())),
    ]
}

fn intelligence_from_hint(hint: Option<&str>) -> Option<Intelligence> {
    match hint {
        Some("low") => Some(Intelligence::Low),
        Some("high") => Some(Intelligence::High),
        Some("standard") => Some(Intelligence::Standard),
        _ => None,
    }
}

/// Outcome of [`Agent::invoke`].
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub content: String,
    pub tool_calls_made: usize,
}

/// The unit of work in the orchestration platform: an identity, a system prompt built from
/// `description`/`instructions`, a tool surface, optional worker agents, model selection hints,
/// and the ambient ThoughtChain/EventHandler/ContextStrategy integrations.
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub workers: Vec<Arc<Agent>>,
    pub model: Option<String>,
    pub model_class: Option<String>,
    pub intelligence: Option<Intelligence>,
    pub model_settings: JsonValue,
    pub max_tool_calls: Option<usize>,
    pub max_tool_call_rounds_per_turn: Option<usize>,
    pub json_schema: Option<JsonValue>,
    pub verifier: Option<Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>>,
    pub parent_id: Option<String>,

    on_tool_call: Option<Arc<dyn Fn(&str, &JsonValue) + Send + Sync>>,
    on_tool_result: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
    on_request: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    on_response: Option<Arc<dyn Fn(&str) + Send + Sync>>,

    params_schema: Option<Vec<ToolParameter>>,
    params_processor: Option<ParamsProcessor>,

    catalog: Arc<RwLock<DynamicToolCatalog>>,
    session: LLMSession,
    context_strategy: Box<dyn ContextStrategy>,
    thought_chain: Option<Arc<tokio::sync::RwLock<ThoughtChain>>>,
    event_handler: Option<Arc<dyn EventHandler>>,

    /// Snapshot of materialized tool definitions, refreshed by [`Agent::refresh_tool_definitions`].
    /// Exists because [`RunnerAgent::tool_definitions`] is synchronous while materialization
    /// (agent-overlay + dynamic parameter resolution) is necessarily async.
    cached_tool_definitions: StdRwLock<Vec<ToolDefinition>>,
}

impl Agent {
    /// Creates a new agent with an empty, protocol-backed tool catalog and a standalone
    /// [`LLMSession`] bound to `client`.
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>, client: Arc<dyn ClientWrapper>) -> Self {
        let protocol = Arc::new(CustomToolProtocol::new());
        let registry = crate::cloudllm::tool_protocol::ToolRegistry::new(protocol);
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            workers: Vec::new(),
            model: None,
            model_class: None,
            intelligence: None,
            model_settings: JsonValue::Object(Default::default()),
            max_tool_calls: Some(25),
            max_tool_call_rounds_per_turn: Some(10),
            json_schema: None,
            verifier: None,
            parent_id: None,
            on_tool_call: None,
            on_tool_result: None,
            on_request: None,
            on_response: None,
            params_schema: None,
            params_processor: None,
            catalog: Arc::new(RwLock::new(DynamicToolCatalog::new(registry))),
            session: LLMSession::new(client, String::new(), 128_000),
            context_strategy: Box::new(TrimStrategy::default()),
            thought_chain: None,
            event_handler: None,
            cached_tool_definitions: StdRwLock::new(Vec::new()),
        }
    }

    // ── Builders ────────────────────────────────────────────────────────────

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_model_class(mut self, model_class: impl Into<String>) -> Self {
        self.model_class = Some(model_class.into());
        self
    }

    pub fn with_intelligence(mut self, intelligence: Intelligence) -> Self {
        self.intelligence = Some(intelligence);
        self
    }

    pub fn with_model_settings(mut self, settings: JsonValue) -> Self {
        self.model_settings = settings;
        self
    }

    pub fn with_max_tool_calls(mut self, max: usize) -> Self {
        self.max_tool_calls = Some(max);
        self
    }

    pub fn with_max_tool_call_rounds_per_turn(mut self, max: usize) -> Self {
        self.max_tool_call_rounds_per_turn = Some(max);
        self
    }

    pub fn with_json_schema(mut self, schema: JsonValue) -> Self {
        self.json_schema = Some(schema);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.session = LLMSession::new(Arc::clone(self.session.client()), String::new(), max_tokens);
        self
    }

    /// Overrides the default `asTool()` parameter schema and supplies a processor that rewrites
    /// raw invocation params into the task string passed to [`Agent::invoke`].
    pub fn with_params_processor(mut self, schema: Vec<ToolParameter>, processor: ParamsProcessor) -> Self {
        self.params_schema = Some(schema);
        self.params_processor = Some(processor);
        self
    }

    pub fn with_thought_chain(mut self, chain: Arc<tokio::sync::RwLock<ThoughtChain>>) -> Self {
        self.thought_chain = Some(chain);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn set_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.event_handler = Some(handler);
    }

    pub fn context_collapse_strategy(mut self, strategy: Box<dyn ContextStrategy>) -> Self {
        self.context_strategy = strategy;
        self
    }

    pub fn set_context_collapse_strategy(&mut self, strategy: Box<dyn ContextStrategy>) {
        self.context_strategy = strategy;
    }

    pub fn on_tool_call(mut self, hook: Arc<dyn Fn(&str, &JsonValue) + Send + Sync>) -> Self {
        self.on_tool_call = Some(hook);
        self
    }

    pub fn on_tool_result(mut self, hook: Arc<dyn Fn(&str, &str) + Send + Sync>) -> Self {
        self.on_tool_result = Some(hook);
        self
    }

    pub fn on_request(mut self, hook: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.on_request = Some(hook);
        self
    }

    pub fn on_response(mut self, hook: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.on_response = Some(hook);
        self
    }

    // ── Identity / system prompt ────────────────────────────────────────────

    /// Renders `description` + `instructions` into the base system prompt.
    pub fn system_prompt(&self) -> String {
        let mut parts = Vec::new();
        if !self.description.is_empty() {
            parts.push(self.description.clone());
        }
        if !self.instructions.is_empty() {
            parts.push(self.instructions.clone());
        }
        parts.join("\n\n")
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_agent_event(&event).await;
        }
    }

    fn emit_sync(&self, event: AgentEvent) {
        if let Some(handler) = self.event_handler.clone() {
            tokio::spawn(async move {
                handler.on_agent_event(&event).await;
            });
        }
    }

    // ── Tool registry access ────────────────────────────────────────────────

    pub fn catalog(&self) -> &Arc<RwLock<DynamicToolCatalog>> {
        &self.catalog
    }

    /// Adds a worker agent, whose `as_tool()` projection is appended to this agent's visible
    /// tools — the invariant that `workers[]` always surfaces through `tools[]`.
    pub async fn add_worker(&mut self, worker: Arc<Agent>) {
        let (metadata, function) = worker.as_tool();
        let protocol = Arc::new(CustomToolProtocol::new());
        protocol.register_async_tool(metadata.clone(), function).await;
        {
            let mut catalog = self.catalog.write().await;
            let registry = catalog.registry_mut();
            let protocol_name = format!("worker:{}", worker.agent_id);
            if let Err(e) = registry.add_protocol(&protocol_name, protocol).await {
                log::warn!("failed to register worker '{}' as a tool: {e}", worker.agent_id);
            }
        }
        self.refresh_tool_definitions().await;
        self.workers.push(worker);
    }

    /// Materializes this agent's full tool list (static registry + worker projections, with
    /// dynamic parameter hooks resolved) and refreshes the cached snapshot
    /// [`RunnerAgent::tool_definitions`] reads synchronously.
    pub async fn refresh_tool_definitions(&self) {
        let metadata = self.catalog.read().await.materialize_for_agent(&self.agent_id).await;
        let defs: Vec<ToolDefinition> = metadata.iter().map(ToolMetadata::to_tool_definition).collect();
        *self.cached_tool_definitions.write().unwrap() = defs;
    }

    /// Returns the deduplicated tool list visible to this agent: static tools, then
    /// agent-specific/worker tools, with later entries overwriting earlier ones by name.
    pub async fn get_tools(&self) -> Vec<ToolMetadata> {
        self.catalog.read().await.materialize_for_agent(&self.agent_id).await
    }

    // ── ThoughtChain convenience methods ─────────────────────────────────────

    pub async fn commit(&self, entry_type: ThoughtType, content: &str) -> std::io::Result<()> {
        if let Some(chain) = &self.thought_chain {
            let mut chain = chain.write().await;
            chain.append(&self.agent_id, entry_type.clone(), content)?;
        }
        self.emit(AgentEvent::ThoughtCommitted {
            agent_id: self.agent_id.clone(),
            agent_name: self.name.clone(),
            thought_type: entry_type,
        })
        .await;
        Ok(())
    }

    pub async fn thought_entries(&self) -> Option<Vec<Thought>> {
        match &self.thought_chain {
            Some(chain) => Some(chain.read().await.thoughts().to_vec()),
            None => None,
        }
    }

    // ── Lifecycle: fork / clone-for-invocation ───────────────────────────────

    /// Forks this agent: shares the tool catalog, thought chain, and event handler via `Arc`, but
    /// starts a fresh, empty session bound to the same client and token budget.
    pub fn fork(&self) -> Self {
        let forked = Self {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            instructions: self.instructions.clone(),
            workers: self.workers.clone(),
            model: self.model.clone(),
            model_class: self.model_class.clone(),
            intelligence: self.intelligence,
            model_settings: self.model_settings.clone(),
            max_tool_calls: self.max_tool_calls,
            max_tool_call_rounds_per_turn: self.max_tool_call_rounds_per_turn,
            json_schema: self.json_schema.clone(),
            verifier: self.verifier.clone(),
            parent_id: self.parent_id.clone(),
            on_tool_call: self.on_tool_call.clone(),
            on_tool_result: self.on_tool_result.clone(),
            on_request: self.on_request.clone(),
            on_response: self.on_response.clone(),
            params_schema: self.params_schema.clone(),
            params_processor: self.params_processor.clone(),
            catalog: Arc::clone(&self.catalog),
            session: LLMSession::new(Arc::clone(self.session.client()), String::new(), self.session.max_tokens()),
            context_strategy: Box::new(TrimStrategy::default()),
            thought_chain: self.thought_chain.clone(),
            event_handler: self.event_handler.clone(),
            cached_tool_definitions: StdRwLock::new(self.cached_tool_definitions.read().unwrap().clone()),
        };
        self.emit_sync(AgentEvent::Forked { agent_id: self.agent_id.clone(), agent_name: self.name.clone() });
        forked
    }

    /// Like [`fork`](Agent::fork), but also copies the system prompt and full conversation
    /// history into the new session.
    pub fn fork_with_context(&self) -> Self {
        let mut forked = self.fork();
        forked.session.set_system_prompt(self.system_prompt());
        for item in self.session.history() {
            forked.session.append(item.clone());
        }
        self.emit_sync(AgentEvent::ForkedWithContext {
            agent_id: self.agent_id.clone(),
            agent_name: self.name.clone(),
        });
        forked
    }

    /// Produces the per-invocation clone used by [`Agent::as_tool`]: a fresh `agent_id`, the
    /// `intelligence` hint applied to `model_class`, function references shared via `Arc`, and
    /// arrays/config shallow-copied. The clone keeps `parent_id` pointed at the original so the
    /// parent exclusively owns the traceable lineage.
    fn clone_for_invocation(&self, intelligence: Option<Intelligence>) -> Self {
        let mut clone = self.fork_with_context();
        clone.agent_id = uuid::Uuid::new_v4().to_string();
        clone.parent_id = Some(self.agent_id.clone());
        if let Some(hint) = intelligence {
            clone.intelligence = Some(hint);
        }
        clone
    }

    // ── asTool projection ────────────────────────────────────────────────────

    /// Projects this agent as a callable async tool. Invocation clones the agent (fresh
    /// `agent_id`, intelligence hint applied), then dispatches through [`Agent::invoke`].
    pub fn as_tool(self: &Arc<Self>) -> (ToolMetadata, AsyncToolFunction) {
        let parameters = self.params_schema.clone().unwrap_or_else(default_as_tool_parameters);
        let mut metadata = ToolMetadata::new(self.agent_id.clone(), self.description.clone());
        for param in parameters {
            metadata = metadata.with_parameter(param);
        }

        let template = Arc::clone(self);
        let function: AsyncToolFunction = Arc::new(move |params: JsonValue| {
            let template = Arc::clone(&template);
            Box::pin(async move {
                let intelligence = params.get("intelligence").and_then(|v| v.as_str());
                let mut invocation = template.clone_for_invocation(intelligence_from_hint(intelligence));

                let task = if let Some(processor) = &template.params_processor {
                    processor(&invocation, &params)
                } else {
                    let mut prompt = params.get("task").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    if let Some(goal) = params.get("goal").and_then(|v| v.as_str()) {
                        prompt = format!("Goal: {goal}\n\n{prompt}");
                    }
                    if let Some(context) = params.get("context").and_then(|v| v.as_str()) {
                        prompt = format!("{prompt}\n\nContext: {context}");
                    }
                    if let Some(warnings) = params.get("warnings").and_then(|v| v.as_str()) {
                        prompt = format!("{prompt}\n\nWarnings: {warnings}");
                    }
                    prompt
                };

                let response = invocation.invoke(&task).await?;
                Ok(ToolResult::success(JsonValue::String(response.content)))
            })
        });

        (metadata, function)
    }

    // ── Standalone invocation ────────────────────────────────────────────────

    /// Drives one turn directly against this agent's own bound client/session: sends
    /// `user_message`, dispatching any requested tool calls through the shared catalog, looping
    /// until the model stops requesting tools or `max_tool_calls`/`max_tool_call_rounds_per_turn`
    /// is hit.
    pub async fn invoke(&mut self, user_message: &str) -> Result<AgentResponse, Box<dyn Error + Send + Sync>> {
        if self.context_strategy.should_compact(&self.session) {
            self.context_strategy.compact(&mut self.session, &self.thought_chain, &self.agent_id).await?;
        }

        if let Some(hook) = &self.on_request {
            hook(user_message);
        }

        self.emit(AgentEvent::SendStarted {
            agent_id: self.agent_id.clone(),
            agent_name: self.name.clone(),
            message_preview: user_message.chars().take(120).collect(),
        })
        .await;

        self.session.set_system_prompt(self.system_prompt());

        let mut tool_calls_made = 0usize;
        let mut iteration = 0usize;
        let max_rounds = self.max_tool_call_rounds_per_turn.unwrap_or(5);

        self.emit(AgentEvent::LLMCallStarted {
            agent_id: self.agent_id.clone(),
            agent_name: self.name.clone(),
            iteration: 1,
        })
        .await;
        let mut response = self
            .session
            .send_message(crate::cloudllm::client_wrapper::Role::User, user_message.to_string())
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { std::io::Error::other(e.to_string()).into() })?;
        self.emit(AgentEvent::LLMCallCompleted {
            agent_id: self.agent_id.clone(),
            agent_name: self.name.clone(),
            iteration: 1,
            tokens_used: self.session.client().get_last_usage().await,
            response_length: response.content.len(),
        })
        .await;

        while !response.tool_calls.is_empty() && iteration < max_rounds {
            iteration += 1;
            for call in &response.tool_calls {
                self.emit(AgentEvent::ToolCallDetected {
                    agent_id: self.agent_id.clone(),
                    agent_name: self.name.clone(),
                    tool_name: call.name.clone(),
                    parameters: call.arguments.clone(),
                    iteration,
                })
                .await;
                if let Some(hook) = &self.on_tool_call {
                    hook(&call.name, &call.arguments);
                }

                if let Some(max) = self.max_tool_calls {
                    if tool_calls_made >= max {
                        break;
                    }
                }

                let output = self.catalog.read().await.dispatch(call).await;
                let success = !output.contains("\"__tool_error\"");
                self.emit(AgentEvent::ToolExecutionCompleted {
                    agent_id: self.agent_id.clone(),
                    agent_name: self.name.clone(),
                    tool_name: call.name.clone(),
                    parameters: call.arguments.clone(),
                    success,
                    error: if success { None } else { Some(output.clone()) },
                    iteration,
                })
                .await;
                if let Some(hook) = &self.on_tool_result {
                    hook(&call.name, &output);
                }

                self.session.history_mut().push(ConversationItem::FunctionCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                });
                self.session.history_mut().push(ConversationItem::FunctionCallOutput {
                    call_id: call.id.clone(),
                    name: Some(call.name.clone()),
                    output,
                });
                tool_calls_made += 1;
            }

            self.emit(AgentEvent::LLMCallStarted {
                agent_id: self.agent_id.clone(),
                agent_name: self.name.clone(),
                iteration: iteration + 1,
            })
            .await;
            response = self
                .session
                .send_message(crate::cloudllm::client_wrapper::Role::User, String::new())
                .await
                .map_err(|e| -> Box<dyn Error + Send + Sync> { std::io::Error::other(e.to_string()).into() })?;
            self.emit(AgentEvent::LLMCallCompleted {
                agent_id: self.agent_id.clone(),
                agent_name: self.name.clone(),
                iteration: iteration + 1,
                tokens_used: self.session.client().get_last_usage().await,
                response_length: response.content.len(),
            })
            .await;
        }

        if !response.tool_calls.is_empty() {
            self.emit(AgentEvent::ToolMaxIterationsReached {
                agent_id: self.agent_id.clone(),
                agent_name: self.name.clone(),
            })
            .await;
        }

        let content = response.content.to_string();
        if let Some(verifier) = &self.verifier {
            if let Err(reason) = verifier(&content) {
                log::warn!("agent '{}' response failed verification: {reason}", self.agent_id);
            }
        }
        if let Some(hook) = &self.on_response {
            hook(&content);
        }

        self.emit(AgentEvent::SendCompleted {
            agent_id: self.agent_id.clone(),
            agent_name: self.name.clone(),
            tokens_used: self.session.client().get_last_usage().await,
            tool_calls_made,
            response_length: content.len(),
        })
        .await;

        Ok(AgentResponse { content, tool_calls_made })
    }

    /// Drives this agent through a [`Runner`](crate::cloudllm::runner::Runner), enabling
    /// cross-provider model fallback. Prefer this over [`Agent::invoke`] when the agent is part
    /// of an orchestration with its own `Runner`/`ModelRegistry` wiring.
    pub async fn invoke_via_runner(
        &self,
        runner: &crate::cloudllm::runner::Runner,
        input: &str,
        history: &mut Vec<ConversationItem>,
        handlers: &RunnerHandlers,
    ) -> Result<String, crate::cloudllm::runner::RunnerError> {
        self.refresh_tool_definitions().await;
        runner.run_streamed_with_tools(self, input, history, handlers).await
    }
}

impl RunnerAgent for Agent {
    fn id(&self) -> String {
        self.agent_id.clone()
    }

    fn system_prompt(&self) -> String {
        Agent::system_prompt(self)
    }

    fn model(&self) -> Option<String> {
        self.model.clone()
    }

    fn model_class(&self) -> Option<String> {
        self.model_class.clone()
    }

    fn intelligence(&self) -> Option<Intelligence> {
        self.intelligence
    }

    fn max_tool_calls(&self) -> Option<usize> {
        self.max_tool_calls
    }

    fn max_tool_call_rounds_per_turn(&self) -> Option<usize> {
        self.max_tool_call_rounds_per_turn
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.cached_tool_definitions.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{Message, Role, TokenUsage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedClient {
        replies: Mutex<Vec<Message>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClientWrapper for ScriptedClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().await;
            if replies.is_empty() {
                return Ok(Message { role: Role::Assistant, content: Arc::from(""), tool_calls: vec![] });
            }
            Ok(replies.remove(0))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
            None
        }
    }

    fn plain_reply(text: &str) -> Message {
        Message { role: Role::Assistant, content: Arc::from(text), tool_calls: vec![] }
    }

    #[tokio::test]
    async fn invoke_returns_plain_response_when_no_tool_calls() {
        let client = Arc::new(ScriptedClient { replies: Mutex::new(vec![plain_reply("hello there")]), calls: AtomicUsize::new(0) });
        let mut agent = Agent::new("a1", "Agent One", client).with_instructions("be terse");
        let response = agent.invoke("hi").await.unwrap();
        assert_eq!(response.content, "hello there");
        assert_eq!(response.tool_calls_made, 0);
    }

    #[tokio::test]
    async fn fork_shares_catalog_but_starts_fresh_session() {
        let client = Arc::new(ScriptedClient { replies: Mutex::new(vec![]), calls: AtomicUsize::new(0) });
        let mut agent = Agent::new("a1", "Agent One", client);
        agent.session.history_mut().push(ConversationItem::user("seed message"));
        let forked = agent.fork();
        assert_eq!(forked.agent_id, agent.agent_id);
        assert!(forked.session.history().is_empty());
        assert!(Arc::ptr_eq(&forked.catalog, &agent.catalog));
    }

    #[tokio::test]
    async fn fork_with_context_copies_history() {
        let client = Arc::new(ScriptedClient { replies: Mutex::new(vec![]), calls: AtomicUsize::new(0) });
        let mut agent = Agent::new("a1", "Agent One", client);
        agent.session.history_mut().push(ConversationItem::user("seed message"));
        let forked = agent.fork_with_context();
        assert_eq!(forked.session.history().len(), 1);
    }

    #[tokio::test]
    async fn as_tool_invocation_gets_a_fresh_agent_id() {
        let client = Arc::new(ScriptedClient { replies: Mutex::new(vec![plain_reply("done")]), calls: AtomicUsize::new(0) });
        let agent = Arc::new(
            Agent::new("worker-1", "Worker", client)
                .with_description("Does small tasks.")
                .with_max_tool_call_rounds_per_turn(1),
        );
        let (metadata, function) = agent.as_tool();
        assert_eq!(metadata.name, "worker-1");
        let result = function(serde_json::json!({"task": "do the thing"})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, JsonValue::String("done".to_string()));
    }

    #[test]
    fn runner_agent_reads_cached_tool_definitions() {
        let client = Arc::new(ScriptedClient { replies: Mutex::new(vec![]), calls: AtomicUsize::new(0) });
        let agent = Agent::new("a1", "Agent One", client).with_model("gpt-4.1");
        assert_eq!(RunnerAgent::model(&agent).as_deref(), Some("gpt-4.1"));
        assert!(agent.tool_definitions().is_empty());
    }
}

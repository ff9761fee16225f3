//! The `llm_session` module encapsulates a conversational session with a Language Learning Model
//! (LLM) and the canonical, provider-agnostic conversation history the rest of the crate builds
//! on top of.
//!
//! `LLMSession` keeps a running dialogue history while respecting the token budget of the
//! backing model, trimming the oldest entries first when the budget is exceeded. Unlike the
//! provider-facing [`Message`](crate::client_wrapper::Message) list, the session's history is
//! stored as [`ConversationItem`]s — a richer, tagged representation that also captures
//! function-call/function-call-output pairs and chain-of-thought segments so the Tool Call
//! Engine and Runner can reconcile tool usage without losing information on a round trip.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cloudllm::clients::openai::{Model, OpenAIClient};
//! use cloudllm::LLMSession;
//! use cloudllm::client_wrapper::Role;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(OpenAIClient::new_with_model_enum(
//!     &std::env::var("OPEN_AI_SECRET")?,
//!     Model::GPT41Mini,
//! ));
//! let mut session = LLMSession::new(client, "You are an AI assistant.".to_string(), 8_000);
//! let response = session.send_message(Role::User, "Hello, World!".to_string()).await?;
//! println!("Assistant: {}", response.content);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role};

/// Canonical, provider-agnostic history entry.
///
/// The Runner and Tool Call Engine operate exclusively on `ConversationItem`s rather than the
/// thinner [`Message`] shape used directly against a provider, so that `function_call` /
/// `function_call_output` pairs survive across follow-up turns.
#[derive(Debug, Clone)]
pub enum ConversationItem {
    /// A plain role-tagged message (system, user, assistant, or developer).
    Message { role: ConversationRole, content: Arc<str> },
    /// A tool invocation requested by the model.
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// The result of dispatching a [`ConversationItem::FunctionCall`]. Every `FunctionCall`
    /// must eventually be matched by exactly one `FunctionCallOutput` with the same `call_id`.
    FunctionCallOutput {
        call_id: String,
        name: Option<String>,
        output: String,
    },
    /// Chain-of-thought content a provider surfaced alongside its answer. Not sent back
    /// upstream by default; kept for observability/ThoughtChain integration.
    Thinking { content: Arc<str> },
}

/// Role used by [`ConversationItem::Message`]. A superset of [`Role`] — `Developer` has no
/// native-provider analogue and is downgraded to `System` when converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationRole {
    System,
    User,
    Assistant,
    Developer,
}

impl ConversationItem {
    pub fn system(content: impl Into<Arc<str>>) -> Self {
        ConversationItem::Message { role: ConversationRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<Arc<str>>) -> Self {
        ConversationItem::Message { role: ConversationRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<Arc<str>>) -> Self {
        ConversationItem::Message { role: ConversationRole::Assistant, content: content.into() }
    }

    /// True for `FunctionCall` items whose `call_id` has no matching `FunctionCallOutput` yet
    /// in `history`. Used by the Runner to assert the pairing invariant before a turn ends.
    pub fn is_unmatched_call<'a>(&self, history: &'a [ConversationItem]) -> bool {
        match self {
            ConversationItem::FunctionCall { call_id, .. } => !history.iter().any(|item| {
                matches!(item, ConversationItem::FunctionCallOutput { call_id: c, .. } if c == call_id)
            }),
            _ => false,
        }
    }

    /// Approximate token estimate: one token per four characters, a small fixed overhead per
    /// item for role/structure framing. Mirrors the heuristic the crate has always used for
    /// [`Message`] token accounting.
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            ConversationItem::Message { content, .. } => content.len(),
            ConversationItem::FunctionCall { name, arguments, .. } => name.len() + arguments.len(),
            ConversationItem::FunctionCallOutput { output, name, .. } => {
                output.len() + name.as_deref().map(str::len).unwrap_or(0)
            }
            ConversationItem::Thinking { content } => content.len(),
        };
        1 + (chars / 4).max(1)
    }

    /// Render this item into the provider-facing [`Message`] shape used for a `send_message`
    /// call. `FunctionCall`/`FunctionCallOutput` items collapse to `Role::Tool` messages;
    /// `Thinking` items are omitted (providers never receive them back).
    pub fn to_wire_message(&self) -> Option<Message> {
        match self {
            ConversationItem::Message { role, content } => Some(Message {
                role: match role {
                    ConversationRole::System | ConversationRole::Developer => Role::System,
                    ConversationRole::User => Role::User,
                    ConversationRole::Assistant => Role::Assistant,
                },
                content: content.clone(),
                tool_calls: Vec::new(),
            }),
            ConversationItem::FunctionCallOutput { call_id, output, .. } => Some(Message {
                role: Role::Tool { call_id: call_id.clone() },
                content: Arc::from(output.as_str()),
                tool_calls: Vec::new(),
            }),
            ConversationItem::FunctionCall { .. } | ConversationItem::Thinking { .. } => None,
        }
    }
}

/// Represents a conversational session with an LLM.
///
/// `LLMSession` is intentionally not generic over the client type: it holds a type-erased
/// `Arc<dyn ClientWrapper>` so that a session can be handed to the Runner, to an `Agent`, or
/// forked across sub-agents without binding the whole call stack to one concrete provider.
pub struct LLMSession {
    client: Arc<dyn ClientWrapper>,
    system_prompt: ConversationItem,
    conversation_history: Vec<ConversationItem>,
    max_tokens: usize,
    token_count: usize,
}

impl LLMSession {
    /// Creates a new `LLMSession` with the given client and system prompt.
    pub fn new(client: Arc<dyn ClientWrapper>, system_prompt: String, max_tokens: usize) -> Self {
        let system_prompt = ConversationItem::system(system_prompt);
        let token_count = system_prompt.approx_tokens();
        LLMSession {
            client,
            system_prompt,
            conversation_history: Vec::new(),
            max_tokens,
            token_count,
        }
    }

    /// Sends a message to the LLM and appends both the outgoing message and the LLM's reply to
    /// history. Returns the assistant's reply as a provider [`Message`].
    pub async fn send_message(
        &mut self,
        role: Role,
        content: String,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let conv_role = match role {
            Role::System => ConversationRole::System,
            Role::User => ConversationRole::User,
            Role::Assistant => ConversationRole::Assistant,
            Role::Tool { .. } => ConversationRole::User,
        };
        self.append(ConversationItem::Message { role: conv_role, content: Arc::from(content.as_str()) });

        let wire: Vec<Message> = std::iter::once(self.system_prompt.to_wire_message().unwrap())
            .chain(self.conversation_history.iter().filter_map(ConversationItem::to_wire_message))
            .collect();

        let response = self.client.send_message(&wire, None).await?;
        self.append(ConversationItem::assistant(response.content.clone()));
        Ok(response)
    }

    /// Appends an item to history and re-applies the token budget trim.
    pub fn append(&mut self, item: ConversationItem) {
        self.token_count += item.approx_tokens();
        self.conversation_history.push(item);
        self.trim();
    }

    /// Sets a new system prompt for the session, updating the token count accordingly.
    pub fn set_system_prompt(&mut self, prompt: String) {
        self.token_count -= self.system_prompt.approx_tokens();
        self.system_prompt = ConversationItem::system(prompt);
        self.token_count += self.system_prompt.approx_tokens();
    }

    pub fn history(&self) -> &[ConversationItem] {
        &self.conversation_history
    }

    pub fn history_mut(&mut self) -> &mut Vec<ConversationItem> {
        &mut self.conversation_history
    }

    pub fn client(&self) -> &Arc<dyn ClientWrapper> {
        &self.client
    }

    pub fn estimated_history_tokens(&self) -> usize {
        self.token_count
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Replaces the entire history (used by context-collapse strategies after compaction).
    pub fn replace_history(&mut self, items: Vec<ConversationItem>) {
        self.token_count = self.system_prompt.approx_tokens()
            + items.iter().map(ConversationItem::approx_tokens).sum::<usize>();
        self.conversation_history = items;
    }

    /// Trims the conversation history (oldest-first) to fit within `max_tokens`.
    fn trim(&mut self) {
        while self.token_count > self.max_tokens && !self.conversation_history.is_empty() {
            let removed = self.conversation_history.remove(0);
            self.token_count -= removed.approx_tokens();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::TokenUsage;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct EchoClient {
        usage: Mutex<Option<TokenUsage>>,
    }

    #[async_trait]
    impl ClientWrapper for EchoClient {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<crate::cloudllm::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            let last = messages.last().map(|m| m.content.to_string()).unwrap_or_default();
            Ok(Message { role: Role::Assistant, content: Arc::from(format!("echo:{last}")), tool_calls: vec![] })
        }

        fn model_name(&self) -> &str {
            "echo"
        }

        fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
            Some(&self.usage)
        }
    }

    #[tokio::test]
    async fn send_message_round_trips_through_history() {
        let client = Arc::new(EchoClient { usage: Mutex::new(None) });
        let mut session = LLMSession::new(client, "be terse".into(), 8_000);
        let resp = session.send_message(Role::User, "hi".into()).await.unwrap();
        assert_eq!(resp.content.as_ref(), "echo:hi");
        assert_eq!(session.history().len(), 2);
    }

    #[test]
    fn trims_oldest_first_when_over_budget() {
        let client = Arc::new(EchoClient { usage: Mutex::new(None) });
        let mut session = LLMSession::new(client, "sys".into(), 10);
        for i in 0..20 {
            session.append(ConversationItem::user(format!("message number {i}")));
        }
        assert!(session.estimated_history_tokens() <= 10 || session.history().len() < 20);
    }

    #[test]
    fn function_call_pairing_detected() {
        let call = ConversationItem::FunctionCall { call_id: "c1".into(), name: "f".into(), arguments: "{}".into() };
        let history = vec![ConversationItem::FunctionCallOutput { call_id: "c1".into(), name: None, output: "ok".into() }];
        assert!(!call.is_unmatched_call(&history));
        assert!(call.is_unmatched_call(&[]));
    }
}

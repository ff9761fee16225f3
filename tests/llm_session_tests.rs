use async_trait::async_trait;
use cloudllm::client_wrapper;
use cloudllm::client_wrapper::{ClientWrapper, Message, Role, TokenUsage, ToolDefinition};
use cloudllm::cloudllm::llm_session::ConversationItem;
use cloudllm::LLMSession;
use std::sync::Arc;
use tokio::sync::Mutex;

// Mock client that records how many wire messages it was sent and reports a settable
// TokenUsage back through `usage_slot`.
struct MockClient {
    usage: Mutex<Option<TokenUsage>>,
    response_content: String,
    last_message_count: Mutex<usize>,
}

impl MockClient {
    fn new(response_content: String) -> Self {
        Self {
            usage: Mutex::new(None),
            response_content,
            last_message_count: Mutex::new(0),
        }
    }

    async fn get_last_message_count(&self) -> usize {
        *self.last_message_count.lock().await
    }

    async fn set_usage(&self, input: usize, output: usize, total: usize) {
        let mut usage = self.usage.lock().await;
        *usage = Some(client_wrapper::TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: total,
        });
    }
}

#[async_trait]
impl ClientWrapper for MockClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let mut count_guard = self.last_message_count.lock().await;
        *count_guard = messages.len();

        Ok(Message {
            role: Role::Assistant,
            content: self.response_content.clone().into(),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

#[tokio::test]
async fn test_usage_reported_after_send() {
    let mock_client = Arc::new(MockClient::new("Response".to_string()));
    let mut session = LLMSession::new(mock_client.clone(), "System prompt".to_string(), 1000);

    mock_client.set_usage(100, 50, 150).await;

    let _ = session
        .send_message(Role::User, "Hello, this is a test message".to_string())
        .await;

    assert_eq!(session.history().len(), 2); // user message + response

    let usage = mock_client.get_last_usage().await.expect("usage should be set");
    assert_eq!(usage.input_tokens, 100);
    assert_eq!(usage.output_tokens, 50);
    assert_eq!(usage.total_tokens, 150);
}

#[tokio::test]
async fn test_history_trims_when_budget_exceeded() {
    let mock_client = Arc::new(MockClient::new("Response".to_string()));
    let mut session = LLMSession::new(
        mock_client.clone(),
        "System prompt".to_string(),
        20, // small budget to force trimming
    );

    for i in 0..10 {
        let _ = session
            .send_message(Role::User, format!("message number {i}"))
            .await;
    }

    assert!(
        session.estimated_history_tokens() <= session.max_tokens() || session.history().len() < 20,
        "history should have been trimmed to respect the token budget"
    );
}

#[test]
fn test_set_system_prompt_updates_token_count() {
    let mock_client = Arc::new(MockClient::new("Response".to_string()));
    let mut session = LLMSession::new(mock_client, "short".to_string(), 1000);

    let before = session.estimated_history_tokens();
    session.set_system_prompt("a considerably longer system prompt than before".to_string());
    let after = session.estimated_history_tokens();

    assert_ne!(before, after);
}

#[test]
fn test_replace_history_recomputes_token_count() {
    let mock_client = Arc::new(MockClient::new("Response".to_string()));
    let mut session = LLMSession::new(mock_client, "sys".to_string(), 1000);

    session.replace_history(vec![
        ConversationItem::user("hello"),
        ConversationItem::assistant("hi there"),
    ]);

    assert_eq!(session.history().len(), 2);
    assert!(session.estimated_history_tokens() > 0);
}

#[tokio::test]
async fn test_request_buffer_grows_with_conversation() {
    // Each send_message call should hand the client the full running history: system prompt
    // plus every turn sent and received so far.
    let client = Arc::new(MockClient::new("Response".to_string()));
    let mut session = LLMSession::new(
        client.clone() as Arc<dyn ClientWrapper>,
        "System prompt".to_string(),
        10_000,
    );

    let _ = session.send_message(Role::User, "First".to_string()).await;
    let count1 = client.get_last_message_count().await;
    assert_eq!(count1, 2); // system + first user message

    let _ = session.send_message(Role::User, "Second".to_string()).await;
    let count2 = client.get_last_message_count().await;
    assert_eq!(count2, 4); // system + first user + first assistant + second user

    let _ = session.send_message(Role::User, "Third".to_string()).await;
    let count3 = client.get_last_message_count().await;
    assert_eq!(count3, 6);
}

//! LLM completion client
//!
//! Groq's OpenAI-compatible chat-completions API behind the [`LlmClient`]
//! trait. Uses a long-lived reqwest::Client for connection pooling.

use crate::config::{LlmConfig, Secret};
use crate::error::AssistantError;
use crate::memory::TurnRole;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// A fully assembled prompt: system instructions, prior turns, new question
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    /// Prior turns, oldest first
    pub history: Vec<(TurnRole, String)>,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            history: Vec::new(),
            user: user.into(),
        }
    }

    pub fn with_history(mut self, history: Vec<(TurnRole, String)>) -> Self {
        self.history = history;
        self
    }

    fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::new("system", &self.system));
        for (role, text) in &self.history {
            messages.push(ChatMessage::new(role.as_str(), text));
        }
        messages.push(ChatMessage::new("user", &self.user));
        messages
    }
}

/// Completion provider seam used by the Query Handler
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> crate::Result<String>;

    /// Cheap reachability check for status reporting
    async fn ping(&self) -> crate::Result<()>;
}

/// Reusable Groq client (connection-pooled)
pub struct GroqClient {
    client: Client,
    api_key: Secret,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl GroqClient {
    pub fn new(config: &LlmConfig, api_key: Secret) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_for(&self, prompt: &Prompt) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: prompt.to_messages(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: 1.0,
            stream: false,
        }
    }
}

#[async_trait]
impl LlmClient for GroqClient {
    fn provider(&self) -> &str {
        "groq"
    }

    async fn complete(&self, prompt: &Prompt) -> crate::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self.request_for(prompt);

        info!(model = %self.model, messages = request.messages.len(), "Calling Groq API");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                error!("Groq API request failed: {}", e);
                if e.is_timeout() {
                    AssistantError::UpstreamError("Groq API request timed out".to_string())
                } else {
                    AssistantError::UpstreamError(format!("Groq API error: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Groq API error response: {}", truncate(&error_text, 300));
            return Err(AssistantError::UpstreamError(format!(
                "Groq API returned {}: {}",
                status,
                truncate(&error_text, 300)
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Groq response: {}", e);
            AssistantError::UpstreamError(format!("Groq parse error: {}", e.without_url()))
        })?;

        if let Some(usage) = &chat_response.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Groq token usage"
            );
        }

        let answer = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| AssistantError::UpstreamError("Empty response from Groq API".to_string()))?;

        info!("Groq response received ({} chars)", answer.len());

        Ok(answer)
    }

    async fn ping(&self) -> crate::Result<()> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_key.expose())
            .send()
            .await
            .map_err(|e| AssistantError::UpstreamError(format!("Groq API unreachable: {}", e.without_url())))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AssistantError::UpstreamError(format!(
                "Groq API returned {}",
                response.status()
            )))
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

//
// ================= Mock client =================
//

enum MockBehavior {
    Reply(String),
    Fail(String),
    Delay(Duration, String),
}

/// Mock client for development & testing. Records every prompt it receives.
pub struct MockLlmClient {
    behavior: MockBehavior,
    prompts: Mutex<Vec<Prompt>>,
}

impl MockLlmClient {
    pub fn replying(answer: impl Into<String>) -> Self {
        Self::with_behavior(MockBehavior::Reply(answer.into()))
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_behavior(MockBehavior::Fail(reason.into()))
    }

    /// Sleeps before answering; pairs with a short handler timeout
    pub fn delayed(delay: Duration, answer: impl Into<String>) -> Self {
        Self::with_behavior(MockBehavior::Delay(delay, answer.into()))
    }

    fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub async fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        "mock"
    }

    async fn complete(&self, prompt: &Prompt) -> crate::Result<String> {
        self.prompts.lock().await.push(prompt.clone());

        match &self.behavior {
            MockBehavior::Reply(answer) => Ok(answer.clone()),
            MockBehavior::Fail(reason) => Err(AssistantError::UpstreamError(reason.clone())),
            MockBehavior::Delay(delay, answer) => {
                tokio::time::sleep(*delay).await;
                Ok(answer.clone())
            }
        }
    }

    async fn ping(&self) -> crate::Result<()> {
        match &self.behavior {
            MockBehavior::Fail(reason) => Err(AssistantError::UpstreamError(reason.clone())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            base_url: "https://api.groq.com/openai/v1/".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            timeout: Duration::from_secs(5),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }

    #[test]
    fn test_request_serialization() {
        let client = GroqClient::new(&config(), Secret::new("gsk_test")).unwrap();
        let prompt = Prompt::new("You are a sales assistant", "What's pending for Acme Corp?")
            .with_history(vec![
                (TurnRole::User, "Hi".to_string()),
                (TurnRole::Assistant, "Hello!".to_string()),
            ]);

        let json = serde_json::to_value(client.request_for(&prompt)).unwrap();

        assert_eq!(json["model"], "llama-3.1-8b-instant");
        assert_eq!(json["stream"], false);
        let roles: Vec<&str> = json["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(json["messages"][3]["content"], "What's pending for Acme Corp?");
        assert!(!json.to_string().contains("gsk_test"));
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Acme Corp is pending."}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 8, "total_tokens": 128}
        }"#;

        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Acme Corp is pending."));
        assert_eq!(parsed.usage.unwrap().completion_tokens, 8);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = GroqClient::new(&config(), Secret::new("gsk_test")).unwrap();
        assert_eq!(client.base_url, "https://api.groq.com/openai/v1");
        assert_eq!(client.provider(), "groq");
    }

    #[tokio::test]
    async fn test_mock_records_prompts() {
        let mock = MockLlmClient::replying("ok");
        let answer = mock.complete(&Prompt::new("system", "question")).await.unwrap();

        assert_eq!(answer, "ok");
        assert_eq!(mock.prompts().await[0].user, "question");
    }

    #[tokio::test]
    async fn test_mock_failure_is_upstream() {
        let mock = MockLlmClient::failing("boom");
        let err = mock.complete(&Prompt::new("s", "q")).await.unwrap_err();
        assert!(err.is_upstream());
        assert!(mock.ping().await.is_err());
    }
}

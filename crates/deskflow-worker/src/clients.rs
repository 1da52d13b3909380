//! HTTP collaborators for the engine's handler contracts
//!
//! Each client wraps one external service behind the matching engine trait.
//! The engine never sees these types; they are injected at wiring time.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use deskflow_durable::engine::{ContextRetriever, DataSource, EmailMessage, LlmClient, Mailer};

/// Ticket source backed by the platform's ticket API
pub struct HttpTicketSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTicketSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DataSource for HttpTicketSource {
    async fn fetch(&self, input: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let id = input
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("ticket input missing id"))?;

        let response = self
            .client
            .get(format!("{}/{}", self.base_url, id))
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

/// Chat-completions LLM client
pub struct OpenAiChatClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete(&self, input: &serde_json::Value) -> anyhow::Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "Draft a concise, courteous customer support reply.",
                },
                {
                    "role": "user",
                    "content": input.to_string(),
                },
            ],
        });

        let response: ChatResponse = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("empty completion response"))
    }
}

/// RAG retriever calling the platform's training/query endpoint
pub struct HttpContextRetriever {
    client: reqwest::Client,
    api_url: String,
}

impl HttpContextRetriever {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl ContextRetriever for HttpContextRetriever {
    async fn retrieve(&self, query: &str) -> anyhow::Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.api_url)
            .json(&json!({ "query": query }))
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

/// Mailer posting to an HTTP mail relay
///
/// The idempotency key travels as an `Idempotency-Key` header so the relay
/// can deduplicate outbox replays.
pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HttpMailer {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(
        &self,
        message: &EmailMessage,
        idempotency_key: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut request = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(message);

        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        request.send().await?.error_for_status()?;
        Ok(())
    }
}

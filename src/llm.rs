//! Completion service client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::CompletionError;

/// A text-completion endpoint: prompt in, generated text out
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send one prompt and return the generated text
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    content: Option<String>,
}

/// Client for the DeepSeek chat-completions API (OpenAI-compatible)
#[derive(Debug, Clone)]
pub struct DeepSeekClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl DeepSeekClient {
    /// Create a client. `timeout` bounds each HTTP exchange.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Transient(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Client for `config` with an already resolved credential
    pub fn from_config(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self, CompletionError> {
        Self::new(
            config.base_url.clone(),
            config.model.clone(),
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

/// Map a non-success HTTP status onto the retry classification
fn classify_status(status: StatusCode, body: &str) -> CompletionError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    match status.as_u16() {
        401 | 403 => CompletionError::Auth(detail),
        402 => CompletionError::Quota(detail),
        408 | 429 => CompletionError::Transient(detail),
        code if code >= 500 => CompletionError::Transient(detail),
        _ => CompletionError::InvalidResponse(detail),
    }
}

fn classify_transport(error: &reqwest::Error) -> CompletionError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        CompletionError::Transient(error.to_string())
    } else {
        CompletionError::InvalidResponse(error.to_string())
    }
}

#[async_trait]
impl CompletionClient for DeepSeekClient {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::InvalidResponse("response has no choices".into()))?;

        debug!(model = %self.model, chars = content.len(), "Completion received");
        Ok(content)
    }
}

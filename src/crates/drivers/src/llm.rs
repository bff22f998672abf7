//! Chat-model driver.
//!
//! [`ChatModel`] is the capability the graph nodes program against:
//! plain text completion plus schema-guided structured output. The
//! bundled implementation speaks the OpenAI-compatible chat-completions
//! wire format, which the hosted providers and most local gateways
//! accept. Retries and temperature live here, not in the nodes.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::retry::RetryPolicy;

/// Configuration for a chat-model client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Base URL of the chat-completions endpoint.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Bounded retry policy for transient failures and unparseable
    /// structured output.
    pub retry: RetryPolicy,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl LlmConfig {
    /// Config with provider defaults for the given model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
            temperature: 0.2,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Override the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Override the endpoint base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Language-model capability consumed by graph nodes.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete a prompt to plain text.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Complete a prompt to a JSON value conforming to `schema`.
    ///
    /// Implementations retry unparseable output within their bounded
    /// retry budget and surface [`DriverError::InvalidResponse`] once
    /// it is exhausted.
    async fn complete_structured(&self, prompt: &str, schema: &Value) -> Result<Value>;
}

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct OpenAiClient {
    config: LlmConfig,
    client: Client,
}

impl OpenAiClient {
    /// Build a client from config.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DriverError::Config(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn chat(&self, messages: Vec<ChatMessage>, json_mode: bool) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            response_format: json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::from_status(status, body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| DriverError::InvalidResponse(format!("completion body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| DriverError::InvalidResponse("no choices returned".to_string()))
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let retry = self.config.retry.clone();
        retry
            .run("llm.complete", || {
                self.chat(vec![ChatMessage::user(prompt)], false)
            })
            .await
    }

    async fn complete_structured(&self, prompt: &str, schema: &Value) -> Result<Value> {
        let system = format!(
            "Respond with a single JSON object conforming to this schema, \
             with no surrounding prose:\n{schema}"
        );

        // Unparseable output counts against the same bounded budget as
        // transport failures; after the budget it is a permanent error.
        let attempts = self.config.retry.max_attempts.max(1);
        let mut last_err = DriverError::InvalidResponse("structured output unparseable".to_string());

        for attempt in 0..attempts {
            match self
                .chat(vec![ChatMessage::system(&system), ChatMessage::user(prompt)], true)
                .await
            {
                Ok(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        tracing::warn!(attempt, error = %err, "structured output did not parse");
                        last_err =
                            DriverError::InvalidResponse(format!("structured output: {err}"));
                    }
                },
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "structured completion failed");
                    last_err = err;
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.retry.delay(attempt)).await;
            }
        }

        Err(last_err)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

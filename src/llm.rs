//! Language model oracle
//!
//! The pipeline only needs two operations from a language model: a plain
//! chat completion and a completion validated against an explicit output
//! schema. `OpenAiClient` implements both against any OpenAI-compatible
//! chat-completions endpoint.

use crate::config::LlmConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message in OpenAI chat format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Contract a structured completion must satisfy.
///
/// Sent to the model as a function definition; the returned arguments are
/// validated by the caller against the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &OutputSchema,
    ) -> Result<serde_json::Value>;
}

/// Retry policy for transient oracle failures (exponential backoff).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self { max_retries, ..Self::default() }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64)
            * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            retry: RetryPolicy::with_max_retries(config.max_retries),
        })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        })
    }

    async fn post_chat(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt = 0;
        loop {
            let sent = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            let reason = match sent {
                Ok(response) if response.status().is_success() => {
                    return response.json().await.map_err(|e| {
                        PipelineError::Llm(format!("Failed to parse LLM response: {}", e))
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    if !RetryPolicy::is_retryable_status(status) || attempt >= self.retry.max_retries {
                        return Err(PipelineError::Llm(format!(
                            "LLM API error ({}): {}",
                            status, error_text
                        )));
                    }
                    format!("status {}", status)
                }
                Err(e) => {
                    if !(e.is_timeout() || e.is_connect()) || attempt >= self.retry.max_retries {
                        return Err(PipelineError::Llm(format!("LLM API call failed: {}", e)));
                    }
                    e.to_string()
                }
            };

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                "LLM call failed ({}), retrying in {:?} (attempt {}/{})",
                reason,
                delay,
                attempt + 1,
                self.retry.max_retries
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn first_message(response: &serde_json::Value) -> Result<&serde_json::Value> {
    if let Some(error) = response.get("error") {
        return Err(PipelineError::Llm(format!("LLM API error: {}", error)));
    }
    response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .map(|choice| &choice["message"])
        .ok_or_else(|| PipelineError::Llm("No choices in LLM response".to_string()))
}

/// Parse a JSON payload the model may have wrapped in a markdown fence.
fn parse_json_payload(raw: &str) -> Result<serde_json::Value> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(cleaned).map_err(|e| {
        PipelineError::MalformedModelOutput(format!("{}. Response: {}", e, cleaned))
    })
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        debug!("Calling {} with {} messages", self.model, messages.len());
        let response = self.post_chat(&self.request_body(messages)).await?;
        let content = first_message(&response)?
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| PipelineError::Llm("No content in LLM response".to_string()))?;
        Ok(content.to_string())
    }

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &OutputSchema,
    ) -> Result<serde_json::Value> {
        let mut body = self.request_body(messages);
        body["functions"] = serde_json::json!([schema]);
        body["function_call"] = serde_json::json!({ "name": schema.name });

        let response = self.post_chat(&body).await?;
        let message = first_message(&response)?;

        if let Some(arguments) = message
            .get("function_call")
            .and_then(|call| call.get("arguments"))
            .and_then(|a| a.as_str())
        {
            return parse_json_payload(arguments);
        }

        // Some compatible servers ignore forced function calls and answer in content.
        match message.get("content").and_then(|c| c.as_str()) {
            Some(content) => parse_json_payload(content),
            None => Err(PipelineError::MalformedModelOutput(format!(
                "model did not call '{}'",
                schema.name
            ))),
        }
    }
}

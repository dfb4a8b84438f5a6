//! Text-generation service client.
//!
//! The [`Generator`] trait is the boundary to the language model:
//! `complete(prompt, max_tokens) -> (text, actual_token_cost)`. The shipped
//! [`OpenAICompatGenerator`] speaks the OpenAI chat-completions protocol, which
//! Groq, OpenAI, Ollama, and most hosted gateways accept.
//!
//! Error classification:
//! - HTTP 429, 5xx, timeouts, and connection failures → [`DocChatError::ServiceUnavailable`]
//! - any other non-success status, or a response without a reply → [`DocChatError::InvalidRequest`]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use docchat_core::prompt::{estimate_tokens, Prompt};
use docchat_core::DocChatError;
use serde::Serialize;
use tracing::debug;

use crate::config::GenerationConfig;

/// Generated reply and what it cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub text: String,
    /// Tokens billed by the service (prompt + completion).
    pub tokens: i64,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &Prompt, max_tokens: i64) -> docchat_core::Result<Completion>;
}

/// Used when `[generation].provider = "disabled"`.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    async fn complete(&self, _prompt: &Prompt, _max_tokens: i64) -> docchat_core::Result<Completion> {
        Err(DocChatError::InvalidRequest(
            "generation provider is disabled".to_string(),
        ))
    }
}

pub struct OpenAICompatGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

impl OpenAICompatGenerator {
    /// The API key is read from the environment variable named by
    /// `api_key_env`; a missing key is allowed for local gateways.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: std::env::var(&config.api_key_env).ok(),
        })
    }
}

#[async_trait]
impl Generator for OpenAICompatGenerator {
    async fn complete(&self, prompt: &Prompt, max_tokens: i64) -> docchat_core::Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": prompt.messages,
            "max_tokens": max_tokens,
            "temperature": self.temperature,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            DocChatError::ServiceUnavailable(format!("generation request failed: {}", e))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = format!("generation API error {}: {}", status, body_text);
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(DocChatError::ServiceUnavailable(message));
            }
            return Err(DocChatError::InvalidRequest(message));
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            DocChatError::ServiceUnavailable(format!("generation response unreadable: {}", e))
        })?;
        let completion = parse_completion(&json, prompt)?;
        debug!(tokens = completion.tokens, "generation complete");
        Ok(completion)
    }
}

/// Read `choices[0].message.content` and `usage.total_tokens`. Without a
/// usage block the cost is estimated from the prompt and reply lengths.
fn parse_completion(json: &serde_json::Value, prompt: &Prompt) -> docchat_core::Result<Completion> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            DocChatError::InvalidRequest(
                "Invalid generation response: missing choices[0].message.content".to_string(),
            )
        })?
        .to_string();

    let tokens = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_i64())
        .unwrap_or_else(|| prompt.estimated_tokens + estimate_tokens(&text));

    Ok(Completion { text, tokens })
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAICompatGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docchat_core::prompt::{PromptMessage, PromptRole};

    fn prompt() -> Prompt {
        Prompt {
            messages: vec![PromptMessage {
                role: PromptRole::User,
                content: "hello there".to_string(),
            }],
            context_chunk_ids: Vec::new(),
            estimated_tokens: 3,
        }
    }

    #[test]
    fn test_parse_completion_with_usage() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Hi!" } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12 }
        });
        let c = parse_completion(&json, &prompt()).unwrap();
        assert_eq!(c.text, "Hi!");
        assert_eq!(c.tokens, 12);
    }

    #[test]
    fn test_parse_completion_estimates_without_usage() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "abcdefgh" } }]
        });
        let c = parse_completion(&json, &prompt()).unwrap();
        assert_eq!(c.tokens, 3 + 2);
    }

    #[test]
    fn test_parse_completion_rejects_missing_content() {
        let json = serde_json::json!({ "choices": [] });
        assert!(matches!(
            parse_completion(&json, &prompt()),
            Err(DocChatError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_prompt_messages_serialize_as_chat_format() {
        let value = serde_json::to_value(&prompt().messages).unwrap();
        assert_eq!(value[0]["role"], "user");
        assert_eq!(value[0]["content"], "hello there");
    }
}

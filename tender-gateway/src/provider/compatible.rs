//! OpenAI-compatible chat completions client.
//!
//! Groq, and most hosted LLM APIs, follow the same `/v1/chat/completions`
//! format, so a single implementation covers them.

use super::{ChatRequest, ChatResponse, Provider, ProviderError, ProviderErrorKind, TokenUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tender_common::util::sanitize_for_log;
use tender_common::ProviderConfig;

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct CompatibleProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CompatibleRequest<'a> {
    model: &'a str,
    messages: &'a [super::Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CompatibleResponse {
    choices: Vec<CompatibleChoice>,
    #[serde(default)]
    usage: Option<CompatibleUsage>,
}

#[derive(Debug, Deserialize)]
struct CompatibleChoice {
    message: CompatibleResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompatibleResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompatibleUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
}

impl CompatibleProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(name: &str, base_url: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()).map(ToString::to_string),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Create Groq provider.
    pub fn groq(api_key: Option<&str>) -> Self {
        let key = api_key
            .map(String::from)
            .or_else(|| std::env::var("GROQ_API_KEY").ok());
        Self::new(
            "groq",
            "https://api.groq.com/openai",
            key.as_deref(),
            Duration::from_secs(120),
        )
    }

    /// Create a provider from the `provider` config section.
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            &config.name,
            &config.base_url,
            config.api_key.as_deref(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn error(&self, model: &str, kind: ProviderErrorKind, message: String) -> ProviderError {
        ProviderError::new(self.name.clone(), model, kind, message)
    }
}

#[async_trait]
impl Provider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();

        let api_key = self.api_key.as_ref().ok_or_else(|| {
            self.error(
                &request.model,
                ProviderErrorKind::Api,
                format!("{} API key not set. Set the appropriate env var.", self.name),
            )
        })?;

        let body = CompatibleRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.error(
                    &request.model,
                    ProviderErrorKind::Transport,
                    format!("Request failed: {}", e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                self.name.clone(),
                request.model,
                status.as_u16(),
                &sanitize_for_log(&error_text),
            ));
        }

        let result: CompatibleResponse = response.json().await.map_err(|e| {
            self.error(
                &request.model,
                ProviderErrorKind::InvalidResponse,
                format!("Failed to parse response: {}", e),
            )
        })?;

        let choice = result.choices.into_iter().next().ok_or_else(|| {
            self.error(
                &request.model,
                ProviderErrorKind::InvalidResponse,
                format!("No response from {}", self.name),
            )
        })?;

        let usage = result.usage.map_or(TokenUsage::default(), |u| TokenUsage {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens.unwrap_or(0),
        });

        tracing::debug!(
            provider = %self.name,
            model = %request.model,
            tokens = usage.total_tokens,
            latency_ms = start.elapsed().as_millis() as u64,
            "Chat completion received"
        );

        Ok(ChatResponse {
            provider: self.name.clone(),
            model: request.model,
            content: choice.message.content.unwrap_or_default(),
            usage,
            finish_reason: choice.finish_reason,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

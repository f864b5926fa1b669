//! Chat-completion client shared by the router, paraphraser, generator and judge

use crate::circuit_breaker::CircuitBreaker;
use crate::error::ProviderError;
use crate::retry::{call_guarded, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const LLM_SERVICE: &str = "llm";

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 512,
            temperature: 0.0,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<String, ProviderError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` endpoint
pub struct HttpLlmProvider {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpLlmProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn complete(&self, request: &LlmRequest) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(LLM_SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.is_client_error() {
                return Err(ProviderError::Rejected {
                    service: LLM_SERVICE.to_string(),
                    status: status.as_u16(),
                    message: text,
                });
            }
            return Err(ProviderError::transient(LLM_SERVICE, format!("status {}: {}", status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::invalid(LLM_SERVICE, e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::invalid(LLM_SERVICE, "response carried no content"))
    }
}

/// LLM provider behind its own circuit breaker and retry policy
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            breaker,
            policy,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn complete(&self, request: &LlmRequest) -> Result<String, ProviderError> {
        self.call(request, None, |text| Ok(text.to_string())).await
    }

    /// Complete within an overall budget; attempts are clamped to fit it
    pub async fn complete_within(&self, request: &LlmRequest, budget: Duration) -> Result<String, ProviderError> {
        self.complete_parsed(request, budget, |text| Ok(text.to_string())).await
    }

    /// Complete within a budget and parse the reply under the breaker, so an
    /// unparsable reply counts as a failed call
    pub async fn complete_parsed<T, F>(&self, request: &LlmRequest, budget: Duration, parse: F) -> Result<T, ProviderError>
    where
        F: Fn(&str) -> Result<T, ProviderError>,
    {
        self.call(request, Some(Instant::now() + budget), parse).await
    }

    async fn call<T, F>(&self, request: &LlmRequest, deadline: Option<Instant>, parse: F) -> Result<T, ProviderError>
    where
        F: Fn(&str) -> Result<T, ProviderError>,
    {
        let service = self.breaker.service().to_string();
        let parse = &parse;
        call_guarded(&self.breaker, &self.policy, deadline, move || {
            let service = service.clone();
            async move {
                let text = self.provider.complete(request).await?;
                if text.trim().is_empty() {
                    return Err(ProviderError::invalid(&service, "empty completion"));
                }
                parse(&text)
            }
        })
        .await
    }
}

/// Slice out the outermost JSON object of a model reply (tolerates code fences and prose)
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

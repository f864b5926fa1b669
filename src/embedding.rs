//! Resilient embedding client

use crate::circuit_breaker::CircuitBreaker;
use crate::error::ProviderError;
use crate::retry::{call_guarded, RetryPolicy};
use crate::text::{detect_language, is_stopword, normalize_for, stem, tokenize};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

pub const EMBEDDING_SERVICE: &str = "embedding";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedPurpose {
    Query,
    Document,
}

impl EmbedPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedPurpose::Query => "query",
            EmbedPurpose::Document => "document",
        }
    }
}

/// Raw transport to an embedding API. No retries, no validation.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    purpose: EmbedPurpose,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` endpoint
pub struct HttpEmbeddingProvider {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpEmbeddingProvider {
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
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
            purpose,
        });
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(EMBEDDING_SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() {
                return Err(ProviderError::Rejected {
                    service: EMBEDDING_SERVICE.to_string(),
                    status: status.as_u16(),
                    message: body,
                });
            }
            return Err(ProviderError::transient(
                EMBEDDING_SERVICE,
                format!("status {}: {}", status, body),
            ));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::invalid(EMBEDDING_SERVICE, e.to_string()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::invalid(EMBEDDING_SERVICE, "response carried no embedding"))
    }
}

/// Offline feature-hashing embedder over stemmed tokens and bigrams.
///
/// Used by the demo server and tests; similar wording gives similar vectors,
/// nothing more.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }
        let language = detect_language(text);
        let normalized = normalize_for(text, language);
        let terms: Vec<String> = tokenize(&normalized)
            .into_iter()
            .filter(|t| !is_stopword(t, language))
            .map(|t| stem(t, language))
            .collect();
        for term in &terms {
            accumulate(&mut vector, term, 1.0);
        }
        for pair in terms.windows(2) {
            accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

fn accumulate(vector: &mut [f32], term: &str, weight: f32) {
    let digest = blake3::hash(term.as_bytes());
    for pair in digest.as_bytes().chunks_exact(4).take(4) {
        let bucket = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let sign = if bucket & 1 == 0 { weight } else { -weight };
        vector[(bucket >> 1) as usize % vector.len()] += sign;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str, _purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_text(text))
    }
}

/// Embedding provider guarded by a circuit breaker, retries and shape validation
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
        dimension: usize,
    ) -> Self {
        Self {
            provider,
            breaker,
            policy,
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        self.embed_until(text, purpose, None).await
    }

    /// Embed with retries that never run past `deadline`
    pub async fn embed_until(
        &self,
        text: &str,
        purpose: EmbedPurpose,
        deadline: Option<Instant>,
    ) -> Result<Vec<f32>, ProviderError> {
        let vector = call_guarded(&self.breaker, &self.policy, deadline, || async move {
            let vector = self.provider.embed(text, purpose).await?;
            validate_vector(vector, self.dimension)
        })
        .await?;
        debug!("Embedded {} chars for {}", text.len(), purpose.as_str());
        Ok(vector)
    }
}

/// Reject vectors of the wrong dimensionality or with non-finite components
pub fn validate_vector(vector: Vec<f32>, dimension: usize) -> Result<Vec<f32>, ProviderError> {
    if vector.len() != dimension {
        return Err(ProviderError::invalid(
            EMBEDDING_SERVICE,
            format!("expected {} dimensions, got {}", dimension, vector.len()),
        ));
    }
    if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
        return Err(ProviderError::invalid(
            EMBEDDING_SERVICE,
            format!("non-finite component at index {}", pos),
        ));
    }
    Ok(vector)
}

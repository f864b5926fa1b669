//! Embedding-based retrieval with optional LLM query paraphrases

use crate::cache::{embedding_key, ResultCache};
use crate::config::ModelVersions;
use crate::embedding::{EmbedPurpose, EmbeddingClient};
use crate::error::{ProviderError, StrategyError};
use crate::llm::{LlmClient, LlmRequest};
use crate::store::CorpusStore;
use crate::strategies::{RetrievalStrategy, StrategyOutput};
use crate::types::*;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const PARAPHRASE_SYSTEM: &str = "You rewrite search queries over a personal library. \
Reply with alternative phrasings only, one per line, in the language of the query, \
without numbering or commentary.";

/// Paraphrase settings; the LLM is optional
pub struct Paraphraser {
    pub llm: Arc<LlmClient>,
    pub count: usize,
    pub timeout: Duration,
}

pub struct SemanticMatch {
    store: Arc<dyn CorpusStore>,
    embeddings: Arc<EmbeddingClient>,
    cache: Arc<ResultCache>,
    models: ModelVersions,
    embedding_ttl: Duration,
    embedding_budget: Option<Duration>,
    paraphraser: Option<Paraphraser>,
}

impl SemanticMatch {
    pub fn new(
        store: Arc<dyn CorpusStore>,
        embeddings: Arc<EmbeddingClient>,
        cache: Arc<ResultCache>,
        models: ModelVersions,
        embedding_ttl: Duration,
    ) -> Self {
        Self {
            store,
            embeddings,
            cache,
            models,
            embedding_ttl,
            embedding_budget: None,
            paraphraser: None,
        }
    }

    /// Bound all embedding calls of one search, retries included
    pub fn with_embedding_budget(mut self, budget: Duration) -> Self {
        self.embedding_budget = Some(budget);
        self
    }

    pub fn with_paraphraser(mut self, paraphraser: Paraphraser) -> Self {
        self.paraphraser = Some(paraphraser);
        self
    }

    async fn embed_cached(&self, text: &str, deadline: Option<Instant>) -> Result<Vec<f32>, ProviderError> {
        let key = embedding_key(text, EmbedPurpose::Query.as_str(), &self.models).render();
        if let Some(vector) = self.cache.get_json::<Vec<f32>>(&key).await {
            if vector.len() == self.embeddings.dimension() {
                return Ok(vector);
            }
        }
        let vector = self
            .embeddings
            .embed_until(text, EmbedPurpose::Query, deadline)
            .await?;
        self.cache.set_json(&key, &vector, self.embedding_ttl).await;
        Ok(vector)
    }

    /// Up to `count` rephrasings of the query; errors carry the skip reason
    async fn paraphrases(&self, raw: &str) -> Result<Vec<String>, String> {
        let Some(paraphraser) = &self.paraphraser else {
            return Ok(Vec::new());
        };
        if paraphraser.count == 0 {
            return Ok(Vec::new());
        }

        let request = LlmRequest::new(
            PARAPHRASE_SYSTEM,
            format!("Give {} alternative phrasings of:\n{}", paraphraser.count, raw),
        )
        .max_tokens(200)
        .temperature(0.7);

        let reply = paraphraser
            .llm
            .complete_within(&request, paraphraser.timeout)
            .await
            .map_err(|e| e.to_string())?;
        Ok(parse_paraphrases(&reply, raw, paraphraser.count))
    }
}

/// One phrasing per line; list markers stripped, the original and duplicates dropped
pub fn parse_paraphrases(reply: &str, original: &str, count: usize) -> Vec<String> {
    let original = original.trim().to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for line in reply.lines() {
        let cleaned = line
            .trim()
            .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*' | '•'))
            .trim()
            .trim_matches('"')
            .trim();
        if cleaned.is_empty() || cleaned.to_lowercase() == original {
            continue;
        }
        if out.iter().any(|p| p.eq_ignore_ascii_case(cleaned)) {
            continue;
        }
        out.push(cleaned.to_string());
        if out.len() == count {
            break;
        }
    }
    out
}

#[async_trait]
impl RetrievalStrategy for SemanticMatch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    async fn search(&self, query: &Query, filters: &Scope, limit: usize) -> Result<StrategyOutput, StrategyError> {
        let text = query.raw.trim();
        if text.is_empty() {
            return Ok(StrategyOutput::hits(vec![]));
        }

        let deadline = self.embedding_budget.map(|budget| Instant::now() + budget);
        let (original, variants) = tokio::join!(self.embed_cached(text, deadline), self.paraphrases(text));

        let original = match original {
            Ok(vector) => vector,
            Err(e @ ProviderError::CircuitOpen { .. }) => {
                warn!("SemanticMatch skipped: {}", e);
                return Ok(StrategyOutput::unavailable(Degradation::StrategyUnavailable {
                    strategy: StrategyKind::Semantic,
                    reason: e.to_string(),
                }));
            }
            Err(e) => return Err(e.into()),
        };

        let mut degradations = Vec::new();
        let variants = match variants {
            Ok(variants) => variants,
            Err(reason) => {
                debug!("Paraphrasing skipped: {}", reason);
                degradations.push(Degradation::ParaphraseSkipped { reason });
                Vec::new()
            }
        };

        // Paraphrase embeddings are best effort; the original query already succeeded
        let mut vectors = vec![original];
        for (variant, result) in variants
            .iter()
            .zip(join_all(variants.iter().map(|v| self.embed_cached(v, deadline))).await)
        {
            match result {
                Ok(vector) => vectors.push(vector),
                Err(e) => debug!("Dropping paraphrase '{}': {}", variant, e),
            }
        }

        let searches = join_all(
            vectors
                .iter()
                .map(|v| self.store.vector_search(v, filters, limit)),
        )
        .await;

        let mut best: HashMap<String, StrategyHit> = HashMap::new();
        for (i, result) in searches.into_iter().enumerate() {
            let hits = match result {
                Ok(hits) => hits,
                Err(e) if i == 0 => return Err(e.into()),
                Err(e) => {
                    debug!("Vector search for paraphrase {} failed: {}", i, e);
                    continue;
                }
            };
            for hit in hits {
                match best.get_mut(&hit.chunk.id) {
                    Some(existing) if existing.score >= hit.similarity => {}
                    Some(existing) => existing.score = hit.similarity,
                    None => {
                        best.insert(
                            hit.chunk.id.clone(),
                            StrategyHit {
                                chunk: hit.chunk,
                                score: hit.similarity,
                            },
                        );
                    }
                }
            }
        }

        let mut hits: Vec<StrategyHit> = best.into_values().collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        debug!(
            "SemanticMatch: {} hits from {} query variant(s)",
            hits.len(),
            vectors.len()
        );
        Ok(StrategyOutput {
            hits,
            degradations,
            available: true,
        })
    }
}

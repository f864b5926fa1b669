//! Retrieval strategies for multi-strategy search

use crate::error::StrategyError;
use crate::store::CorpusStore;
use crate::text::{lemma_set, lemma_variants, normalize, tokenize};
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// What one strategy produced for one query
#[derive(Debug, Clone)]
pub struct StrategyOutput {
    pub hits: Vec<StrategyHit>,
    /// Non-fatal notes raised while producing the hits
    pub degradations: Vec<Degradation>,
    /// False when the strategy could not run at all (e.g. its provider's circuit is open)
    pub available: bool,
}

impl StrategyOutput {
    pub fn hits(hits: Vec<StrategyHit>) -> Self {
        Self {
            hits,
            degradations: Vec::new(),
            available: true,
        }
    }

    pub fn unavailable(degradation: Degradation) -> Self {
        Self {
            hits: Vec::new(),
            degradations: vec![degradation],
            available: false,
        }
    }
}

/// Pluggable, independent evidence producer
#[async_trait]
pub trait RetrievalStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Hits sorted by score descending, chunk id ascending on ties, at most `limit`
    async fn search(&self, query: &Query, filters: &Scope, limit: usize) -> Result<StrategyOutput, StrategyError>;
}

/// Literal phrase or token containment scored by match count and position
pub struct ExactMatch {
    store: Arc<dyn CorpusStore>,
}

impl ExactMatch {
    pub fn new(store: Arc<dyn CorpusStore>) -> Self {
        Self { store }
    }
}

/// Score one chunk body for a normalized phrase.
///
/// Whole-phrase occurrences score 1.0 each plus a bonus that decays with the
/// position of the first occurrence. Chunks that only contain some of the
/// tokens score at most 0.5.
pub fn exact_score(phrase: &str, body: &str) -> f32 {
    if phrase.is_empty() {
        return 0.0;
    }
    let body_tokens = tokenize(body);
    let phrase_tokens = tokenize(phrase);

    let occurrences = count_phrase(&body_tokens, &phrase_tokens);
    if occurrences > 0 {
        let first = first_phrase_position(&body_tokens, &phrase_tokens).unwrap_or(0);
        let position_bonus = 1.0 / (1.0 + first as f32 / 10.0);
        return occurrences as f32 + position_bonus;
    }

    let matched = phrase_tokens
        .iter()
        .filter(|t| body_tokens.contains(t))
        .count();
    0.5 * matched as f32 / phrase_tokens.len() as f32
}

fn count_phrase(body: &[&str], phrase: &[&str]) -> usize {
    if phrase.is_empty() || body.len() < phrase.len() {
        return 0;
    }
    body.windows(phrase.len()).filter(|w| *w == phrase).count()
}

fn first_phrase_position(body: &[&str], phrase: &[&str]) -> Option<usize> {
    if phrase.is_empty() || body.len() < phrase.len() {
        return None;
    }
    body.windows(phrase.len()).position(|w| w == phrase)
}

#[async_trait]
impl RetrievalStrategy for ExactMatch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Exact
    }

    async fn search(&self, query: &Query, filters: &Scope, limit: usize) -> Result<StrategyOutput, StrategyError> {
        if query.normalized.is_empty() {
            return Ok(StrategyOutput::hits(vec![]));
        }
        let chunks = self.store.search_exact(&query.normalized, filters, limit).await?;
        let mut hits: Vec<StrategyHit> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let score = exact_score(&query.normalized, &normalize(&chunk.text));
                (score > 0.0).then_some(StrategyHit { chunk, score })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        debug!("ExactMatch: {} hits for '{}'", hits.len(), query.normalized);
        Ok(StrategyOutput::hits(hits))
    }
}

/// Language-aware stem overlap
pub struct LemmaMatch {
    store: Arc<dyn CorpusStore>,
}

impl LemmaMatch {
    pub fn new(store: Arc<dyn CorpusStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RetrievalStrategy for LemmaMatch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lemma
    }

    async fn search(&self, query: &Query, filters: &Scope, limit: usize) -> Result<StrategyOutput, StrategyError> {
        let lemmas: Vec<String> = lemma_set(&query.normalized, query.language).into_iter().collect();
        if lemmas.is_empty() {
            return Ok(StrategyOutput::hits(vec![]));
        }

        let chunks = self.store.search_lemma(&lemmas, filters, limit).await?;
        let mut hits: Vec<StrategyHit> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let variants = lemma_variants(&chunk.text);
                let overlap = lemmas.iter().filter(|l| variants.contains(*l)).count();
                let score = overlap as f32 / lemmas.len() as f32;
                (overlap > 0).then_some(StrategyHit { chunk, score })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        debug!("LemmaMatch: {} hits over {} lemmas", hits.len(), lemmas.len());
        Ok(StrategyOutput::hits(hits))
    }
}

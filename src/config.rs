//! Engine configuration
//!
//! Every section has defaults; `from_env` overrides the common knobs from
//! `BOOKMIND_*` variables and `from_json_str` accepts partial documents.

use crate::types::AnswerMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub search: SearchConfig,
    pub graph: GraphConfig,
    pub router: RouterConfig,
    pub answer: AnswerConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub models: ModelVersions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Bound on a single embedding attempt, shorter than the strategy timeout
    pub attempt_timeout_ms: u64,
    /// Bound on a single LLM attempt; callers clamp it further to their budget
    pub llm_attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
            attempt_timeout_ms: 3_000,
            llm_attempt_timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub strategy_timeout_ms: u64,
    pub search_deadline_ms: u64,
    pub max_concurrency: usize,
    pub per_strategy_limit: usize,
    pub result_limit: usize,
    pub rrf_offset: f64,
    pub paraphrase_count: usize,
    pub paraphrase_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy_timeout_ms: 4_000,
            search_deadline_ms: 5_000,
            max_concurrency: 6,
            per_strategy_limit: 50,
            result_limit: 20,
            rrf_offset: 60.0,
            paraphrase_count: 2,
            paraphrase_timeout_ms: 10_000,
        }
    }
}

impl SearchConfig {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    pub fn search_deadline(&self) -> Duration {
        Duration::from_millis(self.search_deadline_ms)
    }

    pub fn paraphrase_timeout(&self) -> Duration {
        Duration::from_millis(self.paraphrase_timeout_ms)
    }

    /// Time SemanticMatch gives its embedding calls, leaving room for the vector search
    pub fn embedding_budget(&self) -> Duration {
        self.strategy_timeout().mul_f64(0.75)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub enabled: bool,
    /// How many fused items feed concept extraction
    pub top_candidates: usize,
    pub max_concepts: usize,
    pub max_edges_per_concept: usize,
    pub max_bridge_chars: usize,
    pub timeout_ms: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_candidates: 10,
            max_concepts: 20,
            max_edges_per_concept: 15,
            max_bridge_chars: 4_000,
            timeout_ms: 2_000,
        }
    }
}

impl GraphConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Rule confidence below which the LLM classifier is consulted
    pub llm_threshold: f32,
    pub llm_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            llm_threshold: 0.6,
            llm_timeout_ms: 3_000,
        }
    }
}

impl RouterConfig {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerConfig {
    pub max_attempts: usize,
    pub short_budget_ms: u64,
    pub long_form_budget_ms: u64,
    /// Router confidence at or above which short DIRECT answers skip the judge
    pub fast_track_confidence: f32,
    /// Chunks handed to the generator
    pub evidence_limit: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            short_budget_ms: 20_000,
            long_form_budget_ms: 45_000,
            fast_track_confidence: 0.7,
            evidence_limit: 12,
        }
    }
}

impl AnswerConfig {
    pub fn budget(&self, mode: AnswerMode) -> Duration {
        match mode {
            AnswerMode::Short => Duration::from_millis(self.short_budget_ms),
            AnswerMode::LongForm => Duration::from_millis(self.long_form_budget_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub local_capacity: u64,
    pub search_ttl_ms: u64,
    pub answer_ttl_ms: u64,
    pub embedding_ttl_ms: u64,
    pub classifier_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: 10_000,
            search_ttl_ms: 10 * 60 * 1000,
            answer_ttl_ms: 60 * 60 * 1000,
            embedding_ttl_ms: 24 * 60 * 60 * 1000,
            classifier_ttl_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn search_ttl(&self) -> Duration {
        Duration::from_millis(self.search_ttl_ms)
    }

    pub fn answer_ttl(&self) -> Duration {
        Duration::from_millis(self.answer_ttl_ms)
    }

    pub fn embedding_ttl(&self) -> Duration {
        Duration::from_millis(self.embedding_ttl_ms)
    }

    pub fn classifier_ttl(&self) -> Duration {
        Duration::from_millis(self.classifier_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_in_flight: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            acquire_timeout_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Version identifiers folded into every cache key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelVersions {
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub generation_model: String,
    pub judge_model: String,
    pub router_model: String,
    pub prompt_version: String,
}

impl Default for ModelVersions {
    fn default() -> Self {
        Self {
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimension: 1536,
            generation_model: "gpt-4o-mini".to_string(),
            judge_model: "gpt-4o-mini".to_string(),
            router_model: "gpt-4o-mini".to_string(),
            prompt_version: "v1".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Defaults overridden by `BOOKMIND_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring unparsable {}={}", key, raw);
                    None
                }
            }
        }

        if let Some(v) = parsed(&lookup, "BOOKMIND_BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_BREAKER_RECOVERY_MS") {
            self.breaker.recovery_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_ATTEMPT_TIMEOUT_MS") {
            self.retry.attempt_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_LLM_ATTEMPT_TIMEOUT_MS") {
            self.retry.llm_attempt_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_STRATEGY_TIMEOUT_MS") {
            self.search.strategy_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_SEARCH_DEADLINE_MS") {
            self.search.search_deadline_ms = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_MAX_ANSWER_ATTEMPTS") {
            self.answer.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_SEARCH_CACHE_TTL_MS") {
            self.cache.search_ttl_ms = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_ANSWER_CACHE_TTL_MS") {
            self.cache.answer_ttl_ms = v;
        }
        if let Some(v) = lookup("BOOKMIND_EMBEDDING_MODEL") {
            self.models.embedding_model = v;
        }
        if let Some(v) = parsed(&lookup, "BOOKMIND_EMBEDDING_DIMENSION") {
            self.models.embedding_dimension = v;
        }
        if let Some(v) = lookup("BOOKMIND_GENERATION_MODEL") {
            self.models.generation_model = v;
        }
        if let Some(v) = lookup("BOOKMIND_JUDGE_MODEL") {
            self.models.judge_model = v;
        }
        if let Some(v) = lookup("BOOKMIND_ROUTER_MODEL") {
            self.models.router_model = v;
        }
        if let Some(v) = lookup("BOOKMIND_PROMPT_VERSION") {
            self.models.prompt_version = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.search.search_deadline_ms, 5_000);
        assert_eq!(config.search.max_concurrency, 6);
        assert_eq!(config.graph.max_concepts, 20);
        assert_eq!(config.graph.max_edges_per_concept, 15);
        assert_eq!(config.answer.max_attempts, 2);
        assert_eq!(config.answer.long_form_budget_ms, 45_000);
    }

    #[test]
    fn test_embedding_attempts_fit_inside_a_strategy() {
        let config = EngineConfig::default();
        assert!(config.retry.attempt_timeout_ms < config.search.strategy_timeout_ms);
        assert!(config.search.embedding_budget() < config.search.strategy_timeout());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"answer": {"max_attempts": 4}, "models": {"prompt_version": "v7"}}"#)
                .unwrap();
        assert_eq!(config.answer.max_attempts, 4);
        assert_eq!(config.answer.short_budget_ms, 20_000);
        assert_eq!(config.models.prompt_version, "v7");
        assert_eq!(config.models.embedding_dimension, 1536);
    }

    #[test]
    fn test_env_overrides_skip_garbage() {
        let vars: HashMap<&str, &str> = [
            ("BOOKMIND_BREAKER_THRESHOLD", "9"),
            ("BOOKMIND_SEARCH_DEADLINE_MS", "not-a-number"),
            ("BOOKMIND_GENERATION_MODEL", "local-llama"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.breaker.failure_threshold, 9);
        assert_eq!(config.search.search_deadline_ms, 5_000);
        assert_eq!(config.models.generation_model, "local-llama");
    }
}

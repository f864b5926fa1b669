//! Service root: owns the shared resources and wires both orchestrators

use crate::agents::{ExtractiveGenerator, Generator, LlmGenerator, LlmJudge};
use crate::answer::AnswerOrchestrator;
use crate::cache::{ResultCache, SharedCacheTier};
use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::config::EngineConfig;
use crate::embedding::{EmbeddingClient, EmbeddingProvider, EMBEDDING_SERVICE};
use crate::error::{AnswerError, SearchError};
use crate::graph::GraphEnricher;
use crate::llm::{LlmClient, LlmProvider, LLM_SERVICE};
use crate::orchestrator::SearchOrchestrator;
use crate::retry::RetryPolicy;
use crate::router::{LlmClassifier, SemanticRouter};
use crate::semantic_strategy::{Paraphraser, SemanticMatch};
use crate::store::{CorpusStore, PooledStore};
use crate::strategies::{ExactMatch, LemmaMatch};
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// External dependencies handed to [`Bookmind::new`]
pub struct Providers {
    pub store: Arc<dyn CorpusStore>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
    /// Without an LLM: no classifier, no paraphrases, extractive unjudged answers
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub shared_cache: Option<Arc<dyn SharedCacheTier>>,
}

pub struct Bookmind {
    search: SearchOrchestrator,
    answers: AnswerOrchestrator,
    cache: Arc<ResultCache>,
    store: Arc<PooledStore>,
    breakers: Vec<Arc<CircuitBreaker>>,
}

impl Bookmind {
    pub fn new(config: EngineConfig, providers: Providers) -> Self {
        let policy = RetryPolicy::from(&config.retry);
        let cache = Arc::new(ResultCache::new(config.cache.local_capacity, providers.shared_cache));
        let store = Arc::new(PooledStore::new(
            providers.store,
            config.store.max_in_flight,
            config.store.acquire_timeout(),
        ));
        let pooled: Arc<dyn CorpusStore> = store.clone();

        let embedding_breaker = Arc::new(CircuitBreaker::new(EMBEDDING_SERVICE, config.breaker.clone()));
        let embeddings = Arc::new(EmbeddingClient::new(
            providers.embeddings,
            embedding_breaker.clone(),
            policy.clone(),
            config.models.embedding_dimension,
        ));
        let mut breakers = vec![embedding_breaker];

        let mut router = SemanticRouter::new(config.router.llm_threshold);
        let mut semantic = SemanticMatch::new(
            pooled.clone(),
            embeddings,
            cache.clone(),
            config.models.clone(),
            config.cache.embedding_ttl(),
        )
        .with_embedding_budget(config.search.embedding_budget());
        let generator: Arc<dyn Generator>;
        let mut judge = None;

        match providers.llm {
            Some(provider) => {
                let llm_breaker = Arc::new(CircuitBreaker::new(LLM_SERVICE, config.breaker.clone()));
                let llm_policy =
                    policy.with_attempt_timeout(Duration::from_millis(config.retry.llm_attempt_timeout_ms));
                let llm = Arc::new(LlmClient::new(provider, llm_breaker.clone(), llm_policy));
                breakers.push(llm_breaker);

                router = router.with_classifier(LlmClassifier {
                    llm: llm.clone(),
                    cache: cache.clone(),
                    models: config.models.clone(),
                    cache_ttl: config.cache.classifier_ttl(),
                    timeout: config.router.llm_timeout(),
                });
                // Paraphrasing must leave the embedding round-trip room inside the strategy timeout
                semantic = semantic.with_paraphraser(Paraphraser {
                    llm: llm.clone(),
                    count: config.search.paraphrase_count,
                    timeout: config
                        .search
                        .paraphrase_timeout()
                        .min(config.search.strategy_timeout() / 2),
                });
                let budget = config.answer.budget(AnswerMode::LongForm);
                generator = Arc::new(LlmGenerator::new(llm.clone(), budget));
                judge = Some(Arc::new(LlmJudge::new(llm, budget)));
            }
            None => {
                info!("No LLM configured: rule routing only, extractive answers");
                generator = Arc::new(ExtractiveGenerator);
            }
        }

        let mut search = SearchOrchestrator::new(router, cache.clone(), &config)
            .with_strategy(Arc::new(ExactMatch::new(pooled.clone())))
            .with_strategy(Arc::new(LemmaMatch::new(pooled.clone())))
            .with_strategy(Arc::new(semantic));
        if config.graph.enabled {
            search = search.with_enricher(GraphEnricher::new(pooled, config.graph.clone()));
        }

        let mut answers = AnswerOrchestrator::new(generator, cache.clone(), &config);
        if let Some(judge) = judge {
            answers = answers.with_judge(judge);
        }

        Self {
            search,
            answers,
            cache,
            store,
            breakers,
        }
    }

    pub async fn search(
        &self,
        raw: &str,
        scope: &Scope,
        context: &QueryContext,
        cancel: &CancellationToken,
    ) -> Result<SearchResult, SearchError> {
        self.search.execute(raw, scope, context, cancel).await
    }

    pub async fn answer(
        &self,
        raw: &str,
        scope: &Scope,
        mode: AnswerMode,
        context: &QueryContext,
        cancel: &CancellationToken,
    ) -> Result<AnswerResult, AnswerError> {
        self.answers
            .answer(&self.search, raw, scope, mode, context, cancel)
            .await
    }

    /// Drop every cached search and answer for a user, e.g. after their library changed
    pub async fn invalidate_user(&self, user_id: &str) {
        self.cache.invalidate_user(user_id).await;
    }

    /// Breaker state per guarded service
    pub fn breakers(&self) -> Vec<(&str, CircuitSnapshot)> {
        self.breakers.iter().map(|b| (b.service(), b.snapshot())).collect()
    }

    pub fn store_permits_available(&self) -> usize {
        self.store.available()
    }
}

//! End-to-end tests through the service root

use crate::cache::{answer_key, search_key, SearchShape};
use crate::config::ModelVersions;
use crate::embedding::{EmbedPurpose, EmbeddingClient};
use crate::in_memory_store::chunk;
use crate::llm::LlmRequest;
use crate::retry::RetryPolicy;
use crate::store::VectorHit;
use crate::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const DIM: usize = 64;
const SYNTHESIS_QUERY: &str = "summarize what the books say about solitude";

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.models.embedding_dimension = DIM;
    config
}

/// Small bilingual library with hashed embeddings
fn library() -> Arc<InMemoryCorpus> {
    let corpus = InMemoryCorpus::new();
    let embedder = HashingEmbedder::new(DIM);
    let entries = [
        ("walden-1", "walden", "Walden", 12, "Solitude is the soil in which thought grows. Thoreau went to the woods to live deliberately."),
        ("essays-1", "essays", "Essays", 88, "Montaigne praised solitude as a retreat of the mind, not of the body."),
        ("defter-1", "defter", "Defter", 3, "Bu kitap bilhassa yalnızlık üzerine yazılmış notlardan oluşur."),
        ("defter-2", "defter", "Defter", 4, "Yalnızlık, insanın kendisiyle baş başa kalmasıdır."),
        ("ledger-1", "ledger", "Ledger", 1, "Tax accounting rules change every fiscal year."),
    ];
    for (id, doc, title, page, text) in entries {
        let mut c = chunk(id, doc, text);
        c.document_title = Some(title.to_string());
        c.page = Some(page);
        corpus.add_chunk(c);
        corpus.set_embedding(id, embedder.embed_text(text));
    }
    Arc::new(corpus)
}

fn engine(store: Arc<dyn CorpusStore>, embeddings: Arc<dyn EmbeddingProvider>, llm: Option<Arc<dyn LlmProvider>>) -> Bookmind {
    Bookmind::new(
        config(),
        Providers {
            store,
            embeddings,
            llm,
            shared_cache: None,
        },
    )
}

fn offline_engine() -> Bookmind {
    engine(library(), Arc::new(HashingEmbedder::new(DIM)), None)
}

struct DownEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    async fn embed(&self, _text: &str, _purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::transient("embedding", "503 service unavailable"))
    }
}

struct DownStore;

#[async_trait]
impl CorpusStore for DownStore {
    async fn search_exact(&self, _: &str, _: &Scope, _: usize) -> Result<Vec<CandidateChunk>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
    async fn search_lemma(&self, _: &[String], _: &Scope, _: usize) -> Result<Vec<CandidateChunk>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
    async fn vector_search(&self, _: &[f32], _: &Scope, _: usize) -> Result<Vec<VectorHit>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
    async fn get_concepts_for_chunks(&self, _: &[String]) -> Result<Vec<ChunkConcepts>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
    async fn get_relations(&self, _: &[String], _: usize) -> Result<Vec<ConceptEdge>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
}

/// Never answers
struct HangingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for HangingEmbedder {
    async fn embed(&self, _text: &str, _purpose: EmbedPurpose) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        futures::future::pending().await
    }
}

/// The library behind a slow search backend; concept lookups stay fast
struct SlowStore {
    inner: Arc<InMemoryCorpus>,
    delay: Duration,
}

#[async_trait]
impl CorpusStore for SlowStore {
    async fn search_exact(&self, phrase: &str, scope: &Scope, limit: usize) -> Result<Vec<CandidateChunk>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.search_exact(phrase, scope, limit).await
    }
    async fn search_lemma(&self, lemmas: &[String], scope: &Scope, limit: usize) -> Result<Vec<CandidateChunk>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.search_lemma(lemmas, scope, limit).await
    }
    async fn vector_search(&self, embedding: &[f32], scope: &Scope, k: usize) -> Result<Vec<VectorHit>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.vector_search(embedding, scope, k).await
    }
    async fn get_concepts_for_chunks(&self, ids: &[String]) -> Result<Vec<ChunkConcepts>, StoreError> {
        self.inner.get_concepts_for_chunks(ids).await
    }
    async fn get_relations(&self, concept_ids: &[String], max_per_node: usize) -> Result<Vec<ConceptEdge>, StoreError> {
        self.inner.get_relations(concept_ids, max_per_node).await
    }
}

/// Answers by role: drafts cite [1], the judge replies with a fixed verdict
struct ScriptedLlm {
    verdict: &'static str,
    draft_delay: Duration,
    drafts: AtomicUsize,
    judgements: AtomicUsize,
}

impl ScriptedLlm {
    fn new(verdict: &'static str) -> Arc<Self> {
        Self::slow(verdict, Duration::ZERO)
    }

    fn slow(verdict: &'static str, draft_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            draft_delay,
            drafts: AtomicUsize::new(0),
            judgements: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<String, ProviderError> {
        if request.system.starts_with("You review") {
            self.judgements.fetch_add(1, Ordering::SeqCst);
            return Ok(format!(
                r#"{{"verdict": "{}", "hints": ["quote Thoreau directly"], "scores": {{"grounding": 0.6}}}}"#,
                self.verdict
            ));
        }
        if request.system.starts_with("You answer") {
            tokio::time::sleep(self.draft_delay).await;
            let n = self.drafts.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(format!("Draft {}: solitude lets thought grow [1].", n));
        }
        Ok("solitude in books".to_string())
    }
}

fn ids(result: &SearchResult) -> Vec<&str> {
    result.items.iter().map(|i| i.chunk.id.as_str()).collect()
}

#[tokio::test]
async fn test_exact_term_ranks_first_for_direct_lookup() {
    let engine = offline_engine();
    let result = engine
        .search("bilhassa", &Scope::for_user("u1"), &QueryContext::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.metadata.intent, Intent::Direct);
    assert_eq!(result.items[0].chunk.id, "defter-1");
    assert!(result.metadata.weights[&StrategyKind::Exact] > result.metadata.weights[&StrategyKind::Semantic]);
    let strategies: Vec<StrategyKind> = result.items[0].provenance.iter().map(|c| c.strategy).collect();
    assert!(strategies.contains(&StrategyKind::Exact));
}

#[tokio::test]
async fn test_quoted_phrase_routes_to_lexical_strategies() {
    let engine = offline_engine();
    let result = engine
        .search(
            "where did I read \"bilhassa yalnızlık\"",
            &Scope::for_user("u1"),
            &QueryContext::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.metadata.intent, Intent::CitationSeeking);
    assert!(!result.metadata.strategies.contains(&StrategyKind::Semantic));
    assert!(!result.metadata.graph_enriched);
    assert_eq!(result.items[0].chunk.id, "defter-1");
}

#[tokio::test(start_paused = true)]
async fn test_semantic_outage_degrades_instead_of_failing() {
    let embedder = Arc::new(DownEmbedder {
        calls: AtomicUsize::new(0),
    });
    let engine = engine(library(), embedder.clone(), None);
    let scope = Scope::for_user("u1");
    let result = engine
        .search(SYNTHESIS_QUERY, &scope, &QueryContext::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.items.is_empty());
    assert!(result.metadata.degraded);
    assert!(result.metadata.degradations.iter().any(|d| matches!(
        d,
        Degradation::StrategyFailed { strategy: StrategyKind::Semantic, .. }
    )));
    assert!(result.items.iter().all(|i| i
        .provenance
        .iter()
        .all(|c| c.strategy != StrategyKind::Semantic)));

    // Degraded results are not cached
    let again = engine
        .search(SYNTHESIS_QUERY, &scope, &QueryContext::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!again.metadata.cache_hit);
    assert!(embedder.calls.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_every_strategy_failing_is_an_explicit_error() {
    let engine = engine(Arc::new(DownStore), Arc::new(HashingEmbedder::new(DIM)), None);
    let err = engine
        .search(SYNTHESIS_QUERY, &Scope::for_user("u1"), &QueryContext::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        SearchError::TotalRetrievalFailure { failures } => {
            let mut failed: Vec<StrategyKind> = failures.iter().map(|f| f.strategy).collect();
            failed.sort();
            assert_eq!(failed, StrategyKind::ALL.to_vec());
        }
        other => panic!("expected total failure, got {:?}", other),
    }

    let err = engine
        .answer(
            SYNTHESIS_QUERY,
            &Scope::for_user("u1"),
            AnswerMode::Short,
            &QueryContext::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AnswerError::Search(SearchError::TotalRetrievalFailure { .. })));
}

#[tokio::test]
async fn test_repeat_search_is_served_from_cache_until_invalidated() {
    let engine = offline_engine();
    let scope = Scope::for_user("u1");
    let ctx = QueryContext::default();

    let first = engine.search(SYNTHESIS_QUERY, &scope, &ctx, &CancellationToken::new()).await.unwrap();
    let second = engine.search(SYNTHESIS_QUERY, &scope, &ctx, &CancellationToken::new()).await.unwrap();
    assert!(!first.metadata.degraded);
    assert!(!first.metadata.cache_hit);
    assert!(second.metadata.cache_hit);
    assert_eq!(
        serde_json::to_string(&first.items).unwrap(),
        serde_json::to_string(&second.items).unwrap()
    );
    assert_eq!(ids(&first), ids(&second));

    // Another user's invalidation leaves this entry alone
    engine.invalidate_user("u2").await;
    let third = engine.search(SYNTHESIS_QUERY, &scope, &ctx, &CancellationToken::new()).await.unwrap();
    assert!(third.metadata.cache_hit);

    engine.invalidate_user("u1").await;
    let fourth = engine.search(SYNTHESIS_QUERY, &scope, &ctx, &CancellationToken::new()).await.unwrap();
    assert!(!fourth.metadata.cache_hit);
}

#[tokio::test]
async fn test_scope_restricts_results() {
    let engine = offline_engine();
    let scope = Scope {
        user_id: "u1".into(),
        document_ids: Some(vec!["essays".into()]),
        source_types: vec![],
    };
    let result = engine
        .search(SYNTHESIS_QUERY, &scope, &QueryContext::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!result.items.is_empty());
    assert!(result.items.iter().all(|i| i.chunk.document_id == "essays"));
}

#[tokio::test]
async fn test_empty_document_list_does_not_shadow_whole_library() {
    let engine = offline_engine();
    let ctx = QueryContext::default();
    let nothing = Scope {
        document_ids: Some(vec![]),
        ..Scope::for_user("u1")
    };
    let restricted = engine.search("bilhassa", &nothing, &ctx, &CancellationToken::new()).await.unwrap();
    assert!(restricted.items.is_empty());

    let whole = engine
        .search("bilhassa", &Scope::for_user("u1"), &ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!whole.metadata.cache_hit);
    assert_eq!(whole.items[0].chunk.id, "defter-1");
}

#[tokio::test]
async fn test_different_quoted_phrases_are_cached_apart() {
    let engine = offline_engine();
    let scope = Scope::for_user("u1");
    let ctx = QueryContext::default();

    let first = engine
        .search("find \"tax accounting\" rules", &scope, &ctx, &CancellationToken::new())
        .await
        .unwrap();
    let second = engine
        .search("find tax \"accounting rules\"", &scope, &ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!first.metadata.cache_hit);
    assert!(!second.metadata.cache_hit);

    let repeat = engine
        .search("find tax \"accounting rules\"", &scope, &ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(repeat.metadata.cache_hit);
}

#[tokio::test]
async fn test_cancelled_request_returns_cancelled() {
    let engine = offline_engine();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine
        .search(SYNTHESIS_QUERY, &Scope::for_user("u1"), &QueryContext::default(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, SearchError::Cancelled);

    let err = engine
        .answer(SYNTHESIS_QUERY, &Scope::for_user("u1"), AnswerMode::Short, &QueryContext::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AnswerError::Cancelled));
}

#[tokio::test]
async fn test_answer_loop_is_bounded_and_not_cached() {
    let llm = ScriptedLlm::new("REGENERATE");
    let engine = engine(library(), Arc::new(HashingEmbedder::new(DIM)), Some(llm.clone()));
    let scope = Scope::for_user("u1");
    let ctx = QueryContext::default();

    let result = engine
        .answer(SYNTHESIS_QUERY, &scope, AnswerMode::Short, &ctx, &CancellationToken::new())
        .await
        .unwrap();

    let max_attempts = config().answer.max_attempts;
    assert_eq!(llm.drafts.load(Ordering::SeqCst), max_attempts);
    assert_eq!(result.metadata.attempts, max_attempts);
    assert_eq!(
        result.metadata.outcome,
        AnswerOutcome::Fallback(FallbackReason::AttemptsExhausted)
    );
    assert_eq!(result.metadata.final_verdict, Some(Verdict::Regenerate));
    assert!(result.answer.starts_with(&format!("Draft {}", max_attempts)));
    assert_eq!(result.citations.len(), 1);

    let again = engine
        .answer(SYNTHESIS_QUERY, &scope, AnswerMode::Short, &ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!again.metadata.cache_hit);
    assert_eq!(llm.drafts.load(Ordering::SeqCst), 2 * max_attempts);
}

#[tokio::test]
async fn test_passing_answer_is_cited_and_cached() {
    let llm = ScriptedLlm::new("PASS");
    let engine = engine(library(), Arc::new(HashingEmbedder::new(DIM)), Some(llm.clone()));
    let scope = Scope::for_user("u1");
    let ctx = QueryContext::default();

    let first = engine
        .answer(SYNTHESIS_QUERY, &scope, AnswerMode::LongForm, &ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.metadata.outcome, AnswerOutcome::Passed);
    assert!(first.metadata.evaluated);
    assert_eq!(first.answer, "Draft 1: solitude lets thought grow [1].");
    assert_eq!(first.citations[0].index, 1);
    assert!(first.citations[0].page.is_some());

    let second = engine
        .answer(SYNTHESIS_QUERY, &scope, AnswerMode::LongForm, &ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(second.metadata.cache_hit);
    assert_eq!(second.answer, first.answer);
    assert_eq!(llm.drafts.load(Ordering::SeqCst), 1);
    assert_eq!(llm.judgements.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_offline_answer_is_extractive_and_unverified() {
    let engine = offline_engine();
    let result = engine
        .answer(SYNTHESIS_QUERY, &Scope::for_user("u1"), AnswerMode::Short, &QueryContext::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.metadata.outcome, AnswerOutcome::Unverified);
    assert!(!result.citations.is_empty());
    assert!(result.answer.ends_with(crate::answer::UNVERIFIED_NOTE));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_five_failures() {
    let provider = Arc::new(DownEmbedder {
        calls: AtomicUsize::new(0),
    });
    let breaker = Arc::new(CircuitBreaker::new("embedding", config().breaker));
    let policy = RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    };
    let client = EmbeddingClient::new(provider.clone(), breaker.clone(), policy, DIM);

    for _ in 0..5 {
        let err = client.embed("solitude", EmbedPurpose::Query).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transient { .. }));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let started = Instant::now();
    let err = client.embed("solitude", EmbedPurpose::Query).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(5));
    assert!(err.is_circuit_open());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
}

#[test]
fn test_cache_keys_track_model_versions() {
    let scope = Scope::for_user("u1");
    let strategies = StrategyKind::ALL.to_vec();
    let shape = SearchShape {
        normalized: "solitude",
        focus: None,
        intent: Intent::Synthesis,
        strategies: &strategies,
        graph_enriched: true,
    };
    let base = ModelVersions::default();
    let key = |models: &ModelVersions| search_key(&scope, &shape, models).render();

    let mut reembedded = base.clone();
    reembedded.embedding_model = "text-embedding-3-large".into();
    assert_ne!(key(&base), key(&reembedded));
    assert_eq!(key(&base), key(&base.clone()));

    let answer = |models: &ModelVersions| answer_key(&scope, &shape, AnswerMode::Short, models).render();
    let mut new_prompt = base.clone();
    new_prompt.prompt_version = "v2".into();
    assert_ne!(answer(&base), answer(&new_prompt));
    assert!(key(&base).starts_with("bookmind:u1:search:"));
}

#[tokio::test]
async fn test_fusion_is_stable_across_runs() {
    let engine = offline_engine();
    let scope = Scope::for_user("u1");
    let first = engine
        .search(SYNTHESIS_QUERY, &scope, &QueryContext::default(), &CancellationToken::new())
        .await
        .unwrap();
    for _ in 0..5 {
        engine.invalidate_user("u1").await;
        let again = engine
            .search(SYNTHESIS_QUERY, &scope, &QueryContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!again.metadata.cache_hit);
        assert_eq!(
            serde_json::to_string(&first.items).unwrap(),
            serde_json::to_string(&again.items).unwrap()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_hung_embedding_api_opens_the_breaker() {
    let embedder = Arc::new(HangingEmbedder {
        calls: AtomicUsize::new(0),
    });
    let engine = engine(library(), embedder.clone(), None);
    let scope = Scope::for_user("u1");
    let ctx = QueryContext::default();
    let strategy_timeout = config().search.strategy_timeout();
    let embedding_state = |engine: &Bookmind| {
        engine
            .breakers()
            .into_iter()
            .find(|(service, _)| *service == "embedding")
            .map(|(_, snapshot)| snapshot.state)
    };

    for _ in 0..5 {
        let started = Instant::now();
        let result = engine.search(SYNTHESIS_QUERY, &scope, &ctx, &CancellationToken::new()).await.unwrap();
        // The embedding call gives up inside the strategy timeout and is counted
        assert!(started.elapsed() < strategy_timeout);
        assert!(!result.items.is_empty());
        assert!(result.metadata.degradations.iter().any(|d| matches!(
            d,
            Degradation::StrategyFailed { strategy: StrategyKind::Semantic, .. }
        )));
    }
    assert_eq!(embedding_state(&engine), Some(CircuitState::Open));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 5);

    let started = Instant::now();
    let result = engine.search(SYNTHESIS_QUERY, &scope, &ctx, &CancellationToken::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(5));
    assert!(result.metadata.degradations.iter().any(|d| matches!(
        d,
        Degradation::StrategyUnavailable { strategy: StrategyKind::Semantic, .. }
    )));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_answer_budget_includes_retrieval_time() {
    let mut config = config();
    config.answer.short_budget_ms = 2_000;
    let llm = ScriptedLlm::slow("PASS", Duration::from_millis(1_500));
    let engine = Bookmind::new(
        config,
        Providers {
            store: Arc::new(SlowStore {
                inner: library(),
                delay: Duration::from_secs(1),
            }),
            embeddings: Arc::new(HashingEmbedder::new(DIM)),
            llm: Some(llm.clone()),
            shared_cache: None,
        },
    );

    let started = Instant::now();
    let result = engine
        .answer(SYNTHESIS_QUERY, &Scope::for_user("u1"), AnswerMode::Short, &QueryContext::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        result.metadata.outcome,
        AnswerOutcome::Fallback(FallbackReason::BudgetExceeded)
    );
    assert!(started.elapsed() <= Duration::from_secs(2));
    assert_eq!(llm.judgements.load(Ordering::SeqCst), 0);
}

//! Search orchestration: route, retrieve in parallel, fuse, enrich, cache

use crate::cache::{search_key, ResultCache, SearchShape};
use crate::config::{EngineConfig, ModelVersions, SearchConfig};
use crate::error::{SearchError, StrategyFailure};
use crate::fusion::RankFusionEngine;
use crate::graph::GraphEnricher;
use crate::router::{RoutingDecision, SemanticRouter};
use crate::strategies::{RetrievalStrategy, StrategyOutput};
use crate::text::{detect_language, normalize_for};
use crate::types::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MAX_QUERY_CHARS: usize = 2_000;

/// A classified query, ready for retrieval
#[derive(Debug, Clone)]
pub struct RoutedQuery {
    pub query: Query,
    pub decision: RoutingDecision,
    pub routing_ms: u64,
}

impl RoutedQuery {
    /// The query as handed to strategies: a quoted phrase replaces the full text
    fn retrieval_query(&self) -> Query {
        let mut query = self.query.clone();
        if let Some(focus) = &self.decision.focus {
            query.normalized = focus.clone();
        }
        query
    }
}

type StrategyRun = (
    StrategyKind,
    Result<Result<StrategyOutput, crate::error::StrategyError>, tokio::time::error::Elapsed>,
    Duration,
);

/// What came back from the parallel retrieval phase
#[derive(Default)]
struct Retrieval {
    lists: BTreeMap<StrategyKind, Vec<StrategyHit>>,
    degradations: Vec<Degradation>,
    failures: Vec<StrategyFailure>,
    per_strategy_ms: BTreeMap<StrategyKind, u64>,
}

impl Retrieval {
    fn fail(&mut self, strategy: StrategyKind, reason: impl Into<String>, degradation: Option<Degradation>) {
        self.failures.push(StrategyFailure {
            strategy,
            reason: reason.into(),
        });
        self.degradations.extend(degradation);
    }
}

pub struct SearchOrchestrator {
    router: SemanticRouter,
    strategies: BTreeMap<StrategyKind, Arc<dyn RetrievalStrategy>>,
    fusion: RankFusionEngine,
    enricher: Option<GraphEnricher>,
    cache: Arc<ResultCache>,
    config: SearchConfig,
    graph_enabled: bool,
    search_ttl: Duration,
    models: ModelVersions,
}

impl SearchOrchestrator {
    pub fn new(router: SemanticRouter, cache: Arc<ResultCache>, config: &EngineConfig) -> Self {
        Self {
            router,
            strategies: BTreeMap::new(),
            fusion: RankFusionEngine::new(config.search.rrf_offset),
            enricher: None,
            cache,
            config: config.search.clone(),
            graph_enabled: config.graph.enabled,
            search_ttl: config.cache.search_ttl(),
            models: config.models.clone(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn RetrievalStrategy>) -> Self {
        self.strategies.insert(strategy.kind(), strategy);
        self
    }

    pub fn with_enricher(mut self, enricher: GraphEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn models(&self) -> &ModelVersions {
        &self.models
    }

    /// Normalize and classify; the decision feeds both cache keys and retrieval
    pub async fn route(&self, raw: &str, context: &QueryContext) -> Result<RoutedQuery, SearchError> {
        let started = Instant::now();
        if raw.chars().count() > MAX_QUERY_CHARS {
            return Err(SearchError::InvalidQuery(format!(
                "query longer than {} characters",
                MAX_QUERY_CHARS
            )));
        }
        let language = detect_language(raw);
        let normalized = normalize_for(raw, language);
        if normalized.is_empty() {
            return Err(SearchError::InvalidQuery("query is empty".to_string()));
        }

        let decision = self.router.route(raw, language, context).await;
        Ok(RoutedQuery {
            query: Query {
                raw: raw.trim().to_string(),
                normalized,
                language,
                intent: decision.intent,
            },
            decision,
            routing_ms: started.elapsed().as_millis() as u64,
        })
    }

    pub async fn execute(
        &self,
        raw: &str,
        scope: &Scope,
        context: &QueryContext,
        cancel: &CancellationToken,
    ) -> Result<SearchResult, SearchError> {
        let routed = self.route(raw, context).await?;
        self.execute_routed(&routed, scope, cancel).await
    }

    fn graph_planned(&self, decision: &RoutingDecision) -> bool {
        self.graph_enabled && self.enricher.is_some() && !decision.skip_graph
    }

    /// The parts of a routed query that decide what gets retrieved
    pub fn search_shape<'a>(&self, routed: &'a RoutedQuery) -> SearchShape<'a> {
        SearchShape {
            normalized: &routed.query.normalized,
            focus: routed.decision.focus.as_deref(),
            intent: routed.decision.intent,
            strategies: &routed.decision.strategies,
            graph_enriched: self.graph_planned(&routed.decision),
        }
    }

    pub async fn execute_routed(
        &self,
        routed: &RoutedQuery,
        scope: &Scope,
        cancel: &CancellationToken,
    ) -> Result<SearchResult, SearchError> {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        let decision = &routed.decision;
        let graph_planned = self.graph_planned(decision);

        let key = search_key(scope, &self.search_shape(routed), &self.models).render();
        if let Some(mut cached) = self.cache.get_json::<SearchResult>(&key).await {
            info!("Search cache hit for '{}'", routed.query.normalized);
            cached.metadata.cache_hit = true;
            return Ok(cached);
        }

        // Retrieval
        let retrieval_started = Instant::now();
        let retrieval = self.retrieve(routed, scope, cancel).await?;
        let retrieval_ms = retrieval_started.elapsed().as_millis() as u64;

        if retrieval.lists.is_empty() {
            error!(
                "All {} strategies failed for '{}'",
                retrieval.failures.len(),
                routed.query.normalized
            );
            return Err(SearchError::TotalRetrievalFailure {
                failures: retrieval.failures,
            });
        }

        // Fusion
        let fusion_started = Instant::now();
        let items = self
            .fusion
            .fuse(&retrieval.lists, &decision.weights, self.config.result_limit);
        let fusion_ms = fusion_started.elapsed().as_millis() as u64;

        let mut degradations = decision.degradations.clone();
        degradations.extend(retrieval.degradations);

        // Enrichment
        let enrichment_started = Instant::now();
        let mut bridges = Vec::new();
        let mut graph_enriched = false;
        if let Some(enricher) = self.enricher.as_ref().filter(|_| graph_planned && !items.is_empty()) {
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            let enrichment = enricher.enrich(&items).await;
            graph_enriched = !enrichment
                .degradations
                .iter()
                .any(|d| matches!(d, Degradation::GraphUnavailable { .. }));
            bridges = enrichment.bridges;
            degradations.extend(enrichment.degradations);
        }
        let enrichment_ms = enrichment_started.elapsed().as_millis() as u64;

        let result = SearchResult {
            items,
            bridges,
            metadata: SearchMetadata {
                intent: decision.intent,
                router_reason: decision.reason.clone(),
                confidence: decision.confidence,
                language: routed.query.language,
                strategies: decision.strategies.clone(),
                weights: decision.weights.clone(),
                graph_enriched,
                degraded: !degradations.is_empty(),
                degradations,
                cache_hit: false,
                timings: StageTimings {
                    routing_ms: routed.routing_ms,
                    retrieval_ms,
                    fusion_ms,
                    enrichment_ms,
                    total_ms: routed.routing_ms + started.elapsed().as_millis() as u64,
                    per_strategy_ms: retrieval.per_strategy_ms,
                },
            },
        };

        info!(
            "Search '{}': {} items, {} bridges, degraded={}, {}ms",
            routed.query.normalized,
            result.items.len(),
            result.bridges.len(),
            result.metadata.degraded,
            result.metadata.timings.total_ms
        );

        // Only complete results are cached; a degraded one would outlive the outage
        if result.metadata.is_complete() {
            self.cache.set_json(&key, &result, self.search_ttl).await;
        }
        Ok(result)
    }

    /// Run the selected strategies concurrently under per-strategy timeouts,
    /// the overall deadline and the cancellation token
    async fn retrieve(
        &self,
        routed: &RoutedQuery,
        scope: &Scope,
        cancel: &CancellationToken,
    ) -> Result<Retrieval, SearchError> {
        let mut retrieval = Retrieval::default();
        let query = Arc::new(routed.retrieval_query());
        let scope = Arc::new(scope.clone());
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let strategy_timeout = self.config.strategy_timeout();
        let limit = self.config.per_strategy_limit;

        let mut pending: BTreeSet<StrategyKind> = BTreeSet::new();
        let mut tasks: JoinSet<StrategyRun> = JoinSet::new();

        for kind in &routed.decision.strategies {
            let Some(strategy) = self.strategies.get(kind).cloned() else {
                retrieval.fail(
                    *kind,
                    "not configured",
                    Some(Degradation::StrategyUnavailable {
                        strategy: *kind,
                        reason: "not configured".to_string(),
                    }),
                );
                continue;
            };
            pending.insert(*kind);
            let query = query.clone();
            let scope = scope.clone();
            let permits = permits.clone();
            let kind = *kind;
            tasks.spawn(async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(strategy_timeout, async {
                    // A closed semaphore only means no bound; run anyway
                    let _permit = permits.acquire_owned().await.ok();
                    strategy.search(&query, &scope, limit).await
                })
                .await;
                (kind, outcome, started.elapsed())
            });
        }

        let deadline = Instant::now() + self.config.search_deadline();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    info!("Search cancelled with {} strategies in flight", pending.len());
                    return Err(SearchError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tasks.abort_all();
                    if !pending.is_empty() {
                        let late: Vec<StrategyKind> = pending.iter().copied().collect();
                        warn!("Search deadline reached, abandoning {:?}", late);
                        for kind in &late {
                            retrieval.fail(*kind, "search deadline exceeded", None);
                        }
                        retrieval.degradations.push(Degradation::DeadlineExceeded { pending: late });
                        pending.clear();
                    }
                    break;
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok((kind, outcome, elapsed))) => {
                        pending.remove(&kind);
                        retrieval.per_strategy_ms.insert(kind, elapsed.as_millis() as u64);
                        record(&mut retrieval, kind, outcome, strategy_timeout);
                    }
                    Some(Err(e)) => {
                        error!("Strategy task aborted: {}", e);
                    }
                },
            }
        }

        // Tasks that ended without reporting (panicked) are failures too
        for kind in pending {
            retrieval.fail(
                kind,
                "strategy task panicked",
                Some(Degradation::StrategyFailed {
                    strategy: kind,
                    error: "task panicked".to_string(),
                }),
            );
        }
        Ok(retrieval)
    }
}

fn record(
    retrieval: &mut Retrieval,
    kind: StrategyKind,
    outcome: Result<Result<StrategyOutput, crate::error::StrategyError>, tokio::time::error::Elapsed>,
    strategy_timeout: Duration,
) {
    match outcome {
        Ok(Ok(output)) if output.available => {
            debug!("{} returned {} hits", kind.as_str(), output.hits.len());
            retrieval.degradations.extend(output.degradations);
            retrieval.lists.insert(kind, output.hits);
        }
        Ok(Ok(output)) => {
            let reason = output
                .degradations
                .iter()
                .find_map(|d| match d {
                    Degradation::StrategyUnavailable { reason, .. } => Some(reason.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "unavailable".to_string());
            retrieval.degradations.extend(output.degradations);
            retrieval.fail(kind, reason, None);
        }
        Ok(Err(e)) => {
            warn!("{} failed: {}", kind.as_str(), e);
            retrieval.fail(
                kind,
                e.to_string(),
                Some(Degradation::StrategyFailed {
                    strategy: kind,
                    error: e.to_string(),
                }),
            );
        }
        Err(_) => {
            warn!(
                "{} timed out after {}ms",
                kind.as_str(),
                strategy_timeout.as_millis()
            );
            retrieval.fail(
                kind,
                format!("timed out after {}ms", strategy_timeout.as_millis()),
                Some(Degradation::StrategyTimedOut { strategy: kind }),
            );
        }
    }
}

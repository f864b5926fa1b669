//! Read-only corpus store boundary and its bounded request pool

use crate::error::StoreError;
use crate::types::{CandidateChunk, ChunkConcepts, ConceptEdge, Scope};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::warn;

/// Chunk returned by a nearest-neighbour search
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk: CandidateChunk,
    pub similarity: f32,
}

/// Operations this core consumes from the corpus store
#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Chunks whose text contains the normalized phrase or any of its tokens
    async fn search_exact(&self, text: &str, scope: &Scope, limit: usize) -> Result<Vec<CandidateChunk>, StoreError>;

    /// Chunks sharing at least one lemma with `lemmas`
    async fn search_lemma(&self, lemmas: &[String], scope: &Scope, limit: usize)
        -> Result<Vec<CandidateChunk>, StoreError>;

    async fn vector_search(&self, embedding: &[f32], scope: &Scope, k: usize) -> Result<Vec<VectorHit>, StoreError>;

    async fn get_concepts_for_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkConcepts>, StoreError>;

    /// Outgoing edges per concept, at most `max_per_node` each, heaviest first
    async fn get_relations(&self, concept_ids: &[String], max_per_node: usize)
        -> Result<Vec<ConceptEdge>, StoreError>;
}

/// Caps in-flight store calls; callers wait a bounded time for a slot, then fail fast
pub struct PooledStore {
    inner: Arc<dyn CorpusStore>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl PooledStore {
    pub fn new(inner: Arc<dyn CorpusStore>, max_in_flight: usize, acquire_timeout: Duration) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            acquire_timeout,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>, StoreError> {
        let started = Instant::now();
        match tokio::time::timeout(self.acquire_timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(StoreError::Backend("store pool closed".to_string())),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!("Corpus store pool saturated after {}ms", waited_ms);
                Err(StoreError::PoolSaturated { waited_ms })
            }
        }
    }
}

#[async_trait]
impl CorpusStore for PooledStore {
    async fn search_exact(&self, text: &str, scope: &Scope, limit: usize) -> Result<Vec<CandidateChunk>, StoreError> {
        let _permit = self.slot().await?;
        self.inner.search_exact(text, scope, limit).await
    }

    async fn search_lemma(
        &self,
        lemmas: &[String],
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<CandidateChunk>, StoreError> {
        let _permit = self.slot().await?;
        self.inner.search_lemma(lemmas, scope, limit).await
    }

    async fn vector_search(&self, embedding: &[f32], scope: &Scope, k: usize) -> Result<Vec<VectorHit>, StoreError> {
        let _permit = self.slot().await?;
        self.inner.vector_search(embedding, scope, k).await
    }

    async fn get_concepts_for_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkConcepts>, StoreError> {
        let _permit = self.slot().await?;
        self.inner.get_concepts_for_chunks(chunk_ids).await
    }

    async fn get_relations(
        &self,
        concept_ids: &[String],
        max_per_node: usize,
    ) -> Result<Vec<ConceptEdge>, StoreError> {
        let _permit = self.slot().await?;
        self.inner.get_relations(concept_ids, max_per_node).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_store::InMemoryCorpus;

    struct StallingStore;

    #[async_trait]
    impl CorpusStore for StallingStore {
        async fn search_exact(&self, _: &str, _: &Scope, _: usize) -> Result<Vec<CandidateChunk>, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
        async fn search_lemma(&self, _: &[String], _: &Scope, _: usize) -> Result<Vec<CandidateChunk>, StoreError> {
            Ok(vec![])
        }
        async fn vector_search(&self, _: &[f32], _: &Scope, _: usize) -> Result<Vec<VectorHit>, StoreError> {
            Ok(vec![])
        }
        async fn get_concepts_for_chunks(&self, _: &[String]) -> Result<Vec<ChunkConcepts>, StoreError> {
            Ok(vec![])
        }
        async fn get_relations(&self, _: &[String], _: usize) -> Result<Vec<ConceptEdge>, StoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_fails_fast() {
        let pool = Arc::new(PooledStore::new(Arc::new(StallingStore), 1, Duration::from_millis(100)));
        let scope = Scope::for_user("u");

        let busy = {
            let pool = pool.clone();
            let scope = scope.clone();
            tokio::spawn(async move { pool.search_exact("x", &scope, 10).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.available(), 0);

        let err = pool.search_lemma(&["x".into()], &scope, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::PoolSaturated { .. }));
        busy.abort();
    }

    #[tokio::test]
    async fn test_pool_passes_calls_through() {
        let corpus = InMemoryCorpus::new();
        corpus.add_chunk(crate::in_memory_store::chunk("c1", "d1", "the quick brown fox"));
        let pool = PooledStore::new(Arc::new(corpus), 4, Duration::from_millis(100));
        let hits = pool.search_exact("quick", &Scope::for_user("u"), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(pool.available(), 4);
    }
}

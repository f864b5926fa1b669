//! HTTP-backed corpus store that calls the document store service

use crate::error::StoreError;
use crate::store::{CorpusStore, VectorHit};
use crate::types::{CandidateChunk, ChunkConcepts, ConceptEdge, Scope};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Filters forwarded to the store service
#[derive(Debug, Serialize)]
struct ScopeFilters<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    source_types: &'a [crate::types::SourceType],
}

fn is_empty_slice<T>(items: &&[T]) -> bool {
    items.is_empty()
}

impl<'a> From<&'a Scope> for ScopeFilters<'a> {
    fn from(scope: &'a Scope) -> Self {
        Self {
            user_id: &scope.user_id,
            document_ids: scope.document_ids.as_deref(),
            source_types: &scope.source_types,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExactRequest<'a> {
    text: &'a str,
    filters: ScopeFilters<'a>,
    limit: usize,
}

#[derive(Debug, Serialize)]
struct LemmaRequest<'a> {
    lemmas: &'a [String],
    filters: ScopeFilters<'a>,
    limit: usize,
}

#[derive(Debug, Serialize)]
struct VectorRequest<'a> {
    embedding: &'a [f32],
    filters: ScopeFilters<'a>,
    k: usize,
}

#[derive(Debug, Serialize)]
struct ConceptsRequest<'a> {
    chunk_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct RelationsRequest<'a> {
    concept_ids: &'a [String],
    max_per_node: usize,
}

#[derive(Debug, Deserialize)]
struct ChunksResponse {
    chunks: Vec<CandidateChunk>,
    #[serde(default)]
    query_time_ms: f64,
}

#[derive(Debug, Deserialize)]
struct VectorResponse {
    hits: Vec<VectorHitWire>,
    #[serde(default)]
    query_time_ms: f64,
}

#[derive(Debug, Deserialize)]
struct VectorHitWire {
    chunk: CandidateChunk,
    similarity: f32,
}

#[derive(Debug, Deserialize)]
struct ConceptsResponse {
    chunks: Vec<ChunkConcepts>,
}

#[derive(Debug, Deserialize)]
struct RelationsResponse {
    edges: Vec<ConceptEdge>,
}

pub struct HttpCorpusStore {
    service_url: String,
    client: reqwest::Client,
}

impl HttpCorpusStore {
    pub fn new(service_url: String, request_timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { service_url, client })
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, StoreError> {
        let url = format!("{}{}", self.service_url, path);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Timeout
            } else {
                StoreError::Backend(format!("failed to call {}: {}", url, e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "store service error ({}): {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to parse {} response: {}", path, e)))
    }
}

#[async_trait]
impl CorpusStore for HttpCorpusStore {
    async fn search_exact(&self, text: &str, scope: &Scope, limit: usize) -> Result<Vec<CandidateChunk>, StoreError> {
        let response: ChunksResponse = self
            .post(
                "/search/exact",
                &ExactRequest {
                    text,
                    filters: scope.into(),
                    limit,
                },
            )
            .await?;
        debug!(
            "Exact search: {} chunks in {:.1}ms",
            response.chunks.len(),
            response.query_time_ms
        );
        Ok(response.chunks)
    }

    async fn search_lemma(
        &self,
        lemmas: &[String],
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<CandidateChunk>, StoreError> {
        let response: ChunksResponse = self
            .post(
                "/search/lemma",
                &LemmaRequest {
                    lemmas,
                    filters: scope.into(),
                    limit,
                },
            )
            .await?;
        debug!(
            "Lemma search: {} chunks in {:.1}ms",
            response.chunks.len(),
            response.query_time_ms
        );
        Ok(response.chunks)
    }

    async fn vector_search(&self, embedding: &[f32], scope: &Scope, k: usize) -> Result<Vec<VectorHit>, StoreError> {
        let response: VectorResponse = self
            .post(
                "/search/vector",
                &VectorRequest {
                    embedding,
                    filters: scope.into(),
                    k,
                },
            )
            .await?;
        debug!(
            "Vector search: {} hits in {:.1}ms",
            response.hits.len(),
            response.query_time_ms
        );
        Ok(response
            .hits
            .into_iter()
            .map(|h| VectorHit {
                chunk: h.chunk,
                similarity: h.similarity,
            })
            .collect())
    }

    async fn get_concepts_for_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkConcepts>, StoreError> {
        let response: ConceptsResponse = self.post("/concepts", &ConceptsRequest { chunk_ids }).await?;
        Ok(response.chunks)
    }

    async fn get_relations(
        &self,
        concept_ids: &[String],
        max_per_node: usize,
    ) -> Result<Vec<ConceptEdge>, StoreError> {
        let response: RelationsResponse = self
            .post(
                "/relations",
                &RelationsRequest {
                    concept_ids,
                    max_per_node,
                },
            )
            .await?;
        Ok(response.edges)
    }
}

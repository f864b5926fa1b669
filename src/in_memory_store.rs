//! In-process corpus store used by tests and the demo server

use crate::error::StoreError;
use crate::store::{CorpusStore, VectorHit};
use crate::text::{lemma_variants, normalize, tokenize};
use crate::types::{CandidateChunk, ChunkConcepts, ConceptEdge, ConceptNode, Scope, SourceType};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Corpus {
    chunks: Vec<CandidateChunk>,
    concepts: HashMap<String, Vec<ConceptNode>>,
    edges: Vec<ConceptEdge>,
}

#[derive(Default)]
pub struct InMemoryCorpus {
    corpus: RwLock<Corpus>,
}

/// Build a book chunk with no page, title or embedding
pub fn chunk(id: &str, document_id: &str, text: &str) -> CandidateChunk {
    CandidateChunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        document_title: None,
        text: text.to_string(),
        source_type: SourceType::Book,
        page: None,
        embedding: None,
    }
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&self, chunk: CandidateChunk) {
        let mut corpus = self.corpus.write();
        corpus.chunks.retain(|c| c.id != chunk.id);
        corpus.chunks.push(chunk);
        corpus.chunks.sort_by(|a, b| a.id.cmp(&b.id));
    }

    pub fn set_embedding(&self, chunk_id: &str, embedding: Vec<f32>) {
        let mut corpus = self.corpus.write();
        if let Some(c) = corpus.chunks.iter_mut().find(|c| c.id == chunk_id) {
            c.embedding = Some(Arc::from(embedding));
        }
    }

    pub fn add_concepts(&self, chunk_id: &str, concepts: Vec<ConceptNode>) {
        self.corpus
            .write()
            .concepts
            .entry(chunk_id.to_string())
            .or_default()
            .extend(concepts);
    }

    pub fn add_edge(&self, edge: ConceptEdge) {
        self.corpus.write().edges.push(edge);
    }

    pub fn len(&self) -> usize {
        self.corpus.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    tokenize(haystack).into_iter().any(|t| t == word)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl CorpusStore for InMemoryCorpus {
    async fn search_exact(&self, text: &str, scope: &Scope, limit: usize) -> Result<Vec<CandidateChunk>, StoreError> {
        let phrase = normalize(text);
        if phrase.is_empty() {
            return Ok(vec![]);
        }
        let tokens = tokenize(&phrase);
        let corpus = self.corpus.read();
        Ok(corpus
            .chunks
            .iter()
            .filter(|c| scope.matches(c))
            .filter(|c| {
                let body = normalize(&c.text);
                body.contains(&phrase) || tokens.iter().any(|t| contains_word(&body, t))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_lemma(
        &self,
        lemmas: &[String],
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<CandidateChunk>, StoreError> {
        let corpus = self.corpus.read();
        Ok(corpus
            .chunks
            .iter()
            .filter(|c| scope.matches(c))
            .filter(|c| {
                let variants = lemma_variants(&c.text);
                lemmas.iter().any(|l| variants.contains(l))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn vector_search(&self, embedding: &[f32], scope: &Scope, k: usize) -> Result<Vec<VectorHit>, StoreError> {
        let corpus = self.corpus.read();
        let mut hits: Vec<VectorHit> = corpus
            .chunks
            .iter()
            .filter(|c| scope.matches(c))
            .filter_map(|c| {
                let stored = c.embedding.as_ref()?;
                Some(VectorHit {
                    chunk: c.clone(),
                    similarity: cosine(embedding, stored),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn get_concepts_for_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkConcepts>, StoreError> {
        let corpus = self.corpus.read();
        Ok(chunk_ids
            .iter()
            .filter_map(|id| {
                corpus.concepts.get(id).map(|concepts| ChunkConcepts {
                    chunk_id: id.clone(),
                    concepts: concepts.clone(),
                })
            })
            .collect())
    }

    async fn get_relations(
        &self,
        concept_ids: &[String],
        max_per_node: usize,
    ) -> Result<Vec<ConceptEdge>, StoreError> {
        let corpus = self.corpus.read();
        let mut out = Vec::new();
        for id in concept_ids {
            let mut edges: Vec<&ConceptEdge> = corpus.edges.iter().filter(|e| &e.source_id == id).collect();
            edges.sort_by(|a, b| {
                b.weight
                    .total_cmp(&a.weight)
                    .then_with(|| a.target_id.cmp(&b.target_id))
            });
            out.extend(edges.into_iter().take(max_per_node).cloned());
        }
        Ok(out)
    }
}

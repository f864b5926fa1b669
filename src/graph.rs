//! Concept-graph bridges for the top fused candidates
//!
//! Bridges are auxiliary context: they never enter the ranked list. Every
//! cap that drops data is reported as a `Degradation`.

use crate::config::GraphConfig;
use crate::error::StoreError;
use crate::store::CorpusStore;
use crate::types::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub bridges: Vec<Bridge>,
    pub degradations: Vec<Degradation>,
}

impl Enrichment {
    fn unavailable(reason: String) -> Self {
        Self {
            bridges: Vec::new(),
            degradations: vec![Degradation::GraphUnavailable { reason }],
        }
    }
}

pub struct GraphEnricher {
    store: Arc<dyn CorpusStore>,
    config: GraphConfig,
}

impl GraphEnricher {
    pub fn new(store: Arc<dyn CorpusStore>, config: GraphConfig) -> Self {
        Self { store, config }
    }

    /// Never fails: store errors and timeouts become `GraphUnavailable`
    pub async fn enrich(&self, items: &[FusedItem]) -> Enrichment {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.collect(items)).await {
            Ok(Ok(enrichment)) => enrichment,
            Ok(Err(e)) => {
                warn!("Graph enrichment skipped: {}", e);
                Enrichment::unavailable(e.to_string())
            }
            Err(_) => {
                warn!("Graph enrichment timed out after {}ms", timeout.as_millis());
                Enrichment::unavailable(format!("timed out after {}ms", timeout.as_millis()))
            }
        }
    }

    async fn collect(&self, items: &[FusedItem]) -> Result<Enrichment, StoreError> {
        let chunk_ids: Vec<String> = items
            .iter()
            .take(self.config.top_candidates)
            .map(|i| i.chunk.id.clone())
            .collect();
        if chunk_ids.is_empty() {
            return Ok(Enrichment::default());
        }

        let mut degradations = Vec::new();
        let concepts = self.retain_concepts(
            self.store.get_concepts_for_chunks(&chunk_ids).await?,
            &mut degradations,
        );
        if concepts.is_empty() {
            return Ok(Enrichment {
                bridges: Vec::new(),
                degradations,
            });
        }

        let concept_ids: Vec<String> = concepts.iter().map(|c| c.id.clone()).collect();
        let edges = self
            .store
            .get_relations(&concept_ids, self.config.max_edges_per_concept)
            .await?;

        let bridges = self.build_bridges(&concepts, edges, &mut degradations);
        debug!(
            "Graph enrichment: {} concepts, {} bridges, {} degradations",
            concepts.len(),
            bridges.len(),
            degradations.len()
        );
        Ok(Enrichment { bridges, degradations })
    }

    /// Dedupe by id keeping the highest relevance, order by relevance then id, cap
    fn retain_concepts(&self, per_chunk: Vec<ChunkConcepts>, degradations: &mut Vec<Degradation>) -> Vec<ConceptNode> {
        let mut unique: BTreeMap<String, ConceptNode> = BTreeMap::new();
        for concept in per_chunk.into_iter().flat_map(|c| c.concepts) {
            match unique.get_mut(&concept.id) {
                Some(existing) if existing.relevance >= concept.relevance => {}
                Some(existing) => *existing = concept,
                None => {
                    unique.insert(concept.id.clone(), concept);
                }
            }
        }

        let mut concepts: Vec<ConceptNode> = unique.into_values().collect();
        concepts.sort_by(|a, b| b.relevance.total_cmp(&a.relevance).then_with(|| a.id.cmp(&b.id)));

        let max = self.config.max_concepts;
        if concepts.len() > max {
            let dropped = concepts.len() - max;
            warn!("Concept set truncated: kept {}, dropped {}", max, dropped);
            degradations.push(Degradation::ConceptsTruncated { kept: max, dropped });
            concepts.truncate(max);
        }
        concepts
    }

    fn build_bridges(
        &self,
        concepts: &[ConceptNode],
        edges: Vec<ConceptEdge>,
        degradations: &mut Vec<Degradation>,
    ) -> Vec<Bridge> {
        let mut by_source: HashMap<String, Vec<ConceptEdge>> = HashMap::new();
        for edge in edges {
            by_source.entry(edge.source_id.clone()).or_default().push(edge);
        }

        let max_edges = self.config.max_edges_per_concept;
        let max_chars = self.config.max_bridge_chars;
        let mut used_chars = 0usize;
        let mut bridges = Vec::new();
        let mut text_dropped = 0usize;

        for concept in concepts {
            let Some(mut outgoing) = by_source.remove(&concept.id) else {
                continue;
            };
            outgoing.sort_by(|a, b| {
                b.weight
                    .total_cmp(&a.weight)
                    .then_with(|| a.target_id.cmp(&b.target_id))
            });
            // The store is asked for at most `max_edges` per node but is not trusted to honour it
            if outgoing.len() > max_edges {
                let dropped = outgoing.len() - max_edges;
                degradations.push(Degradation::RelationsTruncated {
                    concept_id: concept.id.clone(),
                    kept: max_edges,
                    dropped,
                });
                outgoing.truncate(max_edges);
            }

            for edge in outgoing {
                let text = format!("{} -[{}]-> {}", concept.label, edge.relation, edge.target_label);
                let len = text.chars().count();
                if used_chars + len > max_chars {
                    text_dropped += 1;
                    continue;
                }
                used_chars += len;
                bridges.push(Bridge {
                    source_id: concept.id.clone(),
                    source_label: concept.label.clone(),
                    relation: edge.relation,
                    target_id: edge.target_id,
                    target_label: edge.target_label,
                    weight: edge.weight,
                    text,
                });
            }
        }

        if text_dropped > 0 {
            warn!(
                "Bridge text capped at {} chars: kept {}, dropped {}",
                max_chars,
                bridges.len(),
                text_dropped
            );
            degradations.push(Degradation::BridgeTextTruncated {
                kept: bridges.len(),
                dropped: text_dropped,
            });
        }
        bridges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_store::{chunk, InMemoryCorpus};
    use crate::store::VectorHit;
    use async_trait::async_trait;
    use std::time::Duration;

    fn fused(id: &str) -> FusedItem {
        FusedItem {
            chunk: chunk(id, "d", "text"),
            score: 0.1,
            provenance: vec![],
        }
    }

    fn concept(id: &str, relevance: f32) -> ConceptNode {
        ConceptNode {
            id: id.to_string(),
            label: id.to_uppercase(),
            relevance,
        }
    }

    fn edge(source: &str, target: &str, weight: f32) -> ConceptEdge {
        ConceptEdge {
            source_id: source.to_string(),
            target_id: target.to_string(),
            target_label: target.to_uppercase(),
            relation: "related_to".to_string(),
            weight,
        }
    }

    fn config() -> GraphConfig {
        GraphConfig {
            max_concepts: 2,
            max_edges_per_concept: 2,
            ..GraphConfig::default()
        }
    }

    #[tokio::test]
    async fn test_concept_cap_is_reported() {
        let corpus = Arc::new(InMemoryCorpus::new());
        corpus.add_concepts("c1", vec![concept("k1", 0.9), concept("k2", 0.5)]);
        corpus.add_concepts("c2", vec![concept("k3", 0.7), concept("k2", 0.95)]);
        corpus.add_edge(edge("k2", "t1", 0.5));
        corpus.add_edge(edge("k1", "t2", 0.9));
        corpus.add_edge(edge("k3", "t3", 0.9));

        let enricher = GraphEnricher::new(corpus, config());
        let out = enricher.enrich(&[fused("c1"), fused("c2")]).await;

        assert_eq!(
            out.degradations,
            vec![Degradation::ConceptsTruncated { kept: 2, dropped: 1 }]
        );
        // k2 (0.95) then k1 (0.9); k3 is dropped along with its edge
        let sources: Vec<&str> = out.bridges.iter().map(|b| b.source_id.as_str()).collect();
        assert_eq!(sources, vec!["k2", "k1"]);
        assert_eq!(out.bridges[0].text, "K2 -[related_to]-> T1");
    }

    /// Returns every edge regardless of the per-node cap
    struct GreedyGraph;

    #[async_trait]
    impl CorpusStore for GreedyGraph {
        async fn search_exact(&self, _: &str, _: &Scope, _: usize) -> Result<Vec<CandidateChunk>, StoreError> {
            Ok(vec![])
        }
        async fn search_lemma(&self, _: &[String], _: &Scope, _: usize) -> Result<Vec<CandidateChunk>, StoreError> {
            Ok(vec![])
        }
        async fn vector_search(&self, _: &[f32], _: &Scope, _: usize) -> Result<Vec<VectorHit>, StoreError> {
            Ok(vec![])
        }
        async fn get_concepts_for_chunks(&self, ids: &[String]) -> Result<Vec<ChunkConcepts>, StoreError> {
            Ok(vec![ChunkConcepts {
                chunk_id: ids[0].clone(),
                concepts: vec![concept("k1", 1.0)],
            }])
        }
        async fn get_relations(&self, _: &[String], _: usize) -> Result<Vec<ConceptEdge>, StoreError> {
            Ok((0..5).map(|i| edge("k1", &format!("t{}", i), i as f32)).collect())
        }
    }

    #[tokio::test]
    async fn test_edge_cap_enforced_locally() {
        let enricher = GraphEnricher::new(Arc::new(GreedyGraph), config());
        let out = enricher.enrich(&[fused("c1")]).await;
        let targets: Vec<&str> = out.bridges.iter().map(|b| b.target_id.as_str()).collect();
        assert_eq!(targets, vec!["t4", "t3"]);
        assert_eq!(
            out.degradations,
            vec![Degradation::RelationsTruncated {
                concept_id: "k1".into(),
                kept: 2,
                dropped: 3
            }]
        );
    }

    #[tokio::test]
    async fn test_bridge_text_cap() {
        let corpus = Arc::new(InMemoryCorpus::new());
        corpus.add_concepts("c1", vec![concept("k1", 1.0)]);
        corpus.add_edge(edge("k1", "alpha", 0.9));
        corpus.add_edge(edge("k1", "beta", 0.8));
        let config = GraphConfig {
            // "K1 -[related_to]-> ALPHA" is 24 chars
            max_bridge_chars: 30,
            ..GraphConfig::default()
        };
        let out = GraphEnricher::new(corpus, config).enrich(&[fused("c1")]).await;
        assert_eq!(out.bridges.len(), 1);
        assert_eq!(
            out.degradations,
            vec![Degradation::BridgeTextTruncated { kept: 1, dropped: 1 }]
        );
    }

    struct SlowGraph;

    #[async_trait]
    impl CorpusStore for SlowGraph {
        async fn search_exact(&self, _: &str, _: &Scope, _: usize) -> Result<Vec<CandidateChunk>, StoreError> {
            Ok(vec![])
        }
        async fn search_lemma(&self, _: &[String], _: &Scope, _: usize) -> Result<Vec<CandidateChunk>, StoreError> {
            Ok(vec![])
        }
        async fn vector_search(&self, _: &[f32], _: &Scope, _: usize) -> Result<Vec<VectorHit>, StoreError> {
            Ok(vec![])
        }
        async fn get_concepts_for_chunks(&self, _: &[String]) -> Result<Vec<ChunkConcepts>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }
        async fn get_relations(&self, _: &[String], _: usize) -> Result<Vec<ConceptEdge>, StoreError> {
            Err(StoreError::Backend("graph offline".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_instead_of_failing() {
        let out = GraphEnricher::new(Arc::new(SlowGraph), GraphConfig::default())
            .enrich(&[fused("c1")])
            .await;
        assert!(out.bridges.is_empty());
        assert!(matches!(out.degradations[0], Degradation::GraphUnavailable { .. }));
    }
}

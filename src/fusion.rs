//! Weighted Reciprocal Rank Fusion over per-strategy ranked lists
//!
//! ```text
//! score(d) = Σ weight_s / (offset + rank_s(d))
//! ```
//!
//! `rank_s(d)` is the 1-indexed position of `d` in strategy `s`'s list; a
//! chunk absent from a list contributes nothing for it. Lists are visited in
//! `StrategyKind` order and accumulated into ordered maps, so the output is
//! a pure function of the inputs.

use crate::types::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub struct RankFusionEngine {
    offset: f64,
}

impl Default for RankFusionEngine {
    fn default() -> Self {
        Self::new(60.0)
    }
}

impl RankFusionEngine {
    pub fn new(offset: f64) -> Self {
        Self {
            offset: offset.max(0.0),
        }
    }

    /// Fuse ranked lists into at most `limit` items with provenance.
    ///
    /// Each list must already be in rank order. Strategies missing from
    /// `weights` count with weight 1.0; non-positive weights drop the list.
    pub fn fuse(
        &self,
        lists: &BTreeMap<StrategyKind, Vec<StrategyHit>>,
        weights: &BTreeMap<StrategyKind, f32>,
        limit: usize,
    ) -> Vec<FusedItem> {
        let mut fused: BTreeMap<&str, FusedItem> = BTreeMap::new();

        for (strategy, hits) in lists {
            let weight = f64::from(weights.get(strategy).copied().unwrap_or(1.0));
            if weight <= 0.0 {
                continue;
            }
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            let mut rank = 0usize;
            for hit in hits {
                if !seen.insert(hit.chunk.id.as_str()) {
                    continue;
                }
                rank += 1;
                let contribution = weight / (self.offset + rank as f64);
                let item = fused.entry(hit.chunk.id.as_str()).or_insert_with(|| FusedItem {
                    chunk: hit.chunk.clone(),
                    score: 0.0,
                    provenance: Vec::new(),
                });
                item.score += contribution;
                item.provenance.push(Contribution {
                    strategy: *strategy,
                    rank,
                    raw_score: hit.score,
                });
            }
        }

        let total = fused.len();
        let mut items: Vec<FusedItem> = fused.into_values().collect();
        items.sort_by(compare_fused);
        items.truncate(limit);
        debug!("Fused {} lists into {} items (kept {})", lists.len(), total, items.len());
        items
    }
}

/// Score descending, then best single-strategy raw score descending, then chunk id
pub fn compare_fused(a: &FusedItem, b: &FusedItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.best_raw_score().total_cmp(&a.best_raw_score()))
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_store::chunk;

    fn list(ids: &[&str]) -> Vec<StrategyHit> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| StrategyHit {
                chunk: chunk(id, "d", id),
                score: 1.0 - i as f32 * 0.1,
            })
            .collect()
    }

    fn ids(items: &[FusedItem]) -> Vec<&str> {
        items.iter().map(|i| i.chunk.id.as_str()).collect()
    }

    fn equal_weights() -> BTreeMap<StrategyKind, f32> {
        BTreeMap::from([(StrategyKind::Exact, 1.0), (StrategyKind::Semantic, 1.0)])
    }

    #[test]
    fn test_fusion_is_deterministic() {
        let lists = BTreeMap::from([
            (StrategyKind::Exact, list(&["c", "a", "b", "e"])),
            (StrategyKind::Lemma, list(&["a", "d", "c"])),
            (StrategyKind::Semantic, list(&["e", "d", "a", "f"])),
        ]);
        let weights = BTreeMap::from([
            (StrategyKind::Exact, 1.5),
            (StrategyKind::Lemma, 1.0),
            (StrategyKind::Semantic, 0.6),
        ]);
        let engine = RankFusionEngine::default();
        let first = serde_json::to_string(&engine.fuse(&lists, &weights, 10)).unwrap();
        for _ in 0..20 {
            let again = serde_json::to_string(&engine.fuse(&lists, &weights, 10)).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_rank_one_beats_lower_ranks_for_disjoint_lists() {
        let lists = BTreeMap::from([
            (StrategyKind::Exact, list(&["a1", "a2", "a3"])),
            (StrategyKind::Semantic, list(&["b1", "b2", "b3"])),
        ]);
        let fused = RankFusionEngine::default().fuse(&lists, &equal_weights(), 10);
        let order = ids(&fused);
        assert_eq!(&order[..2], &["a1", "b1"]);
        for top in ["a1", "b1"] {
            let top_pos = order.iter().position(|id| *id == top).unwrap();
            for lower in ["a2", "a3", "b2", "b3"] {
                assert!(top_pos < order.iter().position(|id| *id == lower).unwrap());
            }
        }
    }

    #[test]
    fn test_agreement_across_lists_wins() {
        let lists = BTreeMap::from([
            (StrategyKind::Exact, list(&["x", "shared"])),
            (StrategyKind::Semantic, list(&["y", "shared"])),
        ]);
        let fused = RankFusionEngine::default().fuse(&lists, &equal_weights(), 10);
        assert_eq!(fused[0].chunk.id, "shared");
        assert_eq!(fused[0].provenance.len(), 2);
        assert_eq!(fused[0].provenance[0].rank, 2);
    }

    #[test]
    fn test_ties_break_on_raw_score_then_id() {
        let mut exact = list(&["b"]);
        exact[0].score = 0.4;
        let mut semantic = list(&["a"]);
        semantic[0].score = 0.9;
        let lists = BTreeMap::from([(StrategyKind::Exact, exact), (StrategyKind::Semantic, semantic)]);
        let fused = RankFusionEngine::default().fuse(&lists, &equal_weights(), 10);
        assert_eq!(ids(&fused), vec!["a", "b"]);

        let lists = BTreeMap::from([
            (StrategyKind::Exact, list(&["b"])),
            (StrategyKind::Semantic, list(&["a"])),
        ]);
        let fused = RankFusionEngine::default().fuse(&lists, &equal_weights(), 10);
        assert_eq!(ids(&fused), vec!["a", "b"]);
    }

    #[test]
    fn test_weights_and_limit() {
        let lists = BTreeMap::from([
            (StrategyKind::Exact, list(&["lexical"])),
            (StrategyKind::Semantic, list(&["semantic", "other"])),
        ]);
        let weights = BTreeMap::from([(StrategyKind::Exact, 1.5), (StrategyKind::Semantic, 0.6)]);
        let fused = RankFusionEngine::default().fuse(&lists, &weights, 2);
        assert_eq!(ids(&fused), vec!["lexical", "semantic"]);

        let weights = BTreeMap::from([(StrategyKind::Exact, 0.0), (StrategyKind::Semantic, 1.0)]);
        let fused = RankFusionEngine::default().fuse(&lists, &weights, 10);
        assert_eq!(ids(&fused), vec!["semantic", "other"]);
    }

    #[test]
    fn test_duplicate_hits_in_one_list_count_once() {
        let lists = BTreeMap::from([(StrategyKind::Exact, list(&["a", "a", "b"]))]);
        let fused = RankFusionEngine::default().fuse(&lists, &BTreeMap::new(), 10);
        assert_eq!(fused[0].provenance.len(), 1);
        assert_eq!(fused[1].provenance[0].rank, 2);
    }
}

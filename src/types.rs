//! Core type definitions for search and answer synthesis

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Language detected for a query or a chunk
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    English,
    Turkish,
    Unknown,
}

/// Classified purpose of a query
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Direct,
    Synthesis,
    FollowUp,
    Comparative,
    CitationSeeking,
    Analytic,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Direct => "direct",
            Intent::Synthesis => "synthesis",
            Intent::FollowUp => "follow_up",
            Intent::Comparative => "comparative",
            Intent::CitationSeeking => "citation_seeking",
            Intent::Analytic => "analytic",
        }
    }

    /// Parse a label as produced by the LLM classifier (case/punctuation tolerant)
    pub fn parse_label(label: &str) -> Option<Intent> {
        let cleaned: String = label
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .filter(|c| c.is_ascii_alphabetic() || *c == '_')
            .collect();
        match cleaned.as_str() {
            "direct" => Some(Intent::Direct),
            "synthesis" => Some(Intent::Synthesis),
            "follow_up" | "followup" => Some(Intent::FollowUp),
            "comparative" => Some(Intent::Comparative),
            "citation_seeking" | "citation" => Some(Intent::CitationSeeking),
            "analytic" | "analytical" => Some(Intent::Analytic),
            _ => None,
        }
    }
}

/// Retrieval strategies the router can select
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Exact,
    Lemma,
    Semantic,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [StrategyKind::Exact, StrategyKind::Lemma, StrategyKind::Semantic];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Exact => "exact",
            StrategyKind::Lemma => "lemma",
            StrategyKind::Semantic => "semantic",
        }
    }
}

/// Kind of document a chunk was cut from
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Book,
    Highlight,
    Note,
}

/// Per-request restriction of the searchable corpus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub user_id: String,
    /// Restrict to these documents (None = whole corpus)
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    /// Restrict to these source types (empty = all)
    #[serde(default)]
    pub source_types: Vec<SourceType>,
}

impl Scope {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, chunk: &CandidateChunk) -> bool {
        if let Some(ref ids) = self.document_ids {
            if !ids.iter().any(|id| id == &chunk.document_id) {
                return false;
            }
        }
        self.source_types.is_empty() || self.source_types.contains(&chunk.source_type)
    }

    /// Stable textual form used in cache keys
    pub fn fingerprint(&self) -> String {
        let docs = match &self.document_ids {
            None => "*".to_string(),
            Some(ids) => {
                let mut ids = ids.clone();
                ids.sort();
                format!("{:?}", ids)
            }
        };
        let mut types: Vec<&str> = self
            .source_types
            .iter()
            .map(|t| match t {
                SourceType::Book => "book",
                SourceType::Highlight => "highlight",
                SourceType::Note => "note",
            })
            .collect();
        types.sort();
        format!("docs={};types={}", docs, types.join(","))
    }
}

/// Conversation context supplied by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryContext {
    /// True when the query continues an earlier exchange
    #[serde(default)]
    pub has_history: bool,
}

/// A query as seen by the retrieval layer
#[derive(Debug, Clone)]
pub struct Query {
    pub raw: String,
    pub normalized: String,
    pub language: Language,
    pub intent: Intent,
}

/// Retrievable unit of the corpus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateChunk {
    pub id: String,
    pub document_id: String,
    #[serde(default)]
    pub document_title: Option<String>,
    pub text: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub page: Option<u32>,
    /// Precomputed embedding owned by the corpus store
    #[serde(skip)]
    pub embedding: Option<Arc<[f32]>>,
}

/// A chunk scored by a single strategy
#[derive(Debug, Clone)]
pub struct StrategyHit {
    pub chunk: CandidateChunk,
    pub score: f32,
}

/// Sort hits by score descending, chunk id ascending on ties
pub fn sort_hits(hits: &mut [StrategyHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

/// One strategy's contribution to a fused item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub strategy: StrategyKind,
    /// 1-based rank within that strategy's list
    pub rank: usize,
    pub raw_score: f32,
}

/// Ranked item after fusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedItem {
    pub chunk: CandidateChunk,
    pub score: f64,
    pub provenance: Vec<Contribution>,
}

impl FusedItem {
    pub fn best_raw_score(&self) -> f32 {
        self.provenance
            .iter()
            .map(|c| c.raw_score)
            .fold(f32::MIN, f32::max)
    }
}

/// Concept attached to chunks in the external concept graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub id: String,
    pub label: String,
    pub relevance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConcepts {
    pub chunk_id: String,
    pub concepts: Vec<ConceptNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptEdge {
    pub source_id: String,
    pub target_id: String,
    pub target_label: String,
    pub relation: String,
    pub weight: f32,
}

/// Auxiliary concept-relation fact surfaced next to the ranked evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bridge {
    pub source_id: String,
    pub source_label: String,
    pub relation: String,
    pub target_id: String,
    pub target_label: String,
    pub weight: f32,
    pub text: String,
}

/// Explicit record of anything that made a response less complete than normal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    StrategyTimedOut { strategy: StrategyKind },
    StrategyFailed { strategy: StrategyKind, error: String },
    StrategyUnavailable { strategy: StrategyKind, reason: String },
    DeadlineExceeded { pending: Vec<StrategyKind> },
    ParaphraseSkipped { reason: String },
    ClassifierFallback { reason: String },
    ConceptsTruncated { kept: usize, dropped: usize },
    RelationsTruncated { concept_id: String, kept: usize, dropped: usize },
    BridgeTextTruncated { kept: usize, dropped: usize },
    GraphUnavailable { reason: String },
    JudgeUnavailable { reason: String },
}

impl Degradation {
    /// True when the degradation removed a whole retrieval path
    pub fn is_strategy_loss(&self) -> bool {
        matches!(
            self,
            Degradation::StrategyTimedOut { .. }
                | Degradation::StrategyFailed { .. }
                | Degradation::StrategyUnavailable { .. }
                | Degradation::DeadlineExceeded { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub routing_ms: u64,
    pub retrieval_ms: u64,
    pub fusion_ms: u64,
    pub enrichment_ms: u64,
    pub total_ms: u64,
    pub per_strategy_ms: BTreeMap<StrategyKind, u64>,
}

/// Observability metadata attached to every search response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub intent: Intent,
    pub router_reason: String,
    pub confidence: f32,
    pub language: Language,
    pub strategies: Vec<StrategyKind>,
    pub weights: BTreeMap<StrategyKind, f32>,
    pub graph_enriched: bool,
    pub degraded: bool,
    pub degradations: Vec<Degradation>,
    pub cache_hit: bool,
    pub timings: StageTimings,
}

impl SearchMetadata {
    /// No retrieval path or graph lookup was lost; truncation notes don't count
    pub fn is_complete(&self) -> bool {
        !self
            .degradations
            .iter()
            .any(|d| d.is_strategy_loss() || matches!(d, Degradation::GraphUnavailable { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub items: Vec<FusedItem>,
    pub bridges: Vec<Bridge>,
    pub metadata: SearchMetadata,
}

/// Frozen evidence passed into the answer loop
#[derive(Debug, Clone)]
pub struct EvidenceSet {
    pub chunks: Arc<[FusedItem]>,
    pub bridges: Arc<[Bridge]>,
}

impl EvidenceSet {
    pub fn new(chunks: Vec<FusedItem>, bridges: Vec<Bridge>) -> Self {
        Self {
            chunks: chunks.into(),
            bridges: bridges.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    Short,
    LongForm,
}

impl AnswerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerMode::Short => "short",
            AnswerMode::LongForm => "long_form",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Regenerate,
    Decline,
}

/// Judge output for one draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    #[serde(default)]
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based evidence index as shown to the generator
    pub index: usize,
    pub chunk_id: String,
    pub document_id: String,
    #[serde(default)]
    pub page: Option<u32>,
}

/// Generator output for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub text: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerAttempt {
    pub number: usize,
    pub draft: Draft,
    pub verdict: Option<Verdict>,
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    NoEvidence,
    RubricUnsatisfiable,
    Declined,
    AttemptsExhausted,
    BudgetExceeded,
    GeneratorUnavailable,
}

/// How the answer loop ended
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Passed,
    FastTracked,
    Unverified,
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub mode: AnswerMode,
    pub attempts: usize,
    pub final_verdict: Option<Verdict>,
    pub outcome: AnswerOutcome,
    pub evaluated: bool,
    pub degradations: Vec<Degradation>,
    pub cache_hit: bool,
    pub elapsed_ms: u64,
    pub search: SearchMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub metadata: AnswerMetadata,
}

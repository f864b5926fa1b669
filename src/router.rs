//! Intent classification, strategy selection and fusion weights

use crate::cache::{classifier_key, ResultCache};
use crate::config::ModelVersions;
use crate::llm::{LlmClient, LlmRequest};
use crate::text::{is_stopword, normalize_for, tokenize};
use crate::types::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ANALYTIC_CUES: &[&str] = &[
    "how many", "how often", "count", "number of", "list all", "statistics", "most frequent",
    "kaç", "kaç tane", "sayısı", "listele", "istatistik", "en çok",
];

const CITATION_CUES: &[&str] = &[
    "quote", "quotes", "which page", "what page", "where does it say", "cite", "citation", "exact words",
    "alıntı", "hangi sayfa", "nerede geçiyor", "kaynak", "sayfa kaç",
];

const COMPARATIVE_CUES: &[&str] = &[
    "compare", "comparison", "difference between", "differences between", "vs", "versus", "contrast",
    "karşılaştır", "karşılaştırma", "farkı", "arasındaki fark", "kıyasla",
];

const FOLLOW_UP_LEADS: &[&str] = &[
    "and", "also", "what about", "how about", "then", "so", "but", "tell me more", "more", "what else",
    "peki", "ya", "bunun", "onun", "o zaman", "başka", "daha fazla", "bir de",
];

const SYNTHESIS_CUES: &[&str] = &[
    "summarize", "summary", "overview", "explain", "why", "themes", "theme", "main ideas", "what does the author",
    "özetle", "özet", "açıkla", "neden", "ana fikir", "tema", "yazar ne",
];

/// Queries with at most this many tokens read as lookups
const SHORT_QUERY_TOKENS: usize = 4;

/// Everything downstream stages need from routing
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub intent: Intent,
    pub confidence: f32,
    pub language: Language,
    pub strategies: Vec<StrategyKind>,
    pub weights: BTreeMap<StrategyKind, f32>,
    pub skip_graph: bool,
    /// Quoted phrase to search for instead of the whole query
    pub focus: Option<String>,
    pub reason: String,
    pub degradations: Vec<Degradation>,
}

/// Rule verdict before strategy planning
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub intent: Intent,
    pub confidence: f32,
    pub reason: String,
}

fn rule(intent: Intent, confidence: f32, reason: impl Into<String>) -> RuleMatch {
    RuleMatch {
        intent,
        confidence,
        reason: reason.into(),
    }
}

fn find_cue<'a>(padded: &str, cues: &[&'a str]) -> Option<&'a str> {
    cues.iter().copied().find(|cue| padded.contains(&format!(" {} ", cue)))
}

fn leading_cue<'a>(padded: &str, cues: &[&'a str]) -> Option<&'a str> {
    cues.iter().copied().find(|cue| padded.starts_with(&format!(" {} ", cue)))
}

/// Text between the first pair of straight, curly or angle quotes
pub fn quoted_phrase(raw: &str) -> Option<&str> {
    // Apostrophes are not quotes: Turkish uses them for suffixes ("Ankara'da")
    for (open, close) in [('"', '"'), ('“', '”'), ('«', '»')] {
        let Some(start) = raw.find(open) else { continue };
        let rest = &raw[start + open.len_utf8()..];
        if let Some(end) = rest.find(close) {
            let inner = rest[..end].trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }
    None
}

/// Rule-based classification over the normalized query
pub fn classify_rules(raw: &str, normalized: &str, language: Language, context: &QueryContext) -> RuleMatch {
    let padded = format!(" {} ", normalized);

    if let Some(cue) = find_cue(&padded, ANALYTIC_CUES) {
        return rule(Intent::Analytic, 0.9, format!("analytic cue '{}'", cue));
    }
    if quoted_phrase(raw).is_some() {
        return rule(Intent::CitationSeeking, 0.95, "quoted phrase");
    }
    if context.has_history {
        if let Some(cue) = leading_cue(&padded, FOLLOW_UP_LEADS) {
            return rule(Intent::FollowUp, 0.85, format!("follow-up lead '{}'", cue));
        }
    }
    if let Some(cue) = find_cue(&padded, CITATION_CUES) {
        return rule(Intent::CitationSeeking, 0.8, format!("citation cue '{}'", cue));
    }
    if let Some(cue) = find_cue(&padded, COMPARATIVE_CUES) {
        return rule(Intent::Comparative, 0.85, format!("comparative cue '{}'", cue));
    }
    if let Some(cue) = find_cue(&padded, SYNTHESIS_CUES) {
        return rule(Intent::Synthesis, 0.8, format!("synthesis cue '{}'", cue));
    }

    let tokens = tokenize(normalized);
    if context.has_history && tokens.len() <= SHORT_QUERY_TOKENS {
        return rule(Intent::FollowUp, 0.65, "short query continuing a conversation");
    }
    let content = tokens.iter().filter(|t| !is_stopword(t, language)).count();
    if !tokens.is_empty() && tokens.len() <= SHORT_QUERY_TOKENS && content <= 3 {
        return rule(Intent::Direct, 0.7, format!("short lookup ({} tokens)", tokens.len()));
    }
    rule(Intent::Synthesis, 0.5, "no strong cue, defaulting to synthesis")
}

/// Strategy set, fusion weights and graph gating for an intent
pub fn plan(intent: Intent, confidence: f32, quoted: bool) -> (Vec<StrategyKind>, BTreeMap<StrategyKind, f32>, bool) {
    use StrategyKind::*;
    let (exact, lemma, semantic) = match intent {
        Intent::Direct => (1.5, 1.0, 0.6),
        Intent::CitationSeeking => (1.6, 1.0, 0.5),
        Intent::Synthesis => (0.6, 1.0, 1.4),
        Intent::Comparative => (0.8, 1.0, 1.2),
        Intent::FollowUp => (0.8, 1.0, 1.2),
        Intent::Analytic => (1.0, 1.2, 0.8),
    };
    let mut weights = BTreeMap::from([(Exact, exact), (Lemma, lemma), (Semantic, semantic)]);

    // A confidently quoted lookup is answered lexically
    if intent == Intent::CitationSeeking && quoted && confidence >= 0.9 {
        weights.remove(&Semantic);
    }
    let skip_graph = matches!(intent, Intent::FollowUp | Intent::CitationSeeking);
    (weights.keys().copied().collect(), weights, skip_graph)
}

/// Optional LLM fallback for low-confidence rule verdicts
pub struct LlmClassifier {
    pub llm: Arc<LlmClient>,
    pub cache: Arc<ResultCache>,
    pub models: ModelVersions,
    pub cache_ttl: Duration,
    pub timeout: Duration,
}

const CLASSIFIER_SYSTEM: &str = "Classify the user's query about their personal library. \
Reply with exactly one label: direct, synthesis, follow_up, comparative, citation_seeking, analytic.";

impl LlmClassifier {
    async fn classify(&self, raw: &str, normalized: &str, context: &QueryContext) -> Result<Intent, String> {
        let key = classifier_key(normalized, context.has_history, &self.models).render();
        if let Some(label) = self.cache.get(&key).await {
            if let Some(intent) = Intent::parse_label(&label) {
                debug!("Classifier cache hit: {}", label);
                return Ok(intent);
            }
        }

        let request = LlmRequest::new(
            CLASSIFIER_SYSTEM,
            format!(
                "Conversation history: {}\nQuery: {}",
                if context.has_history { "yes" } else { "no" },
                raw
            ),
        )
        .max_tokens(8);
        let reply = self
            .llm
            .complete_within(&request, self.timeout)
            .await
            .map_err(|e| e.to_string())?;
        let label = reply.lines().next().unwrap_or_default();
        let intent = Intent::parse_label(label).ok_or_else(|| format!("unrecognised label '{}'", label.trim()))?;
        self.cache.set(&key, intent.as_str().to_string(), self.cache_ttl).await;
        Ok(intent)
    }
}

pub struct SemanticRouter {
    llm_threshold: f32,
    classifier: Option<LlmClassifier>,
}

impl SemanticRouter {
    pub fn new(llm_threshold: f32) -> Self {
        Self {
            llm_threshold,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: LlmClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub async fn route(&self, raw: &str, language: Language, context: &QueryContext) -> RoutingDecision {
        let normalized = normalize_for(raw, language);
        let mut verdict = classify_rules(raw, &normalized, language, context);
        let mut degradations = Vec::new();

        if verdict.confidence < self.llm_threshold {
            if let Some(classifier) = &self.classifier {
                match classifier.classify(raw, &normalized, context).await {
                    Ok(intent) => {
                        verdict = rule(
                            intent,
                            verdict.confidence.max(0.75),
                            format!("llm classifier ({}; rules said: {})", intent.as_str(), verdict.reason),
                        );
                    }
                    Err(reason) => {
                        warn!("LLM classifier unavailable, keeping rule verdict: {}", reason);
                        degradations.push(Degradation::ClassifierFallback { reason });
                    }
                }
            }
        }

        let focus = match verdict.intent {
            Intent::CitationSeeking => quoted_phrase(raw)
                .map(|p| normalize_for(p, language))
                .filter(|p| !p.is_empty()),
            _ => None,
        };
        let (strategies, weights, skip_graph) = plan(verdict.intent, verdict.confidence, focus.is_some());

        info!(
            "Routed '{}' as {} ({:.2}): {}",
            normalized,
            verdict.intent.as_str(),
            verdict.confidence,
            verdict.reason
        );

        RoutingDecision {
            intent: verdict.intent,
            confidence: verdict.confidence,
            language,
            strategies,
            weights,
            skip_graph,
            focus,
            reason: verdict.reason,
            degradations,
        }
    }
}

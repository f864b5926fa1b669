//! Generator and judge roles of the answer loop

use crate::error::ProviderError;
use crate::llm::{extract_json_object, LlmClient, LlmRequest, LLM_SERVICE};
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Evidence attribute a rubric can demand of citations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceField {
    PageNumber,
    DocumentTitle,
}

impl EvidenceField {
    pub fn present_in(&self, chunk: &CandidateChunk) -> bool {
        match self {
            EvidenceField::PageNumber => chunk.page.is_some(),
            EvidenceField::DocumentTitle => chunk
                .document_title
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty()),
        }
    }
}

/// What the judge checks beyond grounding, citation accuracy and completeness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub required_fields: Vec<EvidenceField>,
}

impl Rubric {
    pub fn for_mode(mode: AnswerMode) -> Self {
        match mode {
            AnswerMode::Short => Self {
                required_fields: Vec::new(),
            },
            AnswerMode::LongForm => Self {
                required_fields: vec![EvidenceField::PageNumber],
            },
        }
    }

    /// First required field no retained chunk can supply.
    ///
    /// Only a field missing from every chunk makes the rubric unsatisfiable;
    /// partial coverage still gets a drafting attempt.
    pub fn unsatisfiable_field(&self, evidence: &EvidenceSet) -> Option<EvidenceField> {
        self.required_fields
            .iter()
            .copied()
            .find(|field| !evidence.chunks.iter().any(|item| field.present_in(&item.chunk)))
    }

    fn describe(&self) -> String {
        let mut out = String::from("grounding in the evidence, citation accuracy, completeness");
        for field in &self.required_fields {
            match field {
                EvidenceField::PageNumber => out.push_str(", page numbers for every citation"),
                EvidenceField::DocumentTitle => out.push_str(", document titles for every citation"),
            }
        }
        out
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn draft(
        &self,
        query: &Query,
        evidence: &EvidenceSet,
        mode: AnswerMode,
        hints: &[String],
    ) -> Result<Draft, ProviderError>;
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(
        &self,
        query: &Query,
        evidence: &EvidenceSet,
        draft: &Draft,
        rubric: &Rubric,
    ) -> Result<Evaluation, ProviderError>;
}

/// Numbered evidence block shared by the generator and judge prompts
pub fn render_evidence(evidence: &EvidenceSet) -> String {
    let mut out = String::new();
    for (i, item) in evidence.chunks.iter().enumerate() {
        let chunk = &item.chunk;
        let _ = write!(out, "[{}]", i + 1);
        if let Some(title) = &chunk.document_title {
            let _ = write!(out, " {}", title);
        }
        if let Some(page) = chunk.page {
            let _ = write!(out, " (p. {})", page);
        }
        let _ = writeln!(out, ": {}", chunk.text.trim());
    }
    if !evidence.bridges.is_empty() {
        out.push_str("\nRelated concepts:\n");
        for bridge in evidence.bridges.iter() {
            let _ = writeln!(out, "- {}", bridge.text);
        }
    }
    out
}

/// `[n]` markers resolved against the evidence; unknown indices are dropped
pub fn parse_citations(text: &str, evidence: &EvidenceSet) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find(']') else { break };
        let inner = &rest[..close];
        for part in inner.split(',') {
            let Ok(index) = part.trim().parse::<usize>() else { continue };
            if index == 0 || index > evidence.chunks.len() || citations.iter().any(|c| c.index == index) {
                continue;
            }
            let chunk = &evidence.chunks[index - 1].chunk;
            citations.push(Citation {
                index,
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                page: chunk.page,
            });
        }
        rest = &rest[close + 1..];
    }
    citations
}

const GENERATOR_SYSTEM: &str = "You answer questions using only the numbered evidence from the user's \
library. Cite evidence inline as [n]. If the evidence does not answer the question, say so.";

pub struct LlmGenerator {
    llm: Arc<LlmClient>,
    budget: Duration,
}

impl LlmGenerator {
    pub fn new(llm: Arc<LlmClient>, budget: Duration) -> Self {
        Self { llm, budget }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn draft(
        &self,
        query: &Query,
        evidence: &EvidenceSet,
        mode: AnswerMode,
        hints: &[String],
    ) -> Result<Draft, ProviderError> {
        let mut prompt = render_evidence(evidence);
        if !hints.is_empty() {
            prompt.push_str("\nA reviewer rejected the previous draft. Address these points:\n");
            for hint in hints {
                let _ = writeln!(prompt, "- {}", hint);
            }
        }
        let style = match mode {
            AnswerMode::Short => "Answer in at most three sentences.",
            AnswerMode::LongForm => "Write a thorough answer and give the page number with every citation.",
        };
        let _ = write!(prompt, "\nQuestion: {}\n{}", query.raw, style);

        let max_tokens = match mode {
            AnswerMode::Short => 300,
            AnswerMode::LongForm => 1500,
        };
        let request = LlmRequest::new(GENERATOR_SYSTEM, prompt)
            .max_tokens(max_tokens)
            .temperature(0.2);
        let text = self.llm.complete_within(&request, self.budget).await?;
        let citations = parse_citations(&text, evidence);
        Ok(Draft {
            text: text.trim().to_string(),
            citations,
        })
    }
}

/// Offline generator that quotes the leading sentence of the top chunks.
///
/// Serves deployments without an LLM; its drafts are never judged.
pub struct ExtractiveGenerator;

fn lead_sentence(text: &str) -> &str {
    let text = text.trim();
    match text.find(['.', '!', '?']) {
        Some(end) => &text[..end + 1],
        None => text,
    }
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    async fn draft(
        &self,
        _query: &Query,
        evidence: &EvidenceSet,
        mode: AnswerMode,
        _hints: &[String],
    ) -> Result<Draft, ProviderError> {
        let take = match mode {
            AnswerMode::Short => 2,
            AnswerMode::LongForm => 6,
        };
        let sentences: Vec<String> = evidence
            .chunks
            .iter()
            .take(take)
            .enumerate()
            .map(|(i, item)| format!("{} [{}]", lead_sentence(&item.chunk.text), i + 1))
            .collect();
        let text = sentences.join(" ");
        let citations = parse_citations(&text, evidence);
        Ok(Draft { text, citations })
    }
}

const JUDGE_SYSTEM: &str = "You review draft answers against numbered evidence. Reply with JSON only: \
{\"verdict\": \"PASS\" | \"REGENERATE\" | \"DECLINE\", \"hints\": [string], \"scores\": {string: number}}. \
Use REGENERATE with concrete hints when the draft can be fixed, DECLINE when the evidence cannot support an answer.";

#[derive(Debug, Deserialize)]
struct JudgeReply {
    verdict: String,
    #[serde(default)]
    hints: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    scores: BTreeMap<String, f32>,
}

/// Parse the judge's JSON reply; anything unrecognisable is an invalid response
pub fn parse_evaluation(reply: &str) -> Result<Evaluation, ProviderError> {
    let json = extract_json_object(reply).ok_or_else(|| ProviderError::invalid(LLM_SERVICE, "judge reply has no JSON object"))?;
    let parsed: JudgeReply =
        serde_json::from_str(json).map_err(|e| ProviderError::invalid(LLM_SERVICE, format!("judge reply: {}", e)))?;
    let verdict = match parsed.verdict.trim().to_ascii_uppercase().as_str() {
        "PASS" => Verdict::Pass,
        "REGENERATE" => Verdict::Regenerate,
        "DECLINE" => Verdict::Decline,
        other => {
            return Err(ProviderError::invalid(
                LLM_SERVICE,
                format!("unknown verdict '{}'", other),
            ))
        }
    };
    Ok(Evaluation {
        verdict,
        hints: parsed.hints,
    })
}

pub struct LlmJudge {
    llm: Arc<LlmClient>,
    budget: Duration,
}

impl LlmJudge {
    pub fn new(llm: Arc<LlmClient>, budget: Duration) -> Self {
        Self { llm, budget }
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn evaluate(
        &self,
        query: &Query,
        evidence: &EvidenceSet,
        draft: &Draft,
        rubric: &Rubric,
    ) -> Result<Evaluation, ProviderError> {
        let prompt = format!(
            "{}\nQuestion: {}\n\nDraft:\n{}\n\nCriteria: {}",
            render_evidence(evidence),
            query.raw,
            draft.text,
            rubric.describe()
        );
        let request = LlmRequest::new(JUDGE_SYSTEM, prompt).max_tokens(400);
        self.llm.complete_parsed(&request, self.budget, parse_evaluation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_store::chunk;

    fn evidence(pages: &[Option<u32>]) -> EvidenceSet {
        let chunks = pages
            .iter()
            .enumerate()
            .map(|(i, page)| {
                let mut c = chunk(&format!("c{}", i + 1), "d1", "some text");
                c.page = *page;
                FusedItem {
                    chunk: c,
                    score: 0.0,
                    provenance: vec![],
                }
            })
            .collect();
        EvidenceSet::new(chunks, vec![])
    }

    #[test]
    fn test_citations_resolve_known_indices_once() {
        let ev = evidence(&[Some(3), None, Some(40)]);
        let citations = parse_citations("Solitude helps [1]. It also [3][1] and [9]. See [2, 3].", &ev);
        let indices: Vec<usize> = citations.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 3, 2]);
        assert_eq!(citations[1].page, Some(40));
        assert_eq!(citations[1].chunk_id, "c3");
    }

    #[test]
    fn test_rubric_unsatisfiable_only_when_no_chunk_has_field() {
        let long = Rubric::for_mode(AnswerMode::LongForm);
        assert_eq!(
            long.unsatisfiable_field(&evidence(&[None, None])),
            Some(EvidenceField::PageNumber)
        );
        assert_eq!(long.unsatisfiable_field(&evidence(&[None, Some(7)])), None);
        assert_eq!(Rubric::for_mode(AnswerMode::Short).unsatisfiable_field(&evidence(&[None])), None);
    }

    #[test]
    fn test_parse_evaluation_accepts_fenced_lowercase() {
        let eval = parse_evaluation("```json\n{\"verdict\": \"regenerate\", \"hints\": [\"cite page\"]}\n```").unwrap();
        assert_eq!(eval.verdict, Verdict::Regenerate);
        assert_eq!(eval.hints, vec!["cite page".to_string()]);
    }

    #[test]
    fn test_parse_evaluation_rejects_garbage() {
        assert!(matches!(
            parse_evaluation("looks fine to me"),
            Err(ProviderError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse_evaluation("{\"verdict\": \"MAYBE\"}"),
            Err(ProviderError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_render_evidence_numbers_chunks_and_bridges() {
        let mut ev = evidence(&[Some(12)]);
        ev.bridges = vec![Bridge {
            source_id: "k1".into(),
            source_label: "Solitude".into(),
            relation: "related_to".into(),
            target_id: "k2".into(),
            target_label: "Silence".into(),
            weight: 0.9,
            text: "Solitude -[related_to]-> Silence".into(),
        }]
        .into();
        let rendered = render_evidence(&ev);
        assert!(rendered.starts_with("[1] (p. 12): some text"));
        assert!(rendered.contains("- Solitude -[related_to]-> Silence"));
    }

    #[tokio::test]
    async fn test_extractive_generator_cites_what_it_quotes() {
        let mut ev_chunks = Vec::new();
        for (id, text) in [("c1", "Solitude restores. It also tires."), ("c2", "Silence helps"), ("c3", "Unused.")] {
            ev_chunks.push(FusedItem {
                chunk: chunk(id, "d1", text),
                score: 0.0,
                provenance: vec![],
            });
        }
        let ev = EvidenceSet::new(ev_chunks, vec![]);
        let query = Query {
            raw: "q".into(),
            normalized: "q".into(),
            language: Language::English,
            intent: Intent::Direct,
        };
        let draft = ExtractiveGenerator.draft(&query, &ev, AnswerMode::Short, &[]).await.unwrap();
        assert_eq!(draft.text, "Solitude restores. [1] Silence helps [2]");
        assert_eq!(draft.citations.len(), 2);
    }
}

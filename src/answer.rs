//! Bounded draft / evaluate / regenerate loop over a frozen evidence set
//!
//! ```text
//! DRAFTING -> EVALUATING -> DONE
//!     ^            |
//!     +--hints-----+ (REGENERATE, attempts left)
//!                  +-> FALLBACK (DECLINE, attempts exhausted, budget, rubric)
//! ```

use crate::agents::{Generator, Judge, Rubric};
use crate::cache::{answer_key, ResultCache};
use crate::config::{AnswerConfig, EngineConfig, ModelVersions};
use crate::error::{AnswerError, SearchError};
use crate::orchestrator::SearchOrchestrator;
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const INSUFFICIENT_EVIDENCE: &str =
    "I couldn't find enough in your library to answer this question.";
pub const ANSWER_UNAVAILABLE: &str =
    "I couldn't put an answer together right now. Please try again shortly.";
pub const UNVERIFIED_NOTE: &str =
    "\n\n(This answer could not be fully verified against your sources.)";

/// Final state of one run of the loop
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub attempts: Vec<AnswerAttempt>,
    pub outcome: AnswerOutcome,
    pub evaluated: bool,
    pub degradations: Vec<Degradation>,
}

impl Synthesis {
    fn conclude(attempts: Vec<AnswerAttempt>, outcome: AnswerOutcome, evaluated: bool, degradations: Vec<Degradation>) -> Self {
        let last = attempts.last().map(|a| &a.draft);
        let (answer, citations) = match (outcome, last) {
            (AnswerOutcome::Fallback(FallbackReason::NoEvidence | FallbackReason::Declined), _) => {
                (INSUFFICIENT_EVIDENCE.to_string(), Vec::new())
            }
            (AnswerOutcome::Passed | AnswerOutcome::FastTracked, Some(draft)) => {
                (draft.text.clone(), draft.citations.clone())
            }
            (_, Some(draft)) => (format!("{}{}", draft.text, UNVERIFIED_NOTE), draft.citations.clone()),
            (_, None) => (ANSWER_UNAVAILABLE.to_string(), Vec::new()),
        };
        Self {
            answer,
            citations,
            attempts,
            outcome,
            evaluated,
            degradations,
        }
    }

    pub fn final_verdict(&self) -> Option<Verdict> {
        self.attempts.last().and_then(|a| a.verdict)
    }
}

fn unjudged(number: usize, draft: Draft) -> AnswerAttempt {
    AnswerAttempt {
        number,
        draft,
        verdict: None,
        hints: Vec::new(),
    }
}

pub struct AnswerOrchestrator {
    generator: Arc<dyn Generator>,
    judge: Option<Arc<dyn Judge>>,
    cache: Arc<ResultCache>,
    config: AnswerConfig,
    answer_ttl: Duration,
    models: ModelVersions,
}

impl AnswerOrchestrator {
    pub fn new(generator: Arc<dyn Generator>, cache: Arc<ResultCache>, config: &EngineConfig) -> Self {
        Self {
            generator,
            judge: None,
            cache,
            config: config.answer.clone(),
            answer_ttl: config.cache.answer_ttl(),
            models: config.models.clone(),
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Search, then synthesize a cited answer from the top results
    pub async fn answer(
        &self,
        search: &SearchOrchestrator,
        raw: &str,
        scope: &Scope,
        mode: AnswerMode,
        context: &QueryContext,
        cancel: &CancellationToken,
    ) -> Result<AnswerResult, AnswerError> {
        let started = Instant::now();
        let routed = search.route(raw, context).await?;
        let key = answer_key(scope, &search.search_shape(&routed), mode, &self.models).render();
        if let Some(mut cached) = self.cache.get_json::<AnswerResult>(&key).await {
            info!("Answer cache hit for '{}'", routed.query.normalized);
            cached.metadata.cache_hit = true;
            return Ok(cached);
        }

        let searched = search
            .execute_routed(&routed, scope, cancel)
            .await
            .map_err(|e| match e {
                SearchError::Cancelled => AnswerError::Cancelled,
                other => AnswerError::Search(other),
            })?;

        let evidence = EvidenceSet::new(
            searched
                .items
                .iter()
                .take(self.config.evidence_limit)
                .cloned()
                .collect(),
            searched.bridges.clone(),
        );
        let synthesis = self
            .synthesize_until(
                &routed.query,
                routed.decision.confidence,
                &evidence,
                mode,
                started + self.config.budget(mode),
                cancel,
            )
            .await?;

        let cacheable = matches!(synthesis.outcome, AnswerOutcome::Passed | AnswerOutcome::FastTracked)
            && searched.metadata.is_complete();
        let final_verdict = synthesis.final_verdict();
        let result = AnswerResult {
            answer: synthesis.answer,
            citations: synthesis.citations,
            metadata: AnswerMetadata {
                mode,
                attempts: synthesis.attempts.len(),
                final_verdict,
                outcome: synthesis.outcome,
                evaluated: synthesis.evaluated,
                degradations: synthesis.degradations,
                cache_hit: false,
                elapsed_ms: started.elapsed().as_millis() as u64,
                search: searched.metadata,
            },
        };
        info!(
            "Answer for '{}': {:?} after {} attempt(s), {}ms",
            routed.query.normalized, result.metadata.outcome, result.metadata.attempts, result.metadata.elapsed_ms
        );

        if cacheable {
            self.cache.set_json(&key, &result, self.answer_ttl).await;
        }
        Ok(result)
    }

    /// Run the loop over already-retrieved evidence with the full mode budget
    pub async fn synthesize(
        &self,
        query: &Query,
        confidence: f32,
        evidence: &EvidenceSet,
        mode: AnswerMode,
        cancel: &CancellationToken,
    ) -> Result<Synthesis, AnswerError> {
        let deadline = Instant::now() + self.config.budget(mode);
        self.synthesize_until(query, confidence, evidence, mode, deadline, cancel)
            .await
    }

    /// Run the loop, giving up on drafting and judging at `deadline`
    pub async fn synthesize_until(
        &self,
        query: &Query,
        confidence: f32,
        evidence: &EvidenceSet,
        mode: AnswerMode,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Synthesis, AnswerError> {
        if evidence.is_empty() {
            return Ok(Synthesis::conclude(
                Vec::new(),
                AnswerOutcome::Fallback(FallbackReason::NoEvidence),
                false,
                Vec::new(),
            ));
        }

        let rubric = Rubric::for_mode(mode);
        let mut degradations = Vec::new();
        let mut attempts: Vec<AnswerAttempt> = Vec::new();
        let mut hints: Vec<String> = Vec::new();

        // Evidence that can never satisfy the rubric gets one unjudged draft
        let unsatisfiable = rubric.unsatisfiable_field(evidence);
        if let Some(field) = unsatisfiable {
            warn!("No evidence carries {:?}; answering without evaluation", field);
        }
        let fast_track = unsatisfiable.is_none()
            && mode == AnswerMode::Short
            && query.intent == Intent::Direct
            && confidence >= self.config.fast_track_confidence;
        let max_attempts = if unsatisfiable.is_some() {
            1
        } else {
            self.config.max_attempts.max(1)
        };
        let mut evaluated = false;

        for number in 1..=max_attempts {
            if cancel.is_cancelled() {
                info!("Answer cancelled before attempt {}", number);
                return Err(AnswerError::Cancelled);
            }

            // DRAFTING
            let draft = match tokio::time::timeout_at(
                deadline,
                self.generator.draft(query, evidence, mode, &hints),
            )
            .await
            {
                Ok(Ok(draft)) => draft,
                Ok(Err(e)) => {
                    warn!("Generator failed on attempt {}: {}", number, e);
                    return Ok(Synthesis::conclude(
                        attempts,
                        AnswerOutcome::Fallback(FallbackReason::GeneratorUnavailable),
                        evaluated,
                        degradations,
                    ));
                }
                Err(_) => {
                    warn!("Answer budget exhausted while drafting attempt {}", number);
                    return Ok(Synthesis::conclude(
                        attempts,
                        AnswerOutcome::Fallback(FallbackReason::BudgetExceeded),
                        evaluated,
                        degradations,
                    ));
                }
            };
            if unsatisfiable.is_some() {
                attempts.push(unjudged(number, draft));
                return Ok(Synthesis::conclude(
                    attempts,
                    AnswerOutcome::Fallback(FallbackReason::RubricUnsatisfiable),
                    false,
                    degradations,
                ));
            }
            if fast_track {
                attempts.push(unjudged(number, draft));
                return Ok(Synthesis::conclude(attempts, AnswerOutcome::FastTracked, false, degradations));
            }
            let Some(judge) = &self.judge else {
                attempts.push(unjudged(number, draft));
                return Ok(Synthesis::conclude(attempts, AnswerOutcome::Unverified, false, degradations));
            };

            // EVALUATING
            let evaluation = match tokio::time::timeout_at(
                deadline,
                judge.evaluate(query, evidence, &draft, &rubric),
            )
            .await
            {
                Ok(Ok(evaluation)) => evaluation,
                Ok(Err(e)) => {
                    warn!("Judge unavailable on attempt {}: {}", number, e);
                    attempts.push(unjudged(number, draft));
                    degradations.push(Degradation::JudgeUnavailable { reason: e.to_string() });
                    return Ok(Synthesis::conclude(attempts, AnswerOutcome::Unverified, evaluated, degradations));
                }
                Err(_) => {
                    warn!("Answer budget exhausted while evaluating attempt {}", number);
                    attempts.push(unjudged(number, draft));
                    return Ok(Synthesis::conclude(
                        attempts,
                        AnswerOutcome::Fallback(FallbackReason::BudgetExceeded),
                        evaluated,
                        degradations,
                    ));
                }
            };
            evaluated = true;
            attempts.push(AnswerAttempt {
                number,
                draft,
                verdict: Some(evaluation.verdict),
                hints: evaluation.hints.clone(),
            });
            info!("Attempt {} judged {:?}", number, evaluation.verdict);

            match evaluation.verdict {
                Verdict::Pass => {
                    return Ok(Synthesis::conclude(attempts, AnswerOutcome::Passed, true, degradations));
                }
                Verdict::Decline => {
                    return Ok(Synthesis::conclude(
                        attempts,
                        AnswerOutcome::Fallback(FallbackReason::Declined),
                        true,
                        degradations,
                    ));
                }
                Verdict::Regenerate => {
                    for hint in evaluation.hints {
                        if !hints.contains(&hint) {
                            hints.push(hint);
                        }
                    }
                }
            }
        }

        warn!("Answer not accepted after {} attempt(s)", attempts.len());
        Ok(Synthesis::conclude(
            attempts,
            AnswerOutcome::Fallback(FallbackReason::AttemptsExhausted),
            evaluated,
            degradations,
        ))
    }
}

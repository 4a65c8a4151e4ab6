//! Reflection engine
//!
//! A three-role loop over a bundle of evidence records: the Actor drafts a
//! candidate lesson, the Evaluator scores it (faithfulness, generality,
//! novelty, actionability), the Reflector revises or discards. The loop runs
//! a bounded number of iterations and accepts only above the tenant's
//! threshold. Lessons are generalized paraphrases; the engine abandons
//! rather than quote confidential evidence verbatim.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditOutcome, AuditPipeline};
use crate::error::{CoreError, Result};
use crate::llm::LlmGateway;
use crate::memory::{InfoClass, Layer, MemoryRecord, content_hash};
use crate::storage::{RecordFilter, RecordStore};
use crate::tenant::TenantContext;

/// Consecutive-word window treated as a verbatim quotation.
const VERBATIM_WINDOW: usize = 6;

/// How many existing reflections the novelty check samples.
const NOVELTY_SAMPLE: usize = 128;

// ============================================================================
// TYPES
// ============================================================================

/// The kind of insight a reflection captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionType {
    /// A recurring pattern worth remembering
    Observation,
    /// A cause-effect relationship the evidence supports
    Causation,
    /// What would have happened under a different choice
    Counterfactual,
    /// A reusable course of action
    Strategy,
}

impl ReflectionType {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReflectionType::Observation => "observation",
            ReflectionType::Causation => "causation",
            ReflectionType::Counterfactual => "counterfactual",
            ReflectionType::Strategy => "strategy",
        }
    }
}

impl std::fmt::Display for ReflectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata carried by a reflective-layer record. The lesson is the record
/// content; evidence refs mirror the record's parent pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionInfo {
    /// Kind of insight
    pub reflection_type: ReflectionType,
    /// Record ids the lesson is grounded on
    pub evidence_refs: Vec<String>,
    /// Confidence in the knowledge before the reflection (mean evidence
    /// importance)
    pub confidence_before: f64,
    /// Evaluator aggregate for the accepted lesson
    pub confidence_after: f64,
}

/// Evaluator criterion scores, each in [0,1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// Lesson terms supported by the evidence
    pub faithfulness: f64,
    /// Distance from anecdote (penalizes verbatim spans and identifiers)
    pub generality: f64,
    /// Distance from existing reflective memories
    pub novelty: f64,
    /// Presence of actionable guidance
    pub actionability: f64,
}

impl Evaluation {
    /// Weighted aggregate of the four criteria.
    pub fn aggregate(&self) -> f64 {
        0.35 * self.faithfulness
            + 0.25 * self.generality
            + 0.2 * self.novelty
            + 0.2 * self.actionability
    }

    fn weakest(&self) -> &'static str {
        let pairs = [
            ("faithfulness", self.faithfulness),
            ("generality", self.generality),
            ("novelty", self.novelty),
            ("actionability", self.actionability),
        ];
        pairs
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, _)| *name)
            .unwrap_or("faithfulness")
    }
}

/// An accepted lesson ready to be stored as a reflective record.
#[derive(Debug, Clone)]
pub struct ReflectionOutcome {
    /// The generalized lesson text
    pub lesson: String,
    /// Metadata for the reflective record
    pub info: ReflectionInfo,
    /// Iterations the loop ran
    pub iterations: usize,
    /// The lesson matches an existing reflection byte for byte
    pub duplicate_of_existing: bool,
}

// ============================================================================
// PURE EVALUATION FUNCTIONS
// ============================================================================

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "to", "in", "on", "for", "with", "is", "was",
    "are", "were", "be", "been", "it", "this", "that", "from", "by", "at", "as", "when", "after",
    "before", "across", "related", "events", "issues", "likely", "involving", "treat", "recur",
    "together", "rather", "than", "plan", "first", "appears", "check", "drives", "suggests",
    "evidence", "repeated", "incidents", "would", "have", "had", "earlier", "addressed", "avoided",
    "working", "reacting", "fact", "front",
];

fn content_terms(text: &str) -> Vec<String> {
    words(text)
        .into_iter()
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Whether `candidate` contains a run of [`VERBATIM_WINDOW`] consecutive
/// words copied from `source`.
pub fn quotes_verbatim(candidate: &str, source: &str) -> bool {
    let candidate_words = words(candidate);
    let source_words = words(source);
    if candidate_words.len() < VERBATIM_WINDOW || source_words.len() < VERBATIM_WINDOW {
        return false;
    }
    let source_windows: HashSet<Vec<String>> = source_words
        .windows(VERBATIM_WINDOW)
        .map(|w| w.to_vec())
        .collect();
    candidate_words
        .windows(VERBATIM_WINDOW)
        .any(|w| source_windows.contains(&w.to_vec()))
}

/// Faithfulness: fraction of lesson content terms supported by the evidence.
pub fn score_faithfulness(lesson: &str, evidence: &[&str]) -> f64 {
    let lesson_terms = content_terms(lesson);
    if lesson_terms.is_empty() {
        return 0.0;
    }
    let evidence_terms: HashSet<String> = evidence
        .iter()
        .flat_map(|e| content_terms(e))
        .collect();
    let supported = lesson_terms
        .iter()
        .filter(|t| evidence_terms.contains(*t))
        .count();
    supported as f64 / lesson_terms.len() as f64
}

/// Generality: penalize verbatim spans and concrete identifiers (numbers,
/// ticket ids) that make a lesson an anecdote rather than knowledge.
pub fn score_generality(lesson: &str, evidence: &[&str]) -> f64 {
    let mut score: f64 = 1.0;
    if evidence.iter().any(|e| quotes_verbatim(lesson, e)) {
        score -= 0.6;
    }
    let tokens = words(lesson);
    if !tokens.is_empty() {
        let specific = tokens
            .iter()
            .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
            .count();
        score -= specific as f64 / tokens.len() as f64;
    }
    score.clamp(0.0, 1.0)
}

/// Actionability: advice markers present in the lesson.
pub fn score_actionability(lesson: &str) -> f64 {
    const MARKERS: &[&str] = &[
        "should", "prefer", "avoid", "ensure", "plan", "check", "treat", "never", "always",
        "before", "use", "instead",
    ];
    let tokens = words(lesson);
    if tokens.is_empty() {
        return 0.0;
    }
    let hits = MARKERS
        .iter()
        .filter(|m| tokens.iter().any(|t| t == *m))
        .count();
    ((hits as f64) / 2.0).min(1.0)
}

/// Novelty via term overlap: 1 minus the highest Jaccard similarity against
/// existing reflective lessons.
pub fn score_novelty(lesson: &str, existing: &[String]) -> f64 {
    let lesson_terms: HashSet<String> = content_terms(lesson).into_iter().collect();
    if lesson_terms.is_empty() {
        return 0.0;
    }
    let mut max_sim: f64 = 0.0;
    for other in existing {
        let other_terms: HashSet<String> = content_terms(other).into_iter().collect();
        if other_terms.is_empty() {
            continue;
        }
        let inter = lesson_terms.intersection(&other_terms).count() as f64;
        let union = lesson_terms.union(&other_terms).count() as f64;
        max_sim = max_sim.max(inter / union);
    }
    1.0 - max_sim
}

// ============================================================================
// LESSON SYNTHESIS (local actor / reflector)
// ============================================================================

/// Draft a generalized lesson from evidence without any model call.
///
/// Picks the dominant content terms across the bundle and casts them into a
/// mode-specific template. Never copies sentences, so the result cannot quote
/// evidence verbatim.
pub fn synthesize_lesson(evidence: &[&str], mode: ReflectionType) -> String {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for text in evidence {
        for term in content_terms(text) {
            *freq.entry(term).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top: Vec<String> = ranked.into_iter().take(3).map(|(t, _)| t).collect();
    let (a, b) = match top.len() {
        0 => ("the recurring theme".to_string(), "its context".to_string()),
        1 => (top[0].clone(), "its context".to_string()),
        _ => (top[0].clone(), top[1].clone()),
    };
    let n = evidence.len();
    match mode {
        ReflectionType::Observation => format!(
            "Across {n} related events, {a} and {b} recur together; treat new {a} issues as likely involving {b}."
        ),
        ReflectionType::Causation => format!(
            "The evidence suggests {a} drives {b}; check {a} first when {b} appears."
        ),
        ReflectionType::Counterfactual => format!(
            "Had {a} been addressed earlier, the repeated {b} incidents would likely have been avoided; ensure {a} is handled before it compounds."
        ),
        ReflectionType::Strategy => format!(
            "When working with {a}, plan for {b} up front rather than reacting after the fact."
        ),
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// The Actor-Evaluator-Reflector loop.
pub struct ReflectionEngine {
    gateway: Arc<LlmGateway>,
    records: Arc<dyn RecordStore>,
    audit: Arc<AuditPipeline>,
}

impl ReflectionEngine {
    /// Wire the engine.
    pub fn new(
        gateway: Arc<LlmGateway>,
        records: Arc<dyn RecordStore>,
        audit: Arc<AuditPipeline>,
    ) -> Self {
        Self {
            gateway,
            records,
            audit,
        }
    }

    /// Run the loop over an evidence bundle. Returns `None` when the engine
    /// discards the candidate (threshold, novelty floor, or sanitization
    /// abandonment) — each discard is audited with its reason.
    pub async fn reflect(
        &self,
        ctx: &TenantContext,
        evidence: &[MemoryRecord],
        mode: ReflectionType,
    ) -> Result<Option<ReflectionOutcome>> {
        let config = ctx.config();
        let reflection_cfg = &config.reflection;
        if !reflection_cfg.enabled_modes.contains(&mode) {
            return Err(CoreError::InvalidRecord(format!(
                "reflection mode {mode} is not enabled for this tenant"
            )));
        }
        if evidence.is_empty() {
            return Err(CoreError::InvalidRecord("empty evidence bundle".into()));
        }
        // Restricted evidence never reaches consolidation; refuse outright.
        if evidence.iter().any(|r| r.info_class == InfoClass::Restricted) {
            self.audit.emit(
                AuditEvent::of(ctx, "reflection_abandoned")
                    .outcome(AuditOutcome::Denied)
                    .info_class(InfoClass::Restricted)
                    .detail(serde_json::json!({ "reason": "restricted_evidence" }))
                    .critical(),
            );
            return Err(CoreError::RestrictedContent);
        }

        let evidence_texts: Vec<&str> = evidence.iter().map(|r| r.content.as_str()).collect();
        let sensitive: Vec<&str> = evidence
            .iter()
            .filter(|r| r.info_class >= InfoClass::Confidential)
            .map(|r| r.content.as_str())
            .collect();
        let existing = self.existing_lessons(ctx)?;
        let confidence_before = evidence.iter().map(|r| r.importance).sum::<f64>()
            / evidence.len() as f64;

        let mut iterations = 0;
        let mut candidate = self.actor_draft(ctx, &evidence_texts, mode, None).await?;
        loop {
            iterations += 1;

            // Sanitization gate: confidential evidence must not be quoted.
            if sensitive.iter().any(|s| quotes_verbatim(&candidate, s)) {
                if iterations >= reflection_cfg.max_iterations {
                    self.audit.emit(
                        AuditEvent::of(ctx, "reflection_abandoned")
                            .outcome(AuditOutcome::Denied)
                            .info_class(InfoClass::Confidential)
                            .detail(serde_json::json!({ "reason": "verbatim_confidential" }))
                            .critical(),
                    );
                    return Ok(None);
                }
                candidate = synthesize_lesson(&evidence_texts, mode);
                continue;
            }

            let duplicate = existing
                .iter()
                .any(|e| content_hash(e) == content_hash(&candidate));
            let evaluation = Evaluation {
                faithfulness: score_faithfulness(&candidate, &evidence_texts),
                generality: score_generality(&candidate, &evidence_texts),
                novelty: if duplicate {
                    1.0
                } else {
                    score_novelty(&candidate, &existing)
                },
                actionability: score_actionability(&candidate),
            };
            let aggregate = evaluation.aggregate();

            if aggregate >= reflection_cfg.acceptance_threshold {
                if !duplicate && evaluation.novelty < reflection_cfg.novelty_floor {
                    self.audit.emit(
                        AuditEvent::of(ctx, "reflection_suppressed")
                            .outcome(AuditOutcome::Denied)
                            .detail(serde_json::json!({
                                "reason": "novelty_floor",
                                "novelty": evaluation.novelty,
                            })),
                    );
                    return Ok(None);
                }
                return Ok(Some(ReflectionOutcome {
                    lesson: candidate,
                    info: ReflectionInfo {
                        reflection_type: mode,
                        evidence_refs: evidence.iter().map(|r| r.id.clone()).collect(),
                        confidence_before,
                        confidence_after: aggregate,
                    },
                    iterations,
                    duplicate_of_existing: duplicate,
                }));
            }

            if iterations >= reflection_cfg.max_iterations {
                self.audit.emit(
                    AuditEvent::of(ctx, "reflection_rejected")
                        .outcome(AuditOutcome::Denied)
                        .detail(serde_json::json!({
                            "aggregate": aggregate,
                            "weakest": evaluation.weakest(),
                        })),
                );
                return Ok(None);
            }
            candidate = self
                .reflector_revise(ctx, &evidence_texts, mode, evaluation.weakest())
                .await?;
        }
    }

    /// Actor: draft via the tenant's `reflect` profile when configured,
    /// otherwise local synthesis. Budget denials propagate so worker cycles
    /// can defer; other provider failures degrade to local synthesis.
    async fn actor_draft(
        &self,
        ctx: &TenantContext,
        evidence: &[&str],
        mode: ReflectionType,
        feedback: Option<&str>,
    ) -> Result<String> {
        if ctx.config().llm_profiles.contains_key("reflect") {
            let max_class = InfoClass::Confidential;
            let mut prompt = format!(
                "Derive one generalized, reusable {mode} lesson from the following \
                 observations. Do not quote them verbatim.\n\n"
            );
            for (i, text) in evidence.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, text));
            }
            if let Some(feedback) = feedback {
                prompt.push_str(&format!("\nImprove on: {feedback}\n"));
            }
            match self
                .gateway
                .complete(ctx, "reflect", &prompt, 200, max_class)
                .await
            {
                Ok(completion) if !completion.text.trim().is_empty() => {
                    return Ok(completion.text.trim().to_string());
                }
                Ok(_) => {}
                Err(e @ CoreError::BudgetExceeded { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "reflect profile failed, using local synthesis");
                }
            }
        }
        Ok(synthesize_lesson(evidence, mode))
    }

    /// Reflector: revise toward the weakest criterion. The local reviser
    /// re-synthesizes, which generalizes away quotations and anecdotes.
    async fn reflector_revise(
        &self,
        ctx: &TenantContext,
        evidence: &[&str],
        mode: ReflectionType,
        weakest: &str,
    ) -> Result<String> {
        self.actor_draft(ctx, evidence, mode, Some(weakest)).await
    }

    fn existing_lessons(&self, ctx: &TenantContext) -> Result<Vec<String>> {
        let page = self.records.query(
            ctx,
            &RecordFilter::layer(Layer::Reflective, NOVELTY_SAMPLE),
        )?;
        Ok(page.items.into_iter().map(|r| r.content).collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbatim_detection() {
        let source = "the deploy rolled back after forty minutes of migration failures in production";
        let quoting = "we saw the deploy rolled back after forty minutes of migration pain";
        let paraphrase = "deploys fail when migrations are irreversible";
        assert!(quotes_verbatim(quoting, source));
        assert!(!quotes_verbatim(paraphrase, source));
    }

    #[test]
    fn faithfulness_rewards_supported_terms() {
        let evidence = ["rollback failed because migrations were irreversible"];
        let supported = score_faithfulness("migrations need rollback paths", &evidence);
        let unsupported = score_faithfulness("kubernetes networking is flaky", &evidence);
        assert!(supported > unsupported);
    }

    #[test]
    fn generality_penalizes_identifiers() {
        let evidence: Vec<&str> = vec![];
        let general = score_generality("prefer reversible schema changes", &evidence);
        let anecdotal = score_generality("INC-00042 failed at 03:14 on 2026-01-07", &evidence);
        assert!(general > anecdotal);
    }

    #[test]
    fn synthesized_lessons_never_quote() {
        let evidence = [
            "rollback of deploy 41 took forty minutes because the schema migration was irreversible",
            "deploy 42 rollback blocked on the same irreversible schema migration path",
            "third rollback this month; schema migration again had no down path",
        ];
        for mode in [
            ReflectionType::Observation,
            ReflectionType::Causation,
            ReflectionType::Counterfactual,
            ReflectionType::Strategy,
        ] {
            let lesson = synthesize_lesson(&evidence, mode);
            for source in &evidence {
                assert!(!quotes_verbatim(&lesson, source), "mode {mode} quoted");
            }
            assert!(!lesson.is_empty());
        }
    }

    #[test]
    fn synthesized_lesson_scores_acceptably() {
        let evidence = [
            "rollback of the deploy was painful because the migration had no down path",
            "second deploy rollback this week, migration scripts missing rollback steps",
            "deploy rollback again blocked by migration state, took an hour",
        ];
        let lesson = synthesize_lesson(&evidence, ReflectionType::Strategy);
        let eval = Evaluation {
            faithfulness: score_faithfulness(&lesson, &evidence),
            generality: score_generality(&lesson, &evidence),
            novelty: score_novelty(&lesson, &[]),
            actionability: score_actionability(&lesson),
        };
        assert!(
            eval.aggregate() >= 0.7,
            "aggregate {} too low for {lesson}",
            eval.aggregate()
        );
    }

    #[test]
    fn novelty_drops_for_near_duplicates() {
        let lesson = "plan for migration rollback before deploying schema changes";
        let fresh = score_novelty(lesson, &["monitor cache hit rates during traffic spikes".into()]);
        let stale = score_novelty(
            lesson,
            &["plan for migration rollback before deploying schema changes".into()],
        );
        assert!(fresh > stale);
    }
}

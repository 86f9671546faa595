//! Evidence bundle assembled by the corrective retrieval passes.

pub mod crag;
pub mod events;

use serde::{Deserialize, Serialize};

use crate::analysis::PreliminaryIssue;
use crate::models::{LiteratureArticle, Outcome, SimilarCase};

pub use crag::{EvidenceRetriever, SecondPass};
pub use events::{KeyEvents, extract_key_events};

/// Internal matches below this similarity are never cited.
pub const SIMILARITY_THRESHOLD: f64 = 0.7;
/// Validation confidence below this forces the internal set to be rejected.
pub const MIN_VALIDATION_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    #[default]
    ExternalOnly,
    Hybrid,
    ExternalOnlyAfterValidation,
}

/// Mode for a pass: nothing above threshold means external only; otherwise
/// the validation verdict decides between hybrid and rejecting internal
/// evidence.
pub fn select_mode(internal_count: usize, validated: bool) -> RetrievalMode {
    match (internal_count, validated) {
        (0, _) => RetrievalMode::ExternalOnly,
        (_, true) => RetrievalMode::Hybrid,
        (_, false) => RetrievalMode::ExternalOnlyAfterValidation,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceOrigin {
    Supplied,
    SimilaritySearch,
    CritiqueSearch,
}

const MAX_INTERNAL_CONTENT_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalEvidence {
    pub case_id: String,
    pub content: String,
    pub similarity: f64,
    pub outcome: Outcome,
    pub origin: EvidenceOrigin,
}

impl InternalEvidence {
    pub fn from_similar(case: &SimilarCase, origin: EvidenceOrigin) -> Self {
        Self {
            case_id: case.id.clone(),
            content: case.text.chars().take(MAX_INTERNAL_CONTENT_CHARS).collect(),
            similarity: case.similarity,
            outcome: case.outcome,
            origin,
        }
    }

    pub fn to_similar_case(&self) -> SimilarCase {
        SimilarCase {
            id: self.case_id.clone(),
            text: self.content.clone(),
            similarity: self.similarity,
            outcome: self.outcome,
            metadata: serde_json::json!({ "origin": self.origin }),
        }
    }
}

/// Stable identity used to deduplicate merged results.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for InternalEvidence {
    fn key(&self) -> &str {
        &self.case_id
    }
}

impl Keyed for LiteratureArticle {
    fn key(&self) -> &str {
        &self.source_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet<T> {
    pub results: Vec<T>,
    pub count: usize,
}

impl<T> Default for ResultSet<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            count: 0,
        }
    }
}

impl<T: Keyed> ResultSet<T> {
    pub fn from_results(results: Vec<T>) -> Self {
        let mut set = Self::default();
        set.merge(results);
        set
    }

    /// Appends items whose key is not present yet; returns how many were added.
    pub fn merge(&mut self, items: impl IntoIterator<Item = T>) -> usize {
        let before = self.results.len();
        for item in items {
            if !self.results.iter().any(|r| r.key() == item.key()) {
                self.results.push(item);
            }
        }
        self.count = self.results.len();
        self.count - before
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityEvaluation {
    pub is_sufficient: bool,
    pub count: usize,
    pub avg_score: f64,
    pub reason: String,
}

impl QualityEvaluation {
    /// Sufficiency is deliberately lenient (one match); validation is the
    /// real gate.
    pub fn of(results: &[InternalEvidence], threshold: f64) -> Self {
        let count = results.len();
        let avg_score = if count == 0 {
            0.0
        } else {
            results.iter().map(|r| r.similarity).sum::<f64>() / count as f64
        };
        let reason = if count == 0 {
            format!("no internal case at or above similarity {threshold}")
        } else {
            format!("{count} internal case(s) at or above similarity {threshold}, avg {avg_score:.2}")
        };
        Self {
            is_sufficient: count >= 1,
            count,
            avg_score,
            reason,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub reason: String,
    pub confidence: f64,
    /// Indices into the filtered internal set judged useful
    pub valid_case_indices: Vec<usize>,
}

impl ValidationResult {
    /// Applies the confidence floor to a judge's verdict.
    pub fn judged(
        verdict: bool,
        confidence: f64,
        reason: impl Into<String>,
        valid_case_indices: Vec<usize>,
        min_confidence: f64,
    ) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        let mut reason = reason.into();
        let is_valid = verdict && confidence >= min_confidence;
        if verdict && !is_valid {
            reason = format!("{reason} (confidence {confidence:.2} below {min_confidence})");
        }
        Self {
            is_valid,
            reason,
            confidence,
            valid_case_indices,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            reason: reason.into(),
            confidence: 0.0,
            valid_case_indices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalAnalysis {
    pub clinical_priorities: Vec<String>,
    pub key_findings: Vec<String>,
    pub risk_factors: Vec<String>,
    pub urgency_level: String,
    pub search_strategy: String,
    pub reasoning: String,
}

impl Default for ClinicalAnalysis {
    fn default() -> Self {
        Self::fallback("Unknown", "clinical analysis unavailable")
    }
}

impl ClinicalAnalysis {
    pub fn fallback(diagnosis: &str, reasoning: impl Into<String>) -> Self {
        Self {
            clinical_priorities: vec![diagnosis.to_string()],
            key_findings: vec!["diagnosis confirmed".to_string()],
            risk_factors: Vec::new(),
            urgency_level: "moderate".to_string(),
            search_strategy: "Evidence-based guideline search".to_string(),
            reasoning: reasoning.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CritiqueBasedEvidence {
    pub query: String,
    pub results: Vec<LiteratureArticle>,
    pub internal_results: Vec<InternalEvidence>,
    pub preliminary_issues: Vec<PreliminaryIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub retrieval_mode: RetrievalMode,
    pub similarity_threshold: f64,
    pub internal: ResultSet<InternalEvidence>,
    pub external: ResultSet<LiteratureArticle>,
    pub critique_based: Option<CritiqueBasedEvidence>,
    pub quality_evaluation: QualityEvaluation,
    pub validation_result: Option<ValidationResult>,
    pub clinical_analysis: ClinicalAnalysis,
    pub external_query: String,
    /// One entry per sub-step that fell back
    pub degradations: Vec<String>,
}

impl EvidenceBundle {
    /// Folds a critique-targeted pass in. Result lists only grow and are
    /// deduplicated by case id / source id, so re-applying is a no-op.
    pub fn merge_second_pass(&mut self, pass: SecondPass) {
        self.external.merge(pass.evidence.results.iter().cloned());
        self.internal.merge(pass.evidence.internal_results.iter().cloned());
        for note in pass.notes {
            if !self.degradations.contains(&note) {
                self.degradations.push(note);
            }
        }
        self.critique_based = Some(pass.evidence);
    }

    /// Internal matches as similar cases, best first, for comparison tools
    /// and the solution verifier.
    pub fn similar_cases(&self) -> Vec<SimilarCase> {
        let mut cases: Vec<SimilarCase> = self
            .internal
            .results
            .iter()
            .map(InternalEvidence::to_similar_case)
            .collect();
        cases.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        cases
    }

    /// Compact text rendering for prompts.
    pub fn digest(&self, max_items: usize) -> String {
        let mut lines = vec![format!(
            "retrieval_mode={:?}; internal={}; external={}",
            self.retrieval_mode, self.internal.count, self.external.count
        )];
        lines.extend(self.internal.results.iter().take(max_items).map(|r| {
            format!(
                "[internal {} sim={:.2} outcome={}] {}",
                r.case_id,
                r.similarity,
                r.outcome,
                r.content.chars().take(300).collect::<String>()
            )
        }));
        lines.extend(self.external.results.iter().take(max_items).map(|a| {
            format!(
                "[PMID {}] {}: {}",
                a.source_id,
                a.title,
                a.abstract_text.chars().take(300).collect::<String>()
            )
        }));
        lines.join("\n")
    }
}

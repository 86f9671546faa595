//! Corrective retrieval: grade internal similar-case evidence before trusting
//! it, and always supplement with external literature.

use serde::Deserialize;
use tracing::{info, warn};

use super::{
    ClinicalAnalysis, CritiqueBasedEvidence, EvidenceBundle, EvidenceOrigin, InternalEvidence,
    QualityEvaluation, ResultSet, ValidationResult, extract_key_events, select_mode,
};
use crate::analysis::PreliminaryIssue;
use crate::capability::{Capabilities, CompletionRequest, ask_json};
use crate::config::CriticConfig;
use crate::models::{Case, LiteratureArticle};

const MAX_ISSUES_IN_QUERY: usize = 5;
const MAX_CASES_TO_VALIDATE: usize = 3;

/// Output of the critique-targeted pass, ready to merge into a bundle.
#[derive(Debug, Clone, Default)]
pub struct SecondPass {
    pub evidence: CritiqueBasedEvidence,
    pub notes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchQueries {
    pubmed_query: String,
    internal_query: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ValidationReply {
    is_valid: bool,
    reason: String,
    confidence: f64,
    valid_case_indices: Vec<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryReply {
    query: String,
}

struct InternalBranch {
    candidates: Vec<InternalEvidence>,
    quality: QualityEvaluation,
    validation: Option<ValidationResult>,
    notes: Vec<String>,
}

struct ExternalBranch {
    results: Vec<LiteratureArticle>,
    notes: Vec<String>,
}

pub struct EvidenceRetriever<'a> {
    config: &'a CriticConfig,
    caps: &'a Capabilities,
}

impl<'a> EvidenceRetriever<'a> {
    pub fn new(config: &'a CriticConfig, caps: &'a Capabilities) -> Self {
        Self { config, caps }
    }

    /// First pass. Never fails; every degraded sub-step leaves a note in
    /// `EvidenceBundle::degradations`.
    pub async fn first_pass(&self, case: &Case) -> EvidenceBundle {
        let mut notes = Vec::new();
        let diagnosis = case.primary_diagnosis();

        let clinical = self.analyze_clinical_context(case, &mut notes).await;
        let queries = self.search_queries(case, &clinical, &mut notes).await;

        let (internal, external) = tokio::join!(
            self.internal_branch(case, &queries.internal_query),
            self.external_branch(&queries.pubmed_query),
        );
        notes.extend(internal.notes);
        notes.extend(external.notes);

        let validated = internal.validation.as_ref().is_some_and(|v| v.is_valid);
        let retrieval_mode = select_mode(internal.candidates.len(), validated);

        let kept_internal = match &internal.validation {
            Some(v) if v.is_valid => keep_validated(internal.candidates, &v.valid_case_indices),
            _ => Vec::new(),
        };

        info!(
            case_id = %case.id,
            diagnosis,
            mode = ?retrieval_mode,
            internal = kept_internal.len(),
            external = external.results.len(),
            "First evidence pass completed"
        );

        EvidenceBundle {
            retrieval_mode,
            similarity_threshold: self.config.similarity_threshold,
            internal: ResultSet::from_results(kept_internal),
            external: ResultSet::from_results(external.results),
            critique_based: None,
            quality_evaluation: internal.quality,
            validation_result: internal.validation,
            clinical_analysis: clinical,
            external_query: queries.pubmed_query,
            degradations: notes,
        }
    }

    /// Second, critique-targeted pass. `None` when there are no preliminary
    /// issues to target.
    pub async fn second_pass(&self, case: &Case, issues: &[PreliminaryIssue]) -> Option<SecondPass> {
        if issues.is_empty() {
            info!(case_id = %case.id, "No preliminary issues, skipping critique-targeted retrieval");
            return None;
        }

        let top_issues: Vec<PreliminaryIssue> = issues.iter().take(MAX_ISSUES_IN_QUERY).cloned().collect();
        let mut notes = Vec::new();
        let query = self.critique_query(case, &top_issues, &mut notes).await;

        let (internal, external) = tokio::join!(
            self.search_internal(&query, EvidenceOrigin::CritiqueSearch),
            self.external_branch(&query),
        );

        let internal_results = match internal {
            Ok(results) => results,
            Err(note) => {
                notes.push(note);
                Vec::new()
            }
        };
        notes.extend(external.notes);

        info!(
            case_id = %case.id,
            query = %query,
            internal = internal_results.len(),
            external = external.results.len(),
            "Critique-targeted evidence pass completed"
        );

        Some(SecondPass {
            evidence: CritiqueBasedEvidence {
                query,
                results: external.results,
                internal_results,
                preliminary_issues: top_issues,
            },
            notes,
        })
    }

    async fn analyze_clinical_context(&self, case: &Case, notes: &mut Vec<String>) -> ClinicalAnalysis {
        let diagnosis = case.primary_diagnosis();
        let Some(llm) = self.caps.llm() else {
            return ClinicalAnalysis::fallback(diagnosis, "no language model configured");
        };

        let prompt = format!(
            "Analyse the clinical context of this case for a morbidity and mortality review.\n\
             {}\n\nNarrative (truncated):\n{}\n\n\
             Return JSON with keys clinical_priorities (differential diagnoses, most important first), \
             key_findings, risk_factors, urgency_level (low|moderate|high|critical), \
             search_strategy and reasoning.",
            case.summary_line(),
            truncate(&case.text, 3000)
        );

        match ask_json::<ClinicalAnalysis>(llm, CompletionRequest::new(prompt).temperature(0.2).max_tokens(800)).await {
            Ok(mut analysis) => {
                if analysis.clinical_priorities.is_empty() {
                    analysis.clinical_priorities.push(diagnosis.to_string());
                }
                analysis
            }
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "Clinical context analysis failed, using diagnosis default");
                notes.push(format!("clinical analysis fell back to stated diagnosis: {e}"));
                ClinicalAnalysis::fallback(diagnosis, format!("fallback after capability failure: {e}"))
            }
        }
    }

    async fn search_queries(
        &self,
        case: &Case,
        clinical: &ClinicalAnalysis,
        notes: &mut Vec<String>,
    ) -> SearchQueries {
        let diagnosis = case.primary_diagnosis();
        let defaults = SearchQueries {
            pubmed_query: format!("{diagnosis} complication prevention guideline"),
            internal_query: format!("{diagnosis} complications diagnostic error"),
        };
        let Some(llm) = self.caps.llm() else {
            return defaults;
        };

        let prompt = format!(
            "Write two short search queries for reviewing this case.\n\
             Diagnosis: {diagnosis}\nPriorities: {}\nKey findings: {}\nRisk factors: {}\n\n\
             Return JSON {{\"pubmed_query\": \"...\", \"internal_query\": \"...\"}}. \
             The PubMed query targets guidelines and complications; the internal query \
             describes the clinical course to find similar historical cases.",
            clinical.clinical_priorities.join(", "),
            clinical.key_findings.join(", "),
            clinical.risk_factors.join(", ")
        );

        match ask_json::<SearchQueries>(llm, CompletionRequest::new(prompt).temperature(0.1).max_tokens(200)).await {
            Ok(generated) => SearchQueries {
                pubmed_query: non_empty_or(generated.pubmed_query, defaults.pubmed_query),
                internal_query: non_empty_or(generated.internal_query, defaults.internal_query),
            },
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "Query generation failed, using default queries");
                notes.push(format!("search queries fell back to defaults: {e}"));
                defaults
            }
        }
    }

    async fn internal_branch(&self, case: &Case, query: &str) -> InternalBranch {
        let mut notes = Vec::new();

        let candidates = if !case.similar_cases.is_empty() {
            case.similar_cases
                .iter()
                .take(self.config.internal_top_k)
                .filter(|c| c.similarity >= self.config.similarity_threshold)
                .map(|c| InternalEvidence::from_similar(c, EvidenceOrigin::Supplied))
                .collect()
        } else {
            match self.search_internal(query, EvidenceOrigin::SimilaritySearch).await {
                Ok(found) => found,
                Err(note) => {
                    notes.push(note);
                    Vec::new()
                }
            }
        };

        let quality = QualityEvaluation::of(&candidates, self.config.similarity_threshold);
        let validation = if quality.is_sufficient {
            Some(self.validate(case, &candidates, &mut notes).await)
        } else {
            None
        };

        InternalBranch {
            candidates,
            quality,
            validation,
            notes,
        }
    }

    /// Similarity search filtered to the threshold. `Err` carries a
    /// degradation note.
    async fn search_internal(
        &self,
        query: &str,
        origin: EvidenceOrigin,
    ) -> Result<Vec<InternalEvidence>, String> {
        let Some(index) = &self.caps.similarity else {
            return Err("similarity search not configured".to_string());
        };
        match index.search(query, self.config.internal_top_k).await {
            Ok(hits) => Ok(hits
                .iter()
                .filter(|h| h.similarity >= self.config.similarity_threshold)
                .map(|h| InternalEvidence::from_similar(h, origin))
                .collect()),
            Err(e) => {
                warn!(query, error = %e, "Similarity search failed");
                Err(format!("similarity search failed: {e}"))
            }
        }
    }

    async fn validate(
        &self,
        case: &Case,
        candidates: &[InternalEvidence],
        notes: &mut Vec<String>,
    ) -> ValidationResult {
        let min_confidence = self.config.min_validation_confidence;
        let patient_events = extract_key_events(&case.text);
        let reviewed = &candidates[..candidates.len().min(MAX_CASES_TO_VALIDATE)];

        let Some(llm) = self.caps.llm() else {
            notes.push("internal evidence validated by shared key events (no language model)".to_string());
            return validate_by_key_events(&patient_events, reviewed, min_confidence);
        };

        let cases_text = reviewed
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "[{i}] case {} similarity {:.2}\nkey events: {}\n{}",
                    c.case_id,
                    c.similarity,
                    extract_key_events(&c.content).describe(),
                    truncate(&c.content, 1000)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "Decide whether these historical cases are useful for critiquing the patient below. \
             A case is useful when it shares the outcome pathway, a procedure together with its \
             complication, or the disease trajectory.\n\n\
             Patient: {}\nPatient key events: {}\n\nCandidates:\n{cases_text}\n\n\
             Return JSON {{\"is_valid\": bool, \"reason\": str, \"valid_case_indices\": [int], \"confidence\": 0..1}}.",
            case.summary_line(),
            patient_events.describe()
        );

        match ask_json::<ValidationReply>(llm, CompletionRequest::new(prompt).temperature(0.1).max_tokens(400)).await {
            Ok(reply) => {
                let indices = reply
                    .valid_case_indices
                    .into_iter()
                    .filter(|i| *i < reviewed.len())
                    .collect();
                ValidationResult::judged(reply.is_valid, reply.confidence, reply.reason, indices, min_confidence)
            }
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "Internal evidence validation failed");
                notes.push(format!("internal evidence validation failed: {e}"));
                ValidationResult::failed(format!("validation unavailable: {e}"))
            }
        }
    }

    async fn external_branch(&self, query: &str) -> ExternalBranch {
        let Some(literature) = &self.caps.literature else {
            return ExternalBranch {
                results: Vec::new(),
                notes: vec!["literature search not configured".to_string()],
            };
        };
        match literature.search(query, self.config.literature_max_results).await {
            Ok(results) => ExternalBranch {
                results,
                notes: Vec::new(),
            },
            Err(e) => {
                warn!(query, error = %e, "Literature search failed");
                ExternalBranch {
                    results: Vec::new(),
                    notes: vec![format!("literature search failed: {e}")],
                }
            }
        }
    }

    async fn critique_query(&self, case: &Case, issues: &[PreliminaryIssue], notes: &mut Vec<String>) -> String {
        let default = format!("{} complication management guideline", case.primary_diagnosis());
        let Some(llm) = self.caps.llm() else {
            return default;
        };

        let listed = issues
            .iter()
            .map(|i| format!("- [{}] {}", i.severity, i.issue))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Write one PubMed query that finds evidence about how to prevent or manage the most \
             severe of these issues.\nDiagnosis: {}\nIssues:\n{listed}\n\nReturn JSON {{\"query\": \"...\"}}.",
            case.primary_diagnosis()
        );

        match ask_json::<QueryReply>(llm, CompletionRequest::new(prompt).temperature(0.1).max_tokens(150)).await {
            Ok(reply) => non_empty_or(reply.query, default),
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "Critique query generation failed");
                notes.push(format!("critique query fell back to default: {e}"));
                default
            }
        }
    }
}

/// Rule-based judge used when no model is configured: a candidate is useful
/// when it shares the narrative outcome or at least one complication or
/// critical sequence with the patient.
fn validate_by_key_events(
    patient: &super::KeyEvents,
    candidates: &[InternalEvidence],
    min_confidence: f64,
) -> ValidationResult {
    let indices: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            let events = extract_key_events(&c.content);
            (patient.outcome.is_some() && events.outcome == patient.outcome) || patient.overlap(&events) > 0
        })
        .map(|(i, _)| i)
        .collect();

    let confidence = if candidates.is_empty() {
        0.0
    } else {
        indices.len() as f64 / candidates.len() as f64
    };
    let reason = format!("{} of {} candidates share key events", indices.len(), candidates.len());
    ValidationResult::judged(!indices.is_empty(), confidence, reason, indices, min_confidence)
}

fn keep_validated(candidates: Vec<InternalEvidence>, indices: &[usize]) -> Vec<InternalEvidence> {
    if indices.is_empty() {
        return candidates;
    }
    candidates
        .into_iter()
        .enumerate()
        .filter(|(i, _)| indices.contains(i))
        .map(|(_, c)| c)
        .collect()
}

fn non_empty_or(value: String, default: String) -> String {
    if value.trim().is_empty() { default } else { value }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::IssueSource;
    use crate::evidence::RetrievalMode;
    use crate::models::{Outcome, Severity, SimilarCase};
    use crate::test_support::{FakeLiterature, FakeSimilarity, ScriptedLlm, UnreachableLlm, case_with};
    use std::sync::Arc;

    fn similar(id: &str, similarity: f64) -> SimilarCase {
        SimilarCase {
            id: id.to_string(),
            text: format!("Paracentesis then hemoperitoneum. Patient expired. ({id})"),
            similarity,
            outcome: Outcome::Dead,
            metadata: serde_json::Value::Null,
        }
    }

    fn issue(text: &str, severity: Severity) -> PreliminaryIssue {
        PreliminaryIssue {
            issue: text.to_string(),
            severity,
            source: IssueSource::Diagnosis,
        }
    }

    #[tokio::test]
    async fn no_similar_cases_above_threshold_is_external_only() {
        let config = CriticConfig::default();
        let caps = Capabilities::none()
            .with_literature(Arc::new(FakeLiterature::with_ids(&["1", "2"])))
            .with_similarity(Arc::new(FakeSimilarity::new(vec![similar("low", 0.5)])));
        let case = case_with("Cirrhosis admitted with ascites.", vec![]);

        let bundle = EvidenceRetriever::new(&config, &caps).first_pass(&case).await;

        assert_eq!(bundle.retrieval_mode, RetrievalMode::ExternalOnly);
        assert_eq!(bundle.internal.count, 0);
        assert_eq!(bundle.external.count, 2);
        assert!(bundle.validation_result.is_none());
        assert_eq!(bundle.clinical_analysis.urgency_level, "moderate");
    }

    #[tokio::test]
    async fn validated_similar_cases_produce_hybrid() {
        let config = CriticConfig::default();
        let llm = ScriptedLlm::new()
            .reply_to("clinical context", r#"{"clinical_priorities": ["SBP"], "urgency_level": "high"}"#)
            .reply_to("search queries", r#"{"pubmed_query": "sbp guideline", "internal_query": "sbp course"}"#)
            .reply_to(
                "useful for critiquing",
                r#"```json
{"is_valid": true, "reason": "same pathway", "valid_case_indices": [0, 2, 9], "confidence": 0.8}
```"#,
            );
        let caps = Capabilities::none()
            .with_llm(Arc::new(llm))
            .with_literature(Arc::new(FakeLiterature::with_ids(&["10"])));
        let case = case_with(
            "Paracentesis done. Hemoperitoneum. Expired.",
            vec![similar("a", 0.95), similar("b", 0.88), similar("c", 0.71)],
        );

        let bundle = EvidenceRetriever::new(&config, &caps).first_pass(&case).await;

        assert_eq!(bundle.retrieval_mode, RetrievalMode::Hybrid);
        assert!(bundle.internal.count <= 3);
        let ids: Vec<&str> = bundle.internal.results.iter().map(|r| r.case_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(bundle.external_query, "sbp guideline");
        assert_eq!(bundle.clinical_analysis.clinical_priorities, vec!["SBP"]);
        assert!(bundle.degradations.is_empty());
    }

    #[tokio::test]
    async fn low_confidence_validation_rejects_internal_evidence() {
        let config = CriticConfig::default();
        let llm = ScriptedLlm::new().reply_to(
            "useful for critiquing",
            r#"{"is_valid": true, "reason": "weak", "valid_case_indices": [0], "confidence": 0.3}"#,
        );
        let caps = Capabilities::none().with_llm(Arc::new(llm));
        let case = case_with("Expired after paracentesis.", vec![similar("a", 0.9)]);

        let bundle = EvidenceRetriever::new(&config, &caps).first_pass(&case).await;

        assert_eq!(bundle.retrieval_mode, RetrievalMode::ExternalOnlyAfterValidation);
        assert_eq!(bundle.internal.count, 0);
        assert_eq!(bundle.validation_result.map(|v| v.is_valid), Some(false));
    }

    #[tokio::test]
    async fn unreachable_capabilities_degrade_without_failing() {
        let config = CriticConfig::default();
        let caps = Capabilities::none()
            .with_llm(Arc::new(UnreachableLlm))
            .with_literature(Arc::new(FakeLiterature::failing()));
        let case = case_with("Expired after paracentesis.", vec![similar("a", 0.9)]);

        let bundle = EvidenceRetriever::new(&config, &caps).first_pass(&case).await;

        assert_eq!(bundle.retrieval_mode, RetrievalMode::ExternalOnlyAfterValidation);
        assert_eq!(bundle.external.count, 0);
        assert_eq!(bundle.clinical_analysis.key_findings, vec!["diagnosis confirmed"]);
        assert!(bundle.external_query.ends_with("complication prevention guideline"));
        assert!(bundle.degradations.iter().any(|n| n.contains("literature search failed")));
        assert!(bundle.degradations.iter().any(|n| n.contains("validation failed")));
    }

    #[tokio::test]
    async fn heuristic_validation_accepts_cases_sharing_key_events() {
        let config = CriticConfig::default();
        let caps = Capabilities::none();
        let case = case_with(
            "Paracentesis done. Hemoperitoneum developed. Patient expired.",
            vec![similar("a", 0.9)],
        );

        let bundle = EvidenceRetriever::new(&config, &caps).first_pass(&case).await;

        assert_eq!(bundle.retrieval_mode, RetrievalMode::Hybrid);
        assert_eq!(bundle.internal.count, 1);
        assert_eq!(bundle.validation_result.map(|v| v.confidence), Some(1.0));
    }

    #[tokio::test]
    async fn second_pass_skips_without_issues_and_merges_idempotently() {
        let config = CriticConfig::default();
        let caps = Capabilities::none()
            .with_literature(Arc::new(FakeLiterature::with_ids(&["1", "7"])))
            .with_similarity(Arc::new(FakeSimilarity::new(vec![similar("x", 0.8), similar("y", 0.6)])));
        let case = case_with("Expired after paracentesis.", vec![]);
        let retriever = EvidenceRetriever::new(&config, &caps);

        assert!(retriever.second_pass(&case, &[]).await.is_none());

        let mut bundle = retriever.first_pass(&case).await;
        let issues = vec![
            issue("documentation gap", Severity::Low),
            issue("blind paracentesis", Severity::Critical),
        ];
        let pass = retriever.second_pass(&case, &issues).await.unwrap();
        assert!(pass.evidence.query.ends_with("complication management guideline"));
        assert_eq!(pass.evidence.internal_results.len(), 1);

        bundle.merge_second_pass(pass.clone());
        let counts = (bundle.internal.count, bundle.external.count);
        let again = retriever.second_pass(&case, &issues).await.unwrap();
        bundle.merge_second_pass(again);

        assert_eq!((bundle.internal.count, bundle.external.count), counts);
        assert_eq!(bundle.external.count, 2);
    }
}

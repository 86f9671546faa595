//! Treatment review: appropriateness of therapy choice, dose, timing and
//! disposition.

use serde::Deserialize;
use tracing::{info, warn};

use super::TreatmentAnalysis;
use crate::capability::{Capabilities, CompletionRequest, ask_json};
use crate::evidence::EvidenceBundle;
use crate::evidence::events::{MEDICATION_SEQUENCES, extract_key_events};
use crate::models::{Case, Outcome};
use crate::preprocess::{EventKind, PreprocessResult, TimelineEvent};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DispositionReply {
    risk_level: String,
    concern: String,
    recommendation: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TreatmentReply {
    #[serde(alias = "treatment_evaluation")]
    evaluation: String,
    medication_issues: Vec<String>,
    timing_issues: Vec<String>,
    disposition: String,
    disposition_evaluation: Option<DispositionReply>,
    recommendations: Vec<String>,
}

impl TreatmentReply {
    fn disposition_text(&self) -> String {
        if !self.disposition.trim().is_empty() {
            return self.disposition.clone();
        }
        match &self.disposition_evaluation {
            Some(d) if !d.concern.trim().is_empty() || !d.recommendation.trim().is_empty() => {
                format!("risk {}: {} {}", d.risk_level, d.concern, d.recommendation)
                    .trim()
                    .to_string()
            }
            _ => "not assessed".to_string(),
        }
    }
}

/// Deterioration events with no later response event in the timeline.
pub fn unanswered_deteriorations(timeline: &[TimelineEvent]) -> Vec<&TimelineEvent> {
    timeline
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind == EventKind::Deterioration)
        .filter(|(i, _)| !timeline[i + 1..].iter().any(|later| later.kind.is_response()))
        .map(|(_, e)| e)
        .collect()
}

/// Result built from keyword sequences and the timeline alone.
pub fn rule_based(case: &Case, preprocessing: &PreprocessResult, reason: String) -> TreatmentAnalysis {
    let events = extract_key_events(&case.text);
    let medication_issues: Vec<String> = events
        .critical_sequences
        .iter()
        .filter(|s| MEDICATION_SEQUENCES.contains(&s.as_str()))
        .map(|s| format!("Possible medication harm: {s}"))
        .collect();

    let timing_issues: Vec<String> = unanswered_deteriorations(&preprocessing.timeline)
        .into_iter()
        .map(|e| format!("No documented response after deterioration at {}: {}", e.id, e.text))
        .collect();

    let recommendations = medication_issues
        .iter()
        .map(|m| format!("Review indication and dosing ({})", m.trim_start_matches("Possible medication harm: ")))
        .chain(
            (!timing_issues.is_empty())
                .then(|| "Define escalation triggers and response times for deterioration".to_string()),
        )
        .collect();

    let disposition = match case.outcome {
        Outcome::Dead => "expired; disposition not applicable, review the course of care".to_string(),
        _ => "not assessed".to_string(),
    };

    TreatmentAnalysis {
        evaluation: "rule-based review only".to_string(),
        medication_issues,
        timing_issues,
        disposition,
        recommendations,
        degraded: Some(reason),
    }
}

pub struct TreatmentAnalyst<'a> {
    caps: &'a Capabilities,
}

impl<'a> TreatmentAnalyst<'a> {
    pub fn new(caps: &'a Capabilities) -> Self {
        Self { caps }
    }

    pub async fn analyze(
        &self,
        case: &Case,
        preprocessing: &PreprocessResult,
        evidence: &EvidenceBundle,
        lessons: &str,
    ) -> TreatmentAnalysis {
        let Some(llm) = self.caps.llm() else {
            return rule_based(case, preprocessing, "no language model configured".to_string());
        };

        let request = CompletionRequest::new(build_prompt(case, preprocessing, evidence, lessons))
            .system("You are an ICU attending reviewing whether treatment choice, dose, timing and disposition were appropriate.")
            .temperature(0.2)
            .max_tokens(1200);

        match ask_json::<TreatmentReply>(llm, request).await {
            Ok(reply) => {
                let disposition = reply.disposition_text();
                let analysis = TreatmentAnalysis {
                    evaluation: if reply.evaluation.trim().is_empty() {
                        "insufficient evidence".to_string()
                    } else {
                        reply.evaluation
                    },
                    medication_issues: non_blank(reply.medication_issues),
                    timing_issues: non_blank(reply.timing_issues),
                    disposition,
                    recommendations: non_blank(reply.recommendations),
                    degraded: None,
                };
                info!(
                    case_id = %case.id,
                    medication = analysis.medication_issues.len(),
                    timing = analysis.timing_issues.len(),
                    "Treatment analysis completed"
                );
                analysis
            }
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "Treatment analysis failed, using rule-based findings");
                rule_based(case, preprocessing, format!("treatment model unavailable: {e}"))
            }
        }
    }
}

fn non_blank(items: Vec<String>) -> Vec<String> {
    items.into_iter().filter(|s| !s.trim().is_empty()).collect()
}

fn build_prompt(case: &Case, preprocessing: &PreprocessResult, evidence: &EvidenceBundle, lessons: &str) -> String {
    let therapy: Vec<String> = preprocessing
        .timeline
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Medication | EventKind::Procedure | EventKind::Respiratory))
        .take(20)
        .map(|e| format!("- {} {}", e.id, e.text))
        .collect();

    format!(
        "{}\n\nInterventions already given (do not describe them as missing):\n{}\n\n\
         Lessons from past reviews:\n{}\n\nEvidence:\n{}\n\n\
         Assess treatment appropriateness: selection, dose, timing and guideline adherence. \
         If the patient expired, do not discuss early discharge; focus on complications, delays, \
         inappropriate drugs and monitoring failures. Return JSON only:\n\
         {{\"evaluation\": str, \"medication_issues\": [str], \"timing_issues\": [str], \
         \"disposition\": str, \"recommendations\": [str]}}",
        case.summary_line(),
        if therapy.is_empty() { "none recorded".to_string() } else { therapy.join("\n") },
        if lessons.trim().is_empty() { "none" } else { lessons },
        evidence.digest(3)
    )
}

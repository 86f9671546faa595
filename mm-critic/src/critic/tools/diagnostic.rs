use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use super::{CriticTool, ToolOutput};
use crate::capability::{Capabilities, CompletionRequest, LlmClient, ask_json};
use crate::critic::registry::tool_names;
use crate::critic::types::{AnalysisState, ToolCard};
use crate::preprocess::{SpanCategory, SpanMap};

const MAX_CLAIMS: usize = 6;
const MAX_CLAIM_CHARS: usize = 200;
const MAX_SUPPORTING: usize = 10;

static CLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:diagnosis|impression|assessment)\s*[:\-]\s*(.+)$").expect("static claim pattern")
});

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConsistencyReply {
    diagnosis_claims: Vec<String>,
    supporting_evidence: Vec<String>,
    gaps: Vec<String>,
    contradictions: Vec<String>,
}

pub struct DiagnosticConsistencyTool {
    card: ToolCard,
}

impl DiagnosticConsistencyTool {
    pub fn new() -> Self {
        Self {
            card: ToolCard::new(
                tool_names::DIAGNOSTIC_CONSISTENCY,
                "Checks whether diagnostic conclusions are aligned with the documented evidence; finds gaps and contradictions.",
            )
            .triggers(&["diagnosis strongly asserted", "thin supporting evidence", "alternative diagnoses need exclusion"])
            .contract(
                &["preprocessing.spans", "preprocessing.timeline"],
                &["claims", "supporting_evidence[span_id]", "gaps", "contradictions"],
            ),
        }
    }
}

fn heuristic(spans: &SpanMap, degraded: Option<String>) -> ToolOutput {
    let claims: Vec<String> = spans
        .by_category(SpanCategory::Assessment)
        .map(|s| s.quote.trim())
        .filter(|q| !q.is_empty())
        .map(|q| {
            let claim = CLAIM.captures(q).map_or(q, |c| c.get(1).map_or(q, |m| m.as_str()));
            claim.chars().take(MAX_CLAIM_CHARS).collect()
        })
        .take(MAX_CLAIMS)
        .collect();

    let gaps = if claims.is_empty() {
        vec!["no explicit diagnosis or assessment statement among the evidence spans (possible record gap)".to_string()]
    } else {
        Vec::new()
    };

    ToolOutput::DiagnosticConsistency {
        claims,
        supporting_evidence: assessment_span_ids(spans),
        gaps,
        contradictions: Vec::new(),
        degraded,
    }
}

fn assessment_span_ids(spans: &SpanMap) -> Vec<String> {
    spans
        .by_category(SpanCategory::Assessment)
        .take(MAX_SUPPORTING)
        .map(|s| s.id.clone())
        .collect()
}

async fn with_model(llm: &dyn LlmClient, state: &AnalysisState) -> Result<ToolOutput, String> {
    let patient = &state.patient;
    let mut payload = json!({
        "patient": {
            "age": patient.demographics.age,
            "sex": patient.demographics.sex,
            "admission_type": patient.demographics.admission_type,
            "admission_location": patient.demographics.admission_location,
            "outcome": patient.outcome,
        },
        "evidence_spans": state.preprocessing.spans,
        "timeline_events": state.preprocessing.timeline.iter().take(40).collect::<Vec<_>>(),
    });
    if let Some(dx) = &state.cohort.diagnosis {
        payload["reference_only_prior_diagnosis_findings"] = json!({
            "evaluation": dx.evaluation,
            "issues": dx.issues.iter().map(|i| &i.issue).collect::<Vec<_>>(),
            "missed_diagnoses": dx.missed_diagnoses.iter().map(|m| &m.diagnosis).collect::<Vec<_>>(),
        });
    }

    let prompt = format!(
        "You are a diagnostic reasoning auditor. Check whether diagnostic conclusions are aligned with evidence.\n\
         Input JSON: {payload}\n\
         If reference_only_prior_diagnosis_findings is present, use it only as reference; do not depend on it.\n\
         Return JSON only: {{\"diagnosis_claims\": [str], \"supporting_evidence\": [\"E1\"], \"gaps\": [str], \"contradictions\": [str]}}\n\
         Only cite span ids that exist. If the record is insufficient, say so in gaps."
    );
    let reply: ConsistencyReply = ask_json(llm, CompletionRequest::new(prompt).temperature(0.2).max_tokens(900))
        .await
        .map_err(|e| e.to_string())?;

    let spans = &state.preprocessing.spans;
    Ok(ToolOutput::DiagnosticConsistency {
        claims: reply.diagnosis_claims,
        supporting_evidence: reply
            .supporting_evidence
            .into_iter()
            .filter(|id| spans.contains(id.trim()))
            .collect(),
        gaps: reply.gaps,
        contradictions: reply.contradictions,
        degraded: None,
    })
}

#[async_trait]
impl CriticTool for DiagnosticConsistencyTool {
    fn card(&self) -> &ToolCard {
        &self.card
    }

    async fn run(&self, state: &AnalysisState, caps: &Capabilities) -> anyhow::Result<ToolOutput> {
        let spans = &state.preprocessing.spans;
        Ok(match caps.llm() {
            None => heuristic(spans, None),
            Some(llm) => match with_model(llm, state).await {
                Ok(output) => output,
                Err(e) => heuristic(spans, Some(format!("diagnostic consistency model unavailable: {e}"))),
            },
        })
    }
}

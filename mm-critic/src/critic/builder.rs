//! Critique synthesis from the accumulated analysis state.
//!
//! Every report, whatever its mode, passes through citation sanitizing and
//! the severity-hierarchy [`rerank`].

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::registry::tool_names;
use super::tools::ToolOutput;
use super::types::{AnalysisState, BuilderMode, CritiquePoint, CritiqueReport};
use crate::capability::{Capabilities, CompletionRequest, LlmClient, ask_json};
use crate::classify::{IssueClass, classify, critique_rank};
use crate::models::Severity;
use crate::preprocess::{RECORD_UNCERTAINTY, SpanMap};

const COHORT_SUMMARY_CHARS: usize = 400;

const SEVERITY_HIERARCHY: &str = "Severity hierarchy, in this order:\n\
1. Iatrogenic trauma or procedural complications (bleeding, organ injury, hemoperitoneum, perforation after \
paracentesis, central line, thoracentesis and similar): always the first point, severity high. Blind or \
undocumented technique in a high-risk procedure is severity high.\n\
2. Cause-of-death alignment: when the admission reason differs from the cause of death, name the actual death \
pathway and weight the last 24 hours (Hct drop, hemodynamic instability, procedure complications).\n\
3. Medication errors: important, but never above iatrogenic trauma.\n\
4. Other diagnostic or process issues.";

/// Orders critique points by the severity hierarchy: iatrogenic or
/// procedural complications first (severity forced to high), then
/// cause-of-death alignment, then the rest by stated severity. Stable, and
/// idempotent.
pub fn rerank(mut points: Vec<CritiquePoint>) -> Vec<CritiquePoint> {
    for point in &mut points {
        if classify(&rank_text(point)) == IssueClass::Iatrogenic {
            point.severity = Severity::High;
        }
    }
    points.sort_by_key(|p| critique_rank(&rank_text(p), p.severity));
    points
}

fn rank_text(point: &CritiquePoint) -> String {
    format!("{} {}", point.point, point.cohort_comparison)
}

/// Rewrites citations that do not resolve to `record_uncertainty`. Returns
/// the number of rewrites.
pub fn sanitize_citations(points: &mut [CritiquePoint], spans: &SpanMap) -> usize {
    let mut repairs = 0;
    for point in points {
        if !spans.resolves(point.span_id.trim()) {
            point.span_id = RECORD_UNCERTAINTY.to_string();
            repairs += 1;
        } else {
            point.span_id = point.span_id.trim().to_string();
        }
    }
    repairs
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PointReply {
    point: String,
    span_id: Option<String>,
    severity: Severity,
    cohort_comparison: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CritiqueReply {
    analysis: String,
    critique_points: Vec<PointReply>,
    risk_factors: Vec<String>,
    recommendations: Vec<String>,
}

pub struct CritiqueBuilder<'a> {
    caps: &'a Capabilities,
}

impl<'a> CritiqueBuilder<'a> {
    pub fn new(caps: &'a Capabilities) -> Self {
        Self { caps }
    }

    /// Builds a fresh report. On revision rounds `previous` and
    /// `patch_instructions` are handed to the model as context.
    pub async fn build(
        &self,
        state: &AnalysisState,
        previous: Option<&CritiqueReport>,
        patch_instructions: &str,
    ) -> CritiqueReport {
        let Some(llm) = self.caps.llm() else {
            debug!("No model configured, building critique heuristically");
            return heuristic_report(state, None);
        };
        match self.with_model(llm, state, previous, patch_instructions).await {
            Ok(report) => report,
            Err(e) => {
                warn!(case_id = %state.patient.id, error = %e, "Critique model failed, using heuristic critique");
                heuristic_report(state, Some(format!("critique model unavailable: {e}")))
            }
        }
    }

    async fn with_model(
        &self,
        llm: &dyn LlmClient,
        state: &AnalysisState,
        previous: Option<&CritiqueReport>,
        patch_instructions: &str,
    ) -> Result<CritiqueReport, String> {
        let patient = &state.patient;
        let mut payload = json!({
            "patient": {
                "id": patient.id,
                "age": patient.demographics.age,
                "sex": patient.demographics.sex,
                "status": patient.outcome,
                "admission_type": patient.demographics.admission_type,
                "admission_location": patient.demographics.admission_location,
            },
            "preprocessing": state.preprocessing,
            "lens_results": state.lens_results,
            "behavior_results": state.behavior_results,
            "previous_critique": previous,
            "patch_instructions": patch_instructions,
        });
        if let Some(reference) = reference_only(state) {
            payload["reference_only_prior_results"] = reference;
        }

        let mode_line = if previous.is_some() {
            "Revise the previous critique using patch_instructions; keep good parts and fix only what is requested."
        } else {
            "Generate a critique report."
        };
        let prompt = format!(
            "You are a critical medical process reviewer.\n{mode_line}\n\
             Use ONLY the provided structured evidence; do not invent unobserved facts. \
             reference_only_prior_results, if present, is reference only: do not depend on it. Base the critique on \
             preprocessing, lens_results and behavior_results.\n\nInput JSON:\n{payload}\n\n\
             Return JSON only: {{\"analysis\": \"2-6 sentences\", \"critique_points\": [{{\"point\": str, \
             \"span_id\": \"E1 | E2 | ... | record_uncertainty\", \"severity\": \"high|medium|low\", \
             \"cohort_comparison\": \"how similar cases differed\"}}], \"risk_factors\": [str], \"recommendations\": [str]}}\n\
             Every critique point MUST cite an existing span_id or record_uncertainty. When the record is \
             insufficient, say so. Use behavior_topk_direct_compare, if present, for cohort_comparison.\n\n\
             {SEVERITY_HIERARCHY}"
        );

        let reply: CritiqueReply = ask_json(llm, CompletionRequest::new(prompt).temperature(0.2).max_tokens(1600))
            .await
            .map_err(|e| e.to_string())?;

        let points = reply
            .critique_points
            .into_iter()
            .filter(|p| !p.point.trim().is_empty())
            .map(|p| CritiquePoint {
                point: p.point.trim().to_string(),
                span_id: p.span_id.unwrap_or_default(),
                severity: p.severity,
                cohort_comparison: p.cohort_comparison.unwrap_or_default(),
            })
            .collect();

        Ok(finish(
            state,
            CritiqueReport {
                patient_id: patient.id.clone(),
                analysis: reply.analysis,
                critique_points: points,
                risk_factors: reply.risk_factors,
                recommendations: reply.recommendations,
                citation_repairs: 0,
                mode: BuilderMode::Model,
                degraded: None,
            },
        ))
    }
}

/// Upstream analyses, passed to the model as context it must not rely on.
fn reference_only(state: &AnalysisState) -> Option<Value> {
    let cohort = &state.cohort;
    let mut reference = serde_json::Map::new();
    if let Some(diagnosis) = &cohort.diagnosis {
        reference.insert("diagnosis_analysis".into(), json!(diagnosis));
    }
    if let Some(treatment) = &cohort.treatment {
        reference.insert("treatment_analysis".into(), json!(treatment));
    }
    if !cohort.evidence_digest.is_empty() {
        reference.insert("evidence".into(), json!(cohort.evidence_digest));
    }
    (!reference.is_empty()).then_some(Value::Object(reference))
}

fn finish(state: &AnalysisState, mut report: CritiqueReport) -> CritiqueReport {
    report.citation_repairs = sanitize_citations(&mut report.critique_points, &state.preprocessing.spans);
    report.critique_points = rerank(std::mem::take(&mut report.critique_points));
    report
}

/// At most three points drawn from the lens outputs already computed.
fn heuristic_report(state: &AnalysisState, degraded: Option<String>) -> CritiqueReport {
    let cohort_comparison = match state.result(tool_names::TOPK_COMPARE) {
        Some(ToolOutput::TopKCompare { summary, .. }) if !summary.is_empty() => {
            summary.chars().take(COHORT_SUMMARY_CHARS).collect()
        }
        _ => "N/A".to_string(),
    };
    let point = |text: &str, span_id: &str, severity: Severity| CritiquePoint {
        point: text.to_string(),
        span_id: span_id.to_string(),
        severity,
        cohort_comparison: cohort_comparison.clone(),
    };

    let mut points = Vec::new();
    let mut risk_factors = Vec::new();

    if let Some(ToolOutput::SeverityRisk { flags, .. }) = state.result(tool_names::SEVERITY_RISK)
        && let Some(first) = flags.first()
    {
        let signals: Vec<&str> = flags.iter().map(|f| f.signal.as_str()).collect();
        points.push(point(
            &format!(
                "Severity and risk signals are present ({}); review whether monitoring, level of care and escalation were appropriate.",
                signals.join(", ")
            ),
            &first.span_id,
            Severity::High,
        ));
        risk_factors.extend(signals.into_iter().map(str::to_string));
    }

    if let Some(ToolOutput::MonitoringResponse { lags, .. }) = state.result(tool_names::MONITORING_RESPONSE)
        && let Some(first) = lags.first()
    {
        points.push(point(
            "The response to deterioration (reassessment or change of treatment) may have been delayed.",
            &first.span_id,
            Severity::High,
        ));
    }

    if let Some(ToolOutput::DiagnosticConsistency { gaps, contradictions, .. }) =
        state.result(tool_names::DIAGNOSTIC_CONSISTENCY)
        && (!gaps.is_empty() || !contradictions.is_empty())
    {
        points.push(point(
            "Diagnostic conclusions may not be sufficiently aligned with the documented evidence; check the grounds for excluding alternatives and the need for further evaluation.",
            RECORD_UNCERTAINTY,
            Severity::Medium,
        ));
    }

    finish(
        state,
        CritiqueReport {
            patient_id: state.patient.id.clone(),
            analysis: "Critique summarised from tool outputs without a language model; top-K comparison, when available, is reflected in cohort_comparison.".to_string(),
            critique_points: points,
            risk_factors,
            recommendations: Vec::new(),
            citation_repairs: 0,
            mode: BuilderMode::Heuristic,
            degraded,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::critic::registry::ToolRegistry;
    use crate::critic::runner::BudgetedRunner;
    use crate::critic::types::CohortData;
    use crate::preprocess::preprocess;
    use crate::test_support::{ScriptedLlm, UnreachableLlm, case_with};

    const TEXT: &str = "BP 78/40 at 02:00 with hypotension and lactate 6.\n\
        Paracentesis performed at 03:00.\n\
        Assessment: septic shock from SBP.\n\
        At 09:00 patient became unresponsive.";

    fn point(text: &str, severity: Severity) -> CritiquePoint {
        CritiquePoint {
            point: text.to_string(),
            span_id: "E1".to_string(),
            severity,
            cohort_comparison: String::new(),
        }
    }

    #[test]
    fn iatrogenic_point_goes_first_as_high() {
        let points = vec![
            point("Benzodiazepine given despite encephalopathy", Severity::High),
            point("Antibiotics started late", Severity::Medium),
            point("Cause of death not reconciled with admission", Severity::Low),
            point("Iatrogenic hemoperitoneum after paracentesis was not recognised", Severity::Low),
        ];

        let ranked = rerank(points);

        assert!(ranked[0].point.starts_with("Iatrogenic hemoperitoneum"));
        assert_eq!(ranked[0].severity, Severity::High);
        assert!(ranked[1].point.starts_with("Cause of death"));
        assert!(ranked[2].point.starts_with("Benzodiazepine"));
        assert_eq!(rerank(ranked.clone()), ranked);
    }

    #[test]
    fn unresolvable_citations_are_repaired_and_counted() {
        let spans = preprocess(TEXT).spans;
        let mut points = vec![point("a", Severity::Low), point("b", Severity::Low), point("c", Severity::Low)];
        points[1].span_id = "E99".to_string();
        points[2].span_id = String::new();

        let repairs = sanitize_citations(&mut points, &spans);

        assert_eq!(repairs, 2);
        assert_eq!(points[0].span_id, "E1");
        assert_eq!(points[1].span_id, RECORD_UNCERTAINTY);
        assert_eq!(points[2].span_id, RECORD_UNCERTAINTY);
    }

    async fn analysed_state() -> AnalysisState {
        let registry = ToolRegistry::default();
        let caps = Capabilities::none();
        let mut state = AnalysisState::new(case_with(TEXT, vec![]), CohortData::default(), preprocess(TEXT));
        let runner = BudgetedRunner::new(&registry, &caps, 8);
        runner.run_base(&mut state).await;
        let selected: Vec<String> = ["lens_severity_risk", "lens_monitoring_response", "lens_diagnostic_consistency"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        runner.run_round(&mut state, &selected, &[]).await;
        state
    }

    #[tokio::test]
    async fn heuristic_report_draws_from_lens_outputs() {
        let state = analysed_state().await;

        let report = CritiqueBuilder::new(&Capabilities::none()).build(&state, None, "").await;

        assert_eq!(report.mode, BuilderMode::Heuristic);
        assert!(report.degraded.is_none());
        assert!(!report.critique_points.is_empty() && report.critique_points.len() <= 3);
        assert!(report.critique_points.iter().all(|p| state.preprocessing.spans.resolves(&p.span_id)));
        assert!(report.risk_factors.contains(&"shock_or_hypotension".to_string()));
    }

    #[tokio::test]
    async fn model_points_are_sanitized_and_reranked() {
        let state = analysed_state().await;
        let llm = ScriptedLlm::new().reply_to(
            "critical medical process reviewer",
            r#"{"analysis": "Two issues.",
                "critique_points": [
                    {"point": "Fluids were delayed", "span_id": "E1", "severity": "medium"},
                    {"point": "Procedure-related bleeding after paracentesis was missed", "span_id": "E42", "severity": "low"},
                    {"point": "   ", "span_id": "E1", "severity": "high"}
                ],
                "risk_factors": ["cirrhosis"],
                "recommendations": ["Use ultrasound guidance"]}"#,
        );
        let caps = Capabilities::none().with_llm(Arc::new(llm));

        let report = CritiqueBuilder::new(&caps).build(&state, None, "").await;

        assert_eq!(report.mode, BuilderMode::Model);
        assert_eq!(report.critique_points.len(), 2);
        assert!(report.critique_points[0].point.starts_with("Procedure-related"));
        assert_eq!(report.critique_points[0].severity, Severity::High);
        assert_eq!(report.critique_points[0].span_id, RECORD_UNCERTAINTY);
        assert_eq!(report.citation_repairs, 1);
    }

    #[tokio::test]
    async fn revision_prompt_carries_previous_critique() {
        let state = analysed_state().await;
        let llm = Arc::new(ScriptedLlm::new().reply_to("Revise the previous critique", r#"{"analysis": "revised"}"#));
        let caps = Capabilities::none().with_llm(llm.clone());
        let previous = CritiqueReport {
            analysis: "first draft".to_string(),
            ..Default::default()
        };

        let report = CritiqueBuilder::new(&caps)
            .build(&state, Some(&previous), "cite the lactate")
            .await;

        assert_eq!(report.analysis, "revised");
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("first draft") && prompt.contains("cite the lactate"));
    }

    #[tokio::test]
    async fn unreachable_model_degrades_to_heuristic() {
        let state = analysed_state().await;
        let caps = Capabilities::none().with_llm(Arc::new(UnreachableLlm));

        let report = CritiqueBuilder::new(&caps).build(&state, None, "").await;

        assert_eq!(report.mode, BuilderMode::Heuristic);
        assert!(report.degraded.as_deref().unwrap().contains("connection refused"));
    }
}

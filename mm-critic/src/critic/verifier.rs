//! Corrective actions for the final critique, each backed by a similar case
//! or a literature reference. Runs once, after the critique loop.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::CritiqueReport;
use crate::capability::{Capabilities, CompletionRequest, LlmClient, ask_json};
use crate::models::{LiteratureArticle, Severity, SimilarCase};

const MAX_CASES: usize = 3;
const CASE_TEXT_CHARS: usize = 3000;

static SIMILAR_CASE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)similar\s+case\s*#?\s*(\d+)").expect("static similar case pattern"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub issue: String,
    pub solution: String,
    /// "Similar Case N" and/or literature source ids
    pub evidence: String,
    #[serde(default)]
    pub priority: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub patient_id: String,
    pub solutions: Vec<Solution>,
    /// Solutions dropped because their evidence cited nothing known
    pub dropped: usize,
    pub degraded: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerifierReply {
    solutions: Vec<Solution>,
}

/// True when `evidence` names a supplied similar case by position or a
/// known literature source id.
pub fn cites_known_source(evidence: &str, case_count: usize, literature: &[LiteratureArticle]) -> bool {
    let cases = 1..=case_count.min(MAX_CASES);
    let cites_case = SIMILAR_CASE_REF
        .captures_iter(evidence)
        .any(|c| c[1].parse::<usize>().is_ok_and(|n| cases.contains(&n)));
    cites_case
        || evidence
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| !token.is_empty() && literature.iter().any(|a| a.source_id == token))
}

pub struct SolutionVerifier<'a> {
    caps: &'a Capabilities,
}

impl<'a> SolutionVerifier<'a> {
    pub fn new(caps: &'a Capabilities) -> Self {
        Self { caps }
    }

    pub async fn verify(
        &self,
        report: &CritiqueReport,
        similar: &[SimilarCase],
        literature: &[LiteratureArticle],
    ) -> VerificationResult {
        let similar = &similar[..similar.len().min(MAX_CASES)];
        if similar.is_empty() && literature.is_empty() {
            warn!(patient_id = %report.patient_id, "No similar cases or literature, skipping solutions");
            return VerificationResult {
                patient_id: report.patient_id.clone(),
                degraded: Some("no similar cases or literature to cite".to_string()),
                ..Default::default()
            };
        }

        let Some(llm) = self.caps.llm() else {
            debug!("No model configured, deriving solutions heuristically");
            return heuristic(report, similar, literature, None);
        };
        match with_model(llm, report, similar, literature).await {
            Ok(result) if !result.solutions.is_empty() || result.dropped == 0 => result,
            Ok(result) => {
                warn!(dropped = result.dropped, "Every model solution lacked a valid citation");
                heuristic(
                    report,
                    similar,
                    literature,
                    Some(format!("{} model solutions cited no known source", result.dropped)),
                )
            }
            Err(e) => {
                warn!(error = %e, "Verifier model failed, deriving solutions heuristically");
                heuristic(report, similar, literature, Some(format!("verifier model unavailable: {e}")))
            }
        }
    }
}

fn bullets(items: impl IntoIterator<Item = String>) -> String {
    let lines: Vec<String> = items.into_iter().map(|i| format!("- {i}")).collect();
    if lines.is_empty() {
        "- None".to_string()
    } else {
        lines.join("\n")
    }
}

fn metadata_str(case: &SimilarCase, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| case.metadata.get(*k))
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "N/A".to_string())
}

async fn with_model(
    llm: &dyn LlmClient,
    report: &CritiqueReport,
    similar: &[SimilarCase],
    literature: &[LiteratureArticle],
) -> Result<VerificationResult, String> {
    let critique_block = format!(
        "[CRITIQUE]\nCritique Points:\n{}\n\nRisk Factors:\n{}\n\nRecommendations:\n{}",
        bullets(
            report
                .critique_points
                .iter()
                .map(|p| format!("({}) {} [{}]", p.severity, p.point, p.span_id))
        ),
        bullets(report.risk_factors.iter().cloned()),
        bullets(report.recommendations.iter().cloned()),
    );
    let case_block: String = similar
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "\n[Similar Case {}]\n- Age/Sex: {}/{}\n- Outcome: {}\n- Clinical Note:\n{}\n",
                i + 1,
                metadata_str(c, &["age", "anchor_age"]),
                metadata_str(c, &["sex", "gender"]),
                c.outcome,
                c.text.chars().take(CASE_TEXT_CHARS).collect::<String>(),
            )
        })
        .collect();
    let literature_block = bullets(
        literature
            .iter()
            .map(|a| format!("[{}] {}", a.source_id, a.title)),
    );

    let prompt = format!(
        "You are a senior clinical decision verifier.\n\
         Based on the critique, the similar cases and the literature, generate concrete SOLUTIONS that directly \
         address the critique points.\n\
         Each solution MUST cite at least one source in `evidence`: \"Similar Case N\" or a literature id in brackets. \
         Do not invent medical facts. Be concise, actionable and clinically realistic.\n\
         Output JSON only: {{\"solutions\": [{{\"issue\": str, \"solution\": str, \"evidence\": \"Similar Case 1 / 2 / 3 or literature id\", \
         \"priority\": \"high | medium | low\"}}]}}\n\n{critique_block}\n\n[SIMILAR CASES]{case_block}\n\n[LITERATURE]\n{literature_block}"
    );
    let reply: VerifierReply = ask_json(llm, CompletionRequest::new(prompt).temperature(0.3).max_tokens(4000))
        .await
        .map_err(|e| e.to_string())?;

    let total = reply.solutions.len();
    let solutions: Vec<Solution> = reply
        .solutions
        .into_iter()
        .filter(|s| cites_known_source(&s.evidence, similar.len(), literature))
        .collect();
    Ok(VerificationResult {
        patient_id: report.patient_id.clone(),
        dropped: total - solutions.len(),
        solutions,
        degraded: None,
    })
}

/// One solution per critique point, citing the first available source.
fn heuristic(
    report: &CritiqueReport,
    similar: &[SimilarCase],
    literature: &[LiteratureArticle],
    degraded: Option<String>,
) -> VerificationResult {
    let evidence = match (similar.first(), literature.first()) {
        (Some(_), _) => "Similar Case 1".to_string(),
        (None, Some(article)) => format!("[{}] {}", article.source_id, article.title),
        (None, None) => String::new(),
    };

    let mut solutions: Vec<Solution> = report
        .critique_points
        .iter()
        .take(MAX_CASES)
        .enumerate()
        .map(|(i, p)| Solution {
            issue: p.point.clone(),
            solution: report
                .recommendations
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("Review the documented care process for: {}", p.point)),
            evidence: evidence.clone(),
            priority: p.severity,
        })
        .collect();
    if solutions.is_empty() {
        solutions = report
            .recommendations
            .iter()
            .take(MAX_CASES)
            .map(|r| Solution {
                issue: "General recommendation".to_string(),
                solution: r.clone(),
                evidence: evidence.clone(),
                priority: Severity::Medium,
            })
            .collect();
    }

    VerificationResult {
        patient_id: report.patient_id.clone(),
        solutions,
        dropped: 0,
        degraded,
    }
}

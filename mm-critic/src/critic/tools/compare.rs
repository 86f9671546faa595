use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{CriticTool, ToolOutput, light_tokens};
use crate::capability::{Capabilities, CompletionRequest, LlmClient, ask_json};
use crate::critic::registry::tool_names;
use crate::critic::types::{AnalysisState, ToolCard};
use crate::models::SimilarCase;
use crate::preprocess::SpanMap;

const TOP_K: usize = 3;
const PATIENT_SPANS: usize = 25;
const TOKEN_LIMIT: usize = 400;
const CASE_TEXT_CHARS: usize = 6000;
const PROMPT_TEXT_CHARS: usize = 2500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseComparison {
    pub rank: usize,
    pub case_id: String,
    pub similarity: f64,
    #[serde(default)]
    pub overlap_terms: Vec<String>,
    #[serde(default)]
    pub overlap_count: usize,
    #[serde(default)]
    pub key_similarities: Vec<String>,
    #[serde(default)]
    pub key_differences: Vec<String>,
    /// Patient span ids backing the comparison
    #[serde(default)]
    pub evidence_links: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EvidenceLink {
    span_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ComparisonReply {
    case_id: String,
    key_similarities: Vec<String>,
    key_differences: Vec<String>,
    evidence_links: Vec<EvidenceLink>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CompareReply {
    comparisons: Vec<ComparisonReply>,
    summary: String,
}

fn heuristic(cases: &[SimilarCase], spans: &SpanMap, degraded: Option<String>) -> ToolOutput {
    let patient_terms: Vec<String> = spans
        .iter()
        .take(PATIENT_SPANS)
        .flat_map(|s| light_tokens(&s.quote, TOKEN_LIMIT))
        .collect();

    let comparisons: Vec<CaseComparison> = cases
        .iter()
        .take(TOP_K)
        .enumerate()
        .map(|(i, case)| {
            let text: String = case.text.chars().take(CASE_TEXT_CHARS).collect();
            let case_terms = light_tokens(&text, TOKEN_LIMIT);
            let mut overlap: Vec<String> = Vec::new();
            for term in &patient_terms {
                if case_terms.contains(term) && !overlap.contains(term) {
                    overlap.push(term.clone());
                }
            }
            CaseComparison {
                rank: i + 1,
                case_id: case.id.clone(),
                similarity: case.similarity,
                overlap_count: overlap.len(),
                overlap_terms: overlap.into_iter().take(20).collect(),
                key_similarities: Vec::new(),
                key_differences: Vec::new(),
                evidence_links: Vec::new(),
            }
        })
        .collect();

    let summary = format!(
        "Compared shared terms between the patient's evidence spans and {} similar case(s) (token overlap).",
        comparisons.len()
    );
    ToolOutput::TopKCompare {
        comparisons,
        summary,
        degraded,
    }
}

async fn with_model(llm: &dyn LlmClient, state: &AnalysisState, cases: &[SimilarCase]) -> Result<ToolOutput, String> {
    let patient = &state.patient;
    let cases_block: Vec<_> = cases
        .iter()
        .take(TOP_K)
        .enumerate()
        .map(|(i, c)| {
            json!({
                "rank": i + 1,
                "case_id": c.id,
                "similarity": c.similarity,
                "outcome": c.outcome,
                "text": c.text.chars().take(PROMPT_TEXT_CHARS).collect::<String>(),
            })
        })
        .collect();
    let payload = json!({
        "patient": {
            "id": patient.id,
            "age": patient.demographics.age,
            "sex": patient.demographics.sex,
            "text": patient.text.chars().take(PROMPT_TEXT_CHARS).collect::<String>(),
        },
        "patient_evidence_spans": state.preprocessing.spans,
        "similar_cases": cases_block,
    });
    let prompt = format!(
        "You are a contrastive comparator for clinical process review. Compare the patient to each similar case \
         (problems, workup, therapies, monitoring and response).\nInput JSON: {payload}\n\
         Return JSON only: {{\"comparisons\": [{{\"case_id\": str, \"key_similarities\": [str], \"key_differences\": [str], \
         \"evidence_links\": [{{\"span_id\": \"E1\", \"why\": str}}]}}], \"summary\": \"1-3 sentences\"}}\n\
         evidence_links must use existing span ids or record_uncertainty."
    );
    let reply: CompareReply = ask_json(llm, CompletionRequest::new(prompt).temperature(0.2).max_tokens(1200))
        .await
        .map_err(|e| e.to_string())?;

    let spans = &state.preprocessing.spans;
    let comparisons = reply
        .comparisons
        .into_iter()
        .filter_map(|c| {
            let (rank, case) = cases
                .iter()
                .take(TOP_K)
                .enumerate()
                .find(|(_, known)| known.id == c.case_id)?;
            Some(CaseComparison {
                rank: rank + 1,
                case_id: c.case_id,
                similarity: case.similarity,
                overlap_terms: Vec::new(),
                overlap_count: 0,
                key_similarities: c.key_similarities,
                key_differences: c.key_differences,
                evidence_links: c
                    .evidence_links
                    .into_iter()
                    .map(|l| l.span_id)
                    .filter(|id| spans.resolves(id))
                    .collect(),
            })
        })
        .collect();

    Ok(ToolOutput::TopKCompare {
        comparisons,
        summary: reply.summary,
        degraded: None,
    })
}

pub struct TopKCompareTool {
    card: ToolCard,
}

impl TopKCompareTool {
    pub fn new() -> Self {
        Self {
            card: ToolCard::new(
                tool_names::TOPK_COMPARE,
                "Compares the patient item by item with the top-K similar cases to strengthen evidence.",
            )
            .triggers(&["short narrative", "evidence needs corroboration", "similar cases exist"])
            .anti_triggers(&["no similar cases retrieved"])
            .contract(&["cohort.similar_cases", "preprocessing.spans"], &["comparisons", "summary"]),
        }
    }
}

#[async_trait]
impl CriticTool for TopKCompareTool {
    fn card(&self) -> &ToolCard {
        &self.card
    }

    async fn run(&self, state: &AnalysisState, caps: &Capabilities) -> anyhow::Result<ToolOutput> {
        let cases = &state.cohort.similar_cases;
        let spans = &state.preprocessing.spans;
        if cases.is_empty() {
            return Ok(ToolOutput::TopKCompare {
                comparisons: Vec::new(),
                summary: "No similar cases available, comparison skipped.".to_string(),
                degraded: None,
            });
        }
        Ok(match caps.llm() {
            None => heuristic(cases, spans, None),
            Some(llm) => match with_model(llm, state, cases).await {
                Ok(output) => output,
                Err(e) => heuristic(cases, spans, Some(format!("comparison model unavailable: {e}"))),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critic::types::CohortData;
    use crate::models::Outcome;
    use crate::preprocess::preprocess;
    use crate::test_support::case_with;

    fn similar(id: &str, text: &str, similarity: f64) -> SimilarCase {
        SimilarCase {
            id: id.to_string(),
            text: text.to_string(),
            similarity,
            outcome: Outcome::Dead,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn heuristic_counts_shared_terms_for_top_three() {
        let text = "Paracentesis performed on day 2 for tense ascites.\nHemoglobin fell to 6.1 after the tap.";
        let cohort = CohortData {
            similar_cases: vec![
                similar("a", "Tense ascites, paracentesis, then hemoglobin drop.", 0.9),
                similar("b", "Unrelated fracture.", 0.8),
                similar("c", "Ascites.", 0.75),
                similar("d", "Paracentesis ascites hemoglobin.", 0.72),
            ],
            ..Default::default()
        };
        let state = AnalysisState::new(case_with(text, vec![]), cohort, preprocess(text));

        let output = TopKCompareTool::new().run(&state, &Capabilities::none()).await.unwrap();

        let ToolOutput::TopKCompare { comparisons, .. } = output else {
            panic!("expected comparison output");
        };
        assert_eq!(comparisons.len(), 3);
        assert_eq!(comparisons[0].overlap_terms, vec!["paracentesis", "tense", "ascites", "hemoglobin"]);
        assert_eq!(comparisons[1].overlap_count, 0);
        assert_eq!(comparisons[2].rank, 3);
    }

    #[tokio::test]
    async fn no_similar_cases_means_empty_comparison() {
        let text = "Paracentesis performed on day 2.";
        let state = AnalysisState::new(case_with(text, vec![]), CohortData::default(), preprocess(text));
        let output = TopKCompareTool::new().run(&state, &Capabilities::none()).await.unwrap();
        assert!(matches!(output, ToolOutput::TopKCompare { ref comparisons, .. } if comparisons.is_empty()));
    }
}

//! Sufficiency judgement of a critique report. Drives the bounded
//! critique loop through [`CriticLoop::record`](super::types::CriticLoop::record).

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::registry::tool_names;
use super::types::{AnalysisState, CritiqueReport, FeedbackDecision};
use crate::capability::{Capabilities, CompletionRequest, LlmClient, ask_json};

/// Tools requested when the heuristic judge finds too few points.
const STRENGTHENING_TOOLS: [&str; 2] = [tool_names::TOPK_COMPARE, tool_names::DIAGNOSTIC_CONSISTENCY];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JudgeReply {
    ok: bool,
    reason: String,
    requested_tools: Vec<String>,
    patch_instructions: String,
}

pub struct FeedbackJudge<'a> {
    caps: &'a Capabilities,
    min_points: usize,
}

impl<'a> FeedbackJudge<'a> {
    pub fn new(caps: &'a Capabilities, min_points: usize) -> Self {
        Self { caps, min_points }
    }

    pub async fn decide(&self, state: &AnalysisState, report: &CritiqueReport, available: &[String]) -> FeedbackDecision {
        let Some(llm) = self.caps.llm() else {
            return self.heuristic(report, available);
        };
        match self.with_model(llm, state, report, available).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Feedback model failed, judging heuristically");
                let mut decision = self.heuristic(report, available);
                decision.reason = format!("feedback model unavailable ({e}); {}", decision.reason);
                decision
            }
        }
    }

    /// Accepts when there are enough points and none lost its citation.
    pub fn heuristic(&self, report: &CritiqueReport, available: &[String]) -> FeedbackDecision {
        let points = report.critique_points.len();
        let missing = report.citation_repairs
            + report
                .critique_points
                .iter()
                .filter(|p| p.span_id.trim().is_empty())
                .count();

        let requested_tools = if points < self.min_points {
            STRENGTHENING_TOOLS
                .iter()
                .filter(|t| available.iter().any(|a| a == *t))
                .map(|t| t.to_string())
                .collect()
        } else {
            Vec::new()
        };

        let decision = FeedbackDecision {
            ok: points >= self.min_points && missing == 0,
            reason: format!("heuristic_feedback points={points} missing_span_id={missing}"),
            requested_tools,
            patch_instructions: String::new(),
        };
        debug!(ok = decision.ok, reason = %decision.reason, "Heuristic feedback");
        decision
    }

    async fn with_model(
        &self,
        llm: &dyn LlmClient,
        state: &AnalysisState,
        report: &CritiqueReport,
        available: &[String],
    ) -> Result<FeedbackDecision, String> {
        let payload = json!({
            "router": state.router,
            "evidence_span_count": state.preprocessing.spans.len(),
            "lens_keys": state.lens_results.keys().collect::<Vec<_>>(),
            "behavior_keys": state.behavior_results.keys().collect::<Vec<_>>(),
            "critique": report,
            "available_tools": available,
        });
        let prompt = format!(
            "You are a quality judge for a clinical critique report.\n\
             Decide if the report is sufficient for a user-facing output. If it is not, request additional tools \
             (from available_tools) and give short patch instructions.\n\nInput JSON:\n{payload}\n\n\
             Output JSON only: {{\"ok\": true|false, \"reason\": \"one short sentence\", \"requested_tools\": [\"tool_name\"], \
             \"patch_instructions\": \"how to revise the critique after tools run (1-3 sentences)\"}}\n\
             requested_tools MUST be a subset of available_tools; prefer the minimal set. Preprocessing has already run, \
             do not ask for it again."
        );
        let reply: JudgeReply = ask_json(llm, CompletionRequest::new(prompt).temperature(0.1).max_tokens(400))
            .await
            .map_err(|e| e.to_string())?;

        let mut requested_tools: Vec<String> = Vec::new();
        for name in reply.requested_tools {
            let name = name.trim();
            if available.iter().any(|a| a == name) && !requested_tools.iter().any(|t| t == name) {
                requested_tools.push(name.to_string());
            }
        }
        Ok(FeedbackDecision {
            ok: reply.ok,
            reason: reply.reason,
            requested_tools,
            patch_instructions: reply.patch_instructions,
        })
    }
}

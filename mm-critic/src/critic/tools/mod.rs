//! Critic tools. Each tool reads the analysis state and returns a typed
//! output; [`safe_run`] turns failures into trace entries.

pub mod compare;
pub mod diagnostic;
pub mod monitoring;
pub mod preprocessing;
pub mod severity;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::types::{AnalysisState, ToolCard, TraceStatus};
use crate::capability::Capabilities;
use crate::preprocess::{RecordGaps, SpanMap, TimelineEvent};

pub use compare::{CaseComparison, TopKCompareTool};
pub use diagnostic::DiagnosticConsistencyTool;
pub use monitoring::{EventRef, MonitoringResponseTool, ResponseLag};
pub use preprocessing::{EvidenceTool, RecordGapsTool, TimelineTool};
pub use severity::{SeverityFlag, SeverityRiskTool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    Timeline {
        events: Vec<TimelineEvent>,
    },
    Evidence {
        spans: SpanMap,
    },
    RecordGaps {
        gaps: RecordGaps,
        notes: Vec<String>,
    },
    SeverityRisk {
        flags: Vec<SeverityFlag>,
        missing_severity_assessment: Vec<String>,
    },
    DiagnosticConsistency {
        claims: Vec<String>,
        supporting_evidence: Vec<String>,
        gaps: Vec<String>,
        contradictions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        degraded: Option<String>,
    },
    MonitoringResponse {
        deterioration_points: Vec<EventRef>,
        response_actions: Vec<EventRef>,
        lags: Vec<ResponseLag>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        degraded: Option<String>,
    },
    TopKCompare {
        comparisons: Vec<CaseComparison>,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        degraded: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl ToolOutput {
    /// Why a model-backed tool fell back to its heuristic, if it did.
    pub fn degraded(&self) -> Option<&str> {
        match self {
            ToolOutput::DiagnosticConsistency { degraded, .. }
            | ToolOutput::MonitoringResponse { degraded, .. }
            | ToolOutput::TopKCompare { degraded, .. } => degraded.as_deref(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CriticTool: Send + Sync {
    fn card(&self) -> &ToolCard;

    fn name(&self) -> &str {
        &self.card().name
    }

    async fn run(&self, state: &AnalysisState, caps: &Capabilities) -> anyhow::Result<ToolOutput>;
}

/// Runs `tool` and records the outcome in the trace. Never fails: an error
/// becomes `ToolOutput::Failed` plus an `error` entry.
pub async fn safe_run(tool: &dyn CriticTool, state: &mut AnalysisState, caps: &Capabilities) -> ToolOutput {
    let name = tool.name().to_string();
    match tool.run(state, caps).await {
        Ok(output) => {
            match output.degraded() {
                Some(reason) => {
                    warn!(tool = %name, reason, "Tool fell back to heuristic mode");
                    state.trace.push(&name, TraceStatus::Degraded, Some(json!({ "reason": reason })));
                }
                None => {
                    debug!(tool = %name, "Tool completed");
                    state.trace.push(&name, TraceStatus::Ok, None);
                }
            }
            output
        }
        Err(e) => {
            warn!(tool = %name, error = %e, "Tool failed");
            let error = format!("{e:#}");
            state.trace.push(&name, TraceStatus::Error, Some(json!({ "error": error })));
            ToolOutput::Failed { error }
        }
    }
}

/// Lowercase alphanumeric tokens of at least three characters, first
/// occurrence order, deduplicated.
pub(crate) fn light_tokens(text: &str, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
    {
        if out.len() >= limit {
            break;
        }
        if !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

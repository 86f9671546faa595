//! Tool selection. The heuristic router needs nothing but the narrative;
//! the capability router ranks tool cards with ToolRAG and asks the model,
//! falling back to the heuristic whenever the model is absent, unreachable
//! or returns nothing usable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::registry::{ToolRegistry, tool_names};
use super::toolrag::ToolRagIndex;
use super::types::{AnalysisState, ToolSelection};
use crate::capability::{Capabilities, CompletionRequest, LlmClient, ask_json};

const SEVERE_KEYWORDS: &[&str] = &[
    "shock",
    "hypotension",
    "intub",
    "vent",
    "respiratory failure",
    "sepsis",
    "lactate",
    "pressors",
    "icu",
    "rapid response",
    "code blue",
];

const DX_KEYWORDS: &[&str] = &["diagnosis", "impression", "assessment", "a/p", "ddx", "differential"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterStrategy {
    #[default]
    Heuristic,
    Capability,
}

impl FromStr for RouterStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heuristic" => Ok(RouterStrategy::Heuristic),
            "capability" | "llm" => Ok(RouterStrategy::Capability),
            other => Err(format!("unknown router strategy: {other}")),
        }
    }
}

impl fmt::Display for RouterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterStrategy::Heuristic => f.write_str("heuristic"),
            RouterStrategy::Capability => f.write_str("capability"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthBucket {
    VeryShort,
    Short,
    Medium,
    Long,
}

impl LengthBucket {
    pub fn of(text: &str) -> Self {
        match text.chars().count() {
            n if n < 600 => LengthBucket::VeryShort,
            n if n < 1500 => LengthBucket::Short,
            n if n < 4000 => LengthBucket::Medium,
            _ => LengthBucket::Long,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LengthBucket::VeryShort => "very_short",
            LengthBucket::Short => "short",
            LengthBucket::Medium => "medium",
            LengthBucket::Long => "long",
        }
    }
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|kw| lower.contains(kw))
}

/// Keyword-triggered selection; no capability calls.
pub fn heuristic_selection(state: &AnalysisState, available: &[String], round: u32) -> ToolSelection {
    let text = &state.patient.text;
    let bucket = LengthBucket::of(text);
    let severe = contains_any(text, SEVERE_KEYWORDS);
    let dx_claim = contains_any(text, DX_KEYWORDS);

    let mut wanted: Vec<&str> = Vec::new();
    if severe || state.patient.outcome.is_known() {
        wanted.extend([tool_names::SEVERITY_RISK, tool_names::MONITORING_RESPONSE]);
    }
    if dx_claim || matches!(bucket, LengthBucket::Medium | LengthBucket::Long) {
        wanted.push(tool_names::DIAGNOSTIC_CONSISTENCY);
    }
    if matches!(bucket, LengthBucket::VeryShort | LengthBucket::Short) {
        wanted.push(tool_names::TOPK_COMPARE);
    }

    let tools = wanted
        .into_iter()
        .filter(|t| available.iter().any(|a| a == t))
        .map(str::to_string)
        .collect();

    ToolSelection {
        round,
        tools,
        reason: format!(
            "heuristic_router bucket={} severe={severe} dx_claim={dx_claim}",
            bucket.as_str()
        ),
        retrieved_cards: Vec::new(),
        strategy: RouterStrategy::Heuristic,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RouterReply {
    tools: Vec<String>,
    reason: String,
}

pub struct ToolRouter {
    strategy: RouterStrategy,
    top_cards: usize,
    index: ToolRagIndex,
}

impl ToolRouter {
    pub fn new(strategy: RouterStrategy, registry: &ToolRegistry, top_cards: usize) -> Self {
        Self {
            strategy,
            top_cards,
            index: ToolRagIndex::build(registry.cards()),
        }
    }

    pub fn strategy(&self) -> RouterStrategy {
        self.strategy
    }

    pub async fn select(
        &self,
        state: &AnalysisState,
        available: &[String],
        caps: &Capabilities,
        round: u32,
    ) -> ToolSelection {
        if self.strategy == RouterStrategy::Heuristic {
            return heuristic_selection(state, available, round);
        }
        let Some(llm) = caps.llm() else {
            debug!("No model configured, routing heuristically");
            return heuristic_selection(state, available, round);
        };
        match self.ask_model(llm, state, available, round).await {
            Ok(selection) => selection,
            Err(reason) => {
                warn!(round, reason = %reason, "Capability router fell back to heuristic routing");
                let mut selection = heuristic_selection(state, available, round);
                selection.reason = format!("capability router fallback ({reason}); {}", selection.reason);
                selection
            }
        }
    }

    async fn ask_model(
        &self,
        llm: &dyn LlmClient,
        state: &AnalysisState,
        available: &[String],
        round: u32,
    ) -> Result<ToolSelection, String> {
        let text = &state.patient.text;
        let query = [
            "Select the minimal set of tools to run for critical process review.".to_string(),
            format!("text_len={}", text.chars().count()),
            format!("timeline_events={}", state.preprocessing.timeline.len()),
            format!("evidence_spans={}", state.preprocessing.spans.len()),
            text.chars().take(2000).collect(),
        ]
        .join("\n");

        let retrieved = self.index.retrieve(&query, self.top_cards);
        let card_text = retrieved
            .iter()
            .map(|(card, _)| card.to_text())
            .collect::<Vec<_>>()
            .join("\n\n");
        let retrieved_cards: Vec<String> = retrieved.into_iter().map(|(card, _)| card.name).collect();

        let prompt = format!(
            "You are a tool router for a clinical critique agent.\n\
             You MUST select only from AVAILABLE_TOOLS and pick the minimal set needed (1 to 6 tools).\n\n\
             AVAILABLE_TOOLS: {available:?}\n\nRetrieved tool cards:\n{card_text}\n\n\
             Patient (truncated):\n{patient}\n\n\
             Output JSON only: {{\"tools\": [\"tool_name\"], \"reason\": \"one short sentence\"}}",
            patient = text.chars().take(2500).collect::<String>(),
        );
        let reply: RouterReply = ask_json(llm, CompletionRequest::new(prompt).temperature(0.1).max_tokens(400))
            .await
            .map_err(|e| e.to_string())?;

        let mut tools: Vec<String> = Vec::new();
        for name in reply.tools {
            let name = name.trim();
            if available.iter().any(|a| a == name) && !tools.iter().any(|t| t == name) {
                tools.push(name.to_string());
            }
        }
        if tools.is_empty() {
            return Err("model selected no available tools".to_string());
        }
        Ok(ToolSelection {
            round,
            tools,
            reason: reply.reason,
            retrieved_cards,
            strategy: RouterStrategy::Capability,
        })
    }
}

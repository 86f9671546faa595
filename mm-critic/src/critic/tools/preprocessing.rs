//! Base evidence tools: the preprocessing passes exposed as tools so the
//! feedback loop can ask for them again.

use async_trait::async_trait;

use super::{CriticTool, ToolOutput};
use crate::capability::Capabilities;
use crate::critic::registry::tool_names;
use crate::critic::types::{AnalysisState, ToolCard};
use crate::preprocess::{build_timeline, extract_spans, record_gaps};

pub struct TimelineTool {
    card: ToolCard,
}

impl TimelineTool {
    pub fn new() -> Self {
        Self {
            card: ToolCard::new(
                tool_names::TIMELINE,
                "Orders narrative sentences into typed, time-hinted events.",
            )
            .triggers(&["always run first", "response lag analysis needs ordered events"])
            .contract(&["patient.text"], &["events[id, type, time_hint, text, start, end]"]),
        }
    }
}

#[async_trait]
impl CriticTool for TimelineTool {
    fn card(&self) -> &ToolCard {
        &self.card
    }

    async fn run(&self, state: &AnalysisState, _caps: &Capabilities) -> anyhow::Result<ToolOutput> {
        Ok(ToolOutput::Timeline {
            events: build_timeline(&state.patient.text),
        })
    }
}

pub struct EvidenceTool {
    card: ToolCard,
}

impl EvidenceTool {
    pub fn new() -> Self {
        Self {
            card: ToolCard::new(
                tool_names::EVIDENCE,
                "Extracts citable evidence spans (numbers, clinical actions) with byte offsets.",
            )
            .triggers(&["always run first", "critique points need span citations"])
            .contract(&["patient.text"], &["spans[id, category, quote, start, end]"]),
        }
    }
}

#[async_trait]
impl CriticTool for EvidenceTool {
    fn card(&self) -> &ToolCard {
        &self.card
    }

    async fn run(&self, state: &AnalysisState, _caps: &Capabilities) -> anyhow::Result<ToolOutput> {
        Ok(ToolOutput::Evidence {
            spans: extract_spans(&state.patient.text),
        })
    }
}

pub struct RecordGapsTool {
    card: ToolCard,
}

impl RecordGapsTool {
    pub fn new() -> Self {
        Self {
            card: ToolCard::new(
                tool_names::RECORD_GAPS,
                "Flags undocumented vital signs, short notes and uncertainty language.",
            )
            .triggers(&["always run first", "documentation quality in doubt"])
            .contract(&["patient.text"], &["missing_vitals", "short_text", "uncertainty_markers"]),
        }
    }
}

#[async_trait]
impl CriticTool for RecordGapsTool {
    fn card(&self) -> &ToolCard {
        &self.card
    }

    async fn run(&self, state: &AnalysisState, _caps: &Capabilities) -> anyhow::Result<ToolOutput> {
        let gaps = record_gaps(&state.patient.text);
        let notes = gaps.notes();
        Ok(ToolOutput::RecordGaps { gaps, notes })
    }
}

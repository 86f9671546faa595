use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CriticTool, ToolOutput};
use crate::capability::Capabilities;
use crate::critic::registry::tool_names;
use crate::critic::types::{AnalysisState, ToolCard};

const SEVERITY_SIGNALS: &[(&str, &[&str])] = &[
    ("shock_or_hypotension", &["shock", "hypotension", "map", "pressors", "vasopress"]),
    (
        "resp_failure",
        &["intub", "vent", "respiratory failure", "bipap", "cpap", "desat", "spo2"],
    ),
    ("sepsis", &["sepsis", "septic", "lactate", "broad spectrum", "abx", "antibiotic"]),
    ("cardiac_instability", &["vtach", "vfib", "arrest", "troponin", "stemi", "nstemi"]),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityFlag {
    pub signal: String,
    pub keyword: String,
    pub span_id: String,
    pub confidence: String,
}

pub struct SeverityRiskTool {
    card: ToolCard,
}

impl SeverityRiskTool {
    pub fn new() -> Self {
        Self {
            card: ToolCard::new(
                tool_names::SEVERITY_RISK,
                "Tags severity and risk signals and detects missing severity assessment.",
            )
            .triggers(&["deterioration, shock or respiratory failure cues", "level-of-care decision under review"])
            .anti_triggers(&["stable elective admission"])
            .contract(&["preprocessing.spans", "preprocessing.record_gaps"], &["flags", "missing_severity_assessment"]),
        }
    }
}

#[async_trait]
impl CriticTool for SeverityRiskTool {
    fn card(&self) -> &ToolCard {
        &self.card
    }

    async fn run(&self, state: &AnalysisState, _caps: &Capabilities) -> anyhow::Result<ToolOutput> {
        let spans = &state.preprocessing.spans;
        let flags = SEVERITY_SIGNALS
            .iter()
            .filter_map(|(signal, keywords)| {
                keywords.iter().find_map(|kw| {
                    spans.first_mentioning(kw).map(|span| SeverityFlag {
                        signal: signal.to_string(),
                        keyword: kw.to_string(),
                        span_id: span.id.clone(),
                        confidence: "medium".to_string(),
                    })
                })
            })
            .collect();

        let missing_severity_assessment = if state.preprocessing.record_gaps.missing_vitals.is_empty() {
            Vec::new()
        } else {
            vec!["vitals_not_documented_in_text: vital signs needed to judge severity are not sufficiently documented".to_string()]
        };

        Ok(ToolOutput::SeverityRisk {
            flags,
            missing_severity_assessment,
        })
    }
}

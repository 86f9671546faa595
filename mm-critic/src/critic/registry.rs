//! The tool catalog. Names double as dispatch keys: a `lens_` prefix files
//! the output under `lens_results`, anything else under `behavior_results`.

use std::sync::Arc;

use super::tools::{
    CriticTool, DiagnosticConsistencyTool, EvidenceTool, MonitoringResponseTool, RecordGapsTool,
    SeverityRiskTool, TimelineTool, TopKCompareTool,
};
use super::types::ToolCard;

pub mod tool_names {
    pub const TIMELINE: &str = "timeline";
    pub const EVIDENCE: &str = "evidence";
    pub const RECORD_GAPS: &str = "record_gaps";
    pub const SEVERITY_RISK: &str = "lens_severity_risk";
    pub const DIAGNOSTIC_CONSISTENCY: &str = "lens_diagnostic_consistency";
    pub const MONITORING_RESPONSE: &str = "lens_monitoring_response";
    pub const TOPK_COMPARE: &str = "behavior_topk_direct_compare";

    /// Preprocessing-equivalent tools run as exempt base evidence.
    pub const BASE: [&str; 3] = [TIMELINE, EVIDENCE, RECORD_GAPS];
}

pub fn is_lens(name: &str) -> bool {
    name.starts_with("lens_")
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn CriticTool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(TimelineTool::new()),
            Arc::new(EvidenceTool::new()),
            Arc::new(RecordGapsTool::new()),
            Arc::new(SeverityRiskTool::new()),
            Arc::new(DiagnosticConsistencyTool::new()),
            Arc::new(MonitoringResponseTool::new()),
            Arc::new(TopKCompareTool::new()),
        ])
    }
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn CriticTool>>) -> Self {
        Self { tools }
    }

    /// Registered names in catalog order.
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CriticTool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn cards(&self) -> Vec<ToolCard> {
        self.tools.iter().map(|t| t.card().clone()).collect()
    }

    /// Keeps the names that are registered, in their given order, once each.
    pub fn filter_known(&self, names: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if self.contains(name) && !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_order_and_lens_prefix() {
        let registry = ToolRegistry::default();
        assert_eq!(
            registry.names(),
            vec![
                "timeline",
                "evidence",
                "record_gaps",
                "lens_severity_risk",
                "lens_diagnostic_consistency",
                "lens_monitoring_response",
                "behavior_topk_direct_compare",
            ]
        );
        assert!(is_lens(tool_names::MONITORING_RESPONSE));
        assert!(!is_lens(tool_names::TOPK_COMPARE));
    }

    #[test]
    fn filter_known_drops_unknown_and_duplicates() {
        let registry = ToolRegistry::default();
        let kept = registry.filter_known(["lens_severity_risk", "lens_made_up", " lens_severity_risk", "timeline"]);
        assert_eq!(kept, vec!["lens_severity_risk", "timeline"]);
    }
}

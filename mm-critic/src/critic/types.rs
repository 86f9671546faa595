//! Records shared by the critic stages. One `AnalysisState` belongs to one
//! run and is threaded through router, runner, builder and judge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::router::RouterStrategy;
use super::tools::ToolOutput;
use crate::analysis::{DiagnosisAnalysis, TreatmentAnalysis};
use crate::models::{Case, Severity, SimilarCase};
use crate::preprocess::PreprocessResult;

/// Static self-description of a tool, used by routers and in prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCard {
    pub name: String,
    pub description: String,
    pub triggers: Vec<String>,
    pub anti_triggers: Vec<String>,
    pub input_contract: Vec<String>,
    pub output_contract: Vec<String>,
}

impl ToolCard {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            triggers: Vec::new(),
            anti_triggers: Vec::new(),
            input_contract: Vec::new(),
            output_contract: Vec::new(),
        }
    }

    pub fn triggers(mut self, triggers: &[&str]) -> Self {
        self.triggers = triggers.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn anti_triggers(mut self, anti: &[&str]) -> Self {
        self.anti_triggers = anti.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn contract(mut self, input: &[&str], output: &[&str]) -> Self {
        self.input_contract = input.iter().map(|t| t.to_string()).collect();
        self.output_contract = output.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn to_text(&self) -> String {
        let list = |items: &[String]| {
            if items.is_empty() {
                "-".to_string()
            } else {
                items.join(", ")
            }
        };
        format!(
            "[Tool] {}\nDescription: {}\nTriggers: {}\nAnti-triggers: {}",
            self.name,
            self.description,
            list(&self.triggers),
            list(&self.anti_triggers)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Ok,
    Error,
    Degraded,
    Skipped,
    BudgetStop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub tool: String,
    pub status: TraceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Append-only execution log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn push(&mut self, tool: impl Into<String>, status: TraceStatus, detail: Option<Value>) {
        self.entries.push(TraceEntry {
            tool: tool.into(),
            status,
            detail,
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, status: TraceStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}

/// What the router picked for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSelection {
    pub round: u32,
    pub tools: Vec<String>,
    pub reason: String,
    pub retrieved_cards: Vec<String>,
    /// Strategy that actually produced `tools`
    pub strategy: RouterStrategy,
}

/// Read-only context the critic receives from the upstream stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CohortData {
    pub similar_cases: Vec<SimilarCase>,
    pub diagnosis: Option<DiagnosisAnalysis>,
    pub treatment: Option<TreatmentAnalysis>,
    pub evidence_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisState {
    pub patient: Case,
    pub cohort: CohortData,
    pub preprocessing: PreprocessResult,
    pub lens_results: BTreeMap<String, ToolOutput>,
    pub behavior_results: BTreeMap<String, ToolOutput>,
    pub router: Option<ToolSelection>,
    pub trace: Trace,
    pub executed_tools: Vec<String>,
    /// Charged invocations so far; never exceeds the configured budget
    pub executed_budget: usize,
    /// Tools run as exempt base evidence
    pub base_tools: Vec<String>,
    /// Base tools already re-run on request (each at most once)
    pub reruns: Vec<String>,
}

impl AnalysisState {
    pub fn new(patient: Case, cohort: CohortData, preprocessing: PreprocessResult) -> Self {
        Self {
            patient,
            cohort,
            preprocessing,
            lens_results: BTreeMap::new(),
            behavior_results: BTreeMap::new(),
            router: None,
            trace: Trace::default(),
            executed_tools: Vec::new(),
            executed_budget: 0,
            base_tools: Vec::new(),
            reruns: Vec::new(),
        }
    }

    pub fn has_run(&self, tool: &str) -> bool {
        self.executed_tools.iter().any(|t| t == tool)
    }

    pub fn result(&self, tool: &str) -> Option<&ToolOutput> {
        self.lens_results.get(tool).or_else(|| self.behavior_results.get(tool))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiquePoint {
    pub point: String,
    /// An evidence span id or `record_uncertainty`
    pub span_id: String,
    pub severity: Severity,
    #[serde(default)]
    pub cohort_comparison: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderMode {
    Model,
    #[default]
    Heuristic,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CritiqueReport {
    pub patient_id: String,
    pub analysis: String,
    pub critique_points: Vec<CritiquePoint>,
    pub risk_factors: Vec<String>,
    pub recommendations: Vec<String>,
    /// Citations rewritten to `record_uncertainty` while sanitizing
    pub citation_repairs: usize,
    pub mode: BuilderMode,
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDecision {
    pub ok: bool,
    pub reason: String,
    pub requested_tools: Vec<String>,
    pub patch_instructions: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOutcome {
    Accepted,
    Exhausted,
}

/// Round counter and terminal state of the critique/judge loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriticLoop {
    pub round: u32,
    pub max_rounds: u32,
    pub outcome: Option<LoopOutcome>,
    /// Tools the last judgement asked for, consumed by the next routing
    pub pending_requests: Vec<String>,
    pub patch_instructions: String,
}

impl CriticLoop {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds,
            ..Default::default()
        }
    }

    /// Applies one judgement. Returns true when another round should run.
    pub fn record(&mut self, decision: &FeedbackDecision) -> bool {
        self.round += 1;
        if decision.ok {
            self.outcome = Some(LoopOutcome::Accepted);
            self.pending_requests.clear();
        } else if self.round >= self.max_rounds {
            self.outcome = Some(LoopOutcome::Exhausted);
            self.pending_requests.clear();
        } else {
            self.pending_requests = decision.requested_tools.clone();
            if !decision.patch_instructions.trim().is_empty() {
                self.patch_instructions = decision.patch_instructions.clone();
            }
        }
        self.should_continue()
    }

    pub fn should_continue(&self) -> bool {
        self.outcome.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected() -> FeedbackDecision {
        FeedbackDecision {
            ok: false,
            reason: "too few points".to_string(),
            requested_tools: vec!["lens_diagnostic_consistency".to_string()],
            patch_instructions: "add citations".to_string(),
        }
    }

    #[test]
    fn loop_stops_at_max_rounds_when_never_accepted() {
        let mut critic_loop = CriticLoop::new(2);
        assert!(critic_loop.record(&rejected()));
        assert_eq!(critic_loop.pending_requests, vec!["lens_diagnostic_consistency"]);
        assert!(!critic_loop.record(&rejected()));
        assert_eq!(critic_loop.outcome, Some(LoopOutcome::Exhausted));
        assert_eq!(critic_loop.round, 2);
    }

    #[test]
    fn zero_rounds_still_terminates_after_one_judgement() {
        let mut critic_loop = CriticLoop::new(0);
        assert!(!critic_loop.record(&rejected()));
        assert_eq!(critic_loop.outcome, Some(LoopOutcome::Exhausted));
    }

    #[test]
    fn acceptance_ends_the_loop() {
        let mut critic_loop = CriticLoop::new(3);
        let accepted = FeedbackDecision {
            ok: true,
            ..Default::default()
        };
        assert!(!critic_loop.record(&accepted));
        assert_eq!(critic_loop.outcome, Some(LoopOutcome::Accepted));
    }

    #[test]
    fn trace_is_append_only_and_serializes_flat() {
        let mut trace = Trace::default();
        trace.push("timeline", TraceStatus::Ok, None);
        trace.push("runner", TraceStatus::BudgetStop, Some(serde_json::json!({"max_tools": 1})));

        assert_eq!(trace.len(), 2);
        assert_eq!(trace.count(TraceStatus::BudgetStop), 1);
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json[1]["status"], "budget_stop");
        assert!(json[0].get("detail").is_none());
    }

    #[test]
    fn card_text_lists_triggers() {
        let card = ToolCard::new("lens_x", "Checks x.").triggers(&["a", "b"]);
        assert_eq!(
            card.to_text(),
            "[Tool] lens_x\nDescription: Checks x.\nTriggers: a, b\nAnti-triggers: -"
        );
    }
}

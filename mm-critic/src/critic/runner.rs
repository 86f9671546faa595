//! Budgeted execution of tool selections.
//!
//! Base evidence runs once, exempt from the budget. Every later invocation
//! is charged; once `executed_budget` reaches `max_tools` the runner records
//! a `budget_stop` entry and runs nothing further.

use serde_json::json;
use tracing::{debug, info, warn};

use super::registry::{ToolRegistry, is_lens, tool_names};
use super::tools::{ToolOutput, safe_run};
use super::types::{AnalysisState, TraceStatus};
use crate::capability::Capabilities;

pub struct BudgetedRunner<'a> {
    registry: &'a ToolRegistry,
    caps: &'a Capabilities,
    max_tools: usize,
}

impl<'a> BudgetedRunner<'a> {
    pub fn new(registry: &'a ToolRegistry, caps: &'a Capabilities, max_tools: usize) -> Self {
        Self {
            registry,
            caps,
            max_tools,
        }
    }

    /// Runs preprocessing-equivalent tools, and the top-K comparison when
    /// similar cases exist, without charging the budget.
    pub async fn run_base(&self, state: &mut AnalysisState) {
        let mut base: Vec<&str> = tool_names::BASE.to_vec();
        if !state.cohort.similar_cases.is_empty() {
            base.push(tool_names::TOPK_COMPARE);
        }
        for name in base {
            let Some(tool) = self.registry.get(name) else {
                continue;
            };
            let output = safe_run(tool.as_ref(), state, self.caps).await;
            state.executed_tools.push(name.to_string());
            state.base_tools.push(name.to_string());
            file_output(state, name, output);
        }
        debug!(base = ?state.base_tools, "Base evidence collected");
    }

    /// Runs feedback `requested` tools first, then the router's `selected`
    /// tools. Returns the names actually executed this round.
    pub async fn run_round(&self, state: &mut AnalysisState, selected: &[String], requested: &[String]) -> Vec<String> {
        let mut plan: Vec<&str> = Vec::new();
        for name in requested.iter().chain(selected) {
            if !plan.contains(&name.as_str()) {
                plan.push(name);
            }
        }

        let mut executed = Vec::new();
        for (i, name) in plan.iter().copied().enumerate() {
            let Some(tool) = self.registry.get(name) else {
                warn!(tool = name, "Ignoring request for unregistered tool");
                state
                    .trace
                    .push(name, TraceStatus::Skipped, Some(json!({ "reason": "unknown tool" })));
                continue;
            };

            let rerun = state.has_run(name);
            if rerun && !self.may_rerun(state, name, requested) {
                debug!(tool = name, "Already executed, skipping");
                continue;
            }

            if state.executed_budget >= self.max_tools {
                let remaining: Vec<&str> = plan[i..].to_vec();
                info!(
                    executed_budget = state.executed_budget,
                    max_tools = self.max_tools,
                    "Tool budget exhausted"
                );
                state.trace.push(
                    "runner",
                    TraceStatus::BudgetStop,
                    Some(json!({
                        "executed_budget": state.executed_budget,
                        "max_tools": self.max_tools,
                        "remaining": remaining,
                    })),
                );
                break;
            }

            let output = safe_run(tool.as_ref(), state, self.caps).await;
            state.executed_budget += 1;
            if rerun {
                state.reruns.push(name.to_string());
            } else {
                state.executed_tools.push(name.to_string());
            }
            file_output(state, name, output);
            executed.push(name.to_string());
        }
        executed
    }

    /// A base tool may be re-run once, and only when feedback asked for it.
    fn may_rerun(&self, state: &AnalysisState, name: &str, requested: &[String]) -> bool {
        state.base_tools.iter().any(|t| t == name)
            && requested.iter().any(|t| t == name)
            && !state.reruns.iter().any(|t| t == name)
    }
}

/// Preprocessing outputs refresh `state.preprocessing`; everything else is
/// filed by name prefix.
fn file_output(state: &mut AnalysisState, name: &str, output: ToolOutput) {
    match output {
        ToolOutput::Timeline { events } => state.preprocessing.timeline = events,
        ToolOutput::Evidence { spans } => state.preprocessing.spans = spans,
        ToolOutput::RecordGaps { gaps, .. } => state.preprocessing.record_gaps = gaps,
        other if is_lens(name) => {
            state.lens_results.insert(name.to_string(), other);
        }
        other => {
            state.behavior_results.insert(name.to_string(), other);
        }
    }
}

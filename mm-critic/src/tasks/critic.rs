use std::sync::Arc;

use async_trait::async_trait;
use critic_flow::{Context, NextAction, Result, Task, TaskResult};
use serde_json::json;
use tracing::info;

use super::{CriticDeps, ids, keys};
use crate::critic::{
    AnalysisState, BudgetedRunner, CohortData, CriticLoop, CritiqueBuilder, FeedbackJudge, TraceStatus,
};

/// Digest entries handed to the critic alongside the raw cohort.
const DIGEST_ITEMS: usize = 5;

/// Assembles the analysis state from upstream outputs and runs the base
/// tools outside the budget.
pub struct CohortTask {
    deps: Arc<CriticDeps>,
}

impl CohortTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for CohortTask {
    fn id(&self) -> &str {
        ids::COHORT
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case = context.require(keys::CASE).await?;
        let pre = context.require(keys::PREPROCESSING).await?;
        let evidence = context.require(keys::EVIDENCE).await?;

        let cohort = CohortData {
            similar_cases: evidence.similar_cases(),
            diagnosis: context.fetch(keys::DIAGNOSIS).await,
            treatment: context.fetch(keys::TREATMENT).await,
            evidence_digest: evidence.digest(DIGEST_ITEMS),
        };
        let mut state = AnalysisState::new(case, cohort, pre);
        seed_upstream_degradations(&context, &mut state).await;

        BudgetedRunner::new(&self.deps.registry, &self.deps.caps, self.deps.config.max_tools)
            .run_base(&mut state)
            .await;
        info!(
            case_id = %state.patient.id,
            similar_cases = state.cohort.similar_cases.len(),
            base_tools = ?state.base_tools,
            "Critic state ready"
        );

        let status = format!("{} base tools", state.base_tools.len());
        context.put(keys::ANALYSIS_STATE, &state).await;
        context
            .put(keys::CRITIC_LOOP, &CriticLoop::new(self.deps.config.max_rounds))
            .await;

        Ok(TaskResult::new_with_status(None, NextAction::ContinueAndExecute, Some(status)))
    }
}

/// Carries degradations from the stages before the critic into its trace,
/// one `Degraded` entry each.
async fn seed_upstream_degradations(context: &Context, state: &mut AnalysisState) {
    for entry in context.fetch(keys::EARLY_TRACE).await.unwrap_or_default() {
        state.trace.push(entry.tool, entry.status, entry.detail);
    }
    if let Some(evidence) = context.fetch(keys::EVIDENCE).await {
        for reason in evidence.degradations {
            state
                .trace
                .push("crag_retrieval", TraceStatus::Degraded, Some(json!({ "reason": reason })));
        }
    }
    let analysts = [
        ("diagnosis_analyst", state.cohort.diagnosis.as_ref().and_then(|d| d.degraded.clone())),
        ("treatment_analyst", state.cohort.treatment.as_ref().and_then(|t| t.degraded.clone())),
    ];
    for (tool, reason) in analysts {
        if let Some(reason) = reason {
            state.trace.push(tool, TraceStatus::Degraded, Some(json!({ "reason": reason })));
        }
    }
}

pub struct RouteTask {
    deps: Arc<CriticDeps>,
}

impl RouteTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for RouteTask {
    fn id(&self) -> &str {
        ids::ROUTE
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let mut state = context.require(keys::ANALYSIS_STATE).await?;
        let critic_loop = context.require(keys::CRITIC_LOOP).await?;
        let round = critic_loop.round + 1;

        let selection = self
            .deps
            .router
            .select(&state, &self.deps.available_tools(), &self.deps.caps, round)
            .await;
        info!(round, strategy = %selection.strategy, tools = ?selection.tools, "Tools selected");
        state.trace.push(
            "router",
            TraceStatus::Ok,
            Some(json!({
                "round": round,
                "strategy": selection.strategy,
                "tools": selection.tools,
                "reason": selection.reason,
            })),
        );

        let status = format!("round {round}: {}", selection.tools.join(", "));
        state.router = Some(selection);
        context.put(keys::ANALYSIS_STATE, &state).await;

        Ok(TaskResult::new_with_status(None, NextAction::ContinueAndExecute, Some(status)))
    }
}

/// Executes judge-requested tools, then the router's picks, within the budget.
pub struct RunToolsTask {
    deps: Arc<CriticDeps>,
}

impl RunToolsTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for RunToolsTask {
    fn id(&self) -> &str {
        ids::RUN_TOOLS
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let mut state = context.require(keys::ANALYSIS_STATE).await?;
        let critic_loop = context.require(keys::CRITIC_LOOP).await?;
        let selected = state
            .router
            .as_ref()
            .map(|selection| selection.tools.clone())
            .unwrap_or_default();

        let executed = BudgetedRunner::new(&self.deps.registry, &self.deps.caps, self.deps.config.max_tools)
            .run_round(&mut state, &selected, &critic_loop.pending_requests)
            .await;

        let status = format!(
            "ran {} tools, budget {}/{}",
            executed.len(),
            state.executed_budget,
            self.deps.config.max_tools
        );
        context.put(keys::ANALYSIS_STATE, &state).await;

        Ok(TaskResult::new_with_status(None, NextAction::ContinueAndExecute, Some(status)))
    }
}

pub struct BuildCritiqueTask {
    deps: Arc<CriticDeps>,
}

impl BuildCritiqueTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for BuildCritiqueTask {
    fn id(&self) -> &str {
        ids::BUILD_CRITIQUE
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let mut state = context.require(keys::ANALYSIS_STATE).await?;
        let critic_loop = context.require(keys::CRITIC_LOOP).await?;
        let previous = context.fetch(keys::CRITIQUE).await;

        let report = CritiqueBuilder::new(&self.deps.caps)
            .build(&state, previous.as_ref(), &critic_loop.patch_instructions)
            .await;

        let status = if report.degraded.is_some() {
            TraceStatus::Degraded
        } else {
            TraceStatus::Ok
        };
        state.trace.push(
            "critique_builder",
            status,
            Some(json!({
                "round": critic_loop.round + 1,
                "mode": report.mode,
                "points": report.critique_points.len(),
                "citation_repairs": report.citation_repairs,
                "degraded": report.degraded,
            })),
        );

        let message = format!("{} critique points", report.critique_points.len());
        context.put(keys::CRITIQUE, &report).await;
        context.put(keys::ANALYSIS_STATE, &state).await;

        Ok(TaskResult::new_with_status(None, NextAction::ContinueAndExecute, Some(message)))
    }
}

/// Judges the current critique and advances the loop. Graph edges read the
/// updated loop through [`should_reroute`].
pub struct JudgeTask {
    deps: Arc<CriticDeps>,
}

impl JudgeTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for JudgeTask {
    fn id(&self) -> &str {
        ids::JUDGE
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let mut state = context.require(keys::ANALYSIS_STATE).await?;
        let mut critic_loop = context.require(keys::CRITIC_LOOP).await?;
        let report = context.require(keys::CRITIQUE).await?;

        let decision = FeedbackJudge::new(&self.deps.caps, self.deps.config.min_points)
            .decide(&state, &report, &self.deps.available_tools())
            .await;
        let again = critic_loop.record(&decision);
        info!(
            round = critic_loop.round,
            ok = decision.ok,
            requested = ?decision.requested_tools,
            again,
            "Critique judged"
        );
        state.trace.push(
            "feedback",
            TraceStatus::Ok,
            Some(json!({
                "round": critic_loop.round,
                "ok": decision.ok,
                "reason": decision.reason,
                "requested_tools": decision.requested_tools,
            })),
        );

        let status = match critic_loop.outcome {
            Some(outcome) => format!("loop finished: {outcome:?}"),
            None => format!("round {} rejected: {}", critic_loop.round, decision.reason),
        };
        context.put(keys::FEEDBACK, &decision).await;
        context.put(keys::CRITIC_LOOP, &critic_loop).await;
        context.put(keys::ANALYSIS_STATE, &state).await;

        Ok(TaskResult::new_with_status(None, NextAction::ContinueAndExecute, Some(status)))
    }
}

/// Edge predicate: another routing round is due.
pub fn should_reroute(context: &Context) -> bool {
    context
        .fetch_sync(keys::CRITIC_LOOP)
        .is_some_and(|critic_loop| critic_loop.should_continue())
}

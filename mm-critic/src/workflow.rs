use std::sync::Arc;

use anyhow::{Context as _, anyhow, bail};
use critic_flow::{
    ExecutionStatus, FlowRunner, Graph, GraphBuilder, InMemorySessionStorage, Session, SessionStorage, Task,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analysis::{DiagnosisAnalysis, TreatmentAnalysis};
use crate::capability::Capabilities;
use crate::config::CriticConfig;
use crate::critic::{CritiqueReport, LoopOutcome, Trace, VerificationResult};
use crate::evidence::EvidenceBundle;
use crate::models::Case;
use crate::tasks::{
    BuildCritiqueTask, CohortTask, CriticDeps, FirstPassTask, JudgeTask, PreprocessTask, RememberTask, RouteTask,
    RunToolsTask, SecondPassTask, VerifyTask, analyses_fan_out, ids, keys, should_reroute,
};

pub const GRAPH_ID: &str = "mm_critic";

/// Tasks outside the route/run/build/judge cycle.
const LINEAR_STEPS: usize = 7;
const STEPS_PER_ROUND: usize = 4;

/// Everything one critique run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub critique: CritiqueReport,
    pub evidence: EvidenceBundle,
    pub solutions: VerificationResult,
    pub diagnosis: Option<DiagnosisAnalysis>,
    pub treatment: Option<TreatmentAnalysis>,
    pub trace: Trace,
    pub loop_outcome: Option<LoopOutcome>,
    pub executed_budget: usize,
    pub executed_tools: Vec<String>,
    /// Graph tasks in the order they ran
    pub transitions: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Step limit for a loop of `max_rounds`; never below the configured floor so
/// the guard cannot cut a legitimate run short.
pub fn step_limit(config: &CriticConfig) -> usize {
    let needed = LINEAR_STEPS + STEPS_PER_ROUND * config.max_rounds.max(1) as usize;
    config.max_graph_steps.max(needed)
}

pub fn build_critic_graph(deps: &Arc<CriticDeps>) -> Graph {
    let tasks: Vec<Arc<dyn Task>> = vec![
        Arc::new(PreprocessTask::new(Arc::clone(deps))),
        Arc::new(FirstPassTask::new(Arc::clone(deps))),
        Arc::new(analyses_fan_out(deps)),
        Arc::new(SecondPassTask::new(Arc::clone(deps))),
        Arc::new(CohortTask::new(Arc::clone(deps))),
        Arc::new(RouteTask::new(Arc::clone(deps))),
        Arc::new(RunToolsTask::new(Arc::clone(deps))),
        Arc::new(BuildCritiqueTask::new(Arc::clone(deps))),
        Arc::new(JudgeTask::new(Arc::clone(deps))),
        Arc::new(VerifyTask::new(Arc::clone(deps))),
        Arc::new(RememberTask::new(Arc::clone(deps))),
    ];

    let mut builder = GraphBuilder::new(GRAPH_ID);
    for task in tasks {
        builder = builder.add_task(task);
    }

    builder
        .add_edge(ids::PREPROCESS, ids::EVIDENCE_FIRST)
        .add_edge(ids::EVIDENCE_FIRST, ids::ANALYSES)
        .add_edge(ids::ANALYSES, ids::EVIDENCE_SECOND)
        .add_edge(ids::EVIDENCE_SECOND, ids::COHORT)
        .add_edge(ids::COHORT, ids::ROUTE)
        .add_edge(ids::ROUTE, ids::RUN_TOOLS)
        .add_edge(ids::RUN_TOOLS, ids::BUILD_CRITIQUE)
        .add_edge(ids::BUILD_CRITIQUE, ids::JUDGE)
        .add_conditional_edge(ids::JUDGE, ids::ROUTE, should_reroute)
        .add_edge(ids::JUDGE, ids::VERIFY)
        .add_edge(ids::VERIFY, ids::REMEMBER)
        .with_max_steps(step_limit(&deps.config))
        .build()
}

pub struct CriticPipeline {
    deps: Arc<CriticDeps>,
    runner: FlowRunner,
    storage: Arc<dyn SessionStorage>,
}

impl CriticPipeline {
    pub fn new(config: CriticConfig, caps: Capabilities) -> Self {
        Self::with_storage(config, caps, Arc::new(InMemorySessionStorage::new()))
    }

    pub fn with_storage(config: CriticConfig, caps: Capabilities, storage: Arc<dyn SessionStorage>) -> Self {
        let deps = Arc::new(CriticDeps::new(config, caps));
        let graph = Arc::new(build_critic_graph(&deps));
        Self {
            runner: FlowRunner::new(graph, Arc::clone(&storage)),
            deps,
            storage,
        }
    }

    pub fn config(&self) -> &CriticConfig {
        &self.deps.config
    }

    pub async fn run(&self, case: Case) -> anyhow::Result<CaseReport> {
        info!(
            case_id = %case.id,
            capabilities = ?self.deps.caps.describe(),
            router = %self.deps.config.router,
            max_tools = self.deps.config.max_tools,
            max_rounds = self.deps.config.max_rounds,
            "Starting critique run"
        );

        let session = Session::start(GRAPH_ID, ids::PREPROCESS);
        let session_id = session.id.clone();
        session.context.put(keys::CASE, &case).await;
        self.storage.save(session).await?;

        loop {
            let result = self
                .runner
                .run(&session_id)
                .await
                .with_context(|| format!("critique graph failed for case {}", case.id))?;
            match result.status {
                ExecutionStatus::Completed => break,
                ExecutionStatus::Paused => continue,
                ExecutionStatus::WaitingForInput => bail!("critique graph unexpectedly waiting for input"),
            }
        }

        let session = self
            .storage
            .get(&session_id)
            .await?
            .ok_or_else(|| anyhow!("session {session_id} vanished"))?;
        self.storage.delete(&session_id).await?;

        let context = &session.context;
        let state = context.require(keys::ANALYSIS_STATE).await?;
        let report = CaseReport {
            case_id: case.id.clone(),
            critique: context.require(keys::CRITIQUE).await?,
            evidence: context.require(keys::EVIDENCE).await?,
            solutions: context.fetch(keys::VERIFICATION).await.unwrap_or_default(),
            diagnosis: context.fetch(keys::DIAGNOSIS).await,
            treatment: context.fetch(keys::TREATMENT).await,
            loop_outcome: context.fetch(keys::CRITIC_LOOP).await.and_then(|l| l.outcome),
            executed_budget: state.executed_budget,
            executed_tools: state.executed_tools,
            trace: state.trace,
            transitions: session.history.clone(),
            notes: context.fetch(keys::NOTES).await.unwrap_or_default(),
        };

        info!(
            case_id = %report.case_id,
            points = report.critique.critique_points.len(),
            solutions = report.solutions.solutions.len(),
            budget = report.executed_budget,
            outcome = ?report.loop_outcome,
            steps = report.transitions.len(),
            "Critique run finished"
        );
        Ok(report)
    }
}

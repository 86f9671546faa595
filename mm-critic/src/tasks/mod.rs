//! Pipeline tasks for the critique graph. Each task reads its inputs from
//! the context through [`keys`] and writes its output back; capabilities and
//! the tool catalog are shared through [`CriticDeps`].

pub mod analysis;
pub mod critic;
pub mod evidence;
pub mod finish;
pub mod keys;

use critic_flow::Context;
use serde_json::json;

use crate::capability::Capabilities;
use crate::config::CriticConfig;
use crate::critic::{ToolRegistry, ToolRouter, TraceEntry, TraceStatus};

pub use analysis::{DiagnosisTask, TreatmentTask, analyses_fan_out};
pub use critic::{BuildCritiqueTask, CohortTask, JudgeTask, RouteTask, RunToolsTask, should_reroute};
pub use evidence::{FirstPassTask, PreprocessTask, SecondPassTask};
pub use finish::{RememberTask, VerifyTask, episode_confidence};

/// Node names of the critique graph.
pub mod ids {
    pub const PREPROCESS: &str = "preprocess";
    pub const EVIDENCE_FIRST: &str = "evidence1";
    pub const ANALYSES: &str = "analyses";
    pub const DIAGNOSIS: &str = "diagnosis";
    pub const TREATMENT: &str = "treatment";
    pub const EVIDENCE_SECOND: &str = "evidence2";
    pub const COHORT: &str = "cohort";
    pub const ROUTE: &str = "route";
    pub const RUN_TOOLS: &str = "run_tools";
    pub const BUILD_CRITIQUE: &str = "build_critique";
    pub const JUDGE: &str = "judge";
    pub const VERIFY: &str = "verify";
    pub const REMEMBER: &str = "remember";
}

/// Everything a task needs besides the context.
pub struct CriticDeps {
    pub config: CriticConfig,
    pub caps: Capabilities,
    pub registry: ToolRegistry,
    pub router: ToolRouter,
}

impl CriticDeps {
    pub fn new(config: CriticConfig, caps: Capabilities) -> Self {
        let registry = ToolRegistry::default();
        let router = ToolRouter::new(config.router, &registry, config.router_top_cards);
        Self {
            config,
            caps,
            registry,
            router,
        }
    }

    pub fn available_tools(&self) -> Vec<String> {
        self.registry.names()
    }
}

pub(crate) async fn push_note(context: &Context, note: String) {
    let mut notes = context.fetch(keys::NOTES).await.unwrap_or_default();
    notes.push(note);
    context.put(keys::NOTES, &notes).await;
}

/// Notes a degradation that happened before the trace exists and queues a
/// `Degraded` trace entry for it.
pub(crate) async fn push_early_degradation(context: &Context, tool: &str, reason: String) {
    let mut pending = context.fetch(keys::EARLY_TRACE).await.unwrap_or_default();
    pending.push(TraceEntry {
        tool: tool.to_string(),
        status: TraceStatus::Degraded,
        detail: Some(json!({ "reason": reason })),
    });
    context.put(keys::EARLY_TRACE, &pending).await;
    push_note(context, reason).await;
}

use std::sync::Arc;

use async_trait::async_trait;
use critic_flow::{Context, NextAction, Result, Task, TaskResult};
use serde_json::json;
use tracing::{info, warn};

use super::{CriticDeps, ids, keys, push_note};
use crate::critic::{BuilderMode, LoopOutcome, SolutionVerifier, TraceStatus};
use crate::memory::Episode;

/// Confidence stored with an episode: accepted critiques are trusted more than
/// exhausted loops, heuristic reports less than model-built ones.
pub fn episode_confidence(outcome: Option<LoopOutcome>, mode: BuilderMode) -> f64 {
    let base: f64 = match outcome {
        Some(LoopOutcome::Accepted) => 0.8,
        Some(LoopOutcome::Exhausted) | None => 0.5,
    };
    let penalty = match mode {
        BuilderMode::Model => 0.0,
        BuilderMode::Heuristic => 0.2,
    };
    (base - penalty).clamp(0.0, 1.0)
}

pub struct VerifyTask {
    deps: Arc<CriticDeps>,
}

impl VerifyTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for VerifyTask {
    fn id(&self) -> &str {
        ids::VERIFY
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let report = context.require(keys::CRITIQUE).await?;
        let evidence = context.require(keys::EVIDENCE).await?;
        let mut state = context.require(keys::ANALYSIS_STATE).await?;

        let similar = evidence.similar_cases();
        let verification = SolutionVerifier::new(&self.deps.caps)
            .verify(&report, &similar, &evidence.external.results)
            .await;

        let status = if verification.degraded.is_some() {
            TraceStatus::Degraded
        } else {
            TraceStatus::Ok
        };
        state.trace.push(
            "verifier",
            status,
            Some(json!({
                "solutions": verification.solutions.len(),
                "dropped": verification.dropped,
                "degraded": verification.degraded,
            })),
        );

        let message = format!("{} verified solutions", verification.solutions.len());
        context.put(keys::VERIFICATION, &verification).await;
        context.put(keys::ANALYSIS_STATE, &state).await;

        Ok(TaskResult::new_with_status(None, NextAction::ContinueAndExecute, Some(message)))
    }
}

/// Appends the finished run to episodic memory, when one is configured.
pub struct RememberTask {
    deps: Arc<CriticDeps>,
}

impl RememberTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for RememberTask {
    fn id(&self) -> &str {
        ids::REMEMBER
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let Some(memory) = &self.deps.caps.memory else {
            return Ok(TaskResult::new_with_status(
                None,
                NextAction::End,
                Some("no episodic memory configured".to_string()),
            ));
        };

        let case = context.require(keys::CASE).await?;
        let report = context.require(keys::CRITIQUE).await?;
        let verification = context.fetch(keys::VERIFICATION).await.unwrap_or_default();
        let outcome = context.fetch(keys::CRITIC_LOOP).await.and_then(|l| l.outcome);

        let confidence = episode_confidence(outcome, report.mode);
        let episode = Episode::from_run(&case, &report, &verification.solutions, confidence);
        let episode_id = episode.episode_id.clone();

        let status = match memory.append(episode).await {
            Ok(()) => {
                info!(case_id = %case.id, episode_id = %episode_id, confidence, "Episode stored");
                format!("stored episode {episode_id}")
            }
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "Failed to store episode");
                let reason = format!("episodic memory append failed: {e}");
                if let Some(mut state) = context.fetch(keys::ANALYSIS_STATE).await {
                    state.trace.push(
                        "episodic_append",
                        TraceStatus::Degraded,
                        Some(json!({ "episode_id": episode_id, "reason": reason })),
                    );
                    context.put(keys::ANALYSIS_STATE, &state).await;
                }
                push_note(&context, reason).await;
                "episode not stored".to_string()
            }
        };

        Ok(TaskResult::new_with_status(None, NextAction::End, Some(status)))
    }
}

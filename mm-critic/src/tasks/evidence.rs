use std::sync::Arc;

use async_trait::async_trait;
use critic_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::{info, warn};

use super::{CriticDeps, ids, keys, push_early_degradation};
use crate::analysis::collect_preliminary_issues;
use crate::evidence::EvidenceRetriever;
use crate::memory::format_lessons;
use crate::preprocess::preprocess;

/// Splits the narrative into events, spans and gaps, and recalls lessons
/// from similar past runs.
pub struct PreprocessTask {
    deps: Arc<CriticDeps>,
}

impl PreprocessTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for PreprocessTask {
    fn id(&self) -> &str {
        ids::PREPROCESS
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case = context.require(keys::CASE).await?;
        let pre = preprocess(&case.text);
        info!(
            case_id = %case.id,
            events = pre.timeline.len(),
            spans = pre.spans.len(),
            gaps = pre.record_gaps.has_gaps(),
            "Preprocessed narrative"
        );
        context.put(keys::PREPROCESSING, &pre).await;

        let mut lessons = String::new();
        if let Some(memory) = &self.deps.caps.memory {
            let config = &self.deps.config;
            let mut diagnoses = vec![case.primary_diagnosis().to_string()];
            diagnoses.extend(case.secondary_diagnoses.iter().cloned());
            match memory
                .search(&case.text, config.memory_top_k, config.memory_min_similarity, &diagnoses)
                .await
            {
                Ok(episodes) => {
                    info!(case_id = %case.id, count = episodes.len(), "Recalled past episodes");
                    lessons = format_lessons(&episodes);
                }
                Err(e) => {
                    warn!(case_id = %case.id, error = %e, "Episodic memory recall failed");
                    let reason = format!("episodic memory recall failed: {e}");
                    push_early_degradation(&context, "episodic_recall", reason).await;
                }
            }
        }
        context.put(keys::LESSONS, &lessons).await;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!("{} evidence spans", pre.spans.len())),
        ))
    }
}

/// First CRAG pass: internal quality gate and validation plus external search.
pub struct FirstPassTask {
    deps: Arc<CriticDeps>,
}

impl FirstPassTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for FirstPassTask {
    fn id(&self) -> &str {
        ids::EVIDENCE_FIRST
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case = context.require(keys::CASE).await?;
        let bundle = EvidenceRetriever::new(&self.deps.config, &self.deps.caps)
            .first_pass(&case)
            .await;
        let status = format!(
            "{} internal, {} external",
            bundle.internal.count, bundle.external.count
        );
        context.put(keys::EVIDENCE, &bundle).await;

        Ok(TaskResult::new_with_status(None, NextAction::ContinueAndExecute, Some(status)))
    }
}

/// Critique-targeted second pass, merged into the first. A no-op when the
/// analyses raised no issues.
pub struct SecondPassTask {
    deps: Arc<CriticDeps>,
}

impl SecondPassTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for SecondPassTask {
    fn id(&self) -> &str {
        ids::EVIDENCE_SECOND
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case = context.require(keys::CASE).await?;
        let mut bundle = context.require(keys::EVIDENCE).await?;
        let diagnosis = context.fetch(keys::DIAGNOSIS).await.unwrap_or_default();
        let treatment = context.fetch(keys::TREATMENT).await.unwrap_or_default();

        let issues = collect_preliminary_issues(&diagnosis, &treatment);
        let status = match EvidenceRetriever::new(&self.deps.config, &self.deps.caps)
            .second_pass(&case, &issues)
            .await
        {
            Some(pass) => {
                bundle.merge_second_pass(pass);
                info!(
                    case_id = %case.id,
                    issues = issues.len(),
                    internal = bundle.internal.count,
                    external = bundle.external.count,
                    "Second evidence pass merged"
                );
                format!("{} preliminary issues, evidence merged", issues.len())
            }
            None => "no preliminary issues, second pass skipped".to_string(),
        };
        context.put(keys::EVIDENCE, &bundle).await;

        Ok(TaskResult::new_with_status(None, NextAction::ContinueAndExecute, Some(status)))
    }
}

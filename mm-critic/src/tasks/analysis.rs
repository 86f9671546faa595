use std::sync::Arc;

use async_trait::async_trait;
use critic_flow::{Context, FanOutTask, NextAction, Result, Task, TaskResult};

use super::{CriticDeps, ids, keys};
use crate::analysis::{DiagnosisAnalyst, TreatmentAnalyst};

pub struct DiagnosisTask {
    deps: Arc<CriticDeps>,
}

impl DiagnosisTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for DiagnosisTask {
    fn id(&self) -> &str {
        ids::DIAGNOSIS
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case = context.require(keys::CASE).await?;
        let pre = context.require(keys::PREPROCESSING).await?;
        let evidence = context.require(keys::EVIDENCE).await?;
        let lessons = context.fetch(keys::LESSONS).await.unwrap_or_default();

        let analysis = DiagnosisAnalyst::new(&self.deps.caps)
            .analyze(&case, &pre, &evidence, &lessons)
            .await;
        context.put(keys::DIAGNOSIS, &analysis).await;

        Ok(TaskResult::new(None, NextAction::End))
    }
}

pub struct TreatmentTask {
    deps: Arc<CriticDeps>,
}

impl TreatmentTask {
    pub fn new(deps: Arc<CriticDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for TreatmentTask {
    fn id(&self) -> &str {
        ids::TREATMENT
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case = context.require(keys::CASE).await?;
        let pre = context.require(keys::PREPROCESSING).await?;
        let evidence = context.require(keys::EVIDENCE).await?;
        let lessons = context.fetch(keys::LESSONS).await.unwrap_or_default();

        let analysis = TreatmentAnalyst::new(&self.deps.caps)
            .analyze(&case, &pre, &evidence, &lessons)
            .await;
        context.put(keys::TREATMENT, &analysis).await;

        Ok(TaskResult::new(None, NextAction::End))
    }
}

/// Diagnosis and treatment analyses run concurrently and are joined before
/// the second evidence pass.
pub fn analyses_fan_out(deps: &Arc<CriticDeps>) -> FanOutTask {
    FanOutTask::new(
        ids::ANALYSES,
        vec![
            Arc::new(DiagnosisTask::new(Arc::clone(deps))),
            Arc::new(TreatmentTask::new(Arc::clone(deps))),
        ],
    )
}

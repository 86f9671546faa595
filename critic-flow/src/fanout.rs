use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::{
    context::Context,
    error::{GraphError, Result},
    task::{NextAction, Task, TaskResult},
};

/// Runs independent branch tasks concurrently against the shared context and
/// only returns once every branch has finished.
///
/// Branches communicate through the context; their own next actions are
/// ignored and the fan-out continues along its outgoing edge.
pub struct FanOutTask {
    id: String,
    branches: Vec<Arc<dyn Task>>,
}

impl FanOutTask {
    pub fn new(id: impl Into<String>, branches: Vec<Arc<dyn Task>>) -> Self {
        Self {
            id: id.into(),
            branches,
        }
    }

    pub fn branch_ids(&self) -> Vec<&str> {
        self.branches.iter().map(|b| b.id()).collect()
    }
}

#[async_trait]
impl Task for FanOutTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let mut join_set = JoinSet::new();

        for branch in &self.branches {
            let branch = Arc::clone(branch);
            let context = context.clone();
            join_set.spawn(async move {
                let branch_id = branch.id().to_string();
                let result = branch.run(context).await;
                (branch_id, result)
            });
        }

        let mut failures = Vec::new();
        let mut joined = 0usize;
        while let Some(outcome) = join_set.join_next().await {
            match outcome {
                Ok((_, Ok(_))) => joined += 1,
                Ok((branch, Err(e))) => {
                    error!(fanout = %self.id, branch = %branch, error = %e, "Fan-out branch failed");
                    failures.push(GraphError::FanOutFailed {
                        branch,
                        reason: e.to_string(),
                    });
                }
                Err(join_error) => {
                    error!(fanout = %self.id, error = %join_error, "Fan-out branch aborted");
                    failures.push(GraphError::FanOutFailed {
                        branch: "<aborted>".to_string(),
                        reason: join_error.to_string(),
                    });
                }
            }
        }

        if let Some(first) = failures.into_iter().next() {
            return Err(first);
        }

        info!(fanout = %self.id, branches = joined, "Fan-out joined");
        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!("{joined} branches joined")),
        ))
    }
}

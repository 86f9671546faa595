use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    context::Context,
    error::{GraphError, Result},
    storage::Session,
    task::{NextAction, Task, TaskResult},
};

/// Upper bound on task executions for one session unless overridden.
pub const DEFAULT_MAX_STEPS: usize = 64;

/// Type alias for edge condition functions
pub type EdgeCondition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Edge between tasks in the graph
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: Option<EdgeCondition>,
}

/// A fixed transition table of tasks.
///
/// The table is frozen once built; execution only moves the session cursor.
/// Every task execution counts as one step and a session that reaches
/// `max_steps` fails with [`GraphError::StepLimitExceeded`] instead of
/// looping forever.
pub struct Graph {
    pub id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
    max_steps: usize,
}

impl Graph {
    pub fn start_task_id(&self) -> Option<&str> {
        self.start_task_id.as_deref()
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn has_task(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Execute the session from its current task until a task pauses or ends the flow.
    pub async fn execute_session(&self, session: &mut Session) -> Result<ExecutionResult> {
        loop {
            let result = self.execute_step(session).await?;
            session.status_message = result.status_message.clone();

            match &result.next_action {
                NextAction::ContinueAndExecute => {
                    match self.find_next_task(&result.task_id, &session.context) {
                        Some(next_task_id) => session.current_task_id = next_task_id,
                        None => {
                            return Ok(ExecutionResult {
                                response: result.response,
                                status: ExecutionStatus::Completed,
                            });
                        }
                    }
                }
                NextAction::Continue => {
                    let status = match self.find_next_task(&result.task_id, &session.context) {
                        Some(next_task_id) => {
                            session.current_task_id = next_task_id;
                            ExecutionStatus::Paused
                        }
                        None => ExecutionStatus::Completed,
                    };
                    return Ok(ExecutionResult {
                        response: result.response,
                        status,
                    });
                }
                NextAction::GoTo(target_id) => {
                    if !self.tasks.contains_key(target_id) {
                        return Err(GraphError::TaskNotFound(target_id.clone()));
                    }
                    session.current_task_id = target_id.clone();
                    return Ok(ExecutionResult {
                        response: result.response,
                        status: ExecutionStatus::Paused,
                    });
                }
                NextAction::WaitForInput => {
                    return Ok(ExecutionResult {
                        response: result.response,
                        status: ExecutionStatus::WaitingForInput,
                    });
                }
                NextAction::End => {
                    return Ok(ExecutionResult {
                        response: result.response,
                        status: ExecutionStatus::Completed,
                    });
                }
            }
        }
    }

    async fn execute_step(&self, session: &mut Session) -> Result<TaskResult> {
        let task_id = session.current_task_id.clone();
        if session.steps >= self.max_steps {
            return Err(GraphError::StepLimitExceeded {
                limit: self.max_steps,
                task_id,
            });
        }

        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.clone()))?;

        debug!(graph = %self.id, task = %task_id, step = session.steps, "Executing task");
        session.steps += 1;
        session.history.push(task_id.clone());

        let mut result = task.run(session.context.clone()).await?;
        result.task_id = task_id;
        Ok(result)
    }

    /// Find the next task based on edges and conditions.
    ///
    /// Edges are evaluated in insertion order and the first conditional edge
    /// whose predicate holds wins; unconditional edges act as the default.
    pub fn find_next_task(&self, current_task_id: &str, context: &Context) -> Option<String> {
        let outgoing = || self.edges.iter().filter(|e| e.from == current_task_id);

        outgoing()
            .find(|edge| edge.condition.as_ref().is_some_and(|condition| condition(context)))
            .or_else(|| outgoing().find(|edge| edge.condition.is_none()))
            .map(|edge| edge.to.clone())
    }
}

/// Builder for creating graphs
pub struct GraphBuilder {
    id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
    max_steps: usize,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: HashMap::new(),
            edges: Vec::new(),
            start_task_id: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Add a task; the first task added becomes the start task.
    pub fn add_task(mut self, task: Arc<dyn Task>) -> Self {
        let task_id = task.id().to_string();
        if self.start_task_id.is_none() {
            self.start_task_id = Some(task_id.clone());
        }
        self.tasks.insert(task_id, task);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    pub fn set_start_task(mut self, task_id: impl Into<String>) -> Self {
        self.start_task_id = Some(task_id.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn build(self) -> Graph {
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.tasks.contains_key(endpoint) {
                    warn!(graph = %self.id, task = %endpoint, "Edge refers to an unknown task");
                }
            }
        }

        Graph {
            id: self.id,
            tasks: self.tasks,
            edges: self.edges,
            start_task_id: self.start_task_id,
            max_steps: self.max_steps,
        }
    }
}

/// Status of a session after [`Graph::execute_session`] returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Stopped on a task boundary; the next call resumes at `current_task_id`
    Paused,
    /// A task asked to be re-run with new input
    WaitingForInput,
    /// The workflow reached an end
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub response: Option<String>,
    pub status: ExecutionStatus,
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{context::Context, error::Result};

/// Result of a task execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub response: Option<String>,
    pub next_action: NextAction,
    /// Human readable progress note, copied onto the session
    pub status_message: Option<String>,
    /// Filled in by the graph with the id of the task that produced this result
    #[serde(default)]
    pub task_id: String,
}

impl TaskResult {
    pub fn new(response: Option<String>, next_action: NextAction) -> Self {
        Self {
            response,
            next_action,
            status_message: None,
            task_id: String::new(),
        }
    }

    pub fn new_with_status(
        response: Option<String>,
        next_action: NextAction,
        status_message: Option<String>,
    ) -> Self {
        Self {
            response,
            next_action,
            status_message,
            task_id: String::new(),
        }
    }
}

/// What the graph should do after a task finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextAction {
    /// Move to the next task and pause there
    Continue,
    /// Move to the next task and execute it immediately
    ContinueAndExecute,
    /// Jump to a specific task and pause there
    GoTo(String),
    /// The workflow is finished
    End,
    /// Stay on the current task until it is run again
    WaitForInput,
}

/// Core trait that all tasks must implement
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique identifier for this task, used as the node name in the graph
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> Result<TaskResult>;
}

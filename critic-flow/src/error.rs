use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Context error: {0}")]
    ContextError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Step limit of {limit} exceeded while entering task {task_id}")]
    StepLimitExceeded { limit: usize, task_id: String },

    #[error("Fan-out branch {branch} failed: {reason}")]
    FanOutFailed { branch: String, reason: String },
}

pub type Result<T> = std::result::Result<T, GraphError>;

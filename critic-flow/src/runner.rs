//! FlowRunner – loads a session, executes it until the graph pauses or
//! completes, and persists the updated session back to storage.
//!
//! Use [`Graph::execute_session`] directly when the session never needs to
//! leave the caller, e.g. in tests that inspect intermediate state.

use std::sync::Arc;

use crate::{
    error::{GraphError, Result},
    graph::{ExecutionResult, Graph},
    storage::SessionStorage,
};

#[derive(Clone)]
pub struct FlowRunner {
    graph: Arc<Graph>,
    storage: Arc<dyn SessionStorage>,
}

impl FlowRunner {
    pub fn new(graph: Arc<Graph>, storage: Arc<dyn SessionStorage>) -> Self {
        Self { graph, storage }
    }

    pub async fn run(&self, session_id: &str) -> Result<ExecutionResult> {
        let mut session = self
            .storage
            .get(session_id)
            .await?
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?;

        let result = self.graph.execute_session(&mut session).await;

        // Persist even on failure so the history shows where the run stopped.
        self.storage.save(session).await?;

        result
    }
}

pub mod context;
pub mod error;
pub mod fanout;
pub mod graph;
pub mod runner;
pub mod storage;
pub mod task;

// Re-export commonly used types
pub use context::{Context, Key};
pub use error::{GraphError, Result};
pub use fanout::FanOutTask;
pub use graph::{DEFAULT_MAX_STEPS, ExecutionResult, ExecutionStatus, Graph, GraphBuilder};
pub use runner::FlowRunner;
pub use storage::{InMemorySessionStorage, Session, SessionStorage};
pub use task::{NextAction, Task, TaskResult};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const ROUND: Key<u32> = Key::new("round");
    const LOG: Key<Vec<String>> = Key::new("log");

    struct Step {
        id: &'static str,
        action: NextAction,
    }

    #[async_trait]
    impl Task for Step {
        fn id(&self) -> &str {
            self.id
        }

        async fn run(&self, context: Context) -> Result<TaskResult> {
            let mut log = context.fetch(LOG).await.unwrap_or_default();
            log.push(self.id.to_string());
            context.put(LOG, &log).await;
            Ok(TaskResult::new(None, self.action.clone()))
        }
    }

    struct Counter;

    #[async_trait]
    impl Task for Counter {
        fn id(&self) -> &str {
            "counter"
        }

        async fn run(&self, context: Context) -> Result<TaskResult> {
            let round = context.fetch(ROUND).await.unwrap_or(0) + 1;
            context.put(ROUND, &round).await;
            Ok(TaskResult::new_with_status(
                None,
                NextAction::ContinueAndExecute,
                Some(format!("round {round}")),
            ))
        }
    }

    struct Sleepy {
        id: &'static str,
        millis: u64,
    }

    #[async_trait]
    impl Task for Sleepy {
        fn id(&self) -> &str {
            self.id
        }

        async fn run(&self, context: Context) -> Result<TaskResult> {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            context.set(self.id, true).await;
            Ok(TaskResult::new(None, NextAction::End))
        }
    }

    struct Failing;

    #[async_trait]
    impl Task for Failing {
        fn id(&self) -> &str {
            "failing"
        }

        async fn run(&self, _context: Context) -> Result<TaskResult> {
            Err(GraphError::TaskExecutionFailed("boom".to_string()))
        }
    }

    fn step(id: &'static str, action: NextAction) -> Arc<dyn Task> {
        Arc::new(Step { id, action })
    }

    #[tokio::test]
    async fn continue_and_execute_runs_chain_to_end() {
        let graph = GraphBuilder::new("chain")
            .add_task(step("a", NextAction::ContinueAndExecute))
            .add_task(step("b", NextAction::ContinueAndExecute))
            .add_task(step("c", NextAction::End))
            .add_edge("a", "b")
            .add_edge("b", "c")
            .build();

        let mut session = Session::start("chain", "a");
        let result = graph.execute_session(&mut session).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(session.history, vec!["a", "b", "c"]);
        let log = session.context.fetch(LOG).await.unwrap();
        assert_eq!(log, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn continue_pauses_on_next_task() {
        let graph = GraphBuilder::new("pause")
            .add_task(step("a", NextAction::Continue))
            .add_task(step("b", NextAction::End))
            .add_edge("a", "b")
            .build();

        let mut session = Session::start("pause", "a");
        let first = graph.execute_session(&mut session).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Paused);
        assert_eq!(session.current_task_id, "b");

        let second = graph.execute_session(&mut session).await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn conditional_edge_loops_until_predicate_fails() {
        let graph = GraphBuilder::new("loop")
            .add_task(Arc::new(Counter))
            .add_task(step("done", NextAction::End))
            .add_conditional_edge("counter", "counter", |ctx: &Context| {
                ctx.fetch_sync(ROUND).unwrap_or(0) < 3
            })
            .add_edge("counter", "done")
            .build();

        let mut session = Session::start("loop", "counter");
        graph.execute_session(&mut session).await.unwrap();

        assert_eq!(session.context.fetch(ROUND).await, Some(3));
        assert_eq!(session.history.last().map(String::as_str), Some("done"));
        assert_eq!(session.status_message, None);
    }

    #[tokio::test]
    async fn unconditional_self_loop_hits_step_limit() {
        let graph = GraphBuilder::new("runaway")
            .add_task(Arc::new(Counter))
            .add_edge("counter", "counter")
            .with_max_steps(5)
            .build();

        let mut session = Session::start("runaway", "counter");
        let err = graph.execute_session(&mut session).await.unwrap_err();

        assert!(matches!(err, GraphError::StepLimitExceeded { limit: 5, .. }));
        assert_eq!(session.steps, 5);
    }

    #[tokio::test]
    async fn fan_out_joins_all_branches_before_continuing() {
        let fanout = FanOutTask::new(
            "fanout",
            vec![
                Arc::new(Sleepy { id: "slow", millis: 30 }),
                Arc::new(Sleepy { id: "fast", millis: 1 }),
            ],
        );
        assert_eq!(fanout.branch_ids(), vec!["slow", "fast"]);

        let graph = GraphBuilder::new("fan")
            .add_task(Arc::new(fanout))
            .add_task(step("join", NextAction::End))
            .add_edge("fanout", "join")
            .build();

        let mut session = Session::start("fan", "fanout");
        graph.execute_session(&mut session).await.unwrap();

        let slow: Option<bool> = session.context.get("slow").await;
        let fast: Option<bool> = session.context.get("fast").await;
        assert_eq!(slow, Some(true));
        assert_eq!(fast, Some(true));
        assert_eq!(session.history, vec!["fanout", "join"]);
    }

    #[tokio::test]
    async fn fan_out_surfaces_branch_failure() {
        let graph = GraphBuilder::new("fan")
            .add_task(Arc::new(FanOutTask::new(
                "fanout",
                vec![Arc::new(Failing), Arc::new(Sleepy { id: "ok", millis: 1 })],
            )))
            .build();

        let mut session = Session::start("fan", "fanout");
        let err = graph.execute_session(&mut session).await.unwrap_err();
        assert!(matches!(err, GraphError::FanOutFailed { ref branch, .. } if branch == "failing"));
    }

    #[tokio::test]
    async fn runner_persists_session_between_calls() {
        let graph = Arc::new(
            GraphBuilder::new("stored")
                .add_task(step("a", NextAction::Continue))
                .add_task(step("b", NextAction::End))
                .add_edge("a", "b")
                .build(),
        );
        let storage: Arc<dyn SessionStorage> = Arc::new(InMemorySessionStorage::new());
        let session = Session::start("stored", "a");
        let id = session.id.clone();
        storage.save(session).await.unwrap();

        let runner = FlowRunner::new(graph, storage.clone());
        assert_eq!(runner.run(&id).await.unwrap().status, ExecutionStatus::Paused);
        assert_eq!(runner.run(&id).await.unwrap().status, ExecutionStatus::Completed);

        let stored = storage.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.history, vec!["a", "b"]);

        assert!(matches!(
            runner.run("missing").await,
            Err(GraphError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn goto_unknown_task_is_an_error() {
        let graph = GraphBuilder::new("goto")
            .add_task(step("a", NextAction::GoTo("nowhere".to_string())))
            .build();

        let mut session = Session::start("goto", "a");
        assert!(matches!(
            graph.execute_session(&mut session).await,
            Err(GraphError::TaskNotFound(_))
        ));
    }
}

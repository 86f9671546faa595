//! The critic: tool registry and router, budgeted runner, critique builder,
//! feedback judge and the downstream solution verifier.

pub mod builder;
pub mod feedback;
pub mod registry;
pub mod router;
pub mod runner;
pub mod toolrag;
pub mod tools;
pub mod types;
pub mod verifier;

pub use builder::{CritiqueBuilder, rerank, sanitize_citations};
pub use feedback::FeedbackJudge;
pub use registry::{ToolRegistry, is_lens, tool_names};
pub use router::{RouterStrategy, ToolRouter, heuristic_selection};
pub use runner::BudgetedRunner;
pub use toolrag::ToolRagIndex;
pub use tools::{CriticTool, ToolOutput, safe_run};
pub use types::{
    AnalysisState, BuilderMode, CohortData, CriticLoop, CritiquePoint, CritiqueReport, FeedbackDecision,
    LoopOutcome, ToolCard, ToolSelection, Trace, TraceEntry, TraceStatus,
};
pub use verifier::{Solution, SolutionVerifier, VerificationResult};

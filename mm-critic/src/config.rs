use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capability::RetryPolicy;
use crate::critic::router::RouterStrategy;
use crate::evidence::{MIN_VALIDATION_CONFIDENCE, SIMILARITY_THRESHOLD};

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Run-wide knobs. `from_env` applies `MM_CRITIC_*` overrides on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticConfig {
    /// Charged tool invocations allowed per run
    pub max_tools: usize,
    /// Upper bound on critique/judge rounds
    pub max_rounds: u32,
    /// Critique points the heuristic judge wants before accepting
    pub min_points: usize,
    pub router: RouterStrategy,
    /// Tool cards shown to the capability router after retrieval
    pub router_top_cards: usize,
    pub similarity_threshold: f64,
    pub min_validation_confidence: f64,
    pub internal_top_k: usize,
    pub literature_max_results: usize,
    pub model: String,
    pub retry: RetryPolicy,
    pub max_graph_steps: usize,
    pub memory_top_k: usize,
    pub memory_min_similarity: f64,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            max_tools: 8,
            max_rounds: 2,
            min_points: 3,
            router: RouterStrategy::Heuristic,
            router_top_cards: 6,
            similarity_threshold: SIMILARITY_THRESHOLD,
            min_validation_confidence: MIN_VALIDATION_CONFIDENCE,
            internal_top_k: 3,
            literature_max_results: 5,
            model: DEFAULT_MODEL.to_string(),
            retry: RetryPolicy::default(),
            max_graph_steps: critic_flow::DEFAULT_MAX_STEPS,
            memory_top_k: 2,
            memory_min_similarity: 0.3,
        }
    }
}

impl CriticConfig {
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`; unparsable values are logged
    /// and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_var(&lookup, "MM_CRITIC_MAX_TOOLS") {
            self.max_tools = v;
        }
        if let Some(v) = parse_var(&lookup, "MM_CRITIC_MAX_ROUNDS") {
            self.max_rounds = v;
        }
        if let Some(v) = parse_var(&lookup, "MM_CRITIC_MIN_POINTS") {
            self.min_points = v;
        }
        if let Some(v) = parse_var(&lookup, "MM_CRITIC_INTERNAL_TOP_K") {
            self.internal_top_k = v;
        }
        if let Some(v) = parse_var(&lookup, "MM_CRITIC_LITERATURE_MAX") {
            self.literature_max_results = v;
        }
        if let Some(v) = parse_var(&lookup, "MM_CRITIC_ROUTER") {
            self.router = v;
        }
        if let Some(model) = lookup("MM_CRITIC_MODEL").filter(|m| !m.trim().is_empty()) {
            self.model = model;
        }
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

//! Black-box capabilities the pipeline depends on: language-model completion,
//! similarity search over historical cases and external literature search.
//!
//! Every component receives these through [`Capabilities`]; a missing
//! capability selects the heuristic code path rather than failing.

pub mod json;
pub mod llm;
pub mod pubmed;
pub mod retry;
pub mod vector;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::EpisodicMemory;
use crate::models::{LiteratureArticle, SimilarCase};

pub use json::{ask_json, decode, decode_or_default};
pub use llm::OpenRouterLlm;
pub use pubmed::PubMedClient;
pub use retry::{RetryPolicy, with_retry};
pub use vector::{Embedder, FastEmbedder, PgVectorCaseIndex};

#[derive(Error, Debug, Clone)]
pub enum CapabilityError {
    #[error("capability call timed out after {0:?}")]
    Timeout(Duration),

    #[error("capability transport failure: {0}")]
    Transport(String),

    #[error("malformed capability response: {0}")]
    Malformed(String),
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CapabilityError::Malformed(_))
    }
}

pub type CapabilityResult<T> = std::result::Result<T, CapabilityError>;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: f64,
    pub max_tokens: u64,
    /// The caller will parse the reply as a JSON object
    pub structured: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature: 0.2,
            max_tokens: 1200,
            structured: false,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn structured(mut self) -> Self {
        self.structured = true;
        self
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> CapabilityResult<String>;
}

#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// Up to `k` cases ordered best first, similarity normalized to [0, 1].
    async fn search(&self, query: &str, k: usize) -> CapabilityResult<Vec<SimilarCase>>;
}

#[async_trait]
pub trait LiteratureSearch: Send + Sync {
    /// An empty list is a valid answer.
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> CapabilityResult<Vec<LiteratureArticle>>;
}

/// The set of configured capabilities handed to every component.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub llm: Option<Arc<dyn LlmClient>>,
    pub similarity: Option<Arc<dyn SimilaritySearch>>,
    pub literature: Option<Arc<dyn LiteratureSearch>>,
    pub memory: Option<Arc<dyn EpisodicMemory>>,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilaritySearch>) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_literature(mut self, literature: Arc<dyn LiteratureSearch>) -> Self {
        self.literature = Some(literature);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn EpisodicMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn llm(&self) -> Option<&dyn LlmClient> {
        self.llm.as_deref()
    }

    /// Labels of configured capabilities, for start-up logging.
    pub fn describe(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.llm.is_some() {
            out.push("llm");
        }
        if self.similarity.is_some() {
            out.push("similarity");
        }
        if self.literature.is_some() {
            out.push("literature");
        }
        if self.memory.is_some() {
            out.push("memory");
        }
        out
    }
}

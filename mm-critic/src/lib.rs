//! Automated morbidity & mortality critique.
//!
//! A case narrative flows through preprocessing, two-pass corrective evidence
//! retrieval, concurrent diagnosis/treatment analysis and a budgeted critic
//! loop (route, run tools, build critique, judge), then solution verification.
//! Every external capability is optional; without one the matching heuristic
//! path runs and the degradation is recorded.

pub mod analysis;
pub mod capability;
pub mod classify;
pub mod config;
pub mod critic;
pub mod evidence;
pub mod memory;
pub mod models;
pub mod preprocess;
pub mod tasks;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

pub use capability::{
    Capabilities, CapabilityError, CapabilityResult, CompletionRequest, LiteratureSearch, LlmClient, SimilaritySearch,
};
pub use config::CriticConfig;
pub use critic::{CritiqueReport, RouterStrategy};
pub use evidence::{EvidenceBundle, RetrievalMode};
pub use memory::{EpisodicMemory, FileEpisodicStore};
pub use models::*;
pub use workflow::{CaseReport, CriticPipeline, build_critic_graph};

//! In-process capability fakes shared by unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::capability::{
    CapabilityError, CapabilityResult, CompletionRequest, LiteratureSearch, LlmClient, SimilaritySearch,
};
use crate::models::{Case, Demographics, LiteratureArticle, Outcome, SimilarCase};

/// Replies with the first scripted answer whose needle occurs in the prompt.
/// Unscripted prompts fail with a transport error.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Vec<(String, String)>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply_to(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), reply.to_string()));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> CapabilityResult<String> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.rules
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| CapabilityError::Transport("no scripted reply".to_string()))
    }
}

pub struct UnreachableLlm;

#[async_trait]
impl LlmClient for UnreachableLlm {
    async fn complete(&self, _request: CompletionRequest) -> CapabilityResult<String> {
        Err(CapabilityError::Transport("connection refused".to_string()))
    }
}

pub struct FakeSimilarity {
    hits: Vec<SimilarCase>,
}

impl FakeSimilarity {
    pub fn new(hits: Vec<SimilarCase>) -> Self {
        Self { hits }
    }
}

#[async_trait]
impl SimilaritySearch for FakeSimilarity {
    async fn search(&self, _query: &str, k: usize) -> CapabilityResult<Vec<SimilarCase>> {
        Ok(self.hits.iter().take(k).cloned().collect())
    }
}

pub struct FakeLiterature {
    articles: Option<Vec<LiteratureArticle>>,
}

impl FakeLiterature {
    pub fn with_ids(ids: &[&str]) -> Self {
        Self {
            articles: Some(ids.iter().map(|id| article(id)).collect()),
        }
    }

    pub fn failing() -> Self {
        Self { articles: None }
    }
}

#[async_trait]
impl LiteratureSearch for FakeLiterature {
    async fn search(&self, _query: &str, max_results: usize) -> CapabilityResult<Vec<LiteratureArticle>> {
        match &self.articles {
            Some(articles) => Ok(articles.iter().take(max_results).cloned().collect()),
            None => Err(CapabilityError::Timeout(std::time::Duration::from_secs(60))),
        }
    }
}

pub fn article(id: &str) -> LiteratureArticle {
    LiteratureArticle {
        source_id: id.to_string(),
        title: format!("Guideline {id}"),
        abstract_text: format!("Abstract of article {id} on complication prevention."),
        journal: Some("Hepatology".to_string()),
    }
}

pub fn case_with(text: &str, similar_cases: Vec<SimilarCase>) -> Case {
    Case {
        id: "case-1".to_string(),
        demographics: Demographics {
            age: Some(61),
            sex: Some("M".to_string()),
            ..Default::default()
        },
        text: text.to_string(),
        outcome: Outcome::Dead,
        diagnosis: Some("Cirrhosis".to_string()),
        secondary_diagnoses: Vec::new(),
        cause_of_death: None,
        critical_events: Vec::new(),
        similar_cases,
    }
}

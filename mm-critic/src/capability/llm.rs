use async_trait::async_trait;
use rig::{agent::Agent, client::CompletionClient, completion::Prompt, providers::openrouter};
use tracing::debug;

use super::{CapabilityError, CapabilityResult, CompletionRequest, LlmClient, RetryPolicy, with_retry};

const DEFAULT_PREAMBLE: &str =
    "You are a senior clinician reviewing a hospital case for a morbidity and mortality conference.";

const STRUCTURED_SUFFIX: &str =
    "\nRespond with a single JSON object and nothing else. Do not wrap it in Markdown.";

/// [`LlmClient`] backed by an OpenRouter-hosted chat model.
pub struct OpenRouterLlm {
    client: openrouter::Client,
    model: String,
    retry: RetryPolicy,
}

impl OpenRouterLlm {
    pub fn new(api_key: &str, model: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: openrouter::Client::new(api_key),
            model: model.into(),
            retry,
        }
    }

    pub fn from_env(model: impl Into<String>, retry: RetryPolicy) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENROUTER_API_KEY not set"))?;
        Ok(Self::new(&api_key, model, retry))
    }

    fn agent_for(&self, request: &CompletionRequest) -> Agent<openrouter::CompletionModel> {
        let mut preamble = request
            .system
            .clone()
            .unwrap_or_else(|| DEFAULT_PREAMBLE.to_string());
        if request.structured {
            preamble.push_str(STRUCTURED_SUFFIX);
        }

        self.client
            .agent(&self.model)
            .preamble(&preamble)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens)
            .build()
    }
}

#[async_trait]
impl LlmClient for OpenRouterLlm {
    async fn complete(&self, request: CompletionRequest) -> CapabilityResult<String> {
        let agent = self.agent_for(&request);
        let agent = &agent;
        let prompt = request.prompt.as_str();

        let reply = with_retry(&self.retry, "llm", || async move {
            agent
                .prompt(prompt)
                .await
                .map_err(|e| CapabilityError::Transport(e.to_string()))
        })
        .await?;

        debug!(model = %self.model, chars = reply.len(), "LLM reply received");
        Ok(reply)
    }
}

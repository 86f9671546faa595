use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use mm_critic::capability::{Embedder, FastEmbedder, OpenRouterLlm, PgVectorCaseIndex, PubMedClient};
use mm_critic::{Capabilities, Case, CriticConfig, CriticPipeline, FileEpisodicStore, RouterStrategy};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const CASES_TABLE: &str = "clinical_cases";

#[derive(Debug, Parser)]
#[command(name = "mm-critic", version, about = "Critique a morbidity & mortality case")]
struct Cli {
    /// Case file (JSON)
    #[arg(long)]
    case: PathBuf,

    /// Where to write the report
    #[arg(long, default_value = "report.json")]
    out: PathBuf,

    /// Tool routing strategy: heuristic or capability
    #[arg(long)]
    router: Option<RouterStrategy>,

    #[arg(long)]
    max_tools: Option<usize>,

    #[arg(long)]
    max_rounds: Option<u32>,

    /// Episodic memory file; recall and append are skipped without it
    #[arg(long)]
    memory: Option<PathBuf>,

    /// Skip literature search
    #[arg(long)]
    offline: bool,

    /// Run every stage on its heuristic path
    #[arg(long)]
    no_llm: bool,

    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if json {
        let subscriber = FmtSubscriber::builder().with_env_filter(filter).json().finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Wires whatever capabilities the environment provides. A capability that
/// fails to initialize is left out and its stage runs heuristically.
async fn build_capabilities(cli: &Cli, config: &CriticConfig) -> Capabilities {
    let mut caps = Capabilities::none();

    if !cli.no_llm {
        match OpenRouterLlm::from_env(config.model.clone(), config.retry) {
            Ok(llm) => caps = caps.with_llm(Arc::new(llm)),
            Err(e) => warn!(error = %e, "Language model disabled"),
        }
    }

    if !cli.offline {
        caps = caps.with_literature(Arc::new(PubMedClient::new(config.retry)));
    }

    let database_url = std::env::var("CASES_DATABASE_URL").ok();
    if database_url.is_none() && cli.memory.is_none() {
        return caps;
    }

    let embedder: Arc<dyn Embedder> = match FastEmbedder::try_new() {
        Ok(embedder) => Arc::new(embedder),
        Err(e) => {
            warn!(error = %e, "Embedding model unavailable, similar case search and memory disabled");
            return caps;
        }
    };

    if let Some(url) = database_url {
        match PgVectorCaseIndex::connect(&url, CASES_TABLE, Arc::clone(&embedder)).await {
            Ok(index) => caps = caps.with_similarity(Arc::new(index)),
            Err(e) => warn!(error = %e, "Similar case search disabled"),
        }
    }

    if let Some(path) = &cli.memory {
        match FileEpisodicStore::open(path, embedder).await {
            Ok(store) => caps = caps.with_memory(Arc::new(store)),
            Err(e) => warn!(path = %path.display(), error = %e, "Episodic memory disabled"),
        }
    }

    caps
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let mut config = CriticConfig::from_env();
    if let Some(router) = cli.router {
        config.router = router;
    }
    if let Some(max_tools) = cli.max_tools {
        config.max_tools = max_tools;
    }
    if let Some(max_rounds) = cli.max_rounds {
        config.max_rounds = max_rounds;
    }

    let raw = tokio::fs::read_to_string(&cli.case)
        .await
        .with_context(|| format!("reading case file {}", cli.case.display()))?;
    let case: Case = serde_json::from_str(&raw).with_context(|| format!("parsing case file {}", cli.case.display()))?;

    let caps = build_capabilities(&cli, &config).await;
    let pipeline = CriticPipeline::new(config, caps);
    let report = pipeline.run(case).await?;

    let json = serde_json::to_string_pretty(&report)?;
    tokio::fs::write(&cli.out, json)
        .await
        .with_context(|| format!("writing report {}", cli.out.display()))?;
    info!(out = %cli.out.display(), points = report.critique.critique_points.len(), "Report written");

    Ok(())
}

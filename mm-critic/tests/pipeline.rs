//! End-to-end runs of the critique graph against in-process capabilities.

use std::sync::Arc;

use async_trait::async_trait;
use mm_critic::capability::Embedder;
use mm_critic::critic::verifier::cites_known_source;
use mm_critic::critic::{BuilderMode, LoopOutcome, TraceStatus};
use mm_critic::memory::{Episode, ScoredEpisode};
use mm_critic::preprocess::preprocess;
use mm_critic::{
    Capabilities, CapabilityError, CapabilityResult, Case, CaseReport, CompletionRequest, CriticConfig,
    CriticPipeline, Demographics, EpisodicMemory, FileEpisodicStore, LiteratureArticle, LiteratureSearch, LlmClient, Outcome,
    RetrievalMode, RouterStrategy, Severity, SimilarCase,
};

const NARRATIVE: &str = "Patient admitted on 2024-03-01 with decompensated cirrhosis and tense ascites. \
    Hemoglobin 10.2 on admission. \
    Bedside paracentesis performed without ultrasound guidance at 14:00. \
    At 18:30 BP 78/40 with hypotension and HR 128. \
    Hemoglobin dropped to 6.1 at 22:00 and CT showed hemoperitoneum. \
    Assessment: hemorrhagic shock after paracentesis. \
    Transfused and started on norepinephrine but patient deteriorated overnight. \
    Patient died on day 3.";

/// Answers the first rule whose needle appears in the prompt; anything else
/// fails like an unreachable endpoint.
#[derive(Default)]
struct ScriptedLlm {
    rules: Vec<(&'static str, &'static str)>,
}

impl ScriptedLlm {
    fn reply_to(mut self, needle: &'static str, reply: &'static str) -> Self {
        self.rules.push((needle, reply));
        self
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> CapabilityResult<String> {
        self.rules
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle))
            .map(|(_, reply)| reply.to_string())
            .ok_or_else(|| CapabilityError::Transport("connection refused".to_string()))
    }
}

struct StaticLiterature;

#[async_trait]
impl LiteratureSearch for StaticLiterature {
    async fn search(&self, _query: &str, max_results: usize) -> CapabilityResult<Vec<LiteratureArticle>> {
        Ok(["PMID100", "PMID200"]
            .iter()
            .take(max_results)
            .map(|id| LiteratureArticle {
                source_id: id.to_string(),
                title: format!("Bleeding after paracentesis ({id})"),
                abstract_text: "Ultrasound guidance reduces hemorrhagic complications of paracentesis.".to_string(),
                journal: None,
            })
            .collect())
    }
}

/// Memory whose backing store is gone: every call fails.
struct UnreachableMemory;

#[async_trait]
impl EpisodicMemory for UnreachableMemory {
    async fn search(
        &self,
        _text: &str,
        _k: usize,
        _min_similarity: f64,
        _diagnoses: &[String],
    ) -> CapabilityResult<Vec<ScoredEpisode>> {
        Err(CapabilityError::Transport("store offline".to_string()))
    }

    async fn append(&self, _episode: Episode) -> CapabilityResult<()> {
        Err(CapabilityError::Transport("store offline".to_string()))
    }
}

struct HashedWords;

#[async_trait]
impl Embedder for HashedWords {
    async fn embed(&self, text: &str) -> CapabilityResult<Vec<f32>> {
        let mut v = vec![0.0f32; 64];
        for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|w| w.len() > 2) {
            let slot = word.bytes().fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize)) % 64;
            v[slot] += 1.0;
        }
        Ok(v)
    }
}

fn similar(id: &str, similarity: f64) -> SimilarCase {
    SimilarCase {
        id: id.to_string(),
        text: "Cirrhotic patient with ascites. Paracentesis without ultrasound complicated by \
               hemoperitoneum and hypotension. Patient died."
            .to_string(),
        similarity,
        outcome: Outcome::Dead,
        metadata: serde_json::Value::Null,
    }
}

fn case(similar_cases: Vec<SimilarCase>) -> Case {
    Case {
        id: "mm-042".to_string(),
        demographics: Demographics {
            age: Some(58),
            sex: Some("F".to_string()),
            ..Default::default()
        },
        text: NARRATIVE.to_string(),
        outcome: Outcome::Dead,
        diagnosis: Some("Cirrhosis".to_string()),
        secondary_diagnoses: vec!["Ascites".to_string()],
        cause_of_death: Some("Hemorrhagic shock".to_string()),
        critical_events: Vec::new(),
        similar_cases,
    }
}

fn builder_runs(report: &CaseReport) -> usize {
    report
        .trace
        .entries()
        .iter()
        .filter(|e| e.tool == "critique_builder")
        .count()
}

fn degraded_reasons(report: &CaseReport, tool: &str) -> Vec<String> {
    report
        .trace
        .entries()
        .iter()
        .filter(|e| e.tool == tool && e.status == TraceStatus::Degraded)
        .filter_map(|e| e.detail.as_ref()?.get("reason")?.as_str().map(str::to_string))
        .collect()
}

fn assert_citations_resolve(report: &CaseReport) {
    let spans = preprocess(NARRATIVE).spans;
    for point in &report.critique.critique_points {
        assert!(spans.resolves(&point.span_id), "unresolved citation {:?}", point.span_id);
    }
}

#[tokio::test]
async fn offline_run_takes_heuristic_paths_and_stays_bounded() {
    let config = CriticConfig::default();
    let pipeline = CriticPipeline::new(config.clone(), Capabilities::none());

    let report = pipeline.run(case(Vec::new())).await.unwrap();

    assert_eq!(report.evidence.retrieval_mode, RetrievalMode::ExternalOnly);
    assert_eq!(report.evidence.internal.count, 0);
    assert!(report.evidence.degradations.iter().any(|d| d.contains("literature search not configured")));
    assert!(
        degraded_reasons(&report, "crag_retrieval")
            .iter()
            .any(|r| r.contains("literature search not configured"))
    );
    assert_eq!(degraded_reasons(&report, "diagnosis_analyst"), vec!["no language model configured"]);
    assert_eq!(degraded_reasons(&report, "treatment_analyst").len(), 1);
    assert!(report.executed_budget <= config.max_tools);
    assert!(builder_runs(&report) <= config.max_rounds as usize + 1);
    assert!(report.loop_outcome.is_some());
    assert_eq!(report.critique.mode, BuilderMode::Heuristic);
    assert_citations_resolve(&report);

    assert_eq!(report.transitions.first().map(String::as_str), Some("preprocess"));
    assert_eq!(report.transitions.last().map(String::as_str), Some("remember"));
    assert!(report.transitions.iter().any(|t| t == "analyses"));
    assert!(report.diagnosis.is_some());
    assert!(report.treatment.is_some());
    // nothing to cite without cases or literature
    assert!(report.solutions.solutions.is_empty());
    assert!(report.solutions.degraded.is_some());
}

#[tokio::test]
async fn tight_budget_is_never_exceeded_and_loop_exhausts() {
    let config = CriticConfig {
        max_tools: 1,
        max_rounds: 3,
        min_points: 10,
        ..CriticConfig::default()
    };
    let pipeline = CriticPipeline::new(config, Capabilities::none());

    let report = pipeline.run(case(Vec::new())).await.unwrap();

    assert!(report.executed_budget <= 1);
    assert_eq!(report.loop_outcome, Some(LoopOutcome::Exhausted));
    assert_eq!(builder_runs(&report), 3);
    assert!(report.trace.count(TraceStatus::BudgetStop) >= 1);
    for entry in report.trace.entries() {
        if let Some(budget) = entry.detail.as_ref().and_then(|d| d.get("executed_budget")) {
            assert!(budget.as_u64().unwrap_or(0) <= 1);
        }
    }
    let routes = report.transitions.iter().filter(|t| *t == "route").count();
    assert_eq!(routes, 3);
}

#[tokio::test]
async fn validated_similar_cases_give_hybrid_evidence_and_cited_solutions() {
    let llm = ScriptedLlm::default().reply_to(
        "Decide whether these historical cases",
        r#"{"is_valid": true, "reason": "same bleeding pathway", "confidence": 0.8, "valid_case_indices": [0, 1, 2]}"#,
    );
    let caps = Capabilities::none()
        .with_llm(Arc::new(llm))
        .with_literature(Arc::new(StaticLiterature));
    let pipeline = CriticPipeline::new(CriticConfig::default(), caps);

    let cases = vec![similar("H-1", 0.95), similar("H-2", 0.88), similar("H-3", 0.71)];
    let report = pipeline.run(case(cases)).await.unwrap();

    assert_eq!(report.evidence.retrieval_mode, RetrievalMode::Hybrid);
    assert!(report.evidence.internal.count >= 1 && report.evidence.internal.count <= 3);
    assert_eq!(report.evidence.external.count, 2);
    assert!(report.executed_tools.iter().any(|t| t == "behavior_topk_direct_compare"));
    // every other prompt failed, so the critique fell back and says so
    assert!(report.critique.degraded.is_some());
    assert_citations_resolve(&report);
    assert!(report.solutions.solutions.len() <= 3);
    let literature = &report.evidence.external.results;
    let case_count = report.evidence.internal.count;
    for solution in &report.solutions.solutions {
        assert!(cites_known_source(&solution.evidence, case_count, literature));
    }
}

#[tokio::test]
async fn iatrogenic_point_is_reranked_first_and_forced_high() {
    let llm = ScriptedLlm::default()
        .reply_to(
            "critical medical process reviewer",
            r#"{"analysis": "Bleeding after a blind procedure was recognised late.",
                "critique_points": [
                    {"point": "Delayed recognition of falling hemoglobin", "span_id": "E1", "severity": "medium"},
                    {"point": "Iatrogenic hemoperitoneum after paracentesis without ultrasound", "span_id": "E99", "severity": "low"}
                ],
                "risk_factors": ["coagulopathy"],
                "recommendations": ["Use ultrasound guidance for paracentesis"]}"#,
        )
        .reply_to(
            "quality judge",
            r#"{"ok": true, "reason": "sufficient", "requested_tools": [], "patch_instructions": ""}"#,
        );
    let pipeline = CriticPipeline::new(CriticConfig::default(), Capabilities::none().with_llm(Arc::new(llm)));

    let report = pipeline.run(case(Vec::new())).await.unwrap();

    let first = &report.critique.critique_points[0];
    assert!(first.point.starts_with("Iatrogenic hemoperitoneum"));
    assert_eq!(first.severity, Severity::High);
    assert_eq!(first.span_id, "record_uncertainty");
    assert_eq!(report.critique.citation_repairs, 1);
    assert_eq!(report.critique.mode, BuilderMode::Model);
    assert_eq!(report.loop_outcome, Some(LoopOutcome::Accepted));
    assert_eq!(builder_runs(&report), 1);
    assert_citations_resolve(&report);
}

#[tokio::test]
async fn unreachable_router_model_falls_back_to_heuristic_tools() {
    let config = CriticConfig {
        router: RouterStrategy::Capability,
        ..CriticConfig::default()
    };
    let pipeline = CriticPipeline::new(config, Capabilities::none().with_llm(Arc::new(ScriptedLlm::default())));

    let report = pipeline.run(case(Vec::new())).await.unwrap();

    let routing = report
        .trace
        .entries()
        .iter()
        .find(|e| e.tool == "router")
        .and_then(|e| e.detail.clone())
        .unwrap();
    assert_eq!(routing["strategy"], "heuristic");
    assert!(!routing["tools"].as_array().unwrap().is_empty());
    assert!(routing["reason"].as_str().unwrap().starts_with("capability router fallback"));
}

#[tokio::test]
async fn episodes_are_appended_and_recalled_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("episodes.json");
    let store = Arc::new(FileEpisodicStore::open(&path, Arc::new(HashedWords)).await.unwrap());

    let pipeline = CriticPipeline::new(CriticConfig::default(), Capabilities::none().with_memory(store.clone()));
    let first = pipeline.run(case(Vec::new())).await.unwrap();
    let second = pipeline.run(case(Vec::new())).await.unwrap();

    assert_eq!(store.len().await, 2);
    assert!(path.exists());
    assert!(first.notes.is_empty());
    assert!(second.notes.is_empty());

    let reopened = FileEpisodicStore::open(&path, Arc::new(HashedWords)).await.unwrap();
    assert_eq!(reopened.len().await, 2);
}

#[tokio::test]
async fn memory_failures_are_traced_and_do_not_abort_the_run() {
    let caps = Capabilities::none().with_memory(Arc::new(UnreachableMemory));
    let pipeline = CriticPipeline::new(CriticConfig::default(), caps);

    let report = pipeline.run(case(Vec::new())).await.unwrap();

    assert_eq!(report.transitions.last().map(String::as_str), Some("remember"));
    let recall = degraded_reasons(&report, "episodic_recall");
    assert_eq!(recall.len(), 1);
    assert!(recall[0].contains("store offline"));
    let append = degraded_reasons(&report, "episodic_append");
    assert_eq!(append.len(), 1);
    assert!(append[0].starts_with("episodic memory append failed"));
    assert_eq!(report.notes.len(), 2);
}

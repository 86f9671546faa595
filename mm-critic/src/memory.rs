//! Cross-run episodic memory: what past critiques concluded, recalled for
//! similar new cases and appended after every run.
//!
//! The store is the one resource shared across runs. Appends are serialized
//! behind a write lock; searches only take the read lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::capability::vector::cosine_similarity;
use crate::capability::{CapabilityError, CapabilityResult, Embedder};
use crate::classify::{IssueClass, classify};
use crate::critic::{CritiqueReport, Solution};
use crate::models::{Case, Outcome, Severity};

const MAX_LESSONS: usize = 10;
const MAX_SOLUTIONS: usize = 6;
const SUMMARY_TEXT_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueSummary {
    pub issue: String,
    pub severity: Severity,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionSummary {
    pub issue: String,
    pub action: String,
    pub priority: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    pub timestamp: DateTime<Utc>,
    pub patient_id: String,
    pub diagnosis: String,
    #[serde(default)]
    pub secondary_diagnoses: Vec<String>,
    pub outcome: Outcome,
    pub clinical_summary: String,
    #[serde(default)]
    pub critique_summary: Vec<CritiqueSummary>,
    #[serde(default)]
    pub lessons_learned: Vec<String>,
    #[serde(default)]
    pub key_solutions: Vec<SolutionSummary>,
    pub confidence: f64,
}

impl Episode {
    pub fn from_run(case: &Case, report: &CritiqueReport, solutions: &[Solution], confidence: f64) -> Self {
        let now = Utc::now();
        let critique_summary = report
            .critique_points
            .iter()
            .map(|p| CritiqueSummary {
                issue: p.point.clone(),
                severity: p.severity,
                category: match classify(&p.point) {
                    IssueClass::Iatrogenic => "iatrogenic",
                    IssueClass::DeathAlignment => "death_alignment",
                    IssueClass::General => "general",
                }
                .to_string(),
            })
            .collect();

        let lessons_learned = report
            .critique_points
            .iter()
            .filter(|p| p.severity != Severity::Low)
            .map(|p| format!("[{}] {}", capitalize(p.severity.as_str()), p.point))
            .chain(solutions.iter().map(|s| format!("[Solution] {} -> {}", s.issue, s.solution)))
            .take(MAX_LESSONS)
            .collect();

        let key_solutions = solutions
            .iter()
            .take(MAX_SOLUTIONS)
            .map(|s| SolutionSummary {
                issue: s.issue.clone(),
                action: s.solution.chars().take(200).collect(),
                priority: s.priority,
            })
            .collect();

        Self {
            episode_id: format!("EP-{}", now.format("%Y%m%d_%H%M%S_%3f")),
            timestamp: now,
            patient_id: case.id.clone(),
            diagnosis: case.primary_diagnosis().to_string(),
            secondary_diagnoses: case.secondary_diagnoses.clone(),
            outcome: case.outcome,
            clinical_summary: format!(
                "{}\n{}",
                case.summary_line(),
                case.text.chars().take(SUMMARY_TEXT_CHARS).collect::<String>()
            ),
            critique_summary,
            lessons_learned,
            key_solutions,
            confidence,
        }
    }

    /// Case-insensitive substring match, either direction, against the
    /// primary or any secondary diagnosis.
    pub fn matches_diagnosis(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return false;
        }
        std::iter::once(&self.diagnosis)
            .chain(&self.secondary_diagnoses)
            .map(|d| d.trim().to_lowercase())
            .any(|d| !d.is_empty() && (d.contains(&q) || q.contains(&d)))
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEpisode {
    #[serde(flatten)]
    pub episode: Episode,
    pub similarity: f64,
}

#[async_trait]
pub trait EpisodicMemory: Send + Sync {
    /// Up to `k` episodes at or above `min_similarity`, preferring those
    /// whose diagnosis matches one of `diagnoses`.
    async fn search(
        &self,
        text: &str,
        k: usize,
        min_similarity: f64,
        diagnoses: &[String],
    ) -> CapabilityResult<Vec<ScoredEpisode>>;

    async fn append(&self, episode: Episode) -> CapabilityResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEpisode {
    episode: Episode,
    embedding: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    episodes: Vec<StoredEpisode>,
}

/// Episodes and their embeddings in one JSON file, rewritten atomically
/// (temp file + rename) on every append.
pub struct FileEpisodicStore {
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    episodes: RwLock<Vec<StoredEpisode>>,
}

impl FileEpisodicStore {
    pub async fn open(path: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), count = snapshot.episodes.len(), "Episodic memory opened");
        Ok(Self {
            path,
            embedder,
            episodes: RwLock::new(snapshot.episodes),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.episodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, episodes: &[StoredEpisode]) -> std::io::Result<()> {
        let snapshot = Snapshot {
            episodes: episodes.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

#[async_trait]
impl EpisodicMemory for FileEpisodicStore {
    async fn search(
        &self,
        text: &str,
        k: usize,
        min_similarity: f64,
        diagnoses: &[String],
    ) -> CapabilityResult<Vec<ScoredEpisode>> {
        if self.episodes.read().await.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(text).await?;
        let episodes = self.episodes.read().await;

        let mut ranked: Vec<ScoredEpisode> = episodes
            .iter()
            .map(|stored| ScoredEpisode {
                episode: stored.episode.clone(),
                similarity: cosine_similarity(&query, &stored.embedding),
            })
            .collect();
        ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        ranked.truncate((k * 3).max(10));
        ranked.retain(|e| e.similarity >= min_similarity);

        let (matched, unmatched): (Vec<_>, Vec<_>) = ranked
            .into_iter()
            .partition(|e| diagnoses.iter().any(|dx| e.episode.matches_diagnosis(dx)));
        let mut hits = if matched.is_empty() { unmatched } else { matched };
        hits.truncate(k);
        debug!(count = hits.len(), "Episodic memory search");
        Ok(hits)
    }

    async fn append(&self, mut episode: Episode) -> CapabilityResult<()> {
        let embedding = self.embedder.embed(&episode.clinical_summary).await?;
        let mut episodes = self.episodes.write().await;
        episode.episode_id = unique_id(&episode.episode_id, &episodes);
        let episode_id = episode.episode_id.clone();
        episodes.push(StoredEpisode { episode, embedding });
        if let Err(e) = self.persist(&episodes).await {
            episodes.pop();
            return Err(CapabilityError::Transport(format!(
                "failed to write {}: {e}",
                self.path.display()
            )));
        }
        info!(episode_id = %episode_id, count = episodes.len(), "Episode stored");
        Ok(())
    }
}

/// `id`, or `id-2`, `id-3`, ... when the store already holds it.
fn unique_id(id: &str, stored: &[StoredEpisode]) -> String {
    let taken = |candidate: &str| stored.iter().any(|s| s.episode.episode_id == candidate);
    if !taken(id) {
        return id.to_string();
    }
    (2..)
        .map(|n| format!("{id}-{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| id.to_string())
}

/// Renders up to two recalled episodes as lessons for the analysts. Empty
/// when nothing was recalled.
pub fn format_lessons(episodes: &[ScoredEpisode]) -> String {
    let mut lines = Vec::new();
    for (i, scored) in episodes.iter().take(2).enumerate() {
        let ep = &scored.episode;
        lines.push(format!("--- Past experience #{} (similarity {:.2}) ---", i + 1, scored.similarity));
        lines.push(format!("Diagnosis: {}", ep.diagnosis));
        lines.push(format!("Outcome: {}", ep.outcome));
        lines.push(format!("Confidence: {:.2}", ep.confidence));
        if !ep.lessons_learned.is_empty() {
            lines.push("Lessons:".to_string());
            lines.extend(ep.lessons_learned.iter().take(5).map(|l| format!("  - {l}")));
        }
        let critical: Vec<&CritiqueSummary> = ep
            .critique_summary
            .iter()
            .filter(|c| matches!(c.severity, Severity::Critical | Severity::High))
            .take(3)
            .collect();
        if !critical.is_empty() {
            lines.push("Key critique points:".to_string());
            lines.extend(critical.iter().map(|c| format!("  - [{}] {}", c.category, c.issue)));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critic::CritiquePoint;
    use crate::test_support::case_with;

    /// Hashed bag of words; overlapping vocabularies give high cosine.
    struct BagOfWords;

    #[async_trait]
    impl Embedder for BagOfWords {
        async fn embed(&self, text: &str) -> CapabilityResult<Vec<f32>> {
            let mut v = vec![0.0f32; 64];
            for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|w| w.len() > 2) {
                let slot = word.bytes().fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize)) % 64;
                v[slot] += 1.0;
            }
            Ok(v)
        }
    }

    fn report() -> CritiqueReport {
        CritiqueReport {
            patient_id: "case-1".to_string(),
            critique_points: vec![
                CritiquePoint {
                    point: "Iatrogenic hemoperitoneum after blind paracentesis".to_string(),
                    span_id: "E2".to_string(),
                    severity: Severity::High,
                    cohort_comparison: String::new(),
                },
                CritiquePoint {
                    point: "Documentation of consent is thin".to_string(),
                    span_id: "record_uncertainty".to_string(),
                    severity: Severity::Low,
                    cohort_comparison: String::new(),
                },
            ],
            ..Default::default()
        }
    }

    fn episode(text: &str, diagnosis: &str) -> Episode {
        let mut case = case_with(text, vec![]);
        case.diagnosis = Some(diagnosis.to_string());
        Episode::from_run(&case, &report(), &[], 0.8)
    }

    #[test]
    fn episode_keeps_lessons_from_significant_points() {
        let ep = episode("Cirrhosis with ascites, paracentesis.", "Cirrhosis");
        assert!(ep.episode_id.starts_with("EP-"));
        assert_eq!(
            ep.lessons_learned,
            vec!["[High] Iatrogenic hemoperitoneum after blind paracentesis"]
        );
        assert_eq!(ep.critique_summary[0].category, "iatrogenic");
        assert!(ep.matches_diagnosis("alcoholic cirrhosis"));
        assert!(!ep.matches_diagnosis("  "));
    }

    #[tokio::test]
    async fn append_persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episodes.json");
        let store = FileEpisodicStore::open(&path, Arc::new(BagOfWords)).await.unwrap();

        store
            .append(episode("Cirrhosis ascites paracentesis bleeding hemoperitoneum", "Cirrhosis"))
            .await
            .unwrap();

        let reopened = FileEpisodicStore::open(&path, Arc::new(BagOfWords)).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn search_prefers_diagnosis_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEpisodicStore::open(dir.path().join("m.json"), Arc::new(BagOfWords))
            .await
            .unwrap();
        let text = "Cirrhosis ascites paracentesis bleeding hemoperitoneum shock";
        store.append(episode(text, "Pneumonia")).await.unwrap();
        store.append(episode(text, "Alcoholic cirrhosis")).await.unwrap();

        let hits = store
            .search(text, 1, 0.3, &["Cirrhosis".to_string()])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].episode.diagnosis, "Alcoholic cirrhosis");

        let fallback = store.search(text, 2, 0.3, &["Sepsis".to_string()]).await.unwrap();
        assert_eq!(fallback.len(), 2);

        let lessons = format_lessons(&fallback);
        assert_eq!(lessons.matches("Past experience").count(), 2);
        assert!(lessons.contains("[iatrogenic] Iatrogenic hemoperitoneum"));
    }

    #[tokio::test]
    async fn same_instant_episodes_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let store = FileEpisodicStore::open(&path, Arc::new(BagOfWords)).await.unwrap();
        let ep = episode("Cirrhosis ascites paracentesis", "Cirrhosis");

        for _ in 0..3 {
            store.append(ep.clone()).await.unwrap();
        }

        let ids: Vec<String> = store
            .episodes
            .read()
            .await
            .iter()
            .map(|s| s.episode.episode_id.clone())
            .collect();
        assert_eq!(
            ids,
            vec![
                ep.episode_id.clone(),
                format!("{}-2", ep.episode_id),
                format!("{}-3", ep.episode_id)
            ]
        );
    }

    #[tokio::test]
    async fn empty_store_returns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEpisodicStore::open(dir.path().join("m.json"), Arc::new(BagOfWords))
            .await
            .unwrap();
        assert!(store.search("anything", 2, 0.0, &[]).await.unwrap().is_empty());
        assert_eq!(format_lessons(&[]), "");
    }
}

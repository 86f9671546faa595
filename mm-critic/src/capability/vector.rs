use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use super::{CapabilityError, CapabilityResult, SimilaritySearch};
use crate::models::{Outcome, SimilarCase};

/// Turns text into a dense vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> CapabilityResult<Vec<f32>>;
}

/// Local ONNX sentence embeddings (all-MiniLM-L6-v2).
///
/// The model is loaded once and inference runs on the blocking pool so it
/// does not stall the async scheduler.
#[derive(Clone)]
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn try_new() -> anyhow::Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(true),
        )?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> CapabilityResult<Vec<f32>> {
        let input = text.to_owned();
        let model = Arc::clone(&self.model);

        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| CapabilityError::Transport("embedding model lock poisoned".to_string()))?;
            let embeddings = model
                .embed(vec![input], None)
                .map_err(|e| CapabilityError::Transport(format!("embedding failed: {e}")))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| CapabilityError::Malformed("embedding model returned no vector".to_string()))
        })
        .await
        .map_err(|e| CapabilityError::Transport(format!("embedding task aborted: {e}")))?
    }
}

/// [`SimilaritySearch`] over a pgvector table of historical cases.
///
/// Expects columns `id text, text text, outcome text, vector vector(384)`.
pub struct PgVectorCaseIndex {
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
    table: String,
}

impl PgVectorCaseIndex {
    pub async fn connect(
        database_url: &str,
        table: impl Into<String>,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool,
            embedder,
            table: table.into(),
        })
    }
}

#[async_trait]
impl SimilaritySearch for PgVectorCaseIndex {
    async fn search(&self, query: &str, k: usize) -> CapabilityResult<Vec<SimilarCase>> {
        let embedding = self.embedder.embed(query).await?;

        // Build a literal vector representation suitable for pgvector.
        let vector_literal = embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT id, text, COALESCE(outcome, ''), (vector <=> ARRAY[{vector_literal}]::vector)::float8 AS distance \
             FROM {table} \
             ORDER BY distance \
             LIMIT {k}",
            table = self.table,
        );

        let rows = sqlx::query_as::<_, (String, String, String, f64)>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CapabilityError::Transport(format!("similarity query failed: {e}")))?;

        info!(count = rows.len(), "Similarity search completed");

        Ok(rows
            .into_iter()
            .map(|(id, text, outcome, distance)| SimilarCase {
                id,
                text,
                similarity: cosine_distance_to_similarity(distance),
                outcome: Outcome::parse(&outcome),
                metadata: serde_json::json!({ "distance": distance }),
            })
            .collect())
    }
}

/// pgvector's `<=>` is cosine distance in [0, 2].
pub fn cosine_distance_to_similarity(distance: f64) -> f64 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Cosine similarity of two vectors; zero for empty or mismatched input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

//! Tool-card retrieval for the capability router: a small TF-IDF index over
//! the rendered cards, ranked by cosine similarity to a case query.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use super::types::ToolCard;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("static token pattern"));

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "an", "and", "any", "are", "as", "at", "be", "been", "before", "but", "by",
    "can", "do", "does", "each", "for", "from", "had", "has", "have", "if", "in", "into", "is", "it", "its",
    "may", "more", "no", "not", "of", "on", "only", "or", "other", "over", "per", "so", "such", "than",
    "that", "the", "their", "then", "there", "these", "this", "those", "to", "under", "up", "was", "were",
    "when", "which", "while", "with", "within", "without",
];

fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOKEN
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

type SparseVec = BTreeMap<usize, f64>;

pub struct ToolRagIndex {
    cards: Vec<ToolCard>,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    vectors: Vec<SparseVec>,
}

impl ToolRagIndex {
    pub fn build(cards: Vec<ToolCard>) -> Self {
        let docs: Vec<Vec<String>> = cards.iter().map(|c| tokenize(&c.to_text())).collect();

        let mut vocabulary: HashMap<String, usize> = HashMap::new();
        let mut df: Vec<usize> = Vec::new();
        for doc in &docs {
            let mut seen: Vec<usize> = Vec::new();
            for token in doc {
                let next = vocabulary.len();
                let idx = *vocabulary.entry(token.clone()).or_insert(next);
                if idx == df.len() {
                    df.push(0);
                }
                if !seen.contains(&idx) {
                    seen.push(idx);
                    df[idx] += 1;
                }
            }
        }

        // smooth idf: ln((1 + n) / (1 + df)) + 1
        let n = docs.len() as f64;
        let idf: Vec<f64> = df
            .iter()
            .map(|&d| ((1.0 + n) / (1.0 + d as f64)).ln() + 1.0)
            .collect();

        let mut index = Self {
            cards,
            vocabulary,
            idf,
            vectors: Vec::new(),
        };
        index.vectors = docs.iter().map(|doc| index.vectorize(doc)).collect();
        index
    }

    fn vectorize(&self, tokens: &[String]) -> SparseVec {
        let mut vec = SparseVec::new();
        for token in tokens {
            if let Some(&idx) = self.vocabulary.get(token) {
                *vec.entry(idx).or_insert(0.0) += 1.0;
            }
        }
        for (idx, weight) in vec.iter_mut() {
            *weight *= self.idf[*idx];
        }
        let norm = vec.values().map(|w| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            vec.values_mut().for_each(|w| *w /= norm);
        }
        vec
    }

    /// Cards ordered by similarity to `query`, best first. Ties keep
    /// catalog order.
    pub fn retrieve(&self, query: &str, top_n: usize) -> Vec<(ToolCard, f64)> {
        let q = self.vectorize(&tokenize(query));
        let mut scored: Vec<(usize, f64)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, doc)| {
                let score = q.iter().filter_map(|(idx, w)| doc.get(idx).map(|d| w * d)).sum();
                (i, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(top_n)
            .map(|(i, score)| (self.cards[i].clone(), score))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

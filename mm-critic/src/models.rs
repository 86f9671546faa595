use serde::{Deserialize, Serialize};
use std::fmt;

/// One clinical case submitted for review. Never mutated after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    #[serde(default)]
    pub demographics: Demographics,
    pub text: String,
    #[serde(default)]
    pub outcome: Outcome,
    #[serde(default)]
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub secondary_diagnoses: Vec<String>,
    /// Prior-extracted cause of death, when the chart states one
    #[serde(default)]
    pub cause_of_death: Option<String>,
    #[serde(default)]
    pub critical_events: Vec<String>,
    /// Similar historical cases supplied with the case, best first
    #[serde(default)]
    pub similar_cases: Vec<SimilarCase>,
}

impl Case {
    pub fn primary_diagnosis(&self) -> &str {
        self.diagnosis
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or("Unknown")
    }

    /// Short human-readable header used at the top of capability prompts.
    pub fn summary_line(&self) -> String {
        let d = &self.demographics;
        format!(
            "Case {} | age {} | sex {} | admission {} | outcome {} | diagnosis {}",
            self.id,
            d.age.map(|a| a.to_string()).unwrap_or_else(|| "?".to_string()),
            d.sex.as_deref().unwrap_or("?"),
            d.admission_type.as_deref().unwrap_or("?"),
            self.outcome,
            self.primary_diagnosis()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Demographics {
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub admission_type: Option<String>,
    pub admission_location: Option<String>,
}

/// Discharge outcome. Free-text labels such as `Expired` or `discharged home`
/// are folded into the three variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Outcome {
    Dead,
    Alive,
    #[default]
    Unknown,
}

impl Outcome {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_ascii_lowercase();
        if ["dead", "expir", "died", "death", "deceased"]
            .iter()
            .any(|kw| raw.contains(kw))
        {
            Outcome::Dead
        } else if ["alive", "surviv", "discharg"].iter().any(|kw| raw.contains(kw)) {
            Outcome::Alive
        } else {
            Outcome::Unknown
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Outcome::Unknown)
    }
}

impl From<String> for Outcome {
    fn from(raw: String) -> Self {
        Outcome::parse(&raw)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Outcome::Dead => "dead",
            Outcome::Alive => "alive",
            Outcome::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// A hit from the similarity index, or a similar case supplied with the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarCase {
    pub id: String,
    pub text: String,
    /// 1.0 means identical
    pub similarity: f64,
    #[serde(default)]
    pub outcome: Outcome,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// External literature reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteratureArticle {
    #[serde(alias = "pmid")]
    pub source_id: String,
    pub title: String,
    #[serde(default, alias = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub journal: Option<String>,
}

/// Clinical severity shared by analyst issues and critique points.
///
/// Decoding is lenient: `moderate` reads as medium and anything unknown as low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    Critical,
    High,
    Medium,
    #[default]
    Low,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            _ => Severity::Low,
        }
    }

    /// Sort rank where smaller is more severe; critical and high share a rank.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical | Severity::High => 0,
            Severity::Medium => 1,
            Severity::Low => 2,
        }
    }

    /// Strict ordering where critical precedes high.
    pub fn ordinal(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl From<String> for Severity {
    fn from(raw: String) -> Self {
        Severity::parse(&raw)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Severity-hierarchy classification shared by the diagnosis analyst and the
//! critique reranker. The pattern lists live here and nowhere else.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::Severity;

static IATROGENIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"iatrogenic",
        r"hemoperitoneum",
        r"organ.?injur",
        r"procedur.{0,20}complication",
        r"procedur.{0,20}bleed",
        r"puncture.{0,10}bleed",
        r"blind(?:ly)?\s+(?:paracentesis|thoracentesis|procedure)",
        r"without.{0,15}(?:ultrasound|guidance)",
        r"perforation",
    ])
});

static DEATH_ALIGNMENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"cause.{0,10}death",
        r"death.{0,10}cause",
        r"admission.{0,20}(?:differ|mismatch|vs).{0,20}(?:death|expir)",
        r"last.{0,5}24.{0,5}hour",
        r"terminal.{0,10}event",
        r"hct.{0,5}drop",
        r"hemodynamic.{0,10}instabilit",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("static classification pattern"))
        .collect()
}

/// Where a finding sits in the severity hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueClass {
    /// Harm caused by care itself, always ranked first
    Iatrogenic,
    /// Mismatch between the admission problem and what the patient died of
    DeathAlignment,
    General,
}

pub fn classify(text: &str) -> IssueClass {
    let text = text.to_lowercase();
    if IATROGENIC_PATTERNS.iter().any(|re| re.is_match(&text)) {
        IssueClass::Iatrogenic
    } else if DEATH_ALIGNMENT_PATTERNS.iter().any(|re| re.is_match(&text)) {
        IssueClass::DeathAlignment
    } else {
        IssueClass::General
    }
}

/// Sort key for a critique point: iatrogenic first (severity ignored),
/// death alignment next, everything else by stated severity.
pub fn critique_rank(text: &str, severity: Severity) -> (u8, u8) {
    match classify(text) {
        IssueClass::Iatrogenic => (0, 0),
        IssueClass::DeathAlignment => (1, severity.rank()),
        IssueClass::General => (2 + severity.rank(), severity.rank()),
    }
}

/// Category an analyst attaches to a clinical issue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum IssueCategory {
    IatrogenicTrauma,
    ProceduralSafety,
    DeathAlignment,
    MedicationError,
    DiagnosticFailure,
    #[default]
    Other,
}

impl IssueCategory {
    pub fn priority(self) -> u8 {
        match self {
            IssueCategory::IatrogenicTrauma => 0,
            IssueCategory::ProceduralSafety => 1,
            IssueCategory::DeathAlignment => 2,
            IssueCategory::MedicationError => 3,
            IssueCategory::DiagnosticFailure => 4,
            IssueCategory::Other => 5,
        }
    }
}

impl From<String> for IssueCategory {
    fn from(raw: String) -> Self {
        let raw = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match raw.as_str() {
            "iatrogenic_trauma" | "iatrogenic" => IssueCategory::IatrogenicTrauma,
            "procedural_safety" | "procedure" => IssueCategory::ProceduralSafety,
            "death_alignment" | "cause_of_death" => IssueCategory::DeathAlignment,
            "medication_error" | "medication" => IssueCategory::MedicationError,
            "diagnostic_failure" | "diagnostic_error" | "missed_diagnosis" => {
                IssueCategory::DiagnosticFailure
            }
            _ => IssueCategory::Other,
        }
    }
}

/// Ordering key for analyst issues. Text that reads as iatrogenic outranks
/// whatever category the analyst chose.
pub fn issue_rank(category: IssueCategory, text: &str, severity: Severity) -> (u8, u8) {
    let priority = match classify(text) {
        IssueClass::Iatrogenic => IssueCategory::IatrogenicTrauma.priority(),
        IssueClass::DeathAlignment => category.priority().min(IssueCategory::DeathAlignment.priority()),
        IssueClass::General => category.priority(),
    };
    (priority, severity.rank())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_iatrogenic_before_death_alignment() {
        assert_eq!(classify("Iatrogenic hemoperitoneum after tap"), IssueClass::Iatrogenic);
        assert_eq!(
            classify("Paracentesis performed blindly without ultrasound"),
            IssueClass::Iatrogenic
        );
        assert_eq!(
            classify("Cause of death differs from admission; HCT drop ignored"),
            IssueClass::DeathAlignment
        );
        assert_eq!(classify("Late antibiotics"), IssueClass::General);
    }

    #[test]
    fn critique_rank_orders_hierarchy() {
        let iatrogenic = critique_rank("procedure-related bleed", Severity::Low);
        let death = critique_rank("terminal event not addressed", Severity::Medium);
        let high = critique_rank("delayed antibiotics", Severity::High);
        let low = critique_rank("documentation gap", Severity::Low);

        assert!(iatrogenic < death);
        assert!(death < high);
        assert!(high < low);
    }

    #[test]
    fn category_decodes_loosely() {
        assert_eq!(IssueCategory::from("Iatrogenic Trauma".to_string()), IssueCategory::IatrogenicTrauma);
        assert_eq!(IssueCategory::from("medication-error".to_string()), IssueCategory::MedicationError);
        assert_eq!(IssueCategory::from("??".to_string()), IssueCategory::Other);
    }

    #[test]
    fn issue_rank_promotes_iatrogenic_text() {
        let promoted = issue_rank(IssueCategory::MedicationError, "organ injury after drain", Severity::Low);
        let plain = issue_rank(IssueCategory::ProceduralSafety, "consent missing", Severity::Critical);
        assert!(promoted < plain);
    }
}

//! Upstream diagnosis and treatment analyses. Both run concurrently after the
//! first evidence pass and feed the critique-targeted second pass.

pub mod diagnosis;
pub mod treatment;

use serde::{Deserialize, Serialize};

use crate::classify::IssueCategory;
use crate::models::Severity;

pub use diagnosis::DiagnosisAnalyst;
pub use treatment::TreatmentAnalyst;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalIssue {
    pub issue: String,
    #[serde(default, alias = "evidence_in_text")]
    pub evidence: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub category: IssueCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedDiagnosis {
    pub diagnosis: String,
    #[serde(default)]
    pub reasoning: String,
}

/// A procedure mentioned in the narrative and the safety language around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureFinding {
    pub procedure: String,
    pub has_safety: bool,
    pub danger_flag: Option<String>,
    pub context: String,
}

impl ProcedureFinding {
    pub fn status(&self) -> &'static str {
        if self.danger_flag.is_some() {
            "danger"
        } else if self.has_safety {
            "safe"
        } else {
            "not_documented"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeathAlignment {
    pub admission_reason: String,
    pub death_cause: String,
    pub critical_events: Vec<String>,
    pub mismatch: bool,
    pub iatrogenic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisAnalysis {
    pub evaluation: String,
    pub issues: Vec<ClinicalIssue>,
    pub missed_diagnoses: Vec<MissedDiagnosis>,
    pub procedural_findings: Vec<ProcedureFinding>,
    pub death_alignment: Option<DeathAlignment>,
    /// Why the rule-based result was used instead of the model's
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreatmentAnalysis {
    pub evaluation: String,
    pub medication_issues: Vec<String>,
    pub timing_issues: Vec<String>,
    pub disposition: String,
    pub recommendations: Vec<String>,
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSource {
    Diagnosis,
    MissedDiagnosis,
    Medication,
    Timing,
}

/// An issue found before the critic runs, used to target the second
/// evidence pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreliminaryIssue {
    pub issue: String,
    pub severity: Severity,
    pub source: IssueSource,
}

/// Gathers issues from both analyses, most severe first. Missed diagnoses
/// count as critical; medication and timing issues as medium.
pub fn collect_preliminary_issues(
    diagnosis: &DiagnosisAnalysis,
    treatment: &TreatmentAnalysis,
) -> Vec<PreliminaryIssue> {
    let mut issues: Vec<PreliminaryIssue> = diagnosis
        .issues
        .iter()
        .map(|i| PreliminaryIssue {
            issue: i.issue.clone(),
            severity: i.severity,
            source: IssueSource::Diagnosis,
        })
        .chain(diagnosis.missed_diagnoses.iter().map(|m| PreliminaryIssue {
            issue: format!("Missed diagnosis: {}", m.diagnosis),
            severity: Severity::Critical,
            source: IssueSource::MissedDiagnosis,
        }))
        .chain(treatment.medication_issues.iter().map(|m| PreliminaryIssue {
            issue: m.clone(),
            severity: Severity::Medium,
            source: IssueSource::Medication,
        }))
        .chain(treatment.timing_issues.iter().map(|t| PreliminaryIssue {
            issue: t.clone(),
            severity: Severity::Medium,
            source: IssueSource::Timing,
        }))
        .filter(|i| !i.issue.trim().is_empty())
        .collect();

    issues.sort_by_key(|i| i.severity.ordinal());
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preliminary_issues_put_critical_first() {
        let diagnosis = DiagnosisAnalysis {
            issues: vec![
                ClinicalIssue {
                    issue: "Anchoring on SBP".to_string(),
                    evidence: String::new(),
                    severity: Severity::Low,
                    category: IssueCategory::DiagnosticFailure,
                },
                ClinicalIssue {
                    issue: "   ".to_string(),
                    evidence: String::new(),
                    severity: Severity::High,
                    category: IssueCategory::Other,
                },
            ],
            missed_diagnoses: vec![MissedDiagnosis {
                diagnosis: "hemoperitoneum".to_string(),
                reasoning: String::new(),
            }],
            ..Default::default()
        };
        let treatment = TreatmentAnalysis {
            medication_issues: vec!["Lorazepam in encephalopathy".to_string()],
            timing_issues: vec!["Antibiotics after 6 hours".to_string()],
            ..Default::default()
        };

        let issues = collect_preliminary_issues(&diagnosis, &treatment);

        assert_eq!(issues.len(), 4);
        assert_eq!(issues[0].source, IssueSource::MissedDiagnosis);
        assert_eq!(issues[1].source, IssueSource::Medication);
        assert_eq!(issues[2].source, IssueSource::Timing);
        assert_eq!(issues[3].issue, "Anchoring on SBP");
    }

    #[test]
    fn no_findings_means_no_preliminary_issues() {
        assert!(
            collect_preliminary_issues(&DiagnosisAnalysis::default(), &TreatmentAnalysis::default())
                .is_empty()
        );
    }
}

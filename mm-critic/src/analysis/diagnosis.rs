//! Diagnosis review: rule-based procedural safety and cause-of-death checks,
//! then a model pass whose issues are reranked by the severity hierarchy.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use super::{ClinicalIssue, DeathAlignment, DiagnosisAnalysis, MissedDiagnosis, ProcedureFinding};
use crate::capability::{Capabilities, CompletionRequest, ask_json};
use crate::classify::{IssueCategory, IssueClass, classify, issue_rank};
use crate::evidence::EvidenceBundle;
use crate::models::{Case, Outcome, Severity};
use crate::preprocess::PreprocessResult;

const CONTEXT_RADIUS: usize = 200;
const MAX_CONTEXT_CHARS: usize = 300;
const MAX_EXCERPT_CHARS: usize = 3000;

const PROCEDURE_KEYWORDS: &[&str] = &[
    "paracentesis",
    "thoracentesis",
    "central line",
    "central venous",
    "chest tube",
    "thoracostomy",
    "lumbar puncture",
    "lp",
    "arterial line",
    "art line",
    "a-line",
    "intubation",
    "tracheostomy",
    "pericardiocentesis",
    "percutaneous drain",
    "pigtail catheter",
    "picc",
    "feeding tube",
    "ng tube placement",
    "dialysis catheter",
];

static PROCEDURES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    PROCEDURE_KEYWORDS
        .iter()
        .map(|kw| {
            let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(kw))).expect("static procedure pattern");
            (*kw, re)
        })
        .collect()
});

static SAFETY_MODIFIERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)ultrasound.?guided|\bus.?guided|ultra.?sound|fluoroscop|\bct.?guided|image.?guided|sterile|aseptic|full barrier",
    )
    .expect("static safety pattern")
});

static DANGER_MODIFIERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bblind(?:ly)?\b",
        r"(?i)without\s+(?:ultrasound|imaging|guidance)",
        r"(?i)landmark.?based",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static danger pattern"))
    .collect()
});

static STATED_CAUSE_OF_DEATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)cause of death\s*(?:was|:|-)?\s*([^.\n]{3,160})").expect("static cause pattern")
});

static LONG_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w{4,}").expect("static word pattern"));

const IATROGENIC_KEYWORDS: &[&str] = &[
    "iatrogenic",
    "procedur",
    "complication",
    "puncture",
    "hemoperitoneum",
    "hemorrhage from",
    "bleeding from",
    "perforation",
    "laceration",
    "organ injury",
];

/// First mention of each known procedure, with the safety language found in
/// the surrounding window.
pub fn procedural_safety(text: &str) -> Vec<ProcedureFinding> {
    PROCEDURES
        .iter()
        .filter_map(|(procedure, re)| {
            let found = re.find(text)?;
            let context = window(text, found.start(), found.end(), CONTEXT_RADIUS);
            let danger_flag = DANGER_MODIFIERS
                .iter()
                .find_map(|d| d.find(context))
                .map(|m| m.as_str().to_lowercase());
            Some(ProcedureFinding {
                procedure: procedure.to_string(),
                has_safety: SAFETY_MODIFIERS.is_match(context),
                danger_flag,
                context: context.trim().chars().take(MAX_CONTEXT_CHARS).collect(),
            })
        })
        .collect()
}

/// Compares the admission problem with the cause of death. `None` for
/// survivors and when the chart states neither a cause nor terminal events.
pub fn death_alignment(case: &Case) -> Option<DeathAlignment> {
    if case.outcome != Outcome::Dead {
        return None;
    }

    let death_cause = case
        .cause_of_death
        .clone()
        .filter(|c| !c.trim().is_empty())
        .or_else(|| {
            STATED_CAUSE_OF_DEATH
                .captures(&case.text)
                .map(|caps| caps[1].trim().to_string())
        })
        .unwrap_or_default();
    let critical_events = case.critical_events.clone();
    if death_cause.is_empty() && critical_events.is_empty() {
        return None;
    }

    let admission_reason = case.diagnosis.clone().unwrap_or_default();
    let admission_lower = admission_reason.to_lowercase();
    let death_lower = death_cause.to_lowercase();

    let mismatch = if !admission_lower.is_empty() && !death_lower.is_empty() {
        let admission_words: Vec<&str> = LONG_WORD.find_iter(&admission_lower).map(|m| m.as_str()).collect();
        !LONG_WORD
            .find_iter(&death_lower)
            .any(|m| admission_words.contains(&m.as_str()))
    } else {
        !death_lower.is_empty()
    };

    let iatrogenic = IATROGENIC_KEYWORDS.iter().any(|kw| {
        death_lower.contains(kw) || critical_events.iter().any(|e| e.to_lowercase().contains(kw))
    });

    Some(DeathAlignment {
        admission_reason,
        death_cause,
        critical_events,
        mismatch,
        iatrogenic,
    })
}

/// Orders issues by the severity hierarchy. Issues whose text reads as
/// iatrogenic are promoted to critical.
pub fn rerank_issues(issues: &mut [ClinicalIssue]) {
    for issue in issues.iter_mut() {
        if classify(&format!("{} {}", issue.issue, issue.evidence)) == IssueClass::Iatrogenic {
            issue.severity = Severity::Critical;
        }
    }
    issues.sort_by_key(|i| issue_rank(i.category, &format!("{} {}", i.issue, i.evidence), i.severity));
}

/// Issues the rules alone can assert, cause-of-death findings first.
fn rule_issues(findings: &[ProcedureFinding], alignment: Option<&DeathAlignment>) -> Vec<ClinicalIssue> {
    let mut issues = Vec::new();
    if let Some(a) = alignment {
        if a.iatrogenic {
            issues.push(ClinicalIssue {
                issue: format!("Iatrogenic complication suspected as cause of death: {}", a.death_cause),
                evidence: a.critical_events.join("; "),
                severity: Severity::Critical,
                category: IssueCategory::IatrogenicTrauma,
            });
        } else if a.mismatch {
            issues.push(ClinicalIssue {
                issue: format!(
                    "Cause of death ({}) differs from admission reason ({}); terminal events need review",
                    a.death_cause, a.admission_reason
                ),
                evidence: a.critical_events.join("; "),
                severity: Severity::High,
                category: IssueCategory::DeathAlignment,
            });
        }
    }

    issues.extend(findings.iter().filter_map(|f| {
        let flag = f.danger_flag.as_ref()?;
        Some(ClinicalIssue {
            issue: format!("{} performed '{flag}' without documented image guidance", f.procedure),
            evidence: f.context.clone(),
            severity: Severity::Critical,
            category: IssueCategory::ProceduralSafety,
        })
    }));
    issues
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DiagnosisReply {
    #[serde(alias = "diagnosis_evaluation")]
    evaluation: String,
    issues: Vec<ClinicalIssue>,
    missed_diagnoses: Vec<MissedDiagnosis>,
}

pub struct DiagnosisAnalyst<'a> {
    caps: &'a Capabilities,
}

impl<'a> DiagnosisAnalyst<'a> {
    pub fn new(caps: &'a Capabilities) -> Self {
        Self { caps }
    }

    pub async fn analyze(
        &self,
        case: &Case,
        preprocessing: &PreprocessResult,
        evidence: &EvidenceBundle,
        lessons: &str,
    ) -> DiagnosisAnalysis {
        let findings = procedural_safety(&case.text);
        let alignment = death_alignment(case);
        let rules = rule_issues(&findings, alignment.as_ref());

        info!(
            case_id = %case.id,
            procedures = findings.len(),
            dangers = findings.iter().filter(|f| f.danger_flag.is_some()).count(),
            mismatch = alignment.as_ref().is_some_and(|a| a.mismatch),
            iatrogenic = alignment.as_ref().is_some_and(|a| a.iatrogenic),
            "Rule-based diagnosis checks completed"
        );

        let (evaluation, mut issues, missed_diagnoses, degraded) = match self.caps.llm() {
            None => (
                "rule-based review only".to_string(),
                rules,
                Vec::new(),
                Some("no language model configured".to_string()),
            ),
            Some(llm) => {
                let prompt = build_prompt(case, preprocessing, evidence, lessons, &findings, alignment.as_ref());
                let request = CompletionRequest::new(prompt)
                    .system("You are an ICU diagnostician. Cite only what the case text actually shows.")
                    .temperature(0.2)
                    .max_tokens(1500);
                match ask_json::<DiagnosisReply>(llm, request).await {
                    Ok(reply) => {
                        let mut issues = reply.issues;
                        issues.retain(|i| !i.issue.trim().is_empty());
                        for rule in rules {
                            let procedure = rule.issue.split_whitespace().next().unwrap_or_default().to_lowercase();
                            if !issues.iter().any(|i| i.issue.to_lowercase().contains(&procedure)) {
                                issues.push(rule);
                            }
                        }
                        let evaluation = if reply.evaluation.trim().is_empty() {
                            "insufficient evidence".to_string()
                        } else {
                            reply.evaluation
                        };
                        (evaluation, issues, reply.missed_diagnoses, None)
                    }
                    Err(e) => {
                        warn!(case_id = %case.id, error = %e, "Diagnosis analysis failed, using rule-based findings");
                        (
                            "rule-based review only".to_string(),
                            rules,
                            Vec::new(),
                            Some(format!("diagnosis model unavailable: {e}")),
                        )
                    }
                }
            }
        };

        rerank_issues(&mut issues);

        DiagnosisAnalysis {
            evaluation,
            issues,
            missed_diagnoses,
            procedural_findings: findings,
            death_alignment: alignment,
            degraded,
        }
    }
}

fn build_prompt(
    case: &Case,
    preprocessing: &PreprocessResult,
    evidence: &EvidenceBundle,
    lessons: &str,
    findings: &[ProcedureFinding],
    alignment: Option<&DeathAlignment>,
) -> String {
    let safety = if findings.is_empty() {
        "no procedure keywords detected".to_string()
    } else {
        findings
            .iter()
            .map(|f| {
                let mut line = format!("- {}: [{}]", f.procedure, f.status());
                if let Some(flag) = &f.danger_flag {
                    line.push_str(&format!(" '{flag}' detected, critical red flag"));
                } else if !f.has_safety {
                    line.push_str(" (ultrasound/sterile technique not documented)");
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let alignment = match alignment {
        None => "not applicable (survivor or cause of death not recorded)".to_string(),
        Some(a) => format!(
            "admission reason: {}\ncause of death: {}\nmismatch: {}\niatrogenic: {}\ncritical events: {}",
            a.admission_reason,
            if a.death_cause.is_empty() { "not stated" } else { a.death_cause.as_str() },
            if a.mismatch { "YES, weight the last 24 hours" } else { "no" },
            if a.iatrogenic { "YES, analyse first" } else { "no" },
            a.critical_events.iter().take(5).cloned().collect::<Vec<_>>().join("; ")
        ),
    };

    let gaps = preprocessing.record_gaps.notes();
    format!(
        "{}\nRecord gaps: {}\n\nProcedural safety pre-check:\n{safety}\n\nCause of death alignment:\n{alignment}\n\n\
         Lessons from past reviews:\n{}\n\nEvidence:\n{}\n\nCase text:\n{}\n\n\
         Evaluate the diagnostic process. Rank iatrogenic harm above procedural safety, death alignment, \
         medication errors and diagnostic failures. Return JSON only:\n\
         {{\"evaluation\": \"appropriate|inappropriate|partially appropriate|insufficient evidence\", \
         \"issues\": [{{\"issue\": str, \"evidence\": \"quote from the case\", \
         \"severity\": \"critical|high|medium|low\", \"category\": \"iatrogenic_trauma|procedural_safety|\
         death_alignment|medication_error|diagnostic_failure|other\"}}], \
         \"missed_diagnoses\": [{{\"diagnosis\": str, \"reasoning\": str}}]}}",
        case.summary_line(),
        if gaps.is_empty() { "none".to_string() } else { gaps.join("; ") },
        if lessons.trim().is_empty() { "none" } else { lessons },
        evidence.digest(3),
        case.text.chars().take(MAX_EXCERPT_CHARS).collect::<String>()
    )
}

/// `radius` bytes either side of `[start, end)`, widened to char boundaries.
fn window(text: &str, start: usize, end: usize, radius: usize) -> &str {
    let mut from = start.saturating_sub(radius);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + radius).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }
    &text[from..to]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::preprocess;
    use crate::test_support::{ScriptedLlm, UnreachableLlm, case_with};
    use std::sync::Arc;

    const BLIND_TAP: &str = "Cirrhosis with tense ascites. Paracentesis performed blindly at bedside. \
        Later HCT drop from 30 to 21 and hemoperitoneum on CT. Patient expired.";

    #[test]
    fn flags_blind_procedure_and_documented_guidance() {
        let findings = procedural_safety(BLIND_TAP);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].procedure, "paracentesis");
        assert_eq!(findings[0].danger_flag.as_deref(), Some("blindly"));
        assert_eq!(findings[0].status(), "danger");

        let safe = procedural_safety("Ultrasound-guided thoracentesis under sterile technique.");
        assert_eq!(safe[0].status(), "safe");

        let undocumented = procedural_safety("Central line placed in the right IJ.");
        assert_eq!(undocumented[0].status(), "not_documented");
    }

    #[test]
    fn short_procedure_keywords_need_word_boundaries() {
        assert!(procedural_safety("Patient needed help walking.").is_empty());
        assert_eq!(procedural_safety("LP done, opening pressure 20.")[0].procedure, "lp");
    }

    #[test]
    fn death_alignment_detects_mismatch_and_iatrogenic_cause() {
        let mut case = case_with(BLIND_TAP, vec![]);
        case.diagnosis = Some("Spontaneous bacterial peritonitis".to_string());
        case.cause_of_death = Some("Hemoperitoneum after paracentesis".to_string());

        let alignment = death_alignment(&case).unwrap();
        assert!(alignment.mismatch);
        assert!(alignment.iatrogenic);

        case.cause_of_death = Some("Refractory bacterial peritonitis".to_string());
        let aligned = death_alignment(&case).unwrap();
        assert!(!aligned.mismatch);
        assert!(!aligned.iatrogenic);

        case.outcome = Outcome::Alive;
        assert!(death_alignment(&case).is_none());
    }

    #[test]
    fn cause_of_death_can_come_from_the_narrative() {
        let case = case_with("Admitted for GI bleed. Cause of death: septic shock.", vec![]);
        let alignment = death_alignment(&case).unwrap();
        assert_eq!(alignment.death_cause, "septic shock");
        assert!(alignment.mismatch);
    }

    #[test]
    fn rerank_puts_iatrogenic_text_first_and_promotes_it() {
        let mut issues = vec![
            ClinicalIssue {
                issue: "Lorazepam given despite encephalopathy".to_string(),
                evidence: String::new(),
                severity: Severity::High,
                category: IssueCategory::MedicationError,
            },
            ClinicalIssue {
                issue: "Hemoperitoneum not recognised".to_string(),
                evidence: String::new(),
                severity: Severity::Low,
                category: IssueCategory::DiagnosticFailure,
            },
        ];
        rerank_issues(&mut issues);
        assert!(issues[0].issue.starts_with("Hemoperitoneum"));
        assert_eq!(issues[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn model_issues_are_reranked_and_rule_flags_added() {
        let llm = ScriptedLlm::new().reply_to(
            "Evaluate the diagnostic process",
            r#"{"diagnosis_evaluation": "inappropriate",
                "issues": [
                  {"issue": "Late antibiotics", "evidence_in_text": "abx day 2", "severity": "moderate", "category": "diagnostic_failure"},
                  {"issue": "", "severity": "high"}
                ],
                "missed_diagnoses": [{"diagnosis": "Hemoperitoneum", "reasoning": "HCT drop"}]}"#,
        );
        let caps = Capabilities::none().with_llm(Arc::new(llm));
        let case = case_with(BLIND_TAP, vec![]);

        let analysis = DiagnosisAnalyst::new(&caps)
            .analyze(&case, &preprocess(&case.text), &EvidenceBundle::default(), "")
            .await;

        assert_eq!(analysis.evaluation, "inappropriate");
        assert!(analysis.degraded.is_none());
        assert_eq!(analysis.issues.len(), 2);
        assert_eq!(analysis.issues[0].category, IssueCategory::ProceduralSafety);
        assert_eq!(analysis.issues[1].severity, Severity::Medium);
        assert_eq!(analysis.missed_diagnoses.len(), 1);
    }

    #[tokio::test]
    async fn capability_failure_degrades_to_rules() {
        let caps = Capabilities::none().with_llm(Arc::new(UnreachableLlm));
        let mut case = case_with(BLIND_TAP, vec![]);
        case.cause_of_death = Some("hemoperitoneum".to_string());

        let analysis = DiagnosisAnalyst::new(&caps)
            .analyze(&case, &preprocess(&case.text), &EvidenceBundle::default(), "")
            .await;

        assert!(analysis.degraded.is_some());
        assert!(analysis.missed_diagnoses.is_empty());
        assert_eq!(analysis.issues.len(), 2);
        assert_eq!(analysis.issues[0].category, IssueCategory::IatrogenicTrauma);
        assert!(analysis.issues.iter().all(|i| i.severity == Severity::Critical));
    }
}

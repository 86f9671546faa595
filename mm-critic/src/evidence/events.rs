//! Keyword extraction of the events that matter for a case review: how the
//! stay ended, which procedures happened, what went wrong, and known
//! trigger → harm sequences.

use serde::{Deserialize, Serialize};

const DEATH_TERMS: &[&str] = &[
    "expired",
    "died",
    "death",
    "deceased",
    "passed away",
    "comfort measures",
    "withdrawal of care",
    "cmo",
];

const SURVIVAL_TERMS: &[&str] = &["discharged home", "discharge to", "discharged to", "discharge"];

const PROCEDURE_TERMS: &[&str] = &[
    "paracentesis",
    "thoracentesis",
    "intubation",
    "intubated",
    "extubated",
    "egd",
    "endoscopy",
    "colonoscopy",
    "ercp",
    "tips",
    "bronchoscopy",
    "catheterization",
    "pci",
    "cabg",
    "surgery",
    "transfusion",
    "prbc",
    "ffp",
    "dialysis",
    "crrt",
    "central line",
    "a-line",
    "biopsy",
    "lumbar puncture",
];

const COMPLICATION_TERMS: &[&str] = &[
    "hemorrhage",
    "bleeding",
    "hemoperitoneum",
    "hematemesis",
    "melena",
    "hypotension",
    "shock",
    "cardiac arrest",
    "code blue",
    "respiratory failure",
    "hypoxia",
    "ards",
    "aki",
    "acute kidney injury",
    "hepatorenal",
    "encephalopathy",
    "altered mental status",
    "sepsis",
    "bacteremia",
    "iatrogenic",
    "hct drop",
    "hgb drop",
    "coagulopathy",
    "dic",
    "aspiration",
    "pulmonary embolism",
    "stroke",
    "arrhythmia",
];

/// (triggers, outcomes, label): the sequence is present when the narrative
/// mentions any trigger and any outcome.
const CRITICAL_SEQUENCES: &[(&[&str], &[&str], &str)] = &[
    (&["paracentesis"], &["bleeding", "hemorrhage", "hemoperitoneum"], "paracentesis → bleeding"),
    (&["thoracentesis"], &["bleeding", "pneumothorax"], "thoracentesis → complication"),
    (&["central line", "catheter"], &["infection", "sepsis", "bacteremia"], "line → infection"),
    (&["surgery", "operation"], &["bleeding", "hemorrhage"], "surgery → bleeding"),
    (&["intubation"], &["aspiration", "pneumonia"], "intubation → aspiration"),
    (
        &["lorazepam", "benzodiazepine", "ativan", "midazolam"],
        &["encephalopathy", "confusion", "ams"],
        "sedative → HE worsening",
    ),
    (&["nsaid", "ketorolac", "ibuprofen"], &["renal failure", "aki", "creatinine"], "NSAID → AKI"),
    (
        &["anticoagula", "heparin", "warfarin"],
        &["bleeding", "hemorrhage"],
        "anticoagulation → bleeding",
    ),
    (&["transfusion", "prbc"], &["expired", "died", "death"], "transfusion → death"),
    (&["pressors", "vasopressor", "norepinephrine"], &["expired", "died", "death"], "vasopressors → death"),
    (&["cirrhosis"], &["hepatorenal", "hrs"], "cirrhosis → HRS"),
    (&["cirrhosis"], &["encephalopathy"], "cirrhosis → HE"),
    (&["sepsis"], &["shock", "hypotension"], "sepsis → shock"),
];

/// Labels of sequences describing medication harm.
pub const MEDICATION_SEQUENCES: &[&str] = &[
    "sedative → HE worsening",
    "NSAID → AKI",
    "anticoagulation → bleeding",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeOutcome {
    Death,
    Survived,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyEvents {
    pub outcome: Option<NarrativeOutcome>,
    pub procedures: Vec<String>,
    pub complications: Vec<String>,
    pub critical_sequences: Vec<String>,
}

impl KeyEvents {
    pub fn describe(&self) -> String {
        let outcome = match self.outcome {
            Some(NarrativeOutcome::Death) => "death",
            Some(NarrativeOutcome::Survived) => "survived",
            None => "unknown",
        };
        format!(
            "outcome={outcome}; procedures=[{}]; complications=[{}]; critical_sequences=[{}]",
            self.procedures.join(", "),
            self.complications.join(", "),
            self.critical_sequences.join(", ")
        )
    }

    /// Number of complications and sequences both narratives share.
    pub fn overlap(&self, other: &KeyEvents) -> usize {
        let shared = |a: &[String], b: &[String]| a.iter().filter(|x| b.contains(x)).count();
        shared(&self.complications, &other.complications)
            + shared(&self.critical_sequences, &other.critical_sequences)
    }
}

/// Whole-word containment for short terms, plain substring for phrases and
/// stems, so that `pe` does not match `pressure` while `anticoagula` still
/// matches `anticoagulation`.
pub(crate) fn mentions(text_lower: &str, term: &str) -> bool {
    if term.len() > 4 {
        return text_lower.contains(term);
    }
    text_lower.match_indices(term).any(|(i, _)| {
        let before = text_lower[..i].chars().next_back();
        let after = text_lower[i + term.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn mentioned(text_lower: &str, terms: &[&str]) -> Vec<String> {
    terms
        .iter()
        .filter(|t| mentions(text_lower, t))
        .map(|t| t.to_string())
        .collect()
}

pub fn extract_key_events(text: &str) -> KeyEvents {
    if text.trim().is_empty() {
        return KeyEvents::default();
    }
    let lower = text.to_lowercase();

    let outcome = if DEATH_TERMS.iter().any(|t| mentions(&lower, t)) {
        Some(NarrativeOutcome::Death)
    } else if SURVIVAL_TERMS.iter().any(|t| mentions(&lower, t)) {
        Some(NarrativeOutcome::Survived)
    } else {
        None
    };

    let critical_sequences = CRITICAL_SEQUENCES
        .iter()
        .filter(|(triggers, outcomes, _)| {
            triggers.iter().any(|t| mentions(&lower, t)) && outcomes.iter().any(|o| mentions(&lower, o))
        })
        .map(|(_, _, label)| label.to_string())
        .collect();

    KeyEvents {
        outcome,
        procedures: mentioned(&lower, PROCEDURE_TERMS),
        complications: mentioned(&lower, COMPLICATION_TERMS),
        critical_sequences,
    }
}

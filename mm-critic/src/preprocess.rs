//! Sentence-level preprocessing of the clinical narrative: timeline events,
//! citable evidence spans and documentation gaps. Offsets are byte offsets
//! into the original text.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const MAX_TIMELINE_EVENTS: usize = 120;
pub const MAX_EVIDENCE_SPANS: usize = 60;
pub const MIN_SPAN_CHARS: usize = 20;
pub const SHORT_TEXT_CHARS: usize = 600;
const MAX_EVENT_TEXT_CHARS: usize = 4000;
const MAX_QUOTE_CHARS: usize = 600;

/// Sentinel citation for claims the record cannot support.
pub const RECORD_UNCERTAINTY: &str = "record_uncertainty";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentence<'a> {
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

/// Splits on newlines, then after `.`, `?` or `!` followed by whitespace.
/// Every returned sentence satisfies `&text[s.start..s.end] == s.text`.
pub fn sentences(text: &str) -> Vec<Sentence<'_>> {
    let mut out = Vec::new();
    let mut line_start = 0;
    for line in text.split('\n') {
        split_line(line, line_start, &mut out);
        line_start += line.len() + 1;
    }
    out
}

fn split_line<'a>(line: &'a str, offset: usize, out: &mut Vec<Sentence<'a>>) {
    let mut segment_start = 0;
    let mut chars = line.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '?' | '!')
            && chars.peek().is_some_and(|(_, next)| next.is_whitespace())
        {
            let end = i + c.len_utf8();
            push_trimmed(line, offset, segment_start, end, out);
            segment_start = end;
        }
    }
    push_trimmed(line, offset, segment_start, line.len(), out);
}

fn push_trimmed<'a>(line: &'a str, offset: usize, from: usize, to: usize, out: &mut Vec<Sentence<'a>>) {
    let raw = &line[from..to];
    let text = raw.trim();
    if text.is_empty() {
        return;
    }
    let start = offset + from + (raw.len() - raw.trim_start().len());
    out.push(Sentence {
        text,
        start,
        end: start + text.len(),
    });
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Timeline

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Respiratory,
    Hemodynamic,
    Imaging,
    Lab,
    Medication,
    Procedure,
    LevelOfCare,
    Deterioration,
    Other,
}

impl EventKind {
    /// Kinds that count as the care team acting on a deterioration.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            EventKind::Respiratory
                | EventKind::Hemodynamic
                | EventKind::LevelOfCare
                | EventKind::Procedure
                | EventKind::Medication
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub time_hint: Option<String>,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

static TIME_HINTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b\d{1,2}:\d{2}\b",
        r"(?i)\b(?:hospital day|day|hd)\s*#?\s*\d+\b",
        r"\b\d{4}-\d{2}-\d{2}\b",
        r"\b\d{1,2}/\d{1,2}/\d{2,4}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static time hint pattern"))
    .collect()
});

/// Keyword families in priority order; the first family that matches wins.
static EVENT_KINDS: LazyLock<Vec<(EventKind, Regex)>> = LazyLock::new(|| {
    [
        (
            EventKind::Deterioration,
            r"worsen|deterior|declin|code blue|rapid response|arrest|unresponsive",
        ),
        (
            EventKind::Respiratory,
            r"intubat|extubat|ventilat|bipap|cpap|respiratory|desat|hypox|o2\b|oxygen",
        ),
        (
            EventKind::Hemodynamic,
            r"hypotens|shock|pressor|norepinephrine|vasopressin|\bmap\b|\bbp\b|tachycard",
        ),
        (
            EventKind::LevelOfCare,
            r"\bicu\b|\bmicu\b|transfer|admit|discharg|step.?down|floor",
        ),
        (
            EventKind::Procedure,
            r"paracentesis|thoracentesis|central line|a-line|lumbar puncture|biopsy|surgery|\begd\b|endoscop|drain|catheter",
        ),
        (
            EventKind::Imaging,
            r"\bct\b|x-ray|\bcxr\b|\bmri\b|ultrasound|echo|imaging",
        ),
        (
            EventKind::Medication,
            r"antibiot|abx|heparin|warfarin|insulin|steroid|lorazepam|given|administered|started|dose|\bmg\b",
        ),
        (
            EventKind::Lab,
            r"\bwbc\b|\bhgb\b|\bhct\b|\bplt\b|creatinine|\bcr\b|lactate|troponin|\binr\b|\bbun\b|culture",
        ),
    ]
    .into_iter()
    .map(|(kind, p)| (kind, Regex::new(&format!("(?i){p}")).expect("static event pattern")))
    .collect()
});

fn event_kind(sentence: &str) -> EventKind {
    EVENT_KINDS
        .iter()
        .find(|(_, re)| re.is_match(sentence))
        .map(|(kind, _)| *kind)
        .unwrap_or(EventKind::Other)
}

fn time_hint(sentence: &str) -> Option<String> {
    TIME_HINTS
        .iter()
        .find_map(|re| re.find(sentence))
        .map(|m| m.as_str().to_string())
}

pub fn build_timeline(text: &str) -> Vec<TimelineEvent> {
    sentences(text)
        .into_iter()
        .take(MAX_TIMELINE_EVENTS)
        .enumerate()
        .map(|(i, s)| TimelineEvent {
            id: format!("T{}", i + 1),
            kind: event_kind(s.text),
            time_hint: time_hint(s.text),
            text: truncate_chars(s.text, MAX_EVENT_TEXT_CHARS),
            start: s.start,
            end: s.end,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Evidence spans

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanCategory {
    VitalSigns,
    Labs,
    Imaging,
    Assessment,
    Therapy,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub id: String,
    pub category: SpanCategory,
    pub quote: String,
    pub start: usize,
    pub end: usize,
}

/// The citable spans of one case, in narrative order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanMap {
    spans: Vec<EvidenceSpan>,
}

impl SpanMap {
    pub fn new(spans: Vec<EvidenceSpan>) -> Self {
        Self { spans }
    }

    pub fn get(&self, id: &str) -> Option<&EvidenceSpan> {
        self.spans.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// True when `id` may be cited: a known span or the uncertainty sentinel.
    pub fn resolves(&self, id: &str) -> bool {
        id == RECORD_UNCERTAINTY || self.contains(id)
    }

    /// `id` if it resolves, otherwise the uncertainty sentinel.
    pub fn resolve_or_uncertain(&self, id: Option<&str>) -> String {
        match id.map(str::trim) {
            Some(id) if self.resolves(id) => id.to_string(),
            _ => RECORD_UNCERTAINTY.to_string(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvidenceSpan> {
        self.spans.iter()
    }

    pub fn by_category(&self, category: SpanCategory) -> impl Iterator<Item = &EvidenceSpan> {
        self.spans.iter().filter(move |s| s.category == category)
    }

    /// First span whose lowercased quote contains `keyword`.
    pub fn first_mentioning(&self, keyword: &str) -> Option<&EvidenceSpan> {
        self.spans
            .iter()
            .find(|s| s.quote.to_lowercase().contains(keyword))
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

const CLAIM_KEYWORDS: &[&str] = &[
    "diagnosis",
    "impression",
    "assessment",
    "plan",
    "started",
    "given",
    "administered",
    "intub",
    "icu",
    "transfer",
    "worsen",
    "deterior",
];

static SPAN_CATEGORIES: LazyLock<Vec<(SpanCategory, Regex)>> = LazyLock::new(|| {
    [
        (SpanCategory::VitalSigns, r"\b(?:bp|hr|rr|spo2|sat|temp)\b"),
        (
            SpanCategory::Labs,
            r"\b(?:wbc|hgb|plt|cr|creatin\w*|bun|lactate|na|k|ast|alt|bilir\w*|abg)\b",
        ),
        (
            SpanCategory::Imaging,
            r"\b(?:ct|x-ray|cxr|mri|ultrasound|echo\w*)\b",
        ),
        (
            SpanCategory::Assessment,
            r"\b(?:diagnosis|impression|assessment|a/p|problem|plan)\b",
        ),
        (
            SpanCategory::Therapy,
            r"antibi|heparin|warfarin|insulin|steroid|vasopress|fluid",
        ),
    ]
    .into_iter()
    .map(|(c, p)| (c, Regex::new(&format!("(?i){p}")).expect("static span pattern")))
    .collect()
});

fn is_claimable(sentence: &str) -> bool {
    if sentence.chars().count() < MIN_SPAN_CHARS {
        return false;
    }
    if sentence.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }
    let lower = sentence.to_lowercase();
    CLAIM_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn span_category(sentence: &str) -> SpanCategory {
    SPAN_CATEGORIES
        .iter()
        .find(|(_, re)| re.is_match(sentence))
        .map(|(c, _)| *c)
        .unwrap_or(SpanCategory::Other)
}

pub fn extract_spans(text: &str) -> SpanMap {
    let spans = sentences(text)
        .into_iter()
        .filter(|s| is_claimable(s.text))
        .take(MAX_EVIDENCE_SPANS)
        .enumerate()
        .map(|(i, s)| EvidenceSpan {
            id: format!("E{}", i + 1),
            category: span_category(s.text),
            quote: truncate_chars(s.text, MAX_QUOTE_CHARS),
            start: s.start,
            end: s.end,
        })
        .collect();
    SpanMap::new(spans)
}

// ---------------------------------------------------------------------------
// Record gaps

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VitalSign {
    Bp,
    Hr,
    Rr,
    Spo2,
    Temp,
}

static VITAL_PATTERNS: LazyLock<Vec<(VitalSign, Regex)>> = LazyLock::new(|| {
    [
        (VitalSign::Bp, r"\bbp\b|blood pressure|mmhg|hypotens"),
        (VitalSign::Hr, r"\bhr\b|heart rate|tachy|brady"),
        (VitalSign::Rr, r"\brr\b|resp(?:iratory)? rate"),
        (VitalSign::Spo2, r"spo2|o2 sat|sat\s*%|\bsats?\b"),
        (VitalSign::Temp, r"\btemp|temperature|febrile"),
    ]
    .into_iter()
    .map(|(v, p)| (v, Regex::new(&format!("(?i){p}")).expect("static vital pattern")))
    .collect()
});

const UNCERTAINTY_MARKERS: &[&str] = &[
    "not documented",
    "unknown",
    "unable to",
    "limited history",
    "poor historian",
    "unclear",
    "cannot confirm",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordGaps {
    pub missing_vitals: Vec<VitalSign>,
    pub short_text: bool,
    pub uncertainty_markers: Vec<String>,
}

impl RecordGaps {
    pub fn has_gaps(&self) -> bool {
        !self.missing_vitals.is_empty() || self.short_text || !self.uncertainty_markers.is_empty()
    }

    /// Flat textual form, e.g. `vitals_missing: bp, hr`.
    pub fn notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if !self.missing_vitals.is_empty() {
            let names: Vec<String> = self
                .missing_vitals
                .iter()
                .map(|v| format!("{v:?}").to_lowercase())
                .collect();
            notes.push(format!("vitals_missing: {}", names.join(", ")));
        }
        if self.short_text {
            notes.push("clinical_text_short".to_string());
        }
        notes.extend(
            self.uncertainty_markers
                .iter()
                .map(|m| format!("uncertainty: {m}")),
        );
        notes
    }
}

pub fn record_gaps(text: &str) -> RecordGaps {
    let lower = text.to_lowercase();
    RecordGaps {
        missing_vitals: VITAL_PATTERNS
            .iter()
            .filter(|(_, re)| !re.is_match(text))
            .map(|(v, _)| *v)
            .collect(),
        short_text: text.trim().chars().count() < SHORT_TEXT_CHARS,
        uncertainty_markers: UNCERTAINTY_MARKERS
            .iter()
            .filter(|m| lower.contains(*m))
            .map(|m| m.to_string())
            .collect(),
    }
}

/// Everything the preprocessor derives from one narrative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessResult {
    pub timeline: Vec<TimelineEvent>,
    pub spans: SpanMap,
    pub record_gaps: RecordGaps,
}

pub fn preprocess(text: &str) -> PreprocessResult {
    PreprocessResult {
        timeline: build_timeline(text),
        spans: extract_spans(text),
        record_gaps: record_gaps(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: &str = "Pt admitted to MICU on 2024-03-01 with cirrhosis.\n\
        BP 82/40, HR 118. Lactate 4.2 at 14:30.\n\
        Assessment: septic shock from SBP. Started ceftriaxone and norepinephrine.\n\
        Day 2 patient worsened. Intubated for hypoxic respiratory failure.\n\
        ok.";

    #[test]
    fn sentence_offsets_point_back_into_source() {
        let text = "  First line here. Second!\r\nThird?  \n\nlast";
        let found = sentences(text);
        let texts: Vec<&str> = found.iter().map(|s| s.text).collect();
        assert_eq!(texts, vec!["First line here.", "Second!", "Third?", "last"]);
        for s in &found {
            assert_eq!(&text[s.start..s.end], s.text);
        }
    }

    #[test]
    fn sentence_split_handles_multibyte_text() {
        let text = "Température élevée. Patient stable.";
        for s in sentences(text) {
            assert_eq!(&text[s.start..s.end], s.text);
        }
    }

    #[test]
    fn timeline_tags_kinds_and_time_hints() {
        let timeline = build_timeline(NOTE);

        assert_eq!(timeline[0].id, "T1");
        assert_eq!(timeline[0].kind, EventKind::LevelOfCare);
        assert_eq!(timeline[0].time_hint.as_deref(), Some("2024-03-01"));

        let lactate = timeline.iter().find(|e| e.text.contains("Lactate")).unwrap();
        assert_eq!(lactate.kind, EventKind::Lab);
        assert_eq!(lactate.time_hint.as_deref(), Some("14:30"));

        let worsened = timeline.iter().find(|e| e.text.contains("worsened")).unwrap();
        assert_eq!(worsened.kind, EventKind::Deterioration);
        assert_eq!(worsened.time_hint.as_deref(), Some("Day 2"));

        for event in &timeline {
            assert_eq!(&NOTE[event.start..event.end], event.text);
        }
    }

    #[test]
    fn spans_keep_only_claimable_sentences() {
        let spans = extract_spans(NOTE);

        assert!(spans.iter().all(|s| s.quote.chars().count() >= MIN_SPAN_CHARS));
        assert!(spans.iter().all(|s| s.quote != "ok."));
        assert_eq!(spans.get("E1").map(|s| s.category), Some(SpanCategory::Other));

        let assessment = spans.first_mentioning("assessment").unwrap();
        assert_eq!(assessment.category, SpanCategory::Assessment);
        assert!(spans.resolves("E1"));
        assert!(spans.resolves(RECORD_UNCERTAINTY));
        assert!(!spans.resolves("E999"));
        assert_eq!(spans.resolve_or_uncertain(Some("E999")), RECORD_UNCERTAINTY);
    }

    #[test]
    fn vitals_sentence_is_categorized_as_vital_signs() {
        let spans = extract_spans("BP 82/40 and HR 118 on arrival to the unit.");
        assert_eq!(spans.get("E1").map(|s| s.category), Some(SpanCategory::VitalSigns));
    }

    #[test]
    fn spans_and_events_are_capped() {
        let long: String = (0..200)
            .map(|i| format!("Lactate measured at {i} mmol today."))
            .collect::<Vec<_>>()
            .join(" ");
        let result = preprocess(&long);
        assert_eq!(result.timeline.len(), MAX_TIMELINE_EVENTS);
        assert_eq!(result.spans.len(), MAX_EVIDENCE_SPANS);
        assert_eq!(result.spans.iter().last().map(|s| s.id.as_str()), Some("E60"));
    }

    #[test]
    fn record_gaps_flag_missing_vitals_and_uncertainty() {
        let gaps = record_gaps(NOTE);
        assert!(!gaps.missing_vitals.contains(&VitalSign::Bp));
        assert!(!gaps.missing_vitals.contains(&VitalSign::Hr));
        assert!(gaps.missing_vitals.contains(&VitalSign::Temp));
        assert!(gaps.short_text);

        let vague = record_gaps("History unclear, poor historian.");
        assert_eq!(vague.uncertainty_markers, vec!["poor historian", "unclear"]);
        assert!(vague.notes().iter().any(|n| n.starts_with("vitals_missing: bp")));
    }

    #[test]
    fn empty_input_yields_empty_collections() {
        let result = preprocess("");
        assert!(result.timeline.is_empty());
        assert!(result.spans.is_empty());
        assert!(result.record_gaps.short_text);
        assert_eq!(result.record_gaps.missing_vitals.len(), 5);
    }
}

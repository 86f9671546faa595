//! Typed context slots shared by the pipeline tasks.

use critic_flow::Key;

use crate::analysis::{DiagnosisAnalysis, TreatmentAnalysis};
use crate::critic::{
    AnalysisState, CriticLoop, CritiqueReport, FeedbackDecision, TraceEntry, VerificationResult,
};
use crate::evidence::EvidenceBundle;
use crate::models::Case;
use crate::preprocess::PreprocessResult;

pub const CASE: Key<Case> = Key::new("case");
pub const PREPROCESSING: Key<PreprocessResult> = Key::new("preprocessing");
/// Rendered lessons from episodic memory, empty when nothing was recalled
pub const LESSONS: Key<String> = Key::new("episodic_lessons");
pub const EVIDENCE: Key<EvidenceBundle> = Key::new("evidence");
pub const DIAGNOSIS: Key<DiagnosisAnalysis> = Key::new("diagnosis_analysis");
pub const TREATMENT: Key<TreatmentAnalysis> = Key::new("treatment_analysis");
pub const ANALYSIS_STATE: Key<AnalysisState> = Key::new("analysis_state");
pub const CRITIC_LOOP: Key<CriticLoop> = Key::new("critic_loop");
pub const CRITIQUE: Key<CritiqueReport> = Key::new("critique");
pub const FEEDBACK: Key<FeedbackDecision> = Key::new("feedback");
pub const VERIFICATION: Key<VerificationResult> = Key::new("verification");
/// Pipeline-level degradations outside the evidence bundle and the trace
pub const NOTES: Key<Vec<String>> = Key::new("notes");
/// Degradations hit before the analysis state exists; the cohort task moves
/// them into the trace
pub const EARLY_TRACE: Key<Vec<TraceEntry>> = Key::new("early_trace");

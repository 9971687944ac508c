//! Output types: answers, per-provider results and the final outcome.
//!
//! [`CanonicalAnswerSet`] is the unit handed to grading. It can only be built
//! by [`crate::pipeline::validate::validate`], so holding one proves the
//! answers are a dense, 1-indexed set of 100 cells from the A–E/BLANK
//! alphabet.

use crate::config::ProviderId;
use crate::error::ProviderError;
use crate::pipeline::preprocess::PreprocessReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of questions on every sheet.
pub const QUESTION_COUNT: usize = 100;

/// One cell of an answer sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Answer {
    A,
    B,
    C,
    D,
    E,
    #[serde(rename = "BLANK")]
    Blank,
}

impl Answer {
    /// Map a single letter (any case) to an answer.
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(Answer::A),
            'B' => Some(Answer::B),
            'C' => Some(Answer::C),
            'D' => Some(Answer::D),
            'E' => Some(Answer::E),
            _ => None,
        }
    }

    pub fn is_blank(self) -> bool {
        self == Answer::Blank
    }

    /// Compact one-character form; `-` for blank.
    pub fn as_char(self) -> char {
        match self {
            Answer::A => 'A',
            Answer::B => 'B',
            Answer::C => 'C',
            Answer::D => 'D',
            Answer::E => 'E',
            Answer::Blank => '-',
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Blank => f.write_str("BLANK"),
            other => write!(f, "{}", other.as_char()),
        }
    }
}

/// A validated answer for one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerCell {
    /// 1-based question number.
    pub question: u32,
    pub answer: Answer,
    /// Provider self-reported confidence in `[0, 1]`. Not comparable across
    /// providers.
    pub confidence: f32,
    /// Set when the provider's raw value was coerced to BLANK.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// The validated 100-cell answer array of one sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalAnswerSet {
    provider: ProviderId,
    average_confidence: f32,
    min_confidence: f32,
    cells: Vec<AnswerCell>,
}

impl CanonicalAnswerSet {
    /// Only the validator constructs answer sets; `cells` must already be
    /// dense and ordered 1..=100.
    pub(crate) fn from_validated(provider: ProviderId, cells: Vec<AnswerCell>) -> Self {
        let n = cells.len().max(1) as f32;
        let average_confidence = cells.iter().map(|c| c.confidence).sum::<f32>() / n;
        let min_confidence = cells
            .iter()
            .map(|c| c.confidence)
            .fold(f32::INFINITY, f32::min)
            .min(1.0);
        Self {
            provider,
            average_confidence,
            min_confidence,
            cells,
        }
    }

    /// Provider that produced the answers.
    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    /// All 100 cells in question order.
    pub fn cells(&self) -> &[AnswerCell] {
        &self.cells
    }

    /// Cell for a 1-based question number.
    pub fn get(&self, question: u32) -> Option<&AnswerCell> {
        let idx = (question as usize).checked_sub(1)?;
        self.cells.get(idx)
    }

    /// Answers in question order.
    pub fn answers(&self) -> impl Iterator<Item = Answer> + '_ {
        self.cells.iter().map(|c| c.answer)
    }

    pub fn average_confidence(&self) -> f32 {
        self.average_confidence
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    pub fn blank_count(&self) -> usize {
        self.cells.iter().filter(|c| c.answer.is_blank()).count()
    }

    /// Cells whose raw value was coerced.
    pub fn warnings(&self) -> impl Iterator<Item = &AnswerCell> {
        self.cells.iter().filter(|c| c.warning.is_some())
    }

    /// Cells a human should re-inspect: low confidence or an unrecognised mark.
    pub fn review_flags(&self, threshold: f32) -> Vec<ReviewFlag> {
        self.cells
            .iter()
            .filter_map(|c| {
                let reason = if c.warning.is_some() {
                    ReviewReason::UnrecognizedMark
                } else if c.confidence < threshold {
                    ReviewReason::LowConfidence
                } else {
                    return None;
                };
                Some(ReviewFlag {
                    question: c.question,
                    confidence: c.confidence,
                    reason,
                })
            })
            .collect()
    }

    pub fn needs_review(&self, threshold: f32) -> bool {
        !self.review_flags(threshold).is_empty()
    }

    /// 100-character summary, `-` for blanks.
    pub fn to_letters(&self) -> String {
        self.answers().map(Answer::as_char).collect()
    }
}

/// A cell flagged for manual review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewFlag {
    pub question: u32,
    pub confidence: f32,
    pub reason: ReviewReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    LowConfidence,
    UnrecognizedMark,
}

/// Identification codes printed in the sheet header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classroom_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proctor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission_process: Option<String>,
}

impl SheetHeader {
    pub fn is_empty(&self) -> bool {
        self == &SheetHeader::default()
    }
}

/// Outcome of one provider invocation.
///
/// When `success` is true, `answers` is `Some` and has passed validation.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderResult {
    pub provider: ProviderId,
    pub success: bool,
    pub answers: Option<CanonicalAnswerSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<SheetHeader>,
    pub elapsed_ms: u64,
    /// Calls made, including timeout retries.
    pub attempts: u32,
    pub error: Option<ProviderError>,
    /// Backend-specific diagnostics (model, token usage, raw answer count).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_diagnostic: Option<serde_json::Value>,
}

impl ProviderResult {
    pub fn failed(provider: ProviderId, error: ProviderError, elapsed_ms: u64, attempts: u32) -> Self {
        Self {
            provider,
            success: false,
            answers: None,
            header: None,
            elapsed_ms,
            attempts,
            error: Some(error),
            raw_diagnostic: None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// One line of the orchestrator's attempt log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub provider: ProviderId,
    pub success: bool,
    pub elapsed_ms: u64,
    pub calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
}

impl From<&ProviderResult> for AttemptRecord {
    fn from(r: &ProviderResult) -> Self {
        Self {
            provider: r.provider,
            success: r.success,
            elapsed_ms: r.elapsed_ms,
            calls: r.attempts,
            error: r.error.clone(),
        }
    }
}

/// Why an extraction produced no answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Backends errored or timed out; retrying the request later may help.
    AllProvidersFailed,
    /// Every backend answered but none produced 100 valid answers; the photo
    /// should be recaptured.
    Illegible,
}

/// Final result of one extraction request.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutcome {
    pub success: bool,
    /// Provider that satisfied the request (the forced one in forced mode).
    pub provider: Option<ProviderId>,
    pub answers: Option<CanonicalAnswerSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<SheetHeader>,
    pub error_message: Option<String>,
    /// Every provider invocation, in order.
    pub attempts: Vec<AttemptRecord>,
    pub elapsed_ms: u64,
    pub forced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<PreprocessReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ExtractionOutcome {
    pub(crate) fn from_success(result: ProviderResult, attempts: Vec<AttemptRecord>, elapsed_ms: u64, forced: bool) -> Self {
        Self {
            success: true,
            provider: Some(result.provider),
            answers: result.answers,
            header: result.header,
            error_message: None,
            attempts,
            elapsed_ms,
            forced,
            preprocessing: None,
            failure: None,
        }
    }

    pub(crate) fn from_failure(
        provider: Option<ProviderId>,
        error_message: String,
        attempts: Vec<AttemptRecord>,
        elapsed_ms: u64,
        forced: bool,
    ) -> Self {
        let illegible = !attempts.is_empty()
            && attempts
                .iter()
                .all(|a| a.error.as_ref().is_some_and(ProviderError::is_validation));
        Self {
            success: false,
            provider,
            answers: None,
            header: None,
            error_message: Some(error_message),
            attempts,
            elapsed_ms,
            forced,
            preprocessing: None,
            failure: Some(if illegible {
                FailureKind::Illegible
            } else {
                FailureKind::AllProvidersFailed
            }),
        }
    }

    /// Attach the preprocessing report of the image that was read.
    pub fn with_preprocessing(mut self, report: PreprocessReport) -> Self {
        self.preprocessing = Some(report);
        self
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure
    }
}

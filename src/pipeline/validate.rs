//! Answer-set validation: the grading-readiness gate.
//!
//! A provider's decoded answers become a [`CanonicalAnswerSet`] only if they
//! are exactly 100 entries numbered 1..=100 with no duplicates. Individual
//! values never fail validation: anything outside A–E is coerced to BLANK and
//! annotated so triage can send the sheet to a human.
//!
//! Short or long answer lists are rejected rather than padded or truncated.
//! A provider that "loses" question 37 has usually shifted every answer after
//! it, and padding would grade that shift silently.

use crate::config::ProviderId;
use crate::error::ValidationError;
use crate::output::{Answer, AnswerCell, CanonicalAnswerSet, QUESTION_COUNT};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An answer as decoded from a provider reply, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAnswer {
    pub question: u32,
    pub value: Option<String>,
    pub confidence: f32,
}

impl RawAnswer {
    pub fn new(question: u32, value: Option<&str>, confidence: f32) -> Self {
        Self {
            question,
            value: value.map(str::to_string),
            confidence,
        }
    }
}

/// Values providers use to say "nothing marked".
const BLANK_WORDS: &[&str] = &["", "NULL", "NONE", "BLANK", "BLANCO", "EN BLANCO", "VACIO", "VACÍO", "-", "_"];

/// Validate a provider's answers and normalise them into a canonical set.
pub fn validate(
    raw_answers: Vec<RawAnswer>,
    provider: ProviderId,
) -> Result<CanonicalAnswerSet, ValidationError> {
    if raw_answers.len() != QUESTION_COUNT {
        return Err(ValidationError::WrongCount {
            expected: QUESTION_COUNT,
            got: raw_answers.len(),
        });
    }

    let mut slots: Vec<Option<AnswerCell>> = vec![None; QUESTION_COUNT];
    for raw in raw_answers {
        let q = raw.question;
        if q == 0 || q as usize > QUESTION_COUNT {
            return Err(ValidationError::QuestionOutOfRange {
                question: q,
                max: QUESTION_COUNT as u32,
            });
        }
        let slot = &mut slots[q as usize - 1];
        if slot.is_some() {
            return Err(ValidationError::DuplicateQuestion { question: q });
        }
        let (answer, warning) = normalize_value(raw.value.as_deref());
        if let Some(ref w) = warning {
            debug!("Question {}: {}", q, w);
        }
        *slot = Some(AnswerCell {
            question: q,
            answer,
            confidence: clamp_confidence(raw.confidence),
            warning,
        });
    }

    // 100 in-range entries without duplicates fill every slot.
    let cells: Vec<AnswerCell> = slots.into_iter().flatten().collect();
    Ok(CanonicalAnswerSet::from_validated(provider, cells))
}

/// Map a raw provider value to an answer, with a warning when it was coerced.
///
/// Case and surrounding whitespace are ignored; explicit blank markers
/// (`null`, `-`, "en blanco", …) map to BLANK without a warning.
pub fn normalize_value(value: Option<&str>) -> (Answer, Option<String>) {
    let Some(raw) = value else {
        return (Answer::Blank, None);
    };
    let v = raw.trim().to_uppercase();
    if BLANK_WORDS.contains(&v.as_str()) {
        return (Answer::Blank, None);
    }
    let mut chars = v.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if let Some(answer) = Answer::from_letter(c) {
            return (answer, None);
        }
    }
    (
        Answer::Blank,
        Some(format!("unrecognised mark {raw:?} treated as blank")),
    )
}

fn clamp_confidence(c: f32) -> f32 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(value: &str) -> Vec<RawAnswer> {
        (1..=100).map(|q| RawAnswer::new(q, Some(value), 0.9)).collect()
    }

    #[test]
    fn accepts_dense_set_in_any_order() {
        let mut raw = full("b");
        raw.reverse();
        let set = validate(raw, ProviderId::OpenAi).unwrap();
        assert_eq!(set.cells().len(), 100);
        for (i, cell) in set.cells().iter().enumerate() {
            assert_eq!(cell.question as usize, i + 1);
            assert_eq!(cell.answer, Answer::B);
        }
        assert_eq!(set.provider(), ProviderId::OpenAi);
    }

    #[test]
    fn wrong_count_reports_expected_and_got() {
        let err = validate(vec![RawAnswer::new(1, Some("a"), 0.9)], ProviderId::Google).unwrap_err();
        assert_eq!(err.to_string(), "expected 100, got 1");
    }

    #[test]
    fn duplicate_question_rejected() {
        let mut raw = full("A");
        raw[99].question = 5;
        assert_eq!(
            validate(raw, ProviderId::Claude).unwrap_err(),
            ValidationError::DuplicateQuestion { question: 5 }
        );
    }

    #[test]
    fn out_of_range_question_rejected() {
        let mut raw = full("A");
        raw[0].question = 0;
        assert!(matches!(
            validate(raw, ProviderId::Claude).unwrap_err(),
            ValidationError::QuestionOutOfRange { question: 0, .. }
        ));
        let mut raw = full("A");
        raw[0].question = 101;
        assert!(matches!(
            validate(raw, ProviderId::Claude).unwrap_err(),
            ValidationError::QuestionOutOfRange { question: 101, .. }
        ));
    }

    #[test]
    fn lowercase_is_uppercased() {
        assert_eq!(normalize_value(Some("a")), (Answer::A, None));
        assert_eq!(normalize_value(Some(" e ")), (Answer::E, None));
    }

    #[test]
    fn out_of_alphabet_becomes_blank_with_warning() {
        for bad in ["F", "AB", "3", "?", "Z"] {
            let (answer, warning) = normalize_value(Some(bad));
            assert_eq!(answer, Answer::Blank, "{bad}");
            assert!(warning.is_some(), "{bad}");
        }
    }

    #[test]
    fn explicit_blanks_have_no_warning() {
        for blank in [None, Some(""), Some("null"), Some("-"), Some("en blanco")] {
            assert_eq!(normalize_value(blank), (Answer::Blank, None));
        }
    }

    #[test]
    fn confidence_is_clamped() {
        let mut raw = full("C");
        raw[0].confidence = 7.0;
        raw[1].confidence = f32::NAN;
        let set = validate(raw, ProviderId::Google).unwrap();
        assert_eq!(set.get(1).unwrap().confidence, 1.0);
        assert_eq!(set.get(2).unwrap().confidence, 0.0);
    }

    #[test]
    fn every_cell_is_in_alphabet() {
        let values = ["a", "B", "x", "", "dd", "E", "c"];
        let raw = (1..=100)
            .map(|q| RawAnswer::new(q, Some(values[q as usize % values.len()]), 0.8))
            .collect();
        let set = validate(raw, ProviderId::Claude).unwrap();
        assert!(set.answers().all(|a| matches!(
            a,
            Answer::A | Answer::B | Answer::C | Answer::D | Answer::E | Answer::Blank
        )));
        assert_eq!(set.warnings().count(), 29);
    }
}

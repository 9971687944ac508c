//! Grading a candidate's answers against an answer key.
//!
//! Both sides have the same shape (100 cells of A–E/BLANK), so grading is an
//! element-wise comparison. Scores are reported on the 0–20 vigesimal scale
//! used for admission results, with one point per correct answer as the raw
//! score.
//!
//! A question whose key cell is BLANK is *annulled*: it awards nothing and
//! is counted separately, but stays in the denominator.

use crate::error::SheetOcrError;
use crate::output::{Answer, CanonicalAnswerSet, QUESTION_COUNT};
use crate::pipeline::validate::normalize_value;
use crate::providers::decode_answers;
use serde::Serialize;
use serde_json::Value;

/// Minimum vigesimal score to pass.
pub const PASSING_SCORE: f32 = 10.5;

/// The correct answer for each of the 100 questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnswerKey {
    answers: Vec<Answer>,
}

impl AnswerKey {
    /// Use an extracted answer-key sheet as the key.
    pub fn from_answer_set(set: &CanonicalAnswerSet) -> Self {
        Self {
            answers: set.answers().collect(),
        }
    }

    /// Parse 100 letters (`A`–`E`, `-` or `_` for an annulled question).
    /// Whitespace and commas are ignored, so `"ABCDE ABCDE …"` works.
    pub fn from_letters(letters: &str) -> Result<Self, SheetOcrError> {
        let mut answers = Vec::with_capacity(QUESTION_COUNT);
        for c in letters.chars().filter(|c| !c.is_whitespace() && *c != ',') {
            let answer = match c {
                '-' | '_' => Answer::Blank,
                other => Answer::from_letter(other).ok_or_else(|| {
                    SheetOcrError::InvalidAnswerKey(format!(
                        "invalid letter {other:?} at question {}",
                        answers.len() + 1
                    ))
                })?,
            };
            answers.push(answer);
        }
        Self::from_vec(answers)
    }

    /// Parse a key file: either an object mapping question numbers to
    /// letters (`{"1": "A", "2": "C", …}`) or an answer list in any shape a
    /// provider reply may take.
    pub fn from_json(text: &str) -> Result<Self, SheetOcrError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SheetOcrError::InvalidAnswerKey(format!("not valid JSON: {e}")))?;

        let numbered: Vec<(u32, Option<String>)> = match &value {
            Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.parse::<u32>().is_ok()) => map
                .iter()
                .map(|(k, v)| (k.parse().unwrap_or(0), v.as_str().map(str::to_string)))
                .collect(),
            other => decode_answers(other, 1.0)
                .map_err(|e| SheetOcrError::InvalidAnswerKey(e.to_string()))?
                .into_iter()
                .map(|raw| (raw.question, raw.value))
                .collect(),
        };

        let mut slots: Vec<Option<Answer>> = vec![None; QUESTION_COUNT];
        for (q, value) in numbered {
            let slot = (q as usize)
                .checked_sub(1)
                .and_then(|i| slots.get_mut(i))
                .ok_or_else(|| {
                    SheetOcrError::InvalidAnswerKey(format!("question {q} is outside 1..={QUESTION_COUNT}"))
                })?;
            if slot.is_some() {
                return Err(SheetOcrError::InvalidAnswerKey(format!(
                    "question {q} appears more than once"
                )));
            }
            let (answer, warning) = normalize_value(value.as_deref());
            if let Some(w) = warning {
                return Err(SheetOcrError::InvalidAnswerKey(format!("question {q}: {w}")));
            }
            *slot = Some(answer);
        }

        let missing: Vec<String> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| (i + 1).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SheetOcrError::InvalidAnswerKey(format!(
                "missing questions: {}",
                missing.join(", ")
            )));
        }
        Self::from_vec(slots.into_iter().flatten().collect())
    }

    fn from_vec(answers: Vec<Answer>) -> Result<Self, SheetOcrError> {
        if answers.len() != QUESTION_COUNT {
            return Err(SheetOcrError::InvalidAnswerKey(format!(
                "expected {QUESTION_COUNT} answers, got {}",
                answers.len()
            )));
        }
        Ok(Self { answers })
    }

    /// Key answer for a 1-based question number.
    pub fn get(&self, question: u32) -> Option<Answer> {
        (question as usize)
            .checked_sub(1)
            .and_then(|i| self.answers.get(i))
            .copied()
    }

    /// Number of annulled questions.
    pub fn annulled_count(&self) -> usize {
        self.answers.iter().filter(|a| a.is_blank()).count()
    }

    pub fn to_letters(&self) -> String {
        self.answers.iter().map(|a| a.as_char()).collect()
    }
}

/// Outcome of grading one sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeReport {
    pub correct: u32,
    pub incorrect: u32,
    /// Nothing marked.
    pub blank: u32,
    /// A mark was present but was not a single A–E letter.
    pub invalid: u32,
    /// Key cell was BLANK.
    pub annulled: u32,
    /// One point per correct answer.
    pub score: u32,
    pub percentage: f32,
    /// `correct / 100 * 20`, rounded to two decimals.
    pub vigesimal: f32,
    pub passed: bool,
    /// Questions answered incorrectly, for feedback.
    pub incorrect_questions: Vec<u32>,
}

/// Compare a candidate's answers with the key.
pub fn grade(answers: &CanonicalAnswerSet, key: &AnswerKey) -> GradeReport {
    let mut report = GradeReport {
        correct: 0,
        incorrect: 0,
        blank: 0,
        invalid: 0,
        annulled: 0,
        score: 0,
        percentage: 0.0,
        vigesimal: 0.0,
        passed: false,
        incorrect_questions: Vec::new(),
    };

    for cell in answers.cells() {
        let expected = key.get(cell.question).unwrap_or(Answer::Blank);
        if expected.is_blank() {
            report.annulled += 1;
        } else if cell.answer.is_blank() {
            if cell.warning.is_some() {
                report.invalid += 1;
            } else {
                report.blank += 1;
            }
        } else if cell.answer == expected {
            report.correct += 1;
        } else {
            report.incorrect += 1;
            report.incorrect_questions.push(cell.question);
        }
    }

    let total = QUESTION_COUNT as f32;
    report.score = report.correct;
    report.percentage = report.correct as f32 / total * 100.0;
    report.vigesimal = (report.correct as f32 / total * 20.0 * 100.0).round() / 100.0;
    report.passed = report.vigesimal >= PASSING_SCORE;
    report
}

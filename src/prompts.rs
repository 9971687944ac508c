//! Extraction prompts for vision backends.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: tightening an instruction (e.g. how to treat
//!    a crossed-out mark) means editing exactly one place, and bumping
//!    [`PROMPT_VERSION`] so diagnostics show which wording produced a result.
//!
//! 2. **Testability**: unit tests inspect prompts directly without calling a
//!    real backend.
//!
//! Every backend gets the same task description; only a short suffix differs,
//! matching each model family's most common formatting disobedience.

use crate::config::{ProviderId, SheetKind};

/// Version tag recorded in provider diagnostics.
pub const PROMPT_VERSION: &str = "sheet-100q-v3";

/// System message for backends that support one.
pub const SYSTEM_PROMPT: &str = "You are an OCR expert for handwritten academic forms. \
Your only job is to extract data from exam answer sheets. \
You return ONLY valid JSON, with no additional text, markdown or explanations. \
Your reply MUST start with { and end with }.";

const SHEET_LAYOUT: &str = r#"
SHEET LAYOUT
- 100 numbered questions arranged in 5 columns of 20 (1-20, 21-40, 41-60, 61-80, 81-100).
- Each question has a pair of parentheses ( ) where one letter is written or marked.
- Alternatives are A, B, C, D and E."#;

const HEADER_INSTRUCTIONS: &str = r#"
HEADER
At the top of the sheet are printed or handwritten codes:
- DNI-POSTULANTE (8 digits) → "candidateId"
- COD-AULA (e.g. A101) → "classroomCode"
- DNI-PROFESOR (8 digits) → "proctorId"
- CODIGO DE HOJA (e.g. UXJ545X) → "sheetCode"
- PROCESO (e.g. 2025-2) → "admissionProcess"
Transcribe them EXACTLY. Use "" for any code that is not legible."#;

const MARK_RULES: &str = r#"
READING THE MARKS
Valid: a single letter a-e or A-E inside the parentheses → return it in UPPERCASE.
Return null for:
- empty parentheses
- symbols (X, -, +, *, check marks, scribbles)
- digits
- two or more letters
- letters outside A-E (F, G, ...)
- anything you cannot read with confidence"#;

const OUTPUT_FORMAT: &str = r#"
OUTPUT FORMAT
{
  "codes": {"candidateId": "79012345", "classroomCode": "A101", "proctorId": "12345678", "sheetCode": "UXJ545X", "admissionProcess": "2025-2"},
  "answers": [
    {"questionNumber": 1, "answer": "B", "confidence": 0.97},
    {"questionNumber": 2, "answer": null, "confidence": 0.90},
    ...
  ]
}
"answers" MUST contain EXACTLY 100 entries, questionNumber 1 to 100, in order, each exactly once.
"confidence" is your certainty for that entry between 0 and 1."#;

/// Task description for the given kind of sheet.
pub fn extraction_prompt(kind: SheetKind) -> String {
    let subject = match kind {
        SheetKind::CandidateSheet => {
            "Analyse this ANSWER SHEET from an admission exam and extract the candidate's 100 answers."
        }
        SheetKind::AnswerKey => {
            "Analyse this ANSWER KEY sheet from an admission exam. It holds the CORRECT answer \
for each of the 100 questions; every question is normally filled in."
        }
    };
    format!(
        "{subject}\n{SHEET_LAYOUT}\n{HEADER_INSTRUCTIONS}\n{MARK_RULES}\n{OUTPUT_FORMAT}\n\nReply with the JSON object only."
    )
}

/// Formatting reminder appended to the task for a specific backend.
pub fn provider_suffix(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::Claude => {
            "\n\nIMPORTANT:\n- Do not include <thinking> or internal reasoning\n- Only the final JSON\n- No markdown\n- No additional explanations"
        }
        ProviderId::Google => {
            "\n\nCRITICAL:\n- Your output must be valid JSON only\n- Do NOT use triple backticks\n- Do NOT add text before or after the JSON\n- Use \"\" as the answer for blank or invalid marks if null is not allowed"
        }
        ProviderId::OpenAi => "",
    }
}

/// Full user prompt for one backend.
pub fn build_prompt(kind: SheetKind, provider: ProviderId) -> String {
    let mut prompt = extraction_prompt(kind);
    prompt.push_str(provider_suffix(provider));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_demands_exactly_100_json_answers() {
        let p = extraction_prompt(SheetKind::CandidateSheet);
        assert!(p.contains("EXACTLY 100"));
        assert!(p.contains("null"));
        assert!(p.contains("A, B, C, D and E"));
        assert!(p.contains("questionNumber"));
    }

    #[test]
    fn answer_key_prompt_differs() {
        let key = extraction_prompt(SheetKind::AnswerKey);
        assert!(key.contains("ANSWER KEY"));
        assert_ne!(key, extraction_prompt(SheetKind::CandidateSheet));
    }

    #[test]
    fn suffixes_are_provider_specific() {
        assert!(build_prompt(SheetKind::CandidateSheet, ProviderId::Claude).contains("<thinking>"));
        assert!(build_prompt(SheetKind::CandidateSheet, ProviderId::Google).contains("triple backticks"));
        assert_eq!(
            build_prompt(SheetKind::CandidateSheet, ProviderId::OpenAi),
            extraction_prompt(SheetKind::CandidateSheet)
        );
    }

    #[test]
    fn system_prompt_requests_bare_json() {
        assert!(SYSTEM_PROMPT.contains("start with {"));
    }
}

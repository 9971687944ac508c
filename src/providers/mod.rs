//! Vision providers: one backend call per attempt, normalised into a
//! [`ProviderResult`].
//!
//! Every backend implements [`VisionProvider`]. The trait only covers the
//! backend-specific part (build the request, send it, parse the reply into
//! raw answers); everything every backend needs is done once in [`invoke`]:
//!
//! ```text
//! invoke ──▶ timeout(extract_answers) ──▶ retry on timeout ──▶ validate
//!                 │                                              │
//!                 └──── any error ──▶ ProviderResult{success: false}
//! ```
//!
//! [`invoke`] never returns an error: whatever happens inside a backend
//! comes back as data for the orchestrator to log and move past.

pub mod claude;
pub mod google;
mod llm;
pub mod openai;

use crate::config::{ExtractionConfig, ProviderId, SheetKind};
use crate::error::{ProviderError, ValidationError};
use crate::output::{ProviderResult, SheetHeader};
use crate::pipeline::parse;
use crate::pipeline::preprocess::PreprocessedImage;
use crate::pipeline::validate::{validate, RawAnswer};
use crate::prompts::PROMPT_VERSION;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

pub use claude::ClaudeProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;

/// A vision backend able to read the answers off a sheet photograph.
///
/// Implementations must be stateless after construction: the orchestrator
/// shares one instance across concurrent requests.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Whether credentials and client are in place. Evaluated once, when the
    /// orchestrator is built.
    fn is_available(&self) -> bool;

    /// What to do to make this provider available.
    fn availability_hint(&self) -> String {
        format!("Set {} to enable {}", self.id().credential_vars().join(" or "), self.id())
    }

    /// Send one request and decode the reply. Validation of the answer set
    /// happens in [`invoke`].
    async fn extract_answers(
        &self,
        image: &PreprocessedImage,
        kind: SheetKind,
    ) -> Result<ProviderReply, ProviderError>;
}

/// Decoded, not yet validated, provider reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub answers: Vec<RawAnswer>,
    pub header: Option<SheetHeader>,
    /// Backend-specific metadata (model, token counts, prompt version, …).
    pub diagnostic: Value,
}

/// Run one provider under the configured timeout and retry policy, then
/// validate its answers.
///
/// Only timeouts are retried, with exponential backoff
/// (`retry_backoff_ms * 2^(attempt-1)`, at most one minute). Auth, quota
/// and parse failures would fail the same way again, so they end the
/// attempt at once.
pub async fn invoke(
    provider: &dyn VisionProvider,
    image: &PreprocessedImage,
    kind: SheetKind,
    config: &ExtractionConfig,
) -> ProviderResult {
    let id = provider.id();
    let start = Instant::now();
    let limit = Duration::from_secs(config.timeout_secs);
    let mut calls = 0u32;

    for attempt in 0..=config.retry_attempts {
        if attempt > 0 {
            let backoff = backoff_ms(config.retry_backoff_ms, attempt);
            warn!(
                "{}: retry {}/{} after {}ms",
                id, attempt, config.retry_attempts, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }
        calls += 1;

        let reply = match timeout(limit, provider.extract_answers(image, kind)).await {
            Err(_) => {
                warn!("{}: no reply within {}s", id, config.timeout_secs);
                continue;
            }
            Ok(Err(ProviderError::Timeout { .. })) => {
                warn!("{}: backend reported a timeout", id);
                continue;
            }
            Ok(Err(e)) => {
                warn!("{}: attempt {} failed: {}", id, calls, e);
                return ProviderResult::failed(id, e, elapsed_ms(start), calls);
            }
            Ok(Ok(reply)) => reply,
        };

        let got = reply.answers.len();
        return match validate(reply.answers, id) {
            Ok(answers) => {
                info!(
                    "{}: {} answers, avg confidence {:.2}, {}ms",
                    id,
                    got,
                    answers.average_confidence(),
                    elapsed_ms(start)
                );
                ProviderResult {
                    provider: id,
                    success: true,
                    answers: Some(answers),
                    header: reply.header,
                    elapsed_ms: elapsed_ms(start),
                    attempts: calls,
                    error: None,
                    raw_diagnostic: Some(reply.diagnostic),
                }
            }
            Err(source) => {
                warn!("{}: invalid answer set: {}", id, source);
                let mut result = ProviderResult::failed(
                    id,
                    ProviderError::Validation {
                        provider: id,
                        source,
                    },
                    elapsed_ms(start),
                    calls,
                );
                result.raw_diagnostic = Some(reply.diagnostic);
                result
            }
        };
    }

    ProviderResult::failed(
        id,
        ProviderError::Timeout {
            provider: id,
            secs: config.timeout_secs,
            attempts: calls,
        },
        elapsed_ms(start),
        calls,
    )
}

/// Longest pause between two calls to the same provider.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped.
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_BACKOFF_MS)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Turn a backend's reply text into a [`ProviderReply`].
///
/// Shared by every adapter: parse with repair, decode the answer list and
/// header, record what was received.
pub(crate) fn reply_from_text(
    provider: ProviderId,
    text: &str,
    default_confidence: f32,
    mut diagnostic: Map<String, Value>,
) -> Result<ProviderReply, ProviderError> {
    let value = parse::parse(text).map_err(|source| ProviderError::Parse { provider, source })?;
    let answers = decode_answers(&value, default_confidence)
        .map_err(|source| ProviderError::Validation { provider, source })?;
    let header = decode_header(&value);
    debug!(
        "{}: decoded {} answers from {} chars",
        provider,
        answers.len(),
        text.len()
    );
    diagnostic.insert("prompt_version".into(), json!(PROMPT_VERSION));
    diagnostic.insert("reply_chars".into(), json!(text.chars().count()));
    Ok(ProviderReply {
        answers,
        header,
        diagnostic: Value::Object(diagnostic),
    })
}

// ── Answer decoding ──────────────────────────────────────────────────────

const LIST_KEYS: &[&str] = &["respuestas", "answers", "respuesta", "results"];
const QUESTION_KEYS: &[&str] = &["pregunta", "numero", "questionNumber", "question", "number"];
const VALUE_KEYS: &[&str] = &["respuesta", "answer", "letra", "value"];
const CONFIDENCE_KEYS: &[&str] = &["confianza", "confidence"];

/// Decode the answer list out of a parsed reply.
///
/// Accepted shapes: a bare array, or an object holding the array under
/// `respuestas`/`answers`. Items are objects (question number, value and
/// optional confidence) or bare letters/nulls numbered by position.
/// Confidences above 1 are read as percentages.
pub fn decode_answers(
    value: &Value,
    default_confidence: f32,
) -> Result<Vec<RawAnswer>, ValidationError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .ok_or(ValidationError::NoAnswers)?,
        _ => return Err(ValidationError::NoAnswers),
    };

    Ok(items
        .iter()
        .enumerate()
        .map(|(i, item)| decode_item(i as u32 + 1, item, default_confidence))
        .collect())
}

fn decode_item(position: u32, item: &Value, default_confidence: f32) -> RawAnswer {
    let Value::Object(map) = item else {
        return RawAnswer {
            question: position,
            value: scalar_text(item),
            confidence: default_confidence,
        };
    };

    let question = QUESTION_KEYS
        .iter()
        .find_map(|k| map.get(*k))
        .map(question_number)
        .unwrap_or(position);
    let value = VALUE_KEYS
        .iter()
        .find_map(|k| map.get(*k))
        .and_then(scalar_text);
    let confidence = CONFIDENCE_KEYS
        .iter()
        .find_map(|k| map.get(*k))
        .and_then(number)
        .map(|c| if c > 1.0 { c / 100.0 } else { c })
        .unwrap_or(default_confidence);

    RawAnswer {
        question,
        value,
        confidence,
    }
}

/// `0` for anything that is not a positive integer; the validator rejects it.
fn question_number(v: &Value) -> u32 {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn number(v: &Value) -> Option<f32> {
    match v {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

// ── Header decoding ──────────────────────────────────────────────────────

const HEADER_OBJECT_KEYS: &[&str] = &["codes", "codigos", "header", "cabecera"];

/// Decode the header codes, either at the top level or under `codes`.
pub fn decode_header(value: &Value) -> Option<SheetHeader> {
    let top = value.as_object()?;
    let map = HEADER_OBJECT_KEYS
        .iter()
        .find_map(|k| top.get(*k).and_then(Value::as_object))
        .unwrap_or(top);

    let field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| map.get(*k))
            .and_then(scalar_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let header = SheetHeader {
        candidate_id: field(&["dni_postulante", "dniPostulante", "candidateId", "candidate_id"]),
        classroom_code: field(&["codigo_aula", "codAula", "classroomCode", "classroom_code"]),
        proctor_id: field(&["dni_profesor", "dniProfesor", "proctorId", "proctor_id"]),
        sheet_code: field(&["codigo_hoja", "codigoDeHoja", "sheetCode", "sheet_code"]),
        admission_process: field(&[
            "proceso_admision",
            "procesoAdmision",
            "admissionProcess",
            "admission_process",
        ]),
    };
    (!header.is_empty()).then_some(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Answer;
    use crate::pipeline::input::AnswerSheetImage;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn decodes_spanish_object_items() {
        let v = json!({"respuestas": [
            {"pregunta": 1, "respuesta": "a", "confianza": 97},
            {"pregunta": "2", "respuesta": null}
        ]});
        let answers = decode_answers(&v, 0.9).unwrap();
        assert_eq!(answers[0], RawAnswer::new(1, Some("a"), 0.97));
        assert_eq!(answers[1], RawAnswer::new(2, None, 0.9));
    }

    #[test]
    fn decodes_gemini_shape_and_positional_letters() {
        let v = json!({"answers": [{"questionNumber": 3, "answer": "", "confidence": 0.5}]});
        assert_eq!(decode_answers(&v, 0.85).unwrap()[0], RawAnswer::new(3, Some(""), 0.5));

        let v = json!(["A", null, "c"]);
        let answers = decode_answers(&v, 0.9).unwrap();
        assert_eq!(answers.len(), 3);
        assert_eq!(answers[2], RawAnswer::new(3, Some("c"), 0.9));
        assert_eq!(answers[1].value, None);
    }

    #[test]
    fn reply_without_answer_list_is_a_validation_failure() {
        assert_eq!(decode_answers(&json!({"foo": 1}), 0.9), Err(ValidationError::NoAnswers));
        assert_eq!(decode_answers(&json!("A"), 0.9), Err(ValidationError::NoAnswers));
    }

    #[test]
    fn bad_question_numbers_map_to_zero() {
        let v = json!([{"pregunta": -4, "respuesta": "A"}, {"pregunta": "x", "respuesta": "B"}]);
        let answers = decode_answers(&v, 0.9).unwrap();
        assert_eq!(answers[0].question, 0);
        assert_eq!(answers[1].question, 0);
    }

    #[test]
    fn header_from_snake_case_and_codes_object() {
        let v = json!({"dni_postulante": "79012345", "codigo_aula": "A101", "dni_profesor": "", "respuestas": []});
        let h = decode_header(&v).unwrap();
        assert_eq!(h.candidate_id.as_deref(), Some("79012345"));
        assert_eq!(h.classroom_code.as_deref(), Some("A101"));
        assert_eq!(h.proctor_id, None);

        let v = json!({"codes": {"codigoDeHoja": "UXJ545X", "admissionProcess": "2025-2"}});
        let h = decode_header(&v).unwrap();
        assert_eq!(h.sheet_code.as_deref(), Some("UXJ545X"));
        assert_eq!(h.admission_process.as_deref(), Some("2025-2"));

        assert_eq!(decode_header(&json!({"answers": []})), None);
    }

    #[test]
    fn reply_from_fenced_text() {
        let body: Vec<String> = (1..=100)
            .map(|q| format!("{{\"pregunta\": {q}, \"respuesta\": \"b\"}}"))
            .collect();
        let text = format!("```json\n{{\"respuestas\": [{}]}}\n```", body.join(",\n"));
        let reply = reply_from_text(ProviderId::OpenAi, &text, 0.9, Map::new()).unwrap();
        assert_eq!(reply.answers.len(), 100);
        assert_eq!(reply.diagnostic["prompt_version"], PROMPT_VERSION);
    }

    #[test]
    fn unparseable_reply_is_a_parse_error() {
        let err = reply_from_text(ProviderId::Claude, "I cannot read this image.", 0.9, Map::new())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Parse { provider: ProviderId::Claude, .. }));
    }

    // ── invoke ───────────────────────────────────────────────────────────

    struct Scripted {
        calls: AtomicUsize,
        /// Number of leading calls that hang past the timeout.
        slow_calls: usize,
        answers: usize,
        fail_with: Option<ProviderError>,
    }

    impl Scripted {
        fn new(answers: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                slow_calls: 0,
                answers,
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl VisionProvider for Scripted {
        fn id(&self) -> ProviderId {
            ProviderId::Claude
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn extract_answers(
            &self,
            _image: &PreprocessedImage,
            _kind: SheetKind,
        ) -> Result<ProviderReply, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.slow_calls {
                sleep(Duration::from_secs(5)).await;
            }
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            Ok(ProviderReply {
                answers: (1..=self.answers as u32)
                    .map(|q| RawAnswer::new(q, Some("d"), 0.95))
                    .collect(),
                header: None,
                diagnostic: json!({}),
            })
        }
    }

    fn image() -> PreprocessedImage {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        PreprocessedImage::unprocessed(&AnswerSheetImage::from_bytes(buf).unwrap()).unwrap()
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(backoff_ms(500, 1), 500);
        assert_eq!(backoff_ms(500, 3), 2000);
        assert_eq!(backoff_ms(u64::MAX, 2), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(1 << 40, 5), MAX_BACKOFF_MS);
    }

    fn fast_config() -> ExtractionConfig {
        ExtractionConfig::builder()
            .timeout_secs(1)
            .retry_attempts(1)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn valid_reply_succeeds_in_one_call() {
        let p = Scripted::new(100);
        let r = invoke(&p, &image(), SheetKind::CandidateSheet, &fast_config()).await;
        assert!(r.success);
        assert_eq!(r.attempts, 1);
        assert_eq!(r.answers.unwrap().get(7).unwrap().answer, Answer::D);
    }

    #[tokio::test]
    async fn short_reply_is_a_soft_failure() {
        let p = Scripted::new(99);
        let r = invoke(&p, &image(), SheetKind::CandidateSheet, &fast_config()).await;
        assert!(!r.success);
        assert!(r.error_message().unwrap().contains("expected 100, got 99"));
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_is_not_retried() {
        let mut p = Scripted::new(100);
        p.fail_with = Some(ProviderError::Unavailable {
            provider: ProviderId::Claude,
            detail: "401".into(),
        });
        let r = invoke(&p, &image(), SheetKind::CandidateSheet, &fast_config()).await;
        assert!(!r.success);
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_retried_then_succeeds() {
        let mut p = Scripted::new(100);
        p.slow_calls = 1;
        let r = invoke(&p, &image(), SheetKind::CandidateSheet, &fast_config()).await;
        assert!(r.success);
        assert_eq!(r.attempts, 2);
    }

    #[tokio::test]
    async fn persistent_timeout_reports_attempts() {
        let mut p = Scripted::new(100);
        p.slow_calls = usize::MAX;
        let r = invoke(&p, &image(), SheetKind::CandidateSheet, &fast_config()).await;
        assert!(!r.success);
        assert_eq!(
            r.error,
            Some(ProviderError::Timeout {
                provider: ProviderId::Claude,
                secs: 1,
                attempts: 2
            })
        );
    }
}

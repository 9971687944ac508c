//! Google Gemini adapter.
//!
//! Talks to the `generateContent` REST endpoint directly instead of going
//! through edgequake-llm, because structured output (`responseMimeType` +
//! `responseSchema`) is what makes Gemini reliable here: the model is
//! constrained to emit exactly the answer object, so the text repair pass
//! rarely has anything to do.

use crate::config::{ExtractionConfig, ProviderId, SheetKind};
use crate::error::ProviderError;
use crate::pipeline::encode::to_base64;
use crate::pipeline::preprocess::PreprocessedImage;
use crate::prompts::{build_prompt, SYSTEM_PROMPT};
use crate::providers::{reply_from_text, ProviderReply, VisionProvider};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Confidence assigned when the reply carries none.
pub const DEFAULT_CONFIDENCE: f32 = 0.85;

pub struct GoogleProvider {
    http: Option<reqwest::Client>,
    api_key: Option<String>,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: usize,
}

impl GoogleProvider {
    /// Reads `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
    pub fn from_config(config: &ExtractionConfig) -> Self {
        let key = ProviderId::Google
            .credential_vars()
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()));
        Self::new(key, config)
    }

    /// Build with an explicit key; `None` leaves the provider unavailable.
    pub fn new(api_key: Option<String>, config: &ExtractionConfig) -> Self {
        // The HTTP timeout is a backstop; the per-attempt limit is enforced
        // by the invocation wrapper.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.saturating_add(5)))
            .build()
            .ok();
        Self {
            http,
            api_key,
            model: config.gemini_model.clone(),
            base_url: BASE_URL.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Point at a different endpoint (proxy, regional gateway, test server).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.base_url, self.model)
    }

    /// JSON body of a `generateContent` request.
    pub fn request_body(&self, image: &PreprocessedImage, kind: SheetKind) -> Value {
        json!({
            "systemInstruction": {"parts": [{"text": SYSTEM_PROMPT}]},
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": build_prompt(kind, ProviderId::Google)},
                    {"inline_data": {
                        "mime_type": image.media_type().as_mime(),
                        "data": to_base64(image),
                    }}
                ]
            }],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_tokens,
                "responseMimeType": "application/json",
                "responseSchema": response_schema(),
            }
        })
    }
}

/// Output schema Gemini is constrained to.
pub fn response_schema() -> Value {
    let code = json!({"type": "STRING"});
    json!({
        "type": "OBJECT",
        "properties": {
            "codes": {
                "type": "OBJECT",
                "properties": {
                    "candidateId": code,
                    "classroomCode": code,
                    "proctorId": code,
                    "sheetCode": code,
                    "admissionProcess": code,
                },
                "required": ["candidateId", "classroomCode", "proctorId", "sheetCode", "admissionProcess"]
            },
            "answers": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "questionNumber": {"type": "INTEGER"},
                        "answer": {"type": "STRING", "description": "A-E, or empty string if blank or invalid"},
                        "confidence": {"type": "NUMBER"}
                    },
                    "required": ["questionNumber", "answer"]
                }
            }
        },
        "required": ["codes", "answers"]
    })
}

#[async_trait]
impl VisionProvider for GoogleProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Google
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some() && self.http.is_some()
    }

    async fn extract_answers(
        &self,
        image: &PreprocessedImage,
        kind: SheetKind,
    ) -> Result<ProviderReply, ProviderError> {
        let (Some(http), Some(key)) = (&self.http, &self.api_key) else {
            return Err(ProviderError::Unavailable {
                provider: ProviderId::Google,
                detail: self.availability_hint(),
            });
        };

        let response = http
            .post(self.endpoint())
            .header("x-goog-api-key", key)
            .json(&self.request_body(image, kind))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let (text, diagnostic) = reply_text(&body, &self.model)?;
        reply_from_text(ProviderId::Google, &text, DEFAULT_CONFIDENCE, diagnostic)
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout {
            provider: ProviderId::Google,
            secs: 0,
            attempts: 1,
        }
    } else {
        ProviderError::Unavailable {
            provider: ProviderId::Google,
            detail: e.to_string(),
        }
    }
}

/// Map a non-2xx reply. 408/504 are the backend giving up on time and are
/// retried like a local timeout.
fn status_error(status: StatusCode, body: &str) -> ProviderError {
    if matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT) {
        return ProviderError::Timeout {
            provider: ProviderId::Google,
            secs: 0,
            attempts: 1,
        };
    }
    let detail = gemini_error_message(body).unwrap_or_else(|| body.chars().take(200).collect());
    ProviderError::Unavailable {
        provider: ProviderId::Google,
        detail: format!("HTTP {status}: {detail}"),
    }
}

fn gemini_error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: Option<String>,
        status: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match (parsed.error.message, parsed.error.status) {
        (Some(m), Some(s)) => Some(format!("{m} ({s})")),
        (Some(m), None) => Some(m),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<Usage>,
    model_version: Option<String>,
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Usage {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

/// Pull the generated text and diagnostics out of a `generateContent` reply.
fn reply_text(body: &str, model: &str) -> Result<(String, Map<String, Value>), ProviderError> {
    let unavailable = |detail: String| ProviderError::Unavailable {
        provider: ProviderId::Google,
        detail,
    };
    let payload: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| unavailable(format!("malformed generateContent reply: {e}")))?;

    let Some(candidate) = payload.candidates.first() else {
        let feedback = payload
            .prompt_feedback
            .map(|f| f.to_string())
            .unwrap_or_else(|| "none".into());
        return Err(unavailable(format!("no candidate returned (prompt feedback: {feedback})")));
    };

    let text: String = candidate
        .content
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .collect();
    if text.trim().is_empty() {
        return Err(unavailable(format!(
            "empty candidate (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    let mut diagnostic = Map::new();
    diagnostic.insert(
        "model".into(),
        json!(payload.model_version.as_deref().unwrap_or(model)),
    );
    if let Some(reason) = &candidate.finish_reason {
        diagnostic.insert("finish_reason".into(), json!(reason));
    }
    if let Some(usage) = payload.usage_metadata {
        diagnostic.insert("input_tokens".into(), json!(usage.prompt_token_count));
        diagnostic.insert("output_tokens".into(), json!(usage.candidates_token_count));
    }
    debug!("gemini: {} chars of structured output", text.len());
    Ok((text, diagnostic))
}

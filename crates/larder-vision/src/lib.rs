//! Recognition service client.
//!
//! Sends one photo to a generative vision model and returns the raw text it answered with.
//! Parsing that text into observations is the core crate's job.

use std::io;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use larder_core::{CategoryConfig, LarderError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Finish reasons that mean the model stopped without a usable answer.
const UNUSABLE_FINISH_REASONS: [&str; 5] =
    ["SAFETY", "RECITATION", "MAX_TOKENS", "BLOCKLIST", "PROHIBITED_CONTENT"];

/// Recognition service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Base URL of the model API, without a trailing slash.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Whole-request deadline in seconds (default: 30)
    pub timeout_secs: u64,
    pub max_output_tokens: u32,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-1.5-flash".to_string(),
            api_key_env: "LARDER_VISION_API_KEY".to_string(),
            timeout_secs: 30,
            max_output_tokens: 2048,
        }
    }
}

/// Turns one image into the recognition service's raw text answer.
pub trait Recognizer {
    /// # Errors
    /// Returns `UpstreamTimeout`, `UpstreamError`, or `EmptyResponse` when no usable text came
    /// back. Partial answers are never returned.
    fn recognize(&self, image: &[u8], mime_type: &str) -> Result<String, LarderError>;
}

impl<F> Recognizer for F
where
    F: Fn(&[u8], &str) -> Result<String, LarderError>,
{
    fn recognize(&self, image: &[u8], mime_type: &str) -> Result<String, LarderError> {
        self(image, mime_type)
    }
}

/// Blocking HTTP client for a `generateContent`-style vision endpoint.
pub struct HttpRecognizer {
    agent: ureq::Agent,
    url: String,
    api_key: String,
    prompt: String,
    max_output_tokens: u32,
}

impl std::fmt::Debug for HttpRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRecognizer").field("url", &self.url).finish_non_exhaustive()
    }
}

impl HttpRecognizer {
    /// Build a client, reading the API key from the configured environment variable.
    ///
    /// # Errors
    /// Returns an error when the key variable is unset or empty, or the timeout is zero.
    pub fn from_config(config: &RecognizerConfig, categories: &CategoryConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("recognizer API key variable `{}` is not set", config.api_key_env)
            })?;
        Self::with_api_key(config, categories, api_key)
    }

    /// # Errors
    /// Returns an error when the timeout is zero.
    pub fn with_api_key(
        config: &RecognizerConfig,
        categories: &CategoryConfig,
        api_key: String,
    ) -> Result<Self> {
        if config.timeout_secs == 0 {
            return Err(anyhow!("recognizer timeout_secs MUST be > 0"));
        }

        let agent =
            ureq::AgentBuilder::new().timeout(Duration::from_secs(config.timeout_secs)).build();

        Ok(Self {
            agent,
            url: format!(
                "{}/models/{}:generateContent",
                config.endpoint.trim_end_matches('/'),
                config.model
            ),
            api_key,
            prompt: build_prompt(categories),
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn request_body(&self, image: &[u8], mime_type: &str) -> Value {
        json!({
            "contents": [{
                "parts": [
                    { "text": self.prompt },
                    { "inline_data": {
                        "mime_type": mime_type,
                        "data": general_purpose::STANDARD.encode(image),
                    } },
                ],
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "maxOutputTokens": self.max_output_tokens,
                "temperature": 0.2,
            },
        })
    }
}

impl Recognizer for HttpRecognizer {
    fn recognize(&self, image: &[u8], mime_type: &str) -> Result<String, LarderError> {
        if image.is_empty() {
            return Err(LarderError::Validation("image payload MUST be non-empty".to_string()));
        }
        tracing::debug!(bytes = image.len(), mime_type, "sending image to recognition service");

        let response = self
            .agent
            .post(&self.url)
            .set("x-goog-api-key", &self.api_key)
            .send_json(self.request_body(image, mime_type))
            .map_err(map_request_error)?;

        let envelope = response.into_json::<Value>().map_err(|err| {
            if is_timeout_io(&err) {
                LarderError::UpstreamTimeout(err.to_string())
            } else {
                LarderError::MalformedResponse(format!("response envelope is not JSON: {err}"))
            }
        })?;

        extract_candidate_text(&envelope)
    }
}

fn map_request_error(err: ureq::Error) -> LarderError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            // Size only; error bodies can echo request content.
            tracing::warn!(status, bytes = body.len(), "recognition service returned an error");
            let detail = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|value| {
                    value.pointer("/error/message").and_then(Value::as_str).map(str::to_string)
                })
                .unwrap_or_else(|| format!("HTTP {status}"));
            LarderError::UpstreamError { status, detail }
        }
        ureq::Error::Transport(transport) => {
            if is_timeout_transport(&transport) {
                tracing::warn!("recognition service call timed out");
                LarderError::UpstreamTimeout(transport.to_string())
            } else {
                tracing::warn!(kind = ?transport.kind(), "recognition service unreachable");
                LarderError::UpstreamError { status: 0, detail: transport.to_string() }
            }
        }
    }
}

fn is_timeout_io(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn is_timeout_transport(transport: &ureq::Transport) -> bool {
    let mut source = std::error::Error::source(transport);
    while let Some(err) = source {
        if err.downcast_ref::<io::Error>().is_some_and(is_timeout_io) {
            return true;
        }
        source = err.source();
    }
    transport.to_string().contains("timed out")
}

/// Pull the answer text out of a `generateContent` response envelope.
///
/// # Errors
/// Returns `EmptyResponse` for blocked prompts, missing candidates, safety or length stops,
/// and candidates without text.
pub fn extract_candidate_text(envelope: &Value) -> Result<String, LarderError> {
    if let Some(reason) = envelope.pointer("/promptFeedback/blockReason").and_then(Value::as_str)
    {
        return Err(LarderError::EmptyResponse(format!("prompt blocked: {reason}")));
    }

    let Some(candidate) =
        envelope.get("candidates").and_then(Value::as_array).and_then(|candidates| candidates.first())
    else {
        return Err(LarderError::EmptyResponse("no candidates returned".to_string()));
    };

    let finish_reason = candidate.get("finishReason").and_then(Value::as_str);
    if let Some(reason) = finish_reason.filter(|reason| UNUSABLE_FINISH_REASONS.contains(reason)) {
        return Err(LarderError::EmptyResponse(format!("candidate stopped early: {reason}")));
    }

    let text = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts.iter().filter_map(|part| part.get("text").and_then(Value::as_str)).collect::<String>()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(LarderError::EmptyResponse(format!(
            "candidate has no text (finish reason {})",
            finish_reason.unwrap_or("unspecified")
        )));
    }
    Ok(text)
}

/// Instruction sent alongside every photo.
#[must_use]
pub fn build_prompt(categories: &CategoryConfig) -> String {
    let supported = categories
        .supported
        .iter()
        .map(|category| category.trim().to_lowercase())
        .filter(|category| !category.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "List every distinct food item visible in this photo of a fridge or pantry. \
         Respond with JSON only, shaped as {{\"items\": [{{\"name\": string, \"quantity\": integer, \
         \"expiresInDays\": integer, \"category\": string, \"boundingBox\": [x, y, width, height]}}]}}. \
         Use one of these categories: {supported}. Estimate expiresInDays from typical shelf \
         life. boundingBox values are fractions of the image size between 0 and 1."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(result: Result<String, LarderError>) -> &'static str {
        match result {
            Ok(text) => panic!("expected an error, got text `{text}`"),
            Err(err) => err.kind(),
        }
    }

    #[test]
    fn candidate_text_parts_are_concatenated() {
        let envelope = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"items\":" }, { "text": "[]}" }] },
                "finishReason": "STOP",
            }],
        });
        match extract_candidate_text(&envelope) {
            Ok(text) => assert_eq!(text, "{\"items\":[]}"),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn blocked_prompt_is_an_empty_response() {
        let envelope = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert_eq!(kind_of(extract_candidate_text(&envelope)), "empty_response");
    }

    #[test]
    fn missing_candidates_is_an_empty_response() {
        assert_eq!(kind_of(extract_candidate_text(&json!({ "candidates": [] }))), "empty_response");
        assert_eq!(kind_of(extract_candidate_text(&json!({}))), "empty_response");
    }

    #[test]
    fn truncated_or_filtered_candidates_are_empty_responses() {
        for reason in ["MAX_TOKENS", "SAFETY"] {
            let envelope = json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "{\"items\": [{\"name\": \"Mi" }] },
                    "finishReason": reason,
                }],
            });
            let Err(err) = extract_candidate_text(&envelope) else {
                panic!("{reason} should not yield text");
            };
            assert_eq!(err.kind(), "empty_response");
            assert!(err.to_string().contains(reason));
        }
    }

    #[test]
    fn whitespace_only_text_is_an_empty_response() {
        let envelope = json!({ "candidates": [{ "content": { "parts": [{ "text": "  \n" }] } }] });
        assert_eq!(kind_of(extract_candidate_text(&envelope)), "empty_response");
    }

    #[test]
    fn prompt_lists_configured_categories() {
        let categories = CategoryConfig {
            supported: vec!["Produce".to_string(), " dairy ".to_string()],
            default_category: "produce".to_string(),
        };
        let prompt = build_prompt(&categories);
        assert!(prompt.contains("produce, dairy"));
        assert!(prompt.contains("\"items\""));
    }

    #[test]
    fn request_body_inlines_base64_image() {
        let recognizer = match HttpRecognizer::with_api_key(
            &RecognizerConfig::default(),
            &CategoryConfig::default(),
            "test-key".to_string(),
        ) {
            Ok(recognizer) => recognizer,
            Err(err) => panic!("client should build: {err}"),
        };
        assert!(recognizer.url.ends_with("/models/gemini-1.5-flash:generateContent"));

        let body = recognizer.request_body(b"abc", "image/jpeg");
        assert_eq!(body.pointer("/contents/0/parts/1/inline_data/data"), Some(&json!("YWJj")));
        assert_eq!(body.pointer("/generationConfig/maxOutputTokens"), Some(&json!(2048)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = RecognizerConfig { timeout_secs: 0, ..RecognizerConfig::default() };
        assert!(
            HttpRecognizer::with_api_key(&config, &CategoryConfig::default(), "k".to_string())
                .is_err()
        );
    }

    #[test]
    fn unreachable_endpoint_maps_to_upstream_error() {
        let config = RecognizerConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..RecognizerConfig::default()
        };
        let recognizer =
            match HttpRecognizer::with_api_key(&config, &CategoryConfig::default(), "k".to_string()) {
                Ok(recognizer) => recognizer,
                Err(err) => panic!("client should build: {err}"),
            };
        let Err(err) = recognizer.recognize(b"jpeg", "image/jpeg") else {
            panic!("nothing listens on the discard port");
        };
        assert!(matches!(
            err,
            LarderError::UpstreamError { status: 0, .. } | LarderError::UpstreamTimeout(_)
        ));
    }

    #[test]
    fn closures_act_as_recognizers() {
        let canned = |_: &[u8], _: &str| Ok::<_, LarderError>("{\"items\": []}".to_string());
        match canned.recognize(b"x", "image/png") {
            Ok(text) => assert_eq!(text, "{\"items\": []}"),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
}

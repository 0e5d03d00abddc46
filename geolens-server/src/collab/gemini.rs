//! Google Gemini reasoning collaborator.
//!
//! Uses `streamGenerateContent` (SSE) for the incremental reasoning and chat
//! narratives, and plain `generateContent` for coordinate extraction. Images
//! travel inline as base64 parts.

use super::{BoxFragmentStream, CoordinateOutput, FragmentStream, ReasoningModel};
use crate::upload::ImagePayload;
use async_trait::async_trait;
use base64::Engine;
use futures_util::{Stream, StreamExt};
use geolens_common::config::GeminiConfig;
use geolens_common::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini-backed reasoning model.
pub struct GeminiModel {
    api_key: Option<String>,
    model: String,
    base_url: String,
    client: Client,
}

// ══════════════════════════════════════════════════════════════════════════════
// API REQUEST/RESPONSE TYPES
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GeminiModel {
    /// Create a model client from configuration.
    ///
    /// Key resolution: explicit config value, then `GEMINI_API_KEY`, then
    /// `GOOGLE_API_KEY`.
    pub fn new(config: &GeminiConfig) -> Self {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok());

        Self {
            api_key,
            model: config.model.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Point the client at a different API host (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Whether any Gemini authentication is available.
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            Error::Config(
                "Gemini API key not found. Set GEMINI_API_KEY or GOOGLE_API_KEY.".into(),
            )
        })
    }

    fn request_body(prompt: &str, image: Option<&ImagePayload>) -> GenerateContentRequest {
        let mut parts = vec![Part {
            text: Some(prompt.to_string()),
            inline_data: None,
        }];
        if let Some(image) = image {
            parts.push(Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: image.mime.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(&image.bytes),
                }),
            });
        }
        GenerateContentRequest {
            contents: vec![Content { parts }],
        }
    }
}

fn response_text(response: GenerateContentResponse) -> Result<String> {
    if let Some(err) = response.error {
        return Err(Error::External(format!("Gemini API error: {}", err.message)));
    }
    let text = response
        .candidates
        .into_iter()
        .flatten()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .filter_map(|p| p.text)
        .collect::<String>();
    Ok(text)
}

#[async_trait]
impl ReasoningModel for GeminiModel {
    async fn stream(&self, prompt: &str, image: &ImagePayload) -> Result<BoxFragmentStream> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&Self::request_body(prompt, Some(image)))
            .send()
            .await
            .map_err(|e| Error::External(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "Gemini API error ({}): {}",
                status.as_u16(),
                body
            )));
        }

        let byte_stream = response.bytes_stream().map(|r| r.map(|b| b.to_vec()));
        Ok(Box::new(GeminiStream {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
            pending: VecDeque::new(),
            done: false,
        }))
    }

    async fn infer_coordinates(&self, reasoning: &str) -> Result<CoordinateOutput> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        );

        let prompt = crate::prompt::coordinates_prompt(reasoning);
        let response = self
            .client
            .post(&url)
            .json(&Self::request_body(&prompt, None))
            .send()
            .await
            .map_err(|e| Error::External(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "Gemini API error ({}): {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| Error::External(format!("Failed to parse Gemini response: {e}")))?;
        Ok(CoordinateOutput::Full(response_text(parsed)?))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// SSE FRAGMENT STREAM
// ══════════════════════════════════════════════════════════════════════════════

type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Vec<u8>, reqwest::Error>> + Send>>;

/// Lazy fragment stream over a Gemini SSE response.
///
/// SSE events are separated by blank lines; each carries a `data:` line with
/// one `GenerateContentResponse` delta whose text parts form the fragment.
struct GeminiStream {
    inner: ByteStream,
    buffer: String,
    pending: VecDeque<String>,
    done: bool,
}

impl GeminiStream {
    /// Parse complete SSE events out of the buffer into pending fragments.
    fn drain_buffer(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let event_text = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);

            for line in event_text.lines() {
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }
                if let Some(fragment) = parse_sse_fragment(payload) {
                    if !fragment.is_empty() {
                        self.pending.push_back(fragment);
                    }
                }
            }
        }
    }
}

/// Extract the text delta from one SSE data payload. Malformed payloads are
/// skipped rather than failing the stream.
fn parse_sse_fragment(payload: &str) -> Option<String> {
    let response: GenerateContentResponse = serde_json::from_str(payload).ok()?;
    response_text(response).ok()
}

#[async_trait]
impl FragmentStream for GeminiStream {
    async fn next_fragment(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Ok(Some(fragment));
            }
            if self.done {
                return Ok(None);
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    self.drain_buffer();
                }
                Some(Err(err)) => {
                    return Err(Error::External(format!("Gemini stream error: {err}")));
                }
                None => {
                    self.done = true;
                    // Flush any final event not terminated by a blank line
                    if !self.buffer.ends_with("\n\n") {
                        self.buffer.push_str("\n\n");
                    }
                    self.drain_buffer();
                }
            }
        }
    }
}

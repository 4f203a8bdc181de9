//! Story generation over the Gemini generateContent API.
//!
//! Default model: `gemini-3-flash-preview`. Streaming uses the SSE flavor of
//! the endpoint; each event carries a text delta that is forwarded as-is,
//! reassembly is the caller's business.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use skazka_core::{GenerationInput, StoryBackend, StoryError, StoryResult};
use tokio::sync::mpsc;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
/// Response steering for the single-payload flavor, which the caller parses
/// as one JSON object.
const JSON_MIME: &str = "application/json";

// Wire shapes for generateContent
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Gemini-backed story generation.
pub struct GeminiStoryBackend {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiStoryBackend {
    /// Create a backend from `GEMINI_API_KEY` (or the legacy `API_KEY`).
    /// Returns `None` if no key is set, so callers can fall back to the
    /// offline placeholder.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("API_KEY"))
            .ok()?;
        let key = key.trim().to_string();
        if key.is_empty() {
            return None;
        }
        Some(Self::new(key))
    }

    pub fn new(api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key: api_key.trim().to_string(),
            model: DEFAULT_MODEL.to_string(),
            client,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }
}

fn request_body(input: &GenerationInput, response_mime_type: Option<&str>) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content {
            parts: vec![Part {
                text: input.prompt.clone(),
            }],
        }],
        system_instruction: Some(Content {
            parts: vec![Part {
                text: input.system_instruction.clone(),
            }],
        }),
        generation_config: Some(GenerationConfig {
            temperature: input.temperature,
            response_mime_type: response_mime_type.map(str::to_string),
        }),
    }
}

/// Pull the text delta out of one SSE payload. Multi-part candidates are
/// concatenated; events without text (safety metadata, usage) yield `None`.
fn extract_text(payload: &str) -> Option<String> {
    let parsed: GenerateResponse = serde_json::from_str(payload).ok()?;
    let candidate = parsed.candidates.into_iter().next()?;
    let mut text = String::new();
    for part in candidate.content?.parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
    }
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait::async_trait]
impl StoryBackend for GeminiStoryBackend {
    async fn open_stream(
        &self,
        input: &GenerationInput,
    ) -> StoryResult<mpsc::Receiver<StoryResult<String>>> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            GEMINI_API_BASE, self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(input, None))
            .send()
            .await
            .map_err(|e| StoryError::Generation(format!("stream request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoryError::Generation(format!(
                "Gemini API error {}: {}",
                status, body
            )));
        }

        tracing::debug!(model = %self.model, "story stream opened");
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            // SSE format: "data: {...}\n\n". One JSON payload may span TCP
            // chunks, so only complete lines leave the carry buffer.
            let mut pending = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(StoryError::Generation(format!(
                                "stream interrupted: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = pending.find('\n') {
                    let line: String = pending.drain(..=newline).collect();
                    let line = line.trim_end();
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Some(text) = extract_text(payload) {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn generate(&self, input: &GenerationInput) -> StoryResult<String> {
        let url = format!("{}/models/{}:generateContent", GEMINI_API_BASE, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(input, Some(JSON_MIME)))
            .send()
            .await
            .map_err(|e| StoryError::Generation(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoryError::Generation(format!(
                "Gemini API error {}: {}",
                status, body
            )));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| StoryError::Generation(format!("response read failed: {}", e)))?;
        extract_text(&raw).ok_or_else(|| StoryError::Generation("model returned no text".into()))
    }
}

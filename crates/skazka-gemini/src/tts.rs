//! Speech synthesis over the Gemini TTS preview model.
//!
//! The response carries base64 mono 16-bit PCM at 24 kHz inline; it is
//! wrapped into an [`AudioClip`] untouched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use skazka_core::{AudioClip, StoryError, StoryResult, TtsBackend, Voice};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechRequest {
    contents: Vec<Content>,
    generation_config: SpeechGenerationConfig,
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
struct SpeechGenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Deserialize)]
struct SpeechResponse {
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
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct InlineData {
    data: String,
}

/// Gemini-backed narration.
pub struct GeminiTts {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiTts {
    /// Create a backend from `GEMINI_API_KEY` (or the legacy `API_KEY`).
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
            model: DEFAULT_TTS_MODEL.to_string(),
            client,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }
}

fn request_body(text: &str, voice: Voice) -> SpeechRequest {
    SpeechRequest {
        contents: vec![Content {
            parts: vec![Part {
                text: text.to_string(),
            }],
        }],
        generation_config: SpeechGenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice.wire_name().to_string(),
                    },
                },
            },
        },
    }
}

fn extract_audio(response: SpeechResponse) -> Option<String> {
    response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .find_map(|part| part.inline_data)
        .map(|inline| inline.data)
}

#[async_trait::async_trait]
impl TtsBackend for GeminiTts {
    async fn synthesize(&self, text: &str, voice: Voice) -> StoryResult<AudioClip> {
        let url = format!("{}/models/{}:generateContent", GEMINI_API_BASE, self.model);
        tracing::debug!(voice = voice.wire_name(), chars = text.chars().count(), "synthesizing narration");
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(text, voice))
            .send()
            .await
            .map_err(|e| StoryError::Synthesis(format!("TTS request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoryError::Synthesis(format!(
                "Gemini TTS error {}: {}",
                status, body
            )));
        }

        let parsed: SpeechResponse = response
            .json()
            .await
            .map_err(|e| StoryError::Synthesis(format!("TTS response parse failed: {}", e)))?;
        let data = extract_audio(parsed)
            .ok_or_else(|| StoryError::Synthesis("no audio data received".into()))?;
        Ok(AudioClip::new(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_names_the_voice_and_asks_for_audio() {
        let json = serde_json::to_string(&request_body("Жил-был кот.", Voice::Fenrir)).unwrap();
        assert!(json.contains("\"responseModalities\":[\"AUDIO\"]"));
        assert!(json.contains("\"voiceName\":\"Fenrir\""));
        assert!(json.contains("Жил-был кот."));
    }

    #[test]
    fn pulls_inline_audio_out_of_the_response() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"AAAA"}}]}}]}"#;
        let parsed: SpeechResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_audio(parsed).as_deref(), Some("AAAA"));
    }

    #[test]
    fn empty_response_yields_no_audio() {
        let parsed: SpeechResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert_eq!(extract_audio(parsed), None);
    }
}

//! Adapter seams for the three external collaborators
//!
//! The orchestrator only ever talks to these traits; binaries inject the
//! HTTP-backed implementations and tests inject channel-driven fakes. The
//! placeholder implementations here keep the whole pipeline usable offline.

use tokio::sync::mpsc;

use crate::audio::{AudioClip, SAMPLE_RATE_HZ};
use crate::error::StoryResult;
use crate::types::{AuthUser, Story, UserProfile, Voice};

/// Input contract of the generation backend: assembled prompt, fixed system
/// instruction, sampling temperature.
#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub prompt: String,
    pub system_instruction: String,
    pub temperature: f32,
}

/// Text-generation backend.
#[async_trait::async_trait]
pub trait StoryBackend: Send + Sync {
    /// Open one streaming generation. Raw text fragments arrive on the
    /// returned channel in emission order. An `Err` item is terminal for the
    /// stream; channel close without one means the stream completed.
    async fn open_stream(
        &self,
        input: &GenerationInput,
    ) -> StoryResult<mpsc::Receiver<StoryResult<String>>>;

    /// Single-shot generation returning the full raw model text. The caller
    /// parses it as one JSON `{title, content}` payload, so implementations
    /// steer the model toward JSON output.
    async fn generate(&self, input: &GenerationInput) -> StoryResult<String>;
}

/// Backend that narrates story text with a named voice.
#[async_trait::async_trait]
pub trait TtsBackend: Send + Sync {
    async fn synthesize(&self, text: &str, voice: Voice) -> StoryResult<AudioClip>;
}

/// Identity/session and story persistence backend.
#[async_trait::async_trait]
pub trait SessionGateway: Send + Sync {
    /// Restore a previously established session, if one exists.
    async fn restore_session(&self) -> StoryResult<Option<AuthUser>>;

    async fn sign_in(&self, email: &str, password: &str) -> StoryResult<AuthUser>;

    async fn sign_up(&self, email: &str, password: &str) -> StoryResult<AuthUser>;

    async fn sign_out(&self) -> StoryResult<()>;

    /// Fetch the profile row for a session principal.
    async fn fetch_profile(&self, user: &AuthUser) -> StoryResult<UserProfile>;

    /// Change the profile display name.
    async fn update_display_name(&self, user_id: &str, display_name: &str) -> StoryResult<()>;

    /// Create a story row; returns the persisted id.
    async fn create_story(&self, user_id: &str, story: &Story) -> StoryResult<String>;

    /// Stories still inside the retention horizon, newest first.
    async fn list_stories(&self, user_id: &str) -> StoryResult<Vec<Story>>;

    /// Attach narration audio to an already persisted story.
    async fn attach_audio(&self, story_id: &str, audio: &AudioClip) -> StoryResult<()>;

    /// Atomically increment the server-side usage counter.
    async fn record_generation(&self, user_id: &str) -> StoryResult<()>;
}

/// Canned tale emitted by [`PlaceholderStoryBackend`].
const PLACEHOLDER_TALE: &[&str] = &[
    "ЗАГОЛОВОК: Пробная ",
    "сказка\n",
    "СЮЖЕТ: Жил-был маленький рассказчик. ",
    "Он проверял, что всё работает. ",
    "И всё работало, и все были рады.",
];

/// Offline backend: streams one short canned tale. Used when no real
/// generation backend is configured.
#[derive(Debug, Default)]
pub struct PlaceholderStoryBackend;

#[async_trait::async_trait]
impl StoryBackend for PlaceholderStoryBackend {
    async fn open_stream(
        &self,
        _input: &GenerationInput,
    ) -> StoryResult<mpsc::Receiver<StoryResult<String>>> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for fragment in PLACEHOLDER_TALE {
                if tx.send(Ok((*fragment).to_string())).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn generate(&self, _input: &GenerationInput) -> StoryResult<String> {
        Ok(
            "{\"title\": \"Пробная сказка\", \"content\": \"Жил-был маленький рассказчик.\"}"
                .to_string(),
        )
    }
}

/// Placeholder narration: a tenth of a second of silence, so the audio path
/// runs end to end without a speech backend.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait::async_trait]
impl TtsBackend for PlaceholderTts {
    async fn synthesize(&self, _text: &str, _voice: Voice) -> StoryResult<AudioClip> {
        Ok(AudioClip::from_samples(&vec![0i16; SAMPLE_RATE_HZ as usize / 10]))
    }
}

//! skazka-gemini: Gemini REST adapters for the story session core.
//!
//! Two backends over the generativelanguage API: `GeminiStoryBackend`
//! streams story text fragment by fragment, `GeminiTts` synthesizes the
//! narration. API key: `GEMINI_API_KEY` in `.env`.

mod bridge;
mod tts;

pub use bridge::GeminiStoryBackend;
pub use tts::GeminiTts;

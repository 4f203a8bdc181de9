//! skazka-core: session core for the children's story studio.
//!
//! Owns the story state machine (identity, quota, collection, generation
//! lifecycle) behind a single orchestrator. Generation, narration, and the
//! account gateway plug in through the adapter traits, so the core runs
//! unchanged against live backends, placeholders, or test doubles.

mod audio;
mod error;
mod mirror;
mod orchestrator;
mod prompt;
mod quota;
mod stream;
mod traits;
mod types;

// Errors
pub use error::{StoryError, StoryResult};

// Domain types
pub use types::{
    AuthUser, Identity, Scenario, Story, StoryRequest, Tier, UsageRecord, UserProfile, Voice,
};

// Narration payloads (base64 PCM)
pub use audio::{AudioClip, BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE_HZ};

// Quota rules & tier capabilities
pub use quota::{enforce_caps, is_allowed, next_unlock_eta, remaining, TierCaps, UnlockEta};

// Prompt assembly
pub use prompt::{
    build_prompt, DEFAULT_EVENT, DEFAULT_HERO, DEFAULT_PLACE, PLOT_MARKER,
    STRUCTURED_SYSTEM_INSTRUCTION, SYSTEM_INSTRUCTION, TEMPERATURE, TITLE_MARKER,
};

// Streaming reconstruction
pub use stream::{parse_structured_payload, StorySnapshot, StreamAssembler, PROVISIONAL_TITLE};

// Local mirror (sled)
pub use mirror::{MirrorStore, GUEST_USAGE_KEY, HISTORY_KEY, PROFILE_KEY};

// Adapter seams + offline placeholders
pub use traits::{
    GenerationInput, PlaceholderStoryBackend, PlaceholderTts, SessionGateway, StoryBackend,
    TtsBackend,
};

// Session orchestrator
pub use orchestrator::{
    GenerationMode, RejectReason, SessionConfig, SessionEvent, SessionOrchestrator, StoryPhase,
    SubmitOutcome,
};

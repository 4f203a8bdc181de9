//! Shared domain types for the story session core
//!
//! Serde renames keep the JSON shapes aligned with the web client's stored
//! snapshots and the gateway's table rows (`childName`, `isInteractive`,
//! `timestamp`, `params`, `audio_data`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::audio::AudioClip;

// -----------------------------------------------------------------------------
// Tiers & identity
// -----------------------------------------------------------------------------

/// Usage class determining generation quota and feature gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// No account; tracked only by a local counter.
    Guest,
    Free,
    Storyteller,
    Wizard,
}

impl Tier {
    /// Human-readable tier name shown in the profile view.
    pub fn label(self) -> &'static str {
        match self {
            Tier::Guest => "Гость",
            Tier::Free => "Бесплатный",
            Tier::Storyteller => "Сказочник",
            Tier::Wizard => "Волшебник",
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Free
    }
}

/// Account snapshot mirrored from the remote `profiles` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub generations_used: u32,
    #[serde(default)]
    pub last_generation_date: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// Minimal profile used when the remote profile fetch fails: lowest paid
    /// tier, zero usage. Keeps the session usable instead of blocking on the
    /// gateway.
    pub fn fallback(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            display_name: None,
            tier: Tier::Free,
            generations_used: 0,
            last_generation_date: None,
        }
    }
}

/// The active identity. Exactly one is active at a time; switching between
/// them goes through the orchestrator's sign-in/sign-out transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Guest,
    User(UserProfile),
}

impl Identity {
    pub fn tier(&self) -> Tier {
        match self {
            Identity::Guest => Tier::Guest,
            Identity::User(profile) => profile.tier,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest)
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        match self {
            Identity::Guest => None,
            Identity::User(profile) => Some(profile),
        }
    }
}

/// Principal returned by gateway auth calls before the profile row is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

// -----------------------------------------------------------------------------
// Request fields
// -----------------------------------------------------------------------------

/// Story setting offered by the scenario picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Space,
    Forest,
    Underwater,
    Castle,
    Dinosaurs,
    /// Free-form setting; hero/place/event come from the request.
    Custom,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::Space,
        Scenario::Forest,
        Scenario::Underwater,
        Scenario::Castle,
        Scenario::Dinosaurs,
        Scenario::Custom,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Scenario::Space => "Космос",
            Scenario::Forest => "Лес",
            Scenario::Underwater => "Океан",
            Scenario::Castle => "Замок",
            Scenario::Dinosaurs => "Динозавры",
            Scenario::Custom => "Свой сюжет",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Scenario::Space => "🚀",
            Scenario::Forest => "🌲",
            Scenario::Underwater => "🌊",
            Scenario::Castle => "🏰",
            Scenario::Dinosaurs => "🦕",
            Scenario::Custom => "✨",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label(), self.icon())
    }
}

/// Narrator voice. Variant names are the wire identifiers the speech model
/// expects, so the default serde representation is also the wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Voice {
    Kore,
    Puck,
    Fenrir,
    Aoede,
}

impl Voice {
    /// Voices offered by the picker. `Aoede` stays reachable on the wire but
    /// is not listed.
    pub const SELECTABLE: [Voice; 3] = [Voice::Kore, Voice::Puck, Voice::Fenrir];

    pub fn label(self) -> &'static str {
        match self {
            Voice::Kore => "Мария (Мягкий)",
            Voice::Puck => "Иван (Игривый)",
            Voice::Fenrir => "Сказочник (Бас)",
            Voice::Aoede => "Аэда (Звонкий)",
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Voice::Kore => "Kore",
            Voice::Puck => "Puck",
            Voice::Fenrir => "Fenrir",
            Voice::Aoede => "Aoede",
        }
    }
}

impl Default for Voice {
    fn default() -> Self {
        Voice::Kore
    }
}

/// Immutable input for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRequest {
    pub child_name: String,
    pub scenario: Scenario,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_hero: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_place: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_event: Option<String>,
    #[serde(default)]
    pub voice: Voice,
    #[serde(default, rename = "isInteractive")]
    pub interactive: bool,
}

impl StoryRequest {
    /// Request with defaults for everything except the child's name.
    pub fn named(child_name: impl Into<String>, scenario: Scenario) -> Self {
        Self {
            child_name: child_name.into(),
            scenario,
            custom_hero: None,
            custom_place: None,
            custom_event: None,
            voice: Voice::default(),
            interactive: false,
        }
    }
}

// -----------------------------------------------------------------------------
// Stories
// -----------------------------------------------------------------------------

/// One generated tale.
///
/// Mutated only by the orchestrator: title/content are progressively replaced
/// while the stream is open, then the background tasks patch in the persisted
/// id and the narration payload. Across those mutations the story is tracked
/// by `created_at` (epoch milliseconds), because the id arrives asynchronously
/// after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    /// Remote identifier, present once a create call has succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub content: String,
    #[serde(default, rename = "audio_data", skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<AudioClip>,
    /// Creation time in epoch milliseconds; unique within a collection.
    #[serde(rename = "timestamp")]
    pub created_at: i64,
    #[serde(rename = "params")]
    pub request: StoryRequest,
}

impl Story {
    pub fn has_audio(&self) -> bool {
        self.audio_data.is_some()
    }
}

/// Usage counters feeding quota decisions. Server-owned for authenticated
/// identities and mirrored locally; mirror-owned for guests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub count: u32,
    #[serde(default)]
    pub last_generation_at: Option<DateTime<Utc>>,
}

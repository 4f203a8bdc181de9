//! Session orchestrator: the state machine that owns the story session
//!
//! One orchestrator instance is constructed at process start and owns the
//! in-memory identity, story collection, and quota state. Everything else
//! observes it through the event channel or the snapshot accessors; nothing
//! else writes that state. The generation lifecycle, the background
//! persistence/narration tasks, and the identity transitions live in the
//! submodules.

mod background;
mod identity;
mod lifecycle;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};

use crate::error::{StoryError, StoryResult};
use crate::mirror::MirrorStore;
use crate::quota::{self, UnlockEta};
use crate::traits::{SessionGateway, StoryBackend, TtsBackend};
use crate::types::{Identity, Story, StoryRequest, UsageRecord, UserProfile};

pub use lifecycle::{RejectReason, SubmitOutcome};

// ---------------------------------------------------------------------------
// Phases & events
// ---------------------------------------------------------------------------

/// View-facing lifecycle phase of the current generation.
///
/// The success path is Idle → Requesting → Streaming → Ready. The view is
/// promoted to `Ready` on the first chunk that carries text, while the stream
/// keeps running underneath; `stream_active` in the session state tracks that
/// inner flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryPhase {
    Idle,
    Requesting,
    Streaming,
    Ready,
    Failed,
}

impl StoryPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryPhase::Idle => "idle",
            StoryPhase::Requesting => "requesting",
            StoryPhase::Streaming => "streaming",
            StoryPhase::Ready => "ready",
            StoryPhase::Failed => "failed",
        }
    }
}

/// Events emitted to the view layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(StoryPhase),

    /// Latest full reconstruction of the story being generated. Replaces the
    /// displayed title/content wholesale; never an increment.
    StoryProgress { title: String, content: String },

    /// The stream finished and the finalized story entered the collection.
    StoryCompleted { created_at: i64 },

    /// A background task patched a story (persisted id or narration audio).
    StoryPatched { created_at: i64 },

    /// Narration failed; the story stays readable without audio.
    AudioUnavailable { created_at: i64 },

    /// The story collection was replaced or reordered.
    HistoryChanged,

    /// The active identity changed (sign-in, sign-out, profile refresh).
    IdentityChanged(Identity),

    /// A locally mirrored profile was loaded before the session was
    /// confirmed. Display only; quota still treats the session as guest.
    ProvisionalProfile(UserProfile),

    /// Usage counters moved; `remaining` is already tier-adjusted.
    UsageChanged { remaining: u32 },

    /// User-facing message, shown verbatim.
    Notice {
        message: String,
        prompt_sign_in: bool,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which flavor the generation backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationMode {
    /// Incremental fragments parsed for title/plot markers.
    #[default]
    Streaming,
    /// One JSON payload per attempt, retried exactly once.
    Structured,
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: GenerationMode,
    /// Minimum content length before narration is attempted. Guards against
    /// synthesizing a near-empty aborted stream.
    pub min_narration_chars: usize,
    /// How long the narration task waits for the persisted id before giving
    /// up on the remote audio push.
    pub id_wait_timeout: Duration,
    /// Story history entries kept for guests, oldest evicted first.
    pub guest_history_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: GenerationMode::default(),
            min_narration_chars: 20,
            id_wait_timeout: Duration::from_secs(10),
            guest_history_cap: 2,
        }
    }
}

impl SessionConfig {
    pub fn with_mode(mut self, mode: GenerationMode) -> Self {
        self.mode = mode;
        self
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Orchestrator-owned mutable state. Only this module tree touches it.
pub(crate) struct SessionState {
    pub(crate) identity: Identity,
    /// Newest first.
    pub(crate) stories: Vec<Story>,
    pub(crate) guest_usage: UsageRecord,
    pub(crate) phase: StoryPhase,
    /// True from stream-open until stream-complete, including after the view
    /// was already promoted to `Ready`.
    pub(crate) stream_active: bool,
    /// The story the view is showing, provisional while streaming.
    pub(crate) current: Option<Story>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            identity: Identity::Guest,
            stories: Vec::new(),
            guest_usage: UsageRecord::default(),
            phase: StoryPhase::Idle,
            stream_active: false,
            current: None,
        }
    }

    /// Epoch-millisecond creation stamp, bumped past any collision so the
    /// collection never holds duplicate timestamps.
    pub(crate) fn unique_timestamp(&self, now_ms: i64) -> i64 {
        let mut candidate = now_ms;
        while self.stories.iter().any(|s| s.created_at == candidate)
            || self
                .current
                .as_ref()
                .is_some_and(|s| s.created_at == candidate)
        {
            candidate += 1;
        }
        candidate
    }
}

pub(crate) struct Inner {
    pub(crate) config: SessionConfig,
    pub(crate) backend: Arc<dyn StoryBackend>,
    pub(crate) tts: Arc<dyn TtsBackend>,
    pub(crate) gateway: Option<Arc<dyn SessionGateway>>,
    pub(crate) mirror: Arc<MirrorStore>,
    pub(crate) state: RwLock<SessionState>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
}

impl Inner {
    pub(crate) fn emit(&self, event: SessionEvent) {
        // The receiver disappearing just means nobody is watching anymore.
        let _ = self.events.send(event);
    }

    pub(crate) fn remaining_for(state: &SessionState) -> u32 {
        quota::remaining(&state.identity, &state.guest_usage)
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Owner of the session state machine. Construct once, inject the adapters,
/// then drive it from the view layer.
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    /// Create the orchestrator and the event stream the view subscribes to.
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn StoryBackend>,
        tts: Arc<dyn TtsBackend>,
        gateway: Option<Arc<dyn SessionGateway>>,
        mirror: Arc<MirrorStore>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            backend,
            tts,
            gateway,
            mirror,
            state: RwLock::new(SessionState::new()),
            events,
        });
        (Self { inner }, event_rx)
    }

    /// Load mirrored snapshots for instant display, then validate the session
    /// against the gateway and replace them with authoritative data. Every
    /// failure along the way is absorbed; the session always comes up, in the
    /// worst case as a blank guest.
    pub async fn bootstrap(&self) {
        identity::bootstrap(&self.inner).await
    }

    /// Submit a generation request. Validation failures are reported via the
    /// returned outcome and the event channel; an accepted submission drives
    /// the whole lifecycle in the background.
    pub async fn submit(&self, request: StoryRequest) -> SubmitOutcome {
        lifecycle::submit(&self.inner, request).await
    }

    /// Close the story view. Refused while the stream is still running.
    pub async fn close_story(&self) -> bool {
        lifecycle::close_story(&self.inner).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> StoryResult<()> {
        identity::sign_in(&self.inner, email, password).await
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> StoryResult<()> {
        identity::sign_up(&self.inner, email, password).await
    }

    pub async fn sign_out(&self) -> StoryResult<()> {
        identity::sign_out(&self.inner).await
    }

    /// Change the signed-in profile's display name.
    pub async fn rename_profile(&self, display_name: &str) -> StoryResult<()> {
        identity::rename_profile(&self.inner, display_name).await
    }

    // -- snapshot accessors --------------------------------------------------

    pub async fn phase(&self) -> StoryPhase {
        self.inner.state.read().await.phase
    }

    pub async fn identity(&self) -> Identity {
        self.inner.state.read().await.identity.clone()
    }

    pub async fn current_story(&self) -> Option<Story> {
        self.inner.state.read().await.current.clone()
    }

    pub async fn history(&self) -> Vec<Story> {
        self.inner.state.read().await.stories.clone()
    }

    pub async fn guest_usage(&self) -> UsageRecord {
        self.inner.state.read().await.guest_usage.clone()
    }

    /// Generations left for the active identity.
    pub async fn remaining(&self) -> u32 {
        let state = self.inner.state.read().await;
        Inner::remaining_for(&state)
    }

    /// Whether a submission would currently pass the quota gate.
    pub async fn quota_allows(&self) -> bool {
        let state = self.inner.state.read().await;
        quota::is_allowed(&state.identity, &state.guest_usage)
    }

    /// Countdown to the expected quota unlock, when exhausted. The view
    /// re-reads this at least once per minute while showing it.
    pub async fn unlock_eta(&self) -> Option<UnlockEta> {
        let state = self.inner.state.read().await;
        quota::next_unlock_eta(&state.identity, &state.guest_usage, Utc::now())
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("gateway", &self.inner.gateway.is_some())
            .finish()
    }
}

/// Gateway-required operations bail out early with this when running in
/// guest-only mode (no gateway configured).
pub(crate) fn gateway_required() -> StoryError {
    StoryError::Config("remote session gateway is not configured".into())
}

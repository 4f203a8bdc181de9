//! Generation lifecycle: submit guards, stream consumption, completion
//!
//! One stream per submission. Chunks are handled strictly in arrival order;
//! every snapshot replaces the displayed title/content with the latest full
//! reconstruction. Completion inserts the finalized story, bumps the usage
//! counter once, and fires the two independent background tasks.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::StoryError;
use crate::prompt;
use crate::quota;
use crate::stream::{parse_structured_payload, StorySnapshot, StreamAssembler};
use crate::traits::GenerationInput;
use crate::types::{Identity, Story, StoryRequest};

use super::{background, GenerationMode, Inner, SessionEvent, StoryPhase};

/// Shown when the child-name field is empty.
pub const MSG_EMPTY_NAME: &str = "Пожалуйста, введите имя ребенка";
/// Shown when a guest runs out of quota; paired with a sign-in prompt.
pub const MSG_GUEST_LIMIT: &str = "Лимит гостя исчерпан. Пожалуйста, войдите.";
/// Shown when a signed-in user runs out of quota.
pub const MSG_MEMBER_LIMIT: &str = "Лимит генераций исчерпан. Возвращайтесь позже!";
/// Shown when generation fails after any retry is exhausted.
pub const MSG_GENERATION_FAILED: &str = "Магия немного сбилась. Попробуйте еще раз!";

/// Result of a submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The lifecycle is running; watch the event channel.
    Accepted,
    Rejected(RejectReason),
}

/// Why a submission did not start. Each reason was already reported on the
/// event channel as a user-facing notice where one applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyName,
    QuotaExhausted { sign_in_required: bool },
    /// A stream is still open; the submit control is disabled meanwhile.
    Busy,
}

pub(crate) async fn submit(inner: &Arc<Inner>, request: StoryRequest) -> SubmitOutcome {
    let input = {
        let mut state = inner.state.write().await;

        let busy = matches!(state.phase, StoryPhase::Requesting | StoryPhase::Streaming)
            || state.stream_active;
        if busy {
            return SubmitOutcome::Rejected(RejectReason::Busy);
        }

        if request.child_name.trim().is_empty() {
            inner.emit(SessionEvent::Notice {
                message: MSG_EMPTY_NAME.to_string(),
                prompt_sign_in: false,
            });
            return SubmitOutcome::Rejected(RejectReason::EmptyName);
        }

        if !quota::is_allowed(&state.identity, &state.guest_usage) {
            let guest = state.identity.is_guest();
            inner.emit(SessionEvent::Notice {
                message: if guest { MSG_GUEST_LIMIT } else { MSG_MEMBER_LIMIT }.to_string(),
                prompt_sign_in: guest,
            });
            return SubmitOutcome::Rejected(RejectReason::QuotaExhausted {
                sign_in_required: guest,
            });
        }

        let request = quota::enforce_caps(state.identity.tier(), request);
        let created_at = state.unique_timestamp(Utc::now().timestamp_millis());
        info!(
            child = %request.child_name,
            scenario = %request.scenario,
            created_at,
            "starting story generation"
        );

        state.phase = StoryPhase::Requesting;
        state.current = Some(Story {
            id: None,
            title: String::new(),
            content: String::new(),
            audio_data: None,
            created_at,
            request: request.clone(),
        });
        inner.emit(SessionEvent::PhaseChanged(StoryPhase::Requesting));

        // Each flavor pins its own output contract: the stream parser wants
        // marker lines, the single-payload parser wants one JSON object.
        GenerationInput {
            prompt: prompt::build_prompt(&request),
            system_instruction: match inner.config.mode {
                GenerationMode::Streaming => prompt::SYSTEM_INSTRUCTION,
                GenerationMode::Structured => prompt::STRUCTURED_SYSTEM_INSTRUCTION,
            }
            .to_string(),
            temperature: prompt::TEMPERATURE,
        }
    };

    let task_inner = inner.clone();
    tokio::spawn(async move {
        run_generation(task_inner, input).await;
    });
    SubmitOutcome::Accepted
}

async fn run_generation(inner: Arc<Inner>, input: GenerationInput) {
    match inner.config.mode {
        GenerationMode::Streaming => run_streaming(inner, input).await,
        GenerationMode::Structured => run_structured(inner, input).await,
    }
}

async fn run_streaming(inner: Arc<Inner>, input: GenerationInput) {
    let mut rx = match inner.backend.open_stream(&input).await {
        Ok(rx) => rx,
        Err(err) => return fail_generation(&inner, err).await,
    };

    {
        let mut state = inner.state.write().await;
        state.phase = StoryPhase::Streaming;
        state.stream_active = true;
        inner.emit(SessionEvent::PhaseChanged(StoryPhase::Streaming));
    }

    let mut assembler = StreamAssembler::new();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(fragment) => {
                if let Some(snapshot) = assembler.push(&fragment) {
                    apply_snapshot(&inner, snapshot).await;
                }
            }
            // A mid-stream error is terminal; streaming is never retried.
            Err(err) => return fail_generation(&inner, err).await,
        }
    }

    finish_generation(&inner, assembler.finalize()).await;
}

async fn run_structured(inner: Arc<Inner>, input: GenerationInput) {
    let mut attempt = 0;
    let snapshot = loop {
        attempt += 1;
        let parsed = match inner.backend.generate(&input).await {
            Ok(raw) => parse_structured_payload(&raw),
            Err(err) => Err(err),
        };
        match parsed {
            Ok(snapshot) => break snapshot,
            Err(err) if attempt == 1 => {
                warn!(error = %err, "structured generation failed, retrying once");
            }
            Err(err) => return fail_generation(&inner, err).await,
        }
    };

    {
        let mut state = inner.state.write().await;
        state.phase = StoryPhase::Streaming;
        state.stream_active = true;
        inner.emit(SessionEvent::PhaseChanged(StoryPhase::Streaming));
    }
    apply_snapshot(
        &inner,
        StorySnapshot {
            complete: false,
            ..snapshot.clone()
        },
    )
    .await;
    finish_generation(&inner, snapshot).await;
}

/// Replace the displayed story with the latest reconstruction and promote
/// the view to `Ready` on the first snapshot that carries any text.
async fn apply_snapshot(inner: &Arc<Inner>, snapshot: StorySnapshot) {
    let mut state = inner.state.write().await;
    if let Some(current) = &mut state.current {
        current.title = snapshot.title.clone();
        current.content = snapshot.content.clone();
    }
    inner.emit(SessionEvent::StoryProgress {
        title: snapshot.title.clone(),
        content: snapshot.content.clone(),
    });
    if state.phase == StoryPhase::Streaming && snapshot.has_text() {
        state.phase = StoryPhase::Ready;
        inner.emit(SessionEvent::PhaseChanged(StoryPhase::Ready));
    }
}

/// Terminal failure of the current attempt: discard the partial story and
/// return to `Idle` with a user-facing message.
async fn fail_generation(inner: &Arc<Inner>, err: StoryError) {
    warn!(error = %err, "story generation failed");
    let mut state = inner.state.write().await;
    state.stream_active = false;
    state.current = None;
    state.phase = StoryPhase::Failed;
    inner.emit(SessionEvent::PhaseChanged(StoryPhase::Failed));
    state.phase = StoryPhase::Idle;
    inner.emit(SessionEvent::PhaseChanged(StoryPhase::Idle));
    inner.emit(SessionEvent::Notice {
        message: MSG_GENERATION_FAILED.to_string(),
        prompt_sign_in: false,
    });
}

/// Stream-complete transition. Fires exactly once per stream: the
/// `stream_active` flag is the replay guard, so feeding the same finalized
/// payload twice cannot double-insert or double-increment.
pub(crate) async fn finish_generation(inner: &Arc<Inner>, done: StorySnapshot) {
    let (story, remaining, owner) = {
        let mut state = inner.state.write().await;
        if !state.stream_active {
            return;
        }
        state.stream_active = false;

        let Some(mut story) = state.current.take() else {
            return;
        };
        // The final chunk is authoritative, never a stale partial.
        story.title = done.title;
        story.content = done.content;
        state.current = Some(story.clone());

        state.stories.insert(0, story.clone());
        if state.identity.is_guest() {
            state.stories.truncate(inner.config.guest_history_cap);
        }

        match &mut state.identity {
            Identity::Guest => {
                state.guest_usage.count += 1;
                state.guest_usage.last_generation_at = Some(Utc::now());
            }
            Identity::User(profile) => {
                profile.generations_used += 1;
                profile.last_generation_date = Some(Utc::now());
            }
        }

        if state.phase != StoryPhase::Ready {
            state.phase = StoryPhase::Ready;
            inner.emit(SessionEvent::PhaseChanged(StoryPhase::Ready));
        }

        let owner = state.identity.profile().cloned();
        (story, Inner::remaining_for(&state), owner)
    };

    info!(created_at = story.created_at, title = %story.title, "story completed");
    inner.emit(SessionEvent::StoryCompleted {
        created_at: story.created_at,
    });
    inner.emit(SessionEvent::HistoryChanged);
    inner.emit(SessionEvent::UsageChanged { remaining });

    let (id_tx, id_rx) = oneshot::channel();
    background::spawn_persistence(inner.clone(), story.clone(), owner, id_tx);

    if story.content.chars().count() >= inner.config.min_narration_chars {
        background::spawn_narration(inner.clone(), story, id_rx);
    }
}

pub(crate) async fn close_story(inner: &Arc<Inner>) -> bool {
    let mut state = inner.state.write().await;
    if state.phase != StoryPhase::Ready || state.stream_active {
        return false;
    }
    state.phase = StoryPhase::Idle;
    state.current = None;
    inner.emit(SessionEvent::PhaseChanged(StoryPhase::Idle));
    true
}

//! Post-completion background tasks.
//!
//! Persistence and narration run concurrently and neither blocks the view.
//! They meet on a oneshot channel: persistence sends the server-assigned
//! story id once (and only if) the remote insert succeeds, narration waits
//! a bounded time for it before deciding the audio stays local-only.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::types::{AuthUser, Identity, Story, UserProfile};

use super::{Inner, SessionEvent};

/// Persist the completed story for its owner at completion time.
///
/// Guests get a local mirror write; signed-in users get the remote sequence
/// of usage increment, story insert, id patch, and profile refresh. Every
/// step failure is logged and absorbed, the story always survives in memory.
pub(crate) fn spawn_persistence(
    inner: Arc<Inner>,
    story: Story,
    owner: Option<UserProfile>,
    id_tx: oneshot::Sender<String>,
) {
    tokio::spawn(async move {
        match owner {
            Some(profile) => persist_remote(&inner, story, profile, id_tx).await,
            None => persist_local(&inner).await,
        }
    });
}

async fn persist_local(inner: &Arc<Inner>) {
    let (stories, usage) = {
        let state = inner.state.read().await;
        (state.stories.clone(), state.guest_usage.clone())
    };
    if let Err(err) = inner.mirror.store_history(&stories) {
        warn!(error = %err, "failed to mirror guest history");
    }
    if let Err(err) = inner.mirror.store_guest_usage(&usage) {
        warn!(error = %err, "failed to mirror guest usage");
    }
}

async fn persist_remote(
    inner: &Arc<Inner>,
    story: Story,
    profile: UserProfile,
    id_tx: oneshot::Sender<String>,
) {
    let Some(gateway) = inner.gateway.clone() else {
        warn!("signed-in story has no gateway to persist to");
        return;
    };

    if let Err(err) = gateway.record_generation(&profile.id).await {
        warn!(error = %err, "failed to record generation remotely");
    }

    match gateway.create_story(&profile.id, &story).await {
        Ok(id) => {
            {
                let mut state = inner.state.write().await;
                if let Some(entry) = state
                    .stories
                    .iter_mut()
                    .find(|s| s.created_at == story.created_at)
                {
                    entry.id = Some(id.clone());
                }
                if let Some(current) = &mut state.current {
                    if current.created_at == story.created_at {
                        current.id = Some(id.clone());
                    }
                }
            }
            info!(story_id = %id, "story persisted");
            inner.emit(SessionEvent::StoryPatched {
                created_at: story.created_at,
            });
            // Narration may have finished already; if nobody is waiting the
            // id is simply not needed.
            let _ = id_tx.send(id);
        }
        Err(err) => {
            warn!(error = %err, "failed to persist story, keeping it in memory only");
        }
    }

    let auth = AuthUser {
        id: profile.id.clone(),
        email: profile.email.clone(),
    };
    match gateway.fetch_profile(&auth).await {
        Ok(fresh) => {
            let remaining = {
                let mut state = inner.state.write().await;
                match &state.identity {
                    Identity::User(active) if active.id == fresh.id => {
                        state.identity = Identity::User(fresh.clone());
                        Some(Inner::remaining_for(&state))
                    }
                    // Signed out (or switched) while we were persisting.
                    _ => None,
                }
            };
            if let Some(remaining) = remaining {
                if let Err(err) = inner.mirror.store_profile(&fresh) {
                    warn!(error = %err, "failed to mirror refreshed profile");
                }
                inner.emit(SessionEvent::IdentityChanged(Identity::User(fresh)));
                inner.emit(SessionEvent::UsageChanged { remaining });
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to refresh profile after generation");
        }
    }
}

/// Narrate the completed story and attach the result locally, then remotely
/// once the persisted id arrives.
pub(crate) fn spawn_narration(inner: Arc<Inner>, story: Story, id_rx: oneshot::Receiver<String>) {
    tokio::spawn(async move {
        let clip = match inner.tts.synthesize(&story.content, story.request.voice).await {
            Ok(clip) => clip,
            Err(err) => {
                warn!(error = %err, "narration failed, story stays text only");
                inner.emit(SessionEvent::AudioUnavailable {
                    created_at: story.created_at,
                });
                return;
            }
        };

        {
            let mut state = inner.state.write().await;
            if let Some(entry) = state
                .stories
                .iter_mut()
                .find(|s| s.created_at == story.created_at)
            {
                entry.audio_data = Some(clip.clone());
            }
            if let Some(current) = &mut state.current {
                if current.created_at == story.created_at {
                    current.audio_data = Some(clip.clone());
                }
            }
            if state.identity.is_guest() {
                if let Err(err) = inner.mirror.store_history(&state.stories) {
                    warn!(error = %err, "failed to mirror narrated guest history");
                }
            }
        }
        inner.emit(SessionEvent::StoryPatched {
            created_at: story.created_at,
        });

        if let Some(gateway) = inner.gateway.clone() {
            match tokio::time::timeout(inner.config.id_wait_timeout, id_rx).await {
                Ok(Ok(id)) => {
                    if let Err(err) = gateway.attach_audio(&id, &clip).await {
                        warn!(error = %err, "failed to attach narration remotely");
                    }
                }
                Ok(Err(_)) => {
                    debug!("story was not persisted remotely, narration stays local");
                }
                Err(_) => {
                    debug!("timed out waiting for a persisted id, narration stays local");
                }
            }
        }
    });
}

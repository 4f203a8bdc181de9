//! Identity lifecycle: bootstrap, sign-in, sign-up, sign-out, renames.
//!
//! Mirrored data is shown immediately and treated as provisional; only a
//! gateway round trip confirms an identity. Guest history migrates to an
//! account exactly once, on an explicit sign-in or sign-up.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{StoryError, StoryResult};
use crate::traits::SessionGateway;
use crate::types::{AuthUser, Identity, UsageRecord, UserProfile};

use super::{gateway_required, Inner, SessionEvent};

/// Load mirrored snapshots for instant display, then validate the session
/// against the gateway.
pub(crate) async fn bootstrap(inner: &Arc<Inner>) {
    match inner.mirror.load_history() {
        Ok(stories) if !stories.is_empty() => {
            let mut state = inner.state.write().await;
            state.stories = stories;
            inner.emit(SessionEvent::HistoryChanged);
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "could not read the mirrored history"),
    }
    match inner.mirror.load_guest_usage() {
        Ok(usage) => inner.state.write().await.guest_usage = usage,
        Err(err) => warn!(error = %err, "could not read the mirrored guest usage"),
    }
    match inner.mirror.load_profile() {
        // Shown as a hint only; quota stays on guest rules until the
        // session is confirmed below.
        Ok(Some(profile)) => inner.emit(SessionEvent::ProvisionalProfile(profile)),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "could not read the mirrored profile"),
    }

    let Some(gateway) = inner.gateway.clone() else {
        return;
    };
    match gateway.restore_session().await {
        Ok(Some(user)) => {
            info!(user_id = %user.id, "restored a previous session");
            establish_identity(inner, gateway, user, false).await;
        }
        Ok(None) => {
            // Definitive answer: there is no session, the mirror is stale.
            if let Err(err) = inner.mirror.clear_profile() {
                warn!(error = %err, "could not drop the stale mirrored profile");
            }
            inner.emit(SessionEvent::IdentityChanged(Identity::Guest));
        }
        Err(err) => {
            // Transient failure: keep the provisional view, stay on guest rules.
            warn!(error = %err, "session restore failed, continuing as guest");
        }
    }
}

pub(crate) async fn sign_in(inner: &Arc<Inner>, email: &str, password: &str) -> StoryResult<()> {
    let gateway = inner.gateway.clone().ok_or_else(gateway_required)?;
    let user = gateway.sign_in(email, password).await?;
    info!(user_id = %user.id, "signed in");
    establish_identity(inner, gateway, user, true).await;
    Ok(())
}

pub(crate) async fn sign_up(inner: &Arc<Inner>, email: &str, password: &str) -> StoryResult<()> {
    let gateway = inner.gateway.clone().ok_or_else(gateway_required)?;
    let user = gateway.sign_up(email, password).await?;
    info!(user_id = %user.id, "signed up");
    establish_identity(inner, gateway, user, true).await;
    Ok(())
}

/// Turn an authenticated principal into the active identity.
///
/// `migrate` moves guest-era stories into the account, oldest first, and is
/// set only for explicit sign-in and sign-up. Session restores never migrate.
async fn establish_identity(
    inner: &Arc<Inner>,
    gateway: Arc<dyn SessionGateway>,
    user: AuthUser,
    migrate: bool,
) {
    let profile = match gateway.fetch_profile(&user).await {
        Ok(profile) => profile,
        Err(err) => {
            warn!(error = %err, "profile fetch failed, using a minimal fallback");
            UserProfile::fallback(user.id.clone(), user.email.clone())
        }
    };

    if migrate {
        let guest_stories = {
            let state = inner.state.read().await;
            if state.identity.is_guest() {
                state.stories.clone()
            } else {
                Vec::new()
            }
        };
        if !guest_stories.is_empty() {
            info!(count = guest_stories.len(), "migrating guest stories to the account");
            for story in guest_stories.iter().rev() {
                if let Err(err) = gateway.create_story(&profile.id, story).await {
                    warn!(
                        error = %err,
                        created_at = story.created_at,
                        "failed to migrate a guest story"
                    );
                }
            }
            if let Err(err) = inner.mirror.clear_history() {
                warn!(error = %err, "could not clear the migrated guest history");
            }
        }
    }

    {
        let mut state = inner.state.write().await;
        state.identity = Identity::User(profile.clone());
        let remaining = Inner::remaining_for(&state);
        inner.emit(SessionEvent::IdentityChanged(Identity::User(profile.clone())));
        inner.emit(SessionEvent::UsageChanged { remaining });
    }
    if let Err(err) = inner.mirror.store_profile(&profile) {
        warn!(error = %err, "could not mirror the profile");
    }

    match gateway.list_stories(&profile.id).await {
        Ok(stories) => {
            let mut state = inner.state.write().await;
            state.stories = stories;
            inner.emit(SessionEvent::HistoryChanged);
        }
        Err(err) => {
            warn!(error = %err, "could not load the account library, keeping the local view");
        }
    }
}

pub(crate) async fn sign_out(inner: &Arc<Inner>) -> StoryResult<()> {
    if let Some(gateway) = inner.gateway.clone() {
        if let Err(err) = gateway.sign_out().await {
            warn!(error = %err, "remote sign-out failed, clearing the local session anyway");
        }
    }

    if let Err(err) = inner.mirror.clear_profile() {
        warn!(error = %err, "could not clear the mirrored profile");
    }
    if let Err(err) = inner.mirror.clear_history() {
        warn!(error = %err, "could not clear the mirrored history");
    }
    if let Err(err) = inner.mirror.clear_guest_usage() {
        warn!(error = %err, "could not clear the mirrored guest usage");
    }

    let mut state = inner.state.write().await;
    state.identity = Identity::Guest;
    state.stories.clear();
    state.guest_usage = UsageRecord::default();
    let remaining = Inner::remaining_for(&state);
    inner.emit(SessionEvent::IdentityChanged(Identity::Guest));
    inner.emit(SessionEvent::HistoryChanged);
    inner.emit(SessionEvent::UsageChanged { remaining });
    info!("signed out");
    Ok(())
}

pub(crate) async fn rename_profile(inner: &Arc<Inner>, display_name: &str) -> StoryResult<()> {
    let gateway = inner.gateway.clone().ok_or_else(gateway_required)?;
    let user_id = {
        let state = inner.state.read().await;
        match state.identity.profile() {
            Some(profile) => profile.id.clone(),
            None => return Err(StoryError::Auth("no signed-in profile to rename".into())),
        }
    };

    gateway.update_display_name(&user_id, display_name).await?;

    let updated = {
        let mut state = inner.state.write().await;
        match &mut state.identity {
            Identity::User(profile) if profile.id == user_id => {
                profile.display_name = Some(display_name.to_string());
                Some(profile.clone())
            }
            _ => None,
        }
    };
    if let Some(profile) = updated {
        if let Err(err) = inner.mirror.store_profile(&profile) {
            warn!(error = %err, "could not mirror the renamed profile");
        }
        inner.emit(SessionEvent::IdentityChanged(Identity::User(profile)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MirrorStore;
    use crate::orchestrator::{SessionConfig, SessionOrchestrator};
    use crate::traits::{PlaceholderStoryBackend, PlaceholderTts};
    use crate::audio::AudioClip;
    use crate::types::{Scenario, Story, StoryRequest, Tier};
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Scripted gateway that records every persisted story id.
    #[derive(Default)]
    struct ScriptedGateway {
        restore: Option<AuthUser>,
        profile: Option<UserProfile>,
        server_stories: Vec<Story>,
        created: Mutex<Vec<i64>>,
    }

    #[async_trait::async_trait]
    impl SessionGateway for ScriptedGateway {
        async fn restore_session(&self) -> StoryResult<Option<AuthUser>> {
            Ok(self.restore.clone())
        }

        async fn sign_in(&self, _email: &str, _password: &str) -> StoryResult<AuthUser> {
            self.restore
                .clone()
                .ok_or_else(|| StoryError::Auth("no scripted user".into()))
        }

        async fn sign_up(&self, email: &str, password: &str) -> StoryResult<AuthUser> {
            self.sign_in(email, password).await
        }

        async fn sign_out(&self) -> StoryResult<()> {
            Ok(())
        }

        async fn fetch_profile(&self, user: &AuthUser) -> StoryResult<UserProfile> {
            match &self.profile {
                Some(profile) => Ok(profile.clone()),
                None => Ok(UserProfile::fallback(user.id.clone(), user.email.clone())),
            }
        }

        async fn update_display_name(&self, _user_id: &str, _display_name: &str) -> StoryResult<()> {
            Ok(())
        }

        async fn create_story(&self, _user_id: &str, story: &Story) -> StoryResult<String> {
            self.created.lock().unwrap().push(story.created_at);
            Ok(format!("srv-{}", story.created_at))
        }

        async fn list_stories(&self, _user_id: &str) -> StoryResult<Vec<Story>> {
            Ok(self.server_stories.clone())
        }

        async fn attach_audio(&self, _story_id: &str, _audio: &AudioClip) -> StoryResult<()> {
            Ok(())
        }

        async fn record_generation(&self, _user_id: &str) -> StoryResult<()> {
            Ok(())
        }
    }

    fn scripted_profile() -> UserProfile {
        UserProfile {
            id: "u-1".into(),
            email: "mama@example.com".into(),
            display_name: Some("Мама".into()),
            tier: Tier::Storyteller,
            generations_used: 3,
            last_generation_date: None,
        }
    }

    fn session_with(
        gateway: Arc<ScriptedGateway>,
        mirror: Arc<MirrorStore>,
    ) -> (SessionOrchestrator, UnboundedReceiver<SessionEvent>) {
        SessionOrchestrator::new(
            SessionConfig::default(),
            Arc::new(PlaceholderStoryBackend),
            Arc::new(PlaceholderTts),
            Some(gateway),
            mirror,
        )
    }

    fn guest_story(created_at: i64, title: &str) -> Story {
        Story {
            id: None,
            title: title.into(),
            content: "Текст".into(),
            audio_data: None,
            created_at,
            request: StoryRequest::named("Алекс", Scenario::Space),
        }
    }

    #[tokio::test]
    async fn bootstrap_confirms_a_mirrored_session() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(MirrorStore::open_path(dir.path()).unwrap());
        mirror.store_profile(&scripted_profile()).unwrap();

        let gateway = Arc::new(ScriptedGateway {
            restore: Some(AuthUser {
                id: "u-1".into(),
                email: "mama@example.com".into(),
            }),
            profile: Some(scripted_profile()),
            ..ScriptedGateway::default()
        });
        let (session, mut events) = session_with(gateway, mirror);

        session.bootstrap().await;

        let mut saw_provisional = false;
        loop {
            match events.try_recv().expect("expected more bootstrap events") {
                SessionEvent::ProvisionalProfile(profile) => {
                    assert_eq!(profile.id, "u-1");
                    assert!(!saw_provisional);
                    saw_provisional = true;
                }
                SessionEvent::IdentityChanged(Identity::User(profile)) => {
                    assert!(saw_provisional, "provisional hint must precede confirmation");
                    assert_eq!(profile.tier, Tier::Storyteller);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(session.identity().await.tier(), Tier::Storyteller);
    }

    #[tokio::test]
    async fn bootstrap_without_session_stays_guest_and_drops_the_stale_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(MirrorStore::open_path(dir.path()).unwrap());
        mirror.store_profile(&scripted_profile()).unwrap();

        let gateway = Arc::new(ScriptedGateway::default());
        let (session, _events) = session_with(gateway, mirror.clone());

        session.bootstrap().await;

        assert!(session.identity().await.is_guest());
        assert!(mirror.load_profile().unwrap().is_none());
    }

    #[tokio::test]
    async fn sign_in_migrates_guest_stories_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(MirrorStore::open_path(dir.path()).unwrap());
        mirror
            .store_history(&[guest_story(200, "Новее"), guest_story(100, "Старее")])
            .unwrap();

        let gateway = Arc::new(ScriptedGateway {
            restore: Some(AuthUser {
                id: "u-1".into(),
                email: "mama@example.com".into(),
            }),
            profile: Some(scripted_profile()),
            server_stories: vec![guest_story(300, "Серверная")],
            ..ScriptedGateway::default()
        });
        let (session, _events) = session_with(gateway.clone(), mirror.clone());

        {
            let mut state = session.inner.state.write().await;
            state.stories = mirror.load_history().unwrap();
        }
        session.sign_in("mama@example.com", "secret").await.unwrap();

        assert_eq!(*gateway.created.lock().unwrap(), vec![100, 200]);
        assert!(mirror.load_history().unwrap().is_empty());
        let history = session.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].title, "Серверная");
    }

    #[tokio::test]
    async fn restore_never_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(MirrorStore::open_path(dir.path()).unwrap());
        mirror.store_history(&[guest_story(100, "Гостевая")]).unwrap();

        let gateway = Arc::new(ScriptedGateway {
            restore: Some(AuthUser {
                id: "u-1".into(),
                email: "mama@example.com".into(),
            }),
            profile: Some(scripted_profile()),
            ..ScriptedGateway::default()
        });
        let (session, _events) = session_with(gateway.clone(), mirror.clone());

        session.bootstrap().await;

        assert!(gateway.created.lock().unwrap().is_empty());
        assert_eq!(mirror.load_history().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sign_out_resets_to_a_clean_guest() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(MirrorStore::open_path(dir.path()).unwrap());
        let gateway = Arc::new(ScriptedGateway {
            restore: Some(AuthUser {
                id: "u-1".into(),
                email: "mama@example.com".into(),
            }),
            profile: Some(scripted_profile()),
            server_stories: vec![guest_story(300, "Серверная")],
            ..ScriptedGateway::default()
        });
        let (session, _events) = session_with(gateway, mirror.clone());

        session.sign_in("mama@example.com", "secret").await.unwrap();
        assert_eq!(session.history().await.len(), 1);

        session.sign_out().await.unwrap();

        assert!(session.identity().await.is_guest());
        assert!(session.history().await.is_empty());
        assert_eq!(session.guest_usage().await.count, 0);
        assert!(mirror.load_profile().unwrap().is_none());
        assert!(mirror.load_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_requires_a_signed_in_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(MirrorStore::open_path(dir.path()).unwrap());
        let gateway = Arc::new(ScriptedGateway::default());
        let (session, _events) = session_with(gateway, mirror);

        let err = session.rename_profile("Папа").await.unwrap_err();
        assert!(matches!(err, StoryError::Auth(_)));
    }
}

//! End-to-end tests for the story session orchestrator.
//!
//! Everything runs against scripted in-process adapters; no network, no real
//! model, no speech backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use skazka_core::{
    AudioClip, AuthUser, GenerationInput, GenerationMode, MirrorStore, Scenario, SessionConfig,
    SessionEvent, SessionGateway, SessionOrchestrator, Story, StoryBackend, StoryPhase,
    StoryRequest, StoryResult, SubmitOutcome, Tier, TtsBackend, UserProfile, Voice,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Scripted adapters
// ---------------------------------------------------------------------------

/// Streams a fixed fragment script with small gaps, like a live model would.
struct ScriptedBackend {
    fragments: Vec<&'static str>,
    /// When set, the stream errors out after this many fragments.
    fail_after: Option<usize>,
}

impl ScriptedBackend {
    fn tale() -> Self {
        Self {
            fragments: vec![
                "ЗАГОЛОВОК: Космическое ",
                "путешествие Алекса\n",
                "СЮЖЕТ: Алекс сел в серебристую ракету. ",
                "Ракета взлетела выше облаков. ",
                "Там его ждали добрые звезды.",
            ],
            fail_after: None,
        }
    }

    fn broken_after(count: usize) -> Self {
        Self {
            fragments: Self::tale().fragments,
            fail_after: Some(count),
        }
    }
}

#[async_trait::async_trait]
impl StoryBackend for ScriptedBackend {
    async fn open_stream(
        &self,
        _input: &GenerationInput,
    ) -> StoryResult<mpsc::Receiver<StoryResult<String>>> {
        let fragments: Vec<String> = self.fragments.iter().map(|s| s.to_string()).collect();
        let fail_after = self.fail_after;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for (index, fragment) in fragments.into_iter().enumerate() {
                if fail_after == Some(index) {
                    let _ = tx
                        .send(Err(skazka_core::StoryError::Generation(
                            "connection dropped".into(),
                        )))
                        .await;
                    return;
                }
                if tx.send(Ok(fragment)).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        Ok(rx)
    }

    async fn generate(&self, _input: &GenerationInput) -> StoryResult<String> {
        // The single-shot flavor speaks JSON, the same tale as the stream.
        Ok(r#"{"title": "Космическое путешествие Алекса", "content": "Алекс сел в серебристую ракету. Ракета взлетела выше облаков. Там его ждали добрые звезды."}"#.to_string())
    }
}

struct ScriptedTts;

#[async_trait::async_trait]
impl TtsBackend for ScriptedTts {
    async fn synthesize(&self, _text: &str, _voice: Voice) -> StoryResult<AudioClip> {
        Ok(AudioClip::from_samples(&[0i16; 2400]))
    }
}

/// Gateway double that logs every remote call in order.
struct ScriptedGateway {
    profile: UserProfile,
    fail_create: bool,
    ops: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    fn for_profile(profile: UserProfile) -> Self {
        Self {
            profile,
            fail_create: false,
            ops: Mutex::new(Vec::new()),
        }
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn log(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }
}

#[async_trait::async_trait]
impl SessionGateway for ScriptedGateway {
    async fn restore_session(&self) -> StoryResult<Option<AuthUser>> {
        Ok(Some(AuthUser {
            id: self.profile.id.clone(),
            email: self.profile.email.clone(),
        }))
    }

    async fn sign_in(&self, email: &str, _password: &str) -> StoryResult<AuthUser> {
        Ok(AuthUser {
            id: self.profile.id.clone(),
            email: email.to_string(),
        })
    }

    async fn sign_up(&self, email: &str, password: &str) -> StoryResult<AuthUser> {
        self.sign_in(email, password).await
    }

    async fn sign_out(&self) -> StoryResult<()> {
        Ok(())
    }

    async fn fetch_profile(&self, _user: &AuthUser) -> StoryResult<UserProfile> {
        Ok(self.profile.clone())
    }

    async fn update_display_name(&self, _user_id: &str, _display_name: &str) -> StoryResult<()> {
        Ok(())
    }

    async fn create_story(&self, _user_id: &str, story: &Story) -> StoryResult<String> {
        if self.fail_create {
            self.log("create_story:failed");
            return Err(skazka_core::StoryError::Gateway("insert refused".into()));
        }
        let id = format!("srv-{}", story.created_at);
        self.log(format!("create_story:{id}"));
        Ok(id)
    }

    async fn list_stories(&self, _user_id: &str) -> StoryResult<Vec<Story>> {
        Ok(Vec::new())
    }

    async fn attach_audio(&self, story_id: &str, _audio: &AudioClip) -> StoryResult<()> {
        self.log(format!("attach_audio:{story_id}"));
        Ok(())
    }

    async fn record_generation(&self, _user_id: &str) -> StoryResult<()> {
        self.log("record_generation");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn wizard_profile() -> UserProfile {
    UserProfile {
        id: "wiz-1".into(),
        email: "wizard@example.com".into(),
        display_name: Some("Волшебник".into()),
        tier: Tier::Wizard,
        generations_used: 0,
        last_generation_date: None,
    }
}

async fn wait_for<F>(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: F,
) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

fn guest_session(
    backend: ScriptedBackend,
) -> (
    SessionOrchestrator,
    mpsc::UnboundedReceiver<SessionEvent>,
    Arc<MirrorStore>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mirror = Arc::new(MirrorStore::open_path(dir.path()).expect("mirror"));
    let (session, events) = SessionOrchestrator::new(
        SessionConfig::default(),
        Arc::new(backend),
        Arc::new(ScriptedTts),
        None,
        mirror.clone(),
    );
    (session, events, mirror, dir)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn guest_generates_reads_and_keeps_the_story_locally() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (session, mut events, mirror, _dir) = guest_session(ScriptedBackend::tale());
    session.bootstrap().await;

    let outcome = session
        .submit(StoryRequest::named("Алекс", Scenario::Space))
        .await;
    assert_eq!(outcome, SubmitOutcome::Accepted);

    // The view is promoted to Ready on the first chunk with text, while the
    // stream keeps running underneath.
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PhaseChanged(StoryPhase::Ready))
    })
    .await;
    let completed = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StoryCompleted { .. })
    })
    .await;
    let created_at = match completed {
        SessionEvent::StoryCompleted { created_at } => created_at,
        _ => unreachable!(),
    };

    let history = session.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].title, "Космическое путешествие Алекса");
    assert!(history[0].content.starts_with("Алекс сел"));
    assert_eq!(history[0].created_at, created_at);

    assert_eq!(session.remaining().await, 0);
    assert!(!session.quota_allows().await);

    // Narration lands as a local patch.
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StoryPatched { .. })
    })
    .await;
    let history = session.history().await;
    assert!(history[0].has_audio());

    // Both the story and the usage counter survive in the mirror. The usage
    // write belongs to the persistence task, so give it a moment.
    let mirrored = mirror.load_history().expect("history");
    assert_eq!(mirrored.len(), 1);
    timeout(Duration::from_secs(5), async {
        while mirror.load_guest_usage().expect("usage").count == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("guest usage was never mirrored");

    // The stream is over, so the view may close now.
    assert!(session.close_story().await);
    assert_eq!(session.phase().await, StoryPhase::Idle);
}

#[tokio::test]
async fn second_guest_submission_is_rejected_with_a_sign_in_prompt() {
    let (session, mut events, _mirror, _dir) = guest_session(ScriptedBackend::tale());

    session
        .submit(StoryRequest::named("Алекс", Scenario::Space))
        .await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StoryCompleted { .. })
    })
    .await;
    assert!(session.close_story().await);

    let outcome = session
        .submit(StoryRequest::named("Алекс", Scenario::Forest))
        .await;
    assert!(matches!(
        outcome,
        SubmitOutcome::Rejected(skazka_core::RejectReason::QuotaExhausted {
            sign_in_required: true
        })
    ));
    let notice = wait_for(&mut events, |e| matches!(e, SessionEvent::Notice { .. })).await;
    match notice {
        SessionEvent::Notice {
            message,
            prompt_sign_in,
        } => {
            assert_eq!(message, "Лимит гостя исчерпан. Пожалуйста, войдите.");
            assert!(prompt_sign_in);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn structured_mode_delivers_the_same_tale() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mirror = Arc::new(MirrorStore::open_path(dir.path()).expect("mirror"));
    let (session, mut events) = SessionOrchestrator::new(
        SessionConfig::default().with_mode(GenerationMode::Structured),
        Arc::new(ScriptedBackend::tale()),
        Arc::new(ScriptedTts),
        None,
        mirror,
    );

    session
        .submit(StoryRequest::named("Алекс", Scenario::Space))
        .await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StoryCompleted { .. })
    })
    .await;

    let history = session.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].title, "Космическое путешествие Алекса");
    assert!(history[0].content.starts_with("Алекс сел"));
    assert_eq!(session.remaining().await, 0);
    assert!(session.close_story().await);
}

#[tokio::test]
async fn wizard_story_is_persisted_and_narration_reaches_the_server() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mirror = Arc::new(MirrorStore::open_path(dir.path()).expect("mirror"));
    let gateway = Arc::new(ScriptedGateway::for_profile(wizard_profile()));
    let (session, mut events) = SessionOrchestrator::new(
        SessionConfig::default(),
        Arc::new(ScriptedBackend::tale()),
        Arc::new(ScriptedTts),
        Some(gateway.clone()),
        mirror,
    );
    session.bootstrap().await;
    assert_eq!(session.identity().await.tier(), Tier::Wizard);

    let mut request = StoryRequest::named("Ира", Scenario::Custom);
    request.custom_hero = Some("Дракончик Искра".into());
    request.custom_place = Some("Хрустальная пещера".into());
    request.custom_event = Some("Поиск пропавшего эха".into());
    request.voice = Voice::Fenrir;
    request.interactive = true;
    assert_eq!(session.submit(request).await, SubmitOutcome::Accepted);

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StoryCompleted { .. })
    })
    .await;

    // Wait until the narration was attached remotely, then inspect the call
    // order: usage increment, insert, then the audio push with the id the
    // insert produced.
    timeout(Duration::from_secs(5), async {
        loop {
            if gateway
                .ops()
                .iter()
                .any(|op| op.starts_with("attach_audio:srv-"))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("narration never reached the server");

    let ops = gateway.ops();
    assert_eq!(ops[0], "record_generation");
    assert!(ops[1].starts_with("create_story:srv-"));
    let id = ops[1].trim_start_matches("create_story:").to_string();
    assert!(ops.contains(&format!("attach_audio:{id}")));

    // The wizard keeps the selected voice and the interactive flag.
    let story = session.history().await.remove(0);
    assert_eq!(story.request.voice, Voice::Fenrir);
    assert!(story.request.interactive);
    assert_eq!(story.id.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn failed_persistence_keeps_the_narration_local() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mirror = Arc::new(MirrorStore::open_path(dir.path()).expect("mirror"));
    let mut gateway = ScriptedGateway::for_profile(wizard_profile());
    gateway.fail_create = true;
    let gateway = Arc::new(gateway);
    let (session, mut events) = SessionOrchestrator::new(
        SessionConfig::default(),
        Arc::new(ScriptedBackend::tale()),
        Arc::new(ScriptedTts),
        Some(gateway.clone()),
        mirror,
    );
    session.bootstrap().await;

    session
        .submit(StoryRequest::named("Тима", Scenario::Dinosaurs))
        .await;
    // The audio patch still arrives even though the insert failed.
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StoryPatched { .. })
    })
    .await;

    // The dropped id channel resolves immediately, no ten-second stall.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let ops = gateway.ops();
    assert!(ops.contains(&"create_story:failed".to_string()));
    assert!(!ops.iter().any(|op| op.starts_with("attach_audio")));

    let story = session.history().await.remove(0);
    assert!(story.id.is_none());
    assert!(story.has_audio());
}

#[tokio::test]
async fn mid_stream_error_returns_the_view_to_idle() {
    let (session, mut events, _mirror, _dir) = guest_session(ScriptedBackend::broken_after(2));

    session
        .submit(StoryRequest::named("Оля", Scenario::Underwater))
        .await;

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PhaseChanged(StoryPhase::Failed))
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PhaseChanged(StoryPhase::Idle))
    })
    .await;
    let notice = wait_for(&mut events, |e| matches!(e, SessionEvent::Notice { .. })).await;
    match notice {
        SessionEvent::Notice { message, .. } => {
            assert_eq!(message, "Магия немного сбилась. Попробуйте еще раз!");
        }
        _ => unreachable!(),
    }

    // Nothing was counted or kept.
    assert!(session.history().await.is_empty());
    assert_eq!(session.guest_usage().await.count, 0);
    assert!(session.current_story().await.is_none());

    // And the next attempt goes through.
    assert_eq!(
        session
            .submit(StoryRequest::named("Оля", Scenario::Underwater))
            .await,
        SubmitOutcome::Accepted
    );
}

//! Skazka interactive console
//!
//! Terminal front-end over the story session orchestrator: streams the tale
//! into the terminal as it is written, shows quota and identity changes as
//! they happen, and exposes the library, sign-in and audio-export commands.
//!
//! Adapters are chosen at startup from the environment: Gemini when
//! `GEMINI_API_KEY` is set (offline placeholder otherwise), Supabase when
//! `SUPABASE_URL`/`SUPABASE_ANON_KEY` are set (guest-only mode otherwise).

use std::collections::HashSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skazka_core::{
    GenerationMode, Identity, MirrorStore, PlaceholderStoryBackend, PlaceholderTts, RejectReason,
    Scenario, SessionConfig, SessionEvent, SessionGateway, SessionOrchestrator, Story,
    StoryBackend, StoryError, StoryPhase, StoryRequest, StoryResult, SubmitOutcome, Tier,
    TtsBackend, Voice, BITS_PER_SAMPLE, CHANNELS, PROVISIONAL_TITLE, SAMPLE_RATE_HZ,
};
use skazka_gemini::{GeminiStoryBackend, GeminiTts};
use skazka_supabase::{SessionCache, SupabaseGateway};

type InputLines = Lines<BufReader<Stdin>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Console settings. Precedence: env `SKAZKA_CONFIG` path > `config/skazka.toml`
/// > defaults, with `SKAZKA_`-prefixed environment variables on top.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    pub data_dir: String,
    pub generation_mode: String,
}

impl ConsoleConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("SKAZKA_CONFIG").unwrap_or_else(|_| "config/skazka".to_string());
        let builder = config::Config::builder()
            .set_default("data_dir", "./data")?
            .set_default("generation_mode", "streaming")?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        builder
            .add_source(config::Environment::with_prefix("SKAZKA").separator("__"))
            .build()?
            .try_deserialize()
    }

    fn generation_mode(&self) -> GenerationMode {
        match self.generation_mode.to_ascii_lowercase().as_str() {
            "streaming" => GenerationMode::Streaming,
            "structured" => GenerationMode::Structured,
            other => {
                tracing::warn!("unknown generation_mode {:?}, using streaming", other);
                GenerationMode::Streaming
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!(
            "[skazka-console] .env not loaded: {} (using system environment)",
            e
        );
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ConsoleConfig::load().expect("load console config");
    let data_dir = PathBuf::from(&config.data_dir);

    let backend: Arc<dyn StoryBackend> = match GeminiStoryBackend::from_env() {
        Some(backend) => {
            tracing::info!("Gemini story backend active");
            Arc::new(backend)
        }
        None => {
            tracing::warn!("GEMINI_API_KEY not set; using the offline placeholder tale");
            Arc::new(PlaceholderStoryBackend)
        }
    };
    let tts: Arc<dyn TtsBackend> = match GeminiTts::from_env() {
        Some(tts) => Arc::new(tts),
        None => Arc::new(PlaceholderTts),
    };
    let gateway: Option<Arc<dyn SessionGateway>> = match SupabaseGateway::from_env_with_cache(
        SessionCache::new(data_dir.join("skazka_session.json")),
    ) {
        Some(gateway) => {
            tracing::info!("Supabase session gateway active");
            Some(Arc::new(gateway))
        }
        None => {
            tracing::warn!("SUPABASE_URL/SUPABASE_ANON_KEY not set; running in guest-only mode");
            None
        }
    };
    let mirror = Arc::new(
        MirrorStore::open_path(data_dir.join("skazka_mirror")).expect("open local mirror store"),
    );

    let session_config = SessionConfig::default().with_mode(config.generation_mode());
    let (session, mut events) =
        SessionOrchestrator::new(session_config, backend, tts, gateway, Arc::clone(&mirror));

    println!("✨📖 Сказка: волшебные истории для детей");
    session.bootstrap().await;

    let console = Console { session, config };
    let mut renderer = StreamRenderer::new();
    let mut announced_audio: HashSet<i64> = HashSet::new();

    // Bootstrap already queued its identity/history events; show them before
    // the first prompt.
    while let Ok(event) = events.try_recv() {
        render_event(event, &console.session, &mut renderer, &mut announced_audio).await;
    }
    console.quota_line().await;
    println!("Напишите help, чтобы увидеть список команд.");

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut cooldown = tokio::time::interval(std::time::Duration::from_secs(60));
    cooldown.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    cooldown.tick().await;

    prompt();
    loop {
        tokio::select! {
            line = input.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if console.dispatch(line.trim(), &mut input).await == Flow::Quit {
                            break;
                        }
                        prompt();
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        render_event(event, &console.session, &mut renderer, &mut announced_audio)
                            .await;
                    }
                    None => break,
                }
            }
            _ = cooldown.tick() => {
                // The countdown is re-shown once a minute while exhausted.
                if !console.session.quota_allows().await {
                    if let Some(eta) = console.session.unlock_eta().await {
                        println!("⏳ Новая сказка через: {eta}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    if let Err(e) = mirror.flush() {
        tracing::warn!("mirror flush on exit failed: {}", e);
    }
    println!("👋 До встречи!");
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Quit,
}

struct Console {
    session: SessionOrchestrator,
    config: ConsoleConfig,
}

impl Console {
    async fn dispatch(&self, line: &str, input: &mut InputLines) -> Flow {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let rest: Vec<&str> = parts.collect();
        match command {
            "" => {}
            "help" | "?" => print_help(),
            "new" => self.story_wizard(input).await,
            "library" | "list" => self.library().await,
            "open" => self.open_story(rest.first().copied()).await,
            "close" => {
                if self.session.close_story().await {
                    println!("📕 Сказка закрыта.");
                } else {
                    println!("Закрывать нечего, или сказка еще пишется.");
                }
            }
            "save" => self.save_story(rest.first().copied()).await,
            "login" => self.login(input, false).await,
            "signup" => self.login(input, true).await,
            "logout" => {
                if let Err(e) = self.session.sign_out().await {
                    println!("❌ Выйти не удалось: {e}");
                }
            }
            "rename" => self.rename(rest.join(" "), input).await,
            "status" | "profile" => self.status().await,
            "quit" | "exit" => return Flow::Quit,
            other => println!("Неизвестная команда {other:?}. help покажет список."),
        }
        Flow::Continue
    }

    /// Collect the story request field by field, honoring tier gating, then
    /// submit. Rejections come back as notice events and print themselves.
    async fn story_wizard(&self, input: &mut InputLines) {
        let caps = self.session.identity().await.tier().caps();

        let Some(name) = ask(input, "Имя ребенка:").await else {
            return;
        };

        println!("Сюжет:");
        for (i, scenario) in Scenario::ALL.iter().enumerate() {
            println!("  {}. {}", i + 1, scenario);
        }
        let Some(pick) = ask(input, "Выберите [1-6]:").await else {
            return;
        };
        let scenario = pick
            .parse::<usize>()
            .ok()
            .and_then(|n| Scenario::ALL.get(n.wrapping_sub(1)))
            .copied()
            .unwrap_or(Scenario::Space);

        let mut request = StoryRequest::named(name, scenario);
        if scenario == Scenario::Custom {
            let Some(hero) = ask(input, "Герой (пусто = Ребенок):").await else {
                return;
            };
            let Some(place) = ask(input, "Место (пусто = Волшебная страна):").await else {
                return;
            };
            let Some(event) = ask(input, "Событие (пусто = Неожиданное приключение):").await
            else {
                return;
            };
            request.custom_hero = some_if_filled(hero);
            request.custom_place = some_if_filled(place);
            request.custom_event = some_if_filled(event);
        }
        if caps.voice_selectable {
            println!("Голос рассказчика:");
            for (i, voice) in Voice::SELECTABLE.iter().enumerate() {
                println!("  {}. {}", i + 1, voice.label());
            }
            let Some(pick) = ask(input, "Выберите [1-3]:").await else {
                return;
            };
            request.voice = pick
                .parse::<usize>()
                .ok()
                .and_then(|n| Voice::SELECTABLE.get(n.wrapping_sub(1)))
                .copied()
                .unwrap_or_default();
        }
        if caps.interactive_allowed {
            if let Some(answer) = ask(input, "Интерактивная концовка? [y/N]:").await {
                let answer = answer.to_lowercase();
                request.interactive = answer.starts_with('y') || answer.starts_with('д');
            }
        }

        if let SubmitOutcome::Rejected(RejectReason::Busy) = self.session.submit(request).await {
            println!("Подождите, предыдущая сказка еще сочиняется.");
        }
    }

    async fn login(&self, input: &mut InputLines, create_account: bool) {
        let Some(email) = ask(input, "Email:").await else {
            return;
        };
        let Some(password) = ask(input, "Пароль:").await else {
            return;
        };
        if email.is_empty() || password.is_empty() {
            println!("Нужны и email, и пароль.");
            return;
        }
        let result = if create_account {
            self.session.sign_up(&email, &password).await
        } else {
            self.session.sign_in(&email, &password).await
        };
        if let Err(e) = result {
            println!("❌ Не получилось: {e}");
        }
    }

    async fn library(&self) {
        let stories = self.session.history().await;
        if stories.is_empty() {
            println!("📚 Библиотека пуста. Команда new сочинит первую сказку.");
            return;
        }
        println!("📚 Библиотека:");
        for (i, story) in stories.iter().enumerate() {
            let audio = if story.has_audio() { " 🔊" } else { "" };
            println!(
                "  {}. {} ({}){}",
                i + 1,
                story.title,
                format_timestamp(story.created_at),
                audio
            );
        }
    }

    async fn open_story(&self, arg: Option<&str>) {
        let stories = self.session.history().await;
        let Some(index) = parse_index(arg, stories.len()) else {
            println!("Укажите номер сказки из library.");
            return;
        };
        let story = &stories[index];
        println!();
        println!("📖 {}", story.title);
        println!();
        println!("{}", story.content);
        if let Some(clip) = &story.audio_data {
            if let Ok(secs) = clip.duration_secs() {
                println!();
                println!("🔊 Озвучка: {secs:.0} сек.");
            }
        }
    }

    async fn save_story(&self, arg: Option<&str>) {
        if self.session.identity().await.tier() != Tier::Wizard {
            println!("💾 Сохранение озвучки доступно на тарифе Волшебник.");
            return;
        }
        let stories = self.session.history().await;
        let Some(index) = parse_index(arg, stories.len()) else {
            println!("Укажите номер сказки из library.");
            return;
        };
        let exports = PathBuf::from(&self.config.data_dir).join("exports");
        match export_wav(&stories[index], &exports) {
            Ok(path) => println!("💾 Сохранено: {}", path.display()),
            Err(e) => println!("⚠️  Сохранить не удалось: {e}"),
        }
    }

    async fn rename(&self, inline: String, input: &mut InputLines) {
        let name = if inline.trim().is_empty() {
            match ask(input, "Новое имя:").await {
                Some(name) => name,
                None => return,
            }
        } else {
            inline.trim().to_string()
        };
        if name.is_empty() {
            println!("Имя не может быть пустым.");
            return;
        }
        match self.session.rename_profile(&name).await {
            Ok(()) => println!("👤 Имя обновлено."),
            Err(e) => println!("❌ Переименовать не удалось: {e}"),
        }
    }

    async fn status(&self) {
        match self.session.identity().await {
            Identity::Guest => println!("👤 Гость (без аккаунта)"),
            Identity::User(profile) => {
                let name = profile
                    .display_name
                    .clone()
                    .unwrap_or_else(|| profile.email.clone());
                println!("👤 {} · {}", name, profile.tier.label());
                println!("   Email: {}", profile.email);
            }
        }
        self.quota_line().await;
        let phase = self.session.phase().await;
        if phase != StoryPhase::Idle {
            println!("   Состояние: {}", phase.as_str());
        }
    }

    async fn quota_line(&self) {
        if self.session.quota_allows().await {
            println!("✨ Осталось сказок: {}", self.session.remaining().await);
        } else if let Some(eta) = self.session.unlock_eta().await {
            println!("⏳ Новая сказка через: {eta}");
        } else {
            println!("⏳ Лимит исчерпан.");
        }
    }
}

fn print_help() {
    println!("Команды:");
    println!("  new             сочинить новую сказку");
    println!("  library         список сохраненных сказок");
    println!("  open <N>        открыть сказку из списка");
    println!("  close           закрыть дочитанную сказку");
    println!("  save <N>        сохранить озвучку в WAV (тариф Волшебник)");
    println!("  login / signup  войти или создать аккаунт");
    println!("  logout          выйти из аккаунта");
    println!("  rename <имя>    изменить имя профиля");
    println!("  status          профиль, тариф и лимиты");
    println!("  quit            выход");
}

// ---------------------------------------------------------------------------
// Event rendering
// ---------------------------------------------------------------------------

async fn render_event(
    event: SessionEvent,
    session: &SessionOrchestrator,
    renderer: &mut StreamRenderer,
    announced_audio: &mut HashSet<i64>,
) {
    match event {
        SessionEvent::PhaseChanged(StoryPhase::Requesting) => renderer.begin(),
        SessionEvent::PhaseChanged(StoryPhase::Failed) => renderer.abort(),
        SessionEvent::PhaseChanged(_) => {}
        SessionEvent::StoryProgress { title, content } => renderer.progress(&title, &content),
        SessionEvent::StoryCompleted { .. } => renderer.complete(),
        SessionEvent::StoryPatched { created_at } => {
            let story = session
                .history()
                .await
                .into_iter()
                .find(|s| s.created_at == created_at);
            if let Some(story) = story {
                if let Some(clip) = &story.audio_data {
                    if announced_audio.insert(created_at) {
                        let secs = clip.duration_secs().unwrap_or(0.0);
                        println!("🔊 Озвучка готова ({secs:.0} сек).");
                    }
                }
            }
        }
        SessionEvent::AudioUnavailable { .. } => {
            println!("🔇 Озвучить не получилось; сказка сохранена без звука.");
        }
        SessionEvent::HistoryChanged => tracing::debug!("story collection updated"),
        SessionEvent::IdentityChanged(Identity::Guest) => {
            println!("👋 Вы гость. Доступна одна пробная сказка.");
        }
        SessionEvent::IdentityChanged(Identity::User(profile)) => {
            let name = profile
                .display_name
                .clone()
                .unwrap_or_else(|| profile.email.clone());
            println!("👤 {} · {}", name, profile.tier.label());
        }
        SessionEvent::ProvisionalProfile(profile) => {
            let name = profile
                .display_name
                .clone()
                .unwrap_or_else(|| profile.email.clone());
            println!("👤 С возвращением, {name}! Проверяем сессию...");
        }
        SessionEvent::UsageChanged { remaining } => {
            println!("✨ Осталось сказок: {remaining}");
        }
        SessionEvent::Notice {
            message,
            prompt_sign_in,
        } => {
            println!("⚠️  {message}");
            if prompt_sign_in {
                println!("   Команда login откроет вход в аккаунт.");
            }
        }
    }
}

/// Terminal rendering of the progressive snapshots. Progress events replace
/// the whole text every time, so only what extends the already printed
/// prefix goes to the screen.
struct StreamRenderer {
    active: bool,
    title_shown: bool,
    plot_placeholder_shown: bool,
    shown_chars: usize,
}

impl StreamRenderer {
    fn new() -> Self {
        Self {
            active: false,
            title_shown: false,
            plot_placeholder_shown: false,
            shown_chars: 0,
        }
    }

    fn begin(&mut self) {
        *self = Self::new();
        self.active = true;
        println!();
        println!("Сочиняем заголовок...");
    }

    fn progress(&mut self, title: &str, content: &str) {
        if !self.active {
            return;
        }
        if !self.title_shown && !title.is_empty() && title != PROVISIONAL_TITLE {
            println!();
            println!("📖 {title}");
            self.title_shown = true;
        }
        if self.title_shown && !self.plot_placeholder_shown && content.is_empty() {
            println!("Начинаем рассказ...");
            self.plot_placeholder_shown = true;
        }
        let total = content.chars().count();
        if total > self.shown_chars {
            if self.shown_chars == 0 {
                println!();
            }
            let delta: String = content.chars().skip(self.shown_chars).collect();
            print!("{delta}");
            let _ = std::io::stdout().flush();
            self.shown_chars = total;
        }
    }

    fn complete(&mut self) {
        if self.active {
            println!();
            println!();
            println!("🌟 Сказка готова!");
        }
        self.active = false;
    }

    fn abort(&mut self) {
        self.active = false;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prompt() {
    print!("сказка> ");
    let _ = std::io::stdout().flush();
}

async fn ask(input: &mut InputLines, question: &str) -> Option<String> {
    print!("{question} ");
    let _ = std::io::stdout().flush();
    match input.next_line().await {
        Ok(Some(line)) => Some(line.trim().to_string()),
        _ => None,
    }
}

fn some_if_filled(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_index(arg: Option<&str>, len: usize) -> Option<usize> {
    let n: usize = arg?.parse().ok()?;
    if (1..=len).contains(&n) {
        Some(n - 1)
    } else {
        None
    }
}

fn format_timestamp(ms: i64) -> String {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%d.%m.%Y %H:%M").to_string())
        .unwrap_or_else(|| "?".into())
}

fn wav_filename(title: &str, created_at: i64) -> String {
    let stem: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let stem = stem.trim_matches('_').to_string();
    if stem.is_empty() {
        format!("skazka_{created_at}.wav")
    } else {
        format!("{stem}_{created_at}.wav")
    }
}

/// Decode the narration payload and write it as a standard WAV file.
fn export_wav(story: &Story, dir: &Path) -> StoryResult<PathBuf> {
    let Some(clip) = story.audio_data.as_ref() else {
        return Err(StoryError::Audio("у этой сказки нет озвучки".into()));
    };
    let samples = clip.decode_samples()?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(wav_filename(&story.title, story.created_at));
    let spec = hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE_HZ,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec)
        .map_err(|e| StoryError::Audio(format!("WAV create failed: {e}")))?;
    for sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| StoryError::Audio(format!("WAV write failed: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| StoryError::Audio(format!("WAV finalize failed: {e}")))?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

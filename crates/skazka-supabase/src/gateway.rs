//! Supabase-backed session gateway
//!
//! Auth goes through GoTrue (`/auth/v1/...`), rows through PostgREST
//! (`/rest/v1/...`). The `profiles` table uses the same camelCase column
//! names as the mirrored profile JSON, so its rows deserialize straight
//! into [`UserProfile`]; `stories` columns are snake_case and get an
//! explicit row type.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use skazka_core::{
    AudioClip, AuthUser, SessionGateway, Story, StoryError, StoryRequest, StoryResult,
    UserProfile,
};

use crate::session::{SessionCache, SessionTokens};

/// Server-side story retention. Inserts stamp `expires_at` this far ahead and
/// listings skip rows past it, matching the cleanup job on the backend.
pub const STORY_RETENTION_DAYS: i64 = 30;

/// Access-token lifetime assumed when GoTrue omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuthSession {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    user: GoTrueUser,
}

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// GoTrue error bodies vary by endpoint; take whichever message is present.
#[derive(Debug, Default, Deserialize)]
struct GoTrueErrorBody {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn auth_error_message(status: reqwest::StatusCode, body: &str) -> String {
    let parsed: GoTrueErrorBody = serde_json::from_str(body).unwrap_or_default();
    parsed
        .error_description
        .or(parsed.msg)
        .or(parsed.message)
        .or(parsed.error)
        .unwrap_or_else(|| format!("auth request failed with status {status}"))
}

fn tokens_from_session(session: &AuthSession, now: DateTime<Utc>) -> SessionTokens {
    let lifetime = session
        .expires_in
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
        .max(60);
    SessionTokens {
        access_token: session.access_token.clone(),
        refresh_token: session.refresh_token.clone(),
        expires_at: now + Duration::seconds(lifetime),
        user_id: session.user.id.clone(),
        email: session.user.email.clone(),
    }
}

fn auth_user(tokens: &SessionTokens) -> AuthUser {
    AuthUser {
        id: tokens.user_id.clone(),
        email: tokens.email.clone().unwrap_or_default(),
    }
}

/// One `stories` row as PostgREST returns it.
#[derive(Debug, Deserialize)]
struct StoryRow {
    id: String,
    title: String,
    content: String,
    #[serde(default)]
    audio_data: Option<String>,
    params: StoryRequest,
    created_at: DateTime<Utc>,
}

impl StoryRow {
    fn into_story(self) -> Story {
        Story {
            id: Some(self.id),
            title: self.title,
            content: self.content,
            audio_data: self.audio_data.map(AudioClip::new),
            created_at: self.created_at.timestamp_millis(),
            request: self.params,
        }
    }
}

#[derive(Debug, Serialize)]
struct StoryInsert<'a> {
    user_id: &'a str,
    title: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_data: Option<&'a str>,
    params: &'a StoryRequest,
    expires_at: DateTime<Utc>,
}

fn story_insert<'a>(user_id: &'a str, story: &'a Story, now: DateTime<Utc>) -> StoryInsert<'a> {
    StoryInsert {
        user_id,
        title: &story.title,
        content: &story.content,
        audio_data: story.audio_data.as_ref().map(|clip| clip.as_base64()),
        params: &story.request,
        expires_at: now + Duration::days(STORY_RETENTION_DAYS),
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Session gateway over one Supabase project.
pub struct SupabaseGateway {
    base_url: String,
    anon_key: String,
    client: Client,
    cache: SessionCache,
    tokens: RwLock<Option<SessionTokens>>,
}

impl SupabaseGateway {
    /// Build from `SUPABASE_URL` / `SUPABASE_ANON_KEY`. Returns `None` when
    /// either is missing so callers can run without remote persistence.
    pub fn from_env() -> Option<Self> {
        Self::from_env_with_cache(SessionCache::open_default())
    }

    /// Same env lookup, but with the token cache at a caller-chosen path.
    pub fn from_env_with_cache(cache: SessionCache) -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?.trim().to_string();
        let anon_key = std::env::var("SUPABASE_ANON_KEY").ok()?.trim().to_string();
        if base_url.is_empty() || anon_key.is_empty() {
            return None;
        }
        Some(Self::with_session_cache(base_url, anon_key, cache))
    }

    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self::with_session_cache(base_url, anon_key, SessionCache::open_default())
    }

    /// Use a specific cache file instead of the default data-dir location.
    pub fn with_session_cache(
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
        cache: SessionCache,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        let tokens = RwLock::new(cache.load());
        Self {
            base_url,
            anon_key: anon_key.into(),
            client,
            cache,
            tokens,
        }
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    async fn install_tokens(&self, tokens: SessionTokens) {
        if let Err(e) = self.cache.store(&tokens) {
            tracing::warn!("failed to persist session tokens: {}", e);
        }
        *self.tokens.write().await = Some(tokens);
    }

    async fn drop_tokens(&self) {
        if let Err(e) = self.cache.clear() {
            tracing::warn!("failed to clear session cache: {}", e);
        }
        *self.tokens.write().await = None;
    }

    /// Exchange a refresh token for a new session. `Ok(None)` means GoTrue
    /// rejected the token outright, which is a definitive end of the session;
    /// `Err` is a transport problem and says nothing about its validity.
    async fn refresh_tokens(&self, refresh_token: &str) -> StoryResult<Option<AuthSession>> {
        let url = format!("{}/auth/v1/token?grant_type=refresh_token", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| StoryError::Gateway(format!("token refresh failed: {e}")))?;
        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| StoryError::Gateway(format!("token refresh failed: {e}")))?;
        if status.is_success() {
            let session = serde_json::from_str(&raw)
                .map_err(|e| StoryError::Gateway(format!("unexpected refresh response: {e}")))?;
            return Ok(Some(session));
        }
        if status.is_client_error() {
            tracing::info!(
                "refresh token rejected: {}",
                auth_error_message(status, &raw)
            );
            return Ok(None);
        }
        Err(StoryError::Gateway(format!(
            "token refresh failed with status {status}"
        )))
    }

    /// Current bearer for REST calls, refreshing an expired access token
    /// first. Falls back to the anon key when nobody is signed in.
    async fn access_token(&self) -> Option<String> {
        let (current, refresh) = {
            let guard = self.tokens.read().await;
            match guard.as_ref() {
                Some(t) if t.is_expired(Utc::now()) => {
                    (Some(t.access_token.clone()), Some(t.refresh_token.clone()))
                }
                Some(t) => (Some(t.access_token.clone()), None),
                None => (None, None),
            }
        };
        let Some(refresh) = refresh else {
            return current;
        };
        match self.refresh_tokens(&refresh).await {
            Ok(Some(session)) => {
                let fresh = tokens_from_session(&session, Utc::now());
                let access = fresh.access_token.clone();
                self.install_tokens(fresh).await;
                Some(access)
            }
            Ok(None) => {
                self.drop_tokens().await;
                None
            }
            Err(e) => {
                tracing::warn!("token refresh failed, using the stale token: {}", e);
                current
            }
        }
    }

    async fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self
            .access_token()
            .await
            .unwrap_or_else(|| self.anon_key.clone());
        builder.header("apikey", &self.anon_key).bearer_auth(bearer)
    }

    async fn request_session(
        &self,
        path_and_query: &str,
        body: &serde_json::Value,
    ) -> StoryResult<AuthSession> {
        let url = format!("{}/auth/v1/{}", self.base_url, path_and_query);
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(body)
            .send()
            .await
            .map_err(|e| StoryError::Auth(format!("auth request failed: {e}")))?;
        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| StoryError::Auth(format!("auth request failed: {e}")))?;
        if !status.is_success() {
            return Err(StoryError::Auth(auth_error_message(status, &raw)));
        }
        serde_json::from_str(&raw)
            .map_err(|e| StoryError::Auth(format!("unexpected auth response: {e}")))
    }
}

async fn check_rest(response: reqwest::Response, what: &str) -> StoryResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoryError::Gateway(format!(
        "{what} failed with status {status}: {body}"
    )))
}

#[async_trait::async_trait]
impl SessionGateway for SupabaseGateway {
    async fn restore_session(&self) -> StoryResult<Option<AuthUser>> {
        let cached = { self.tokens.read().await.clone() };
        let Some(cached) = cached else {
            return Ok(None);
        };
        if !cached.is_expired(Utc::now()) {
            return Ok(Some(auth_user(&cached)));
        }
        match self.refresh_tokens(&cached.refresh_token).await? {
            Some(session) => {
                let fresh = tokens_from_session(&session, Utc::now());
                let user = auth_user(&fresh);
                self.install_tokens(fresh).await;
                tracing::debug!(user_id = %user.id, "session refreshed from cache");
                Ok(Some(user))
            }
            None => {
                self.drop_tokens().await;
                Ok(None)
            }
        }
    }

    async fn sign_in(&self, email: &str, password: &str) -> StoryResult<AuthUser> {
        let body = serde_json::json!({ "email": email, "password": password });
        let session = self
            .request_session("token?grant_type=password", &body)
            .await?;
        let tokens = tokens_from_session(&session, Utc::now());
        let user = auth_user(&tokens);
        self.install_tokens(tokens).await;
        Ok(user)
    }

    async fn sign_up(&self, email: &str, password: &str) -> StoryResult<AuthUser> {
        let url = format!("{}/auth/v1/signup", self.base_url);
        let body = serde_json::json!({ "email": email, "password": password });
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoryError::Auth(format!("sign-up request failed: {e}")))?;
        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| StoryError::Auth(format!("sign-up request failed: {e}")))?;
        if !status.is_success() {
            return Err(StoryError::Auth(auth_error_message(status, &raw)));
        }
        // With email autoconfirm the response is a full session; otherwise it
        // is just the created user and no tokens exist yet.
        if let Ok(session) = serde_json::from_str::<AuthSession>(&raw) {
            let tokens = tokens_from_session(&session, Utc::now());
            let user = auth_user(&tokens);
            self.install_tokens(tokens).await;
            return Ok(user);
        }
        let created: GoTrueUser = serde_json::from_str(&raw)
            .map_err(|e| StoryError::Auth(format!("unexpected sign-up response: {e}")))?;
        tracing::info!("sign-up created an account pending email confirmation");
        Ok(AuthUser {
            id: created.id,
            email: created.email.unwrap_or_else(|| email.to_string()),
        })
    }

    async fn sign_out(&self) -> StoryResult<()> {
        let access = {
            self.tokens
                .read()
                .await
                .as_ref()
                .map(|t| t.access_token.clone())
        };
        if let Some(access) = access {
            let url = format!("{}/auth/v1/logout", self.base_url);
            let result = self
                .client
                .post(&url)
                .header("apikey", &self.anon_key)
                .bearer_auth(&access)
                .send()
                .await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!("server-side logout returned {}", response.status());
                }
                Err(e) => tracing::warn!("server-side logout failed: {}", e),
                _ => {}
            }
        }
        // The local session ends regardless of what the server said.
        self.drop_tokens().await;
        Ok(())
    }

    async fn fetch_profile(&self, user: &AuthUser) -> StoryResult<UserProfile> {
        let url = self.rest_url(&format!("profiles?id=eq.{}&select=*", user.id));
        let response = self
            .authed(self.client.get(&url))
            .await
            .send()
            .await
            .map_err(|e| StoryError::Gateway(format!("profile fetch failed: {e}")))?;
        let response = check_rest(response, "profile fetch").await?;
        let rows: Vec<UserProfile> = response
            .json()
            .await
            .map_err(|e| StoryError::Gateway(format!("profile rows did not parse: {e}")))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoryError::Gateway(format!("no profile row for {}", user.id)))
    }

    async fn update_display_name(&self, user_id: &str, display_name: &str) -> StoryResult<()> {
        let url = self.rest_url(&format!("profiles?id=eq.{user_id}"));
        let response = self
            .authed(self.client.patch(&url))
            .await
            .json(&serde_json::json!({ "displayName": display_name }))
            .send()
            .await
            .map_err(|e| StoryError::Gateway(format!("profile rename failed: {e}")))?;
        check_rest(response, "profile rename").await?;
        Ok(())
    }

    async fn create_story(&self, user_id: &str, story: &Story) -> StoryResult<String> {
        let url = self.rest_url("stories");
        let insert = story_insert(user_id, story, Utc::now());
        let response = self
            .authed(self.client.post(&url))
            .await
            .header("Prefer", "return=representation")
            .json(&insert)
            .send()
            .await
            .map_err(|e| StoryError::Gateway(format!("story insert failed: {e}")))?;
        let response = check_rest(response, "story insert").await?;
        let rows: Vec<StoryRow> = response
            .json()
            .await
            .map_err(|e| StoryError::Gateway(format!("inserted story did not parse: {e}")))?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StoryError::Gateway("story insert returned no row".into()))?;
        tracing::debug!(story_id = %row.id, "story row created");
        Ok(row.id)
    }

    async fn list_stories(&self, user_id: &str) -> StoryResult<Vec<Story>> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let url = self.rest_url(&format!(
            "stories?user_id=eq.{user_id}&select=*&expires_at=gt.{now}&order=created_at.desc"
        ));
        let response = self
            .authed(self.client.get(&url))
            .await
            .send()
            .await
            .map_err(|e| StoryError::Gateway(format!("story listing failed: {e}")))?;
        let response = check_rest(response, "story listing").await?;
        let rows: Vec<StoryRow> = response
            .json()
            .await
            .map_err(|e| StoryError::Gateway(format!("story rows did not parse: {e}")))?;
        tracing::debug!(count = rows.len(), "story rows fetched");
        Ok(rows.into_iter().map(StoryRow::into_story).collect())
    }

    async fn attach_audio(&self, story_id: &str, audio: &AudioClip) -> StoryResult<()> {
        let url = self.rest_url(&format!("stories?id=eq.{story_id}"));
        let response = self
            .authed(self.client.patch(&url))
            .await
            .json(&serde_json::json!({ "audio_data": audio.as_base64() }))
            .send()
            .await
            .map_err(|e| StoryError::Gateway(format!("audio attach failed: {e}")))?;
        check_rest(response, "audio attach").await?;
        Ok(())
    }

    async fn record_generation(&self, user_id: &str) -> StoryResult<()> {
        let url = self.rest_url("rpc/increment_generations");
        let response = self
            .authed(self.client.post(&url))
            .await
            .json(&serde_json::json!({ "user_id": user_id }))
            .send()
            .await
            .map_err(|e| StoryError::Gateway(format!("usage increment failed: {e}")))?;
        check_rest(response, "usage increment").await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

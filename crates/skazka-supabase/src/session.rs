//! On-disk session cache.
//!
//! Supabase hands out a short-lived access token plus a long-lived refresh
//! token. The web original keeps that pair in browser localStorage so a
//! returning visitor is still signed in; here the pair lands in a small JSON
//! file under the data directory instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// The token pair for one signed-in account, as issued by GoTrue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// When the access token stops being accepted. The refresh token
    /// outlives this and is used to mint a replacement.
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
    pub email: Option<String>,
}

impl SessionTokens {
    /// True once the access token can no longer be trusted. A small margin
    /// keeps a token that expires mid-request from sneaking through.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + chrono::Duration::seconds(30)
    }
}

// ---------------------------------------------------------------------------
// Cache file
// ---------------------------------------------------------------------------

/// Reads and writes the session JSON file.
#[derive(Debug, Clone)]
pub struct SessionCache {
    path: PathBuf,
}

impl SessionCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default path: SKAZKA_DATA_DIR or ./data, then skazka_session.json.
    pub fn default_path() -> PathBuf {
        let base = std::env::var("SKAZKA_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        PathBuf::from(base).join("skazka_session.json")
    }

    pub fn open_default() -> Self {
        Self::new(Self::default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached pair, if the file exists and still parses.
    pub fn load(&self) -> Option<SessionTokens> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                tracing::warn!("session cache at {:?} is unreadable: {}", self.path, e);
                None
            }
        }
    }

    /// Persist the pair, creating the data directory on first use.
    pub fn store(&self, tokens: &SessionTokens) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(tokens)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, json)
    }

    /// Remove the file. A missing file is not an error.
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(expires_at: DateTime<Utc>) -> SessionTokens {
        SessionTokens {
            access_token: "at-1".into(),
            refresh_token: "rt-1".into(),
            expires_at,
            user_id: "u-1".into(),
            email: Some("mama@example.com".into()),
        }
    }

    #[test]
    fn a_fresh_token_is_not_expired() {
        let now = Utc::now();
        let tokens = sample(now + Duration::hours(1));
        assert!(!tokens.is_expired(now));
    }

    #[test]
    fn a_token_near_its_deadline_counts_as_expired() {
        let now = Utc::now();
        assert!(sample(now + Duration::seconds(10)).is_expired(now));
        assert!(sample(now - Duration::hours(1)).is_expired(now));
    }

    #[test]
    fn store_load_clear_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path().join("nested").join("session.json"));

        assert!(cache.load().is_none());

        let tokens = sample(Utc::now() + Duration::hours(1));
        cache.store(&tokens).unwrap();

        let loaded = cache.load().expect("tokens should round-trip");
        assert_eq!(loaded.access_token, "at-1");
        assert_eq!(loaded.refresh_token, "rt-1");
        assert_eq!(loaded.user_id, "u-1");
        assert_eq!(loaded.email.as_deref(), Some("mama@example.com"));

        cache.clear().unwrap();
        assert!(cache.load().is_none());
        // Clearing twice stays quiet.
        cache.clear().unwrap();
    }

    #[test]
    fn garbage_on_disk_reads_as_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SessionCache::new(path).load().is_none());
    }
}

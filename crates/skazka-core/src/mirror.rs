//! Local mirror store: best-effort snapshots that survive restarts
//!
//! Short-term DashMap cache in front of a Sled tree. Holds exactly three
//! JSON blobs: the signed-in profile snapshot, the story history, and the
//! guest usage counter. The mirror is only ever written as a reflection of
//! orchestrator-owned state; once a remote session is confirmed it stops
//! being a source of truth.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::path::Path;
use std::sync::Arc;

use crate::error::StoryResult;
use crate::types::{Story, UsageRecord, UserProfile};

const DEFAULT_MIRROR_PATH: &str = "./data/skazka_mirror";

/// Mirror key for the signed-in profile snapshot.
pub const PROFILE_KEY: &str = "profile_snapshot";
/// Mirror key for the story history snapshot.
pub const HISTORY_KEY: &str = "story_history";
/// Mirror key for the guest usage counter.
pub const GUEST_USAGE_KEY: &str = "guest_usage";

/// String-keyed JSON snapshot store with last-write-wins semantics.
pub struct MirrorStore {
    db: Db,
    /// Hot cache: key -> serialized value. Checked before Sled.
    cache: Arc<DashMap<String, Vec<u8>>>,
}

impl MirrorStore {
    /// Opens or creates the mirror at `./data/skazka_mirror`.
    pub fn new() -> StoryResult<Self> {
        Self::open_path(DEFAULT_MIRROR_PATH)
    }

    /// Opens or creates the mirror at the given path.
    pub fn open_path<P: AsRef<Path>>(path: P) -> StoryResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            cache: Arc::new(DashMap::new()),
        })
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StoryResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.insert(key.as_bytes(), bytes.clone())?;
        self.cache.insert(key.to_string(), bytes);
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoryResult<Option<T>> {
        if let Some(bytes) = self.cache.get(key) {
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }
        match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                self.cache.insert(key.to_string(), bytes.to_vec());
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> StoryResult<()> {
        self.db.remove(key.as_bytes())?;
        self.cache.remove(key);
        Ok(())
    }

    // -- profile snapshot ----------------------------------------------------

    pub fn store_profile(&self, profile: &UserProfile) -> StoryResult<()> {
        self.put_json(PROFILE_KEY, profile)
    }

    /// The mirrored profile, if any. Callers treat it as unconfirmed until
    /// the gateway validates the session.
    pub fn load_profile(&self) -> StoryResult<Option<UserProfile>> {
        self.get_json(PROFILE_KEY)
    }

    pub fn clear_profile(&self) -> StoryResult<()> {
        self.remove(PROFILE_KEY)
    }

    // -- story history -------------------------------------------------------

    pub fn store_history(&self, stories: &[Story]) -> StoryResult<()> {
        self.put_json(HISTORY_KEY, &stories)
    }

    pub fn load_history(&self) -> StoryResult<Vec<Story>> {
        Ok(self.get_json(HISTORY_KEY)?.unwrap_or_default())
    }

    pub fn clear_history(&self) -> StoryResult<()> {
        self.remove(HISTORY_KEY)
    }

    // -- guest usage ---------------------------------------------------------

    pub fn store_guest_usage(&self, usage: &UsageRecord) -> StoryResult<()> {
        self.put_json(GUEST_USAGE_KEY, usage)
    }

    pub fn load_guest_usage(&self) -> StoryResult<UsageRecord> {
        Ok(self.get_json(GUEST_USAGE_KEY)?.unwrap_or_default())
    }

    pub fn clear_guest_usage(&self) -> StoryResult<()> {
        self.remove(GUEST_USAGE_KEY)
    }

    /// Flush Sled to disk. Called on clean shutdown; everywhere else the
    /// mirror stays best-effort.
    pub fn flush(&self) -> StoryResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

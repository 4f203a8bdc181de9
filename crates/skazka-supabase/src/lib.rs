//! Supabase adapter for the story session core.
//!
//! Implements [`skazka_core::SessionGateway`] over a Supabase project's
//! GoTrue and PostgREST endpoints. Configure with `SUPABASE_URL` and
//! `SUPABASE_ANON_KEY` (an `.env` file works); without them the app runs
//! in guest-only mode and nothing here is constructed.
//!
//! Signed-in sessions survive restarts through a token cache file in the
//! data directory, mirroring what the web client keeps in localStorage.

mod gateway;
mod session;

pub use gateway::{SupabaseGateway, STORY_RETENTION_DAYS};
pub use session::{SessionCache, SessionTokens};

//! Tier capabilities and the usage quota model
//!
//! Every tier comparison in the workspace goes through [`Tier::caps`]; the
//! evaluator functions are pure so they can be unit-tested with fixed clocks.
//! Counters are cumulative; the orchestrator never decays them itself, it
//! only reports when an external refresh is due via [`next_unlock_eta`].

use chrono::{DateTime, Duration, Utc};
use std::fmt;

use crate::types::{Identity, StoryRequest, Tier, UsageRecord, Voice};

/// Feature and quota envelope for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCaps {
    /// Cumulative generation limit; the counter is reset out of band.
    pub max_generations: u32,
    /// Window after the last generation when an exhausted quota is expected
    /// to unlock. `None` means no countdown is ever shown.
    pub cooldown: Option<Duration>,
    /// Whether the narrator voice picker is honored.
    pub voice_selectable: bool,
    /// Whether the interactive-ending flag is honored.
    pub interactive_allowed: bool,
}

impl Tier {
    /// Capability lookup, the single source of tier gating.
    pub fn caps(self) -> TierCaps {
        match self {
            Tier::Guest => TierCaps {
                max_generations: 1,
                cooldown: None,
                voice_selectable: false,
                interactive_allowed: false,
            },
            Tier::Free => TierCaps {
                max_generations: 1,
                cooldown: Some(Duration::days(7)),
                voice_selectable: false,
                interactive_allowed: false,
            },
            Tier::Storyteller => TierCaps {
                max_generations: 30,
                cooldown: Some(Duration::days(1)),
                voice_selectable: true,
                interactive_allowed: true,
            },
            Tier::Wizard => TierCaps {
                max_generations: 90,
                cooldown: Some(Duration::days(1)),
                voice_selectable: true,
                interactive_allowed: true,
            },
        }
    }
}

fn used_count(identity: &Identity, guest_usage: &UsageRecord) -> u32 {
    match identity {
        Identity::Guest => guest_usage.count,
        Identity::User(profile) => profile.generations_used,
    }
}

fn last_generation_at(
    identity: &Identity,
    guest_usage: &UsageRecord,
) -> Option<DateTime<Utc>> {
    match identity {
        Identity::Guest => guest_usage.last_generation_at,
        Identity::User(profile) => profile.last_generation_date,
    }
}

/// Generations left before the tier limit.
pub fn remaining(identity: &Identity, guest_usage: &UsageRecord) -> u32 {
    identity
        .tier()
        .caps()
        .max_generations
        .saturating_sub(used_count(identity, guest_usage))
}

/// Whether a new generation may start right now.
pub fn is_allowed(identity: &Identity, guest_usage: &UsageRecord) -> bool {
    used_count(identity, guest_usage) < identity.tier().caps().max_generations
}

/// Countdown until an exhausted quota is expected to unlock.
///
/// `None` when quota remains, when the tier has no cooldown window, when the
/// identity never generated anything, or when the window already elapsed
/// (the external refresh is assumed to have happened or be imminent).
pub fn next_unlock_eta(
    identity: &Identity,
    guest_usage: &UsageRecord,
    now: DateTime<Utc>,
) -> Option<UnlockEta> {
    if remaining(identity, guest_usage) > 0 {
        return None;
    }
    let window = identity.tier().caps().cooldown?;
    let last = last_generation_at(identity, guest_usage)?;
    let elapsed = now - last;
    if elapsed >= window {
        return None;
    }
    Some(UnlockEta::from_duration(window - elapsed))
}

/// Force tier-gated request fields back to their defaults where the tier
/// does not allow them. Applied on every submission so a stale UI selection
/// can never leak past a downgrade or sign-out.
pub fn enforce_caps(tier: Tier, mut request: StoryRequest) -> StoryRequest {
    let caps = tier.caps();
    if !caps.voice_selectable {
        request.voice = Voice::default();
    }
    if !caps.interactive_allowed {
        request.interactive = false;
    }
    request
}

/// Remaining cooldown decomposed for display. The visible surface re-renders
/// it at least once per minute; the decomposition itself is a pure snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockEta {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
}

impl UnlockEta {
    fn from_duration(left: Duration) -> Self {
        Self {
            days: left.num_days(),
            hours: left.num_hours() % 24,
            minutes: left.num_minutes() % 60,
        }
    }
}

impl fmt::Display for UnlockEta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.days > 0 {
            write!(f, "{}д ", self.days)?;
        }
        write!(f, "{}ч {}м", self.hours, self.minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Scenario, UserProfile};

    fn profile(tier: Tier, used: u32, last: Option<DateTime<Utc>>) -> Identity {
        let mut profile = UserProfile::fallback("u-1", "user@example.com");
        profile.tier = tier;
        profile.generations_used = used;
        profile.last_generation_date = last;
        Identity::User(profile)
    }

    #[test]
    fn limits_match_published_table() {
        let fresh = UsageRecord::default();
        assert_eq!(remaining(&Identity::Guest, &fresh), 1);
        assert_eq!(remaining(&profile(Tier::Free, 0, None), &fresh), 1);
        assert_eq!(remaining(&profile(Tier::Storyteller, 0, None), &fresh), 30);
        assert_eq!(remaining(&profile(Tier::Wizard, 0, None), &fresh), 90);
    }

    #[test]
    fn allowed_iff_under_limit() {
        let fresh = UsageRecord::default();
        let spent = UsageRecord {
            count: 1,
            last_generation_at: None,
        };
        assert!(is_allowed(&Identity::Guest, &fresh));
        assert!(!is_allowed(&Identity::Guest, &spent));
        assert!(is_allowed(&profile(Tier::Storyteller, 29, None), &fresh));
        assert!(!is_allowed(&profile(Tier::Storyteller, 30, None), &fresh));
        assert!(!is_allowed(&profile(Tier::Wizard, 90, None), &fresh));
    }

    #[test]
    fn free_cooldown_after_an_hour_is_almost_a_week() {
        let now = Utc::now();
        let identity = profile(Tier::Free, 1, Some(now - Duration::hours(1)));
        let eta = next_unlock_eta(&identity, &UsageRecord::default(), now).unwrap();
        assert_eq!((eta.days, eta.hours, eta.minutes), (6, 23, 0));
        assert_eq!(eta.to_string(), "6д 23ч 0м");
    }

    #[test]
    fn countdown_inside_the_final_day_hides_the_day_part() {
        let now = Utc::now();
        let last = Some(now - Duration::hours(5) - Duration::minutes(1));
        let identity = profile(Tier::Storyteller, 30, last);
        let eta = next_unlock_eta(&identity, &UsageRecord::default(), now).unwrap();
        assert_eq!((eta.days, eta.hours, eta.minutes), (0, 18, 59));
        assert_eq!(eta.to_string(), "18ч 59м");
    }

    #[test]
    fn elapsed_window_reports_no_countdown() {
        let now = Utc::now();
        let identity = profile(Tier::Free, 1, Some(now - Duration::days(8)));
        assert!(next_unlock_eta(&identity, &UsageRecord::default(), now).is_none());
    }

    #[test]
    fn no_history_means_no_countdown() {
        let now = Utc::now();
        let identity = profile(Tier::Free, 1, None);
        assert!(next_unlock_eta(&identity, &UsageRecord::default(), now).is_none());
    }

    #[test]
    fn guests_never_see_a_countdown() {
        let now = Utc::now();
        let spent = UsageRecord {
            count: 1,
            last_generation_at: Some(now - Duration::minutes(5)),
        };
        assert!(next_unlock_eta(&Identity::Guest, &spent, now).is_none());
    }

    #[test]
    fn caps_force_defaults_for_free_tier() {
        let mut request = StoryRequest::named("Оля", Scenario::Castle);
        request.voice = Voice::Fenrir;
        request.interactive = true;

        let forced = enforce_caps(Tier::Free, request.clone());
        assert_eq!(forced.voice, Voice::Kore);
        assert!(!forced.interactive);

        let kept = enforce_caps(Tier::Wizard, request);
        assert_eq!(kept.voice, Voice::Fenrir);
        assert!(kept.interactive);
    }
}

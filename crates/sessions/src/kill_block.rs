//! Kill-block table: per-identity embargoes created when a session is
//! killed, governing whether the same client/backend pair may start a new
//! session.
//!
//! An entry is cleared on `resume` of the killed session, or expires per
//! its mode.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use elida_domain::config::{KillBlockConfig, KillBlockMode};

/// One embargo, keyed by derived session identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillBlockEntry {
    /// Derived identity `client-<shorthash>-<backend>` the block applies to.
    pub identity: String,
    pub mode: KillBlockMode,
    /// Embargo length for `Duration` mode.
    pub duration_secs: u64,
    pub created_at: DateTime<Utc>,
    /// The session whose kill created this entry.
    pub session_id: String,
}

impl KillBlockEntry {
    pub fn new(identity: &str, session_id: &str, config: &KillBlockConfig) -> Self {
        Self {
            identity: identity.to_owned(),
            mode: config.mode,
            duration_secs: config.duration_secs,
            created_at: Utc::now(),
            session_id: session_id.to_owned(),
        }
    }

    /// Whether the embargo is still in force at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.mode {
            KillBlockMode::Duration => {
                now.signed_duration_since(self.created_at)
                    < Duration::seconds(self.duration_secs as i64)
            }
            KillBlockMode::Permanent => true,
            KillBlockMode::UntilHourChange => {
                hour_of_epoch(now) == hour_of_epoch(self.created_at)
            }
        }
    }
}

/// Wall-clock hour bucket: `floor(unix_seconds / 3600)`.
fn hour_of_epoch(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(3600)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(mode: KillBlockMode, duration_secs: u64, created: DateTime<Utc>) -> KillBlockEntry {
        KillBlockEntry {
            identity: "client-abcd1234-default".into(),
            mode,
            duration_secs,
            created_at: created,
            session_id: "client-abcd1234-default".into(),
        }
    }

    #[test]
    fn duration_active_within_window() {
        let created = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let e = entry(KillBlockMode::Duration, 300, created);
        assert!(e.is_active(created + Duration::seconds(299)));
        assert!(!e.is_active(created + Duration::seconds(300)));
        assert!(!e.is_active(created + Duration::seconds(599)));
    }

    #[test]
    fn permanent_never_expires() {
        let created = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let e = entry(KillBlockMode::Permanent, 0, created);
        assert!(e.is_active(created + Duration::days(365)));
    }

    #[test]
    fn until_hour_change_expires_on_the_hour() {
        // Kill at 10:30:00 — blocked at 10:59:59, clear at 11:00:00.
        let created = Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap();
        let e = entry(KillBlockMode::UntilHourChange, 0, created);
        assert!(e.is_active(Utc.with_ymd_and_hms(2026, 1, 15, 10, 59, 59).unwrap()));
        assert!(!e.is_active(Utc.with_ymd_and_hms(2026, 1, 15, 11, 0, 0).unwrap()));
    }

    #[test]
    fn until_hour_change_across_midnight() {
        let created = Utc.with_ymd_and_hms(2026, 1, 15, 23, 55, 0).unwrap();
        let e = entry(KillBlockMode::UntilHourChange, 0, created);
        assert!(e.is_active(Utc.with_ymd_and_hms(2026, 1, 15, 23, 59, 59).unwrap()));
        assert!(!e.is_active(Utc.with_ymd_and_hms(2026, 1, 16, 0, 0, 0).unwrap()));
    }
}

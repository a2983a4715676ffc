use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions & lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session lifecycle configuration: timeouts, resume window, retention,
/// and the kill-block policy applied when a session is killed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Sessions with no activity for this long are marked TimedOut by the
    /// sweeper.
    #[serde(default = "d_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long a Killed session remains resumable. After this window the
    /// sweeper terminates it.
    #[serde(default = "d_resume_window")]
    pub resume_window_secs: u64,

    /// How long terminal sessions are retained in memory (and as the TTL
    /// of shared-store blobs) before the sweeper drops them.
    #[serde(default = "d_retention")]
    pub retention_secs: u64,

    /// Sweeper cadence.
    #[serde(default = "d_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Kill-block mode applied when a session is killed.
    #[serde(default)]
    pub kill_block: KillBlockConfig,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: d_idle_timeout(),
            resume_window_secs: d_resume_window(),
            retention_secs: d_retention(),
            sweep_interval_secs: d_sweep_interval(),
            kill_block: KillBlockConfig::default(),
        }
    }
}

/// Governs whether subsequent requests from the same client/backend pair
/// may start a new session after a kill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillBlockConfig {
    #[serde(default)]
    pub mode: KillBlockMode,
    /// Embargo length when `mode = "duration"`.
    #[serde(default = "d_block_duration")]
    pub duration_secs: u64,
}

impl Default for KillBlockConfig {
    fn default() -> Self {
        Self {
            mode: KillBlockMode::Duration,
            duration_secs: d_block_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillBlockMode {
    /// Blocked for `duration_secs` after the kill.
    #[default]
    Duration,
    /// Blocked for the process lifetime.
    Permanent,
    /// Blocked until the wall-clock hour changes.
    UntilHourChange,
}

impl std::fmt::Display for KillBlockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duration => write!(f, "duration"),
            Self::Permanent => write!(f, "permanent"),
            Self::UntilHourChange => write!(f, "until_hour_change"),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_idle_timeout() -> u64 {
    1800
}
fn d_resume_window() -> u64 {
    3600
}
fn d_retention() -> u64 {
    86_400
}
fn d_sweep_interval() -> u64 {
    10
}
fn d_block_duration() -> u64 {
    300
}

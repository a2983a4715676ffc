use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capture buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounds for the per-session request/response capture buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Bodies longer than this are truncated with a `…[truncated]` sentinel.
    #[serde(default = "d_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Oldest entries are evicted beyond this per-session bound.
    #[serde(default = "d_max_entries")]
    pub max_entries_per_session: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: d_max_body_bytes(),
            max_entries_per_session: d_max_entries(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_body_bytes() -> usize {
    10_000
}
fn d_max_entries() -> usize {
    100
}

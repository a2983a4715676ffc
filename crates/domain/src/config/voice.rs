use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice sub-sessions (WebSocket)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Scan text frames live for control messages and policy patterns.
    #[serde(default = "d_true")]
    pub live_scan: bool,

    /// Cap on simultaneously-active voice sub-sessions per WebSocket
    /// session.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_sessions: usize,

    /// Custom control-message parsers: named regexes mapped to a
    /// lifecycle event.
    #[serde(default)]
    pub custom_parsers: Vec<CustomParserRule>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            live_scan: true,
            max_concurrent_sessions: d_max_concurrent(),
            custom_parsers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomParserRule {
    pub name: String,
    /// Case-insensitive regex matched against each text frame.
    pub pattern: String,
    pub event: CustomParserEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomParserEvent {
    Invite,
    Bye,
    TurnStart,
    TurnEnd,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_max_concurrent() -> usize {
    4
}

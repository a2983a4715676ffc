use serde::{Deserialize, Serialize};

use crate::record::{RuleAction, Severity};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,

    /// `enforce` blocks/terminates; `audit` records violations but never
    /// sets the enforcement bits.
    #[serde(default)]
    pub mode: PolicyMode,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    #[serde(default)]
    pub risk_ladder: RiskLadderConfig,

    /// Capture matching request/response pairs on flagged sessions.
    #[serde(default = "d_true")]
    pub capture_content: bool,

    /// Per-violation matched-text snippet cap (bytes).
    #[serde(default = "d_max_capture")]
    pub max_capture_size: usize,

    /// Overlap byte budget for the streaming scanner. When `None`, sized
    /// from the longest configured pattern (floor 64).
    #[serde(default)]
    pub scan_overlap: Option<usize>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: PolicyMode::Enforce,
            rules: Vec::new(),
            risk_ladder: RiskLadderConfig::default(),
            capture_content: true,
            max_capture_size: d_max_capture(),
            scan_overlap: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Enforce,
    Audit,
}

/// One rule as written in configuration. Patterns are compiled once,
/// case-insensitive, at engine construction; a malformed pattern fails
/// startup, never request dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: RuleKind,
    #[serde(default)]
    pub target: RuleTarget,
    pub patterns: Vec<String>,
    #[serde(default = "d_severity")]
    pub severity: Severity,
    #[serde(default = "d_action")]
    pub action: RuleAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    #[default]
    ContentMatch,
    MetricThreshold,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    Request,
    Response,
    #[default]
    Both,
}

impl RuleTarget {
    pub fn includes_request(self) -> bool {
        matches!(self, RuleTarget::Request | RuleTarget::Both)
    }
    pub fn includes_response(self) -> bool {
        matches!(self, RuleTarget::Response | RuleTarget::Both)
    }
}

/// Threshold-indexed mapping from cumulative risk score to enforcement
/// action. The active action is the highest threshold ≤ current score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLadderConfig {
    #[serde(default = "d_warn_at")]
    pub warn_at: u32,
    #[serde(default = "d_throttle_at")]
    pub throttle_at: u32,
    /// Requests per minute once throttled.
    #[serde(default = "d_throttle_rate")]
    pub throttle_rate: u32,
    #[serde(default = "d_block_at")]
    pub block_at: u32,
    #[serde(default = "d_terminate_at")]
    pub terminate_at: u32,
}

impl Default for RiskLadderConfig {
    fn default() -> Self {
        Self {
            warn_at: d_warn_at(),
            throttle_at: d_throttle_at(),
            throttle_rate: d_throttle_rate(),
            block_at: d_block_at(),
            terminate_at: d_terminate_at(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_max_capture() -> usize {
    10_000
}
fn d_severity() -> Severity {
    Severity::Warning
}
fn d_action() -> RuleAction {
    RuleAction::Flag
}
fn d_warn_at() -> u32 {
    5
}
fn d_throttle_at() -> u32 {
    15
}
fn d_throttle_rate() -> u32 {
    10
}
fn d_block_at() -> u32 {
    30
}
fn d_terminate_at() -> u32 {
    50
}

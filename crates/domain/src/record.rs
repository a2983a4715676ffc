//! Session-record wire shapes.
//!
//! A [`SessionRecord`] is the immutable end-of-life summary of a session,
//! emitted exactly once per terminal transition (kill, terminate, timeout,
//! completion) to every configured sink.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rule severity. The numeric weight feeds the risk ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Risk-score weight: info=1, warning=3, critical=10.
    pub fn weight(self) -> u32 {
        match self {
            Severity::Info => 1,
            Severity::Warning => 3,
            Severity::Critical => 10,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// What a matching rule asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Flag,
    Block,
    Terminate,
}

/// One policy violation observed on a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule_name: String,
    pub description: String,
    pub severity: Severity,
    /// A snippet of the content that matched (bounded).
    pub matched_text: String,
    pub action: RuleAction,
    pub timestamp: DateTime<Utc>,
}

/// One captured request/response pair, bodies truncated at capture time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub request_body: String,
    #[serde(default)]
    pub response_body: String,
    pub status: u16,
}

/// A tool invocation observed in request or response bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    /// Provider type tag (e.g. `"function"`, `"tool_use"`).
    pub call_type: String,
    #[serde(default)]
    pub call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Finalized end-of-life summary for one session. Immutable at emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    /// Terminal state name: `killed`, `terminated`, `timed_out`, `completed`.
    pub state: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: i64,
    pub request_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// The backend the session was created against.
    pub backend: String,
    /// Per-backend request counts across the session's lifetime.
    pub backends_used: HashMap<String, u64>,
    pub client_addr: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub captured_content: Vec<CapturedRequest>,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_weights() {
        assert_eq!(Severity::Info.weight(), 1);
        assert_eq!(Severity::Warning.weight(), 3);
        assert_eq!(Severity::Critical.weight(), 10);
    }

    #[test]
    fn severity_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "\"warning\"");
        let s: Severity = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(s, Severity::Critical);
    }

    #[test]
    fn record_roundtrip() {
        let rec = SessionRecord {
            id: "client-abc123-default".into(),
            state: "completed".into(),
            start: Utc::now(),
            end: Utc::now(),
            duration_ms: 1500,
            request_count: 3,
            bytes_in: 1024,
            bytes_out: 4096,
            tokens_in: 200,
            tokens_out: 800,
            backend: "default".into(),
            backends_used: HashMap::from([("default".into(), 3)]),
            client_addr: "1.2.3.4:5678".into(),
            metadata: HashMap::new(),
            captured_content: Vec::new(),
            violations: Vec::new(),
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, rec.id);
        assert_eq!(back.backends_used.get("default"), Some(&3));
    }
}

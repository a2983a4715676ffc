//! Flagged-session side table: sessions with at least one violation,
//! their cumulative risk score, current ladder action, and (when content
//! capture is on) the request/response pairs that tripped rules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use elida_domain::record::{CapturedRequest, Violation};

use crate::ladder::LadderAction;

/// Violations kept per flagged session; oldest evicted beyond this.
const VIOLATION_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct FlaggedSession {
    pub session_id: String,
    pub first_flagged: DateTime<Utc>,
    pub last_flagged: DateTime<Utc>,
    pub risk_score: u32,
    pub current_action: LadderAction,
    pub violations: Vec<Violation>,
    pub captures: Vec<CapturedRequest>,
}

pub struct FlaggedRegistry {
    sessions: RwLock<HashMap<String, FlaggedSession>>,
    max_captures: usize,
}

impl FlaggedRegistry {
    pub fn new(max_captures: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_captures,
        }
    }

    /// Record violations and add `added_score`; returns the session's new
    /// cumulative risk score.
    pub fn record(&self, session_id: &str, violations: &[Violation], added_score: u32) -> u32 {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| FlaggedSession {
                session_id: session_id.to_owned(),
                first_flagged: now,
                last_flagged: now,
                risk_score: 0,
                current_action: LadderAction::None,
                violations: Vec::new(),
                captures: Vec::new(),
            });
        entry.last_flagged = now;
        entry.risk_score += added_score;
        entry.violations.extend_from_slice(violations);
        let overflow = entry.violations.len().saturating_sub(VIOLATION_CAP);
        if overflow > 0 {
            entry.violations.drain(..overflow);
        }
        entry.risk_score
    }

    pub fn set_action(&self, session_id: &str, action: LadderAction) {
        if let Some(entry) = self.sessions.write().get_mut(session_id) {
            entry.current_action = action;
        }
    }

    /// Current risk score; zero for sessions never flagged.
    pub fn score(&self, session_id: &str) -> u32 {
        self.sessions
            .read()
            .get(session_id)
            .map(|e| e.risk_score)
            .unwrap_or(0)
    }

    /// Attach a captured request/response pair, bounded FIFO.
    pub fn attach_capture(&self, session_id: &str, capture: CapturedRequest) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.captures.push(capture);
            if entry.captures.len() > self.max_captures {
                entry.captures.remove(0);
            }
        }
    }

    pub fn is_flagged(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<FlaggedSession> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<FlaggedSession> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elida_domain::record::{RuleAction, Severity};

    fn violation(rule: &str) -> Violation {
        Violation {
            rule_name: rule.into(),
            description: String::new(),
            severity: Severity::Warning,
            matched_text: "match".into(),
            action: RuleAction::Flag,
            timestamp: Utc::now(),
        }
    }

    fn capture(body: &str) -> CapturedRequest {
        CapturedRequest {
            timestamp: Utc::now(),
            method: "POST".into(),
            path: "/".into(),
            request_body: body.into(),
            response_body: String::new(),
            status: 200,
        }
    }

    #[test]
    fn score_accumulates() {
        let reg = FlaggedRegistry::new(100);
        assert_eq!(reg.record("s1", &[violation("a")], 3), 3);
        assert_eq!(reg.record("s1", &[violation("b")], 9), 12);
        assert_eq!(reg.score("s1"), 12);
        assert_eq!(reg.score("unknown"), 0);
    }

    #[test]
    fn captures_bounded_fifo() {
        let reg = FlaggedRegistry::new(2);
        reg.record("s1", &[violation("a")], 1);
        for i in 0..4 {
            reg.attach_capture("s1", capture(&format!("req-{i}")));
        }
        let entry = reg.get("s1").unwrap();
        assert_eq!(entry.captures.len(), 2);
        assert_eq!(entry.captures[0].request_body, "req-2");
    }

    #[test]
    fn capture_ignored_for_unflagged_session() {
        let reg = FlaggedRegistry::new(2);
        reg.attach_capture("s1", capture("req"));
        assert!(reg.get("s1").is_none());
    }

    #[test]
    fn violations_preserve_order() {
        let reg = FlaggedRegistry::new(10);
        reg.record("s1", &[violation("first")], 1);
        reg.record("s1", &[violation("second")], 1);
        let entry = reg.get("s1").unwrap();
        assert_eq!(entry.violations[0].rule_name, "first");
        assert_eq!(entry.violations[1].rule_name, "second");
    }
}

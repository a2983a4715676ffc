//! Bounded, truncating per-session capture of request/response pairs.
//!
//! Captures feed the flagged-session detail view and the end-of-life
//! session record. Bodies are truncated at capture time; the per-session
//! entry list is bounded with FIFO eviction. Sessions are sharded so
//! concurrent captures across sessions never contend on one lock.

use dashmap::DashMap;

use elida_domain::config::CaptureConfig;
use elida_domain::record::CapturedRequest;

/// Appended to bodies cut at `max_body_bytes`.
pub const TRUNCATION_SENTINEL: &str = "…[truncated]";

pub struct CaptureBuffer {
    sessions: DashMap<String, Vec<CapturedRequest>>,
    max_body_bytes: usize,
    max_entries: usize,
}

impl CaptureBuffer {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            max_body_bytes: config.max_body_bytes,
            max_entries: config.max_entries_per_session,
        }
    }

    /// Truncate `body` to the configured cap, marking the cut.
    /// The cut lands on a char boundary so the result stays valid UTF-8.
    fn truncate(&self, body: &str) -> String {
        if body.len() <= self.max_body_bytes {
            return body.to_owned();
        }
        let mut cut = self.max_body_bytes;
        while cut > 0 && !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}{TRUNCATION_SENTINEL}", &body[..cut])
    }

    /// Append an entry for `session_id`, truncating both bodies and
    /// evicting the oldest entry past the per-session bound.
    pub fn capture(&self, session_id: &str, mut entry: CapturedRequest) {
        entry.request_body = self.truncate(&entry.request_body);
        entry.response_body = self.truncate(&entry.response_body);

        let mut entries = self.sessions.entry(session_id.to_owned()).or_default();
        entries.push(entry);
        if entries.len() > self.max_entries {
            entries.remove(0);
        }
    }

    /// Store the response body and status on the most recent entry.
    /// No-op when the session has no captures.
    pub fn update_last_response(&self, session_id: &str, body: &str, status: u16) {
        if let Some(mut entries) = self.sessions.get_mut(session_id) {
            if let Some(last) = entries.last_mut() {
                last.response_body = self.truncate(body);
                last.status = status;
            }
        }
    }

    /// The session's entries without consuming them. Safe for live
    /// inspection from the control surface.
    pub fn peek(&self, session_id: &str) -> Vec<CapturedRequest> {
        self.sessions
            .get(session_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Drain: return the entries and clear the session's buffer.
    pub fn get(&self, session_id: &str) -> Vec<CapturedRequest> {
        self.sessions
            .remove(session_id)
            .map(|(_, entries)| entries)
            .unwrap_or_default()
    }

    pub fn has_content(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|e| !e.is_empty())
            .unwrap_or(false)
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn buffer(max_body: usize, max_entries: usize) -> CaptureBuffer {
        CaptureBuffer::new(&CaptureConfig {
            max_body_bytes: max_body,
            max_entries_per_session: max_entries,
        })
    }

    fn entry(body: &str) -> CapturedRequest {
        CapturedRequest {
            timestamp: Utc::now(),
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            request_body: body.into(),
            response_body: String::new(),
            status: 0,
        }
    }

    #[test]
    fn short_bodies_pass_through() {
        let buf = buffer(100, 10);
        buf.capture("s1", entry("hello"));
        assert_eq!(buf.peek("s1")[0].request_body, "hello");
    }

    #[test]
    fn long_bodies_truncated_with_sentinel() {
        let buf = buffer(10, 10);
        buf.capture("s1", entry("0123456789abcdef"));
        let stored = &buf.peek("s1")[0].request_body;
        assert_eq!(stored, &format!("0123456789{TRUNCATION_SENTINEL}"));
        assert!(stored.len() <= 10 + TRUNCATION_SENTINEL.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let buf = buffer(5, 10);
        // 'é' is two bytes; a naive cut at 5 would split it.
        buf.capture("s1", entry("ababé rest"));
        let stored = &buf.peek("s1")[0].request_body;
        assert!(stored.ends_with(TRUNCATION_SENTINEL));
    }

    #[test]
    fn oldest_entry_evicted_past_bound() {
        let buf = buffer(1000, 3);
        for i in 0..5 {
            buf.capture("s1", entry(&format!("req-{i}")));
        }
        let entries = buf.peek("s1");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].request_body, "req-2");
        assert_eq!(entries[2].request_body, "req-4");
    }

    #[test]
    fn update_last_response_targets_newest() {
        let buf = buffer(1000, 10);
        buf.capture("s1", entry("first"));
        buf.capture("s1", entry("second"));
        buf.update_last_response("s1", "resp", 200);
        let entries = buf.peek("s1");
        assert_eq!(entries[0].response_body, "");
        assert_eq!(entries[1].response_body, "resp");
        assert_eq!(entries[1].status, 200);
    }

    #[test]
    fn update_last_response_noop_without_entries() {
        let buf = buffer(1000, 10);
        buf.update_last_response("missing", "resp", 200);
        assert!(!buf.has_content("missing"));
    }

    #[test]
    fn get_drains() {
        let buf = buffer(1000, 10);
        buf.capture("s1", entry("a"));
        assert!(buf.has_content("s1"));
        assert_eq!(buf.get("s1").len(), 1);
        assert!(!buf.has_content("s1"));
        assert!(buf.get("s1").is_empty());
    }

    #[test]
    fn sessions_are_independent() {
        let buf = buffer(1000, 2);
        buf.capture("s1", entry("a"));
        buf.capture("s2", entry("b"));
        buf.remove("s1");
        assert!(!buf.has_content("s1"));
        assert!(buf.has_content("s2"));
    }
}

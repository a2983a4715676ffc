//! Bounded in-memory ring of lifecycle and policy events, backing
//! `GET /control/events`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// A single observable event.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// e.g. `session_created`, `session_killed`, `policy_violation`,
    /// `stream_severed`, `backend_error`, `voice_started`.
    pub event_type: String,
    /// `info`, `warning`, or `critical`.
    pub severity: String,
    pub detail: serde_json::Value,
}

/// Query filters for the control surface.
#[derive(Debug, Default)]
pub struct EventQuery {
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// Thread-safe ring buffer; the oldest event is evicted at capacity.
pub struct EventLog {
    inner: Mutex<VecDeque<ProxyEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(
        &self,
        session_id: Option<&str>,
        event_type: &str,
        severity: &str,
        detail: serde_json::Value,
    ) {
        let mut buf = self.inner.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(ProxyEvent {
            timestamp: Utc::now(),
            session_id: session_id.map(String::from),
            event_type: event_type.to_owned(),
            severity: severity.to_owned(),
            detail,
        });
    }

    /// Matching events, newest first, after offset/limit paging.
    pub fn query(&self, q: &EventQuery) -> Vec<ProxyEvent> {
        let limit = if q.limit == 0 { 100 } else { q.limit };
        let buf = self.inner.lock();
        buf.iter()
            .rev()
            .filter(|e| {
                q.session_id
                    .as_deref()
                    .map_or(true, |s| e.session_id.as_deref() == Some(s))
                    && q.event_type.as_deref().map_or(true, |t| e.event_type == t)
                    && q.severity.as_deref().map_or(true, |s| e.severity == s)
                    && q.since.map_or(true, |t| e.timestamp >= t)
                    && q.until.map_or(true, |t| e.timestamp <= t)
            })
            .skip(q.offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(n: usize) -> EventLog {
        let log = EventLog::new(100);
        for i in 0..n {
            log.record(
                Some(&format!("s{}", i % 2)),
                if i % 3 == 0 { "policy_violation" } else { "session_created" },
                "info",
                serde_json::json!({ "i": i }),
            );
        }
        log
    }

    #[test]
    fn ring_evicts_oldest() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.record(None, "e", "info", serde_json::json!(i));
        }
        assert_eq!(log.len(), 3);
        let events = log.query(&EventQuery::default());
        // Newest first.
        assert_eq!(events[0].detail, serde_json::json!(4));
        assert_eq!(events[2].detail, serde_json::json!(2));
    }

    #[test]
    fn filters_by_session_and_type() {
        let log = log_with(10);
        let q = EventQuery {
            session_id: Some("s0".into()),
            ..Default::default()
        };
        assert!(log.query(&q).iter().all(|e| e.session_id.as_deref() == Some("s0")));

        let q = EventQuery {
            event_type: Some("policy_violation".into()),
            ..Default::default()
        };
        assert_eq!(log.query(&q).len(), 4);
    }

    #[test]
    fn paging() {
        let log = log_with(10);
        let q = EventQuery {
            limit: 3,
            offset: 2,
            ..Default::default()
        };
        let events = log.query(&q);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].detail, serde_json::json!({ "i": 7 }));
    }
}

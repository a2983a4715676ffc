//! Record-sink middleware: enriches the manager's bare records with
//! captured content and violations before they reach the terminal sinks,
//! and mirrors each terminal transition into the event log.

use std::sync::Arc;

use elida_capture::CaptureBuffer;
use elida_domain::record::SessionRecord;
use elida_policy::PolicyEngine;
use elida_sessions::SessionRecordSink;

use crate::events::EventLog;

pub struct EnrichingSink {
    capture: Arc<CaptureBuffer>,
    policy: Option<Arc<PolicyEngine>>,
    events: Arc<EventLog>,
    inner: Arc<dyn SessionRecordSink>,
}

impl EnrichingSink {
    pub fn new(
        capture: Arc<CaptureBuffer>,
        policy: Option<Arc<PolicyEngine>>,
        events: Arc<EventLog>,
        inner: Arc<dyn SessionRecordSink>,
    ) -> Self {
        Self {
            capture,
            policy,
            events,
            inner,
        }
    }
}

impl SessionRecordSink for EnrichingSink {
    fn emit(&self, record: &SessionRecord) {
        let mut record = record.clone();

        // Drain this episode's captures into the record.
        record.captured_content = self.capture.get(&record.id);

        if let Some(policy) = &self.policy {
            if let Some(flagged) = policy.flagged().get(&record.id) {
                record.violations = flagged.violations.clone();
                if record.captured_content.is_empty() {
                    record.captured_content = flagged.captures.clone();
                }
            }
        }

        self.events.record(
            Some(&record.id),
            "session_ended",
            if record.violations.is_empty() { "info" } else { "warning" },
            serde_json::json!({
                "state": record.state,
                "request_count": record.request_count,
                "bytes_in": record.bytes_in,
                "bytes_out": record.bytes_out,
                "violations": record.violations.len(),
            }),
        );

        self.inner.emit(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use elida_domain::config::{CaptureConfig, PolicyConfig, PolicyMode, RuleConfig};
    use elida_domain::record::{CapturedRequest, RuleAction, Severity};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct CollectingSink(Mutex<Vec<SessionRecord>>);

    impl SessionRecordSink for CollectingSink {
        fn emit(&self, record: &SessionRecord) {
            self.0.lock().push(record.clone());
        }
    }

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.into(),
            state: "killed".into(),
            start: Utc::now(),
            end: Utc::now(),
            duration_ms: 0,
            request_count: 1,
            bytes_in: 0,
            bytes_out: 0,
            tokens_in: 0,
            tokens_out: 0,
            backend: "default".into(),
            backends_used: HashMap::new(),
            client_addr: "1.2.3.4:1".into(),
            metadata: HashMap::new(),
            captured_content: Vec::new(),
            violations: Vec::new(),
        }
    }

    #[test]
    fn enriches_with_captures_and_violations() {
        let capture = Arc::new(CaptureBuffer::new(&CaptureConfig::default()));
        capture.capture(
            "s1",
            CapturedRequest {
                timestamp: Utc::now(),
                method: "POST".into(),
                path: "/v1/chat".into(),
                request_body: "hello".into(),
                response_body: String::new(),
                status: 200,
            },
        );

        let policy = PolicyEngine::new(
            &PolicyConfig {
                mode: PolicyMode::Enforce,
                rules: vec![RuleConfig {
                    name: "r".into(),
                    description: String::new(),
                    kind: Default::default(),
                    target: Default::default(),
                    patterns: vec!["bad".into()],
                    severity: Severity::Warning,
                    action: RuleAction::Flag,
                }],
                ..Default::default()
            },
            100,
        )
        .unwrap();
        policy.evaluate("s1", elida_policy::Direction::Request, "bad content");

        let events = Arc::new(EventLog::new(10));
        let inner = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let sink = EnrichingSink::new(capture.clone(), Some(policy), events.clone(), inner.clone());

        sink.emit(&record("s1"));

        let emitted = inner.0.lock();
        assert_eq!(emitted[0].captured_content.len(), 1);
        assert_eq!(emitted[0].violations.len(), 1);
        assert_eq!(events.len(), 1);
        // Capture buffer was drained.
        assert!(!capture.has_content("s1"));
    }
}

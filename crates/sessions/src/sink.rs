//! Session-record sinks.
//!
//! The manager emits exactly one [`SessionRecord`] per terminal episode;
//! sinks decide where it goes. [`TraceRecordSink`] emits one structured
//! span per record (picked up by the OTLP exporter when configured);
//! the history database adapter lives in the gateway crate.

use std::sync::Arc;

use elida_domain::record::SessionRecord;
use elida_domain::trace::TraceEvent;

pub trait SessionRecordSink: Send + Sync {
    fn emit(&self, record: &SessionRecord);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Structured-trace emitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emits one `session_record` span per record, with the full record as a
/// single JSON field.
pub struct TraceRecordSink;

impl SessionRecordSink for TraceRecordSink {
    fn emit(&self, record: &SessionRecord) {
        let span = tracing::info_span!(
            "session_record",
            session_id = %record.id,
            state = %record.state,
            backend = %record.backend,
            duration_ms = record.duration_ms,
            request_count = record.request_count,
            bytes_in = record.bytes_in,
            bytes_out = record.bytes_out,
            violations = record.violations.len(),
        );
        let _entered = span.enter();
        let json = serde_json::to_string(record).unwrap_or_default();
        tracing::info!(record = %json, "session ended");

        TraceEvent::RecordEmitted {
            session_id: record.id.clone(),
            state: record.state.clone(),
            sink: "trace".into(),
        }
        .emit();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fan-out
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Forwards each record to every inner sink, in registration order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn SessionRecordSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn SessionRecordSink>>) -> Self {
        Self { sinks }
    }
}

impl SessionRecordSink for FanoutSink {
    fn emit(&self, record: &SessionRecord) {
        for sink in &self.sinks {
            sink.emit(record);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    pub(crate) struct CollectingSink(pub Mutex<Vec<SessionRecord>>);

    impl SessionRecordSink for CollectingSink {
        fn emit(&self, record: &SessionRecord) {
            self.0.lock().push(record.clone());
        }
    }

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.into(),
            state: "completed".into(),
            start: Utc::now(),
            end: Utc::now(),
            duration_ms: 0,
            request_count: 0,
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
    fn fanout_reaches_all_sinks() {
        let a = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let b = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let fanout = FanoutSink::new(vec![a.clone(), b.clone()]);
        fanout.emit(&record("s1"));
        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock().len(), 1);
    }
}

use serde::Serialize;

/// Structured trace events emitted across all ELIDA crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_id: String,
        backend: String,
        client_addr: String,
    },
    SessionKilled {
        session_id: String,
        block_mode: String,
    },
    SessionResumed {
        session_id: String,
    },
    SessionTerminated {
        session_id: String,
    },
    SessionTimedOut {
        session_id: String,
        idle_secs: i64,
    },
    SessionCompleted {
        session_id: String,
        request_count: u64,
    },
    KillBlockHit {
        identity: String,
        mode: String,
    },
    KillPropagated {
        session_id: String,
    },
    PolicyViolation {
        session_id: String,
        rule: String,
        severity: String,
        action: String,
        risk_score: u32,
    },
    StreamSevered {
        session_id: String,
        rule: String,
        bytes_forwarded: u64,
    },
    RecordEmitted {
        session_id: String,
        state: String,
        sink: String,
    },
    BackendError {
        session_id: String,
        backend: String,
        error: String,
    },
    VoiceSessionStarted {
        ws_session_id: String,
        voice_id: String,
        protocol: String,
    },
    VoiceSessionEnded {
        ws_session_id: String,
        voice_id: String,
        turns: u32,
        transcript_entries: usize,
    },
    StoreDegraded {
        error: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "elida_event");
    }
}

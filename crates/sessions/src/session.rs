//! The session model: one logical conversation between one client origin
//! and one backend, with tracked lifecycle, counters, and a one-shot kill
//! notification for in-flight handlers.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use elida_domain::record::{SessionRecord, ToolCallRecord};

/// Bounded tool-call history per session; older entries evicted FIFO.
pub const TOOL_HISTORY_CAP: usize = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session lifecycle state. Transitions move forward only
/// (Active → Killed | TimedOut | Completed), with the single exception of
/// an explicit resume (Killed → Active). The irreversible `terminated`
/// flag lives on [`Session`], not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Killed,
    TimedOut,
    Completed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Active)
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Killed => "killed",
            SessionState::TimedOut => "timed_out",
            SessionState::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session data
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serializable session state. Counters are monotonically non-decreasing;
/// once `end` is set no counter changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub client_addr: String,
    /// The backend the session was created against.
    pub backend: String,
    pub state: SessionState,
    /// Irreversible. A terminated session is refused on re-create and can
    /// never be resumed.
    #[serde(default)]
    pub terminated: bool,
    #[serde(default)]
    pub is_websocket: bool,

    pub start: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Set on kill; drives the resume-window auto-terminate.
    #[serde(default)]
    pub killed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub tool_call_count: u64,
    /// WebSocket frames, both directions.
    #[serde(default)]
    pub frame_count: u64,
    /// Consecutive backend failures. Tracked for future policy hooks;
    /// nothing acts on it.
    #[serde(default)]
    pub backend_errors: u64,

    #[serde(default)]
    pub backends_used: HashMap<String, u64>,
    #[serde(default)]
    pub tool_call_counts: HashMap<String, u64>,
    #[serde(default)]
    pub tool_history: VecDeque<ToolCallRecord>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Guards against duplicate record emission for one terminal episode.
    /// Reset on resume so a revived session gets its own end-of-life record.
    #[serde(default)]
    pub emitted: bool,
}

impl Session {
    pub fn new(id: String, backend: String, client_addr: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            client_addr,
            backend,
            state: SessionState::Active,
            terminated: false,
            is_websocket: false,
            start: now,
            last_activity: now,
            end: None,
            killed_at: None,
            request_count: 0,
            bytes_in: 0,
            bytes_out: 0,
            tokens_in: 0,
            tokens_out: 0,
            tool_call_count: 0,
            frame_count: 0,
            backend_errors: 0,
            backends_used: HashMap::new(),
            tool_call_counts: HashMap::new(),
            tool_history: VecDeque::new(),
            metadata: HashMap::new(),
            emitted: false,
        }
    }

    /// Whether the session still accepts counter mutations.
    fn open(&self) -> bool {
        self.end.is_none()
    }

    /// Record one admitted request toward `backend`.
    pub fn touch_request(&mut self, backend: &str) {
        if !self.open() {
            return;
        }
        self.last_activity = Utc::now();
        self.request_count += 1;
        *self.backends_used.entry(backend.to_owned()).or_insert(0) += 1;
    }

    pub fn add_bytes_in(&mut self, n: u64) {
        if self.open() {
            self.bytes_in += n;
            self.last_activity = Utc::now();
        }
    }

    pub fn add_bytes_out(&mut self, n: u64) {
        if self.open() {
            self.bytes_out += n;
            self.last_activity = Utc::now();
        }
    }

    pub fn add_tokens(&mut self, tokens_in: u64, tokens_out: u64) {
        if self.open() {
            self.tokens_in += tokens_in;
            self.tokens_out += tokens_out;
        }
    }

    pub fn add_frame(&mut self, bytes: u64, inbound: bool) {
        if !self.open() {
            return;
        }
        self.frame_count += 1;
        if inbound {
            self.bytes_in += bytes;
        } else {
            self.bytes_out += bytes;
        }
        self.last_activity = Utc::now();
    }

    /// Append to the bounded tool history and bump the per-tool counter.
    pub fn record_tool_call(&mut self, record: ToolCallRecord) {
        if !self.open() {
            return;
        }
        self.tool_call_count += 1;
        *self
            .tool_call_counts
            .entry(record.tool_name.clone())
            .or_insert(0) += 1;
        self.tool_history.push_back(record);
        while self.tool_history.len() > TOOL_HISTORY_CAP {
            self.tool_history.pop_front();
        }
    }

    /// Terminal state name for records: `terminated` overrides the enum.
    pub fn record_state(&self) -> &'static str {
        if self.terminated {
            "terminated"
        } else {
            self.state.name()
        }
    }

    /// Build the end-of-life record from the current state. Capture and
    /// violation enrichment happens in the sink chain.
    pub fn to_record(&self) -> SessionRecord {
        let end = self.end.unwrap_or_else(Utc::now);
        SessionRecord {
            id: self.id.clone(),
            state: self.record_state().to_owned(),
            start: self.start,
            end,
            duration_ms: end.signed_duration_since(self.start).num_milliseconds(),
            request_count: self.request_count,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            backend: self.backend.clone(),
            backends_used: self.backends_used.clone(),
            client_addr: self.client_addr.clone(),
            metadata: self.metadata.clone(),
            captured_content: Vec::new(),
            violations: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kill signal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One-shot broadcast notification fired on kill / terminate / timeout.
/// Once fired it stays fired; any streaming forwarder observing it aborts
/// before writing the next frame. Re-armed (replaced) on resume.
#[derive(Debug)]
pub struct KillSignal {
    token: RwLock<CancellationToken>,
}

impl KillSignal {
    pub fn new() -> Self {
        Self {
            token: RwLock::new(CancellationToken::new()),
        }
    }

    /// Fire the notification. Manager-only.
    pub(crate) fn fire(&self) {
        self.token.read().cancel();
    }

    /// Replace the fired token with a fresh one. Manager-only, on resume.
    pub(crate) fn rearm(&self) {
        *self.token.write() = CancellationToken::new();
    }

    pub fn is_fired(&self) -> bool {
        self.token.read().is_cancelled()
    }

    /// An owned future resolving when the signal fires. Safe to hold
    /// across await points in a `tokio::select!`.
    pub fn wait_for_kill(&self) -> WaitForCancellationFutureOwned {
        self.token.read().clone().cancelled_owned()
    }
}

impl Default for KillSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared handle to one live session: state behind a read/write lock
/// (one writer, many readers) plus the kill signal.
#[derive(Debug)]
pub struct SessionHandle {
    data: RwLock<Session>,
    kill: KillSignal,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            data: RwLock::new(session),
            kill: KillSignal::new(),
        }
    }

    pub fn id(&self) -> String {
        self.data.read().id.clone()
    }

    /// Read access to the session state. Keep the guard short-lived.
    pub fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.data.read()
    }

    /// Clone of the current state, for snapshots and serialization.
    pub fn snapshot(&self) -> Session {
        self.data.read().clone()
    }

    /// Run `f` under the session's write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.data.write())
    }

    pub fn kill_signal(&self) -> &KillSignal {
        &self.kill
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("client-abcd1234-default".into(), "default".into(), "1.2.3.4:5678".into())
    }

    #[test]
    fn counters_frozen_after_end() {
        let mut s = session();
        s.add_bytes_in(100);
        s.end = Some(Utc::now());
        s.add_bytes_in(100);
        s.add_bytes_out(50);
        s.touch_request("default");
        assert_eq!(s.bytes_in, 100);
        assert_eq!(s.bytes_out, 0);
        assert_eq!(s.request_count, 0);
    }

    #[test]
    fn tool_history_evicts_fifo() {
        let mut s = session();
        for i in 0..(TOOL_HISTORY_CAP + 10) {
            s.record_tool_call(ToolCallRecord {
                tool_name: format!("tool-{i}"),
                call_type: "function".into(),
                call_id: None,
                timestamp: Utc::now(),
                request_id: None,
            });
        }
        assert_eq!(s.tool_history.len(), TOOL_HISTORY_CAP);
        assert_eq!(s.tool_history.front().unwrap().tool_name, "tool-10");
        assert_eq!(s.tool_call_count, (TOOL_HISTORY_CAP + 10) as u64);
    }

    #[test]
    fn kill_signal_stays_fired() {
        let sig = KillSignal::new();
        assert!(!sig.is_fired());
        sig.fire();
        assert!(sig.is_fired());
        sig.fire();
        assert!(sig.is_fired());
    }

    #[test]
    fn kill_signal_rearm_clears() {
        let sig = KillSignal::new();
        sig.fire();
        sig.rearm();
        assert!(!sig.is_fired());
    }

    #[tokio::test]
    async fn wait_for_kill_resolves_on_fire() {
        let sig = KillSignal::new();
        let wait = sig.wait_for_kill();
        sig.fire();
        wait.await;
    }

    #[test]
    fn record_state_prefers_terminated() {
        let mut s = session();
        s.state = SessionState::Killed;
        s.terminated = true;
        assert_eq!(s.record_state(), "terminated");
    }

    #[test]
    fn to_record_carries_counters() {
        let mut s = session();
        s.touch_request("default");
        s.add_bytes_in(10);
        s.add_bytes_out(20);
        s.state = SessionState::Completed;
        s.end = Some(Utc::now());
        let rec = s.to_record();
        assert_eq!(rec.state, "completed");
        assert_eq!(rec.request_count, 1);
        assert_eq!(rec.bytes_in, 10);
        assert_eq!(rec.bytes_out, 20);
        assert_eq!(rec.backends_used.get("default"), Some(&1));
    }
}

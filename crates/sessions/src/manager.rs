//! The authoritative session map and kill-block table.
//!
//! Lifecycle operations (kill / resume / terminate / complete) all take
//! the session's write lock and re-check state under it, so a `resume`
//! racing the auto-terminate sweeper either wins (session back to Active)
//! or loses (session terminated) but never both.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use elida_domain::config::SessionsConfig;
use elida_domain::error::{Error, Result};
use elida_domain::trace::TraceEvent;

use crate::kill_block::KillBlockEntry;
use crate::session::{Session, SessionHandle, SessionState};
use crate::sink::SessionRecordSink;
use crate::store::SessionStore;

/// Derive the stable session identity for a client/backend pair:
/// `client-<shorthash(client-ip)>-<backend-name>`.
///
/// The port is stripped so reconnects from ephemeral ports map to the
/// same session.
pub fn derive_identity(client_addr: &str, backend: &str) -> String {
    let ip = client_addr
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(client_addr);
    let digest = Sha256::digest(ip.as_bytes());
    format!("client-{}-{}", hex::encode(&digest[..4]), backend)
}

/// Aggregate counters for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total: usize,
    pub active: usize,
    pub killed: usize,
    pub timed_out: usize,
    pub completed: usize,
    pub terminated: usize,
    pub kill_blocks: usize,
    pub request_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    kill_blocks: RwLock<HashMap<String, KillBlockEntry>>,
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn SessionRecordSink>,
    config: SessionsConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        sink: Arc<dyn SessionRecordSink>,
        config: SessionsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            kill_blocks: RwLock::new(HashMap::new()),
            store,
            sink,
            config,
        })
    }

    // ── Admission ────────────────────────────────────────────────────

    /// Resolve or create the session for `identity`.
    ///
    /// Fails with [`Error::SessionForbidden`] when the identity refers to
    /// a killed or terminated session. A TimedOut or Completed session is
    /// not revived; a fresh session is created under the same identity.
    /// An empty identity gets a random one.
    pub async fn get_or_create(
        &self,
        identity: &str,
        backend: &str,
        client_addr: &str,
    ) -> Result<Arc<SessionHandle>> {
        self.admit(identity, backend, client_addr, false).await
    }

    /// `replace_killed` is set on the by-client path: once the kill-block
    /// has expired, a lingering Killed session no longer bars the pair —
    /// the embargo, not the corpse, is the authority there.
    async fn admit(
        &self,
        identity: &str,
        backend: &str,
        client_addr: &str,
        replace_killed: bool,
    ) -> Result<Arc<SessionHandle>> {
        let identity = if identity.is_empty() {
            format!("session-{}", uuid::Uuid::new_v4())
        } else {
            identity.to_owned()
        };

        // Fast path: live session under this identity.
        let existing = self.sessions.read().get(&identity).cloned();
        if let Some(handle) = existing {
            enum Disposition {
                Touched,
                Forbidden(String),
                Replace,
            }
            let disposition = handle.update(|s| {
                if s.terminated {
                    Disposition::Forbidden("terminated".into())
                } else if s.state == SessionState::Killed {
                    if replace_killed {
                        Disposition::Replace
                    } else {
                        Disposition::Forbidden("killed".into())
                    }
                } else if s.state == SessionState::Active {
                    s.touch_request(backend);
                    Disposition::Touched
                } else {
                    // TimedOut / Completed: not revived.
                    Disposition::Replace
                }
            });
            match disposition {
                Disposition::Touched => {
                    self.persist(&handle).await;
                    return Ok(handle);
                }
                Disposition::Forbidden(reason) => {
                    return Err(Error::SessionForbidden {
                        session_id: identity,
                        reason,
                    });
                }
                Disposition::Replace => {}
            }
        }

        // Slow path: create (or replace a terminal session).
        let mut session = Session::new(identity.clone(), backend.to_owned(), client_addr.to_owned());
        session.touch_request(backend);
        let handle = Arc::new(SessionHandle::new(session));
        self.sessions.write().insert(identity.clone(), handle.clone());

        TraceEvent::SessionCreated {
            session_id: identity,
            backend: backend.to_owned(),
            client_addr: client_addr.to_owned(),
        }
        .emit();

        self.persist(&handle).await;
        Ok(handle)
    }

    /// Resolve or create by derived identity, enforcing any live
    /// kill-block for the client/backend pair.
    pub async fn get_or_create_by_client(
        &self,
        client_addr: &str,
        backend_name: &str,
    ) -> Result<Arc<SessionHandle>> {
        let identity = derive_identity(client_addr, backend_name);

        if let Some(entry) = self.lookup_block(&identity).await {
            if entry.is_active(Utc::now()) {
                TraceEvent::KillBlockHit {
                    identity: identity.clone(),
                    mode: entry.mode.to_string(),
                }
                .emit();
                return Err(Error::SessionForbidden {
                    session_id: identity,
                    reason: "kill_blocked".into(),
                });
            }
            // Expired — clear it and fall through to admission.
            self.kill_blocks.write().remove(&identity);
            let _ = self.store.delete_block(&identity).await;
        }

        self.admit(&identity, backend_name, client_addr, true).await
    }

    /// Local table first, shared store second (covers process restarts).
    async fn lookup_block(&self, identity: &str) -> Option<KillBlockEntry> {
        if let Some(entry) = self.kill_blocks.read().get(identity).cloned() {
            return Some(entry);
        }
        match self.store.get_block(identity).await {
            Ok(Some(entry)) => {
                self.kill_blocks
                    .write()
                    .insert(identity.to_owned(), entry.clone());
                Some(entry)
            }
            _ => None,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Kill an Active session: fire the kill notification, record a
    /// kill-block per the configured mode, emit the session record, and
    /// propagate the kill to peer instances. Returns false if the session
    /// is missing or not Active.
    pub async fn kill(&self, id: &str) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        let now = Utc::now();
        let killed = handle.update(|s| {
            if s.state != SessionState::Active {
                return false;
            }
            s.state = SessionState::Killed;
            s.end = Some(now);
            s.killed_at = Some(now);
            true
        });
        if !killed {
            return false;
        }
        handle.kill_signal().fire();

        let entry = KillBlockEntry::new(id, id, &self.config.kill_block);
        TraceEvent::SessionKilled {
            session_id: id.to_owned(),
            block_mode: entry.mode.to_string(),
        }
        .emit();
        self.kill_blocks.write().insert(id.to_owned(), entry.clone());
        let _ = self.store.put_block(&entry).await;

        self.persist(&handle).await;
        let _ = self.store.publish_kill(id).await;
        self.emit_record(&handle).await;
        true
    }

    /// Revive a Killed (not terminated) session: back to Active, kill
    /// notification re-armed, kill-block cleared. Returns false otherwise.
    pub async fn resume(&self, id: &str) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        let resumed = handle.update(|s| {
            if s.state != SessionState::Killed || s.terminated {
                return false;
            }
            s.state = SessionState::Active;
            s.end = None;
            s.killed_at = None;
            s.last_activity = Utc::now();
            // The kill record stands for the killed episode; a revived
            // session earns its own terminal record later.
            s.emitted = false;
            true
        });
        if !resumed {
            return false;
        }
        handle.kill_signal().rearm();

        self.kill_blocks.write().remove(id);
        let _ = self.store.delete_block(id).await;
        self.persist(&handle).await;

        TraceEvent::SessionResumed {
            session_id: id.to_owned(),
        }
        .emit();
        true
    }

    /// Irreversibly terminate. Also blocks re-creation of the derived
    /// identity for the process lifetime. Returns false if the session is
    /// missing or already terminated.
    pub async fn terminate(&self, id: &str) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        let now = Utc::now();
        let terminated = handle.update(|s| {
            if s.terminated {
                return false;
            }
            s.terminated = true;
            if s.state == SessionState::Active {
                s.state = SessionState::Killed;
            }
            if s.end.is_none() {
                s.end = Some(now);
            }
            true
        });
        if !terminated {
            return false;
        }
        handle.kill_signal().fire();

        let entry = KillBlockEntry {
            identity: id.to_owned(),
            mode: elida_domain::config::KillBlockMode::Permanent,
            duration_secs: 0,
            created_at: now,
            session_id: id.to_owned(),
        };
        self.kill_blocks.write().insert(id.to_owned(), entry.clone());
        let _ = self.store.put_block(&entry).await;

        self.persist(&handle).await;
        let _ = self.store.publish_kill(id).await;
        self.emit_record(&handle).await;

        TraceEvent::SessionTerminated {
            session_id: id.to_owned(),
        }
        .emit();
        true
    }

    /// Normal end of life: Active → Completed. Fires no kill notification.
    pub async fn complete(&self, id: &str) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        let completed = handle.update(|s| {
            if s.state != SessionState::Active {
                return false;
            }
            s.state = SessionState::Completed;
            s.end = Some(Utc::now());
            true
        });
        if !completed {
            return false;
        }
        self.persist(&handle).await;
        let request_count = handle.read().request_count;
        self.emit_record(&handle).await;

        TraceEvent::SessionCompleted {
            session_id: id.to_owned(),
            request_count,
        }
        .emit();
        true
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(id).cloned()
    }

    /// Consistent snapshot of all sessions.
    pub fn list(&self) -> Vec<Session> {
        self.sessions
            .read()
            .values()
            .map(|h| h.snapshot())
            .collect()
    }

    pub fn stats(&self) -> ManagerStats {
        let sessions = self.list();
        let mut stats = ManagerStats {
            total: sessions.len(),
            active: 0,
            killed: 0,
            timed_out: 0,
            completed: 0,
            terminated: 0,
            kill_blocks: self.kill_blocks.read().len(),
            request_count: 0,
            bytes_in: 0,
            bytes_out: 0,
            tokens_in: 0,
            tokens_out: 0,
        };
        for s in &sessions {
            if s.terminated {
                stats.terminated += 1;
            }
            match s.state {
                SessionState::Active => stats.active += 1,
                SessionState::Killed => stats.killed += 1,
                SessionState::TimedOut => stats.timed_out += 1,
                SessionState::Completed => stats.completed += 1,
            }
            stats.request_count += s.request_count;
            stats.bytes_in += s.bytes_in;
            stats.bytes_out += s.bytes_out;
            stats.tokens_in += s.tokens_in;
            stats.tokens_out += s.tokens_out;
        }
        stats
    }

    /// Write the session's current state through to the store.
    pub async fn persist(&self, handle: &SessionHandle) {
        if let Err(e) = self.store.put(&handle.snapshot()).await {
            tracing::warn!(error = %e, "session store write failed");
        }
    }

    // ── Sweeper ──────────────────────────────────────────────────────

    /// One sweep pass: idle Active sessions time out, Killed sessions past
    /// the resume window terminate, terminal sessions past retention are
    /// dropped, and expired kill-blocks are pruned.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let idle = Duration::seconds(self.config.idle_timeout_secs as i64);
        let resume_window = Duration::seconds(self.config.resume_window_secs as i64);
        let retention = Duration::seconds(self.config.retention_secs as i64);

        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().values().cloned().collect();

        let mut drop_ids = Vec::new();
        for handle in handles {
            let snapshot = handle.snapshot();

            if snapshot.state == SessionState::Active
                && now.signed_duration_since(snapshot.last_activity) >= idle
            {
                self.time_out(&handle, now).await;
                continue;
            }

            if snapshot.state == SessionState::Killed && !snapshot.terminated {
                if let Some(killed_at) = snapshot.killed_at {
                    if now.signed_duration_since(killed_at) >= resume_window {
                        self.terminate(&snapshot.id).await;
                        continue;
                    }
                }
            }

            if snapshot.state.is_terminal() {
                if let Some(end) = snapshot.end {
                    if now.signed_duration_since(end) >= retention {
                        drop_ids.push(snapshot.id);
                    }
                }
            }
        }

        for id in drop_ids {
            self.sessions.write().remove(&id);
            let _ = self.store.delete(&id).await;
            tracing::debug!(session_id = %id, "retention sweep dropped session");
        }

        // Prune expired embargoes (Permanent ones never expire).
        let expired: Vec<String> = self
            .kill_blocks
            .read()
            .iter()
            .filter(|(_, e)| !e.is_active(now))
            .map(|(k, _)| k.clone())
            .collect();
        for identity in expired {
            self.kill_blocks.write().remove(&identity);
            let _ = self.store.delete_block(&identity).await;
        }
    }

    async fn time_out(&self, handle: &Arc<SessionHandle>, now: DateTime<Utc>) {
        let timed_out = handle.update(|s| {
            if s.state != SessionState::Active {
                return false;
            }
            s.state = SessionState::TimedOut;
            s.end = Some(now);
            true
        });
        if !timed_out {
            return;
        }
        handle.kill_signal().fire();
        self.persist(handle).await;

        let (id, idle_secs) = {
            let s = handle.read();
            (
                s.id.clone(),
                now.signed_duration_since(s.last_activity).num_seconds(),
            )
        };
        self.emit_record(handle).await;
        TraceEvent::SessionTimedOut {
            session_id: id,
            idle_secs,
        }
        .emit();
    }

    // ── Record emission ──────────────────────────────────────────────

    /// Emit at most one record per terminal episode.
    async fn emit_record(&self, handle: &Arc<SessionHandle>) {
        let record = handle.update(|s| {
            if s.emitted {
                None
            } else {
                s.emitted = true;
                Some(s.to_record())
            }
        });
        if let Some(record) = record {
            self.sink.emit(&record);
            self.persist(handle).await;
        }
    }

    // ── Cross-instance kill propagation ──────────────────────────────

    /// Consume the store's kill fan-out: when a peer instance kills a
    /// session we mirror, adopt the killed state and fire the local
    /// notification. The originating instance already emitted the record.
    pub async fn run_kill_listener(self: Arc<Self>) {
        let mut rx = self.store.subscribe_kills();
        loop {
            match rx.recv().await {
                Ok(id) => self.apply_remote_kill(&id).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "kill fan-out lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn apply_remote_kill(&self, id: &str) {
        let Some(handle) = self.get(id) else {
            return;
        };
        let remote = self.store.get(id).await.ok().flatten();
        let now = Utc::now();
        let changed = handle.update(|s| {
            if let Some(remote) = &remote {
                s.terminated = s.terminated || remote.terminated;
                // Remote already emitted this episode's record.
                s.emitted = s.emitted || remote.emitted;
            }
            if s.state != SessionState::Active {
                return false;
            }
            s.state = SessionState::Killed;
            s.end = Some(now);
            s.killed_at = Some(now);
            true
        });
        if changed {
            handle.kill_signal().fire();
            TraceEvent::KillPropagated {
                session_id: id.to_owned(),
            }
            .emit();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

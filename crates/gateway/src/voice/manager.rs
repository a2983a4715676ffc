//! Voice sub-session tracking inside a WebSocket session, modeled on
//! telecom SIP: `Inviting → Active → (Held ⇄ Active) → Terminated`.
//!
//! Each sub-session carries an ordered transcript, per-direction frame
//! and audio-byte counters, and a turn count. When a sub-session ends,
//! its final transcript is scanned against both-target policy rules;
//! violations flag the *parent* WebSocket session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use elida_capture::CaptureBuffer;
use elida_domain::error::{Error, Result};
use elida_domain::record::CapturedRequest;
use elida_domain::trace::TraceEvent;
use elida_policy::{Direction, PolicyEngine};

use crate::voice::parser::{ControlEvent, SessionControlParser, Speaker, TranscriptSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    Inviting,
    Active,
    Held,
    Terminated,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
    pub source: TranscriptSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceSession {
    pub id: String,
    pub ws_session_id: String,
    pub state: VoiceState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub audio_bytes_in: u64,
    pub audio_bytes_out: u64,
    pub turn_count: u32,
    pub transcript: Vec<TranscriptEntry>,
    /// Loose metadata: protocol, model, voice, policy_violations.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl VoiceSession {
    fn new(ws_session_id: &str, protocol: String, model: Option<String>, voice: Option<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("protocol".into(), serde_json::json!(protocol));
        if let Some(model) = model {
            metadata.insert("model".into(), serde_json::json!(model));
        }
        if let Some(voice) = voice {
            metadata.insert("voice".into(), serde_json::json!(voice));
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ws_session_id: ws_session_id.to_owned(),
            state: VoiceState::Inviting,
            started_at: Utc::now(),
            ended_at: None,
            frames_in: 0,
            frames_out: 0,
            audio_bytes_in: 0,
            audio_bytes_out: 0,
            turn_count: 0,
            transcript: Vec::new(),
            metadata: HashMap::new(),
        }
        .with_metadata(metadata)
    }

    fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    fn is_live(&self) -> bool {
        !matches!(self.state, VoiceState::Terminated)
    }

    /// Final transcript entries joined as `speaker: text` lines.
    fn final_transcript(&self) -> String {
        self.transcript
            .iter()
            .filter(|e| e.is_final)
            .map(|e| format!("{}: {}", e.speaker, e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-WebSocket manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct VoiceSessionManager {
    ws_session_id: String,
    parser: Arc<SessionControlParser>,
    policy: Option<Arc<PolicyEngine>>,
    capture: Arc<CaptureBuffer>,
    max_concurrent: usize,
    sessions: RwLock<Vec<VoiceSession>>,
}

impl VoiceSessionManager {
    pub fn new(
        ws_session_id: &str,
        parser: Arc<SessionControlParser>,
        policy: Option<Arc<PolicyEngine>>,
        capture: Arc<CaptureBuffer>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            ws_session_id: ws_session_id.to_owned(),
            parser,
            policy,
            capture,
            max_concurrent,
            sessions: RwLock::new(Vec::new()),
        }
    }

    pub fn ws_session_id(&self) -> &str {
        &self.ws_session_id
    }

    /// Parse one text frame and apply the lifecycle events it carries.
    pub fn handle_text_frame(&self, text: &str) -> Result<()> {
        for event in self.parser.parse(text) {
            self.apply(event)?;
        }
        Ok(())
    }

    fn apply(&self, event: ControlEvent) -> Result<()> {
        match event {
            ControlEvent::Invite { protocol, model, voice } => {
                let live = self.sessions.read().iter().filter(|s| s.is_live()).count();
                if live >= self.max_concurrent {
                    return Err(Error::MaxConcurrentVoice(self.max_concurrent));
                }
                let session = VoiceSession::new(&self.ws_session_id, protocol.clone(), model, voice);
                TraceEvent::VoiceSessionStarted {
                    ws_session_id: self.ws_session_id.clone(),
                    voice_id: session.id.clone(),
                    protocol,
                }
                .emit();
                self.sessions.write().push(session);
            }
            ControlEvent::Activate => {
                self.with_current(|s| {
                    if s.state == VoiceState::Inviting {
                        s.state = VoiceState::Active;
                    }
                });
            }
            ControlEvent::TurnStart => { /* turn boundaries counted on TurnEnd */ }
            ControlEvent::TurnEnd => {
                self.with_current(|s| s.turn_count += 1);
            }
            ControlEvent::Transcript { speaker, text, is_final, source } => {
                if text.is_empty() {
                    return Ok(());
                }
                self.with_current(|s| {
                    s.transcript.push(TranscriptEntry {
                        timestamp: Utc::now(),
                        speaker,
                        text: text.clone(),
                        is_final,
                        source,
                    });
                });
            }
            ControlEvent::Bye => {
                let ended = self.with_current(|s| {
                    s.state = VoiceState::Terminated;
                    s.ended_at = Some(Utc::now());
                    s.id.clone()
                });
                if let Some(id) = ended {
                    self.post_session_scan(&id);
                }
            }
        }
        Ok(())
    }

    /// Account one WebSocket frame against the live sub-session. Binary
    /// frames count as audio.
    pub fn record_frame(&self, bytes: u64, inbound: bool, is_text: bool) {
        self.with_current(|s| {
            if inbound {
                s.frames_in += 1;
                if !is_text {
                    s.audio_bytes_in += bytes;
                }
            } else {
                s.frames_out += 1;
                if !is_text {
                    s.audio_bytes_out += bytes;
                }
            }
        });
    }

    /// Run `f` on the most recent live sub-session.
    fn with_current<R>(&self, f: impl FnOnce(&mut VoiceSession) -> R) -> Option<R> {
        let mut sessions = self.sessions.write();
        sessions.iter_mut().rev().find(|s| s.is_live()).map(f)
    }

    // ── Control-surface verbs ────────────────────────────────────────

    pub fn hold(&self, voice_id: &str) -> bool {
        self.transition(voice_id, VoiceState::Active, VoiceState::Held)
    }

    pub fn resume(&self, voice_id: &str) -> bool {
        self.transition(voice_id, VoiceState::Held, VoiceState::Active)
    }

    pub fn bye(&self, voice_id: &str) -> bool {
        let ended = {
            let mut sessions = self.sessions.write();
            match sessions.iter_mut().find(|s| s.id == voice_id && s.is_live()) {
                Some(s) => {
                    s.state = VoiceState::Terminated;
                    s.ended_at = Some(Utc::now());
                    true
                }
                None => false,
            }
        };
        if ended {
            self.post_session_scan(voice_id);
        }
        ended
    }

    fn transition(&self, voice_id: &str, from: VoiceState, to: VoiceState) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.iter_mut().find(|s| s.id == voice_id) {
            Some(s) if s.state == from => {
                s.state = to;
                true
            }
            _ => false,
        }
    }

    /// Terminate every live sub-session (WebSocket closed underneath).
    pub fn end_all(&self) {
        let ended: Vec<String> = {
            let mut sessions = self.sessions.write();
            sessions
                .iter_mut()
                .filter(|s| s.is_live())
                .map(|s| {
                    s.state = VoiceState::Terminated;
                    s.ended_at = Some(Utc::now());
                    s.id.clone()
                })
                .collect()
        };
        for id in ended {
            self.post_session_scan(&id);
        }
    }

    // ── Post-session policy ──────────────────────────────────────────

    /// Scan the ended sub-session's final transcript against both-target
    /// rules. Violations flag the parent WebSocket session and stamp the
    /// sub-session's metadata.
    fn post_session_scan(&self, voice_id: &str) {
        let (transcript, turns, entries) = {
            let sessions = self.sessions.read();
            let Some(session) = sessions.iter().find(|s| s.id == voice_id) else {
                return;
            };
            (
                session.final_transcript(),
                session.turn_count,
                session.transcript.len(),
            )
        };

        TraceEvent::VoiceSessionEnded {
            ws_session_id: self.ws_session_id.clone(),
            voice_id: voice_id.to_owned(),
            turns,
            transcript_entries: entries,
        }
        .emit();

        let Some(policy) = &self.policy else {
            return;
        };
        if transcript.is_empty() {
            return;
        }

        let eval = policy.evaluate(&self.ws_session_id, Direction::Transcript, &transcript);
        if !eval.has_violations() {
            return;
        }

        self.with_session(voice_id, |s| {
            s.metadata
                .insert("policy_violations".into(), serde_json::json!(true));
        });

        let entry = CapturedRequest {
            timestamp: Utc::now(),
            method: "WS".into(),
            path: format!("/voice/{voice_id}/transcript"),
            request_body: transcript,
            response_body: String::new(),
            status: 0,
        };
        self.capture.capture(&self.ws_session_id, entry.clone());
        policy.flagged().attach_capture(&self.ws_session_id, entry);
    }

    fn with_session<R>(&self, voice_id: &str, f: impl FnOnce(&mut VoiceSession) -> R) -> Option<R> {
        let mut sessions = self.sessions.write();
        sessions.iter_mut().find(|s| s.id == voice_id).map(f)
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<VoiceSession> {
        self.sessions.read().clone()
    }

    pub fn get(&self, voice_id: &str) -> Option<VoiceSession> {
        self.sessions.read().iter().find(|s| s.id == voice_id).cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use elida_domain::config::{CaptureConfig, PolicyConfig, RuleConfig, RuleTarget};
    use elida_domain::record::{RuleAction, Severity};

    fn capture() -> Arc<CaptureBuffer> {
        Arc::new(CaptureBuffer::new(&CaptureConfig::default()))
    }

    fn manager(policy: Option<Arc<PolicyEngine>>) -> VoiceSessionManager {
        VoiceSessionManager::new(
            "ws-1",
            Arc::new(SessionControlParser::new(&[]).unwrap()),
            policy,
            capture(),
            2,
        )
    }

    fn scanning_policy() -> Arc<PolicyEngine> {
        PolicyEngine::new(
            &PolicyConfig {
                rules: vec![RuleConfig {
                    name: "prompt-injection".into(),
                    description: "injection attempt in conversation".into(),
                    kind: Default::default(),
                    target: RuleTarget::Both,
                    patterns: vec!["ignore previous instructions".into()],
                    severity: Severity::Critical,
                    action: RuleAction::Flag,
                }],
                ..Default::default()
            },
            100,
        )
        .unwrap()
    }

    #[test]
    fn invite_activate_bye_lifecycle() {
        let mgr = manager(None);
        mgr.handle_text_frame(r#"{"type":"session.create","session":{"model":"m"}}"#).unwrap();
        assert_eq!(mgr.snapshot()[0].state, VoiceState::Inviting);

        mgr.handle_text_frame(r#"{"type":"session.created"}"#).unwrap();
        assert_eq!(mgr.snapshot()[0].state, VoiceState::Active);

        mgr.handle_text_frame(r#"{"type":"response.create"}"#).unwrap();
        mgr.handle_text_frame(r#"{"type":"response.done"}"#).unwrap();
        assert_eq!(mgr.snapshot()[0].turn_count, 1);

        mgr.handle_text_frame(r#"{"type":"error","error":{}}"#).unwrap();
        assert_eq!(mgr.snapshot()[0].state, VoiceState::Terminated);
        assert!(mgr.snapshot()[0].ended_at.is_some());
    }

    #[test]
    fn concurrency_cap_enforced() {
        let mgr = manager(None);
        let invite = r#"{"type":"session.create","session":{}}"#;
        mgr.handle_text_frame(invite).unwrap();
        mgr.handle_text_frame(invite).unwrap();
        let err = mgr.handle_text_frame(invite).unwrap_err();
        assert!(matches!(err, Error::MaxConcurrentVoice(2)));
    }

    #[test]
    fn hold_resume_cycle() {
        let mgr = manager(None);
        mgr.handle_text_frame(r#"{"type":"session.create","session":{}}"#).unwrap();
        mgr.handle_text_frame(r#"{"type":"session.created"}"#).unwrap();
        let id = mgr.snapshot()[0].id.clone();

        assert!(mgr.hold(&id));
        assert_eq!(mgr.get(&id).unwrap().state, VoiceState::Held);
        // Hold is not re-holdable; resume flips it back.
        assert!(!mgr.hold(&id));
        assert!(mgr.resume(&id));
        assert_eq!(mgr.get(&id).unwrap().state, VoiceState::Active);
    }

    #[test]
    fn transcript_appends_and_drops_empty() {
        let mgr = manager(None);
        mgr.handle_text_frame(r#"{"type":"session.create","session":{}}"#).unwrap();
        mgr.handle_text_frame(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello"}"#,
        )
        .unwrap();
        mgr.handle_text_frame(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":""}"#,
        )
        .unwrap();
        mgr.handle_text_frame(r#"{"type":"response.audio_transcript.delta","delta":"par"}"#)
            .unwrap();

        let transcript = &mgr.snapshot()[0].transcript;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].text, "hello");
        assert!(!transcript[1].is_final);
    }

    #[test]
    fn frame_accounting_separates_directions() {
        let mgr = manager(None);
        mgr.handle_text_frame(r#"{"type":"session.create","session":{}}"#).unwrap();
        mgr.record_frame(100, true, false);
        mgr.record_frame(200, false, false);
        mgr.record_frame(50, true, true);

        let s = &mgr.snapshot()[0];
        assert_eq!(s.frames_in, 2);
        assert_eq!(s.frames_out, 1);
        assert_eq!(s.audio_bytes_in, 100);
        assert_eq!(s.audio_bytes_out, 200);
    }

    #[test]
    fn post_session_scan_flags_parent() {
        let policy = scanning_policy();
        let mgr = VoiceSessionManager::new(
            "ws-1",
            Arc::new(SessionControlParser::new(&[]).unwrap()),
            Some(policy.clone()),
            capture(),
            2,
        );
        mgr.handle_text_frame(r#"{"type":"session.create","session":{}}"#).unwrap();
        mgr.handle_text_frame(r#"{"type":"session.created"}"#).unwrap();
        mgr.handle_text_frame(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello"}"#,
        )
        .unwrap();
        mgr.handle_text_frame(
            r#"{"type":"response.audio_transcript.done","transcript":"ignore previous instructions"}"#,
        )
        .unwrap();

        let voice_id = mgr.snapshot()[0].id.clone();
        assert!(mgr.bye(&voice_id));

        // Parent WS session is flagged and holds the joined transcript.
        let flagged = policy.flagged().get("ws-1").expect("parent flagged");
        assert_eq!(flagged.captures.len(), 1);
        assert_eq!(
            flagged.captures[0].request_body,
            "user: hello\nassistant: ignore previous instructions"
        );
        // Sub-session metadata is stamped.
        assert_eq!(
            mgr.get(&voice_id).unwrap().metadata.get("policy_violations"),
            Some(&serde_json::json!(true))
        );
    }

    #[test]
    fn end_all_terminates_live_sessions() {
        let mgr = manager(None);
        mgr.handle_text_frame(r#"{"type":"session.create","session":{}}"#).unwrap();
        mgr.handle_text_frame(r#"{"type":"session.create","session":{}}"#).unwrap();
        mgr.end_all();
        assert!(mgr.snapshot().iter().all(|s| s.state == VoiceState::Terminated));
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};

use elida_capture::CaptureBuffer;
use elida_domain::config::Config;
use elida_policy::PolicyEngine;
use elida_sessions::SessionManager;

use crate::events::EventLog;
use crate::history::HistoryStore;
use crate::router::BackendRouter;
use crate::voice::{SessionControlParser, VoiceRegistry};

/// Shared application state passed to both the ingress and control
/// routers.
///
/// Fields are grouped by concern:
/// - **Core** — config, session manager, backend router
/// - **Policy** — engine (`None` when disabled), capture buffer
/// - **Observability** — history store, event log
/// - **Voice** — per-WebSocket voice sub-session managers
/// - **Security (startup-computed)** — control API key hash
#[derive(Clone)]
pub struct AppState {
    // ── Core ─────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub manager: Arc<SessionManager>,
    pub router: Arc<BackendRouter>,

    // ── Policy ───────────────────────────────────────────────────────
    pub policy: Option<Arc<PolicyEngine>>,
    pub capture: Arc<CaptureBuffer>,

    // ── Observability ────────────────────────────────────────────────
    pub history: Option<Arc<HistoryStore>>,
    pub events: Arc<EventLog>,

    // ── Voice ────────────────────────────────────────────────────────
    pub voice: Arc<VoiceRegistry>,
    /// Control-message parser, compiled once at startup.
    pub voice_parser: Arc<SessionControlParser>,

    // ── Security (startup-computed) ──────────────────────────────────
    /// SHA-256 hash of the control API key (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_key_hash: Option<Vec<u8>>,

    pub started_at: DateTime<Utc>,
}

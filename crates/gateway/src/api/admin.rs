//! Health and aggregate-stats endpoints.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use chrono::Utc;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/health — lightweight probe (public, no auth)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "capture_mode": state.config.policy.capture_content,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/stats — aggregate counters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let manager = state.manager.stats();
    let flagged = state
        .policy
        .as_ref()
        .map(|p| p.flagged().list().len())
        .unwrap_or(0);

    let mut per_backend = serde_json::Map::new();
    for session in state.manager.list() {
        for (backend, count) in session.backends_used {
            let entry = per_backend.entry(backend).or_insert(serde_json::json!(0));
            if let Some(n) = entry.as_u64() {
                *entry = serde_json::json!(n + count);
            }
        }
    }

    Json(serde_json::json!({
        "uptime_secs": Utc::now().signed_duration_since(state.started_at).num_seconds(),
        "sessions": {
            "total": manager.total,
            "active": manager.active,
            "killed": manager.killed,
            "timed_out": manager.timed_out,
            "completed": manager.completed,
            "terminated": manager.terminated,
        },
        "kill_blocks": manager.kill_blocks,
        "flagged_sessions": flagged,
        "traffic": {
            "request_count": manager.request_count,
            "bytes_in": manager.bytes_in,
            "bytes_out": manager.bytes_out,
            "tokens_in": manager.tokens_in,
            "tokens_out": manager.tokens_out,
        },
        "per_backend_requests": per_backend,
        "events_buffered": state.events.len(),
    }))
}

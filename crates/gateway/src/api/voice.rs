//! Voice sub-session control endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::state::AppState;

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("{what} not found") })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/voice
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_all(State(state): State<AppState>) -> impl IntoResponse {
    let listing: Vec<serde_json::Value> = state
        .voice
        .list()
        .iter()
        .map(|mgr| {
            serde_json::json!({
                "ws_session_id": mgr.ws_session_id(),
                "voice_sessions": mgr.snapshot(),
            })
        })
        .collect();
    let count = listing.len();
    Json(serde_json::json!({ "websocket_sessions": listing, "count": count }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/voice/{ws_id}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_ws(State(state): State<AppState>, Path(ws_id): Path<String>) -> Response {
    match state.voice.get(&ws_id) {
        Some(mgr) => Json(serde_json::json!({
            "ws_session_id": ws_id,
            "voice_sessions": mgr.snapshot(),
        }))
        .into_response(),
        None => not_found("websocket session"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/voice/{ws_id}/{voice_id}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_voice(
    State(state): State<AppState>,
    Path((ws_id, voice_id)): Path<(String, String)>,
) -> Response {
    let Some(mgr) = state.voice.get(&ws_id) else {
        return not_found("websocket session");
    };
    match mgr.get(&voice_id) {
        Some(session) => Json(serde_json::json!({ "voice_session": session })).into_response(),
        None => not_found("voice session"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /control/voice/{ws_id}/{voice_id}/bye | /hold | /resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn bye(
    State(state): State<AppState>,
    Path((ws_id, voice_id)): Path<(String, String)>,
) -> Response {
    verb(state, &ws_id, &voice_id, "bye", |mgr, id| mgr.bye(id))
}

pub async fn hold(
    State(state): State<AppState>,
    Path((ws_id, voice_id)): Path<(String, String)>,
) -> Response {
    verb(state, &ws_id, &voice_id, "hold", |mgr, id| mgr.hold(id))
}

pub async fn resume(
    State(state): State<AppState>,
    Path((ws_id, voice_id)): Path<(String, String)>,
) -> Response {
    verb(state, &ws_id, &voice_id, "resume", |mgr, id| mgr.resume(id))
}

fn verb(
    state: AppState,
    ws_id: &str,
    voice_id: &str,
    action: &str,
    apply: impl FnOnce(&crate::voice::VoiceSessionManager, &str) -> bool,
) -> Response {
    let Some(mgr) = state.voice.get(ws_id) else {
        return not_found("websocket session");
    };
    if mgr.get(voice_id).is_none() {
        return not_found("voice session");
    }
    let applied = apply(&mgr, voice_id);
    state.events.record(
        Some(ws_id),
        "voice_control",
        "info",
        serde_json::json!({ "voice_id": voice_id, "action": action, "applied": applied }),
    );
    Json(serde_json::json!({
        "ws_session_id": ws_id,
        "voice_id": voice_id,
        "action": action,
        "applied": applied,
    }))
    .into_response()
}

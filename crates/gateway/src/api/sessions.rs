//! Session control endpoints: list, detail, kill / resume / terminate.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use elida_sessions::SessionState;

use crate::state::AppState;

fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// `active=true` restricts to Active sessions.
    #[serde(default)]
    pub active: Option<bool>,
    /// Exact state name: `active`, `killed`, `timed_out`, `completed`.
    #[serde(default)]
    pub state: Option<String>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let mut sessions = state.manager.list();

    if query.active == Some(true) {
        sessions.retain(|s| s.state == SessionState::Active);
    }
    if let Some(wanted) = &query.state {
        sessions.retain(|s| s.state.name() == wanted || (wanted == "terminated" && s.terminated));
    }
    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

    let count = sessions.len();
    Json(serde_json::json!({ "sessions": sessions, "count": count }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/sessions/{id}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.get(&id) {
        Some(handle) => {
            let session = handle.snapshot();
            let flagged = state
                .policy
                .as_ref()
                .and_then(|p| p.flagged().get(&id))
                .map(|f| serde_json::json!({ "risk_score": f.risk_score, "violations": f.violations.len() }));
            Json(serde_json::json!({
                "session": session,
                "kill_pending": handle.kill_signal().is_fired(),
                "flagged": flagged,
                "captures_buffered": state.capture.peek(&id).len(),
            }))
            .into_response()
        }
        None => api_error(StatusCode::NOT_FOUND, "session not found"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /control/sessions/{id}/kill | /resume | /terminate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn kill_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.manager.get(&id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "session not found");
    }
    let killed = state.manager.kill(&id).await;
    state.events.record(
        Some(&id),
        "session_killed",
        "warning",
        serde_json::json!({ "via": "control", "applied": killed }),
    );
    Json(serde_json::json!({ "session_id": id, "killed": killed })).into_response()
}

pub async fn resume_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(handle) = state.manager.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, "session not found");
    };
    if handle.read().terminated {
        return api_error(StatusCode::FORBIDDEN, "session is terminated");
    }
    let resumed = state.manager.resume(&id).await;
    state.events.record(
        Some(&id),
        "session_resumed",
        "info",
        serde_json::json!({ "via": "control", "applied": resumed }),
    );
    Json(serde_json::json!({ "session_id": id, "resumed": resumed })).into_response()
}

pub async fn terminate_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.manager.get(&id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "session not found");
    }
    let terminated = state.manager.terminate(&id).await;
    state.events.record(
        Some(&id),
        "session_terminated",
        "critical",
        serde_json::json!({ "via": "control", "applied": terminated }),
    );
    Json(serde_json::json!({ "session_id": id, "terminated": terminated })).into_response()
}

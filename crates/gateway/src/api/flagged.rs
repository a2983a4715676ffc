//! Flagged-session endpoints: sessions with recorded violations, their
//! risk scores, and (on detail) captures.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FlaggedQuery {
    /// Keep only sessions with at least one violation at this severity:
    /// `info`, `warning`, `critical`.
    #[serde(default)]
    pub severity: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/flagged
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_flagged(
    State(state): State<AppState>,
    Query(query): Query<FlaggedQuery>,
) -> impl IntoResponse {
    let mut flagged = state
        .policy
        .as_ref()
        .map(|p| p.flagged().list())
        .unwrap_or_default();

    if let Some(severity) = &query.severity {
        flagged.retain(|f| {
            f.violations
                .iter()
                .any(|v| v.severity.to_string() == *severity)
        });
    }
    flagged.sort_by(|a, b| b.risk_score.cmp(&a.risk_score));

    // The list view elides captures; fetch the detail for those.
    let summaries: Vec<serde_json::Value> = flagged
        .iter()
        .map(|f| {
            serde_json::json!({
                "session_id": f.session_id,
                "first_flagged": f.first_flagged,
                "last_flagged": f.last_flagged,
                "risk_score": f.risk_score,
                "current_action": f.current_action,
                "violation_count": f.violations.len(),
                "capture_count": f.captures.len(),
            })
        })
        .collect();

    let count = summaries.len();
    Json(serde_json::json!({ "flagged": summaries, "count": count }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/flagged/{id}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_flagged(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let flagged = state.policy.as_ref().and_then(|p| p.flagged().get(&id));
    match flagged {
        Some(entry) => {
            // Live capture-buffer entries complement the registry's own.
            let buffered = state.capture.peek(&id);
            Json(serde_json::json!({
                "flagged": entry,
                "buffered_captures": buffered,
            }))
            .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "session not flagged" })),
        )
            .into_response(),
    }
}

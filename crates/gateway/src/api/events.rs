//! Event-log endpoint.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::events::EventQuery;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventParams {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> impl IntoResponse {
    let query = EventQuery {
        session_id: params.session_id,
        event_type: params.event_type,
        severity: params.severity,
        since: params.since,
        until: params.until,
        limit: params.limit.unwrap_or(100),
        offset: params.offset.unwrap_or(0),
    };
    let events = state.events.query(&query);
    let count = events.len();
    Json(serde_json::json!({ "events": events, "count": count }))
}

//! Historical session-record endpoints, backed by the SQLite store.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::history::HistoryQuery;
use crate::state::AppState;

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "history store disabled" })),
    )
        .into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "history query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "history query failed" })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn list_history(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    let Some(history) = &state.history else {
        return unavailable();
    };
    let query = HistoryQuery {
        session_id: params.session_id,
        state: params.state,
        backend: params.backend,
        since: params.since,
        until: params.until,
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
    };
    match history.query(&query) {
        Ok(records) => {
            let count = records.len();
            Json(serde_json::json!({
                "records": records,
                "count": count,
                "offset": query.offset,
            }))
            .into_response()
        }
        Err(e) => internal(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/history/stats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn history_stats(State(state): State<AppState>) -> Response {
    let Some(history) = &state.history else {
        return unavailable();
    };
    match history.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /control/history/timeseries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct TimeseriesParams {
    /// Bucket width in seconds (default one hour).
    #[serde(default)]
    pub bucket_secs: Option<u64>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

pub async fn history_timeseries(
    State(state): State<AppState>,
    Query(params): Query<TimeseriesParams>,
) -> Response {
    let Some(history) = &state.history else {
        return unavailable();
    };
    match history.timeseries(params.bucket_secs.unwrap_or(3600), params.since, params.until) {
        Ok(buckets) => Json(serde_json::json!({ "buckets": buckets })).into_response(),
        Err(e) => internal(e),
    }
}

pub mod admin;
pub mod auth;
pub mod events;
pub mod flagged;
pub mod history;
pub mod sessions;
pub mod voice;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the control-surface router.
///
/// Routes are split into **public** (the health probe) and **protected**
/// (everything else, gated behind the API-key middleware when a key is
/// configured).
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/control/health", get(admin::health));

    let protected = Router::new()
        // Aggregate counters
        .route("/control/stats", get(admin::stats))
        // Sessions
        .route("/control/sessions", get(sessions::list_sessions))
        .route("/control/sessions/:id", get(sessions::get_session))
        .route("/control/sessions/:id/kill", post(sessions::kill_session))
        .route("/control/sessions/:id/resume", post(sessions::resume_session))
        .route(
            "/control/sessions/:id/terminate",
            post(sessions::terminate_session),
        )
        // Flagged sessions
        .route("/control/flagged", get(flagged::list_flagged))
        .route("/control/flagged/:id", get(flagged::get_flagged))
        // History
        .route("/control/history", get(history::list_history))
        .route("/control/history/stats", get(history::history_stats))
        .route(
            "/control/history/timeseries",
            get(history::history_timeseries),
        )
        // Events
        .route("/control/events", get(events::list_events))
        // Voice sub-sessions
        .route("/control/voice", get(voice::list_all))
        .route("/control/voice/:ws_id", get(voice::get_ws))
        .route("/control/voice/:ws_id/:voice_id", get(voice::get_voice))
        .route("/control/voice/:ws_id/:voice_id/bye", post(voice::bye))
        .route("/control/voice/:ws_id/:voice_id/hold", post(voice::hold))
        .route("/control/voice/:ws_id/:voice_id/resume", post(voice::resume))
        // Apply API-key middleware to all protected routes.
        .route_layer(middleware::from_fn_with_state(state, auth::require_api_key));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

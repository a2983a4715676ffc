//! Control-surface integration tests: the router is exercised end-to-end
//! with `tower::ServiceExt::oneshot` against in-memory state.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use elida_capture::CaptureBuffer;
use elida_domain::config::{BackendConfig, Config};
use elida_gateway::api;
use elida_gateway::events::EventLog;
use elida_gateway::router::BackendRouter;
use elida_gateway::state::AppState;
use elida_gateway::voice::{SessionControlParser, VoiceRegistry};
use elida_sessions::{MemorySessionStore, SessionManager, TraceRecordSink};

fn test_state(api_key: Option<&str>) -> AppState {
    let config = Config {
        backends: vec![BackendConfig {
            name: "default".into(),
            url: "http://localhost:9999".into(),
            path_prefix: None,
            model_patterns: Vec::new(),
            default: true,
            connect_timeout_secs: 1,
            read_timeout_secs: 5,
        }],
        ..Default::default()
    };
    let config = Arc::new(config);
    let manager = SessionManager::new(
        Arc::new(MemorySessionStore::new()),
        Arc::new(TraceRecordSink),
        config.sessions.clone(),
    );
    AppState {
        config: config.clone(),
        manager,
        router: Arc::new(BackendRouter::from_config(&config.backends).unwrap()),
        policy: None,
        capture: Arc::new(CaptureBuffer::new(&config.capture)),
        history: None,
        events: Arc::new(EventLog::new(100)),
        voice: Arc::new(VoiceRegistry::new()),
        voice_parser: Arc::new(SessionControlParser::new(&[]).unwrap()),
        api_key_hash: api_key.map(|k| Sha256::digest(k.as_bytes()).to_vec()),
        started_at: chrono::Utc::now(),
    }
}

fn control(state: &AppState) -> axum::Router {
    api::router(state.clone()).with_state(state.clone())
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let state = test_state(Some("secret"));
    let response = control(&state)
        .oneshot(Request::get("/control/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn protected_routes_require_key() {
    let state = test_state(Some("secret"));

    let denied = control(&state)
        .oneshot(Request::get("/control/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let bearer = control(&state)
        .oneshot(
            Request::get("/control/stats")
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bearer.status(), StatusCode::OK);

    let api_key = control(&state)
        .oneshot(
            Request::get("/control/stats")
                .header("x-api-key", "secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(api_key.status(), StatusCode::OK);
}

#[tokio::test]
async fn kill_resume_terminate_lifecycle() {
    let state = test_state(None);
    state
        .manager
        .get_or_create("s1", "default", "1.2.3.4:1000")
        .await
        .unwrap();

    let killed = control(&state)
        .oneshot(Request::post("/control/sessions/s1/kill").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(killed.status(), StatusCode::OK);
    assert_eq!(body_json(killed).await["killed"], true);

    let resumed = control(&state)
        .oneshot(Request::post("/control/sessions/s1/resume").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(resumed).await["resumed"], true);

    let terminated = control(&state)
        .oneshot(
            Request::post("/control/sessions/s1/terminate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(terminated).await["terminated"], true);

    // A terminated session refuses resume with 403.
    let refused = control(&state)
        .oneshot(Request::post("/control/sessions/s1/resume").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(refused.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_session_is_404() {
    let state = test_state(None);
    let response = control(&state)
        .oneshot(Request::post("/control/sessions/nope/kill").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_listing_filters_by_state() {
    let state = test_state(None);
    state
        .manager
        .get_or_create("active-1", "default", "1.2.3.4:1000")
        .await
        .unwrap();
    state
        .manager
        .get_or_create("killed-1", "default", "1.2.3.4:2000")
        .await
        .unwrap();
    state.manager.kill("killed-1").await;

    let all = control(&state)
        .oneshot(Request::get("/control/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(all).await["count"], 2);

    let active = control(&state)
        .oneshot(
            Request::get("/control/sessions?active=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(active).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["sessions"][0]["id"], "active-1");
}

#[tokio::test]
async fn events_capture_control_actions() {
    let state = test_state(None);
    state
        .manager
        .get_or_create("s1", "default", "1.2.3.4:1000")
        .await
        .unwrap();

    control(&state)
        .oneshot(Request::post("/control/sessions/s1/kill").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let events = control(&state)
        .oneshot(
            Request::get("/control/events?type=session_killed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(events).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["events"][0]["session_id"], "s1");
}

#[tokio::test]
async fn history_disabled_yields_503() {
    let state = test_state(None);
    let response = control(&state)
        .oneshot(Request::get("/control/history").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

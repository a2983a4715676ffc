//! The ingress handler: every request that reaches the data-path listener
//! flows through here.
//!
//! Pipeline per request: route → session admission → request policy gate →
//! forward with headers preserved → classify the response (unary, NDJSON,
//! SSE) → account, scan, capture → write back with `X-Session-ID`
//! injected.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::header::CONTENT_TYPE;
use axum::http::{request::Parts, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;

use elida_domain::error::Error;
use elida_domain::record::CapturedRequest;
use elida_domain::trace::TraceEvent;
use elida_policy::{Direction, Evaluation, LadderAction};
use elida_sessions::SessionHandle;

use crate::forward::streaming::{classify, stream_response, StreamContext, StreamMode};
use crate::forward::usage::{
    extract_model, extract_request_tool_calls, extract_response_tool_calls, extract_usage,
};
use crate::forward::ws;
use crate::state::AppState;

pub const SESSION_HEADER: &str = "x-session-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build a standardized JSON error response: `{ "error": "<kind>", … }`.
fn api_error(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fallback handler for the ingress listener. WebSocket upgrades are
/// honored on the same listener and peel off into the bridge.
pub async fn ingress(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    upgrade: Option<WebSocketUpgrade>,
    req: axum::http::Request<Body>,
) -> Response {
    let (parts, body) = req.into_parts();

    if let Some(upgrade) = upgrade {
        return ws::handle_upgrade(state, addr, upgrade, parts).await;
    }

    forward_http(state, addr, parts, body).await
}

async fn forward_http(state: AppState, addr: SocketAddr, parts: Parts, body: Body) -> Response {
    let path = parts.uri.path().to_owned();
    let query = parts.uri.query().map(String::from);

    // 1. Buffer the request body (model extraction, policy evaluation).
    let body_bytes = match axum::body::to_bytes(body, state.config.ingress.max_request_bytes).await
    {
        Ok(bytes) => bytes,
        Err(_) => {
            return api_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                serde_json::json!({ "error": "request_too_large" }),
            );
        }
    };
    let body_json: Option<serde_json::Value> = serde_json::from_slice(&body_bytes).ok();
    let model = body_json.as_ref().and_then(extract_model);

    // 2. Pick a backend.
    let Some(backend) = state.router.select(&parts.headers, &path, model.as_deref()) else {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "error": "no_backend" }),
        );
    };

    // 3. Session admission (may reject 403).
    let session = match resolve_session(&state, &parts.headers, addr, backend.name()).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let session_id = session.id();

    session.update(|s| s.add_bytes_in(body_bytes.len() as u64));

    // Tool activity on the request side.
    let request_id = header_str(&parts.headers, REQUEST_ID_HEADER);
    if let Some(json) = &body_json {
        for call in extract_request_tool_calls(json, request_id.as_deref()) {
            session.update(|s| s.record_tool_call(call));
        }
    }

    // 4. Risk-ladder throttling: degrade admission to the configured rate.
    if let Some(policy) = &state.policy {
        if let LadderAction::Throttle { rate_per_minute } = policy.enforcement_action(&session_id)
        {
            let delay = 60.0 / rate_per_minute.max(1) as f64;
            tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
        }
    }

    // 5. Request-direction policy gate.
    if let Some(policy) = &state.policy {
        let body_text = String::from_utf8_lossy(&body_bytes);
        let eval = policy.evaluate(&session_id, Direction::Request, &body_text);
        if eval.has_violations() {
            record_violation_event(&state, &session_id, &eval);
            let blocked_status = if eval.should_block { 403 } else { 0 };
            maybe_capture_request(
                &state,
                &session_id,
                &parts.method,
                &path,
                &body_text,
                blocked_status,
            );
        }
        if eval.should_block {
            let rule = eval.blocking_rule().unwrap_or("risk_ladder").to_owned();
            if eval.should_terminate {
                state.manager.terminate(&session_id).await;
            }
            return policy_violation_response(&session_id, &rule);
        }
        // Flagged but not blocked: open a capture entry so the response
        // can be paired with this request.
        if !eval.has_violations()
            && policy.flagged().is_flagged(&session_id)
            && state.config.policy.capture_content
        {
            maybe_capture_request(&state, &session_id, &parts.method, &path, &String::from_utf8_lossy(&body_bytes), 0);
        }
    }

    // 6. Forward upstream, headers preserved verbatim.
    let target = format!(
        "{}{}{}",
        backend.config.url.trim_end_matches('/'),
        backend.forwarded_path(&path),
        query.map(|q| format!("?{q}")).unwrap_or_default(),
    );
    let mut outbound = backend.client.request(parts.method.clone(), &target);
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name) {
            outbound = outbound.header(name, value);
        }
    }

    let upstream = match outbound.body(body_bytes.to_vec()).send().await {
        Ok(response) => response,
        Err(e) => {
            return backend_error_response(&state, &session, backend.name(), e).await;
        }
    };

    // 7. Classify and relay the response.
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let mut response_headers = filtered_response_headers(upstream.headers());
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response_headers.insert(HeaderName::from_static(SESSION_HEADER), value);
    }

    match classify(&content_type) {
        Some(mode) => relay_streaming(
            state,
            session,
            session_id,
            &parts.method,
            &path,
            mode,
            status,
            response_headers,
            upstream,
        ),
        None => {
            relay_unary(
                state,
                session,
                session_id,
                &parts.method,
                &path,
                status,
                response_headers,
                upstream,
            )
            .await
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response relays
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
fn relay_streaming(
    state: AppState,
    session: Arc<SessionHandle>,
    session_id: String,
    method: &Method,
    path: &str,
    mode: StreamMode,
    status: StatusCode,
    headers: HeaderMap,
    upstream: reqwest::Response,
) -> Response {
    // Scan incrementally only when a blocking response rule exists;
    // otherwise frames stream uninspected (capture still applies to
    // flagged sessions).
    let scan = state
        .policy
        .as_ref()
        .map(|p| p.has_blocking_response_rules())
        .unwrap_or(false);

    let body = stream_response(
        upstream,
        StreamContext {
            session,
            manager: state.manager.clone(),
            policy: state.policy.clone(),
            capture: state.capture.clone(),
            events: state.events.clone(),
            session_id,
            method: method.to_string(),
            path: path.to_owned(),
            mode,
            scan,
            capture_content: state.config.policy.capture_content,
            max_capture_bytes: state.config.capture.max_body_bytes,
        },
    );

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[allow(clippy::too_many_arguments)]
async fn relay_unary(
    state: AppState,
    session: Arc<SessionHandle>,
    session_id: String,
    method: &Method,
    path: &str,
    status: StatusCode,
    headers: HeaderMap,
    upstream: reqwest::Response,
) -> Response {
    let backend = session.read().backend.clone();
    let body = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return backend_error_response(&state, &session, &backend, e).await;
        }
    };

    session.update(|s| s.add_bytes_out(body.len() as u64));

    // Policy evaluation over the (capped) response text.
    let eval_len = body.len().min(state.config.ingress.max_response_bytes);
    let body_text = String::from_utf8_lossy(&body[..eval_len]);

    if let Some(policy) = &state.policy {
        let eval = policy.evaluate(&session_id, Direction::Response, &body_text);
        if eval.has_violations() {
            record_violation_event(&state, &session_id, &eval);
            if state.config.policy.capture_content {
                if !state.capture.has_content(&session_id) {
                    maybe_capture_request(&state, &session_id, method, path, "", 0);
                }
                state
                    .capture
                    .update_last_response(&session_id, &body_text, status.as_u16());
            }
        }
        if eval.should_block {
            let rule = eval.blocking_rule().unwrap_or("risk_ladder").to_owned();
            state
                .capture
                .update_last_response(&session_id, &body_text, 403);
            if eval.should_terminate {
                state.manager.terminate(&session_id).await;
            }
            return policy_violation_response(&session_id, &rule);
        }
    }

    // Token usage and response-side tool calls, best effort.
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
        let (tokens_in, tokens_out) = extract_usage(&json);
        if tokens_in > 0 || tokens_out > 0 {
            session.update(|s| s.add_tokens(tokens_in, tokens_out));
        }
        for call in extract_response_tool_calls(&json, None) {
            session.update(|s| s.record_tool_call(call));
        }
    }

    if state.config.policy.capture_content && state.capture.has_content(&session_id) {
        state
            .capture
            .update_last_response(&session_id, &body_text, status.as_u16());
    }

    state.manager.persist(&session).await;

    let mut response = Response::new(Body::from(Bytes::from(body)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve the session: honor an explicit `X-Session-ID`, otherwise
/// derive from the client address and backend name.
pub(crate) async fn resolve_session(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
    backend_name: &str,
) -> Result<Arc<SessionHandle>, Response> {
    let client_addr = addr.to_string();
    let result = match header_str(headers, SESSION_HEADER) {
        Some(identity) if !identity.is_empty() => {
            state
                .manager
                .get_or_create(&identity, backend_name, &client_addr)
                .await
        }
        _ => {
            state
                .manager
                .get_or_create_by_client(&client_addr, backend_name)
                .await
        }
    };

    result.map_err(|e| match e {
        Error::SessionForbidden { session_id, reason } => {
            state.events.record(
                Some(&session_id),
                "session_rejected",
                "warning",
                serde_json::json!({ "reason": reason }),
            );
            api_error(
                StatusCode::FORBIDDEN,
                serde_json::json!({
                    "error": "session_forbidden",
                    "session_id": session_id,
                    "reason": reason,
                }),
            )
        }
        other => {
            tracing::error!(error = %other, "session admission failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "internal" }),
            )
        }
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn policy_violation_response(session_id: &str, rule: &str) -> Response {
    let mut response = api_error(
        StatusCode::FORBIDDEN,
        serde_json::json!({ "error": "policy_violation", "rule": rule }),
    );
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

async fn backend_error_response(
    state: &AppState,
    session: &Arc<SessionHandle>,
    backend: &str,
    error: reqwest::Error,
) -> Response {
    // Backend errors never kill the session; they are surfaced and
    // counted.
    let session_id = session.update(|s| {
        s.backend_errors += 1;
        s.id.clone()
    });
    TraceEvent::BackendError {
        session_id: session_id.clone(),
        backend: backend.to_owned(),
        error: error.to_string(),
    }
    .emit();
    state.events.record(
        Some(&session_id),
        "backend_error",
        "warning",
        serde_json::json!({ "backend": backend, "error": error.to_string() }),
    );

    let status = if error.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::BAD_GATEWAY
    };
    api_error(
        status,
        serde_json::json!({ "error": "backend_unavailable", "backend": backend }),
    )
}

fn record_violation_event(state: &AppState, session_id: &str, eval: &Evaluation) {
    for violation in &eval.violations {
        state.events.record(
            Some(session_id),
            "policy_violation",
            &violation.severity.to_string(),
            serde_json::json!({
                "rule": violation.rule_name,
                "risk_score": eval.risk_score,
                "ladder_action": eval.ladder_action.name(),
            }),
        );
    }
}

fn maybe_capture_request(
    state: &AppState,
    session_id: &str,
    method: &Method,
    path: &str,
    body: &str,
    status: u16,
) {
    if !state.config.policy.capture_content {
        return;
    }
    let entry = CapturedRequest {
        timestamp: Utc::now(),
        method: method.to_string(),
        path: path.to_owned(),
        request_body: body.to_owned(),
        response_body: String::new(),
        status,
    };
    state.capture.capture(session_id, entry.clone());
    if let Some(policy) = &state.policy {
        policy.flagged().attach_capture(session_id, entry);
    }
}

/// Hop-by-hop headers are not forwarded; everything else passes verbatim.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// Upstream headers minus the ones axum manages itself.
fn filtered_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !matches!(name.as_str(), "connection" | "transfer-encoding" | "content-length") {
            filtered.insert(name.clone(), value.clone());
        }
    }
    filtered
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_filtered() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("host")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("authorization")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("x-session-id")));
    }

    #[test]
    fn response_header_filtering_keeps_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("transfer-encoding"),
            HeaderValue::from_static("chunked"),
        );
        let filtered = filtered_response_headers(&headers);
        assert!(filtered.contains_key(CONTENT_TYPE));
        assert!(!filtered.contains_key("transfer-encoding"));
    }
}

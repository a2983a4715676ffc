//! Control-API authentication middleware.
//!
//! Reads the env var named by `control.api_key_env` **once at startup**
//! and caches the SHA-256 digest in `AppState`.
//! - If the env var is set and non-empty, every control request must
//!   carry `Authorization: Bearer <key>` or `X-API-Key: <key>`.
//! - If unset or empty, the server logs a warning once and allows
//!   unauthenticated access (dev mode).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // `api_key_hash` is `None` in dev mode (no key configured).
    let expected_hash = match &state.api_key_hash {
        Some(hash) => hash,
        None => return next.run(req).await,
    };

    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key_header = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    let provided = bearer.or(api_key_header).unwrap_or("");

    // Hash the provided key to a fixed-length digest, then compare in
    // constant time. This avoids leaking the key length.
    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API key" })),
        )
            .into_response();
    }

    next.run(req).await
}

//! WebSocket bridging: agent ⇄ ELIDA ⇄ backend, frames preserved (text
//! vs. binary) without transcoding.
//!
//! The backend socket is dialed *before* the client upgrade completes so
//! a dead backend surfaces as 502, not a broken socket. Both directions
//! select on the session's kill notification and close with a normal-
//! closure code when it fires.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use elida_domain::error::Error;
use elida_domain::trace::TraceEvent;
use elida_policy::Direction;
use elida_sessions::SessionHandle;

use crate::forward::http::resolve_session;
use crate::state::AppState;
use crate::voice::VoiceSessionManager;

type BackendSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upgrade
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn handle_upgrade(
    state: AppState,
    addr: SocketAddr,
    upgrade: WebSocketUpgrade,
    parts: Parts,
) -> Response {
    let path = parts.uri.path().to_owned();

    let Some(backend) = state.router.select(&parts.headers, &path, None) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no_backend" })),
        )
            .into_response();
    };

    let session = match resolve_session(&state, &parts.headers, addr, backend.name()).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let session_id = session.id();
    session.update(|s| s.is_websocket = true);

    // Dial the backend first; a refused dial is a clean 502.
    let ws_url = format!(
        "{}{}",
        backend.config.ws_url().trim_end_matches('/'),
        backend.forwarded_path(&path),
    );
    let backend_socket = match connect_async(&ws_url).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            TraceEvent::BackendError {
                session_id: session_id.clone(),
                backend: backend.name().to_owned(),
                error: e.to_string(),
            }
            .emit();
            state.events.record(
                Some(&session_id),
                "backend_error",
                "warning",
                serde_json::json!({ "backend": backend.name(), "error": e.to_string() }),
            );
            return (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": "backend_unavailable", "backend": backend.name() })),
            )
                .into_response();
        }
    };

    let voice = Arc::new(VoiceSessionManager::new(
        &session_id,
        state.voice_parser.clone(),
        state.policy.clone(),
        state.capture.clone(),
        state.config.voice.max_concurrent_sessions,
    ));
    state.voice.register(&session_id, voice.clone());

    tracing::info!(session_id = %session_id, backend = %backend.name(), url = %ws_url, "websocket bridged");

    upgrade.on_upgrade(move |client| bridge(state, session, voice, client, backend_socket))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn bridge(
    state: AppState,
    session: Arc<SessionHandle>,
    voice: Arc<VoiceSessionManager>,
    client: WebSocket,
    backend: BackendSocket,
) {
    let session_id = session.id();
    let live_scan = state.config.voice.live_scan;
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let mut killed = false;
    loop {
        tokio::select! {
            _ = session.kill_signal().wait_for_kill() => {
                killed = true;
                let _ = client_tx
                    .send(ClientMessage::Close(Some(CloseFrame {
                        code: 1000,
                        reason: "session closed".into(),
                    })))
                    .await;
                let _ = backend_tx
                    .send(BackendMessage::Close(Some(BackendCloseFrame {
                        code: CloseCode::Normal,
                        reason: "session closed".into(),
                    })))
                    .await;
                break;
            }

            frame = client_rx.next() => {
                match frame {
                    Some(Ok(message)) => {
                        if !relay_client_frame(&state, &session, &voice, &mut client_tx, &mut backend_tx, message, live_scan).await {
                            break;
                        }
                    }
                    _ => break,
                }
            }

            frame = backend_rx.next() => {
                match frame {
                    Some(Ok(message)) => {
                        if !relay_backend_frame(&state, &session, &voice, &mut client_tx, message, live_scan).await {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    voice.end_all();
    state.voice.remove(&session_id);
    state.manager.persist(&session).await;
    if !killed && !session.kill_signal().is_fired() {
        state.manager.complete(&session_id).await;
    }
    tracing::info!(session_id = %session_id, killed, "websocket bridge closed");
}

/// Relay one client→backend frame. Returns false when the bridge should
/// end.
async fn relay_client_frame(
    state: &AppState,
    session: &Arc<SessionHandle>,
    voice: &Arc<VoiceSessionManager>,
    client_tx: &mut (impl SinkExt<ClientMessage> + Unpin),
    backend_tx: &mut (impl SinkExt<BackendMessage> + Unpin),
    message: ClientMessage,
    live_scan: bool,
) -> bool {
    let session_id = session.id();
    match message {
        ClientMessage::Text(text) => {
            session.update(|s| s.add_frame(text.len() as u64, true));
            voice.record_frame(text.len() as u64, true, true);

            if live_scan {
                if let Err(Error::MaxConcurrentVoice(max)) = voice.handle_text_frame(&text) {
                    // Protocol-level error frame; the frame that would
                    // have opened the session is not forwarded.
                    let _ = client_tx
                        .send(ClientMessage::Text(
                            serde_json::json!({
                                "error": "max_concurrent_voice_sessions",
                                "max": max,
                            })
                            .to_string(),
                        ))
                        .await;
                    return true;
                }
                match scan_frame(state, &session_id, Direction::Request, &text).await {
                    FrameVerdict::Forward => {}
                    FrameVerdict::Drop => return true,
                    FrameVerdict::Terminate => return false,
                }
            }

            backend_tx.send(BackendMessage::Text(text)).await.is_ok()
        }
        ClientMessage::Binary(data) => {
            session.update(|s| s.add_frame(data.len() as u64, true));
            voice.record_frame(data.len() as u64, true, false);
            backend_tx.send(BackendMessage::Binary(data)).await.is_ok()
        }
        ClientMessage::Ping(data) => backend_tx.send(BackendMessage::Ping(data)).await.is_ok(),
        ClientMessage::Pong(data) => backend_tx.send(BackendMessage::Pong(data)).await.is_ok(),
        ClientMessage::Close(_) => {
            let _ = backend_tx.send(BackendMessage::Close(None)).await;
            false
        }
    }
}

/// Relay one backend→client frame. Returns false when the bridge should
/// end.
async fn relay_backend_frame(
    state: &AppState,
    session: &Arc<SessionHandle>,
    voice: &Arc<VoiceSessionManager>,
    client_tx: &mut (impl SinkExt<ClientMessage> + Unpin),
    message: BackendMessage,
    live_scan: bool,
) -> bool {
    let session_id = session.id();
    match message {
        BackendMessage::Text(text) => {
            session.update(|s| s.add_frame(text.len() as u64, false));
            voice.record_frame(text.len() as u64, false, true);

            if live_scan {
                // Backend frames never open voice sessions beyond the cap
                // check; parse errors are not fatal here.
                let _ = voice.handle_text_frame(&text);
                match scan_frame(state, &session_id, Direction::Response, &text).await {
                    FrameVerdict::Forward => {}
                    FrameVerdict::Drop => return true,
                    FrameVerdict::Terminate => return false,
                }
            }

            client_tx.send(ClientMessage::Text(text)).await.is_ok()
        }
        BackendMessage::Binary(data) => {
            session.update(|s| s.add_frame(data.len() as u64, false));
            voice.record_frame(data.len() as u64, false, false);
            client_tx.send(ClientMessage::Binary(data)).await.is_ok()
        }
        BackendMessage::Ping(data) => client_tx.send(ClientMessage::Ping(data)).await.is_ok(),
        BackendMessage::Pong(data) => client_tx.send(ClientMessage::Pong(data)).await.is_ok(),
        BackendMessage::Close(_) => {
            let _ = client_tx.send(ClientMessage::Close(None)).await;
            false
        }
        // Raw frames are handled inside tungstenite; nothing to relay.
        BackendMessage::Frame(_) => true,
    }
}

enum FrameVerdict {
    Forward,
    /// Blocked frame: dropped, bridge survives.
    Drop,
    /// Session terminated: bridge ends.
    Terminate,
}

/// Feed a text frame to the policy engine and decide its fate.
async fn scan_frame(
    state: &AppState,
    session_id: &str,
    direction: Direction,
    text: &str,
) -> FrameVerdict {
    let Some(policy) = &state.policy else {
        return FrameVerdict::Forward;
    };
    let eval = policy.evaluate(session_id, direction, text);
    if !eval.has_violations() {
        return FrameVerdict::Forward;
    }
    state.events.record(
        Some(session_id),
        "policy_violation",
        "warning",
        serde_json::json!({
            "transport": "websocket",
            "risk_score": eval.risk_score,
        }),
    );
    if eval.should_terminate {
        state.manager.terminate(session_id).await;
        return FrameVerdict::Terminate;
    }
    if eval.should_block {
        return FrameVerdict::Drop;
    }
    FrameVerdict::Forward
}

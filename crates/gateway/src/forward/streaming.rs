//! Streaming response forwarding: newline-delimited JSON and server-sent
//! events, preserved byte-for-byte, with per-frame kill checks and
//! incremental policy scanning.
//!
//! Frames are drained from an accumulation buffer as they complete; a
//! trailing partial frame stays buffered for the next chunk (and is
//! flushed verbatim at stream end).

use std::sync::Arc;

use axum::body::{Body, Bytes};

use elida_capture::CaptureBuffer;
use elida_domain::trace::TraceEvent;
use elida_policy::PolicyEngine;
use elida_sessions::{SessionHandle, SessionManager};

use crate::events::EventLog;
use crate::forward::usage::extract_usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification & framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// One JSON object per line.
    Ndjson,
    /// `data: …\n\n` event blocks.
    Sse,
}

/// Classify a response `Content-Type`. `None` means unary.
pub fn classify(content_type: &str) -> Option<StreamMode> {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match ct.as_str() {
        "text/event-stream" => Some(StreamMode::Sse),
        "application/x-ndjson" | "application/ndjson" | "application/jsonl"
        | "application/json-lines" => Some(StreamMode::Ndjson),
        _ => None,
    }
}

/// One forwardable frame: `raw` is written downstream unmodified,
/// `payload` is what the scanner sees.
#[derive(Debug, PartialEq)]
pub struct Frame {
    pub raw: String,
    pub payload: String,
}

/// Drain complete frames from `buffer` in-place; a trailing partial frame
/// remains for the next call.
pub fn drain_frames(buffer: &mut String, mode: StreamMode) -> Vec<Frame> {
    match mode {
        StreamMode::Ndjson => drain_lines(buffer),
        StreamMode::Sse => drain_events(buffer),
    }
}

fn drain_lines(buffer: &mut String) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let raw: String = buffer.drain(..=pos).collect();
        let payload = raw.trim_end_matches(['\n', '\r']).to_owned();
        frames.push(Frame { raw, payload });
    }
    frames
}

/// SSE events are delimited by `\n\n`. Each block may carry `event:`,
/// `data:`, `id:`, or `retry:` lines; the scanner only cares about the
/// `data:` payloads, joined with newlines.
fn drain_events(buffer: &mut String) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let mut raw: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        raw.push_str("\n\n");

        let payload = raw
            .lines()
            .filter_map(|line| line.trim().strip_prefix("data:"))
            .map(str::trim)
            .filter(|data| !data.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        frames.push(Frame { raw, payload });
    }
    frames
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streamed body
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StreamContext {
    pub session: Arc<SessionHandle>,
    pub manager: Arc<SessionManager>,
    pub policy: Option<Arc<PolicyEngine>>,
    pub capture: Arc<CaptureBuffer>,
    pub events: Arc<EventLog>,
    pub session_id: String,
    pub method: String,
    pub path: String,
    pub mode: StreamMode,
    /// Scan frames incrementally (blocking response rules configured, or
    /// audit wants visibility).
    pub scan: bool,
    pub capture_content: bool,
    /// Accumulation bound for the captured response text.
    pub max_capture_bytes: usize,
}

/// Forward the upstream body frame-by-frame. The kill notification is
/// polled on every frame boundary; a `block` verdict severs the stream
/// immediately, recording the bytes forwarded up to the violation.
pub fn stream_response(upstream: reqwest::Response, ctx: StreamContext) -> Body {
    let stream = async_stream::stream! {
        let mut upstream = upstream;
        let mut buffer = String::new();
        let mut scanner = if ctx.scan {
            ctx.policy.as_ref().map(|p| p.scanner(&ctx.session_id))
        } else {
            None
        };
        // Accumulate response text when a capture entry is already open,
        // or when scanning might sever the stream and need the bytes
        // forwarded so far.
        let do_capture = ctx.capture_content && ctx.capture.has_content(&ctx.session_id);
        let accumulate = do_capture || (ctx.scan && ctx.capture_content);
        let mut captured = String::new();
        let mut usage_payload: Option<String> = None;
        let mut forwarded: u64 = 0;
        let mut severed = false;

        'outer: loop {
            let chunk = tokio::select! {
                _ = ctx.session.kill_signal().wait_for_kill() => {
                    tracing::info!(session_id = %ctx.session_id, "stream aborted by kill notification");
                    break 'outer;
                }
                chunk = upstream.chunk() => chunk,
            };

            match chunk {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for frame in drain_frames(&mut buffer, ctx.mode) {
                        if let Some(scanner) = scanner.as_mut() {
                            if let Some(eval) = scanner.scan_chunk(&frame.payload) {
                                if eval.should_block {
                                    let rule = eval
                                        .blocking_rule()
                                        .unwrap_or("risk_ladder")
                                        .to_owned();
                                    TraceEvent::StreamSevered {
                                        session_id: ctx.session_id.clone(),
                                        rule: rule.clone(),
                                        bytes_forwarded: forwarded,
                                    }
                                    .emit();
                                    ctx.events.record(
                                        Some(&ctx.session_id),
                                        "stream_severed",
                                        "critical",
                                        serde_json::json!({ "rule": rule, "bytes_forwarded": forwarded }),
                                    );
                                    if eval.should_terminate {
                                        ctx.manager.terminate(&ctx.session_id).await;
                                    }
                                    severed = true;
                                    break 'outer;
                                }
                            }
                        }

                        forwarded += frame.raw.len() as u64;
                        ctx.session.update(|s| s.add_bytes_out(frame.raw.len() as u64));
                        if accumulate && captured.len() < ctx.max_capture_bytes {
                            captured.push_str(&frame.payload);
                            captured.push('\n');
                        }
                        if frame.payload.contains("usage")
                            || frame.payload.contains("eval_count")
                        {
                            usage_payload = Some(frame.payload.clone());
                        }

                        yield Ok::<_, std::io::Error>(Bytes::from(frame.raw));
                    }
                }
                Ok(None) => {
                    // Flush a trailing partial frame verbatim.
                    if !buffer.is_empty() {
                        forwarded += buffer.len() as u64;
                        ctx.session.update(|s| s.add_bytes_out(buffer.len() as u64));
                        if accumulate && captured.len() < ctx.max_capture_bytes {
                            captured.push_str(&buffer);
                        }
                        yield Ok(Bytes::from(std::mem::take(&mut buffer)));
                    }
                    break 'outer;
                }
                Err(e) => {
                    // Response-path error after headers: terminate this
                    // response only, never the session.
                    tracing::warn!(session_id = %ctx.session_id, error = %e, "upstream stream error");
                    break 'outer;
                }
            }
        }

        if let Some(scanner) = scanner.as_mut() {
            scanner.finalize();
        }

        // Best-effort token accounting from the last usage-bearing frame.
        if let Some(payload) = usage_payload {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload) {
                let (tokens_in, tokens_out) = extract_usage(&value);
                if tokens_in > 0 || tokens_out > 0 {
                    ctx.session.update(|s| s.add_tokens(tokens_in, tokens_out));
                }
            }
        }

        if severed && ctx.capture_content {
            captured.push_str("…[severed]");
            if ctx.capture.has_content(&ctx.session_id) {
                ctx.capture.update_last_response(&ctx.session_id, &captured, 403);
            } else {
                // Newly flagged mid-stream: open the pair now so the
                // record carries the bytes forwarded up to the violation.
                ctx.capture.capture(
                    &ctx.session_id,
                    elida_domain::record::CapturedRequest {
                        timestamp: chrono::Utc::now(),
                        method: ctx.method.clone(),
                        path: ctx.path.clone(),
                        request_body: String::new(),
                        response_body: captured,
                        status: 403,
                    },
                );
            }
        } else if do_capture {
            ctx.capture.update_last_response(&ctx.session_id, &captured, 200);
        }
        ctx.manager.persist(&ctx.session).await;
    };

    Body::from_stream(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_content_types() {
        assert_eq!(classify("text/event-stream"), Some(StreamMode::Sse));
        assert_eq!(classify("text/event-stream; charset=utf-8"), Some(StreamMode::Sse));
        assert_eq!(classify("application/x-ndjson"), Some(StreamMode::Ndjson));
        assert_eq!(classify("application/json"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn ndjson_drains_complete_lines() {
        let mut buf = String::from("{\"a\":1}\n{\"b\":2}\n{\"part");
        let frames = drain_frames(&mut buf, StreamMode::Ndjson);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].raw, "{\"a\":1}\n");
        assert_eq!(frames[0].payload, "{\"a\":1}");
        assert_eq!(buf, "{\"part");
    }

    #[test]
    fn ndjson_strips_carriage_return_from_payload_only() {
        let mut buf = String::from("{\"a\":1}\r\n");
        let frames = drain_frames(&mut buf, StreamMode::Ndjson);
        assert_eq!(frames[0].raw, "{\"a\":1}\r\n");
        assert_eq!(frames[0].payload, "{\"a\":1}");
    }

    #[test]
    fn sse_drains_complete_events() {
        let mut buf = String::from("event: message\ndata: {\"x\":1}\n\ndata: partial");
        let frames = drain_frames(&mut buf, StreamMode::Sse);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].raw, "event: message\ndata: {\"x\":1}\n\n");
        assert_eq!(frames[0].payload, "{\"x\":1}");
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn sse_joins_multiple_data_lines() {
        let mut buf = String::from("data: first\ndata: second\n\n");
        let frames = drain_frames(&mut buf, StreamMode::Sse);
        assert_eq!(frames[0].payload, "first\nsecond");
    }

    #[test]
    fn sse_framing_is_preserved_verbatim() {
        let original = "id: 7\nevent: delta\ndata: {\"t\":\"hi\"}\n\n";
        let mut buf = String::from(original);
        let frames = drain_frames(&mut buf, StreamMode::Sse);
        assert_eq!(frames[0].raw, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn sse_done_sentinel_kept() {
        let mut buf = String::from("data: [DONE]\n\n");
        let frames = drain_frames(&mut buf, StreamMode::Sse);
        assert_eq!(frames[0].payload, "[DONE]");
    }
}

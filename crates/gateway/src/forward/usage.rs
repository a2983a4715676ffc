//! Defensive extraction of token usage and tool activity from provider
//! JSON bodies. Missing keys are never errors — unrecognized shapes just
//! contribute nothing.

use chrono::Utc;
use serde_json::Value;

use elida_domain::record::ToolCallRecord;

/// Token usage `(input, output)` from any of the three recognized
/// provider shapes:
///
/// | shape            | input field          | output field             |
/// |------------------|----------------------|--------------------------|
/// | chat-completion  | `usage.prompt_tokens` | `usage.completion_tokens` |
/// | messages         | `usage.input_tokens`  | `usage.output_tokens`     |
/// | local runtime    | `prompt_eval_count`   | `eval_count`              |
pub fn extract_usage(body: &Value) -> (u64, u64) {
    if let Some(usage) = body.get("usage") {
        let tokens_in = u64_field(usage, "prompt_tokens").or_else(|| u64_field(usage, "input_tokens"));
        let tokens_out =
            u64_field(usage, "completion_tokens").or_else(|| u64_field(usage, "output_tokens"));
        if tokens_in.is_some() || tokens_out.is_some() {
            return (tokens_in.unwrap_or(0), tokens_out.unwrap_or(0));
        }
    }
    (
        u64_field(body, "prompt_eval_count").unwrap_or(0),
        u64_field(body, "eval_count").unwrap_or(0),
    )
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

/// Top-level `model` field, for routing.
pub fn extract_model(body: &Value) -> Option<String> {
    body.get("model").and_then(Value::as_str).map(String::from)
}

/// Tool calls in a request body: `tool_calls` arrays on messages
/// (chat-completion style) and `tool_use` content blocks (messages
/// style).
pub fn extract_request_tool_calls(body: &Value, request_id: Option<&str>) -> Vec<ToolCallRecord> {
    let mut calls = Vec::new();
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            collect_from_message(message, request_id, &mut calls);
        }
    }
    calls
}

/// Tool calls in a response body: the assistant message of the first
/// choice (chat-completion style) or top-level `content` blocks
/// (messages style).
pub fn extract_response_tool_calls(body: &Value, request_id: Option<&str>) -> Vec<ToolCallRecord> {
    let mut calls = Vec::new();
    if let Some(choices) = body.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(message) = choice.get("message") {
                collect_from_message(message, request_id, &mut calls);
            }
        }
    }
    if let Some(content) = body.get("content").and_then(Value::as_array) {
        collect_tool_use_blocks(content, request_id, &mut calls);
    }
    calls
}

fn collect_from_message(message: &Value, request_id: Option<&str>, out: &mut Vec<ToolCallRecord>) {
    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in tool_calls {
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str);
            if let Some(name) = name {
                out.push(ToolCallRecord {
                    tool_name: name.to_owned(),
                    call_type: call
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("function")
                        .to_owned(),
                    call_id: call.get("id").and_then(Value::as_str).map(String::from),
                    timestamp: Utc::now(),
                    request_id: request_id.map(String::from),
                });
            }
        }
    }
    if let Some(content) = message.get("content").and_then(Value::as_array) {
        collect_tool_use_blocks(content, request_id, out);
    }
}

fn collect_tool_use_blocks(
    blocks: &[Value],
    request_id: Option<&str>,
    out: &mut Vec<ToolCallRecord>,
) {
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            if let Some(name) = block.get("name").and_then(Value::as_str) {
                out.push(ToolCallRecord {
                    tool_name: name.to_owned(),
                    call_type: "tool_use".to_owned(),
                    call_id: block.get("id").and_then(Value::as_str).map(String::from),
                    timestamp: Utc::now(),
                    request_id: request_id.map(String::from),
                });
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_completion_usage() {
        let body = json!({ "usage": { "prompt_tokens": 12, "completion_tokens": 34 } });
        assert_eq!(extract_usage(&body), (12, 34));
    }

    #[test]
    fn messages_usage() {
        let body = json!({ "usage": { "input_tokens": 5, "output_tokens": 7 } });
        assert_eq!(extract_usage(&body), (5, 7));
    }

    #[test]
    fn local_runtime_usage() {
        let body = json!({ "prompt_eval_count": 9, "eval_count": 21 });
        assert_eq!(extract_usage(&body), (9, 21));
    }

    #[test]
    fn missing_usage_is_zero() {
        assert_eq!(extract_usage(&json!({ "id": "x" })), (0, 0));
        assert_eq!(extract_usage(&json!({ "usage": {} })), (0, 0));
    }

    #[test]
    fn model_extraction() {
        assert_eq!(extract_model(&json!({ "model": "gpt-4o" })).as_deref(), Some("gpt-4o"));
        assert_eq!(extract_model(&json!({})), None);
    }

    #[test]
    fn request_tool_calls_chat_style() {
        let body = json!({
            "messages": [
                { "role": "assistant", "tool_calls": [
                    { "id": "call_1", "type": "function", "function": { "name": "get_weather" } }
                ]},
                { "role": "user", "content": "thanks" }
            ]
        });
        let calls = extract_request_tool_calls(&body, Some("req-1"));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "get_weather");
        assert_eq!(calls[0].call_id.as_deref(), Some("call_1"));
        assert_eq!(calls[0].request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn request_tool_calls_messages_style() {
        let body = json!({
            "messages": [
                { "role": "assistant", "content": [
                    { "type": "text", "text": "let me check" },
                    { "type": "tool_use", "id": "toolu_1", "name": "search" }
                ]}
            ]
        });
        let calls = extract_request_tool_calls(&body, None);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "search");
        assert_eq!(calls[0].call_type, "tool_use");
    }

    #[test]
    fn response_tool_calls_both_shapes() {
        let chat = json!({
            "choices": [{ "message": { "tool_calls": [
                { "id": "c1", "type": "function", "function": { "name": "run" } }
            ]}}]
        });
        assert_eq!(extract_response_tool_calls(&chat, None)[0].tool_name, "run");

        let messages = json!({
            "content": [ { "type": "tool_use", "id": "t1", "name": "fetch" } ]
        });
        assert_eq!(extract_response_tool_calls(&messages, None)[0].tool_name, "fetch");
    }

    #[test]
    fn malformed_shapes_yield_nothing() {
        assert!(extract_request_tool_calls(&json!({ "messages": "nope" }), None).is_empty());
        assert!(extract_response_tool_calls(&json!([1, 2, 3]), None).is_empty());
    }
}

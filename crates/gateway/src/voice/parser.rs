//! Control-message parsing for WebSocket text frames.
//!
//! Two built-in protocol families are recognized — a realtime LLM voice
//! protocol and a streaming STT protocol — plus operator-configured
//! named regexes mapped to lifecycle events. Frames that parse as
//! neither yield no events.

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;

use elida_domain::config::{CustomParserEvent, CustomParserRule};
use elida_domain::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptSource {
    Stt,
    Text,
}

/// A voice-session lifecycle event parsed from one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Invite {
        protocol: String,
        model: Option<String>,
        voice: Option<String>,
    },
    /// The far end acknowledged the invite; the session goes Active.
    Activate,
    TurnStart,
    TurnEnd,
    Bye,
    Transcript {
        speaker: Speaker,
        text: String,
        is_final: bool,
        source: TranscriptSource,
    },
}

#[derive(Debug)]
struct CustomRule {
    name: String,
    regex: Regex,
    event: CustomParserEvent,
}

#[derive(Debug)]
pub struct SessionControlParser {
    custom: Vec<CustomRule>,
}

impl SessionControlParser {
    /// Compile the custom rules up front; malformed patterns fail
    /// configuration.
    pub fn new(custom_rules: &[CustomParserRule]) -> Result<Self> {
        let custom = custom_rules
            .iter()
            .map(|rule| {
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        Error::Config(format!("voice parser rule \"{}\": {e}", rule.name))
                    })?;
                Ok(CustomRule {
                    name: rule.name.clone(),
                    regex,
                    event: rule.event,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { custom })
    }

    /// Parse one text frame into zero or more lifecycle events.
    pub fn parse(&self, text: &str) -> Vec<ControlEvent> {
        let mut events = Vec::new();

        if let Ok(json) = serde_json::from_str::<Value>(text) {
            if let Some(message_type) = json.get("type").and_then(Value::as_str) {
                events.extend(parse_realtime(message_type, &json));
                events.extend(parse_stt(message_type, &json));
            }
        }

        for rule in &self.custom {
            if rule.regex.is_match(text) {
                tracing::debug!(rule = %rule.name, "custom voice parser rule matched");
                events.push(match rule.event {
                    CustomParserEvent::Invite => ControlEvent::Invite {
                        protocol: format!("custom:{}", rule.name),
                        model: None,
                        voice: None,
                    },
                    CustomParserEvent::Bye => ControlEvent::Bye,
                    CustomParserEvent::TurnStart => ControlEvent::TurnStart,
                    CustomParserEvent::TurnEnd => ControlEvent::TurnEnd,
                });
            }
        }

        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Realtime LLM protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_realtime(message_type: &str, json: &Value) -> Vec<ControlEvent> {
    let session_field = |key: &str| {
        json.get("session")
            .and_then(|s| s.get(key))
            .and_then(Value::as_str)
            .map(String::from)
    };

    match message_type {
        "session.create" | "session.update" => vec![ControlEvent::Invite {
            protocol: "realtime".into(),
            model: session_field("model"),
            voice: session_field("voice"),
        }],
        "session.created" => vec![ControlEvent::Activate],
        "response.create" => vec![ControlEvent::TurnStart],
        "response.done" => vec![ControlEvent::TurnEnd],
        "error" => vec![ControlEvent::Bye],
        "conversation.item.input_audio_transcription.completed" => {
            transcript_event(json, "transcript", Speaker::User, true, TranscriptSource::Stt)
        }
        "response.audio_transcript.delta" => {
            transcript_event(json, "delta", Speaker::Assistant, false, TranscriptSource::Text)
        }
        "response.audio_transcript.done" => {
            transcript_event(json, "transcript", Speaker::Assistant, true, TranscriptSource::Text)
        }
        _ => Vec::new(),
    }
}

fn transcript_event(
    json: &Value,
    field: &str,
    speaker: Speaker,
    is_final: bool,
    source: TranscriptSource,
) -> Vec<ControlEvent> {
    match json.get(field).and_then(Value::as_str) {
        Some(text) => vec![ControlEvent::Transcript {
            speaker,
            text: text.to_owned(),
            is_final,
            source,
        }],
        None => Vec::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming STT protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_stt(message_type: &str, json: &Value) -> Vec<ControlEvent> {
    match message_type {
        "Metadata" => vec![ControlEvent::Activate],
        "SpeechStarted" => vec![ControlEvent::TurnStart],
        "UtteranceEnd" => vec![ControlEvent::TurnEnd],
        "Results" => {
            let text = json
                .get("channel")
                .and_then(|c| c.get("alternatives"))
                .and_then(Value::as_array)
                .and_then(|alts| alts.first())
                .and_then(|alt| alt.get("transcript"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if text.is_empty() {
                return Vec::new();
            }
            vec![ControlEvent::Transcript {
                speaker: Speaker::User,
                text: text.to_owned(),
                is_final: json.get("is_final").and_then(Value::as_bool).unwrap_or(false),
                source: TranscriptSource::Stt,
            }]
        }
        _ => Vec::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

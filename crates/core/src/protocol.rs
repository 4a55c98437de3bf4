//! Defines the JSON message protocol carried over the control channel.
//!
//! Every message is one JSON object with a mandatory `type` discriminator.
//! Inbound parsing is lenient: unknown event types are ignored, unknown fields
//! are tolerated, and malformed messages are reported as
//! [`ProtocolParseError`] so the caller can drop them and carry on.

use crate::{
    error::{ControlChannelError, ProtocolParseError},
    tools::ToolCall,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Label of the single reliable data channel the session opens.
pub const CONTROL_CHANNEL_LABEL: &str = "oai-events";

/// Events received from the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A transcription of the user's speech.
    Transcript { text: String },
    /// A text response from the model.
    LlmResponse { text: String },
    /// The model asks the client to run one or more tools, in order.
    ToolCalls { calls: Vec<ToolCall> },
    /// Free-form text from the remote side.
    Text { text: String },
}

/// Events sent to the remote endpoint.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// A text message typed by the user.
    Text { text: String },
}

impl OutboundEvent {
    pub fn text(text: impl Into<String>) -> Self {
        OutboundEvent::Text { text: text.into() }
    }
}

/// Wire shape of the inbound events this client understands.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Transcript { transcript: String },
    LlmResponse { response: String },
    ToolCalls { tool_calls: Vec<WireToolCall> },
    Text { text: String },
}

const KNOWN_TYPES: [&str; 4] = ["transcript", "llm_response", "tool_calls", "text"];

#[derive(Deserialize, Debug)]
struct WireToolCall {
    #[serde(rename = "type")]
    kind: Option<String>,
    /// Absent on entries for tool types other than `function`.
    function: Option<WireFunction>,
}

#[derive(Deserialize, Debug)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl WireToolCall {
    fn into_tool_call(self) -> Option<ToolCall> {
        let function = match self.function {
            Some(function) if self.kind.as_deref().is_none_or(|kind| kind == "function") => function,
            _ => {
                debug!(kind = ?self.kind, "Skipping non-function tool call.");
                return None;
            }
        };
        // `arguments` is documented as a JSON string, but tolerate inline objects.
        let arguments_json = match function.arguments {
            Value::String(text) => text,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Some(ToolCall {
            name: function.name,
            arguments_json,
        })
    }
}

impl From<WireEvent> for ChannelEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::Transcript { transcript } => ChannelEvent::Transcript { text: transcript },
            WireEvent::LlmResponse { response } => ChannelEvent::LlmResponse { text: response },
            WireEvent::ToolCalls { tool_calls } => ChannelEvent::ToolCalls {
                calls: tool_calls
                    .into_iter()
                    .filter_map(WireToolCall::into_tool_call)
                    .collect(),
            },
            WireEvent::Text { text } => ChannelEvent::Text { text },
        }
    }
}

/// Parses one raw inbound message.
///
/// Returns `Ok(None)` for well-formed messages of a type this client does not
/// handle.
pub fn parse_inbound(raw: &str) -> Result<Option<ChannelEvent>, ProtocolParseError> {
    let value: Value = serde_json::from_str(raw)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolParseError::MissingType)?
        .to_string();

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        debug!(%kind, "Ignoring unrecognised channel event.");
        return Ok(None);
    }

    let event: WireEvent = serde_json::from_value(value)
        .map_err(|source| ProtocolParseError::InvalidPayload { kind, source })?;
    Ok(Some(event.into()))
}

/// The reliable, ordered side channel of a peer connection.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Whether the channel is currently open for writing.
    fn is_open(&self) -> bool;

    /// Writes one text message.
    async fn send_text(&self, payload: String) -> Result<(), ControlChannelError>;
}

/// Serializes `event` and writes it if the channel is open.
///
/// Sends on a channel that is not open are dropped without error; nothing is
/// queued. Returns whether the message was written.
pub async fn send(channel: &dyn ControlChannel, event: &OutboundEvent) -> bool {
    if !channel.is_open() {
        debug!("Control channel not open; dropping outbound event.");
        return false;
    }

    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to serialize outbound event.");
            return false;
        }
    };

    match channel.send_text(payload).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to write outbound event.");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    };

    #[test]
    fn test_parse_transcript_and_response() {
        let event = parse_inbound(r#"{"type":"transcript","transcript":"hola"}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::Transcript { text: "hola".into() }));

        let event = parse_inbound(r#"{"type":"llm_response","response":"¿qué tal?"}"#).unwrap();
        assert_eq!(
            event,
            Some(ChannelEvent::LlmResponse {
                text: "¿qué tal?".into()
            })
        );

        let event = parse_inbound(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::Text { text: "hi".into() }));
    }

    #[test]
    fn test_parse_tool_calls_preserves_order() {
        let raw = r#"{
            "type": "tool_calls",
            "tool_calls": [
                {"type": "function", "function": {"name": "first", "arguments": "{\"a\":1}"}},
                {"type": "function", "function": {"name": "second", "arguments": {"b": 2}}},
                {"function": {"name": "third"}}
            ]
        }"#;
        let event = parse_inbound(raw).unwrap();
        assert_eq!(
            event,
            Some(ChannelEvent::ToolCalls {
                calls: vec![
                    ToolCall::new("first", r#"{"a":1}"#),
                    ToolCall::new("second", r#"{"b":2}"#),
                    ToolCall::new("third", ""),
                ]
            })
        );
    }

    #[test]
    fn test_parse_skips_non_function_tool_calls() {
        let raw = r#"{"type":"tool_calls","tool_calls":[
            {"type":"retrieval","function":{"name":"lookup","arguments":"{}"}},
            {"type":"function","function":{"name":"decir_chiste","arguments":"{}"}}
        ]}"#;
        let event = parse_inbound(raw).unwrap();
        assert_eq!(
            event,
            Some(ChannelEvent::ToolCalls {
                calls: vec![ToolCall::new("decir_chiste", "{}")]
            })
        );
    }

    #[test]
    fn test_entries_without_function_do_not_drop_siblings() {
        let raw = r#"{"type":"tool_calls","tool_calls":[
            {"type":"code_interpreter","code_interpreter":{"input":"print(1)"}},
            {"type":"function","function":{"name":"decir_chiste","arguments":"{\"tema\":\"programadores\"}"}}
        ]}"#;
        let event = parse_inbound(raw).unwrap();
        assert_eq!(
            event,
            Some(ChannelEvent::ToolCalls {
                calls: vec![ToolCall::new("decir_chiste", r#"{"tema":"programadores"}"#)]
            })
        );
    }

    #[test]
    fn test_unknown_types_and_fields_are_tolerated() {
        assert_eq!(parse_inbound(r#"{"type":"session.created","session":{}}"#).unwrap(), None);

        let event =
            parse_inbound(r#"{"type":"transcript","transcript":"x","event_id":"evt_1"}"#).unwrap();
        assert_eq!(event, Some(ChannelEvent::Transcript { text: "x".into() }));
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        assert!(matches!(
            parse_inbound("{not json"),
            Err(ProtocolParseError::Json(_))
        ));
        assert!(matches!(
            parse_inbound(r#"{"transcript":"no type"}"#),
            Err(ProtocolParseError::MissingType)
        ));
        assert!(matches!(
            parse_inbound(r#"{"type":7}"#),
            Err(ProtocolParseError::MissingType)
        ));
        assert!(matches!(
            parse_inbound(r#"{"type":"transcript"}"#),
            Err(ProtocolParseError::InvalidPayload { kind, .. }) if kind == "transcript"
        ));
    }

    #[test]
    fn test_outbound_text_wire_format() {
        let payload = serde_json::to_string(&OutboundEvent::text("hola")).unwrap();
        assert_eq!(payload, r#"{"type":"text","text":"hola"}"#);
    }

    struct RecordingChannel {
        open: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ControlChannel for RecordingChannel {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send_text(&self, payload: String) -> Result<(), ControlChannelError> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_only_when_open() {
        let channel = RecordingChannel {
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        };

        assert!(!send(&channel, &OutboundEvent::text("early")).await);
        assert!(channel.sent.lock().unwrap().is_empty());

        channel.open.store(true, Ordering::SeqCst);
        assert!(send(&channel, &OutboundEvent::text("hola")).await);
        assert_eq!(
            *channel.sent.lock().unwrap(),
            vec![r#"{"type":"text","text":"hola"}"#.to_string()]
        );
    }
}

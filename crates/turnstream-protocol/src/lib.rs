//! Envelope protocol types shared between an agent server and turnstream clients.
//!
//! An assistant reply is delivered as an ordered feed of envelopes. Each envelope
//! names the chat, the assistant message being built, the transport stream that
//! carried it, and a per-chat sequence number that doubles as the resumption
//! cursor.
//!
//! # Wire Shape
//!
//! Envelopes are JSON objects with camelCase identifiers:
//!
//! ```json
//! {"chatId":"c1","messageId":"m1","streamId":"s1","seq":7,
//!  "kind":"assistant_text","payload":{"text":"Hel"},"ts":"2026-01-01T00:00:00Z"}
//! ```
//!
//! # Example: Decoding an Envelope
//!
//! ```ignore
//! use turnstream_protocol::{Envelope, StreamEvent};
//!
//! let envelope = Envelope::from_json(&line)?;
//! if let Some(StreamEvent::AssistantText { text }) = envelope.decode() {
//!     print!("{text}");
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Envelope
// ============================================================================

/// One unit of protocol traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub chat_id: String,
    /// The assistant message being built.
    pub message_id: String,
    /// The transport connection or attempt that carried this envelope.
    pub stream_id: String,
    /// Server-assigned, increasing per chat, starting at 1.
    pub seq: u64,
    pub kind: EnvelopeKind,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Envelope kind tag.
///
/// Kinds this crate does not recognize decode to [`EnvelopeKind::Unknown`] so a
/// newer server never breaks an older client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    AssistantText,
    AssistantThinking,
    ToolStarted,
    ToolCompleted,
    ToolFailed,
    PromptSuggestions,
    System,
    PermissionRequest,
    QueueProcessing,
    Complete,
    Cancelled,
    Error,
    #[serde(other)]
    Unknown,
}

impl EnvelopeKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssistantText => "assistant_text",
            Self::AssistantThinking => "assistant_thinking",
            Self::ToolStarted => "tool_started",
            Self::ToolCompleted => "tool_completed",
            Self::ToolFailed => "tool_failed",
            Self::PromptSuggestions => "prompt_suggestions",
            Self::System => "system",
            Self::PermissionRequest => "permission_request",
            Self::QueueProcessing => "queue_processing",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Envelope {
    /// Parse an envelope from its JSON text.
    ///
    /// Fails when a required identifier is missing or `seq` is not a
    /// non-negative integer.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize this envelope to JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode the payload according to the envelope kind.
    ///
    /// Returns `None` when the payload is missing fields its kind requires, or
    /// when the kind is unknown. Callers drop such envelopes.
    pub fn decode(&self) -> Option<StreamEvent> {
        let payload = &self.payload;
        match self.kind {
            EnvelopeKind::AssistantText => {
                let text = payload.get("text")?.as_str()?;
                Some(StreamEvent::AssistantText {
                    text: text.to_string(),
                })
            }
            EnvelopeKind::AssistantThinking => {
                let thinking = payload.get("thinking")?.as_str()?;
                Some(StreamEvent::AssistantThinking {
                    thinking: thinking.to_string(),
                })
            }
            EnvelopeKind::ToolStarted => decode_tool(payload).map(StreamEvent::ToolStarted),
            EnvelopeKind::ToolCompleted => decode_tool(payload).map(StreamEvent::ToolCompleted),
            EnvelopeKind::ToolFailed => decode_tool(payload).map(StreamEvent::ToolFailed),
            EnvelopeKind::PromptSuggestions => {
                let suggestions = payload
                    .get("suggestions")?
                    .as_array()?
                    .iter()
                    .filter_map(|entry| entry.as_str().map(str::to_string))
                    .collect();
                Some(StreamEvent::PromptSuggestions { suggestions })
            }
            EnvelopeKind::System => Some(StreamEvent::System(SystemPayload {
                context_usage: extract_context_usage(payload),
            })),
            EnvelopeKind::PermissionRequest => serde_json::from_value(payload.clone())
                .ok()
                .map(StreamEvent::PermissionRequest),
            EnvelopeKind::QueueProcessing => serde_json::from_value(payload.clone())
                .ok()
                .map(StreamEvent::QueueProcessing),
            EnvelopeKind::Complete => Some(StreamEvent::Complete),
            EnvelopeKind::Cancelled => Some(StreamEvent::Cancelled),
            EnvelopeKind::Error => {
                let error: ErrorPayload =
                    serde_json::from_value(payload.clone()).unwrap_or_default();
                Some(StreamEvent::Error {
                    message: error
                        .message
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
                    code: error.code,
                })
            }
            EnvelopeKind::Unknown => None,
        }
    }
}

/// Message used when an `error` envelope carries no text of its own.
pub const DEFAULT_ERROR_MESSAGE: &str = "stream error";

fn decode_tool(payload: &Value) -> Option<ToolPayload> {
    let tool = payload.get("tool")?;
    if !tool.is_object() {
        return None;
    }
    serde_json::from_value(tool.clone()).ok()
}

fn extract_context_usage(payload: &Value) -> Option<ContextUsage> {
    let raw = payload
        .get("context_usage")
        .or_else(|| payload.get("data").and_then(|data| data.get("context_usage")))?;
    serde_json::from_value(raw.clone()).ok()
}

// ============================================================================
// Decoded Events
// ============================================================================

/// A decoded envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Visible assistant text delta.
    AssistantText { text: String },
    /// Reasoning delta; rendered but not part of the message text.
    AssistantThinking { thinking: String },
    ToolStarted(ToolPayload),
    ToolCompleted(ToolPayload),
    ToolFailed(ToolPayload),
    /// Follow-up prompts offered to the user (non-string entries removed).
    PromptSuggestions { suggestions: Vec<String> },
    /// Telemetry from the server.
    System(SystemPayload),
    PermissionRequest(PermissionRequest),
    /// The server started answering a previously queued user message.
    QueueProcessing(QueueProcessing),
    Complete,
    Cancelled,
    Error {
        message: String,
        code: Option<String>,
    },
}

/// Tool invocation data carried by `tool_started`, `tool_completed` and `tool_failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    /// Tool-call identity used to merge lifecycle events.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ToolPayload {
    /// Error text, stringifying structured errors.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(message) => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Payload of a `system` envelope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SystemPayload {
    /// Context-window usage, when the server reported it.
    pub context_usage: Option<ContextUsage>,
}

/// Context-window usage telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub used_tokens: u64,
    pub max_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

/// A tool execution waiting for the user's approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Payload of a `queue_processing` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueProcessing {
    /// Assistant message now being answered.
    pub message_id: String,
    /// The queued user message it answers.
    pub user_message_id: String,
    /// Text of the queued user message.
    #[serde(default)]
    pub content: String,
    /// Stream the server will use for the new message, if it changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(kind: EnvelopeKind, payload: Value) -> Envelope {
        Envelope {
            chat_id: "chat-1".to_string(),
            message_id: "msg-1".to_string(),
            stream_id: "stream-1".to_string(),
            seq: 1,
            kind,
            payload,
            ts: None,
        }
    }

    #[test]
    fn envelope_uses_camel_case_identifiers() {
        let json = envelope(EnvelopeKind::AssistantText, json!({"text": "hi"}))
            .to_json()
            .unwrap();

        assert!(json.contains(r#""chatId":"chat-1""#));
        assert!(json.contains(r#""messageId":"msg-1""#));
        assert!(json.contains(r#""streamId":"stream-1""#));
        assert!(json.contains(r#""kind":"assistant_text""#));
        assert!(!json.contains("\"ts\""));
    }

    #[test]
    fn parse_wire_envelope_with_timestamp() {
        let line = r#"{"chatId":"c","messageId":"m","streamId":"s","seq":7,"kind":"complete","payload":{},"ts":"2026-01-01T00:00:00Z"}"#;
        let parsed = Envelope::from_json(line).unwrap();

        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.kind, EnvelopeKind::Complete);
        assert!(parsed.ts.is_some());
        assert_eq!(parsed.decode(), Some(StreamEvent::Complete));
    }

    #[test]
    fn missing_payload_defaults_to_empty_object() {
        let line = r#"{"chatId":"c","messageId":"m","streamId":"s","seq":1,"kind":"cancelled"}"#;
        let parsed = Envelope::from_json(line).unwrap();
        assert_eq!(parsed.payload, json!({}));
    }

    #[test]
    fn unknown_kind_parses_but_does_not_decode() {
        let line = r#"{"chatId":"c","messageId":"m","streamId":"s","seq":1,"kind":"heartbeat","payload":{}}"#;
        let parsed = Envelope::from_json(line).unwrap();

        assert_eq!(parsed.kind, EnvelopeKind::Unknown);
        assert!(parsed.decode().is_none());
    }

    #[test]
    fn negative_or_fractional_seq_is_rejected() {
        let negative = r#"{"chatId":"c","messageId":"m","streamId":"s","seq":-1,"kind":"complete"}"#;
        let fractional = r#"{"chatId":"c","messageId":"m","streamId":"s","seq":1.5,"kind":"complete"}"#;

        assert!(Envelope::from_json(negative).is_err());
        assert!(Envelope::from_json(fractional).is_err());
    }

    #[test]
    fn kind_displays_wire_name() {
        assert_eq!(EnvelopeKind::ToolFailed.to_string(), "tool_failed");
    }

    #[test]
    fn decode_text_requires_string() {
        let ok = envelope(EnvelopeKind::AssistantText, json!({"text": "Hel"}));
        assert_eq!(
            ok.decode(),
            Some(StreamEvent::AssistantText {
                text: "Hel".to_string()
            })
        );

        let bad = envelope(EnvelopeKind::AssistantText, json!({"text": 3}));
        assert!(bad.decode().is_none());
    }

    #[test]
    fn decode_tool_requires_tool_object() {
        let ok = envelope(
            EnvelopeKind::ToolCompleted,
            json!({"tool": {"id": "t1", "name": "bash", "result": {"exit": 0}}}),
        );
        match ok.decode() {
            Some(StreamEvent::ToolCompleted(tool)) => {
                assert_eq!(tool.id, "t1");
                assert_eq!(tool.name.as_deref(), Some("bash"));
                assert_eq!(tool.result, Some(json!({"exit": 0})));
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let missing = envelope(EnvelopeKind::ToolStarted, json!({"name": "bash"}));
        assert!(missing.decode().is_none());

        let not_object = envelope(EnvelopeKind::ToolStarted, json!({"tool": "bash"}));
        assert!(not_object.decode().is_none());
    }

    #[test]
    fn tool_error_message_stringifies_structured_errors() {
        let text = ToolPayload {
            id: "t".to_string(),
            name: None,
            input: None,
            result: None,
            error: Some(json!("boom")),
        };
        assert_eq!(text.error_message().as_deref(), Some("boom"));

        let structured = ToolPayload {
            error: Some(json!({"code": 2})),
            ..text
        };
        assert_eq!(structured.error_message().as_deref(), Some(r#"{"code":2}"#));
    }

    #[test]
    fn decode_suggestions_filters_non_strings() {
        let env = envelope(
            EnvelopeKind::PromptSuggestions,
            json!({"suggestions": ["run tests", 4, null, "explain"]}),
        );
        assert_eq!(
            env.decode(),
            Some(StreamEvent::PromptSuggestions {
                suggestions: vec!["run tests".to_string(), "explain".to_string()]
            })
        );
    }

    #[test]
    fn decode_permission_requires_all_fields() {
        let ok = envelope(
            EnvelopeKind::PermissionRequest,
            json!({"request_id": "r1", "tool_name": "bash", "tool_input": {"command": "ls"}}),
        );
        match ok.decode() {
            Some(StreamEvent::PermissionRequest(request)) => {
                assert_eq!(request.request_id, "r1");
                assert_eq!(request.tool_input["command"], "ls");
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let missing_input = envelope(
            EnvelopeKind::PermissionRequest,
            json!({"request_id": "r1", "tool_name": "bash"}),
        );
        assert!(missing_input.decode().is_none());
    }

    #[test]
    fn decode_system_reads_top_level_and_nested_usage() {
        let top = envelope(
            EnvelopeKind::System,
            json!({"context_usage": {"used_tokens": 10, "max_tokens": 100}}),
        );
        let nested = envelope(
            EnvelopeKind::System,
            json!({"data": {"context_usage": {"used_tokens": 5, "max_tokens": 50, "percentage": 10.0}}}),
        );
        let absent = envelope(EnvelopeKind::System, json!({"subtype": "init"}));

        match top.decode() {
            Some(StreamEvent::System(system)) => {
                assert_eq!(system.context_usage.unwrap().used_tokens, 10)
            }
            other => panic!("unexpected decode: {other:?}"),
        }
        match nested.decode() {
            Some(StreamEvent::System(system)) => {
                assert_eq!(system.context_usage.unwrap().percentage, Some(10.0))
            }
            other => panic!("unexpected decode: {other:?}"),
        }
        assert_eq!(
            absent.decode(),
            Some(StreamEvent::System(SystemPayload::default()))
        );
    }

    #[test]
    fn decode_error_defaults_message() {
        let with_message = envelope(EnvelopeKind::Error, json!({"message": "quota", "code": "429"}));
        assert_eq!(
            with_message.decode(),
            Some(StreamEvent::Error {
                message: "quota".to_string(),
                code: Some("429".to_string()),
            })
        );

        let bare = envelope(EnvelopeKind::Error, json!({}));
        assert_eq!(
            bare.decode(),
            Some(StreamEvent::Error {
                message: DEFAULT_ERROR_MESSAGE.to_string(),
                code: None,
            })
        );
    }

    #[test]
    fn decode_queue_processing() {
        let env = envelope(
            EnvelopeKind::QueueProcessing,
            json!({"message_id": "msg-2", "user_message_id": "user-2", "content": "next"}),
        );
        match env.decode() {
            Some(StreamEvent::QueueProcessing(queue)) => {
                assert_eq!(queue.message_id, "msg-2");
                assert_eq!(queue.user_message_id, "user-2");
                assert_eq!(queue.content, "next");
                assert!(queue.stream_id.is_none());
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let missing = envelope(EnvelopeKind::QueueProcessing, json!({"content": "next"}));
        assert!(missing.decode().is_none());
    }
}

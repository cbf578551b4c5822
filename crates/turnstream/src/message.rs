//! Conversation message model shared by the engine and the message cache.
//!
//! While a stream is open the engine is the only writer of `content_text`,
//! `content_render`, `last_seq` and `active_stream_id`. Ownership goes back to
//! the cache once `stream_status` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Message
// ============================================================================

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Streaming state of an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// A stream is (or was, before a dropped connection) filling this message.
    Streaming,
    Completed,
    /// The user cancelled the turn.
    Interrupted,
    Error,
}

/// A chat message as held by the live view and the message cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content_text: String,
    #[serde(default)]
    pub content_render: Vec<RenderEvent>,
    /// Highest envelope sequence applied to this message (resume cursor).
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_status: Option<StreamStatus>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a user message with the given text.
    #[must_use]
    pub fn user(id: impl Into<String>, chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            role: Role::User,
            content_text: text.into(),
            content_render: Vec::new(),
            last_seq: 0,
            active_stream_id: None,
            stream_status: None,
            created_at: Utc::now(),
        }
    }

    /// Create an empty assistant placeholder owned by `stream_id`.
    #[must_use]
    pub fn assistant_placeholder(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            role: Role::Assistant,
            content_text: String::new(),
            content_render: Vec::new(),
            last_seq: 0,
            active_stream_id: Some(stream_id.into()),
            stream_status: Some(StreamStatus::Streaming),
            created_at: Utc::now(),
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &MessagePatch) {
        if let Some(text) = &patch.content_text {
            self.content_text.clone_from(text);
        }
        if let Some(render) = &patch.content_render {
            self.content_render.clone_from(render);
        }
        if let Some(last_seq) = patch.last_seq {
            self.last_seq = last_seq;
        }
        if let Some(active) = &patch.active_stream_id {
            self.active_stream_id.clone_from(active);
        }
        if let Some(status) = patch.stream_status {
            self.stream_status = Some(status);
        }
    }
}

/// Partial message update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_render: Option<Vec<RenderEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
    /// `Some(None)` clears the active stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_stream_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_status: Option<StreamStatus>,
}

// ============================================================================
// Render Events
// ============================================================================

/// One renderable block of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderEvent {
    Text { text: String },
    Thinking { thinking: String },
    Tool(ToolAggregate),
    Suggestions { suggestions: Vec<String> },
}

/// Lifecycle state of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Started,
    Completed,
    Failed,
}

impl ToolStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// Merged view of one tool invocation's started/completed/failed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAggregate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

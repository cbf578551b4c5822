//! Typed engine output events.
//!
//! Published on a broadcast channel; subscribers that fall behind miss events
//! but can always read current state from the live view.

use serde::Serialize;
use thiserror::Error;
use turnstream_protocol::{ContextUsage, PermissionRequest};

use crate::message::StreamStatus;

/// Where a turn failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// The server sent an `error` envelope.
    Protocol,
    /// The connection failed after it was established.
    Transport,
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol => f.write_str("protocol"),
            Self::Transport => f.write_str("transport"),
        }
    }
}

/// Error information carried by [`EngineEvent::TurnFailed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{origin} error: {message}")]
pub struct StreamFailure {
    pub origin: FailureOrigin,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Something observable happened in the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The live view of a message changed.
    ContentUpdated {
        chat_id: String,
        message_id: String,
        stream_id: String,
        last_seq: u64,
    },
    /// A tool is waiting for the user's approval.
    PermissionRequested {
        chat_id: String,
        message_id: String,
        request: PermissionRequest,
    },
    UsageUpdated {
        chat_id: String,
        usage: ContextUsage,
    },
    /// A turn finished with `completed` or `interrupted`.
    TurnCompleted {
        chat_id: String,
        message_id: String,
        status: StreamStatus,
    },
    TurnFailed {
        chat_id: String,
        message_id: String,
        failure: StreamFailure,
        /// The empty user/assistant pair was removed.
        removed: bool,
    },
    /// The server moved on to a queued user message.
    QueueAdvanced {
        chat_id: String,
        previous_message_id: String,
        message_id: String,
        user_message_id: String,
        stream_id: String,
    },
    /// The channel closed without a terminal envelope; the message can be
    /// resumed from `last_seq`.
    StreamDisconnected {
        chat_id: String,
        message_id: String,
        stream_id: String,
        last_seq: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_display() {
        let failure = StreamFailure {
            origin: FailureOrigin::Protocol,
            message: "quota exceeded".to_string(),
            code: None,
        };
        assert_eq!(failure.to_string(), "protocol error: quota exceeded");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::TurnCompleted {
            chat_id: "c1".to_string(),
            message_id: "m1".to_string(),
            status: StreamStatus::Completed,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "turn_completed");
        assert_eq!(json["status"], "completed");
    }
}

//! Engine actor types and protocol.
//!
//! Defines the command protocol between [`EngineHandle`](super::EngineHandle)
//! and the engine task, along with settings and error types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::store::StorageError;
use crate::transport::{ChannelSignal, StreamChannel, TransportError, TurnRequest};

use super::dedup::DEFAULT_WINDOW_CAPACITY;
use super::projection::DEFAULT_DEBOUNCE;
use super::registry::StreamOrigin;

// ============================================================================
// Engine Command
// ============================================================================

/// Commands processed by the engine task, in arrival order.
pub enum EngineCommand {
    /// Register a freshly opened stream for a new turn.
    AttachStart {
        request: TurnRequest,
        message_id: String,
        channel: StreamChannel,
        reply: oneshot::Sender<Result<StreamTicket, EngineError>>,
    },
    /// Register a resumed stream for an existing message.
    AttachReplay {
        chat_id: String,
        message_id: String,
        after_seq: Option<u64>,
        channel: StreamChannel,
        reply: oneshot::Sender<Result<StreamTicket, EngineError>>,
    },
    /// Mark a chat's sessions as stopping. Replies with how many were marked.
    MarkStopped {
        chat_id: String,
        reply: oneshot::Sender<usize>,
    },
    /// A signal read by a stream's pump. `attach_id` names the session the
    /// pump was spawned for.
    Signal {
        stream_id: String,
        attach_id: u64,
        signal: ChannelSignal,
    },
    ActiveStreams {
        reply: oneshot::Sender<Vec<StreamInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The engine task has stopped.
    #[error("engine has shut down")]
    EngineShutdown,

    #[error("message not found: {0}")]
    MessageNotFound(String),
}

// ============================================================================
// Results
// ============================================================================

/// Identifies the turn a stream was attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTicket {
    pub chat_id: String,
    pub message_id: String,
    pub stream_id: String,
    pub user_message_id: Option<String>,
}

/// Read-only view of an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub origin: StreamOrigin,
    pub started_at: DateTime<Utc>,
    pub last_seq: u64,
    pub stop_requested: bool,
}

// ============================================================================
// Settings
// ============================================================================

/// Runtime settings for an engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub debounce: Duration,
    pub window_capacity: usize,
    pub notifications_enabled: bool,
    pub channel_capacity: usize,
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            notifications_enabled: true,
            channel_capacity: CHANNEL_CAPACITY,
            event_capacity: EVENT_CAPACITY,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce(),
            window_capacity: config.dedup.window_capacity,
            notifications_enabled: config.notifications.enabled,
            channel_capacity: config.engine.channel_capacity,
            event_capacity: config.engine.event_capacity,
        }
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Channel capacity for engine commands.
///
/// Pumps block on send when this fills, which backpressures the transport.
pub const CHANNEL_CAPACITY: usize = 256;

/// Broadcast buffer for output events.
pub const EVENT_CAPACITY: usize = 1024;

/// Channel capacity for debounce fires.
pub const FLUSH_CHANNEL_CAPACITY: usize = 64;

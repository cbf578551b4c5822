//! Registry of open stream sessions.
//!
//! Sessions are indexed by stream id, by chat, and by (chat, message). The
//! registry is owned by the engine actor, so lookups need no locking.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::debug;
use turnstream_protocol::Envelope;

use super::accumulator::ContentAccumulator;

// ============================================================================
// Stream Session
// ============================================================================

/// How a session came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Opened by `start_stream` for a new turn.
    Start,
    /// Re-opened by `replay_stream` for an existing message.
    Replay,
}

/// Owns the task draining a stream's transport channel.
///
/// Dropping the guard aborts the task, so a removed session never forwards
/// another signal.
#[derive(Debug, Default)]
pub struct PumpGuard {
    handle: Option<JoinHandle<()>>,
}

impl PumpGuard {
    #[must_use]
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// A guard with no task attached.
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// An open stream.
#[derive(Debug)]
pub struct StreamSession {
    /// Stream id of the transport connection.
    pub id: String,
    /// Distinguishes sessions that reuse a stream id. Assigned by the engine.
    pub attach_id: u64,
    pub chat_id: String,
    /// Assistant message being filled. Reassigned on queue continuation.
    pub message_id: String,
    /// User message that opened the turn, when known.
    pub user_message_id: Option<String>,
    pub origin: StreamOrigin,
    pub started_at: DateTime<Utc>,
    /// Highest sequence applied through this session.
    pub last_seq: u64,
    /// Set by `stop_stream`; a close without terminal then finalizes as interrupted.
    pub stop_requested: bool,
    pub accumulator: ContentAccumulator,
    pub pump: PumpGuard,
}

impl StreamSession {
    /// Create a session with an empty accumulator and no pump attached.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        message_id: impl Into<String>,
        origin: StreamOrigin,
    ) -> Self {
        Self {
            id: id.into(),
            attach_id: 0,
            chat_id: chat_id.into(),
            message_id: message_id.into(),
            user_message_id: None,
            origin,
            started_at: Utc::now(),
            last_seq: 0,
            stop_requested: false,
            accumulator: ContentAccumulator::default(),
            pump: PumpGuard::detached(),
        }
    }
}

// ============================================================================
// Session Registry
// ============================================================================

/// Set of currently open streams.
///
/// One session per stream id. Several sessions per chat are tolerated; the
/// engine reconciles overlaps during queue continuation.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, StreamSession>,
    /// Stream ids per chat, in registration order.
    by_chat: HashMap<String, Vec<String>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning any session it replaced under the same id.
    pub fn add_stream(&mut self, session: StreamSession) -> Option<StreamSession> {
        let replaced = self.remove_stream(&session.id);
        debug!(
            stream_id = %session.id,
            chat_id = %session.chat_id,
            message_id = %session.message_id,
            "Registered stream session"
        );
        self.by_chat
            .entry(session.chat_id.clone())
            .or_default()
            .push(session.id.clone());
        self.sessions.insert(session.id.clone(), session);
        replaced
    }

    /// Remove a session. Dropping the returned value aborts its pump.
    pub fn remove_stream(&mut self, stream_id: &str) -> Option<StreamSession> {
        let session = self.sessions.remove(stream_id)?;
        if let Some(ids) = self.by_chat.get_mut(&session.chat_id) {
            ids.retain(|id| id != stream_id);
            if ids.is_empty() {
                self.by_chat.remove(&session.chat_id);
            }
        }
        Some(session)
    }

    pub fn get_stream(&self, stream_id: &str) -> Option<&StreamSession> {
        self.sessions.get(stream_id)
    }

    pub fn get_stream_mut(&mut self, stream_id: &str) -> Option<&mut StreamSession> {
        self.sessions.get_mut(stream_id)
    }

    /// Most recently registered session of a chat.
    pub fn get_stream_by_chat(&self, chat_id: &str) -> Option<&StreamSession> {
        self.by_chat
            .get(chat_id)?
            .last()
            .and_then(|id| self.sessions.get(id))
    }

    pub fn get_stream_by_chat_and_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Option<&StreamSession> {
        self.streams_for_chat(chat_id)
            .into_iter()
            .find(|s| s.message_id == message_id)
    }

    /// Re-target the chat's session for `old_message_id` to `new_message_id`.
    ///
    /// Returns the stream id of the re-targeted session.
    pub fn update_stream_message_id(
        &mut self,
        chat_id: &str,
        old_message_id: &str,
        new_message_id: &str,
    ) -> Option<String> {
        let stream_id = self
            .by_chat
            .get(chat_id)?
            .iter()
            .find(|id| {
                self.sessions
                    .get(id.as_str())
                    .is_some_and(|s| s.message_id == old_message_id)
            })?
            .clone();
        let session = self.sessions.get_mut(&stream_id)?;
        session.message_id = new_message_id.to_string();
        Some(stream_id)
    }

    /// All sessions of a chat, oldest first.
    pub fn streams_for_chat(&self, chat_id: &str) -> Vec<&StreamSession> {
        self.by_chat
            .get(chat_id)
            .map(|ids| ids.iter().filter_map(|id| self.sessions.get(id)).collect())
            .unwrap_or_default()
    }

    /// Stream ids of a chat, oldest first.
    pub fn stream_ids_for_chat(&self, chat_id: &str) -> Vec<String> {
        self.by_chat.get(chat_id).cloned().unwrap_or_default()
    }

    /// The live session owning `channel_id`, if the envelope belongs to its chat.
    pub fn resolve(&mut self, channel_id: &str, envelope: &Envelope) -> Option<&mut StreamSession> {
        self.sessions
            .get_mut(channel_id)
            .filter(|s| s.chat_id == envelope.chat_id)
    }

    pub fn is_live(&self, stream_id: &str) -> bool {
        self.sessions.contains_key(stream_id)
    }

    /// True when `stream_id` is live and still the session `attach_id` names.
    pub fn is_current(&self, stream_id: &str, attach_id: u64) -> bool {
        self.sessions
            .get(stream_id)
            .is_some_and(|s| s.attach_id == attach_id)
    }

    /// Ids of every open session.
    pub fn stream_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every session.
    pub fn drain(&mut self) -> Vec<StreamSession> {
        self.by_chat.clear();
        self.sessions.drain().map(|(_, s)| s).collect()
    }
}

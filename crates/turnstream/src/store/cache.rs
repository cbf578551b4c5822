//! Message cache trait.
//!
//! The durable home of chat messages. The engine writes through it while a
//! stream is open; everything else reads from it.

use async_trait::async_trait;

use crate::message::{Message, MessagePatch};

use super::error::StorageResult;

/// Storage interface for chat messages.
#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Load a message by id.
    ///
    /// Returns `Ok(None)` if the message does not exist.
    async fn get_message(&self, message_id: &str) -> StorageResult<Option<Message>>;

    /// Insert a message, replacing any existing message with the same id.
    async fn add_message(&self, message: Message) -> StorageResult<()>;

    /// Apply a partial update to an existing message.
    ///
    /// Fails with `NotFound` when the message does not exist.
    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> StorageResult<()>;

    /// Remove messages by id. Missing ids are ignored.
    async fn remove_messages(&self, message_ids: &[String]) -> StorageResult<()>;

    /// List the messages of a chat in creation order.
    async fn chat_messages(&self, chat_id: &str) -> StorageResult<Vec<Message>>;
}

//! In-memory message cache.

use async_trait::async_trait;

use crate::message::{Message, MessagePatch};

use super::cache::MessageCache;
use super::error::{StorageError, StorageResult};
use super::ordered::OrderedMessages;

/// Message cache backed by a concurrent map.
///
/// Used by the CLI and tests. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryMessageCache {
    messages: OrderedMessages,
}

impl InMemoryMessageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageCache for InMemoryMessageCache {
    async fn get_message(&self, message_id: &str) -> StorageResult<Option<Message>> {
        Ok(self.messages.get(message_id))
    }

    async fn add_message(&self, message: Message) -> StorageResult<()> {
        self.messages.insert(message);
        Ok(())
    }

    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> StorageResult<()> {
        if self.messages.apply(message_id, patch) {
            Ok(())
        } else {
            Err(StorageError::not_found("message", message_id))
        }
    }

    async fn remove_messages(&self, message_ids: &[String]) -> StorageResult<()> {
        self.messages.remove(message_ids);
        Ok(())
    }

    async fn chat_messages(&self, chat_id: &str) -> StorageResult<Vec<Message>> {
        Ok(self.messages.chat_messages(chat_id))
    }
}

#[cfg(test)]
mod tests {
    use crate::message::StreamStatus;

    use super::*;

    #[tokio::test]
    async fn add_get_and_remove() {
        let cache = InMemoryMessageCache::new();
        cache
            .add_message(Message::user("u1", "c1", "hi"))
            .await
            .unwrap();

        let loaded = cache.get_message("u1").await.unwrap().unwrap();
        assert_eq!(loaded.content_text, "hi");

        cache.remove_messages(&["u1".to_string(), "missing".to_string()]).await.unwrap();
        assert!(cache.get_message("u1").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn update_applies_patch() {
        let cache = InMemoryMessageCache::new();
        cache
            .add_message(Message::assistant_placeholder("a1", "c1", "s1"))
            .await
            .unwrap();

        cache
            .update_message(
                "a1",
                &MessagePatch {
                    active_stream_id: Some(None),
                    stream_status: Some(StreamStatus::Completed),
                    ..MessagePatch::default()
                },
            )
            .await
            .unwrap();

        let loaded = cache.get_message("a1").await.unwrap().unwrap();
        assert_eq!(loaded.stream_status, Some(StreamStatus::Completed));
        assert!(loaded.active_stream_id.is_none());
    }

    #[tokio::test]
    async fn update_missing_message_is_not_found() {
        let cache = InMemoryMessageCache::new();
        let err = cache
            .update_message("nope", &MessagePatch::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn chat_messages_filters_by_chat_in_insertion_order() {
        let cache = InMemoryMessageCache::new();
        cache.add_message(Message::user("u9", "c1", "a")).await.unwrap();
        cache.add_message(Message::user("u2", "c2", "b")).await.unwrap();
        cache
            .add_message(Message::assistant_placeholder("a1", "c1", "s1"))
            .await
            .unwrap();

        let ids: Vec<String> = cache
            .chat_messages("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["u9".to_string(), "a1".to_string()]);
    }
}

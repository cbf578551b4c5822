//! Live in-memory view of messages.
//!
//! Updated synchronously on every accepted envelope and read by the UI side
//! without going through the engine mailbox. While a stream is open this is
//! the source of truth; the cache catches up on the debounce cadence.

use std::sync::Arc;

use crate::message::{Message, MessagePatch};
use crate::store::OrderedMessages;

/// Shared message view. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct LiveMessages {
    messages: Arc<OrderedMessages>,
}

impl LiveMessages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a message. A replaced message keeps its position.
    pub fn insert(&self, message: Message) {
        self.messages.insert(message);
    }

    /// Apply a patch. Returns false when the message is not in view.
    pub fn apply(&self, message_id: &str, patch: &MessagePatch) -> bool {
        self.messages.apply(message_id, patch)
    }

    pub fn get(&self, message_id: &str) -> Option<Message> {
        self.messages.get(message_id)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.contains(message_id)
    }

    pub fn remove(&self, message_ids: &[String]) {
        self.messages.remove(message_ids);
    }

    /// Messages of a chat in insertion order.
    pub fn chat_messages(&self, chat_id: &str) -> Vec<Message> {
        self.messages.chat_messages(chat_id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let view = LiveMessages::new();
        let reader = view.clone();
        view.insert(Message::user("u1", "c1", "hi"));
        view.insert(Message::assistant_placeholder("a1", "c1", "s1"));

        assert!(view.apply(
            "a1",
            &MessagePatch {
                content_text: Some("Hello".to_string()),
                ..MessagePatch::default()
            }
        ));
        assert_eq!(reader.get("a1").unwrap().content_text, "Hello");
        assert_eq!(reader.len(), 2);

        view.remove(&["u1".to_string(), "a1".to_string()]);
        assert!(reader.is_empty());
    }
}

//! Concurrent message map that remembers insertion order.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::message::{Message, MessagePatch};

/// Messages keyed by id. Re-inserting an id keeps its original position.
#[derive(Debug, Default)]
pub(crate) struct OrderedMessages {
    messages: DashMap<String, (u64, Message)>,
    next_order: AtomicU64,
}

impl OrderedMessages {
    pub(crate) fn insert(&self, message: Message) {
        let order = match self.messages.get(&message.id) {
            Some(existing) => existing.0,
            None => self.next_order.fetch_add(1, Ordering::Relaxed),
        };
        self.messages.insert(message.id.clone(), (order, message));
    }

    /// Returns false when the message is missing.
    pub(crate) fn apply(&self, message_id: &str, patch: &MessagePatch) -> bool {
        match self.messages.get_mut(message_id) {
            Some(mut entry) => {
                entry.1.apply(patch);
                true
            }
            None => false,
        }
    }

    pub(crate) fn get(&self, message_id: &str) -> Option<Message> {
        self.messages.get(message_id).map(|entry| entry.1.clone())
    }

    pub(crate) fn contains(&self, message_id: &str) -> bool {
        self.messages.contains_key(message_id)
    }

    pub(crate) fn remove(&self, message_ids: &[String]) {
        for id in message_ids {
            self.messages.remove(id);
        }
    }

    pub(crate) fn chat_messages(&self, chat_id: &str) -> Vec<Message> {
        let mut messages: Vec<(u64, Message)> = self
            .messages
            .iter()
            .filter(|entry| entry.1.chat_id == chat_id)
            .map(|entry| entry.value().clone())
            .collect();
        messages.sort_by_key(|(order, _)| *order);
        messages.into_iter().map(|(_, m)| m).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

//! Per-chat sequence de-duplication.
//!
//! Each chat keeps a bounded window of sequence numbers already applied and an
//! optional resume floor. The window is an approximation of "seen before":
//! once it overflows, the lowest sequences are evicted in a batch so the set
//! drops to three quarters of its capacity.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

/// Default number of sequence numbers remembered per chat.
pub const DEFAULT_WINDOW_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct ChatWindow {
    seen: BTreeSet<u64>,
    /// Sequences at or below this value are rejected.
    floor: u64,
}

/// Bounded at-most-once gate keyed by chat.
#[derive(Debug)]
pub struct SequenceDeduplicator {
    capacity: usize,
    windows: HashMap<String, ChatWindow>,
}

impl Default for SequenceDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl SequenceDeduplicator {
    /// Create a deduplicator remembering up to `capacity` sequences per chat.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: HashMap::new(),
        }
    }

    /// Record `seq` for `chat_id` and return whether it is new.
    ///
    /// `seq == 0` is malformed and rejected without being recorded. A repeat or
    /// a sequence at or below the chat's resume floor is rejected with no side
    /// effect.
    pub fn should_accept(&mut self, chat_id: &str, seq: u64) -> bool {
        if seq == 0 {
            debug!(chat_id = %chat_id, "Rejecting envelope with zero sequence");
            return false;
        }

        let window = self.windows.entry(chat_id.to_string()).or_default();
        if seq <= window.floor || !window.seen.insert(seq) {
            return false;
        }

        if window.seen.len() > self.capacity {
            let target = (self.capacity * 3 / 4).max(1);
            let excess = window.seen.len() - target;
            let evicted: Vec<u64> = window
                .seen
                .iter()
                .copied()
                .filter(|&s| s != seq)
                .take(excess)
                .collect();
            for s in &evicted {
                window.seen.remove(s);
            }
            debug!(
                chat_id = %chat_id,
                evicted = evicted.len(),
                remaining = window.seen.len(),
                "Evicted oldest sequences from dedup window"
            );
        }

        true
    }

    /// Forget everything about a chat (cold replay).
    pub fn clear_chat(&mut self, chat_id: &str) {
        self.windows.remove(chat_id);
    }

    /// Reject everything at or below `after_seq` for a chat (warm replay).
    ///
    /// Remembered sequences above the floor are kept.
    pub fn resume_from(&mut self, chat_id: &str, after_seq: u64) {
        let window = self.windows.entry(chat_id.to_string()).or_default();
        window.floor = after_seq;
        window.seen.retain(|&s| s > after_seq);
    }

    /// Number of sequences currently remembered for a chat.
    pub fn window_len(&self, chat_id: &str) -> usize {
        self.windows.get(chat_id).map_or(0, |w| w.seen.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

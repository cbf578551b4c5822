//! Completion notifications.

use tracing::info;

/// Told when a turn completes normally.
///
/// Called from the engine task, so implementations must not block.
pub trait Notifier: Send + Sync {
    fn turn_completed(&self, chat_id: &str, message_id: &str);
}

/// Notifier that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn turn_completed(&self, _chat_id: &str, _message_id: &str) {}
}

/// Notifier that logs completions.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn turn_completed(&self, chat_id: &str, message_id: &str) {
        info!(chat_id = %chat_id, message_id = %message_id, "Turn completed");
    }
}

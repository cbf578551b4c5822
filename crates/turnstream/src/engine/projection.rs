//! Debounced projection scheduling.
//!
//! The live view is updated on every accepted envelope. Cache writes are
//! coalesced: the first envelope after a flush arms a per-stream timer, and
//! the engine writes the accumulator's state when the timer fires.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default delay between the first change and the cache write.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Delivered when a stream's debounce timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushDue {
    pub stream_id: String,
    /// Identifies the arming that produced this fire.
    pub ticket: u64,
}

/// One armed timer. Dropping it aborts the sleeping task.
#[derive(Debug)]
struct FlushTimer {
    ticket: u64,
    handle: JoinHandle<()>,
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Owns at most one armed timer per stream.
#[derive(Debug)]
pub struct ProjectionScheduler {
    delay: Duration,
    due_tx: mpsc::Sender<FlushDue>,
    timers: HashMap<String, FlushTimer>,
    next_ticket: u64,
}

impl ProjectionScheduler {
    /// Create a scheduler delivering fires on `due_tx`.
    #[must_use]
    pub fn new(delay: Duration, due_tx: mpsc::Sender<FlushDue>) -> Self {
        Self {
            delay,
            due_tx,
            timers: HashMap::new(),
            next_ticket: 0,
        }
    }

    /// Arm the stream's timer.
    ///
    /// Returns false and does nothing while a timer is already armed.
    pub fn schedule(&mut self, stream_id: &str) -> bool {
        if self.timers.contains_key(stream_id) {
            return false;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let delay = self.delay;
        let due_tx = self.due_tx.clone();
        let due = FlushDue {
            stream_id: stream_id.to_string(),
            ticket,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due_tx.send(due).await;
        });

        self.timers
            .insert(stream_id.to_string(), FlushTimer { ticket, handle });
        true
    }

    /// Claim a fire. Returns true only for the ticket currently armed, which
    /// is released so the next change can re-arm.
    pub fn take_due(&mut self, due: &FlushDue) -> bool {
        match self.timers.get(&due.stream_id) {
            Some(timer) if timer.ticket == due.ticket => {
                self.timers.remove(&due.stream_id);
                true
            }
            _ => {
                debug!(stream_id = %due.stream_id, ticket = due.ticket, "Ignoring stale flush");
                false
            }
        }
    }

    /// Release the stream's timer without firing.
    pub fn cancel(&mut self, stream_id: &str) -> bool {
        self.timers.remove(stream_id).is_some()
    }

    /// Release every timer.
    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> (ProjectionScheduler, mpsc::Receiver<FlushDue>) {
        let (tx, rx) = mpsc::channel(16);
        (ProjectionScheduler::new(DEFAULT_DEBOUNCE, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_schedule_coalesces_into_one_fire() {
        let (mut scheduler, mut rx) = scheduler();

        assert!(scheduler.schedule("s1"));
        assert!(!scheduler.schedule("s1"));
        assert!(!scheduler.schedule("s1"));

        let due = rx.recv().await.unwrap();
        assert_eq!(due.stream_id, "s1");
        assert!(scheduler.take_due(&due));
        assert!(!scheduler.take_due(&due));

        // Nothing else was queued, and the claimed fire released the timer.
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(scheduler.schedule("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn fire_waits_for_delay() {
        let (mut scheduler, mut rx) = scheduler();
        scheduler.schedule("s1");

        tokio::time::sleep(DEFAULT_DEBOUNCE / 2).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(DEFAULT_DEBOUNCE).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let (mut scheduler, mut rx) = scheduler();
        scheduler.schedule("s1");

        assert!(scheduler.cancel("s1"));
        assert!(!scheduler.cancel("s1"));

        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ticket_is_ignored_after_rearm() {
        let (mut scheduler, _rx) = scheduler();
        scheduler.schedule("s1");
        let stale = FlushDue {
            stream_id: "s1".to_string(),
            ticket: 1,
        };

        scheduler.cancel("s1");
        scheduler.schedule("s1");

        assert!(!scheduler.take_due(&stale));
        let current = FlushDue {
            stream_id: "s1".to_string(),
            ticket: 2,
        };
        assert!(scheduler.take_due(&current));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_releases_all_timers() {
        let (mut scheduler, mut rx) = scheduler();
        scheduler.schedule("s1");
        scheduler.schedule("s2");

        scheduler.clear();

        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(scheduler.schedule("s1"));
        assert!(scheduler.schedule("s2"));
    }
}

//! Per-session message queue.
//!
//! Producers are backend message callbacks; the consumer is `get_messages`.
//! The lock is held only to append or swap out the buffers, so a callback
//! never waits on a drain for longer than a `mem::take`.

use super::types::{Notice, QueuedMessage};
use std::sync::Mutex;
use std::time::Duration;

/// Upper bound for `wait_then_drain`, whatever the caller asks for.
pub const MAX_DRAIN_WAIT_SECS: u64 = 300;

#[derive(Default)]
struct QueueInner {
    messages: Vec<QueuedMessage>,
    notices: Vec<Notice>,
}

/// Everything queued since the previous drain, in arrival order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Drained {
    pub messages: Vec<QueuedMessage>,
    pub notices: Vec<Notice>,
}

/// Unbounded FIFO of script messages plus error/status notices.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, message: QueuedMessage) {
        self.lock().messages.push(message);
    }

    pub fn push_notice(&self, notice: Notice) {
        self.lock().notices.push(notice);
    }

    /// Atomically take everything queued so far.
    pub fn drain(&self) -> Drained {
        let mut inner = self.lock();
        Drained {
            messages: std::mem::take(&mut inner.messages),
            notices: std::mem::take(&mut inner.notices),
        }
    }

    /// Sleep for `duration` (capped) without holding the lock, then drain.
    pub async fn wait_then_drain(&self, duration: Duration) -> Drained {
        let duration = duration.min(Duration::from_secs(MAX_DRAIN_WAIT_SECS));
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
        self.drain()
    }

    /// Number of undrained messages.
    pub(crate) fn len(&self) -> usize {
        self.lock().messages.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

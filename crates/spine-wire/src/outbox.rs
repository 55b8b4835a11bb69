//! Bounded per-subscriber queue with a slow-consumer policy.

use bytes::Bytes;
use spine_types::config::SlowConsumerPolicy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What happened to one offered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Queued without loss.
    Queued,
    /// Queued after discarding the oldest message.
    Replaced,
    /// Discarded; the queue stayed full.
    Rejected,
    /// Discarded and the failure limit was reached; the outbox is now closed.
    Disconnected,
    /// The outbox was already closed.
    Closed,
}

impl Offer {
    pub fn is_queued(self) -> bool {
        matches!(self, Offer::Queued | Offer::Replaced)
    }
}

/// Outbound queue drained by one writer task.
#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    items: Notify,
    space: Notify,
    closed: AtomicBool,
    failures: AtomicU32,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            items: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `message` according to `policy`.
    pub async fn offer(&self, message: Bytes, policy: SlowConsumerPolicy) -> Offer {
        if self.is_closed() {
            return Offer::Closed;
        }
        match policy {
            SlowConsumerPolicy::DropOldest => {
                let replaced = {
                    let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                    let replaced = if queue.len() >= self.capacity {
                        queue.pop_front().is_some()
                    } else {
                        false
                    };
                    queue.push_back(message);
                    replaced
                };
                self.items.notify_one();
                if replaced {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Offer::Replaced
                } else {
                    Offer::Queued
                }
            }
            SlowConsumerPolicy::Disconnect { max_failures } => match self.try_push(message) {
                Ok(()) => Offer::Queued,
                Err(_) => self.fail(Some(max_failures)),
            },
            SlowConsumerPolicy::Block { timeout_ms } => {
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                let mut message = message;
                loop {
                    match self.try_push(message) {
                        Ok(()) => return Offer::Queued,
                        Err(rejected) => message = rejected,
                    }
                    let space = self.space.notified();
                    tokio::pin!(space);
                    space.as_mut().enable();
                    if self.is_closed() {
                        return Offer::Closed;
                    }
                    if tokio::time::timeout_at(deadline, space).await.is_err() {
                        return self.fail(None);
                    }
                }
            }
        }
    }

    /// Next message, or `None` once the outbox is closed and empty.
    pub async fn next(&self) -> Option<Bytes> {
        loop {
            let popped = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pop_front()
            };
            if let Some(message) = popped {
                self.space.notify_one();
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            self.items.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.items.notify_one();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consecutive failed offers since the last successful one.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Messages discarded by the policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn try_push(&self, message: Bytes) -> Result<(), Bytes> {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                return Err(message);
            }
            queue.push_back(message);
        }
        self.failures.store(0, Ordering::Relaxed);
        self.items.notify_one();
        Ok(())
    }

    fn fail(&self, limit: Option<u32>) -> Offer {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        match limit {
            Some(max) if failures >= max => {
                self.close();
                Offer::Disconnected
            }
            _ => Offer::Rejected,
        }
    }
}

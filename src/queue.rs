//! Bounded single-producer/single-consumer media queues
//!
//! Live media only cares about the freshest frame, so the queue is small
//! and `push` evicts the oldest pending item instead of blocking the
//! capture side (latest-frame-wins). `pop` suspends until an item arrives
//! or the queue is closed.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

/// Counters for queue traffic, useful when tuning capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted by `push`
    pub pushed: u64,
    /// Items evicted to make room for newer ones
    pub dropped: u64,
}

impl QueueStats {
    /// Drop rate as a percentage of pushed items
    pub fn drop_rate(&self) -> f64 {
        if self.pushed == 0 {
            0.0
        } else {
            (self.dropped as f64 / self.pushed as f64) * 100.0
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    stats: QueueStats,
}

/// A bounded FIFO carrying decoded media units from a receive loop into
/// the bridge. One producer, one consumer.
pub struct TrackQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> TrackQueue<T> {
    /// Create a queue with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert an item without blocking.
    ///
    /// At capacity the oldest pending item is evicted first, so the
    /// consumer always sees the most recent items in FIFO order.
    /// Returns false if an item was evicted or the queue is closed.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return false;
            }
            state.stats.pushed += 1;
            let evicted = if state.items.len() == self.capacity {
                state.items.pop_front();
                state.stats.dropped += 1;
                true
            } else {
                false
            };
            state.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        if evicted {
            debug!("track queue full, evicted oldest item");
        }
        !evicted
    }

    /// Remove the oldest item if one is immediately available.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Wait for the next item.
    ///
    /// Returns None once the queue is closed and drained. Pending calls
    /// are woken by `close`.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue, waking any pending `pop`.
    ///
    /// Items already queued remain poppable; further pushes are refused.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// True once the queue is closed and no items remain.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.closed && state.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().unwrap().stats
    }
}

use crate::config::OverflowPolicy;
use herald_common::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

// Messages queued across every subscriber, exported as a gauge.
static GLOBAL_SUB_QUEUE_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Result of offering a message to a subscriber queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    /// Queue was full; the oldest entry was evicted to make room.
    DroppedOldest,
    /// Queue was full under the disconnect policy and is now closed.
    Disconnected,
    /// Queue was already closed; nothing was queued.
    Closed,
}

impl Enqueue {
    pub(crate) fn delivered(self) -> bool {
        matches!(self, Enqueue::Queued | Enqueue::DroppedOldest)
    }
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<Arc<Message>>,
    closed: bool,
}

/// Bounded single-consumer queue between a topic and one subscriber.
///
/// Pushing never waits: a full queue applies its overflow policy instead of
/// applying backpressure to the publisher.
#[derive(Debug)]
pub(crate) struct DeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl DeliveryQueue {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub(crate) fn push(&self, message: Arc<Message>) -> Enqueue {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Enqueue::Closed;
            }
            if state.items.len() < self.capacity {
                state.items.push_back(message);
                increment_depth();
                Enqueue::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(message);
                        metrics::counter!("herald_sub_queue_dropped_total").increment(1);
                        Enqueue::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => {
                        state.closed = true;
                        metrics::counter!("herald_sub_queue_disconnected_total").increment(1);
                        Enqueue::Disconnected
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next message. Returns `None` once the queue is closed and
    /// drained.
    pub(crate) async fn recv(&self) -> Option<Arc<Message>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(message) = state.items.pop_front() {
                    decrement_depth(1);
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn try_recv(&self) -> Option<Arc<Message>> {
        let message = self.state.lock().items.pop_front()?;
        decrement_depth(1);
        Some(message)
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        let remaining = self.state.get_mut().items.len();
        if remaining > 0 {
            decrement_depth(remaining);
        }
    }
}

fn increment_depth() {
    let global = GLOBAL_SUB_QUEUE_DEPTH.fetch_add(1, Ordering::Relaxed) + 1;
    metrics::gauge!("herald_sub_queue_len").set(global as f64);
}

fn decrement_depth(n: usize) {
    if let Ok(prev) = GLOBAL_SUB_QUEUE_DEPTH.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(n))
    }) {
        metrics::gauge!("herald_sub_queue_len").set(prev.saturating_sub(n) as f64);
    }
}

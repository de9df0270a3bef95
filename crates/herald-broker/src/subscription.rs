use crate::queue::DeliveryQueue;
use crate::topic::{SlotCell, SubscriberKey, Topic};
use herald_common::{Clock, Message};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Unregisters a subscriber and frees its visitor slot, exactly once.
#[derive(Debug)]
pub(crate) struct SubscriptionGuard {
    topic: Weak<Topic>,
    key: SubscriberKey,
    queue: Arc<DeliveryQueue>,
    slot: SlotCell,
    released: bool,
    clock: Arc<dyn Clock>,
}

impl SubscriptionGuard {
    pub(crate) fn new(
        topic: Weak<Topic>,
        key: SubscriberKey,
        queue: Arc<DeliveryQueue>,
        slot: SlotCell,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            topic,
            key,
            queue,
            slot,
            released: false,
            clock,
        }
    }

    fn is_released(&self) -> bool {
        self.released
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.queue.close();
        if let Some(topic) = self.topic.upgrade() {
            topic.remove_subscriber(self.key);
            topic.touch(self.clock.now());
        }
        // Already taken when dispatch disconnected us or the topic is gone.
        let slot = self.slot.lock().take();
        drop(slot);
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// A live subscription to one topic.
///
/// [`next_event`](Subscription::next_event) yields an `open` event first,
/// then the requested backlog oldest-first, then live messages as they are
/// published, with a `keepalive` event whenever the stream has been quiet
/// for a keepalive interval. Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    queue: Arc<DeliveryQueue>,
    backlog: VecDeque<Arc<Message>>,
    open_pending: bool,
    keepalive: Option<Interval>,
    clock: Arc<dyn Clock>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub(crate) fn new(
        topic: String,
        queue: Arc<DeliveryQueue>,
        backlog: VecDeque<Arc<Message>>,
        guard: SubscriptionGuard,
        keepalive: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keepalive = (!keepalive.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            topic,
            queue,
            backlog,
            open_pending: true,
            keepalive,
            clock,
            guard,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Backlog messages not yet handed out.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Next event on the stream. `None` once unsubscribed, or once a
    /// disconnected queue has been drained.
    pub async fn next_event(&mut self) -> Option<Arc<Message>> {
        if self.guard.is_released() {
            return None;
        }
        if self.open_pending {
            self.open_pending = false;
            return Some(Arc::new(Message::open(self.topic.as_str(), self.clock.now())));
        }
        if let Some(message) = self.backlog.pop_front() {
            return Some(message);
        }
        let message = match self.keepalive.as_mut() {
            Some(keepalive) => {
                tokio::select! {
                    message = self.queue.recv() => message,
                    _ = keepalive.tick() => {
                        return Some(Arc::new(Message::keepalive(
                            self.topic.as_str(),
                            self.clock.now(),
                        )));
                    }
                }
            }
            None => self.queue.recv().await,
        };
        if message.is_some() {
            if let Some(keepalive) = self.keepalive.as_mut() {
                keepalive.reset();
            }
        }
        message
    }

    /// Next message event, skipping `open` and `keepalive`.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        loop {
            let event = self.next_event().await?;
            if event.is_message() {
                return Some(event);
            }
        }
    }

    /// Next message if one is ready, without waiting. Consumes the pending
    /// `open` event, so a later [`next_event`](Self::next_event) never
    /// reports `open` after messages.
    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        if self.guard.is_released() {
            return None;
        }
        self.open_pending = false;
        self.backlog.pop_front().or_else(|| self.queue.try_recv())
    }

    /// Stop receiving. Calling it again, or dropping afterwards, is a no-op.
    pub fn unsubscribe(&mut self) {
        self.guard.release();
        self.backlog.clear();
    }

    pub fn is_active(&self) -> bool {
        !self.guard.is_released() && !self.queue.is_closed()
    }
}

use crate::config::OverflowPolicy;
use crate::error::Result;
use crate::queue::{DeliveryQueue, Enqueue};
use crate::subscription::{Subscription, SubscriptionGuard};
use crate::visitor::SubscriptionSlot;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use herald_common::{Clock, Message, Since};
use herald_storage::MessageCache;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;
use std::time::Duration;

/// Identifies one registration. The token guards against a stale key
/// removing whichever subscriber later reused the same slab index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubscriberKey {
    index: usize,
    token: u64,
}

/// Visitor slot shared by a registration and its subscription guard.
/// Whichever side unregisters first takes it.
pub(crate) type SlotCell = Arc<Mutex<Option<SubscriptionSlot>>>;

#[derive(Debug)]
struct RegisteredQueue {
    token: u64,
    queue: Arc<DeliveryQueue>,
    slot: SlotCell,
}

#[derive(Debug, Default)]
struct SubscriberRegistry {
    queues: Slab<RegisteredQueue>,
    next_token: u64,
}

#[derive(Debug, Clone)]
struct SubscriberEntry {
    key: SubscriberKey,
    queue: Arc<DeliveryQueue>,
}

#[derive(Debug, Clone)]
pub(crate) struct SubscribeOptions {
    pub(crate) queue_capacity: usize,
    pub(crate) overflow_policy: OverflowPolicy,
    pub(crate) keepalive: Duration,
    pub(crate) clock: Arc<dyn Clock>,
}

/// A named channel and its live subscribers.
#[derive(Debug)]
pub struct Topic {
    name: String,
    // Snapshot used by the publish path: lock-free read, rebuilt on
    // subscribe/unsubscribe only.
    subscribers_snapshot: ArcSwap<Vec<SubscriberEntry>>,
    subscribers: Mutex<SubscriberRegistry>,
    // Held across store+fan-out and across register+backlog read, so a new
    // subscriber sees each message exactly once, in the backlog or live.
    publish_lock: tokio::sync::Mutex<()>,
    last_access: Mutex<DateTime<Utc>>,
}

impl Topic {
    pub(crate) fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            subscribers_snapshot: ArcSwap::from_pointee(Vec::new()),
            subscribers: Mutex::new(SubscriberRegistry::default()),
            publish_lock: tokio::sync::Mutex::new(()),
            last_access: Mutex::new(now),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().queues.len()
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.lock()
    }

    pub(crate) fn touch(&self, now: DateTime<Utc>) {
        let mut last = self.last_access.lock();
        if now > *last {
            *last = now;
        }
    }

    /// True once the topic has had no activity for at least `grace`.
    pub(crate) fn is_idle(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let idle = (now - self.last_access()).to_std().unwrap_or(Duration::ZERO);
        idle >= grace
    }

    /// Store `message` and hand it to every live subscriber. Fan-out happens
    /// even when the store fails; the store result is returned alongside the
    /// number of subscribers that received it.
    pub(crate) async fn publish(
        &self,
        message: Arc<Message>,
        cache: &dyn MessageCache,
    ) -> (usize, herald_storage::Result<()>) {
        let _ordering = self.publish_lock.lock().await;
        let stored = cache.store(&message).await;
        let delivered = self.dispatch(&message);
        (delivered, stored)
    }

    pub(crate) async fn subscribe(
        self: &Arc<Self>,
        slot: SubscriptionSlot,
        since: Option<Since>,
        cache: &dyn MessageCache,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let queue = Arc::new(DeliveryQueue::new(
            options.queue_capacity,
            options.overflow_policy,
        ));
        let slot: SlotCell = Arc::new(Mutex::new(Some(slot)));
        let _ordering = self.publish_lock.lock().await;
        let key = self.register(Arc::clone(&queue), Arc::clone(&slot));
        // Built before the backlog read so a cache error unregisters.
        let guard = SubscriptionGuard::new(
            Arc::downgrade(self),
            key,
            Arc::clone(&queue),
            slot,
            Arc::clone(&options.clock),
        );
        let backlog = match since {
            Some(since) => cache.since(&self.name, since).await?,
            None => Vec::new(),
        };
        Ok(Subscription::new(
            self.name.clone(),
            queue,
            backlog.into(),
            guard,
            options.keepalive,
            options.clock,
        ))
    }

    fn register(&self, queue: Arc<DeliveryQueue>, slot: SlotCell) -> SubscriberKey {
        let mut registry = self.subscribers.lock();
        let token = registry.next_token;
        registry.next_token += 1;
        let index = registry.queues.insert(RegisteredQueue { token, queue, slot });
        self.rebuild_subscriber_snapshot(&registry);
        SubscriberKey { index, token }
    }

    pub(crate) fn remove_subscriber(&self, key: SubscriberKey) -> bool {
        self.remove_subscribers(&[key]) > 0
    }

    /// Unregister `keys` and free their visitor slots. A subscriber leaves
    /// the live set and gives back its slot in the same step, whether its
    /// owner dropped it or dispatch disconnected it.
    fn remove_subscribers(&self, keys: &[SubscriberKey]) -> usize {
        let mut freed = Vec::with_capacity(keys.len());
        {
            let mut registry = self.subscribers.lock();
            for key in keys {
                let matches = registry
                    .queues
                    .get(key.index)
                    .is_some_and(|entry| entry.token == key.token);
                if matches {
                    let entry = registry.queues.remove(key.index);
                    entry.queue.close();
                    freed.push(entry.slot.lock().take());
                }
            }
            if !freed.is_empty() {
                self.rebuild_subscriber_snapshot(&registry);
            }
        }
        let removed = freed.len();
        drop(freed);
        removed
    }

    fn rebuild_subscriber_snapshot(&self, registry: &SubscriberRegistry) {
        let snapshot = registry
            .queues
            .iter()
            .map(|(index, entry)| SubscriberEntry {
                key: SubscriberKey {
                    index,
                    token: entry.token,
                },
                queue: Arc::clone(&entry.queue),
            })
            .collect();
        self.subscribers_snapshot.store(Arc::new(snapshot));
    }

    /// Offer `message` to every subscriber without waiting on any of them.
    /// Closed or disconnected queues are unregistered.
    fn dispatch(&self, message: &Arc<Message>) -> usize {
        let subscribers = self.subscribers_snapshot.load();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in subscribers.iter() {
            match entry.queue.push(Arc::clone(message)) {
                outcome if outcome.delivered() => delivered += 1,
                Enqueue::Disconnected => {
                    tracing::debug!(topic = %self.name, "slow subscriber disconnected");
                    dead.push(entry.key);
                }
                _ => dead.push(entry.key),
            }
        }
        if !dead.is_empty() {
            self.remove_subscribers(&dead);
        }
        delivered
    }
}

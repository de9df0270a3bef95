//! Topic-based notification dispatch core.
//!
//! Publishers post short messages to named topics; subscribers receive them
//! live plus an optional backlog from the message cache. Admission is gated
//! per visitor address by token-bucket rate limits and a cap on concurrent
//! subscriptions. Delayed messages wait in a scheduler until their release
//! time, and a periodic manager prunes the cache and drops idle topics and
//! visitors.
pub mod config;
pub mod error;
pub mod manager;
pub mod rate_limiter;
pub mod relay;
pub mod scheduler;
pub mod subscription;
pub mod topic;
pub mod visitor;

mod queue;

pub use config::{BrokerConfig, OverflowPolicy};
pub use error::{BrokerError, ErrorKind, Result};
pub use manager::{BackgroundTasks, BrokerStats};
pub use relay::{Mailer, PushRelay, RELAY_CONTROL_TOPIC, RelayError};
pub use scheduler::DelayedScheduler;
pub use subscription::Subscription;
pub use topic::Topic;
pub use visitor::{Visitor, VisitorRegistry, visitor_address};

use ahash::RandomState;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use herald_common::{Clock, Message, MessageContent, Since, SystemClock};
use herald_storage::MessageCache;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard};
use topic::SubscribeOptions;

type TopicMap = HashMap<String, Arc<Topic>, RandomState>;

/// When a delayed message should be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    After(Duration),
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub content: MessageContent,
    pub delay: Option<Delay>,
    /// Also send the message to this e-mail address.
    pub email: Option<String>,
}

impl PublishRequest {
    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_email(mut self, to: impl Into<String>) -> Self {
        self.email = Some(to.into());
        self
    }
}

impl From<MessageContent> for PublishRequest {
    fn from(content: MessageContent) -> Self {
        Self {
            content,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Published {
    pub message: Arc<Message>,
    /// Subscribers the message was handed to; zero for delayed messages.
    pub delivered: usize,
    pub scheduled: bool,
}

#[derive(Debug, Clone, Copy)]
enum Limiter {
    Request,
    Email,
}

// Read lease on the topic registry. While any lease is held the manager
// cannot remove topics, so a looked-up topic stays registered until the
// caller's store, fan-out, or subscriber registration is done.
struct TopicLease<'a> {
    _registry: RwLockReadGuard<'a, TopicMap>,
    topic: Arc<Topic>,
}

/// In-process notification broker.
///
/// ```
/// use herald_broker::{Broker, BrokerConfig};
/// use herald_common::{MessageContent, Since};
/// use herald_storage::MemoryCache;
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::sync::Arc;
///
/// let broker = Broker::new(BrokerConfig::default(), Arc::new(MemoryCache::new(None)));
/// let visitor = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut sub = broker
///         .subscribe("alerts", visitor, None)
///         .await
///         .expect("subscribe");
///     broker
///         .publish("alerts", visitor, MessageContent::text("hello").into())
///         .await
///         .expect("publish");
///     let msg = sub.recv().await.expect("recv");
///     assert_eq!(msg.body(), "hello");
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    topics: RwLock<TopicMap>,
    visitors: VisitorRegistry,
    cache: Arc<dyn MessageCache>,
    scheduler: Option<DelayedScheduler>,
    relay: Option<Arc<dyn PushRelay>>,
    mailer: Option<Arc<dyn Mailer>>,
    clock: Arc<dyn Clock>,
    config: BrokerConfig,
    published: AtomicU64,
    closed: AtomicBool,
}

impl Broker {
    pub fn new(config: BrokerConfig, cache: Arc<dyn MessageCache>) -> Self {
        Self {
            topics: RwLock::new(HashMap::with_hasher(RandomState::new())),
            visitors: VisitorRegistry::new((&config).into()),
            cache,
            scheduler: Some(DelayedScheduler::new(config.min_delay, config.max_delay)),
            relay: None,
            mailer: None,
            clock: Arc::new(SystemClock),
            config,
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_push_relay(mut self, relay: Arc<dyn PushRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Reject delayed publishes instead of scheduling them.
    pub fn without_scheduler(mut self) -> Self {
        self.scheduler = None;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn cache(&self) -> &Arc<dyn MessageCache> {
        &self.cache
    }

    pub fn push_relay(&self) -> Option<&Arc<dyn PushRelay>> {
        self.relay.as_ref()
    }

    /// Admission state for `address`, created on first use.
    pub fn visitor(&self, address: IpAddr) -> Arc<Visitor> {
        self.visitors.visitor_for(address, self.clock.now())
    }

    /// Resolve the address limits apply to, honoring `behind_proxy`.
    pub fn visitor_address(&self, remote: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        visitor_address(remote, forwarded_for, self.config.behind_proxy)
    }

    pub async fn publish(
        &self,
        topic: &str,
        visitor: IpAddr,
        request: PublishRequest,
    ) -> Result<Published> {
        self.publish_inner(topic, visitor, request, Limiter::Request)
            .await
            .inspect_err(record_denial)
    }

    /// Publish a message that arrived by inbound e-mail. Charged against the
    /// visitor's e-mail bucket rather than the request bucket.
    pub async fn publish_email(
        &self,
        topic: &str,
        visitor: IpAddr,
        content: MessageContent,
    ) -> Result<Published> {
        self.publish_inner(topic, visitor, content.into(), Limiter::Email)
            .await
            .inspect_err(record_denial)
    }

    async fn publish_inner(
        &self,
        topic: &str,
        address: IpAddr,
        request: PublishRequest,
        limiter: Limiter,
    ) -> Result<Published> {
        self.ensure_open()?;
        validate_topic(topic)?;
        let now = self.clock.now();
        let visitor = self.visitors.visitor_for(address, now);
        match limiter {
            Limiter::Request => visitor.allow_request(now)?,
            Limiter::Email => visitor.allow_email(now)?,
        }
        let size = request.content.body.len();
        if size > self.config.message_limit {
            return Err(BrokerError::PayloadTooLarge {
                size,
                limit: self.config.message_limit,
            });
        }

        let release_at = match request.delay {
            None => None,
            Some(Delay::After(after)) => Some(
                chrono::Duration::from_std(after)
                    .ok()
                    .and_then(|after| now.checked_add_signed(after))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            ),
            Some(Delay::At(at)) => Some(at),
        };
        if let Some(release_at) = release_at {
            if request.email.is_some() {
                return Err(BrokerError::DelayedEmailUnsupported);
            }
            let scheduler = self.scheduler.as_ref().ok_or(BrokerError::DelayedDisabled)?;
            scheduler.validate(release_at, now)?;
        }
        if request.email.is_some() {
            visitor.allow_email(now)?;
        }

        let lease = self.lease_topic(topic, now).await?;
        match (release_at, self.scheduler.as_ref()) {
            (Some(release_at), Some(scheduler)) => {
                let message = Arc::new(Message::new(topic, request.content, release_at));
                scheduler.schedule(Arc::clone(&message), now)?;
                drop(lease);
                self.published.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("herald_messages_scheduled_total").increment(1);
                tracing::debug!(topic, id = %message.id, release_at = %release_at, "message scheduled");
                Ok(Published {
                    message,
                    delivered: 0,
                    scheduled: true,
                })
            }
            (Some(_), None) => Err(BrokerError::DelayedDisabled),
            (None, _) => {
                let message = Arc::new(Message::new(topic, request.content, now));
                let (delivered, stored) = lease.topic.publish(Arc::clone(&message), self.cache.as_ref()).await;
                drop(lease);
                self.published.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("herald_messages_published_total").increment(1);
                tracing::debug!(topic, id = %message.id, delivered, "message published");

                if let Some(relay) = &self.relay {
                    relay::spawn_forward(Arc::clone(relay), Arc::clone(&message));
                }
                if let (Some(mailer), Some(to)) = (&self.mailer, request.email) {
                    relay::spawn_mail(Arc::clone(mailer), address, to, Arc::clone(&message));
                }
                if let Err(err) = stored {
                    tracing::error!(topic, id = %message.id, error = %err, "message delivered but not cached");
                    return Err(err.into());
                }
                Ok(Published {
                    message,
                    delivered,
                    scheduled: false,
                })
            }
        }
    }

    /// Open a live subscription. With `since`, retained messages matching it
    /// are delivered first, followed by live messages with no gap and no
    /// duplicate in between.
    pub async fn subscribe(
        &self,
        topic: &str,
        address: IpAddr,
        since: Option<Since>,
    ) -> Result<Subscription> {
        self.subscribe_inner(topic, address, since)
            .await
            .inspect_err(record_denial)
    }

    async fn subscribe_inner(
        &self,
        topic: &str,
        address: IpAddr,
        since: Option<Since>,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        validate_topic(topic)?;
        let now = self.clock.now();
        let visitor = self.visitors.visitor_for(address, now);
        visitor.allow_request(now)?;
        let slot = visitor.try_reserve_subscription()?;
        let lease = self.lease_topic(topic, now).await?;
        let options = SubscribeOptions {
            queue_capacity: self.config.subscriber_queue_capacity,
            overflow_policy: self.config.overflow_policy,
            keepalive: self.config.keepalive_interval,
            clock: Arc::clone(&self.clock),
        };
        let subscription = lease
            .topic
            .subscribe(slot, since.map(|since| since.resolve(now)), self.cache.as_ref(), options)
            .await?;
        tracing::debug!(topic, visitor = %address, backlog = subscription.backlog_len(), "subscribed");
        Ok(subscription)
    }

    /// One-shot read of retained messages, without holding a subscription.
    pub async fn poll(&self, topic: &str, address: IpAddr, since: Since) -> Result<Vec<Arc<Message>>> {
        self.poll_inner(topic, address, since)
            .await
            .inspect_err(record_denial)
    }

    async fn poll_inner(&self, topic: &str, address: IpAddr, since: Since) -> Result<Vec<Arc<Message>>> {
        self.ensure_open()?;
        validate_topic(topic)?;
        let now = self.clock.now();
        self.visitors.visitor_for(address, now).allow_request(now)?;
        Ok(self.cache.since(topic, since.resolve(now)).await?)
    }

    /// Deliver every delayed message whose release time has passed. Returns
    /// how many were released.
    pub async fn release_due(&self) -> usize {
        let Some(scheduler) = &self.scheduler else {
            return 0;
        };
        let now = self.clock.now();
        let due = scheduler.take_due(now);
        let mut released = 0;
        for message in due {
            let lease = match self.lease_topic(&message.topic, now).await {
                Ok(lease) => lease,
                Err(err) => {
                    tracing::warn!(topic = %message.topic, id = %message.id, error = %err, "dropping delayed message");
                    continue;
                }
            };
            let (delivered, stored) = lease.topic.publish(Arc::clone(&message), self.cache.as_ref()).await;
            drop(lease);
            if let Err(err) = stored {
                tracing::error!(topic = %message.topic, id = %message.id, error = %err, "delayed message delivered but not cached");
            }
            if let Some(relay) = &self.relay {
                relay::spawn_forward(Arc::clone(relay), Arc::clone(&message));
            }
            metrics::counter!("herald_messages_released_total").increment(1);
            tracing::debug!(topic = %message.topic, id = %message.id, delivered, "delayed message released");
            released += 1;
        }
        released
    }

    /// Send a keepalive control event through the push relay so the upstream
    /// gateway keeps the connection warm. Returns false when no relay is
    /// configured or the relay refused it.
    pub async fn relay_keepalive(&self) -> bool {
        let Some(relay) = &self.relay else {
            return false;
        };
        let keepalive = Message::keepalive(RELAY_CONTROL_TOPIC, self.clock.now());
        match relay.forward(RELAY_CONTROL_TOPIC, &keepalive).await {
            Ok(()) => {
                tracing::debug!("relay keepalive sent");
                true
            }
            Err(err) => {
                metrics::counter!("herald_relay_failures_total").increment(1);
                tracing::warn!(error = %err, "relay keepalive failed");
                false
            }
        }
    }

    pub async fn prune_cache(&self) -> Result<usize> {
        Ok(self.cache.prune(self.clock.now()).await?)
    }

    /// Drop topics that have no subscribers, no retained messages and no
    /// pending delayed messages, and have been idle past the grace period.
    pub async fn remove_idle_topics(&self) -> usize {
        let now = self.clock.now();
        let grace = self.config.topic_idle_grace;
        let candidates: Vec<String> = self
            .topics
            .read()
            .await
            .values()
            .filter(|topic| topic.subscriber_count() == 0 && topic.is_idle(now, grace))
            .map(|topic| topic.name().to_string())
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        // Recheck under the write lock: no lease can be taken meanwhile, so
        // nothing can subscribe, publish or schedule into a topic we remove.
        let mut registry = self.topics.write().await;
        let mut removed = 0;
        for name in candidates {
            let idle = registry
                .get(name.as_str())
                .is_some_and(|topic| topic.subscriber_count() == 0 && topic.is_idle(now, grace));
            if !idle || self.has_pending(&name) {
                continue;
            }
            match self.cache.count(&name).await {
                Ok(0) => {
                    registry.remove(name.as_str());
                    removed += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(topic = %name, error = %err, "keeping topic, cache count failed");
                }
            }
        }
        removed
    }

    pub fn expunge_visitors(&self) -> usize {
        self.visitors
            .expunge(self.clock.now(), self.config.visitor_expunge_after)
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn stats(&self) -> BrokerStats {
        let (topics, subscribers) = {
            let registry = self.topics.read().await;
            let subscribers = registry.values().map(|topic| topic.subscriber_count()).sum();
            (registry.len(), subscribers)
        };
        let messages_cached = match self.cache.total().await {
            Ok(total) => total,
            Err(err) => {
                tracing::warn!(error = %err, "cache total unavailable");
                0
            }
        };
        BrokerStats {
            messages_published: self.published.load(Ordering::Relaxed),
            topics,
            subscribers,
            messages_cached,
            delayed_pending: self.scheduler.as_ref().map_or(0, DelayedScheduler::len),
            visitors: self.visitors.len(),
        }
    }

    /// Stop admitting new work. Live subscriptions keep running until their
    /// owners drop them.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("broker closed to new requests");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BrokerError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn has_pending(&self, topic: &str) -> bool {
        self.scheduler
            .as_ref()
            .is_some_and(|scheduler| scheduler.has_pending_for(topic))
    }

    async fn lease_topic(&self, name: &str, now: DateTime<Utc>) -> Result<TopicLease<'_>> {
        {
            let registry = self.topics.read().await;
            if let Some(topic) = registry.get(name).cloned() {
                topic.touch(now);
                return Ok(TopicLease {
                    _registry: registry,
                    topic,
                });
            }
        }
        let mut registry = self.topics.write().await;
        let topic = match registry.get(name) {
            Some(topic) => Arc::clone(topic),
            None => {
                if registry.len() >= self.config.global_topic_limit {
                    return Err(BrokerError::TooManyTopics {
                        limit: self.config.global_topic_limit,
                    });
                }
                let topic = Arc::new(Topic::new(name, now));
                registry.insert(name.to_string(), Arc::clone(&topic));
                tracing::debug!(topic = name, "topic created");
                topic
            }
        };
        topic.touch(now);
        Ok(TopicLease {
            _registry: registry.downgrade(),
            topic,
        })
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    herald_common::validate_topic(topic).map_err(|_| BrokerError::InvalidTopic(topic.to_string()))
}

fn record_denial(err: &BrokerError) {
    if matches!(err.kind(), ErrorKind::AdmissionDenied | ErrorKind::SchedulingInvalid) {
        metrics::counter!("herald_admission_denied_total", "reason" => err.reason()).increment(1);
    }
}

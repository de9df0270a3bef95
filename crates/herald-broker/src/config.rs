// Values the dispatch core consumes. Parsing and validation of operator input
// happens in the service crate; this struct only carries the numbers.
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MANAGER_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_AT_SENDER_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3 * 24 * 60 * 60);
pub const DEFAULT_MESSAGE_LIMIT: usize = 512;

// Limits: the request bucket holds 60 and refills one per 10s, the e-mail
// bucket holds 16 and refills one per hour.
pub const DEFAULT_GLOBAL_TOPIC_LIMIT: usize = 5000;
pub const DEFAULT_VISITOR_REQUEST_LIMIT_BURST: u32 = 60;
pub const DEFAULT_VISITOR_REQUEST_LIMIT_REPLENISH: Duration = Duration::from_secs(10);
pub const DEFAULT_VISITOR_EMAIL_LIMIT_BURST: u32 = 16;
pub const DEFAULT_VISITOR_EMAIL_LIMIT_REPLENISH: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_VISITOR_SUBSCRIPTION_LIMIT: usize = 30;
pub const DEFAULT_VISITOR_EXPUNGE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_RELAY_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// What a subscriber's delivery queue does when a publish finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Close the queue; the subscriber drains what is queued and then ends.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub keepalive_interval: Duration,
    pub manager_interval: Duration,
    pub at_sender_interval: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Max message body size in bytes.
    pub message_limit: usize,
    pub global_topic_limit: usize,
    pub visitor_subscription_limit: usize,
    pub visitor_request_limit_burst: u32,
    pub visitor_request_limit_replenish: Duration,
    pub visitor_email_limit_burst: u32,
    pub visitor_email_limit_replenish: Duration,
    /// Visitors with no subscriptions unseen for this long are forgotten.
    pub visitor_expunge_after: Duration,
    /// Empty topics are kept at least this long after their last activity.
    pub topic_idle_grace: Duration,
    /// How often the push relay gets a keepalive control event. Zero
    /// disables it.
    pub relay_keepalive_interval: Duration,
    pub subscriber_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Take the visitor address from the forwarded-for header.
    pub behind_proxy: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            manager_interval: DEFAULT_MANAGER_INTERVAL,
            at_sender_interval: DEFAULT_AT_SENDER_INTERVAL,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            message_limit: DEFAULT_MESSAGE_LIMIT,
            global_topic_limit: DEFAULT_GLOBAL_TOPIC_LIMIT,
            visitor_subscription_limit: DEFAULT_VISITOR_SUBSCRIPTION_LIMIT,
            visitor_request_limit_burst: DEFAULT_VISITOR_REQUEST_LIMIT_BURST,
            visitor_request_limit_replenish: DEFAULT_VISITOR_REQUEST_LIMIT_REPLENISH,
            visitor_email_limit_burst: DEFAULT_VISITOR_EMAIL_LIMIT_BURST,
            visitor_email_limit_replenish: DEFAULT_VISITOR_EMAIL_LIMIT_REPLENISH,
            visitor_expunge_after: DEFAULT_VISITOR_EXPUNGE_AFTER,
            topic_idle_grace: DEFAULT_KEEPALIVE_INTERVAL,
            relay_keepalive_interval: DEFAULT_RELAY_KEEPALIVE_INTERVAL,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::DropOldest,
            behind_proxy: false,
        }
    }
}

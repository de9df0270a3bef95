// Per-address admission state: request and e-mail token buckets plus the
// count of live subscriptions. Visitors are created on first contact and
// forgotten by the manager once idle.
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::rate_limiter::RateLimiter;
use ahash::RandomState;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct VisitorLimits {
    pub request_burst: u32,
    pub request_replenish: Duration,
    pub email_burst: u32,
    pub email_replenish: Duration,
    pub subscription_limit: usize,
}

impl From<&BrokerConfig> for VisitorLimits {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            request_burst: config.visitor_request_limit_burst,
            request_replenish: config.visitor_request_limit_replenish,
            email_burst: config.visitor_email_limit_burst,
            email_replenish: config.visitor_email_limit_replenish,
            subscription_limit: config.visitor_subscription_limit,
        }
    }
}

#[derive(Debug)]
pub struct Visitor {
    address: IpAddr,
    requests: Mutex<RateLimiter>,
    emails: Mutex<RateLimiter>,
    subscriptions: AtomicUsize,
    subscription_limit: usize,
    last_seen: Mutex<DateTime<Utc>>,
}

impl Visitor {
    pub fn new(address: IpAddr, limits: VisitorLimits, now: DateTime<Utc>) -> Self {
        Self {
            address,
            requests: Mutex::new(RateLimiter::new(
                limits.request_burst,
                limits.request_replenish,
                now,
            )),
            emails: Mutex::new(RateLimiter::new(limits.email_burst, limits.email_replenish, now)),
            subscriptions: AtomicUsize::new(0),
            subscription_limit: limits.subscription_limit,
            last_seen: Mutex::new(now),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn allow_request(&self, now: DateTime<Utc>) -> Result<()> {
        let mut limiter = self.requests.lock();
        if limiter.allow(now) {
            Ok(())
        } else {
            Err(BrokerError::RateLimitedRequest {
                retry_after: limiter.retry_after(now),
            })
        }
    }

    pub fn allow_email(&self, now: DateTime<Utc>) -> Result<()> {
        let mut limiter = self.emails.lock();
        if limiter.allow(now) {
            Ok(())
        } else {
            Err(BrokerError::RateLimitedEmail {
                retry_after: limiter.retry_after(now),
            })
        }
    }

    /// Claim one of this visitor's subscription slots. The slot is released
    /// when the returned handle is dropped.
    pub fn try_reserve_subscription(self: &Arc<Self>) -> Result<SubscriptionSlot> {
        let limit = self.subscription_limit;
        self.subscriptions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .map_err(|_| BrokerError::TooManySubscriptions { limit })?;
        Ok(SubscriptionSlot {
            visitor: Arc::clone(self),
        })
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::Acquire)
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    fn touch(&self, now: DateTime<Utc>) {
        let mut seen = self.last_seen.lock();
        if now > *seen {
            *seen = now;
        }
    }

    fn release_subscription(&self) {
        let _ = self
            .subscriptions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                active.checked_sub(1)
            });
    }

    fn is_expired(&self, now: DateTime<Utc>, after: Duration) -> bool {
        if self.active_subscriptions() > 0 {
            return false;
        }
        let idle = (now - self.last_seen()).to_std().unwrap_or(Duration::ZERO);
        idle >= after
    }
}

/// Holds one subscription slot of a visitor until dropped.
#[derive(Debug)]
pub struct SubscriptionSlot {
    visitor: Arc<Visitor>,
}

impl SubscriptionSlot {
    pub fn visitor(&self) -> &Arc<Visitor> {
        &self.visitor
    }
}

impl Drop for SubscriptionSlot {
    fn drop(&mut self) {
        self.visitor.release_subscription();
    }
}

#[derive(Debug)]
pub struct VisitorRegistry {
    visitors: Mutex<HashMap<IpAddr, Arc<Visitor>, RandomState>>,
    limits: VisitorLimits,
}

impl VisitorRegistry {
    pub fn new(limits: VisitorLimits) -> Self {
        Self {
            visitors: Mutex::new(HashMap::with_hasher(RandomState::new())),
            limits,
        }
    }

    /// Look up or create the visitor for `address`, marking it seen.
    pub fn visitor_for(&self, address: IpAddr, now: DateTime<Utc>) -> Arc<Visitor> {
        let mut visitors = self.visitors.lock();
        let visitor = visitors
            .entry(address)
            .or_insert_with(|| Arc::new(Visitor::new(address, self.limits, now)));
        // Touch under the registry lock so expunge never races a fresh lookup.
        visitor.touch(now);
        Arc::clone(visitor)
    }

    pub fn len(&self) -> usize {
        self.visitors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.lock().is_empty()
    }

    /// Forget visitors with no live subscriptions that have not been seen for
    /// `after`. Returns how many were removed.
    pub fn expunge(&self, now: DateTime<Utc>, after: Duration) -> usize {
        let mut visitors = self.visitors.lock();
        let before = visitors.len();
        visitors.retain(|_, visitor| !visitor.is_expired(now, after));
        before - visitors.len()
    }
}

/// The address admission limits are keyed on. Behind a trusted proxy this
/// is the first valid entry of the forwarded-for header, falling back to the
/// socket peer when the header is absent or unparseable.
pub fn visitor_address(remote: IpAddr, forwarded_for: Option<&str>, behind_proxy: bool) -> IpAddr {
    if !behind_proxy {
        return remote;
    }
    forwarded_for
        .and_then(|header| {
            header
                .split(',')
                .map(str::trim)
                .find_map(|entry| entry.parse::<IpAddr>().ok())
        })
        .unwrap_or(remote)
}

// Token bucket with lazy refill. No timers: tokens are recomputed from the
// elapsed wall-clock time whenever the bucket is consulted.
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    capacity: f64,
    replenish: Duration,
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl RateLimiter {
    /// A full bucket of `capacity` tokens gaining one token per `replenish`.
    pub fn new(capacity: u32, replenish: Duration, now: DateTime<Utc>) -> Self {
        Self {
            capacity: f64::from(capacity),
            replenish,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    /// Take one token if available.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available; zero when one is available now.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let tokens = self.tokens_at(now);
        if tokens >= 1.0 || self.capacity < 1.0 {
            return Duration::ZERO;
        }
        self.replenish.mul_f64(1.0 - tokens)
    }

    pub fn tokens(&self, now: DateTime<Utc>) -> f64 {
        self.tokens_at(now)
    }

    fn tokens_at(&self, now: DateTime<Utc>) -> f64 {
        if self.replenish.is_zero() {
            return self.capacity;
        }
        let elapsed = (now - self.last_refill).to_std().unwrap_or(Duration::ZERO);
        let gained = elapsed.as_secs_f64() / self.replenish.as_secs_f64();
        (self.tokens + gained).min(self.capacity)
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        self.tokens = self.tokens_at(now);
        // Never move backwards if the clock does.
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

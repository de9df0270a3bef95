// Pending delayed messages, ordered by release time then by arrival.
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use herald_common::Message;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Pending {
    release_at: DateTime<Utc>,
    seq: u64,
    message: Arc<Message>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release_at
            .cmp(&other.release_at)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
struct PendingQueue {
    heap: BinaryHeap<Reverse<Pending>>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct DelayedScheduler {
    pending: Mutex<PendingQueue>,
    min_delay: Duration,
    max_delay: Duration,
}

impl DelayedScheduler {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            pending: Mutex::new(PendingQueue::default()),
            min_delay,
            max_delay,
        }
    }

    /// Check that `release_at` lies within `[now + min_delay, now + max_delay]`.
    pub fn validate(&self, release_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let requested = release_at - now;
        let within = requested
            .to_std()
            .is_ok_and(|delay| delay >= self.min_delay && delay <= self.max_delay);
        if within {
            Ok(())
        } else {
            Err(BrokerError::InvalidDelay {
                requested_secs: requested.num_seconds(),
                min: self.min_delay,
                max: self.max_delay,
            })
        }
    }

    /// Hold `message` until its `time`, which is its release time.
    pub fn schedule(&self, message: Arc<Message>, now: DateTime<Utc>) -> Result<()> {
        self.validate(message.time, now)?;
        let mut pending = self.pending.lock();
        let seq = pending.next_seq;
        pending.next_seq += 1;
        pending.heap.push(Reverse(Pending {
            release_at: message.time,
            seq,
            message,
        }));
        Ok(())
    }

    /// Remove and return every message due at `now`, in release order.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Arc<Message>> {
        let mut pending = self.pending.lock();
        let mut due = Vec::new();
        while pending
            .heap
            .peek()
            .is_some_and(|Reverse(next)| next.release_at <= now)
        {
            if let Some(Reverse(entry)) = pending.heap.pop() {
                due.push(entry.message);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.pending.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().heap.is_empty()
    }

    pub fn next_release(&self) -> Option<DateTime<Utc>> {
        self.pending
            .lock()
            .heap
            .peek()
            .map(|Reverse(next)| next.release_at)
    }

    pub fn has_pending_for(&self, topic: &str) -> bool {
        self.pending
            .lock()
            .heap
            .iter()
            .any(|Reverse(entry)| entry.message.topic == topic)
    }
}

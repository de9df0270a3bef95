use crate::{MessageCache, Result};
use ahash::RandomState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use herald_common::{Message, Since};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

type TopicLog = Arc<RwLock<VecDeque<Arc<Message>>>>;

/// In-memory per-topic message log.
///
/// ```
/// use herald_common::{Message, MessageContent, Since, SystemClock, Clock};
/// use herald_storage::{MemoryCache, MessageCache};
///
/// let cache = MemoryCache::new(None);
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let msg = Message::new("alerts", MessageContent::text("hi"), SystemClock.now());
///     cache.store(&msg).await.expect("store");
///     let backlog = cache.since("alerts", Since::All).await.expect("since");
///     assert_eq!(backlog.len(), 1);
/// });
/// ```
#[derive(Debug)]
pub struct MemoryCache {
    // Outer map is only write-locked to add or drop a topic log. Each log has
    // its own lock so pruning one topic never stalls readers of another.
    topics: RwLock<HashMap<String, TopicLog, RandomState>>,
    retention: Option<Duration>,
}

impl MemoryCache {
    pub fn new(retention: Option<Duration>) -> Self {
        Self {
            topics: RwLock::new(HashMap::with_hasher(RandomState::new())),
            retention: retention.filter(|d| !d.is_zero()),
        }
    }

    pub(crate) fn insert(&self, message: Arc<Message>) {
        {
            let topics = self.topics.read();
            if let Some(log) = topics.get(message.topic.as_str()) {
                // Push while the outer read guard is held so prune cannot
                // detach this log in between.
                log.write().push_back(message);
                return;
            }
        }
        let mut topics = self.topics.write();
        topics
            .entry(message.topic.clone())
            .or_insert_with(|| Arc::new(RwLock::new(VecDeque::new())))
            .write()
            .push_back(message);
    }

    /// Every retained message, grouped by topic and in store order.
    pub fn snapshot(&self) -> Vec<Arc<Message>> {
        let logs: Vec<TopicLog> = self.topics.read().values().cloned().collect();
        logs.iter()
            .flat_map(|log| log.read().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub(crate) fn prune_before(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };

        let logs: Vec<(String, TopicLog)> = self
            .topics
            .read()
            .iter()
            .map(|(topic, log)| (topic.clone(), Arc::clone(log)))
            .collect();

        let mut removed = 0usize;
        let mut emptied = Vec::new();
        for (topic, log) in logs {
            let mut guard = log.write();
            let before = guard.len();
            guard.retain(|message| message.time > cutoff);
            removed += before - guard.len();
            if guard.is_empty() {
                emptied.push(topic);
            }
        }

        if !emptied.is_empty() {
            let mut topics = self.topics.write();
            for topic in emptied {
                // Recheck: a store may have landed after the per-topic pass.
                let still_empty = topics
                    .get(topic.as_str())
                    .is_some_and(|log| log.read().is_empty());
                if still_empty {
                    topics.remove(topic.as_str());
                }
            }
        }
        removed
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl MessageCache for MemoryCache {
    async fn store(&self, message: &Message) -> Result<()> {
        if message.is_message() {
            self.insert(Arc::new(message.clone()));
        }
        Ok(())
    }

    async fn since(&self, topic: &str, since: Since) -> Result<Vec<Arc<Message>>> {
        let Some(log) = self.topics.read().get(topic).cloned() else {
            return Ok(Vec::new());
        };
        let log = log.read();
        let backlog = match since {
            Since::All | Since::Ago(_) => log.iter().cloned().collect(),
            Since::Time(from) => log
                .iter()
                .filter(|message| message.time >= from)
                .cloned()
                .collect(),
            Since::Id(id) => match log.iter().position(|message| message.id == id) {
                Some(pos) => log.iter().skip(pos + 1).cloned().collect(),
                None => log.iter().cloned().collect(),
            },
        };
        Ok(backlog)
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.prune_before(now))
    }

    async fn count(&self, topic: &str) -> Result<usize> {
        Ok(self
            .topics
            .read()
            .get(topic)
            .map(|log| log.read().len())
            .unwrap_or(0))
    }

    async fn total(&self) -> Result<usize> {
        let logs: Vec<TopicLog> = self.topics.read().values().cloned().collect();
        Ok(logs.iter().map(|log| log.read().len()).sum())
    }

    async fn topics(&self) -> Result<Vec<String>> {
        Ok(self.topics.read().keys().cloned().collect())
    }

    fn retention(&self) -> Option<Duration> {
        self.retention
    }
}

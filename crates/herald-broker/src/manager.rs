// Periodic housekeeping and the background loops that drive it.
use crate::Broker;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub messages_published: u64,
    pub topics: usize,
    pub subscribers: usize,
    pub messages_cached: usize,
    pub delayed_pending: usize,
    pub visitors: usize,
}

/// Run one manager pass: prune the cache, drop idle topics and visitors,
/// then publish the resulting gauges.
pub async fn run_cycle(broker: &Broker) -> BrokerStats {
    let pruned = match broker.prune_cache().await {
        Ok(pruned) => pruned,
        Err(err) => {
            tracing::error!(error = %err, "cache prune failed");
            0
        }
    };
    let topics_removed = broker.remove_idle_topics().await;
    let visitors_removed = broker.expunge_visitors();
    let stats = broker.stats().await;

    metrics::gauge!("herald_topics").set(stats.topics as f64);
    metrics::gauge!("herald_subscribers").set(stats.subscribers as f64);
    metrics::gauge!("herald_messages_cached").set(stats.messages_cached as f64);
    metrics::gauge!("herald_delayed_pending").set(stats.delayed_pending as f64);
    metrics::gauge!("herald_visitors").set(stats.visitors as f64);
    tracing::info!(
        messages_published = stats.messages_published,
        messages_cached = stats.messages_cached,
        pruned,
        topics = stats.topics,
        topics_removed,
        subscribers = stats.subscribers,
        visitors = stats.visitors,
        visitors_removed,
        delayed_pending = stats.delayed_pending,
        "manager cycle"
    );
    stats
}

/// Handles to the manager, delayed-release and relay keepalive loops.
#[derive(Debug)]
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn start(broker: Arc<Broker>) -> Self {
        let cancel = CancellationToken::new();
        let manager_every = broker.config().manager_interval;
        let release_every = broker.config().at_sender_interval;
        let relay_every = broker.config().relay_keepalive_interval;
        let relay_keepalive = broker.push_relay().is_some() && !relay_every.is_zero();
        let mut handles = vec![
            spawn_loop(
                "manager",
                manager_every,
                cancel.clone(),
                Arc::clone(&broker),
                |broker| async move {
                    run_cycle(&broker).await;
                },
            ),
            spawn_loop(
                "delayed sender",
                release_every,
                cancel.clone(),
                Arc::clone(&broker),
                |broker| async move {
                    broker.release_due().await;
                },
            ),
        ];
        if relay_keepalive {
            handles.push(spawn_loop(
                "relay keepalive",
                relay_every,
                cancel.clone(),
                broker,
                |broker| async move {
                    broker.relay_keepalive().await;
                },
            ));
        }
        Self { cancel, handles }
    }

    /// Stop both loops and wait for any in-progress pass to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background task ended abnormally");
            }
        }
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    every: Duration,
    cancel: CancellationToken,
    broker: Arc<Broker>,
    pass: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Broker>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let every = every.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(task = name, every = ?every, "background task started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => pass(Arc::clone(&broker)).await,
            }
        }
        tracing::debug!(task = name, "background task stopped");
    })
}

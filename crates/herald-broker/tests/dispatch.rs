use anyhow::{Context, Result};
use async_trait::async_trait;
use herald_broker::{
    Broker, BrokerConfig, BrokerError, Delay, Mailer, OverflowPolicy, PublishRequest, PushRelay,
    RelayError,
};
use herald_common::{Clock, EventKind, ManualClock, Message, MessageContent, Since};
use herald_storage::{FileCache, MemoryCache, MessageCache};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
}

fn quiet(config: BrokerConfig) -> BrokerConfig {
    BrokerConfig {
        keepalive_interval: Duration::ZERO,
        ..config
    }
}

fn broker_with(config: BrokerConfig, cache: Arc<dyn MessageCache>) -> (Broker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_at(1_000));
    let broker = Broker::new(quiet(config), cache).with_clock(clock.clone());
    (broker, clock)
}

fn text(body: &str) -> PublishRequest {
    MessageContent::text(body).into()
}

#[tokio::test]
async fn request_bucket_allows_burst_then_one_per_interval() -> Result<()> {
    let config = BrokerConfig {
        visitor_request_limit_burst: 3,
        visitor_request_limit_replenish: Duration::from_secs(10),
        ..BrokerConfig::default()
    };
    let (broker, clock) = broker_with(config, Arc::new(MemoryCache::new(None)));
    let visitor = ip(1);

    for _ in 0..3 {
        broker.publish("alerts", visitor, text("ok")).await?;
    }
    let denied = broker
        .publish("alerts", visitor, text("denied"))
        .await
        .expect_err("fourth request denied");
    assert!(matches!(denied, BrokerError::RateLimitedRequest { .. }));
    assert_eq!(denied.http_status(), 429);
    assert_eq!(denied.retry_after(), Some(Duration::from_secs(10)));

    // Another visitor has its own bucket.
    broker.publish("alerts", ip(2), text("other")).await?;

    clock.advance(Duration::from_secs(10));
    broker.publish("alerts", visitor, text("refilled")).await?;
    assert!(broker.publish("alerts", visitor, text("again")).await.is_err());
    Ok(())
}

#[tokio::test]
async fn subscription_limit_spans_topics_and_frees_one_slot_per_unsubscribe() -> Result<()> {
    let config = BrokerConfig {
        visitor_subscription_limit: 3,
        ..BrokerConfig::default()
    };
    let (broker, _) = broker_with(config, Arc::new(MemoryCache::new(None)));
    let visitor = ip(1);

    let mut held = Vec::new();
    for topic in ["a", "b", "c"] {
        held.push(broker.subscribe(topic, visitor, None).await?);
    }
    let denied = broker
        .subscribe("d", visitor, None)
        .await
        .expect_err("fourth subscription denied");
    assert!(matches!(denied, BrokerError::TooManySubscriptions { limit: 3 }));

    held.pop().context("held subscription")?.unsubscribe();
    held.push(broker.subscribe("d", visitor, None).await?);
    assert!(broker.subscribe("e", visitor, None).await.is_err());
    assert_eq!(broker.visitor(visitor).active_subscriptions(), 3);
    Ok(())
}

#[tokio::test]
async fn topic_limit_is_global_and_idle_removal_frees_a_slot() -> Result<()> {
    let config = BrokerConfig {
        global_topic_limit: 2,
        topic_idle_grace: Duration::from_secs(30),
        ..BrokerConfig::default()
    };
    let (broker, clock) = broker_with(config, Arc::new(MemoryCache::new(None)));

    drop(broker.subscribe("first", ip(1), None).await?);
    drop(broker.subscribe("second", ip(2), None).await?);
    let denied = broker
        .subscribe("third", ip(3), None)
        .await
        .expect_err("topic limit reached");
    assert!(matches!(denied, BrokerError::TooManyTopics { limit: 2 }));
    // The failed attempt did not keep the visitor's slot.
    assert_eq!(broker.visitor(ip(3)).active_subscriptions(), 0);

    clock.advance(Duration::from_secs(30));
    assert_eq!(broker.remove_idle_topics().await, 2);
    broker.subscribe("third", ip(3), None).await?;
    assert_eq!(broker.topic_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn cached_messages_expire_after_the_retention_window() -> Result<()> {
    let cache = Arc::new(MemoryCache::new(Some(Duration::from_secs(60))));
    let (broker, clock) = broker_with(BrokerConfig::default(), cache);
    broker.publish("alerts", ip(1), text("kept")).await?;

    clock.advance(Duration::from_secs(59));
    broker.prune_cache().await?;
    assert_eq!(broker.poll("alerts", ip(1), Since::All).await?.len(), 1);

    clock.advance(Duration::from_secs(1));
    broker.prune_cache().await?;
    assert!(broker.poll("alerts", ip(1), Since::All).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn delayed_messages_are_released_once_at_their_time() -> Result<()> {
    let (broker, clock) = broker_with(BrokerConfig::default(), Arc::new(MemoryCache::new(None)));
    let mut early = broker.subscribe("alerts", ip(1), None).await?;

    let published = broker
        .publish(
            "alerts",
            ip(2),
            text("later").with_delay(Delay::After(Duration::from_secs(10))),
        )
        .await?;
    assert!(published.scheduled);
    assert_eq!(published.delivered, 0);
    assert_eq!(published.message.time.timestamp(), 1_010);

    clock.advance(Duration::from_secs(9));
    assert_eq!(broker.release_due().await, 0);
    assert!(early.try_recv().is_none());
    assert!(broker.poll("alerts", ip(3), Since::All).await?.is_empty());

    // Connected before release time, so it receives the live dispatch.
    let mut late = broker.subscribe("alerts", ip(4), None).await?;
    clock.advance(Duration::from_secs(1));
    assert_eq!(broker.release_due().await, 1);
    assert_eq!(broker.release_due().await, 0);

    for sub in [&mut early, &mut late] {
        let message = sub.try_recv().context("released message")?;
        assert_eq!(message.body(), "later");
        assert_eq!(message.id, published.message.id);
        assert!(sub.try_recv().is_none());
    }
    let cached = broker.poll("alerts", ip(3), Since::All).await?;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].time.timestamp(), 1_010);
    Ok(())
}

#[tokio::test]
async fn delay_bounds_are_enforced_end_to_end() -> Result<()> {
    let (broker, clock) = broker_with(BrokerConfig::default(), Arc::new(MemoryCache::new(None)));
    let max = broker.config().max_delay;
    let min = broker.config().min_delay;

    let rejected = broker
        .publish(
            "alerts",
            ip(1),
            text("too late").with_delay(Delay::After(max + Duration::from_secs(1))),
        )
        .await
        .expect_err("beyond max delay");
    assert!(matches!(rejected, BrokerError::InvalidDelay { .. }));
    assert_eq!(rejected.http_status(), 400);

    broker
        .publish("alerts", ip(1), text("on time").with_delay(Delay::After(min)))
        .await?;
    broker.release_due().await;
    assert!(broker.poll("alerts", ip(1), Since::All).await?.is_empty());

    clock.advance(min);
    broker.release_due().await;
    let visible = broker.poll("alerts", ip(1), Since::All).await?;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].body(), "on time");
    Ok(())
}

#[tokio::test]
async fn absolute_release_times_are_validated_like_relative_ones() -> Result<()> {
    let (broker, clock) = broker_with(BrokerConfig::default(), Arc::new(MemoryCache::new(None)));
    let now = clock.now();
    assert!(
        broker
            .publish("alerts", ip(1), text("past").with_delay(Delay::At(now)))
            .await
            .is_err()
    );
    let at = now + chrono::Duration::seconds(60);
    let published = broker
        .publish("alerts", ip(1), text("at").with_delay(Delay::At(at)))
        .await?;
    assert_eq!(published.message.time, at);
    Ok(())
}

#[tokio::test]
async fn stalled_subscriber_does_not_hold_back_others() -> Result<()> {
    for policy in [OverflowPolicy::DropOldest, OverflowPolicy::Disconnect] {
        let config = BrokerConfig {
            subscriber_queue_capacity: 4,
            overflow_policy: policy,
            ..BrokerConfig::default()
        };
        let (broker, _) = broker_with(config, Arc::new(MemoryCache::new(None)));
        let mut stalled = broker.subscribe("alerts", ip(1), None).await?;
        let mut live = broker.subscribe("alerts", ip(2), None).await?;

        for i in 0..20 {
            let published = broker
                .publish("alerts", ip(3), text(&format!("m{i}")))
                .await?;
            assert!(published.delivered >= 1);
            let received = live.try_recv().context("live subscriber message")?;
            assert_eq!(received.body(), format!("m{i}"));
        }

        let mut leftover = Vec::new();
        while let Some(message) = stalled.try_recv() {
            leftover.push(message.body().to_string());
        }
        match policy {
            OverflowPolicy::DropOldest => assert_eq!(leftover, vec!["m16", "m17", "m18", "m19"]),
            OverflowPolicy::Disconnect => {
                assert_eq!(leftover, vec!["m0", "m1", "m2", "m3"]);
                assert!(!stalled.is_active());
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn hello_reaches_live_and_backlog_subscribers() -> Result<()> {
    let (broker, _) = broker_with(BrokerConfig::default(), Arc::new(MemoryCache::new(None)));
    let mut before = broker.subscribe("alerts", ip(1), None).await?;

    broker.publish("alerts", ip(2), text("hello")).await?;

    assert_eq!(before.next_event().await.context("open")?.event, EventKind::Open);
    let live = before.try_recv().context("live message")?;
    assert_eq!(live.body(), "hello");
    assert!(before.try_recv().is_none());

    let since: Since = "0".parse()?;
    let mut after = broker.subscribe("alerts", ip(3), Some(since)).await?;
    assert_eq!(after.backlog_len(), 1);
    let replayed = after.recv().await.context("backlog message")?;
    assert_eq!(replayed.id, live.id);
    assert!(after.try_recv().is_none());
    Ok(())
}

#[tokio::test]
async fn backlog_by_id_and_relative_time() -> Result<()> {
    let (broker, clock) = broker_with(BrokerConfig::default(), Arc::new(MemoryCache::new(None)));
    let first = broker.publish("alerts", ip(1), text("first")).await?;
    clock.advance(Duration::from_secs(120));
    broker.publish("alerts", ip(1), text("second")).await?;

    let by_id = broker
        .poll("alerts", ip(1), Since::Id(first.message.id))
        .await?;
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].body(), "second");

    let recent = broker.poll("alerts", ip(1), "1m".parse()?).await?;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].body(), "second");
    Ok(())
}

#[tokio::test]
async fn aborting_the_consumer_task_releases_the_slot() -> Result<()> {
    let config = BrokerConfig {
        visitor_subscription_limit: 1,
        ..BrokerConfig::default()
    };
    let (broker, _) = broker_with(config, Arc::new(MemoryCache::new(None)));
    let broker = Arc::new(broker);
    let sub = broker.subscribe("alerts", ip(1), None).await?;

    let consumer = tokio::spawn(async move {
        let mut sub = sub;
        while sub.next_event().await.is_some() {}
    });
    tokio::task::yield_now().await;
    consumer.abort();
    let _ = consumer.await;

    assert_eq!(broker.visitor(ip(1)).active_subscriptions(), 0);
    assert_eq!(broker.stats().await.subscribers, 0);
    broker.subscribe("alerts", ip(1), None).await?;
    Ok(())
}

#[derive(Debug)]
struct ChannelRelay(mpsc::UnboundedSender<String>);

#[async_trait]
impl PushRelay for ChannelRelay {
    async fn forward(&self, topic: &str, message: &Message) -> Result<(), RelayError> {
        self.0
            .send(format!("{topic}:{}", message.body()))
            .map_err(|err| RelayError::Unavailable(err.to_string()))
    }
}

#[async_trait]
impl Mailer for ChannelRelay {
    async fn send(&self, _sender: IpAddr, to: &str, message: &Message) -> Result<(), RelayError> {
        self.0
            .send(format!("{to}:{}", message.body()))
            .map_err(|err| RelayError::Unavailable(err.to_string()))
    }
}

#[derive(Debug)]
struct FailingRelay;

#[async_trait]
impl PushRelay for FailingRelay {
    async fn forward(&self, _topic: &str, _message: &Message) -> Result<(), RelayError> {
        Err(RelayError::Rejected("upstream said no".into()))
    }
}

#[tokio::test]
async fn relay_and_mailer_receive_published_messages() -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (broker, _) = broker_with(BrokerConfig::default(), Arc::new(MemoryCache::new(None)));
    let collaborator = Arc::new(ChannelRelay(tx));
    let broker = broker
        .with_push_relay(collaborator.clone())
        .with_mailer(collaborator);

    broker
        .publish("alerts", ip(1), text("ping").with_email("ops@example.com"))
        .await?;
    let mut seen = vec![
        rx.recv().await.context("first")?,
        rx.recv().await.context("second")?,
    ];
    seen.sort();
    assert_eq!(seen, vec!["alerts:ping", "ops@example.com:ping"]);
    Ok(())
}

#[tokio::test]
async fn relay_failures_do_not_fail_the_publish() -> Result<()> {
    let (broker, _) = broker_with(BrokerConfig::default(), Arc::new(MemoryCache::new(None)));
    let broker = broker.with_push_relay(Arc::new(FailingRelay));
    let published = broker.publish("alerts", ip(1), text("still local")).await?;
    assert!(!published.scheduled);
    assert_eq!(broker.poll("alerts", ip(1), Since::All).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn email_limit_applies_to_outbound_and_inbound_mail() -> Result<()> {
    let config = BrokerConfig {
        visitor_email_limit_burst: 1,
        ..BrokerConfig::default()
    };
    let (broker, _) = broker_with(config, Arc::new(MemoryCache::new(None)));
    broker
        .publish("alerts", ip(1), text("mail").with_email("ops@example.com"))
        .await?;
    let denied = broker
        .publish("alerts", ip(1), text("mail").with_email("ops@example.com"))
        .await
        .expect_err("email bucket empty");
    assert!(matches!(denied, BrokerError::RateLimitedEmail { .. }));
    assert!(matches!(
        broker
            .publish_email("alerts", ip(1), MessageContent::text("inbound"))
            .await,
        Err(BrokerError::RateLimitedEmail { .. })
    ));

    broker
        .publish_email("alerts", ip(2), MessageContent::text("inbound"))
        .await?;
    Ok(())
}

#[tokio::test]
async fn file_cache_backlog_survives_a_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.jsonl");
    let published = {
        let cache = Arc::new(FileCache::open(&path, None).await?);
        let (broker, _) = broker_with(BrokerConfig::default(), cache);
        broker.publish("alerts", ip(1), text("durable")).await?
    };

    let cache = Arc::new(FileCache::open(&path, None).await?);
    let (broker, _) = broker_with(BrokerConfig::default(), cache);
    let mut sub = broker.subscribe("alerts", ip(1), Some(Since::All)).await?;
    let replayed = sub.recv().await.context("replayed")?;
    assert_eq!(replayed.id, published.message.id);
    assert_eq!(replayed.body(), "durable");
    Ok(())
}

#[tokio::test]
async fn overflow_disconnect_returns_the_subscription_slot() -> Result<()> {
    let config = BrokerConfig {
        subscriber_queue_capacity: 1,
        overflow_policy: OverflowPolicy::Disconnect,
        visitor_subscription_limit: 1,
        ..BrokerConfig::default()
    };
    let (broker, _) = broker_with(config, Arc::new(MemoryCache::new(None)));
    // Never read from: this is the stalled client.
    let stalled = broker.subscribe("alerts", ip(1), None).await?;

    broker.publish("alerts", ip(2), text("fills the queue")).await?;
    broker.publish("alerts", ip(2), text("overflows")).await?;

    let stats = broker.stats().await;
    assert_eq!(stats.subscribers, 0);
    assert_eq!(broker.visitor(ip(1)).active_subscriptions(), stats.subscribers);
    assert!(!stalled.is_active());

    let mut fresh = broker.subscribe("alerts", ip(1), None).await?;
    broker.publish("alerts", ip(2), text("reaches the new one")).await?;
    assert_eq!(fresh.recv().await.context("live")?.body(), "reaches the new one");

    drop(stalled);
    assert_eq!(broker.visitor(ip(1)).active_subscriptions(), 1);
    Ok(())
}

fn busy(config: BrokerConfig) -> BrokerConfig {
    BrokerConfig {
        visitor_request_limit_burst: 10_000,
        visitor_subscription_limit: 1_000,
        ..config
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_racing_idle_sweep_keeps_a_live_topic() -> Result<()> {
    let (broker, clock) = broker_with(busy(BrokerConfig::default()), Arc::new(MemoryCache::new(None)));
    let broker = Arc::new(broker);

    for round in 0..100 {
        let topic = format!("race{round}");
        drop(broker.subscribe(&topic, ip(1), None).await?);
        clock.advance(Duration::from_secs(60));

        let sweeper = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.remove_idle_topics().await })
        };
        let subscriber = {
            let broker = Arc::clone(&broker);
            let topic = topic.clone();
            tokio::spawn(async move { broker.subscribe(&topic, ip(2), None).await })
        };
        let mut sub = subscriber.await??;
        sweeper.await?;

        let published = broker.publish(&topic, ip(3), text("after sweep")).await?;
        assert_eq!(published.delivered, 1, "round {round}");
        assert_eq!(sub.recv().await.context("delivered")?.body(), "after sweep");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_racing_idle_sweep_keeps_the_cached_message() -> Result<()> {
    for round in 0..100 {
        let (broker, clock) =
            broker_with(busy(BrokerConfig::default()), Arc::new(MemoryCache::new(None)));
        let broker = Arc::new(broker);
        drop(broker.subscribe("alerts", ip(1), None).await?);
        clock.advance(Duration::from_secs(60));

        let sweeper = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.remove_idle_topics().await })
        };
        let publisher = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.publish("alerts", ip(2), text("kept")).await })
        };
        publisher.await??;
        sweeper.await?;

        assert_eq!(broker.topic_count().await, 1, "round {round}");
        assert_eq!(broker.remove_idle_topics().await, 0);
        let mut sub = broker.subscribe("alerts", ip(3), Some(Since::All)).await?;
        assert_eq!(sub.recv().await.context("backlog")?.body(), "kept");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_subscribers_during_manager_cycles_frees_every_slot() -> Result<()> {
    let (broker, _) = broker_with(busy(BrokerConfig::default()), Arc::new(MemoryCache::new(None)));
    let broker = Arc::new(broker);
    let visitors: Vec<IpAddr> = (1..=8).map(ip).collect();

    let mut subs = Vec::new();
    for (i, visitor) in visitors.iter().enumerate() {
        for n in 0..16 {
            subs.push(broker.subscribe(&format!("t{}", (i + n) % 5), *visitor, None).await?);
        }
    }
    assert_eq!(broker.stats().await.subscribers, 128);

    let manager = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            for _ in 0..50 {
                herald_broker::manager::run_cycle(&broker).await;
                tokio::task::yield_now().await;
            }
        })
    };
    let droppers: Vec<_> = subs
        .into_iter()
        .map(|sub| {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                drop(sub);
            })
        })
        .collect();
    for dropper in droppers {
        dropper.await?;
    }
    manager.await?;

    assert_eq!(broker.stats().await.subscribers, 0);
    for visitor in visitors {
        assert_eq!(broker.visitor(visitor).active_subscriptions(), 0);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backlog_subscribe_racing_publishes_has_no_gaps_or_duplicates() -> Result<()> {
    const COUNT: usize = 300;
    for _ in 0..10 {
        let (broker, _) =
            broker_with(busy(BrokerConfig::default()), Arc::new(MemoryCache::new(None)));
        let broker = Arc::new(broker);

        let publisher = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                for i in 0..COUNT {
                    broker.publish("alerts", ip(1), text(&format!("m{i}"))).await?;
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                Ok::<_, BrokerError>(())
            })
        };
        tokio::task::yield_now().await;
        let mut sub = broker.subscribe("alerts", ip(2), Some(Since::All)).await?;
        publisher.await??;

        let mut received = Vec::with_capacity(COUNT);
        while let Some(message) = sub.try_recv() {
            received.push(message.body().to_string());
        }
        let expected: Vec<String> = (0..COUNT).map(|i| format!("m{i}")).collect();
        assert_eq!(received, expected);
    }
    Ok(())
}

use anyhow::{Context, Result, bail};
use herald_broker::config::DEFAULT_CACHE_DURATION;
use herald_broker::{BrokerConfig, OverflowPolicy};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const MIN_MANAGER_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";

// Service configuration sourced from environment variables, optionally
// overridden by the YAML file named in HERALD_CONFIG.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Metrics/health HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Externally visible base URL, used in outbound e-mail links.
    pub base_url: Option<String>,
    // File-backed message cache; in-memory when unset.
    pub cache_file: Option<PathBuf>,
    // Zero keeps messages forever.
    pub cache_duration: Duration,
    pub smtp_sender_addr: Option<String>,
    pub smtp_sender_user: Option<String>,
    pub smtp_sender_pass: Option<String>,
    pub smtp_sender_from: Option<String>,
    pub smtp_server_listen: Option<String>,
    pub smtp_server_domain: Option<String>,
    // Falls back to the keepalive interval when unset.
    pub topic_idle_grace: Option<Duration>,
    pub broker: BrokerConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerConfigOverride {
    metrics_bind: Option<String>,
    base_url: Option<String>,
    cache_file: Option<PathBuf>,
    cache_duration_secs: Option<u64>,
    keepalive_interval_secs: Option<u64>,
    manager_interval_secs: Option<u64>,
    at_sender_interval_secs: Option<u64>,
    min_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
    message_limit: Option<usize>,
    global_topic_limit: Option<usize>,
    visitor_subscription_limit: Option<usize>,
    visitor_request_limit_burst: Option<u32>,
    visitor_request_limit_replenish_secs: Option<u64>,
    visitor_email_limit_burst: Option<u32>,
    visitor_email_limit_replenish_secs: Option<u64>,
    visitor_expunge_after_secs: Option<u64>,
    relay_keepalive_interval_secs: Option<u64>,
    topic_idle_grace_secs: Option<u64>,
    subscriber_queue_capacity: Option<usize>,
    overflow_policy: Option<OverflowPolicy>,
    behind_proxy: Option<bool>,
    smtp_sender_addr: Option<String>,
    smtp_sender_user: Option<String>,
    smtp_sender_pass: Option<String>,
    smtp_sender_from: Option<String>,
    smtp_server_listen: Option<String>,
    smtp_server_domain: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = BrokerConfig::default();
        let metrics_bind = std::env::var("HERALD_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse HERALD_METRICS_BIND")?;
        let overflow_policy = match env_string("HERALD_SUB_QUEUE_POLICY") {
            Some(value) => parse_overflow_policy(&value)
                .with_context(|| "parse HERALD_SUB_QUEUE_POLICY")?,
            None => defaults.overflow_policy,
        };
        let broker = BrokerConfig {
            keepalive_interval: env_secs("HERALD_KEEPALIVE_INTERVAL_SECS")
                .unwrap_or(defaults.keepalive_interval),
            manager_interval: env_secs("HERALD_MANAGER_INTERVAL_SECS")
                .unwrap_or(defaults.manager_interval),
            at_sender_interval: env_secs("HERALD_AT_SENDER_INTERVAL_SECS")
                .unwrap_or(defaults.at_sender_interval),
            min_delay: env_secs("HERALD_MIN_DELAY_SECS").unwrap_or(defaults.min_delay),
            max_delay: env_secs("HERALD_MAX_DELAY_SECS").unwrap_or(defaults.max_delay),
            message_limit: env_positive("HERALD_MESSAGE_LIMIT").unwrap_or(defaults.message_limit),
            global_topic_limit: env_positive("HERALD_GLOBAL_TOPIC_LIMIT")
                .unwrap_or(defaults.global_topic_limit),
            visitor_subscription_limit: env_positive("HERALD_VISITOR_SUBSCRIPTION_LIMIT")
                .unwrap_or(defaults.visitor_subscription_limit),
            visitor_request_limit_burst: env_positive("HERALD_VISITOR_REQUEST_LIMIT_BURST")
                .unwrap_or(defaults.visitor_request_limit_burst),
            visitor_request_limit_replenish: env_secs("HERALD_VISITOR_REQUEST_LIMIT_REPLENISH_SECS")
                .unwrap_or(defaults.visitor_request_limit_replenish),
            visitor_email_limit_burst: env_positive("HERALD_VISITOR_EMAIL_LIMIT_BURST")
                .unwrap_or(defaults.visitor_email_limit_burst),
            visitor_email_limit_replenish: env_secs("HERALD_VISITOR_EMAIL_LIMIT_REPLENISH_SECS")
                .unwrap_or(defaults.visitor_email_limit_replenish),
            visitor_expunge_after: env_secs("HERALD_VISITOR_EXPUNGE_AFTER_SECS")
                .unwrap_or(defaults.visitor_expunge_after),
            topic_idle_grace: defaults.topic_idle_grace,
            relay_keepalive_interval: env_secs("HERALD_RELAY_KEEPALIVE_INTERVAL_SECS")
                .unwrap_or(defaults.relay_keepalive_interval),
            subscriber_queue_capacity: env_positive("HERALD_SUB_QUEUE_CAPACITY")
                .unwrap_or(defaults.subscriber_queue_capacity),
            overflow_policy,
            behind_proxy: env_bool("HERALD_BEHIND_PROXY").unwrap_or(defaults.behind_proxy),
        };
        Ok(Self {
            metrics_bind,
            base_url: env_string("HERALD_BASE_URL"),
            cache_file: env_string("HERALD_CACHE_FILE").map(PathBuf::from),
            cache_duration: env_secs("HERALD_CACHE_DURATION_SECS").unwrap_or(DEFAULT_CACHE_DURATION),
            smtp_sender_addr: env_string("HERALD_SMTP_SENDER_ADDR"),
            smtp_sender_user: env_string("HERALD_SMTP_SENDER_USER"),
            smtp_sender_pass: env_string("HERALD_SMTP_SENDER_PASS"),
            smtp_sender_from: env_string("HERALD_SMTP_SENDER_FROM"),
            smtp_server_listen: env_string("HERALD_SMTP_SERVER_LISTEN"),
            smtp_server_domain: env_string("HERALD_SMTP_SERVER_DOMAIN"),
            topic_idle_grace: env_secs("HERALD_TOPIC_IDLE_GRACE_SECS"),
            broker,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("HERALD_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read HERALD_CONFIG: {path}"))?;
            let override_cfg: ServerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse herald config yaml")?;
            config.apply(override_cfg)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Core settings with derived defaults filled in.
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            topic_idle_grace: self
                .topic_idle_grace
                .unwrap_or(self.broker.keepalive_interval),
            ..self.broker.clone()
        }
    }

    /// Cache retention; `None` keeps messages indefinitely.
    pub fn cache_retention(&self) -> Option<Duration> {
        (!self.cache_duration.is_zero()).then_some(self.cache_duration)
    }

    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        if broker.keepalive_interval < MIN_KEEPALIVE_INTERVAL {
            bail!("keepalive interval cannot be lower than five seconds");
        }
        if broker.manager_interval < MIN_MANAGER_INTERVAL {
            bail!("manager interval cannot be lower than five seconds");
        }
        if !self.cache_duration.is_zero() && self.cache_duration < broker.manager_interval {
            bail!("cache duration cannot be lower than manager interval");
        }
        if broker.at_sender_interval.is_zero() {
            bail!("delayed sender interval must be positive");
        }
        if broker.min_delay > broker.max_delay {
            bail!("min delay cannot be greater than max delay");
        }
        if self.smtp_sender_addr.is_some()
            && (self.base_url.is_none()
                || self.smtp_sender_user.is_none()
                || self.smtp_sender_pass.is_none()
                || self.smtp_sender_from.is_none())
        {
            bail!(
                "if smtp sender address is set, base url, smtp sender user, pass and from must also be set"
            );
        }
        if self.smtp_server_listen.is_some() && self.smtp_server_domain.is_none() {
            bail!("if smtp server listen is set, smtp server domain must also be set");
        }
        Ok(())
    }

    fn apply(&mut self, o: ServerConfigOverride) -> Result<()> {
        if let Some(value) = o.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if o.base_url.is_some() {
            self.base_url = o.base_url;
        }
        if o.cache_file.is_some() {
            self.cache_file = o.cache_file;
        }
        if let Some(value) = o.cache_duration_secs {
            self.cache_duration = Duration::from_secs(value);
        }
        if let Some(value) = o.topic_idle_grace_secs {
            self.topic_idle_grace = Some(Duration::from_secs(value));
        }
        for (target, value) in [
            (&mut self.smtp_sender_addr, o.smtp_sender_addr),
            (&mut self.smtp_sender_user, o.smtp_sender_user),
            (&mut self.smtp_sender_pass, o.smtp_sender_pass),
            (&mut self.smtp_sender_from, o.smtp_sender_from),
            (&mut self.smtp_server_listen, o.smtp_server_listen),
            (&mut self.smtp_server_domain, o.smtp_server_domain),
        ] {
            if value.is_some() {
                *target = value;
            }
        }

        let broker = &mut self.broker;
        for (target, value) in [
            (&mut broker.keepalive_interval, o.keepalive_interval_secs),
            (&mut broker.manager_interval, o.manager_interval_secs),
            (&mut broker.at_sender_interval, o.at_sender_interval_secs),
            (&mut broker.min_delay, o.min_delay_secs),
            (&mut broker.max_delay, o.max_delay_secs),
            (&mut broker.visitor_request_limit_replenish, o.visitor_request_limit_replenish_secs),
            (&mut broker.visitor_email_limit_replenish, o.visitor_email_limit_replenish_secs),
            (&mut broker.visitor_expunge_after, o.visitor_expunge_after_secs),
            (&mut broker.relay_keepalive_interval, o.relay_keepalive_interval_secs),
        ] {
            if let Some(secs) = value {
                *target = Duration::from_secs(secs);
            }
        }
        for (target, value) in [
            (&mut broker.message_limit, o.message_limit),
            (&mut broker.global_topic_limit, o.global_topic_limit),
            (&mut broker.visitor_subscription_limit, o.visitor_subscription_limit),
            (&mut broker.subscriber_queue_capacity, o.subscriber_queue_capacity),
        ] {
            if let Some(value) = value
                && value > 0
            {
                *target = value;
            }
        }
        if let Some(value) = o.visitor_request_limit_burst
            && value > 0
        {
            broker.visitor_request_limit_burst = value;
        }
        if let Some(value) = o.visitor_email_limit_burst
            && value > 0
        {
            broker.visitor_email_limit_burst = value;
        }
        if let Some(value) = o.overflow_policy {
            broker.overflow_policy = value;
        }
        if let Some(value) = o.behind_proxy {
            broker.behind_proxy = value;
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn env_positive<T>(key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

fn parse_overflow_policy(value: &str) -> Result<OverflowPolicy> {
    match value {
        "drop_oldest" => Ok(OverflowPolicy::DropOldest),
        "disconnect" => Ok(OverflowPolicy::Disconnect),
        other => bail!("unknown overflow policy: {other}"),
    }
}

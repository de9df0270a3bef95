// Service wiring: config, cache backend, broker, background drivers and the
// metrics listener, torn down in reverse order on shutdown.
use crate::config::ServerConfig;
use crate::observability;
use anyhow::{Context, Result};
use herald_broker::{BackgroundTasks, Broker};
use herald_storage::{FileCache, MemoryCache, MessageCache};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SERVICE_NAME: &str = "herald-server";

/// Pick the cache backend: file-backed when `cache_file` is set, else memory.
pub async fn build_cache(config: &ServerConfig) -> Result<Arc<dyn MessageCache>> {
    let retention = config.cache_retention();
    match &config.cache_file {
        Some(path) => {
            let cache = FileCache::open(path.clone(), retention)
                .await
                .with_context(|| format!("open message cache {}", path.display()))?;
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(MemoryCache::new(retention))),
    }
}

/// Run the server until `shutdown` resolves.
pub async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability(SERVICE_NAME)?;
    let config = ServerConfig::from_env_or_yaml()?;

    let cache = build_cache(&config).await?;
    if config.cache_retention().is_none() {
        tracing::warn!("cache duration is zero; cached messages are never pruned");
    }
    if config.smtp_sender_addr.is_some() || config.smtp_server_listen.is_some() {
        tracing::info!("smtp settings validated; no mail transport is wired in this build");
    }
    let broker = Arc::new(Broker::new(config.broker_config(), cache));
    let tasks = BackgroundTasks::start(Arc::clone(&broker));
    tracing::info!(
        keepalive = ?config.broker.keepalive_interval,
        manager = ?config.broker.manager_interval,
        "broker started"
    );

    let listener = TcpListener::bind(config.metrics_bind)
        .await
        .with_context(|| format!("bind metrics listener {}", config.metrics_bind))?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    let http_shutdown = CancellationToken::new();
    let http_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        Arc::clone(&broker),
        listener,
        http_shutdown.clone(),
    ));

    shutdown.await;
    tracing::info!("shutdown requested");

    broker.shutdown();
    tasks.shutdown().await;
    http_shutdown.cancel();
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "metrics listener exited with error"),
        Err(err) => tracing::warn!(error = %err, "metrics listener task failed"),
    }

    let stats = broker.stats().await;
    tracing::info!(
        messages_published = stats.messages_published,
        messages_cached = stats.messages_cached,
        delayed_pending = stats.delayed_pending,
        "broker stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use herald_common::{Clock, Message, MessageContent, SystemClock};
    use serial_test::serial;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn run_with_shutdown_in_memory() -> Result<()> {
        let _g1 = EnvGuard::set("HERALD_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::unset("HERALD_CACHE_FILE");
        let _g3 = EnvGuard::unset("HERALD_CONFIG");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn run_with_shutdown_file_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.jsonl");
        let path_str = path.to_string_lossy().into_owned();
        let _g1 = EnvGuard::set("HERALD_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("HERALD_CACHE_FILE", &path_str);
        let _g3 = EnvGuard::unset("HERALD_CONFIG");
        run_with_shutdown(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        })
        .await?;
        assert!(path.exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn run_with_shutdown_rejects_invalid_config() {
        let _g1 = EnvGuard::set("HERALD_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("HERALD_KEEPALIVE_INTERVAL_SECS", "1");
        let _g3 = EnvGuard::unset("HERALD_CONFIG");
        let err = run_with_shutdown(async {}).await.expect_err("keepalive below minimum");
        assert!(format!("{err:#}").contains("keepalive"));
    }

    #[tokio::test]
    #[serial]
    async fn build_cache_reloads_file_backend() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.jsonl");
        let _g1 = EnvGuard::set("HERALD_CACHE_FILE", &path.to_string_lossy());
        let _g2 = EnvGuard::unset("HERALD_CACHE_DURATION_SECS");
        let config = ServerConfig::from_env()?;

        let cache = build_cache(&config).await?;
        let message = Message::new("alerts", MessageContent::text("persisted"), SystemClock.now());
        cache.store(&message).await?;
        drop(cache);

        let reopened = build_cache(&config).await?;
        assert_eq!(reopened.count("alerts").await?, 1);
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn build_cache_defaults_to_memory() -> Result<()> {
        let _g1 = EnvGuard::unset("HERALD_CACHE_FILE");
        let config = ServerConfig::from_env()?;
        let cache = build_cache(&config).await?;
        assert_eq!(cache.total().await?, 0);
        Ok(())
    }
}

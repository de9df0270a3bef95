//! Tracing, metrics and the health/metrics HTTP endpoint for the server.
//!
//! Tracing goes to a fmt layer filtered by `RUST_LOG` (default `info`), plus an
//! OTLP exporter when one can be built. OTLP setup is best-effort: on failure
//! the server logs locally only. Metrics are recorded through the `metrics`
//! facade and rendered by a Prometheus recorder.

use anyhow::{Context, Result};
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use herald_broker::Broker;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace as sdktrace;
use std::sync::Arc;
#[cfg(test)]
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global tracing subscriber and Prometheus recorder.
///
/// Returns the handle the `/metrics` route renders from.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    let provider = build_tracer_provider(service_name);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Some(provider) = provider {
        let tracer = provider.tracer(service_name.to_string());
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        init_subscriber(registry.with(otel_layer));
    } else {
        init_subscriber(registry);
    }

    install_metrics_recorder()
}

fn build_tracer_provider(service_name: &str) -> Option<opentelemetry_sdk::trace::TracerProvider> {
    let resource = Resource::new(resource_attributes(service_name));
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .ok()
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    if let Ok(value) =
        std::env::var("HERALD_SERVICE_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"))
    {
        attrs.push(KeyValue::new("service.instance.id", value));
    }
    for (env, key) in [
        ("K8S_NAMESPACE_NAME", "k8s.namespace.name"),
        ("K8S_POD_NAME", "k8s.pod.name"),
        ("DEPLOYMENT_ENVIRONMENT", "deployment.environment"),
    ] {
        if let Ok(value) = std::env::var(env) {
            attrs.push(KeyValue::new(key, value));
        }
    }
    attrs
}

/// Build the metrics and health router.
///
/// - `/metrics`: Prometheus text exposition.
/// - `/live`: always "ok" while the process serves requests.
/// - `/ready`: "ok" until the broker starts shutting down, then 503.
/// - `/stats`: broker counters as JSON.
pub fn router(handle: PrometheusHandle, broker: Arc<Broker>) -> axum::Router {
    let ready = Arc::clone(&broker);
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route(
            "/ready",
            axum::routing::get(move || async move {
                if ready.is_closed() {
                    (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
                } else {
                    "ok".into_response()
                }
            }),
        )
        .route(
            "/stats",
            axum::routing::get(move || async move { Json(broker.stats().await) }),
        )
}

/// Serve [`router`] on `listener` until `shutdown` is cancelled.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    broker: Arc<Broker>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(handle, broker);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    // A subscriber installed earlier (tests, embedding) wins.
    let _ = subscriber.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EnvGuard, build_test_client, wait_for_listen};
    use herald_broker::BrokerConfig;
    use herald_common::MessageContent;
    use herald_storage::MemoryCache;
    use serial_test::serial;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    #[serial]
    fn resource_attributes_include_optional_env() {
        let _g1 = EnvGuard::set("HERALD_SERVICE_INSTANCE_ID", "i-1");
        let _g2 = EnvGuard::set("K8S_NAMESPACE_NAME", "notify");
        let _g3 = EnvGuard::set("K8S_POD_NAME", "herald-0");
        let _g4 = EnvGuard::set("DEPLOYMENT_ENVIRONMENT", "prod");

        let attrs = resource_attributes("svc");
        for key in [
            "service.name",
            "service.instance.id",
            "k8s.namespace.name",
            "k8s.pod.name",
            "deployment.environment",
        ] {
            assert!(attrs.iter().any(|kv| kv.key.as_str() == key), "missing {key}");
        }
    }

    #[test]
    #[serial]
    fn resource_attributes_minimal_when_env_missing() {
        let _g1 = EnvGuard::unset("HERALD_SERVICE_INSTANCE_ID");
        let _g2 = EnvGuard::unset("HOSTNAME");
        let _g3 = EnvGuard::unset("K8S_NAMESPACE_NAME");
        let _g4 = EnvGuard::unset("K8S_POD_NAME");
        let _g5 = EnvGuard::unset("DEPLOYMENT_ENVIRONMENT");

        let attrs = resource_attributes("svc");
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].key.as_str(), "service.name");
    }

    #[test]
    #[serial]
    fn resource_attributes_use_hostname_fallback() {
        let _g1 = EnvGuard::unset("HERALD_SERVICE_INSTANCE_ID");
        let _g2 = EnvGuard::set("HOSTNAME", "test-host");

        let attrs = resource_attributes("svc");
        assert!(attrs.iter().any(|kv| kv.key.as_str() == "service.instance.id"
            && kv.value.as_str() == "test-host"));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn endpoints_respond_and_ready_flips_on_shutdown() -> Result<()> {
        let handle = init_observability("herald-test")?;
        let broker = Arc::new(Broker::new(
            BrokerConfig::default(),
            Arc::new(MemoryCache::new(None)),
        ));
        broker
            .publish(
                "alerts",
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                MessageContent::text("hi").into(),
            )
            .await?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_metrics(
            handle,
            Arc::clone(&broker),
            listener,
            shutdown.clone(),
        ));
        wait_for_listen(addr).await?;
        let client = build_test_client()?;

        let metrics = client.get(format!("http://{addr}/metrics")).send().await?;
        assert_eq!(metrics.status(), 200);
        let live = client.get(format!("http://{addr}/live")).send().await?;
        assert_eq!(live.text().await?, "ok");
        let ready = client.get(format!("http://{addr}/ready")).send().await?;
        assert_eq!(ready.status(), 200);

        let stats = client.get(format!("http://{addr}/stats")).send().await?;
        let stats: serde_json::Value = serde_json::from_str(&stats.text().await?)?;
        assert_eq!(stats["messages_published"], 1);
        assert_eq!(stats["topics"], 1);

        broker.shutdown();
        let ready = client.get(format!("http://{addr}/ready")).send().await?;
        assert_eq!(ready.status(), 503);

        shutdown.cancel();
        server.await??;
        Ok(())
    }

    #[test]
    #[serial]
    fn metrics_recorder_is_cached_in_tests() -> Result<()> {
        let first = install_metrics_recorder()?;
        let second = install_metrics_recorder()?;
        metrics::counter!("herald_test_total").increment(1);
        assert_eq!(first.render(), second.render());
        Ok(())
    }
}

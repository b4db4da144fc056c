//! Tracing and metrics setup for the broker service.
//!
//! Logs go through a `tracing-subscriber` fmt layer filtered by `RUST_LOG`
//! (default `info`). Metrics recorded through the `metrics` facade by the relay,
//! the response sender, and the client crate are exported by a Prometheus
//! recorder and served over HTTP next to `/live` and `/ready` probes.
//! In tests the recorder is installed once and its handle reused.

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)]
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Flipped once the broker has provisioned its queues and started relaying.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct MetricsState {
    handle: PrometheusHandle,
    readiness: Readiness,
}

/// Installs the global subscriber and the Prometheus recorder.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    init_subscriber(registry);
    let handle = install_metrics_recorder()?;
    tracing::debug!(service = service_name, "observability initialized");
    Ok(handle)
}

/// Routes for `/metrics`, `/live`, and `/ready`.
///
/// `/ready` answers 503 until `readiness` is set.
pub fn router(handle: PrometheusHandle, readiness: Readiness) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .with_state(MetricsState { handle, readiness })
}

async fn render_metrics(State(state): State<MetricsState>) -> String {
    state.handle.render()
}

async fn ready(State(state): State<MetricsState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

pub async fn serve_metrics(
    handle: PrometheusHandle,
    readiness: Readiness,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, router(handle, readiness).into_make_service()).await
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
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn get_raw(addr: SocketAddr, path: &str) -> Result<String> {
        let mut stream = TcpStream::connect(addr).await?;
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    }

    async fn spawn_server(readiness: Readiness) -> Result<SocketAddr> {
        let handle = init_observability("test-broker")?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(handle, readiness).into_make_service()).await;
        });
        Ok(addr)
    }

    #[test]
    #[serial]
    fn recorder_is_installed_once_in_tests() -> Result<()> {
        let first = install_metrics_recorder()?;
        let second = install_metrics_recorder()?;
        metrics::counter!("ferry_test_recorder_total").increment(1);
        assert!(first.render().contains("ferry_test_recorder_total"));
        assert!(second.render().contains("ferry_test_recorder_total"));
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn live_and_metrics_endpoints_respond() -> Result<()> {
        let addr = spawn_server(Readiness::default()).await?;
        metrics::counter!("ferry_test_scrape_total").increment(3);

        let live = get_raw(addr, "/live").await?;
        assert!(live.starts_with("HTTP/1.1 200"));
        assert!(live.ends_with("ok"));

        let scrape = get_raw(addr, "/metrics").await?;
        assert!(scrape.starts_with("HTTP/1.1 200"));
        assert!(scrape.contains("ferry_test_scrape_total 3"));
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn ready_reflects_broker_state() -> Result<()> {
        let readiness = Readiness::default();
        let addr = spawn_server(readiness.clone()).await?;

        let starting = get_raw(addr, "/ready").await?;
        assert!(starting.starts_with("HTTP/1.1 503"));

        readiness.set_ready(true);
        let ready = get_raw(addr, "/ready").await?;
        assert!(ready.starts_with("HTTP/1.1 200"));
        assert!(ready.ends_with("ok"));
        Ok(())
    }
}

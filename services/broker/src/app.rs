// Broker process wiring: metrics listener, relay, and the echo application.
use anyhow::{Context, Result};
use ferry_broker::{Broker, CloseReport};
use ferry_storage::DurableStore;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::observability::{Readiness, serve_metrics};

/// Answers every relayed request with a response carrying the same body,
/// routed to the default destination. Returns once the relay closes.
pub async fn echo_requests(broker: Arc<Broker>) -> u64 {
    let mut handled = 0;
    while let Some(request) = broker.receive_request().await {
        let response = request.reply(request.body.clone());
        match broker.send_response(&response, None) {
            Ok(()) => {
                handled += 1;
                metrics::counter!("ferry_service_requests_total").increment(1);
            }
            Err(err) => warn!(
                error = %err,
                client_id = %request.client_id,
                message_id = %request.message_id,
                "response rejected"
            ),
        }
    }
    debug!(handled, "request loop ended");
    handled
}

/// A running broker process.
pub struct App {
    broker: Arc<Broker>,
    readiness: Readiness,
    echo: JoinHandle<u64>,
    metrics: JoinHandle<()>,
}

impl App {
    pub async fn start(
        config: &ServiceConfig,
        store: Arc<dyn DurableStore>,
        metrics_handle: PrometheusHandle,
    ) -> Result<Self> {
        let readiness = Readiness::default();
        let metrics = {
            let readiness = readiness.clone();
            let addr = config.metrics_bind;
            tokio::spawn(async move {
                if let Err(err) = serve_metrics(metrics_handle, readiness, addr).await {
                    warn!(error = %err, "metrics listener exited");
                }
            })
        };

        let broker = match Broker::open(config.session_id, config.settings.clone(), store).await {
            Ok(broker) => Arc::new(broker),
            Err(err) => {
                metrics.abort();
                return Err(err).context("open broker");
            }
        };
        let echo = tokio::spawn(echo_requests(Arc::clone(&broker)));
        readiness.set_ready(true);
        info!(
            session_id = %broker.session_id(),
            request_queue = broker.request_queue(),
            "broker started"
        );
        Ok(Self {
            broker,
            readiness,
            echo,
            metrics,
        })
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Closes the broker, waits for the request loop, and stops serving metrics.
    pub async fn shutdown(self) -> CloseReport {
        self.readiness.set_ready(false);
        let report = self.broker.close().await;
        match self.echo.await {
            Ok(handled) => info!(handled, "request loop stopped"),
            Err(err) => warn!(error = %err, "request loop ended abnormally"),
        }
        self.metrics.abort();
        report
    }
}

/// Runs the broker until `shutdown` resolves.
pub async fn run_with_shutdown<F>(
    config: ServiceConfig,
    store: Arc<dyn DurableStore>,
    metrics_handle: PrometheusHandle,
    shutdown: F,
) -> Result<CloseReport>
where
    F: Future<Output = ()> + Send,
{
    let app = App::start(&config, store, metrics_handle).await?;
    shutdown.await;
    info!("shutdown requested");
    let report = app.shutdown().await;
    if !report.is_clean() {
        warn!(failures = ?report.failures, "broker closed with failures");
    }
    Ok(report)
}

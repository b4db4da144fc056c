// Periodic liveness probing between a client session and its broker.
//
// Every round runs all probes concurrently. A round is healthy when at least
// one channel answers; `failure_threshold` unhealthy rounds in a row mark the
// session unavailable. Any healthy round resets the session again.
use async_trait::async_trait;
use ferry_common::HeartbeatConfig;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::controller::Controller;
use crate::session::Session;
use crate::transport::RequestTransport;

/// How far a failed probe says the outage reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The broker process did not answer but its host did.
    Process,
    /// The broker host could not be reached at all.
    Node,
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn probe(&self) -> Result<(), ProbeFailure>;
}

/// Pings the controller endpoint.
pub struct ControllerProbe {
    controller: Arc<dyn Controller>,
}

impl ControllerProbe {
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl LivenessProbe for ControllerProbe {
    fn name(&self) -> &str {
        "controller"
    }

    async fn probe(&self) -> Result<(), ProbeFailure> {
        self.controller.ping().await.map_err(|err| {
            debug!(error = %err, "controller ping failed");
            ProbeFailure::Process
        })
    }
}

/// Pings through the client's send path.
pub struct TransportProbe {
    transport: Arc<dyn RequestTransport>,
}

impl TransportProbe {
    pub fn new(transport: Arc<dyn RequestTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl LivenessProbe for TransportProbe {
    fn name(&self) -> &str {
        "transport"
    }

    async fn probe(&self) -> Result<(), ProbeFailure> {
        self.transport.ping().await.map_err(|err| {
            debug!(error = %err, "transport ping failed");
            ProbeFailure::Node
        })
    }
}

type CallbackFn = dyn Fn() -> BoxFuture<'static, Result<(), ProbeFailure>> + Send + Sync;

/// Wraps a service-side callback ping.
pub struct CallbackProbe {
    name: String,
    callback: Box<CallbackFn>,
}

impl CallbackProbe {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), ProbeFailure>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl LivenessProbe for CallbackProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), ProbeFailure> {
        (self.callback)().await
    }
}

/// Outcome of one probing round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Healthy,
    /// Every probe failed; `node_down` when all of them blamed the node.
    Failed { node_down: bool },
}

/// Tracks consecutive failed rounds and applies the result to the session.
#[derive(Debug)]
pub struct LivenessTracker {
    threshold: u32,
    consecutive_failures: u32,
}

impl LivenessTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record(&mut self, outcome: RoundOutcome, session: &Session) {
        match outcome {
            RoundOutcome::Healthy => {
                self.consecutive_failures = 0;
                session.reset_heartbeat();
            }
            RoundOutcome::Failed { node_down } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.threshold && session.is_available() {
                    session.mark_unavailable(node_down);
                }
            }
        }
    }
}

/// Runs every probe once, each bounded by `config.probe_timeout`.
pub async fn run_round(probes: &[Arc<dyn LivenessProbe>], config: &HeartbeatConfig) -> RoundOutcome {
    if probes.is_empty() {
        return RoundOutcome::Healthy;
    }
    let results = join_all(probes.iter().map(|probe| async move {
        match tokio::time::timeout(config.probe_timeout, probe.probe()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(probe = probe.name(), "liveness probe timed out");
                Err(ProbeFailure::Node)
            }
        }
    }))
    .await;
    if results.iter().any(Result::is_ok) {
        return RoundOutcome::Healthy;
    }
    let node_down = results
        .iter()
        .all(|result| matches!(result, Err(ProbeFailure::Node)));
    RoundOutcome::Failed { node_down }
}

/// Background heartbeat loop for one session.
pub struct HeartbeatMonitor {
    cancel_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn start(
        session: Arc<Session>,
        probes: Vec<Arc<dyn LivenessProbe>>,
        config: HeartbeatConfig,
    ) -> Self {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut tracker = LivenessTracker::new(config.failure_threshold);
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                let outcome = run_round(&probes, &config).await;
                if let RoundOutcome::Failed { node_down } = outcome {
                    warn!(
                        session_id = %session.id(),
                        node_down,
                        failures = tracker.consecutive_failures() + 1,
                        "heartbeat round failed"
                    );
                }
                tracker.record(outcome, &session);
            }
            debug!(session_id = %session.id(), "heartbeat monitor stopped");
        });
        Self {
            cancel_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the loop; a round already probing finishes first.
    pub async fn stop(&self) {
        self.cancel_tx.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "heartbeat task ended abnormally");
        }
    }
}

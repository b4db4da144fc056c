// Client commit state machine.
//
// Counters live under a short parking_lot lock that is never held across an
// await. A send bumps `uncommitted` before it goes out and takes the bump
// back if the send fails; `sent` only moves on success. Commits subtract the
// count they carried, and only if no new batch was minted in between.
use ferry_common::CommitConfig;
use ferry_common::ids::MessageId;
use ferry_wire::Message;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::controller::{BrokerClientStatus, CommitKind, CommitRequest, Controller};
use crate::session::{BrokerDownListener, Session};
use crate::transport::RequestTransport;
use crate::{ClientError, Result};

/// Where a client handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Created,
    Sending,
    Flushed,
    Failed,
    Ended,
    Disposed,
}

#[derive(Debug, Default)]
struct ClientState {
    batch_id: Option<u64>,
    sent: u64,
    uncommitted: u64,
    last_send_timeout: Duration,
    ended: bool,
    // An EndRequests commit is in flight; sends are already refused.
    ending: bool,
    failed: bool,
    disposed: bool,
}

impl ClientState {
    fn ensure_open(&self) -> Result<()> {
        if self.disposed {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    fn ensure_can_send(&self) -> Result<()> {
        self.ensure_open()?;
        if self.ended || self.ending {
            return Err(ClientError::Ended);
        }
        Ok(())
    }
}

struct ClientCore {
    client_id: String,
    durable: bool,
    state: Mutex<ClientState>,
}

impl BrokerDownListener for ClientCore {
    fn on_broker_down(&self, node_down: bool) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        // The broker may have lost the open batch; start a new one next send.
        if self.durable && state.uncommitted > 0 {
            state.failed = true;
        }
        debug!(client_id = %self.client_id, node_down, "broker down signal received");
    }
}

/// Handle for one logical client of a session.
///
/// ```no_run
/// # use ferry_client::{Client, Controller, RequestTransport, Session};
/// # use ferry_common::CommitConfig;
/// # use std::sync::Arc;
/// # async fn demo(
/// #     session: Arc<Session>,
/// #     controller: Arc<dyn Controller>,
/// #     transport: Arc<dyn RequestTransport>,
/// # ) -> ferry_client::Result<()> {
/// use bytes::Bytes;
/// use ferry_wire::Message;
///
/// let client = Client::attach("worker-1", session, controller, transport, CommitConfig::default())?;
/// client.send_request(Message::request("worker-1", "Square", Bytes::from_static(b"7"))).await?;
/// client.end_requests(None).await?;
/// client.close(false, None).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    core: Arc<ClientCore>,
    session: Arc<Session>,
    controller: Arc<dyn Controller>,
    transport: Arc<dyn RequestTransport>,
    commit: CommitConfig,
}

impl Client {
    /// Registers `client_id` with the session; ids are unique per session.
    pub fn attach(
        client_id: impl Into<String>,
        session: Arc<Session>,
        controller: Arc<dyn Controller>,
        transport: Arc<dyn RequestTransport>,
        commit: CommitConfig,
    ) -> Result<Self> {
        let client_id = client_id.into();
        let core = Arc::new(ClientCore {
            client_id: client_id.clone(),
            durable: session.is_durable(),
            state: Mutex::new(ClientState {
                last_send_timeout: commit.send_timeout,
                ..ClientState::default()
            }),
        });
        let weak = Arc::downgrade(&core);
        let listener: Weak<dyn BrokerDownListener> = weak;
        session.attach(&client_id, listener)?;
        Ok(Self {
            core,
            session,
            controller,
            transport,
            commit,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    pub fn is_durable(&self) -> bool {
        self.core.durable
    }

    pub fn sent(&self) -> u64 {
        self.core.state.lock().sent
    }

    pub fn uncommitted(&self) -> u64 {
        self.core.state.lock().uncommitted
    }

    pub fn batch_id(&self) -> Option<u64> {
        self.core.state.lock().batch_id
    }

    pub fn phase(&self) -> ClientPhase {
        let state = self.core.state.lock();
        if state.disposed {
            ClientPhase::Disposed
        } else if state.ended || state.ending {
            ClientPhase::Ended
        } else if state.failed {
            ClientPhase::Failed
        } else if state.uncommitted > 0 {
            ClientPhase::Sending
        } else if state.sent > 0 {
            ClientPhase::Flushed
        } else {
            ClientPhase::Created
        }
    }

    /// Non-durable clients fail fast while the broker is marked down.
    /// Durable clients always try: the durable path may still be reachable.
    pub fn check_broker_availability(&self) -> Result<()> {
        if self.core.durable || self.session.is_available() {
            return Ok(());
        }
        Err(ClientError::BrokerUnavailable {
            node_down: self.session.is_node_unavailable(),
        })
    }

    /// Sends with the configured per-send timeout.
    pub async fn send_request(&self, request: Message) -> Result<MessageId> {
        self.send_request_with_timeout(request, self.commit.send_timeout)
            .await
    }

    /// Stamps client identity (and the batch id for durable clients) onto
    /// `request` and transmits it.
    pub async fn send_request_with_timeout(
        &self,
        mut request: Message,
        timeout: Duration,
    ) -> Result<MessageId> {
        self.check_broker_availability()?;
        let batch_id = {
            let mut state = self.core.state.lock();
            state.ensure_can_send()?;
            let batch_id = if self.core.durable {
                if state.failed || state.batch_id.is_none() {
                    let next = self.session.batch_ids().next();
                    if state.failed {
                        // Whatever the failed batch still held is abandoned.
                        info!(
                            client_id = %self.core.client_id,
                            abandoned = state.uncommitted,
                            previous = ?state.batch_id,
                            batch_id = next,
                            "starting new batch after failure"
                        );
                        state.uncommitted = 0;
                    }
                    state.batch_id = Some(next);
                    state.failed = false;
                }
                state.batch_id
            } else {
                None
            };
            state.uncommitted += 1;
            state.last_send_timeout = timeout;
            batch_id
        };

        request.client_id = self.core.client_id.clone();
        request.batch_id = batch_id;
        let message_id = request.message_id;
        match self.transport.send(&request, timeout).await {
            Ok(()) => {
                self.core.state.lock().sent += 1;
                self.session.reset_heartbeat();
                metrics::counter!("ferry_client_requests_sent_total").increment(1);
                Ok(message_id)
            }
            Err(err) => {
                {
                    let mut state = self.core.state.lock();
                    if state.batch_id == batch_id {
                        state.uncommitted = state.uncommitted.saturating_sub(1);
                    }
                    if self.core.durable {
                        state.failed = true;
                    }
                }
                warn!(
                    client_id = %self.core.client_id,
                    batch_id = ?batch_id,
                    error = %err,
                    "request send failed"
                );
                metrics::counter!("ferry_client_send_failures_total").increment(1);
                Err(err)
            }
        }
    }

    /// Commits outstanding requests without closing the client.
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        let Some(pending) = self.pending_commit(false)? else {
            return Ok(());
        };
        self.commit(CommitKind::Flush, pending, timeout).await
    }

    /// Commits outstanding requests and closes the client to further sends.
    ///
    /// Sends are refused from the moment the commit starts. If the commit
    /// fails the client reopens so the caller can retry.
    pub async fn end_requests(&self, timeout: Option<Duration>) -> Result<()> {
        let Some(pending) = self.pending_commit(true)? else {
            return Ok(());
        };
        if let Err(err) = self.commit(CommitKind::EndRequests, pending, timeout).await {
            self.core.state.lock().ending = false;
            return Err(err);
        }
        {
            let mut state = self.core.state.lock();
            state.ending = false;
            state.ended = true;
        }
        self.transport.close_send().await?;
        info!(client_id = %self.core.client_id, "requests ended");
        Ok(())
    }

    pub async fn get_status(&self) -> Result<BrokerClientStatus> {
        self.core.state.lock().ensure_open()?;
        self.check_broker_availability()?;
        let status = self
            .bounded(
                self.commit.default_timeout,
                self.controller.get_client_status(&self.core.client_id),
            )
            .await?;
        self.session.reset_heartbeat();
        Ok(status)
    }

    pub async fn get_requests_count(&self) -> Result<u64> {
        self.core.state.lock().ensure_open()?;
        self.check_broker_availability()?;
        let count = self
            .bounded(
                self.commit.default_timeout,
                self.controller.get_requests_count(&self.core.client_id),
            )
            .await?;
        self.session.reset_heartbeat();
        Ok(count)
    }

    /// Detaches from the session, releases the transport, and optionally asks
    /// the broker to purge this client's requests.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. Closing twice is a no-op.
    pub async fn close(&self, purge: bool, timeout: Option<Duration>) -> Result<()> {
        {
            let mut state = self.core.state.lock();
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
        }
        // Detach first so no heartbeat broadcast reaches a half-closed handle.
        self.session.detach(&self.core.client_id);

        let mut first_failure = None;
        if let Err(err) = self.transport.close().await {
            warn!(client_id = %self.core.client_id, error = %err, "transport close failed");
            first_failure.get_or_insert(err);
        }
        if purge {
            let timeout = timeout.unwrap_or(self.commit.default_timeout);
            if let Err(err) = self
                .bounded(timeout, self.controller.purge(&self.core.client_id))
                .await
            {
                warn!(client_id = %self.core.client_id, error = %err, "purge failed");
                first_failure.get_or_insert(err);
            }
        }
        debug!(client_id = %self.core.client_id, purge, "client closed");
        first_failure.map_or(Ok(()), Err)
    }

    /// Snapshot of what a commit should carry, or `None` when there is
    /// nothing to commit.
    ///
    /// An ending snapshot also closes the client to sends under the same lock,
    /// so nothing can slip in behind the count it carries.
    fn pending_commit(&self, ending: bool) -> Result<Option<PendingCommit>> {
        let mut state = self.core.state.lock();
        state.ensure_can_send()?;
        if ending && state.sent == 0 {
            return Err(ClientError::InvalidUsage(
                "EndRequests called before any request was sent".into(),
            ));
        }
        if !ending && state.uncommitted == 0 {
            return Ok(None);
        }
        state.ending = ending;
        Ok(Some(PendingCommit {
            count: state.uncommitted,
            batch_id: state.batch_id,
            throttle: throttle_timeout(state.last_send_timeout, self.commit.throttle_inflation),
        }))
    }

    async fn commit(
        &self,
        kind: CommitKind,
        pending: PendingCommit,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.check_broker_availability()?;
        let requested = timeout.unwrap_or(self.commit.default_timeout);
        let effective = requested.max(pending.throttle);
        let request = CommitRequest {
            count: pending.count,
            client_id: self.core.client_id.clone(),
            batch_id: pending.batch_id.unwrap_or_default(),
            throttle_timeout_ms: pending.throttle.as_millis() as u64,
            timeout_ms: effective.as_millis() as u64,
        };
        let started = Instant::now();
        let call = self.bounded(effective, self.controller.commit(kind, request));
        // A loss that happened before we started must not short-circuit a
        // durable client; only race against losses from here on.
        let outcome = if self.session.is_available() {
            tokio::select! {
                node_down = self.session.liveness_lost() => {
                    Err(ClientError::BrokerUnavailable { node_down })
                }
                outcome = call => outcome,
            }
        } else {
            call.await
        };
        metrics::histogram!("ferry_client_commit_seconds", "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => {
                let mut state = self.core.state.lock();
                if state.batch_id == pending.batch_id {
                    state.uncommitted = state.uncommitted.saturating_sub(pending.count);
                }
                drop(state);
                self.session.reset_heartbeat();
                debug!(
                    client_id = %self.core.client_id,
                    kind = kind.as_str(),
                    count = pending.count,
                    "commit succeeded"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    client_id = %self.core.client_id,
                    kind = kind.as_str(),
                    error = %err,
                    "commit failed"
                );
                metrics::counter!("ferry_client_commit_failures_total", "kind" => kind.as_str())
                    .increment(1);
                Err(err)
            }
        }
    }

    async fn bounded<T>(
        &self,
        timeout: Duration,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }
}

struct PendingCommit {
    count: u64,
    batch_id: Option<u64>,
    throttle: Duration,
}

/// Throttle timeout derived from the last send timeout, in whole milliseconds.
pub fn throttle_timeout(last_send_timeout: Duration, inflation: f64) -> Duration {
    let millis = (last_send_timeout.as_millis() as f64 * inflation).floor();
    Duration::from_millis(millis as u64)
}

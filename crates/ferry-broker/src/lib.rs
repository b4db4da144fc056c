// Broker side of the durable relay.
// `Broker` owns one session's registry, relay, and sender; they are opened
// together and torn down together by `close`.
use chrono::Utc;
use ferry_common::BrokerSettings;
use ferry_common::ids::SessionId;
use ferry_storage::{DurableStore, Permissions, ResourceKind, ScopedCredential, StorageError};
use ferry_wire::Message;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub mod codec;
pub mod destinations;
pub mod relay;
pub mod retriever;
pub mod sender;

pub use destinations::{Destination, DestinationCredentials, DestinationRegistry};
pub use relay::{RelayStats, RequestRelay};
pub use retriever::{BatchRetriever, QueueRetriever};
pub use sender::{Backoff, ResponseSender, SenderStats};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("destination not found: {0}")]
    DestinationNotFound(String),
    #[error("relay already opened")]
    AlreadyOpen,
    #[error("broker is closed")]
    Disposed,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("wire error: {0}")]
    Wire(#[from] ferry_wire::Error),
    #[error("config error: {0}")]
    Config(#[from] ferry_common::Error),
}

/// Failures swallowed while tearing a broker down.
#[derive(Debug, Default)]
pub struct CloseReport {
    pub failures: Vec<String>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record(&mut self, component: &str, failure: impl fmt::Display) {
        warn!(component, failure = %failure, "close step failed");
        self.failures.push(format!("{component}: {failure}"));
    }
}

/// Joins `tasks` for up to `deadline`, then aborts whatever is left.
pub(crate) async fn drain_tasks(
    component: &str,
    mut tasks: JoinSet<()>,
    deadline: Duration,
    report: &mut CloseReport,
) {
    let mut panicked = Vec::new();
    let drained = tokio::time::timeout(deadline, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined
                && err.is_panic()
            {
                panicked.push(err.to_string());
            }
        }
    })
    .await;
    for failure in panicked {
        report.record(component, format!("task panicked: {failure}"));
    }
    if drained.is_err() {
        let stuck = tasks.len();
        tasks.abort_all();
        report.record(
            component,
            format!("{stuck} task(s) still running after {deadline:?}; aborted"),
        );
    }
}

/// Credentials a client needs to push requests into the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCredentials {
    pub queue: ScopedCredential,
    pub blob: ScopedCredential,
}

/// One session's broker: request relay, response sender, and destinations.
///
/// ```
/// use bytes::Bytes;
/// use ferry_broker::Broker;
/// use ferry_common::BrokerSettings;
/// use ferry_common::ids::SessionId;
/// use ferry_storage::MemoryStore;
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let store = Arc::new(MemoryStore::new());
///     let broker = Broker::open(SessionId::new(), BrokerSettings::default(), store)
///         .await
///         .expect("open");
///     let request = ferry_wire::Message::request("c1", "Echo", Bytes::from_static(b"hi"));
///     broker
///         .send_response(&request.reply(Bytes::from_static(b"hi")), None)
///         .expect("send");
///     let report = broker.close().await;
///     assert!(report.is_clean());
/// });
/// ```
pub struct Broker {
    session_id: SessionId,
    settings: BrokerSettings,
    store: Arc<dyn DurableStore>,
    registry: Arc<DestinationRegistry>,
    relay: RequestRelay,
    sender: ResponseSender,
    request_queue: String,
    request_container: String,
}

impl Broker {
    /// Opens a broker that pulls from its own durable request queue.
    pub async fn open(
        session_id: SessionId,
        settings: BrokerSettings,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self> {
        let request_queue = request_queue_name(session_id);
        let retriever = Arc::new(QueueRetriever::new(
            Arc::clone(&store),
            request_queue.clone(),
            settings.relay.retrieval_batch_size,
            settings.relay.visibility_timeout,
        ));
        Self::open_with_retriever(session_id, settings, store, retriever).await
    }

    /// Opens a broker fed by a caller-supplied batch retriever.
    pub async fn open_with_retriever(
        session_id: SessionId,
        settings: BrokerSettings,
        store: Arc<dyn DurableStore>,
        retriever: Arc<dyn BatchRetriever>,
    ) -> Result<Self> {
        settings.validate()?;
        let prefix = format!("ferry-{session_id}");
        let registry = Arc::new(DestinationRegistry::new(
            Arc::clone(&store),
            settings.relay.clone(),
            &prefix,
        ));
        let request_queue = request_queue_name(session_id);
        let request_container = destinations::resource_name(&prefix, "requests-blobs");
        registry.provision(ResourceKind::Queue, &request_queue).await?;
        registry
            .provision(ResourceKind::Container, &request_container)
            .await?;
        registry.add_default().await?;

        let relay = RequestRelay::new(
            settings.relay.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
        );
        let sender = ResponseSender::new(
            settings.sender.clone(),
            &settings.relay,
            Arc::clone(&store),
            Arc::clone(&registry),
        );
        sender.start();
        relay.open(retriever)?;
        info!(session_id = %session_id, request_queue = %request_queue, "broker opened");
        Ok(Self {
            session_id,
            settings,
            store,
            registry,
            relay,
            sender,
            request_queue,
            request_container,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn request_queue(&self) -> &str {
        &self.request_queue
    }

    pub fn request_container(&self) -> &str {
        &self.request_container
    }

    pub fn inline_payload_limit(&self) -> usize {
        self.settings.relay.inline_payload_limit
    }

    /// Next request for the application, or `None` once the broker is closed.
    pub async fn receive_request(&self) -> Option<Message> {
        self.relay.receive_request().await
    }

    pub fn send_response(&self, message: &Message, destination: Option<&str>) -> Result<()> {
        self.relay.send_response(message, destination)
    }

    pub async fn add_destination(&self, tag: &str, id: &str) -> Result<DestinationCredentials> {
        self.relay.add_destination(tag, id).await
    }

    /// Add-only credentials for the request queue and its blob container.
    pub fn request_queue_credential(&self) -> Result<RequestCredentials> {
        let expiry = chrono::Duration::from_std(self.settings.relay.credential_expiry)
            .map_err(|err| BrokerError::Config(ferry_common::Error::Config(err.to_string())))?;
        let expires_at = Utc::now() + expiry;
        Ok(RequestCredentials {
            queue: self.store.issue_credential(
                &self.request_queue,
                ResourceKind::Queue,
                Permissions::ADD_ONLY,
                expires_at,
            )?,
            blob: self.store.issue_credential(
                &self.request_container,
                ResourceKind::Container,
                Permissions::ADD_ONLY,
                expires_at,
            )?,
        })
    }

    pub fn registry(&self) -> &DestinationRegistry {
        &self.registry
    }

    pub fn relay_stats(&self) -> &RelayStats {
        self.relay.stats()
    }

    pub fn sender_stats(&self) -> &SenderStats {
        self.sender.stats()
    }

    /// Stops the relay, then drains the sender, collecting failures.
    ///
    /// Cancellation is cooperative. Each component gets at most the sender's
    /// drain timeout for its loops to notice; anything still running after that
    /// is aborted and listed in the report. A second call is a no-op.
    pub async fn close(&self) -> CloseReport {
        let mut report = CloseReport::default();
        self.relay
            .close(self.settings.sender.drain_timeout, &mut report)
            .await;
        self.sender.close(&mut report).await;
        info!(
            session_id = %self.session_id,
            failures = report.failures.len(),
            "broker closed"
        );
        report
    }
}

fn request_queue_name(session_id: SessionId) -> String {
    destinations::resource_name(&format!("ferry-{session_id}"), "requests")
}

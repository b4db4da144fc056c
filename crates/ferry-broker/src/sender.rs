// Response sender: a fixed worker pool draining destination buffers into the
// durable response queues.
//
// Workers are started and paused as a group by a supervisor that looks at the
// buffers once per check interval. A paused worker parks on the `active` watch
// and costs nothing; an active worker that finds nothing to do backs off.
use ferry_common::{RelayConfig, SenderConfig};
use ferry_storage::DurableStore;
use ferry_wire::Message;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::destinations::{Destination, DestinationRegistry};
use crate::{BrokerError, CloseReport, codec, drain_tasks};

/// Per-worker delay between unproductive cycles.
///
/// ```
/// use ferry_broker::sender::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300));
/// assert_eq!(backoff.next(false), Duration::from_millis(100));
/// assert_eq!(backoff.next(false), Duration::from_millis(200));
/// assert_eq!(backoff.next(false), Duration::from_millis(300));
/// assert_eq!(backoff.next(true), Duration::ZERO);
/// assert_eq!(backoff.next(false), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to apply after a cycle; productive cycles reset the ladder.
    pub fn next(&mut self, productive: bool) -> Duration {
        if productive {
            self.current = self.min;
            return Duration::ZERO;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

#[derive(Debug, Default)]
pub struct SenderStats {
    delivered: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    parked: AtomicUsize,
}

impl SenderStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Failed sends that were put back on their destination buffer.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Workers currently parked by the supervisor.
    pub fn parked_workers(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}

struct SenderShared {
    config: SenderConfig,
    inline_limit: usize,
    store: Arc<dyn DurableStore>,
    registry: Arc<DestinationRegistry>,
    active_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    cursor: AtomicUsize,
    stats: SenderStats,
}

impl SenderShared {
    /// Pops one message from the first destination that has one.
    fn next_message(&self) -> Option<(Arc<Destination>, Message)> {
        let destinations = self.registry.snapshot();
        if destinations.is_empty() {
            return None;
        }
        let start = if self.config.round_robin {
            self.cursor.fetch_add(1, Ordering::Relaxed) % destinations.len()
        } else {
            0
        };
        (0..destinations.len())
            .map(|offset| &destinations[(start + offset) % destinations.len()])
            .find_map(|destination| {
                destination
                    .pop()
                    .map(|message| (Arc::clone(destination), message))
            })
    }

    /// Sends one message; returns whether the cycle was productive.
    async fn deliver(&self, destination: &Destination, message: Message) -> bool {
        let send = async {
            let payload = codec::encode_for_queue(
                self.store.as_ref(),
                destination.container(),
                &message,
                self.inline_limit,
            )
            .await?;
            self.store.push(destination.queue(), payload).await?;
            Ok::<_, BrokerError>(())
        };
        match tokio::time::timeout(self.config.send_timeout, send).await {
            Ok(Ok(())) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ferry_responses_delivered_total").increment(1);
                true
            }
            Ok(Err(BrokerError::Wire(err))) => {
                // Re-sending cannot fix an encoding failure.
                error!(destination = %destination.tag(), message_id = %message.message_id, error = %err, "dropping unencodable response");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ferry_responses_dropped_total").increment(1);
                false
            }
            Ok(Err(BrokerError::Storage(err))) if !err.is_transient() => {
                // A missing queue or a rejected payload stays that way.
                error!(destination = %destination.tag(), message_id = %message.message_id, error = %err, "dropping response after permanent store failure");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ferry_responses_dropped_total").increment(1);
                false
            }
            Ok(Err(err)) => {
                warn!(destination = %destination.tag(), error = %err, "response send failed; re-enqueueing");
                self.requeue(destination, message);
                false
            }
            Err(_) => {
                // The push may still land; a duplicate is possible.
                warn!(destination = %destination.tag(), timeout_ms = self.config.send_timeout.as_millis() as u64, "response send timed out; re-enqueueing");
                self.requeue(destination, message);
                false
            }
        }
    }

    fn requeue(&self, destination: &Destination, message: Message) {
        destination.enqueue(message);
        self.stats.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ferry_response_retries_total").increment(1);
    }
}

pub struct ResponseSender {
    shared: Arc<SenderShared>,
    tasks: parking_lot::Mutex<JoinSet<()>>,
}

impl ResponseSender {
    pub fn new(
        config: SenderConfig,
        relay: &RelayConfig,
        store: Arc<dyn DurableStore>,
        registry: Arc<DestinationRegistry>,
    ) -> Self {
        let (active_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(SenderShared {
                config,
                inline_limit: relay.inline_payload_limit,
                store,
                registry,
                active_tx,
                cancel_tx,
                cursor: AtomicUsize::new(0),
                stats: SenderStats::default(),
            }),
            tasks: parking_lot::Mutex::new(JoinSet::new()),
        }
    }

    /// Spawns the worker pool (initially paused) and the supervisor.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for worker in 0..self.shared.config.workers {
            tasks.spawn(run_worker(worker, Arc::clone(&self.shared)));
        }
        tasks.spawn(run_supervisor(Arc::clone(&self.shared)));
        info!(
            workers = self.shared.config.workers,
            round_robin = self.shared.config.round_robin,
            "response sender started"
        );
    }

    pub fn is_active(&self) -> bool {
        *self.shared.active_tx.borrow()
    }

    pub fn stats(&self) -> &SenderStats {
        &self.shared.stats
    }

    /// Signals every worker to stop and waits up to the drain timeout.
    ///
    /// A send already in flight finishes or times out on its own; whatever is
    /// still buffered when the deadline passes is discarded.
    pub async fn close(&self, report: &mut CloseReport) {
        if self.shared.cancel_tx.send_replace(true) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        drain_tasks("response sender", tasks, self.shared.config.drain_timeout, report).await;
        let abandoned = self.shared.registry.pending();
        if abandoned > 0 {
            warn!(abandoned, "responses left undelivered at shutdown");
        }
        info!(delivered = self.shared.stats.delivered(), "response sender closed");
    }
}

async fn run_worker(worker: usize, shared: Arc<SenderShared>) {
    let mut active = shared.active_tx.subscribe();
    let mut cancel = shared.cancel_tx.subscribe();
    let mut backoff = Backoff::new(shared.config.min_backoff, shared.config.max_backoff);
    loop {
        if *cancel.borrow_and_update() {
            break;
        }
        if !*active.borrow_and_update() {
            shared.stats.parked.fetch_add(1, Ordering::Relaxed);
            let woke = tokio::select! {
                changed = active.changed() => changed.is_ok(),
                _ = cancel.changed() => false,
            };
            shared.stats.parked.fetch_sub(1, Ordering::Relaxed);
            if !woke {
                break;
            }
            // Start each active stretch from the short end of the ladder.
            backoff = Backoff::new(shared.config.min_backoff, shared.config.max_backoff);
            continue;
        }

        let productive = match shared.next_message() {
            Some((destination, message)) => shared.deliver(&destination, message).await,
            None => false,
        };
        let delay = backoff.next(productive);
        if delay.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = cancel.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(worker, "response worker exited");
}

async fn run_supervisor(shared: Arc<SenderShared>) {
    let mut cancel = shared.cancel_tx.subscribe();
    let mut ticker = tokio::time::interval(shared.config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = ticker.tick() => {}
        }
        let pending = shared.registry.any_pending();
        let active = *shared.active_tx.borrow();
        if pending && !active {
            debug!("responses pending; resuming workers");
            shared.active_tx.send_replace(true);
            metrics::counter!("ferry_sender_resumes_total").increment(1);
        } else if !pending && active {
            debug!("all destinations drained; pausing workers");
            shared.active_tx.send_replace(false);
        }
    }
    // Release parked workers so they observe the cancellation.
    shared.active_tx.send_replace(false);
    debug!("sender supervisor exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use ferry_common::ids::MessageId;
    use ferry_storage::{
        DurableMessage, MemoryStore, Permissions, ResourceKind, ScopedCredential, StorageError,
    };
    use ferry_wire::Envelope;
    use parking_lot::Mutex;

    fn fast_config(workers: usize) -> SenderConfig {
        SenderConfig {
            workers,
            min_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            check_interval: Duration::from_millis(10),
            send_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(1),
            round_robin: false,
        }
    }

    async fn setup(
        store: Arc<dyn DurableStore>,
        config: SenderConfig,
    ) -> (ResponseSender, Arc<DestinationRegistry>) {
        let relay = RelayConfig {
            provision_race_wait: Duration::from_millis(1),
            ..RelayConfig::default()
        };
        let registry = Arc::new(DestinationRegistry::new(Arc::clone(&store), relay.clone(), "t"));
        registry.add_default().await.expect("default");
        let sender = ResponseSender::new(config, &relay, store, Arc::clone(&registry));
        (sender, registry)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    fn response(body: &'static [u8]) -> Message {
        Message::request("c1", "Echo", Bytes::from_static(body))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let delays: Vec<_> = (0..8).map(|_| backoff.next(false)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[5], Duration::from_millis(3200));
        assert_eq!(delays[6], Duration::from_secs(5));
        assert_eq!(delays[7], Duration::from_secs(5));
    }

    #[tokio::test]
    async fn buffered_responses_reach_the_durable_queue() {
        let store = Arc::new(MemoryStore::new());
        let (sender, registry) = setup(store.clone(), fast_config(4)).await;
        let default = registry.get(ferry_common::DEFAULT_DESTINATION).expect("default");
        for body in [&b"a"[..], b"b", b"c"] {
            default.enqueue(response(body));
        }
        sender.start();

        let queue = default.queue().to_string();
        wait_until(|| store.peek_all(&queue).len() == 3).await;
        assert_eq!(sender.stats().delivered(), 3);
        assert!(default.is_empty());

        let mut report = CloseReport::default();
        sender.close(&mut report).await;
        assert!(report.is_clean(), "{report:?}");
    }

    #[tokio::test]
    async fn workers_pause_once_everything_is_drained() {
        let store = Arc::new(MemoryStore::new());
        let (sender, registry) = setup(store, fast_config(3)).await;
        sender.start();
        // Nothing buffered: the pool stays parked.
        wait_until(|| sender.stats().parked_workers() == 3).await;
        assert!(!sender.is_active());

        registry
            .get(ferry_common::DEFAULT_DESTINATION)
            .expect("default")
            .enqueue(response(b"x"));
        wait_until(|| sender.stats().delivered() == 1).await;
        wait_until(|| !sender.is_active()).await;
        wait_until(|| sender.stats().parked_workers() == 3).await;

        let mut report = CloseReport::default();
        sender.close(&mut report).await;
        assert!(report.is_clean(), "{report:?}");
    }

    #[tokio::test]
    async fn large_responses_travel_through_the_blob_container() {
        let store = Arc::new(MemoryStore::new());
        let config = fast_config(1);
        let relay = RelayConfig {
            inline_payload_limit: 64,
            ..RelayConfig::default()
        };
        let store_dyn: Arc<dyn DurableStore> = store.clone();
        let registry = Arc::new(DestinationRegistry::new(Arc::clone(&store_dyn), relay.clone(), "t"));
        registry.add_default().await.expect("default");
        let sender = ResponseSender::new(config, &relay, store_dyn, Arc::clone(&registry));
        let default = registry.get(ferry_common::DEFAULT_DESTINATION).expect("default");
        let big = Message::request("c1", "Echo", Bytes::from(vec![1u8; 1024]));
        default.enqueue(big.clone());
        sender.start();

        let queue = default.queue().to_string();
        wait_until(|| store.peek_all(&queue).len() == 1).await;
        let payload = store.peek_all(&queue).remove(0);
        assert!(matches!(
            Envelope::decode(payload.clone()).expect("envelope"),
            Envelope::Blob(_)
        ));
        let decoded = codec::decode_from_queue(store.as_ref(), payload)
            .await
            .expect("decode");
        assert_eq!(decoded, big);

        let mut report = CloseReport::default();
        sender.close(&mut report).await;
    }

    /// Fails the first `failures` pushes with `error`, optionally after
    /// storing the payload.
    struct FlakyStore {
        inner: MemoryStore,
        failures: Mutex<usize>,
        store_before_failing: bool,
        error: StorageError,
    }

    impl FlakyStore {
        fn new(failures: usize, store_before_failing: bool, error: StorageError) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: Mutex::new(failures),
                store_before_failing,
                error,
            }
        }
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn create_queue(&self, queue: &str) -> ferry_storage::Result<()> {
            self.inner.create_queue(queue).await
        }
        async fn create_container(&self, container: &str) -> ferry_storage::Result<()> {
            self.inner.create_container(container).await
        }
        async fn push(&self, queue: &str, payload: Bytes) -> ferry_storage::Result<MessageId> {
            let fail = {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    true
                } else {
                    false
                }
            };
            if !fail {
                return self.inner.push(queue, payload).await;
            }
            if self.store_before_failing {
                self.inner.push(queue, payload).await?;
            }
            Err(self.error.clone())
        }
        async fn pull(
            &self,
            queue: &str,
            max: usize,
            visibility: Duration,
        ) -> ferry_storage::Result<Vec<DurableMessage>> {
            self.inner.pull(queue, max, visibility).await
        }
        async fn delete(&self, queue: &str, id: MessageId) -> ferry_storage::Result<()> {
            self.inner.delete(queue, id).await
        }
        async fn queue_len(&self, queue: &str) -> ferry_storage::Result<usize> {
            self.inner.queue_len(queue).await
        }
        async fn put_blob(&self, container: &str, name: &str, data: Bytes) -> ferry_storage::Result<()> {
            self.inner.put_blob(container, name, data).await
        }
        async fn get_blob(&self, container: &str, name: &str) -> ferry_storage::Result<Bytes> {
            self.inner.get_blob(container, name).await
        }
        async fn delete_blob(&self, container: &str, name: &str) -> ferry_storage::Result<()> {
            self.inner.delete_blob(container, name).await
        }
        fn issue_credential(
            &self,
            resource: &str,
            kind: ResourceKind,
            permissions: Permissions,
            expires_at: DateTime<Utc>,
        ) -> ferry_storage::Result<ScopedCredential> {
            self.inner
                .issue_credential(resource, kind, permissions, expires_at)
        }
    }

    #[tokio::test]
    async fn failed_sends_are_retried_until_delivered() {
        let store = Arc::new(FlakyStore::new(
            3,
            false,
            StorageError::Unavailable("injected".into()),
        ));
        let (sender, registry) = setup(store.clone(), fast_config(1)).await;
        let default = registry.get(ferry_common::DEFAULT_DESTINATION).expect("default");
        default.enqueue(response(b"retry me"));
        sender.start();

        let queue = default.queue().to_string();
        wait_until(|| store.inner.peek_all(&queue).len() == 1).await;
        assert_eq!(sender.stats().retries(), 3);
        assert_eq!(sender.stats().delivered(), 1);

        let mut report = CloseReport::default();
        sender.close(&mut report).await;
    }

    #[tokio::test]
    async fn ambiguous_timeout_may_deliver_twice() {
        let store = Arc::new(FlakyStore::new(1, true, StorageError::Timeout));
        let (sender, registry) = setup(store.clone(), fast_config(1)).await;
        let default = registry.get(ferry_common::DEFAULT_DESTINATION).expect("default");
        default.enqueue(response(b"once or twice"));
        sender.start();

        let queue = default.queue().to_string();
        wait_until(|| store.inner.peek_all(&queue).len() == 2).await;
        // The caller-visible count only reflects confirmed sends.
        assert_eq!(sender.stats().delivered(), 1);
        assert_eq!(sender.stats().retries(), 1);

        let mut report = CloseReport::default();
        sender.close(&mut report).await;
    }

    #[tokio::test]
    async fn permanent_store_failures_drop_the_response() {
        let store = Arc::new(FlakyStore::new(
            1,
            false,
            StorageError::NotFound("queue deleted".into()),
        ));
        let (sender, registry) = setup(store.clone(), fast_config(1)).await;
        let default = registry.get(ferry_common::DEFAULT_DESTINATION).expect("default");
        default.enqueue(response(b"nowhere to go"));
        default.enqueue(response(b"delivered"));
        sender.start();

        let queue = default.queue().to_string();
        wait_until(|| store.inner.peek_all(&queue).len() == 1).await;
        assert_eq!(sender.stats().dropped(), 1);
        assert_eq!(sender.stats().retries(), 0);
        assert_eq!(sender.stats().delivered(), 1);
        // Nothing is left to retry, so the pool goes back to sleep.
        wait_until(|| !sender.is_active()).await;

        let mut report = CloseReport::default();
        sender.close(&mut report).await;
    }

    #[tokio::test]
    async fn round_robin_spreads_work_across_destinations() {
        let store = Arc::new(MemoryStore::new());
        let mut config = fast_config(1);
        config.round_robin = true;
        let (sender, registry) = setup(store.clone(), config).await;
        registry.add("b", "b").await.expect("b");
        let a = registry.get(ferry_common::DEFAULT_DESTINATION).expect("a");
        let b = registry.get("b").expect("b");
        for _ in 0..4 {
            a.enqueue(response(b"a"));
            b.enqueue(response(b"b"));
        }

        // Drive the selection directly: rotation alternates the starting point.
        let picks: Vec<String> = (0..4)
            .filter_map(|_| sender.shared.next_message())
            .map(|(destination, _)| destination.tag().to_string())
            .collect();
        assert_eq!(picks, vec!["default", "b", "default", "b"]);
    }

    #[tokio::test]
    async fn first_ready_scan_prefers_registry_order() {
        let store = Arc::new(MemoryStore::new());
        let (sender, registry) = setup(store, fast_config(1)).await;
        registry.add("b", "b").await.expect("b");
        registry.get("b").expect("b").enqueue(response(b"b"));
        registry
            .get(ferry_common::DEFAULT_DESTINATION)
            .expect("default")
            .enqueue(response(b"a"));

        let (first, _) = sender.shared.next_message().expect("message");
        assert_eq!(first.tag(), ferry_common::DEFAULT_DESTINATION);
        let (second, _) = sender.shared.next_message().expect("message");
        assert_eq!(second.tag(), "b");
        assert!(sender.shared.next_message().is_none());
    }
}

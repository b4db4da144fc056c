// Request relay: durable queue -> local batch cache -> decode -> application.
//
// Retrieval loops drop pulled batches into the cache and release one arrival
// permit per batch. A single processing loop turns each arrival into a decode
// task, but only after it holds a decode slot, so at most `decode_workers`
// batches are ever decoding at once no matter how fast batches arrive.
use ferry_common::{DEFAULT_DESTINATION, RelayConfig};
use ferry_storage::{DurableMessage, DurableStore};
use ferry_wire::Message;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::codec;
use crate::destinations::{DestinationCredentials, DestinationRegistry};
use crate::retriever::BatchRetriever;
use crate::{BrokerError, CloseReport, Result, drain_tasks};

#[derive(Debug, Default)]
pub struct RelayStats {
    cached_batches: AtomicUsize,
    decodes_in_flight: AtomicUsize,
    peak_decodes: AtomicUsize,
    decoded: AtomicU64,
    dropped: AtomicU64,
}

impl RelayStats {
    /// Batches waiting in the local cache.
    pub fn cached_batches(&self) -> usize {
        self.cached_batches.load(Ordering::Relaxed)
    }

    pub fn decodes_in_flight(&self) -> usize {
        self.decodes_in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of batches observed decoding at the same time.
    pub fn peak_decodes(&self) -> usize {
        self.peak_decodes.load(Ordering::Relaxed)
    }

    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    /// Entries that could not be decoded and were discarded.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct RelayShared {
    config: RelayConfig,
    store: Arc<dyn DurableStore>,
    registry: Arc<DestinationRegistry>,
    cache: Mutex<VecDeque<Vec<DurableMessage>>>,
    arrivals: Semaphore,
    decode_slots: Arc<Semaphore>,
    requests_tx: mpsc::Sender<Message>,
    cancel_tx: watch::Sender<bool>,
    stats: RelayStats,
}

impl RelayShared {
    fn enqueue_batch(&self, batch: Vec<DurableMessage>) {
        let size = batch.len();
        let cached = {
            // The gauge moves under the cache lock so it never runs ahead of the cache.
            let mut cache = self.cache.lock();
            cache.push_back(batch);
            self.stats.cached_batches.fetch_add(1, Ordering::Relaxed) + 1
        };
        metrics::gauge!("ferry_relay_cached_batches").set(cached as f64);
        debug!(size, cached, "request batch cached");
        self.arrivals.add_permits(1);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

pub struct RequestRelay {
    shared: Arc<RelayShared>,
    requests_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    tasks: Mutex<JoinSet<()>>,
    opened: AtomicBool,
}

impl RequestRelay {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn DurableStore>,
        registry: Arc<DestinationRegistry>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(config.request_queue_capacity);
        let (cancel_tx, _) = watch::channel(false);
        let decode_slots = Arc::new(Semaphore::new(config.decode_workers));
        Self {
            shared: Arc::new(RelayShared {
                config,
                store,
                registry,
                cache: Mutex::new(VecDeque::new()),
                arrivals: Semaphore::new(0),
                decode_slots,
                requests_tx,
                cancel_tx,
                stats: RelayStats::default(),
            }),
            requests_rx: tokio::sync::Mutex::new(requests_rx),
            tasks: Mutex::new(JoinSet::new()),
            opened: AtomicBool::new(false),
        }
    }

    /// Starts background retrieval and the processing loop, then returns.
    pub fn open(&self, retriever: Arc<dyn BatchRetriever>) -> Result<()> {
        if self.shared.is_cancelled() {
            return Err(BrokerError::Disposed);
        }
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyOpen);
        }
        let mut tasks = self.tasks.lock();
        for worker in 0..self.shared.config.retrieval_concurrency {
            tasks.spawn(run_retrieval(
                worker,
                Arc::clone(&self.shared),
                Arc::clone(&retriever),
            ));
        }
        tasks.spawn(run_processing(Arc::clone(&self.shared)));
        info!(
            decode_workers = self.shared.config.decode_workers,
            retrievers = self.shared.config.retrieval_concurrency,
            "request relay opened"
        );
        Ok(())
    }

    /// Hands a batch straight to the local cache, bypassing retrieval.
    pub fn enqueue_batch(&self, batch: Vec<DurableMessage>) -> Result<()> {
        if self.shared.is_cancelled() {
            return Err(BrokerError::Disposed);
        }
        self.shared.enqueue_batch(batch);
        Ok(())
    }

    /// Waits for the next decoded request.
    ///
    /// Each wait slice is bounded by `request_wait`; an elapsed slice just
    /// starts another one. Returns `None` once the relay is closed.
    pub async fn receive_request(&self) -> Option<Message> {
        let mut cancel = self.shared.cancel_tx.subscribe();
        loop {
            if *cancel.borrow_and_update() {
                return None;
            }
            let mut requests = self.requests_rx.lock().await;
            if *cancel.borrow() {
                return None;
            }
            tokio::select! {
                biased;
                _ = cancel.changed() => return None,
                received = tokio::time::timeout(self.shared.config.request_wait, requests.recv()) => {
                    match received {
                        Ok(message) => return message,
                        Err(_) => {
                            debug!("request wait elapsed; waiting again");
                        }
                    }
                }
            }
        }
    }

    /// Queues a response for `destination` (the default one when `None`).
    ///
    /// The message is deep-copied so the caller may reuse its buffers.
    pub fn send_response(&self, message: &Message, destination: Option<&str>) -> Result<()> {
        if self.shared.is_cancelled() {
            return Err(BrokerError::Disposed);
        }
        let tag = destination.unwrap_or(DEFAULT_DESTINATION);
        let target = self
            .shared
            .registry
            .get(tag)
            .ok_or_else(|| BrokerError::DestinationNotFound(tag.to_string()))?;
        target.enqueue(message.deep_copy());
        metrics::counter!("ferry_responses_accepted_total").increment(1);
        Ok(())
    }

    pub async fn add_destination(&self, tag: &str, id: &str) -> Result<DestinationCredentials> {
        if self.shared.is_cancelled() {
            return Err(BrokerError::Disposed);
        }
        self.shared.registry.add(tag, id).await
    }

    pub fn stats(&self) -> &RelayStats {
        &self.shared.stats
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Stops intake and waits up to `deadline` for background loops to exit.
    ///
    /// Decode tasks already running notice the cancellation the next time
    /// they try to hand a request to the application and drop it.
    pub async fn close(&self, deadline: Duration, report: &mut CloseReport) {
        if self.shared.cancel_tx.send_replace(true) {
            return;
        }
        self.shared.arrivals.close();
        self.shared.decode_slots.close();
        let dropped: usize = {
            let mut cache = self.shared.cache.lock();
            self.shared
                .stats
                .cached_batches
                .fetch_sub(cache.len(), Ordering::Relaxed);
            cache.drain(..).map(|b| b.len()).sum()
        };
        if dropped > 0 {
            warn!(dropped, "discarding cached requests on close");
        }
        metrics::gauge!("ferry_relay_cached_batches").set(0.0);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        drain_tasks("request relay", tasks, deadline, report).await;
        info!("request relay closed");
    }
}

async fn run_retrieval(worker: usize, shared: Arc<RelayShared>, retriever: Arc<dyn BatchRetriever>) {
    let mut cancel = shared.cancel_tx.subscribe();
    loop {
        if *cancel.borrow_and_update() {
            break;
        }
        let next = tokio::select! {
            _ = cancel.changed() => break,
            next = retriever.next_batch() => next,
        };
        let idle = match next {
            Ok(batch) if batch.is_empty() => true,
            Ok(batch) => {
                shared.enqueue_batch(batch);
                false
            }
            Err(err) => {
                warn!(worker, error = %err, "request retrieval failed");
                metrics::counter!("ferry_relay_retrieval_errors_total").increment(1);
                true
            }
        };
        if idle {
            tokio::select! {
                _ = cancel.changed() => break,
                _ = tokio::time::sleep(shared.config.retrieval_idle_poll) => {}
            }
        }
    }
    debug!(worker, "retrieval loop exited");
}

async fn run_processing(shared: Arc<RelayShared>) {
    loop {
        let Ok(arrival) = shared.arrivals.acquire().await else {
            break;
        };
        arrival.forget();
        let next = {
            let mut cache = shared.cache.lock();
            let next = cache.pop_front();
            if next.is_some() {
                shared.stats.cached_batches.fetch_sub(1, Ordering::Relaxed);
            }
            next
        };
        let Some(batch) = next else {
            continue;
        };
        // Blocks here while every decode slot is busy.
        let Ok(slot) = Arc::clone(&shared.decode_slots).acquire_owned().await else {
            break;
        };
        tokio::spawn(decode_batch(Arc::clone(&shared), batch, slot));
    }
    debug!("relay processing loop exited");
}

async fn decode_batch(shared: Arc<RelayShared>, batch: Vec<DurableMessage>, _slot: OwnedSemaphorePermit) {
    let in_flight = shared.stats.decodes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    shared.stats.peak_decodes.fetch_max(in_flight, Ordering::SeqCst);
    metrics::gauge!("ferry_relay_decodes_in_flight").set(in_flight as f64);
    let started = std::time::Instant::now();

    let decodes = batch
        .into_iter()
        .map(|entry| decode_entry(&shared, entry));
    join_all(decodes).await;

    metrics::histogram!("ferry_relay_batch_decode_seconds").record(started.elapsed().as_secs_f64());
    let remaining = shared.stats.decodes_in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::gauge!("ferry_relay_decodes_in_flight").set(remaining as f64);
}

async fn decode_entry(shared: &RelayShared, entry: DurableMessage) {
    let message = match codec::take_from_queue(shared.store.as_ref(), entry.payload).await {
        Ok(message) => message,
        Err(err) => {
            warn!(message_id = %entry.id, queue = %entry.queue, error = %err, "dropping undecodable request");
            shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("ferry_relay_decode_failures_total").increment(1);
            return;
        }
    };
    let mut cancel = shared.cancel_tx.subscribe();
    if *cancel.borrow_and_update() {
        return;
    }
    tokio::select! {
        sent = shared.requests_tx.send(message) => {
            if sent.is_ok() {
                shared.stats.decoded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ferry_relay_requests_total").increment(1);
            }
        }
        _ = cancel.changed() => {
            debug!(message_id = %entry.id, "relay closed before request was handed off");
        }
    }
}

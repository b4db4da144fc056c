// Per-session client state shared by every attached client handle.
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ferry_common::ids::SessionId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{ClientError, Result};

/// Receives the broker-down broadcast.
pub trait BrokerDownListener: Send + Sync {
    fn on_broker_down(&self, node_down: bool);
}

/// Hands out batch ids that only ever increase for the life of a session.
#[derive(Debug, Default)]
pub struct BatchIdAllocator {
    last: AtomicU64,
}

impl BatchIdAllocator {
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Session seen from the client side.
///
/// ```
/// use ferry_client::Session;
/// use ferry_common::ids::SessionId;
///
/// let session = Session::new(SessionId::new(), true);
/// assert!(session.is_available());
/// session.mark_unavailable(false);
/// assert!(!session.is_available());
/// session.reset_heartbeat();
/// assert!(session.is_available());
/// ```
pub struct Session {
    id: SessionId,
    durable: bool,
    available: AtomicBool,
    node_unavailable: AtomicBool,
    // Manual-reset: stays `true` until `reset_heartbeat`.
    liveness_lost_tx: watch::Sender<bool>,
    clients: DashMap<String, Weak<dyn BrokerDownListener>>,
    batch_ids: BatchIdAllocator,
}

impl Session {
    pub fn new(id: SessionId, durable: bool) -> Arc<Self> {
        let (liveness_lost_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            durable,
            available: AtomicBool::new(true),
            node_unavailable: AtomicBool::new(false),
            liveness_lost_tx,
            clients: DashMap::new(),
            batch_ids: BatchIdAllocator::default(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn is_node_unavailable(&self) -> bool {
        self.node_unavailable.load(Ordering::SeqCst)
    }

    pub fn batch_ids(&self) -> &BatchIdAllocator {
        &self.batch_ids
    }

    pub fn attach(&self, client_id: &str, listener: Weak<dyn BrokerDownListener>) -> Result<()> {
        match self.clients.entry(client_id.to_string()) {
            Entry::Occupied(_) => Err(ClientError::DuplicateClientId(client_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(listener);
                debug!(session_id = %self.id, client_id, "client attached");
                Ok(())
            }
        }
    }

    pub fn detach(&self, client_id: &str) -> bool {
        let removed = self.clients.remove(client_id).is_some();
        if removed {
            debug!(session_id = %self.id, client_id, "client detached");
        }
        removed
    }

    pub fn attached_clients(&self) -> usize {
        self.clients.len()
    }

    /// Declares the broker unreachable and tells every attached client.
    pub fn mark_unavailable(&self, node_down: bool) {
        self.node_unavailable.store(node_down, Ordering::SeqCst);
        let was_available = self.available.swap(false, Ordering::SeqCst);
        self.liveness_lost_tx.send_replace(true);
        if was_available {
            warn!(session_id = %self.id, node_down, "broker marked unavailable");
            metrics::counter!("ferry_heartbeat_losses_total").increment(1);
        }
        // Collect first so no map shard lock is held while listeners run.
        let listeners: Vec<_> = self
            .clients
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for listener in listeners {
            listener.on_broker_down(node_down);
        }
    }

    /// Clears the unavailable state after any successful round trip.
    pub fn reset_heartbeat(&self) {
        if !self.available.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.id, "broker reachable again");
        }
        self.node_unavailable.store(false, Ordering::SeqCst);
        self.liveness_lost_tx.send_if_modified(|lost| std::mem::replace(lost, false));
    }

    /// Resolves once liveness is lost, with whether the whole node is down.
    pub async fn liveness_lost(&self) -> bool {
        let mut lost = self.liveness_lost_tx.subscribe();
        // The sender lives as long as `self`, so this only returns on a loss.
        let _ = lost.wait_for(|lost| *lost).await;
        self.is_node_unavailable()
    }
}

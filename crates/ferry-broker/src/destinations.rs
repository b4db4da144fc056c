// Response destinations and their outbound buffers.
//
// Mutations (adding a destination) serialize on a single async lock because
// they provision durable resources. Sender workers and `send_response` only
// ever read the published snapshot, so the hot path never waits on that lock.
use ahash::RandomState;
use arc_swap::ArcSwap;
use chrono::Utc;
use ferry_common::{DEFAULT_DESTINATION, RelayConfig};
use ferry_storage::{
    DurableStore, Permissions, ResourceKind, ScopedCredential, StorageError,
};
use ferry_wire::Message;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{BrokerError, Result};

/// Credentials handed to whoever consumes a destination's responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCredentials {
    pub queue: ScopedCredential,
    pub blob: ScopedCredential,
}

#[derive(Debug)]
pub struct Destination {
    tag: String,
    queue: String,
    container: String,
    credentials: DestinationCredentials,
    buffer: Mutex<VecDeque<Message>>,
}

impl Destination {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn credentials(&self) -> &DestinationCredentials {
        &self.credentials
    }

    pub fn enqueue(&self, message: Message) {
        self.buffer.lock().push_back(message);
    }

    pub fn pop(&self) -> Option<Message> {
        self.buffer.lock().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

pub struct DestinationRegistry {
    store: Arc<dyn DurableStore>,
    config: RelayConfig,
    prefix: String,
    by_tag: tokio::sync::Mutex<HashMap<String, Arc<Destination>, RandomState>>,
    // Registry order; rebuilt under `by_tag` whenever a destination is added.
    snapshot: ArcSwap<Vec<Arc<Destination>>>,
}

impl DestinationRegistry {
    pub fn new(store: Arc<dyn DurableStore>, config: RelayConfig, prefix: &str) -> Self {
        Self {
            store,
            config,
            prefix: resource_name(prefix, ""),
            by_tag: tokio::sync::Mutex::new(HashMap::with_hasher(RandomState::new())),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Registers the destination every untagged response goes to.
    pub async fn add_default(&self) -> Result<DestinationCredentials> {
        self.add(DEFAULT_DESTINATION, DEFAULT_DESTINATION).await
    }

    /// Provisions the response queue and blob container for `tag`.
    ///
    /// Calling this again for a tag that is already registered returns the
    /// existing credentials without touching the store.
    pub async fn add(&self, tag: &str, id: &str) -> Result<DestinationCredentials> {
        let mut by_tag = self.by_tag.lock().await;
        if let Some(existing) = by_tag.get(tag) {
            return Ok(existing.credentials.clone());
        }

        let queue = resource_name(&self.prefix, &format!("responses-{id}"));
        let container = resource_name(&self.prefix, &format!("blobs-{id}"));
        self.provision(ResourceKind::Queue, &queue).await?;
        self.provision(ResourceKind::Container, &container).await?;

        let expiry = chrono::Duration::from_std(self.config.credential_expiry)
            .map_err(|err| BrokerError::Config(ferry_common::Error::Config(err.to_string())))?;
        let expires_at = Utc::now() + expiry;
        let credentials = DestinationCredentials {
            queue: self.store.issue_credential(
                &queue,
                ResourceKind::Queue,
                Permissions::READ_PROCESS_DELETE,
                expires_at,
            )?,
            blob: self.store.issue_credential(
                &container,
                ResourceKind::Container,
                Permissions::READ_PROCESS_DELETE,
                expires_at,
            )?,
        };

        let destination = Arc::new(Destination {
            tag: tag.to_string(),
            queue,
            container,
            credentials: credentials.clone(),
            buffer: Mutex::new(VecDeque::new()),
        });
        by_tag.insert(tag.to_string(), Arc::clone(&destination));
        let mut next = Vec::with_capacity(self.snapshot.load().len() + 1);
        next.extend(self.snapshot.load().iter().cloned());
        next.push(destination);
        self.snapshot.store(Arc::new(next));
        metrics::gauge!("ferry_destinations").set(by_tag.len() as f64);
        info!(tag = %tag, "destination registered");
        Ok(credentials)
    }

    pub fn get(&self, tag: &str) -> Option<Arc<Destination>> {
        self.snapshot
            .load()
            .iter()
            .find(|destination| destination.tag == tag)
            .cloned()
    }

    /// Destinations in registration order.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Destination>>> {
        self.snapshot.load_full()
    }

    pub fn any_pending(&self) -> bool {
        self.snapshot.load().iter().any(|d| !d.is_empty())
    }

    pub fn pending(&self) -> usize {
        self.snapshot.load().iter().map(|d| d.pending()).sum()
    }

    /// Creates `name`, treating a create race lost to another process as success.
    pub(crate) async fn provision(&self, kind: ResourceKind, name: &str) -> Result<()> {
        let created = match kind {
            ResourceKind::Queue => self.store.create_queue(name).await,
            ResourceKind::Container => self.store.create_container(name).await,
        };
        match created {
            Ok(()) => Ok(()),
            Err(StorageError::AlreadyExists(_)) => {
                // Another broker process won the create race; give it time to finish.
                debug!(resource = %name, "resource already exists");
                tokio::time::sleep(self.config.provision_race_wait).await;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Lowercase, dash-separated name accepted by queue and container backends.
pub(crate) fn resource_name(prefix: &str, suffix: &str) -> String {
    let raw = if suffix.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}-{suffix}")
    };
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

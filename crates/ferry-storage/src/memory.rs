use crate::{
    CredentialSigner, DurableMessage, DurableStore, Permissions, ResourceKind, Result,
    ScopedCredential, StorageError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ferry_common::ids::MessageId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    payload: Bytes,
    // Pulled messages stay in the queue but are hidden until this instant.
    visible_at: Instant,
    dequeue_count: u32,
}

/// In-memory durable store with visibility-timeout semantics.
///
/// ```
/// use bytes::Bytes;
/// use ferry_storage::{DurableStore, MemoryStore};
/// use std::time::Duration;
///
/// let store = MemoryStore::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     store.create_queue("requests").await.expect("create");
///     store.push("requests", Bytes::from_static(b"hi")).await.expect("push");
///     let pulled = store
///         .pull("requests", 8, Duration::from_secs(30))
///         .await
///         .expect("pull");
///     assert_eq!(pulled.len(), 1);
///     assert_eq!(pulled[0].payload, Bytes::from_static(b"hi"));
/// });
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    containers: Mutex<HashMap<String, HashMap<String, Bytes>>>,
    signer: CredentialSigner,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account_key(account_key: impl Into<Vec<u8>>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            signer: CredentialSigner::new(account_key),
        }
    }

    pub fn signer(&self) -> &CredentialSigner {
        &self.signer
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queues.lock().contains_key(queue)
    }

    pub fn container_exists(&self, container: &str) -> bool {
        self.containers.lock().contains_key(container)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Payloads currently stored in `queue`, hidden ones included, oldest first.
    pub fn peek_all(&self, queue: &str) -> Vec<Bytes> {
        self.queues
            .lock()
            .get(queue)
            .map(|messages| messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_account_key(b"ferry-dev-account-key".to_vec())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        let mut guard = self.queues.lock();
        if guard.contains_key(queue) {
            return Err(StorageError::AlreadyExists(queue.to_string()));
        }
        guard.insert(queue.to_string(), VecDeque::new());
        Ok(())
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        let mut guard = self.containers.lock();
        if guard.contains_key(container) {
            return Err(StorageError::AlreadyExists(container.to_string()));
        }
        guard.insert(container.to_string(), HashMap::new());
        Ok(())
    }

    async fn push(&self, queue: &str, payload: Bytes) -> Result<MessageId> {
        let mut guard = self.queues.lock();
        let messages = guard
            .get_mut(queue)
            .ok_or_else(|| StorageError::NotFound(queue.to_string()))?;
        let id = MessageId::new();
        messages.push_back(StoredMessage {
            id,
            payload,
            visible_at: Instant::now(),
            dequeue_count: 0,
        });
        Ok(id)
    }

    async fn pull(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<DurableMessage>> {
        let now = Instant::now();
        let hidden_until = now.checked_add(visibility).unwrap_or(now);
        let mut guard = self.queues.lock();
        let messages = guard
            .get_mut(queue)
            .ok_or_else(|| StorageError::NotFound(queue.to_string()))?;
        let mut pulled = Vec::new();
        for message in messages.iter_mut() {
            if pulled.len() >= max {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            message.visible_at = hidden_until;
            message.dequeue_count += 1;
            pulled.push(DurableMessage {
                id: message.id,
                queue: queue.to_string(),
                payload: message.payload.clone(),
                visibility_timeout: visibility,
                dequeue_count: message.dequeue_count,
            });
        }
        Ok(pulled)
    }

    async fn delete(&self, queue: &str, id: MessageId) -> Result<()> {
        let mut guard = self.queues.lock();
        let messages = guard
            .get_mut(queue)
            .ok_or_else(|| StorageError::NotFound(queue.to_string()))?;
        let before = messages.len();
        messages.retain(|message| message.id != id);
        if messages.len() == before {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        self.queues
            .lock()
            .get(queue)
            .map(VecDeque::len)
            .ok_or_else(|| StorageError::NotFound(queue.to_string()))
    }

    async fn put_blob(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
        let mut guard = self.containers.lock();
        let blobs = guard
            .get_mut(container)
            .ok_or_else(|| StorageError::NotFound(container.to_string()))?;
        blobs.insert(name.to_string(), data);
        Ok(())
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<Bytes> {
        self.containers
            .lock()
            .get(container)
            .and_then(|blobs| blobs.get(name).cloned())
            .ok_or_else(|| StorageError::NotFound(format!("{container}/{name}")))
    }

    async fn delete_blob(&self, container: &str, name: &str) -> Result<()> {
        let mut guard = self.containers.lock();
        let removed = guard
            .get_mut(container)
            .and_then(|blobs| blobs.remove(name));
        match removed {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(format!("{container}/{name}"))),
        }
    }

    fn issue_credential(
        &self,
        resource: &str,
        kind: ResourceKind,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> Result<ScopedCredential> {
        let exists = match kind {
            ResourceKind::Queue => self.queue_exists(resource),
            ResourceKind::Container => self.container_exists(resource),
        };
        if !exists {
            return Err(StorageError::NotFound(resource.to_string()));
        }
        Ok(self.signer.issue(resource, kind, permissions, expires_at))
    }
}

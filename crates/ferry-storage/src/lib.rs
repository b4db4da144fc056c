// Durable queue/blob store seam plus an in-memory implementation.
// The broker only ever talks to `DurableStore`; real cloud backends plug in here.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ferry_common::ids::MessageId;
use std::fmt;
use std::time::Duration;

pub mod credentials;
pub mod memory;

pub use credentials::{CredentialSigner, Permissions, ResourceKind, ScopedCredential};
pub use memory::MemoryStore;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    NotFound(String),
    AlreadyExists(String),
    // The call may or may not have taken effect.
    Timeout,
    Unavailable(String),
    InvalidPayload(String),
}

impl StorageError {
    /// Transient failures are retried by callers; timeouts are ambiguous and
    /// count as transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Timeout | StorageError::Unavailable(_))
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(name) => write!(f, "not found: {name}"),
            StorageError::AlreadyExists(name) => write!(f, "already exists: {name}"),
            StorageError::Timeout => write!(f, "operation timed out"),
            StorageError::Unavailable(reason) => write!(f, "store unavailable: {reason}"),
            StorageError::InvalidPayload(reason) => write!(f, "invalid payload: {reason}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// A message pulled from a durable queue.
#[derive(Debug, Clone)]
pub struct DurableMessage {
    pub id: MessageId,
    pub queue: String,
    pub payload: Bytes,
    // Hidden from other consumers for this long after the pull.
    pub visibility_timeout: Duration,
    pub dequeue_count: u32,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Creates a queue; `AlreadyExists` when another caller won the race.
    async fn create_queue(&self, queue: &str) -> Result<()>;
    async fn create_container(&self, container: &str) -> Result<()>;
    async fn push(&self, queue: &str, payload: Bytes) -> Result<MessageId>;
    /// Pulls up to `max` visible messages and hides them for `visibility`.
    async fn pull(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<DurableMessage>>;
    async fn delete(&self, queue: &str, id: MessageId) -> Result<()>;
    async fn queue_len(&self, queue: &str) -> Result<usize>;
    async fn put_blob(&self, container: &str, name: &str, data: Bytes) -> Result<()>;
    async fn get_blob(&self, container: &str, name: &str) -> Result<Bytes>;
    async fn delete_blob(&self, container: &str, name: &str) -> Result<()>;
    fn issue_credential(
        &self,
        resource: &str,
        kind: ResourceKind,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> Result<ScopedCredential>;
}

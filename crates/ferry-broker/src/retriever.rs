use async_trait::async_trait;
use ferry_storage::{DurableMessage, DurableStore, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Source of request batches feeding the relay's local cache.
#[async_trait]
pub trait BatchRetriever: Send + Sync {
    /// Next batch of raw queue entries. An empty batch means nothing was
    /// available right now; the relay backs off before asking again.
    async fn next_batch(&self) -> Result<Vec<DurableMessage>, StorageError>;
}

/// Pulls batches from the broker's durable request queue.
///
/// Entries are removed from the queue as soon as they are handed to the
/// relay, so a request is delivered to the application at most once.
pub struct QueueRetriever {
    store: Arc<dyn DurableStore>,
    queue: String,
    batch_size: usize,
    visibility: Duration,
}

impl QueueRetriever {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queue: impl Into<String>,
        batch_size: usize,
        visibility: Duration,
    ) -> Self {
        Self {
            store,
            queue: queue.into(),
            batch_size,
            visibility,
        }
    }
}

#[async_trait]
impl BatchRetriever for QueueRetriever {
    async fn next_batch(&self) -> Result<Vec<DurableMessage>, StorageError> {
        let batch = self
            .store
            .pull(&self.queue, self.batch_size, self.visibility)
            .await?;
        for message in &batch {
            if let Err(err) = self.store.delete(&self.queue, message.id).await {
                // Stays hidden for the visibility timeout either way.
                warn!(queue = %self.queue, message_id = %message.id, error = %err, "failed to delete retrieved request");
            }
        }
        metrics::counter!("ferry_relay_retrieved_total").increment(batch.len() as u64);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ferry_storage::MemoryStore;

    #[tokio::test]
    async fn retrieved_entries_leave_the_queue() {
        let store = Arc::new(MemoryStore::new());
        store.create_queue("requests").await.expect("create");
        for i in 0..5u8 {
            store
                .push("requests", Bytes::from(vec![i]))
                .await
                .expect("push");
        }
        let retriever = QueueRetriever::new(
            store.clone(),
            "requests",
            3,
            Duration::from_secs(60),
        );

        let first = retriever.next_batch().await.expect("first");
        assert_eq!(first.len(), 3);
        assert_eq!(store.queue_len("requests").await.expect("len"), 2);

        let second = retriever.next_batch().await.expect("second");
        assert_eq!(second.len(), 2);
        assert!(retriever.next_batch().await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn missing_queue_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let retriever = QueueRetriever::new(store, "missing", 3, Duration::from_secs(1));
        assert!(matches!(
            retriever.next_batch().await,
            Err(StorageError::NotFound(_))
        ));
    }
}

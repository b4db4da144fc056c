// Send side of a client: how a request reaches the broker.
use async_trait::async_trait;
use ferry_broker::{Broker, codec};
use ferry_storage::DurableStore;
use ferry_wire::Message;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::{ClientError, Result};

#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// Transmits one request; the transport enforces `timeout`.
    async fn send(&self, message: &Message, timeout: Duration) -> Result<()>;
    /// Closes the send side; later sends fail with `ClientError::Ended`.
    async fn close_send(&self) -> Result<()>;
    /// Releases everything the transport holds.
    async fn close(&self) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

/// Pushes requests straight into the broker's durable request queue.
///
/// Requests larger than the inline limit are written to the request blob
/// container and the queue carries a reference.
pub struct DurableQueueTransport {
    store: Arc<dyn DurableStore>,
    queue: String,
    container: String,
    inline_limit: usize,
    send_closed: AtomicBool,
}

impl DurableQueueTransport {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queue: impl Into<String>,
        container: impl Into<String>,
        inline_limit: usize,
    ) -> Self {
        Self {
            store,
            queue: queue.into(),
            container: container.into(),
            inline_limit,
            send_closed: AtomicBool::new(false),
        }
    }

    /// Transport targeting `broker`'s request queue.
    pub fn for_broker(store: Arc<dyn DurableStore>, broker: &Broker) -> Self {
        Self::new(
            store,
            broker.request_queue(),
            broker.request_container(),
            broker.inline_payload_limit(),
        )
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl RequestTransport for DurableQueueTransport {
    async fn send(&self, message: &Message, timeout: Duration) -> Result<()> {
        if self.send_closed.load(Ordering::SeqCst) {
            return Err(ClientError::Ended);
        }
        let push = async {
            let payload = codec::encode_for_queue(
                self.store.as_ref(),
                &self.container,
                message,
                self.inline_limit,
            )
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
            self.store
                .push(&self.queue, payload)
                .await
                .map_err(|err| ClientError::Transport(err.to_string()))?;
            Ok::<_, ClientError>(())
        };
        tokio::time::timeout(timeout, push)
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    async fn close_send(&self) -> Result<()> {
        if !self.send_closed.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.queue, "request send side closed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.send_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.store
            .queue_len(&self.queue)
            .await
            .map(|_| ())
            .map_err(|err| ClientError::Transport(err.to_string()))
    }
}

use async_trait::async_trait;

use crate::Result;

/// Which commit round trip is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Flush,
    EndRequests,
}

impl CommitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitKind::Flush => "flush",
            CommitKind::EndRequests => "end_requests",
        }
    }
}

/// Arguments of a commit round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub count: u64,
    pub client_id: String,
    pub batch_id: u64,
    pub throttle_timeout_ms: u64,
    pub timeout_ms: u64,
}

/// Broker-side view of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerClientStatus {
    /// Accepting requests; more may follow.
    Ready,
    /// EndRequests was committed.
    EndOfRequests,
    /// Outstanding requests were discarded.
    Purged,
    Unknown,
}

/// Control endpoint of the broker.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn flush(&self, commit: CommitRequest) -> Result<()>;
    async fn end_requests(&self, commit: CommitRequest) -> Result<()>;
    async fn get_client_status(&self, client_id: &str) -> Result<BrokerClientStatus>;
    /// Requests the broker has committed for `client_id`.
    async fn get_requests_count(&self, client_id: &str) -> Result<u64>;
    async fn ping(&self) -> Result<()>;
    /// Discards everything the broker still holds for `client_id`.
    async fn purge(&self, client_id: &str) -> Result<()>;
}

impl dyn Controller {
    pub(crate) async fn commit(&self, kind: CommitKind, commit: CommitRequest) -> Result<()> {
        match kind {
            CommitKind::Flush => self.flush(commit).await,
            CommitKind::EndRequests => self.end_requests(commit).await,
        }
    }
}

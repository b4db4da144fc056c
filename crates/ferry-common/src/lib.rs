// Shared ids, configuration defaults, and small helpers used across crates.
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs to avoid mixing sessions and messages at compile time.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(SessionId);
    id_type!(MessageId);
}

/// Tag used for responses whose sender did not name a destination.
pub const DEFAULT_DESTINATION: &str = "default";

/// Request relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    // Ceiling on concurrently decoding batches.
    pub decode_workers: usize,
    // Bounded capacity of the application-facing request queue.
    pub request_queue_capacity: usize,
    // Concurrent pulls issued by the queue retriever.
    pub retrieval_concurrency: usize,
    // Max messages per pulled batch.
    pub retrieval_batch_size: usize,
    // Delay before re-polling an empty request queue.
    pub retrieval_idle_poll: Duration,
    // How long a fetched message stays hidden from other consumers.
    pub visibility_timeout: Duration,
    // Single wait slice for ReceiveRequest; timeouts loop rather than fail.
    pub request_wait: Duration,
    // Lifetime of issued scoped credentials.
    pub credential_expiry: Duration,
    // Wait applied when a queue/container create races an existing one.
    pub provision_race_wait: Duration,
    // Bodies larger than this travel through the blob container.
    pub inline_payload_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            decode_workers: 64,
            request_queue_capacity: 1024,
            retrieval_concurrency: 16,
            retrieval_batch_size: 32,
            retrieval_idle_poll: Duration::from_millis(200),
            visibility_timeout: Duration::from_secs(7 * 24 * 60 * 60),
            request_wait: Duration::from_secs(5 * 60),
            credential_expiry: Duration::from_secs(10 * 24 * 60 * 60),
            provision_race_wait: Duration::from_secs(1),
            inline_payload_limit: 48 * 1024,
        }
    }
}

/// Response sender tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    pub workers: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    // Supervisor period for the start/pause decision.
    pub check_interval: Duration,
    // Upper bound for a single durable send before it counts as a timeout.
    pub send_timeout: Duration,
    // How long close waits for in-flight sends.
    pub drain_timeout: Duration,
    // Rotate the scan start each cycle instead of first-ready in registry order.
    pub round_robin: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            workers: 1000,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            send_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            round_robin: false,
        }
    }
}

/// Client-side commit defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    pub default_timeout: Duration,
    pub send_timeout: Duration,
    // Multiplier applied to the last send timeout to derive the throttle timeout.
    pub throttle_inflation: f64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(60),
            throttle_inflation: 1.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    // Consecutive failed rounds tolerated before the broker is declared down.
    pub failure_threshold: u32,
    pub probe_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 3,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything a broker process needs, grouped per component.
///
/// ```
/// use ferry_common::BrokerSettings;
///
/// let settings = BrokerSettings::default();
/// assert_eq!(settings.sender.workers, 1000);
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub relay: RelayConfig,
    pub sender: SenderConfig,
}

impl BrokerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.relay.decode_workers == 0 {
            return Err(Error::Config("decode_workers must be > 0".into()));
        }
        if self.relay.request_queue_capacity == 0 {
            return Err(Error::Config("request_queue_capacity must be > 0".into()));
        }
        if self.relay.retrieval_concurrency == 0 || self.relay.retrieval_batch_size == 0 {
            return Err(Error::Config("retrieval settings must be > 0".into()));
        }
        if self.sender.workers == 0 {
            return Err(Error::Config("sender workers must be > 0".into()));
        }
        if self.sender.min_backoff > self.sender.max_backoff {
            return Err(Error::Config("min_backoff exceeds max_backoff".into()));
        }
        Ok(())
    }
}

// Client side of the durable relay.
//
// A `Session` is shared by every `Client` handle of one broker session. Each
// handle sends requests through a `RequestTransport` and commits them through
// the broker's `Controller`; a `HeartbeatMonitor` keeps the session's
// availability state current and interrupts commits when the broker is lost.
use std::time::Duration;

pub mod client;
pub mod controller;
pub mod heartbeat;
pub mod session;
pub mod transport;

pub use client::{Client, ClientPhase, throttle_timeout};
pub use controller::{BrokerClientStatus, CommitKind, CommitRequest, Controller};
pub use heartbeat::{
    CallbackProbe, ControllerProbe, HeartbeatMonitor, LivenessProbe, ProbeFailure, TransportProbe,
};
pub use session::{BatchIdAllocator, BrokerDownListener, Session};
pub use transport::{DurableQueueTransport, RequestTransport};

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("broker unavailable: {}", outage(.node_down))]
    BrokerUnavailable { node_down: bool },
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
    #[error("client id already attached: {0}")]
    DuplicateClientId(String),
    #[error("client handle is closed")]
    Disposed,
    #[error("client has ended its requests")]
    Ended,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("controller error: {0}")]
    Controller(String),
}

fn outage(node_down: &bool) -> &'static str {
    if *node_down {
        "broker node unreachable"
    } else {
        "broker process not responding"
    }
}

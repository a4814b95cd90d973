//! Federation between Corral instances.
//!
//! Peers found by discovery are connected through a `PeerConnector`, their
//! capability lists are imported under `<instance>:<name>` and invocations
//! of those names are forwarded to the owning peer. The HTTP client here
//! speaks the JSON surface served by `corral-server`.

pub mod aggregator;
pub mod http;
pub mod protocol;

pub use aggregator::{FederatedCapability, FederationAggregator, LOCAL_TAG};
pub use http::{HttpConnector, HttpPeer};
pub use protocol::{
    Arguments, CallRequest, CapabilityDescriptor, Envelope, Handshake, PeerClient,
    PeerConnector, PROTOCOL_VERSION,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("capability not found: {0}")]
    NotFound(String),
    #[error("peer '{0}' is disconnected")]
    Disconnected(String),
    #[error("remote invocation of '{capability}' failed: {reason}")]
    RemoteInvocationFailed { capability: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol mismatch: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

use crate::FederationError;
use corral_discovery::PeerRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Version of the JSON peer protocol; peers with a different value are
/// refused at handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Flat key/value arguments of a capability call.
pub type Arguments = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Parameter name to a short type/description string.
    #[serde(default)]
    pub parameters: Value,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Result wrapper returned by every capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub server: String,
    pub version: String,
    pub protocol: u32,
}

/// One live connection to a peer.
pub trait PeerClient: Send + Sync {
    fn handshake(&self) -> Result<Handshake, FederationError>;

    fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, FederationError>;

    /// Invoke `name` on the peer. An `Ok` envelope may still carry
    /// `success: false`.
    fn call(&self, name: &str, arguments: &Arguments) -> Result<Envelope, FederationError>;

    /// Tear the connection down. Later calls fail with `Disconnected`.
    fn close(&self);

    fn is_connected(&self) -> bool;
}

/// Opens `PeerClient`s for discovered records.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, record: &PeerRecord) -> Result<Arc<dyn PeerClient>, FederationError>;
}

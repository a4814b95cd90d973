use crate::protocol::{Arguments, CapabilityDescriptor, PeerClient, PeerConnector};
use crate::FederationError;
use corral_discovery::PeerRecord;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix a server puts on its own descriptions once it also lists remote ones.
pub const LOCAL_TAG: &str = "[local] ";

/// A remote capability as exposed locally.
#[derive(Debug, Clone, PartialEq)]
pub struct FederatedCapability {
    /// `<instance>:<original>`
    pub name: String,
    pub instance: String,
    pub original: String,
    pub descriptor: CapabilityDescriptor,
}

struct PeerEntry {
    record: PeerRecord,
    client: Arc<dyn PeerClient>,
    names: Vec<String>,
}

#[derive(Default)]
struct State {
    peers: BTreeMap<String, PeerEntry>,
    capabilities: BTreeMap<String, FederatedCapability>,
}

/// Imports peer capability sets under collision-free names and forwards
/// invocations. Every capability entry references a peer in `peers`.
pub struct FederationAggregator {
    connector: Arc<dyn PeerConnector>,
    state: RwLock<State>,
}

impl FederationAggregator {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            state: RwLock::new(State::default()),
        }
    }

    /// Connect to `record` and import its capabilities. Returns the number of
    /// capabilities the peer contributes; a peer already present is left as
    /// is. On any failure nothing is registered.
    pub fn add_peer(&self, record: &PeerRecord) -> Result<usize, FederationError> {
        if let Some(entry) = self.state.read().peers.get(&record.instance) {
            return Ok(entry.names.len());
        }

        let client = self.connector.connect(record)?;
        let fetched = client
            .handshake()
            .and_then(|hs| {
                debug!("handshake with '{}': {} {}", record.instance, hs.server, hs.version);
                client.list_capabilities()
            });
        let descriptors = match fetched {
            Ok(d) => d,
            Err(e) => {
                client.close();
                return Err(e);
            }
        };

        // Names with a ':' are the peer's own imports; taking them would
        // route calls back through the federation mesh.
        let imported: Vec<FederatedCapability> = descriptors
            .into_iter()
            .filter(|d| !d.name.contains(':'))
            .map(|d| federate(record, d))
            .collect();

        let mut state = self.state.write();
        if let Some(entry) = state.peers.get(&record.instance) {
            let count = entry.names.len();
            drop(state);
            client.close();
            return Ok(count);
        }
        let names: Vec<String> = imported.iter().map(|c| c.name.clone()).collect();
        for cap in imported {
            state.capabilities.insert(cap.name.clone(), cap);
        }
        let count = names.len();
        state.peers.insert(
            record.instance.clone(),
            PeerEntry {
                record: record.clone(),
                client,
                names,
            },
        );
        info!(
            "federated with '{}' at {} ({count} capabilities)",
            record.instance,
            record.url()
        );
        Ok(count)
    }

    /// Remove a peer and exactly its capabilities. Returns whether it was
    /// present.
    pub fn remove_peer(&self, instance: &str) -> bool {
        let entry = {
            let mut state = self.state.write();
            let Some(entry) = state.peers.remove(instance) else {
                return false;
            };
            for name in &entry.names {
                state.capabilities.remove(name);
            }
            entry
        };
        entry.client.close();
        info!("removed peer '{instance}'");
        true
    }

    /// Forward `name` to its peer and return the result data.
    pub fn invoke(&self, name: &str, arguments: &Arguments) -> Result<Value, FederationError> {
        let (client, instance, original) = {
            let state = self.state.read();
            let cap = state
                .capabilities
                .get(name)
                .ok_or_else(|| FederationError::NotFound(name.to_owned()))?;
            let peer = state
                .peers
                .get(&cap.instance)
                .ok_or_else(|| FederationError::Disconnected(cap.instance.clone()))?;
            (
                Arc::clone(&peer.client),
                cap.instance.clone(),
                cap.original.clone(),
            )
        };
        if !client.is_connected() {
            return Err(FederationError::Disconnected(instance));
        }

        debug!("forwarding '{name}' to '{instance}' as '{original}'");
        let failed = |reason: String| FederationError::RemoteInvocationFailed {
            capability: name.to_owned(),
            reason,
        };
        let envelope = client.call(&original, arguments).map_err(|e| failed(e.to_string()))?;
        if envelope.success {
            Ok(envelope.data.unwrap_or(Value::Null))
        } else {
            Err(failed(
                envelope
                    .error
                    .unwrap_or_else(|| "peer reported failure".to_owned()),
            ))
        }
    }

    /// Disconnect every peer and forget all capabilities. Repeatable.
    pub fn close(&self) {
        let peers = {
            let mut state = self.state.write();
            state.capabilities.clear();
            std::mem::take(&mut state.peers)
        };
        for (instance, entry) in peers {
            entry.client.close();
            debug!("disconnected from '{instance}'");
        }
    }

    /// Handshake with every peer and remove those that fail. Returns the
    /// removed instance names.
    pub fn prune_disconnected(&self) -> Vec<String> {
        let snapshot: Vec<(String, Arc<dyn PeerClient>)> = self
            .state
            .read()
            .peers
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.client)))
            .collect();

        let mut removed = Vec::new();
        for (instance, client) in snapshot {
            if let Err(e) = client.handshake() {
                warn!("peer '{instance}' unreachable, removing: {e}");
                if self.remove_peer(&instance) {
                    removed.push(instance);
                }
            }
        }
        removed
    }

    pub fn has_peer(&self, instance: &str) -> bool {
        self.state.read().peers.contains_key(instance)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.state
            .read()
            .peers
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.state.read().peers.len()
    }

    /// Descriptors of every imported capability, sorted by federated name.
    pub fn all_capabilities(&self) -> Vec<CapabilityDescriptor> {
        self.state
            .read()
            .capabilities
            .values()
            .map(|c| c.descriptor.clone())
            .collect()
    }

    pub fn capability(&self, name: &str) -> Option<FederatedCapability> {
        self.state.read().capabilities.get(name).cloned()
    }
}

fn federate(record: &PeerRecord, original: CapabilityDescriptor) -> FederatedCapability {
    let name = format!("{}:{}", record.instance, original.name);
    let plain = original
        .description
        .strip_prefix(LOCAL_TAG)
        .unwrap_or(&original.description);
    let description = if record.note.is_empty() {
        plain.to_owned()
    } else {
        format!("[{}] {plain}", record.note)
    };
    FederatedCapability {
        descriptor: CapabilityDescriptor {
            name: name.clone(),
            description,
            parameters: original.parameters,
        },
        name,
        instance: record.instance.clone(),
        original: original.name,
    }
}

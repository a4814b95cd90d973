//! LAN peer discovery for Corral over multicast DNS.
//!
//! Every running instance advertises itself as `_corral._tcp.local` and
//! answers queries for that service. A `Browser` sends one PTR query,
//! gathers responses for a bounded window and reduces them to a
//! deduplicated list of `PeerRecord`s. The DNS wire codec lives in `dns`
//! and has no socket dependency.

pub mod announce;
pub mod browse;
pub mod dns;
pub mod interfaces;
pub mod record;

pub use announce::{Announcer, AnnouncerConfig, MDNS_GROUP, MDNS_PORT};
pub use browse::{Browser, Cancel};
pub use interfaces::{advertised_addresses, is_physical_interface, is_routable};
pub use record::{
    default_instance_name, parse_port, sanitize_instance_name, PeerRecord, DEFAULT_ENDPOINT,
    MAX_NOTE_LEN, SERVICE_TYPE,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed DNS message: {0}")]
    Dns(#[from] dns::DnsError),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl From<nix::errno::Errno> for DiscoveryError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Io(e.into())
    }
}

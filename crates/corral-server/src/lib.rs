//! Capability dispatch and HTTP surface for a Corral instance.
//!
//! `Dispatcher` maps capability names and flat JSON arguments onto the
//! resource registry, or onto the federation aggregator for names of the
//! form `<instance>:<capability>`, and renders every outcome as an
//! `Envelope`. The `http` module serves that dispatcher to peers and
//! clients; [`TestServer`] runs it on a random port for integration tests.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod http;

pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use http::{normalize_endpoint, HttpServer, TestServer};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] corral_core::CoreError),
    #[error(transparent)]
    Runtime(#[from] corral_runtime::RuntimeError),
    #[error(transparent)]
    Federation(#[from] corral_federation::FederationError),
    #[error(transparent)]
    Discovery(#[from] corral_discovery::DiscoveryError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("HTTP server error: {0}")]
    Http(String),
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

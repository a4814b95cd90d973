//! Resource registry and process supervisor for Corral.
//!
//! The `ResourceRegistry` tracks environments, interactive sessions and
//! background processes by opaque [`Handle`], all mutated from concurrent
//! request handlers. Environments are derived from shared bases built at most
//! once per version; destroying an environment cascades to everything it owns.
//! This crate also provides the path guard used by workspace operations, the
//! on-disk storage layout, and the instance lock plus signal handling.

pub mod concurrency;
pub mod layout;
pub mod pathguard;
pub mod process;
pub mod registry;
pub mod workspace;

pub use concurrency::{install_signal_handler, wait_for_shutdown, StorageLock};
pub use layout::{default_storage_root, StorageLayout};
pub use pathguard::resolve;
pub use process::{ExitState, ManagedProcess, ProcessInfo, SpawnSpec, DEFAULT_OUTPUT_CAPACITY};
pub use registry::{
    EnvironmentInfo, ManagedEnvironment, ResourceRegistry, SessionInfo, DEFAULT_VERSION,
};
pub use workspace::{CloneInfo, FileEntry, WorkspaceInfo};

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("path escapes its base directory: {0}")]
    PathTraversal(String),
    #[error("output capture is disabled for process {0}")]
    CaptureDisabled(String),
    #[error("base build failed: {0}")]
    BuildFailed(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] corral_runtime::RuntimeError),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("storage root {} is locked by another instance", .0.display())]
    StorageLocked(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Opaque identifier for a registry entity: a random UUIDv4, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Handle {
    fn borrow(&self) -> &str {
        &self.0
    }
}

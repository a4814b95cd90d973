//! Sandbox runtime capability interface for Corral.
//!
//! The registry never builds environments itself: it drives a `SandboxRuntime`
//! through a narrow set of capabilities (build a shared base per version,
//! derive a private environment, install packages, run files, open
//! interactive sessions, export and import state). This crate defines that
//! interface plus two implementations: `HostRuntime`, backed by the host's
//! Python and `venv`, and `MockRuntime`, a deterministic in-process stand-in
//! used by tests.

pub mod backend;
pub mod host;
pub mod mock;

pub use backend::{
    parse_package_lines, select_runtime, BaseImage, FrozenState, InteractiveSession,
    PackageInfo, RuntimeEnv, SandboxRuntime, SessionKill,
};
pub use host::HostRuntime;
pub use mock::MockRuntime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("failed to build base for version {version}: {reason}")]
    BuildFailed { version: String, reason: String },
    #[error("execution failed: {message}\nOutput: {output}")]
    ExecFailed { message: String, output: String },
    #[error("interpreter not found: {0}")]
    InterpreterNotFound(String),
    #[error("interactive session is closed")]
    SessionClosed,
    #[error("invalid frozen state: {0}")]
    InvalidState(String),
}

impl RuntimeError {
    pub(crate) fn exec(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ExecFailed {
            message: message.into(),
            output: output.into(),
        }
    }
}

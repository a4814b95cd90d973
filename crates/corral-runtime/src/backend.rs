use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

/// A built, shareable base for one version tag (e.g. an interpreter install).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseImage {
    pub version: String,
    pub root: PathBuf,
    pub interpreter: PathBuf,
}

/// A private environment derived from a [`BaseImage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeEnv {
    pub version: String,
    pub root: PathBuf,
    pub interpreter: PathBuf,
    pub bin_dir: PathBuf,
}

impl RuntimeEnv {
    /// `PATH` with this environment's binary directory in front.
    pub fn search_path(&self) -> OsString {
        let mut paths = vec![self.bin_dir.clone()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).unwrap_or_else(|_| self.bin_dir.clone().into_os_string())
    }

    /// A command running this environment's interpreter with its binaries
    /// first on `PATH`.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.env("PATH", self.search_path());
        cmd
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Serialized form produced by `export_state` and consumed by `import_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrozenState {
    pub runtime: String,
    pub version: String,
    #[serde(default)]
    pub packages: Vec<PackageInfo>,
}

impl FrozenState {
    pub fn parse(serialized: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(serialized).map_err(|e| RuntimeError::InvalidState(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, RuntimeError> {
        serde_json::to_string_pretty(self).map_err(|e| RuntimeError::InvalidState(e.to_string()))
    }
}

/// Force-terminates a session without going through its `&mut` methods,
/// so a caller blocked in `execute` can be cut off from another thread.
#[derive(Clone)]
pub struct SessionKill(Arc<dyn Fn() + Send + Sync>);

impl SessionKill {
    pub fn new(kill: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(kill))
    }

    pub fn kill(&self) {
        (self.0)();
    }
}

impl std::fmt::Debug for SessionKill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKill")
    }
}

/// A stateful interpreter attached to one environment.
pub trait InteractiveSession: Send {
    /// Run `code`, keeping interpreter state between calls.
    fn execute(&mut self, code: &str) -> Result<String, RuntimeError>;

    /// Handle that aborts an in-flight `execute`. After it fires, `execute`
    /// returns `SessionClosed`.
    fn kill_switch(&self) -> SessionKill;

    fn close(&mut self) -> Result<(), RuntimeError>;
}

pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Build the shared base for `version` under `path`. Slow; the caller
    /// guarantees at most one build per version is in flight.
    fn build_shared_base(&self, version: &str, path: &Path) -> Result<BaseImage, RuntimeError>;

    fn derive_environment(&self, base: &BaseImage, path: &Path)
        -> Result<RuntimeEnv, RuntimeError>;

    fn install_packages(
        &self,
        env: &RuntimeEnv,
        packages: &[String],
        use_alternate_manager: bool,
    ) -> Result<(), RuntimeError>;

    fn install_requirements(
        &self,
        env: &RuntimeEnv,
        requirements: &Path,
        upgrade: bool,
    ) -> Result<(), RuntimeError> {
        let mut args = vec![
            "-m".to_owned(),
            "pip".to_owned(),
            "install".to_owned(),
            "-r".to_owned(),
            requirements.to_string_lossy().into_owned(),
        ];
        if upgrade {
            args.push("--upgrade".to_owned());
        }
        let mut cmd = env.command();
        cmd.args(&args);
        run_captured(cmd, "requirements install").map(|_| ())
    }

    fn list_packages(&self, env: &RuntimeEnv) -> Result<Vec<PackageInfo>, RuntimeError>;

    /// Run a script file and return its combined stdout and stderr.
    fn run_file(
        &self,
        env: &RuntimeEnv,
        path: &Path,
        args: &[String],
    ) -> Result<String, RuntimeError>;

    fn open_session(&self, env: &RuntimeEnv) -> Result<Box<dyn InteractiveSession>, RuntimeError>;

    fn export_state(&self, env: &RuntimeEnv) -> Result<String, RuntimeError>;

    fn import_state(&self, serialized: &str, path: &Path) -> Result<RuntimeEnv, RuntimeError>;
}

pub fn select_runtime(name: &str) -> Result<Box<dyn SandboxRuntime>, RuntimeError> {
    match name {
        "host" => Ok(Box::new(crate::host::HostRuntime::new())),
        "mock" => Ok(Box::new(crate::mock::MockRuntime::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

pub(crate) fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Run `cmd` to completion, returning combined output or `ExecFailed`
/// carrying that output.
pub(crate) fn run_captured(mut cmd: Command, what: &str) -> Result<String, RuntimeError> {
    let output = cmd
        .output()
        .map_err(|e| RuntimeError::exec(format!("{what}: {e}"), String::new()))?;
    let text = combined_output(&output);
    if output.status.success() {
        Ok(text)
    } else {
        Err(RuntimeError::exec(
            format!("{what} exited with {}", output.status),
            text,
        ))
    }
}

/// Parse `name==version` lines (pip freeze format); blank lines are skipped.
pub fn parse_package_lines(text: &str) -> Vec<PackageInfo> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once("==") {
            Some((name, version)) => PackageInfo {
                name: name.to_owned(),
                version: Some(version.to_owned()),
            },
            None => PackageInfo {
                name: line.to_owned(),
                version: None,
            },
        })
        .collect()
}

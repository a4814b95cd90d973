use crate::layout::{validate_version, StorageLayout};
use crate::process::{ManagedProcess, ProcessInfo, SpawnSpec, DEFAULT_OUTPUT_CAPACITY};
use crate::{pathguard, CoreError, Handle};
use chrono::{DateTime, Utc};
use corral_runtime::{
    BaseImage, InteractiveSession, PackageInfo, RuntimeEnv, SandboxRuntime, SessionKill,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_VERSION: &str = "3.11";

/// An isolated environment derived from a shared base.
pub struct ManagedEnvironment {
    handle: Handle,
    name: String,
    version: String,
    root: PathBuf,
    workspace: RwLock<Option<PathBuf>>,
    runtime_env: RuntimeEnv,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    pub env_id: Handle,
    pub name: String,
    pub version: String,
    pub env_path: PathBuf,
    pub interpreter: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl ManagedEnvironment {
    #[inline]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn runtime_env(&self) -> &RuntimeEnv {
        &self.runtime_env
    }

    pub fn workspace(&self) -> Option<PathBuf> {
        self.workspace.read().clone()
    }

    pub(crate) fn workspace_slot(&self) -> &RwLock<Option<PathBuf>> {
        &self.workspace
    }

    /// Working directory for scripts: the workspace once created, else the root.
    pub fn working_dir(&self) -> PathBuf {
        self.workspace().unwrap_or_else(|| self.root.clone())
    }

    pub fn info(&self) -> EnvironmentInfo {
        EnvironmentInfo {
            env_id: self.handle.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            env_path: self.root.clone(),
            interpreter: self.runtime_env.interpreter.clone(),
            workspace_dir: self.workspace(),
            created_at: self.created_at,
        }
    }
}

struct ManagedSession {
    handle: Handle,
    name: String,
    env_handle: Handle,
    created_at: DateTime<Utc>,
    interpreter: Mutex<Box<dyn InteractiveSession>>,
    kill: SessionKill,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Handle,
    pub name: String,
    pub env_id: Handle,
    pub created_at: DateTime<Utc>,
}

impl ManagedSession {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.handle.clone(),
            name: self.name.clone(),
            env_id: self.env_handle.clone(),
            created_at: self.created_at,
        }
    }

    /// Kill first: an `execute` in flight holds the interpreter lock until
    /// the interpreter dies.
    fn close(&self) {
        self.kill.kill();
        if let Err(e) = self.interpreter.lock().close() {
            warn!("closing session {} failed: {e}", self.handle);
        }
    }
}

#[derive(Default)]
struct Tables {
    environments: HashMap<Handle, Arc<ManagedEnvironment>>,
    sessions: HashMap<Handle, Arc<ManagedSession>>,
    processes: HashMap<Handle, Arc<ManagedProcess>>,
}

type BaseSlot = Arc<RwLock<Option<BaseImage>>>;

/// Handle-keyed registry of environments, sessions and processes.
///
/// Lock tiers, outermost first: the table lock guards only the maps and is
/// never held across runtime calls, builds, waits or filesystem teardown; a
/// per-version slot serializes base builds; each process and session has
/// its own lock.
pub struct ResourceRegistry {
    layout: StorageLayout,
    runtime: Arc<dyn SandboxRuntime>,
    tables: RwLock<Tables>,
    bases: Mutex<HashMap<String, BaseSlot>>,
    output_capacity: usize,
}

impl ResourceRegistry {
    pub fn new(layout: StorageLayout, runtime: Arc<dyn SandboxRuntime>) -> Result<Self, CoreError> {
        layout.initialize()?;
        Ok(Self {
            layout,
            runtime,
            tables: RwLock::new(Tables::default()),
            bases: Mutex::new(HashMap::new()),
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        })
    }

    /// Lines kept per captured process.
    #[must_use]
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity.max(1);
        self
    }

    #[inline]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    #[inline]
    pub fn runtime(&self) -> &dyn SandboxRuntime {
        self.runtime.as_ref()
    }

    /// Obtain the shared base for `version`, building it if this is the
    /// first request. Concurrent callers for the same version wait on that
    /// version's slot; other versions are unaffected.
    fn shared_base(&self, version: &str) -> Result<BaseImage, CoreError> {
        let slot = Arc::clone(self.bases.lock().entry(version.to_owned()).or_default());

        if let Some(base) = slot.read().clone() {
            return Ok(base);
        }
        let mut guard = slot.write();
        if let Some(base) = guard.as_ref() {
            return Ok(base.clone());
        }

        info!("building shared base for version {version}");
        let base = self
            .runtime
            .build_shared_base(version, &self.layout.base_path(version))
            .map_err(|e| CoreError::BuildFailed(e.to_string()))?;
        *guard = Some(base.clone());
        Ok(base)
    }

    // --- environments ---

    pub fn create_environment(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<EnvironmentInfo, CoreError> {
        let version = version.filter(|v| !v.is_empty()).unwrap_or(DEFAULT_VERSION);
        validate_version(version)?;

        let base = self.shared_base(version)?;
        let handle = Handle::new();
        let root = self.layout.env_path(handle.as_str());

        let runtime_env = match self.runtime.derive_environment(&base, &root) {
            Ok(env) => env,
            Err(e) => {
                remove_tree(&root);
                return Err(e.into());
            }
        };

        let env = Arc::new(ManagedEnvironment {
            name: default_name(name, "env", &handle),
            handle: handle.clone(),
            version: version.to_owned(),
            root,
            workspace: RwLock::new(None),
            runtime_env,
            created_at: Utc::now(),
        });
        let info = env.info();
        self.tables.write().environments.insert(handle, env);
        info!("created environment {} ({}) on {version}", info.env_id, info.name);
        Ok(info)
    }

    pub fn environment(&self, handle: &str) -> Result<Arc<ManagedEnvironment>, CoreError> {
        self.tables
            .read()
            .environments
            .get(handle)
            .cloned()
            .ok_or_else(|| CoreError::not_found("environment", handle))
    }

    pub fn list_environments(&self) -> Vec<EnvironmentInfo> {
        let mut list: Vec<EnvironmentInfo> = self
            .tables
            .read()
            .environments
            .values()
            .map(|e| e.info())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.env_id.cmp(&b.env_id)));
        list
    }

    /// Tear down an environment and everything it owns.
    ///
    /// The environment and its children leave the maps in one critical
    /// section, so nothing new can attach to it afterwards. If the root
    /// directory cannot be removed the environment alone is re-registered.
    pub fn destroy_environment(&self, handle: &str) -> Result<(), CoreError> {
        let (env, processes, sessions) = {
            let mut tables = self.tables.write();
            let env = tables
                .environments
                .remove(handle)
                .ok_or_else(|| CoreError::not_found("environment", handle))?;

            let processes = detach(&mut tables.processes, |p| p.env_handle().as_str() == handle);
            let sessions = detach(&mut tables.sessions, |s| s.env_handle.as_str() == handle);
            (env, processes, sessions)
        };

        for process in &processes {
            if let Err(e) = process.terminate() {
                warn!("failed to kill process {}: {e}", process.handle());
            }
        }
        for session in &sessions {
            session.close();
        }

        let dirs: Vec<PathBuf> = env.workspace().into_iter().chain([env.root.clone()]).collect();
        for dir in dirs {
            if let Err(e) = remove_dir_if_present(&dir) {
                warn!(
                    "failed to remove {}; keeping environment registered: {e}",
                    dir.display()
                );
                self.tables
                    .write()
                    .environments
                    .insert(env.handle.clone(), env);
                return Err(e.into());
            }
        }

        info!(
            "destroyed environment {handle} ({} processes, {} sessions)",
            processes.len(),
            sessions.len()
        );
        Ok(())
    }

    pub fn freeze_environment(&self, handle: &str) -> Result<String, CoreError> {
        let env = self.environment(handle)?;
        Ok(self.runtime.export_state(&env.runtime_env)?)
    }

    /// Import a frozen environment into a fresh handle.
    pub fn restore_environment(
        &self,
        name: &str,
        frozen: &str,
    ) -> Result<EnvironmentInfo, CoreError> {
        let handle = Handle::new();
        let root = self.layout.env_path(handle.as_str());
        if root.exists() {
            return Err(CoreError::AlreadyExists(root.display().to_string()));
        }

        let runtime_env = match self.runtime.import_state(frozen, &root) {
            Ok(env) => env,
            Err(e) => {
                remove_tree(&root);
                return Err(e.into());
            }
        };

        let env = Arc::new(ManagedEnvironment {
            name: default_name(name, "restored", &handle),
            handle: handle.clone(),
            version: runtime_env.version.clone(),
            root,
            workspace: RwLock::new(None),
            runtime_env,
            created_at: Utc::now(),
        });
        let info = env.info();
        self.tables.write().environments.insert(handle, env);
        info!("restored environment {} ({})", info.env_id, info.name);
        Ok(info)
    }

    // --- packages and one-shot execution ---

    pub fn install_packages(
        &self,
        handle: &str,
        packages: &[String],
        use_alternate_manager: bool,
    ) -> Result<(), CoreError> {
        if packages.is_empty() {
            return Err(CoreError::InvalidArgument("no packages given".to_owned()));
        }
        let env = self.environment(handle)?;
        self.runtime
            .install_packages(&env.runtime_env, packages, use_alternate_manager)?;
        debug!("installed {} packages into {handle}", packages.len());
        Ok(())
    }

    pub fn list_packages(&self, handle: &str) -> Result<Vec<PackageInfo>, CoreError> {
        let env = self.environment(handle)?;
        Ok(self.runtime.list_packages(&env.runtime_env)?)
    }

    /// Run `code` as a throwaway script and return its combined output.
    pub fn run_code(&self, handle: &str, code: &str) -> Result<String, CoreError> {
        let env = self.environment(handle)?;
        let mut script = tempfile::Builder::new()
            .prefix("corral-run-")
            .suffix(".py")
            .tempfile()?;
        script.write_all(code.as_bytes())?;
        script.flush()?;
        Ok(self.runtime.run_file(&env.runtime_env, script.path(), &[])?)
    }

    /// Run a script relative to the environment's working directory.
    pub fn run_script(
        &self,
        handle: &str,
        script: &str,
        args: &[String],
    ) -> Result<String, CoreError> {
        let env = self.environment(handle)?;
        let path = pathguard::resolve(&env.working_dir(), script)?;
        if !path.is_file() {
            return Err(CoreError::not_found("script", script));
        }
        Ok(self.runtime.run_file(&env.runtime_env, &path, args)?)
    }

    // --- sessions ---

    pub fn create_session(&self, env_handle: &str, name: &str) -> Result<SessionInfo, CoreError> {
        let env = self.environment(env_handle)?;
        let interpreter = self.runtime.open_session(&env.runtime_env)?;
        let kill = interpreter.kill_switch();

        let handle = Handle::new();
        let session = Arc::new(ManagedSession {
            name: default_name(name, "session", &handle),
            handle: handle.clone(),
            env_handle: env.handle.clone(),
            created_at: Utc::now(),
            interpreter: Mutex::new(interpreter),
            kill,
        });
        let info = session.info();

        {
            let mut tables = self.tables.write();
            if tables.environments.contains_key(env_handle) {
                tables.sessions.insert(handle, session);
                debug!("opened session {} in {env_handle}", info.session_id);
                return Ok(info);
            }
        }

        // The environment was destroyed while the interpreter started.
        session.close();
        Err(CoreError::not_found("environment", env_handle))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .tables
            .read()
            .sessions
            .values()
            .map(|s| s.info())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.session_id.cmp(&b.session_id)));
        list
    }

    pub fn execute(&self, session: &str, code: &str) -> Result<String, CoreError> {
        let session = self
            .tables
            .read()
            .sessions
            .get(session)
            .cloned()
            .ok_or_else(|| CoreError::not_found("session", session))?;
        let output = session.interpreter.lock().execute(code)?;
        Ok(output)
    }

    pub fn destroy_session(&self, session: &str) -> Result<(), CoreError> {
        let removed = self
            .tables
            .write()
            .sessions
            .remove(session)
            .ok_or_else(|| CoreError::not_found("session", session))?;
        removed.close();
        Ok(())
    }

    // --- processes ---

    /// Start `script` (relative to the environment's working directory) in
    /// the background.
    pub fn spawn_process(
        &self,
        env_handle: &str,
        script: &str,
        name: Option<&str>,
        args: &[String],
        capture: bool,
    ) -> Result<ProcessInfo, CoreError> {
        let env = self.environment(env_handle)?;
        let cwd = env.working_dir();
        let script_path = pathguard::resolve(&cwd, script)?;
        if !script_path.is_file() {
            return Err(CoreError::not_found("script", script));
        }

        let spec = SpawnSpec {
            script: &script_path,
            args,
            name,
            cwd: &cwd,
            capture,
            capacity: self.output_capacity,
        };
        let process = ManagedProcess::spawn(env.handle.clone(), &env.runtime_env, &spec)?;
        let info = process.info();

        {
            let mut tables = self.tables.write();
            if tables.environments.contains_key(env_handle) {
                tables.processes.insert(process.handle().clone(), process);
                info!("spawned process {} ({}) pid {}", info.process_id, info.name, info.pid);
                return Ok(info);
            }
        }

        if let Err(e) = process.terminate() {
            warn!("failed to kill orphaned process {}: {e}", process.handle());
        }
        Err(CoreError::not_found("environment", env_handle))
    }

    pub fn process(&self, handle: &str) -> Result<Arc<ManagedProcess>, CoreError> {
        self.tables
            .read()
            .processes
            .get(handle)
            .cloned()
            .ok_or_else(|| CoreError::not_found("process", handle))
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut list: Vec<ProcessInfo> = self
            .tables
            .read()
            .processes
            .values()
            .map(|p| p.info())
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.process_id.cmp(&b.process_id)));
        list
    }

    pub fn process_output(&self, handle: &str, tail: usize) -> Result<Vec<String>, CoreError> {
        self.process(handle)?.output(tail)
    }

    pub fn process_status(&self, handle: &str) -> Result<ProcessInfo, CoreError> {
        Ok(self.process(handle)?.info())
    }

    /// Kill and deregister. Blocks until the child is reaped; a process that
    /// already exited is simply deregistered.
    pub fn kill_process(&self, handle: &str) -> Result<(), CoreError> {
        let process = self.process(handle)?;
        let code = process.terminate()?;
        if self.tables.write().processes.remove(handle).is_none() {
            // A concurrent kill got there first.
            return Err(CoreError::not_found("process", handle));
        }
        info!("killed process {handle} (exit {code})");
        Ok(())
    }

    /// Stop every process and close every session. Environment directories
    /// stay on disk.
    pub fn shutdown(&self) {
        let (processes, sessions) = {
            let mut tables = self.tables.write();
            (
                std::mem::take(&mut tables.processes),
                std::mem::take(&mut tables.sessions),
            )
        };
        for process in processes.values() {
            if let Err(e) = process.terminate() {
                warn!("failed to kill process {}: {e}", process.handle());
            }
        }
        for session in sessions.values() {
            session.close();
        }
        info!(
            "registry shut down ({} processes, {} sessions)",
            processes.len(),
            sessions.len()
        );
    }
}

/// Remove and return every entry matching `owned`.
fn detach<V>(map: &mut HashMap<Handle, V>, owned: impl Fn(&V) -> bool) -> Vec<V> {
    let (taken, kept): (HashMap<_, _>, HashMap<_, _>) =
        std::mem::take(map).into_iter().partition(|(_, v)| owned(v));
    *map = kept;
    taken.into_values().collect()
}

fn default_name(name: &str, prefix: &str, handle: &Handle) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        format!("{prefix}-{}", &handle.as_str()[..8])
    } else {
        trimmed.to_owned()
    }
}

fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Best-effort cleanup of a partially created directory.
fn remove_tree(path: &Path) {
    if let Err(e) = remove_dir_if_present(path) {
        warn!("failed to clean up {}: {e}", path.display());
    }
}

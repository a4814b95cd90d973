use crate::backend::{
    run_captured, BaseImage, FrozenState, InteractiveSession, PackageInfo, RuntimeEnv,
    SandboxRuntime, SessionKill,
};
use crate::RuntimeError;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MOCK_INTERPRETER: &str = "/bin/sh";

/// Deterministic runtime for tests: bases and environments are plain
/// directories, files run under `/bin/sh`, and sessions echo their input.
pub struct MockRuntime {
    builds: AtomicUsize,
    build_delay: Duration,
    failing_versions: Mutex<HashSet<String>>,
    packages: Mutex<HashMap<PathBuf, Vec<String>>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            builds: AtomicUsize::new(0),
            build_delay: Duration::ZERO,
            failing_versions: Mutex::new(HashSet::new()),
            packages: Mutex::new(HashMap::new()),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every base build sleep for `delay`, to widen race windows in tests.
    #[must_use]
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub fn fail_builds_for(&self, version: &str) {
        self.failing_versions.lock().insert(version.to_owned());
    }

    /// Number of completed base builds.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn make_env(version: &str, path: &Path) -> Result<RuntimeEnv, RuntimeError> {
        let bin_dir = path.join("bin");
        std::fs::create_dir_all(&bin_dir)?;
        std::fs::write(path.join(".corral-mock"), format!("mock-env:{version}"))?;
        Ok(RuntimeEnv {
            version: version.to_owned(),
            root: path.to_path_buf(),
            interpreter: PathBuf::from(MOCK_INTERPRETER),
            bin_dir,
        })
    }
}

impl SandboxRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn build_shared_base(&self, version: &str, path: &Path) -> Result<BaseImage, RuntimeError> {
        if !self.build_delay.is_zero() {
            std::thread::sleep(self.build_delay);
        }
        if self.failing_versions.lock().contains(version) {
            return Err(RuntimeError::BuildFailed {
                version: version.to_owned(),
                reason: "mock build failure".to_owned(),
            });
        }
        std::fs::create_dir_all(path)?;
        std::fs::write(path.join(".corral-mock-base"), version)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(BaseImage {
            version: version.to_owned(),
            root: path.to_path_buf(),
            interpreter: PathBuf::from(MOCK_INTERPRETER),
        })
    }

    fn derive_environment(
        &self,
        base: &BaseImage,
        path: &Path,
    ) -> Result<RuntimeEnv, RuntimeError> {
        Self::make_env(&base.version, path)
    }

    fn install_packages(
        &self,
        env: &RuntimeEnv,
        packages: &[String],
        _use_alternate_manager: bool,
    ) -> Result<(), RuntimeError> {
        let mut installed = self.packages.lock();
        let list = installed.entry(env.root.clone()).or_default();
        for pkg in packages {
            if !list.contains(pkg) {
                list.push(pkg.clone());
            }
        }
        Ok(())
    }

    fn install_requirements(
        &self,
        env: &RuntimeEnv,
        requirements: &Path,
        _upgrade: bool,
    ) -> Result<(), RuntimeError> {
        let content = std::fs::read_to_string(requirements)?;
        let names: Vec<String> = crate::parse_package_lines(&content)
            .into_iter()
            .map(|p| p.name)
            .collect();
        self.install_packages(env, &names, false)
    }

    fn list_packages(&self, env: &RuntimeEnv) -> Result<Vec<PackageInfo>, RuntimeError> {
        let installed = self.packages.lock();
        Ok(installed
            .get(&env.root)
            .map(|names| {
                names
                    .iter()
                    .map(|name| PackageInfo {
                        name: name.clone(),
                        version: Some("0.0.0-mock".to_owned()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn run_file(
        &self,
        env: &RuntimeEnv,
        path: &Path,
        args: &[String],
    ) -> Result<String, RuntimeError> {
        let mut cmd = env.command();
        cmd.arg(path).args(args);
        run_captured(cmd, "script")
    }

    fn open_session(&self, env: &RuntimeEnv) -> Result<Box<dyn InteractiveSession>, RuntimeError> {
        Ok(Box::new(MockSession {
            env_root: env.root.clone(),
            executed: 0,
            killed: Arc::default(),
        }))
    }

    fn export_state(&self, env: &RuntimeEnv) -> Result<String, RuntimeError> {
        FrozenState {
            runtime: self.name().to_owned(),
            version: env.version.clone(),
            packages: self.list_packages(env)?,
        }
        .to_json()
    }

    fn import_state(&self, serialized: &str, path: &Path) -> Result<RuntimeEnv, RuntimeError> {
        let state = FrozenState::parse(serialized)?;
        let env = Self::make_env(&state.version, path)?;
        let names: Vec<String> = state.packages.into_iter().map(|p| p.name).collect();
        self.install_packages(&env, &names, false)?;
        Ok(env)
    }
}

/// Echoing session that counts executions, so tests can observe that state
/// survives between calls. Code starting with `block` parks the caller until
/// the session is killed.
struct MockSession {
    env_root: PathBuf,
    executed: usize,
    killed: Arc<(Mutex<bool>, Condvar)>,
}

impl MockSession {
    fn is_killed(&self) -> bool {
        *self.killed.0.lock()
    }
}

impl InteractiveSession for MockSession {
    fn execute(&mut self, code: &str) -> Result<String, RuntimeError> {
        if self.is_killed() {
            return Err(RuntimeError::SessionClosed);
        }
        if code.starts_with("block") {
            let (killed, changed) = &*self.killed;
            let mut killed = killed.lock();
            changed.wait_while(&mut killed, |k| !*k);
            return Err(RuntimeError::SessionClosed);
        }
        if code.contains("raise") {
            return Err(RuntimeError::exec("session execution raised", code));
        }
        self.executed += 1;
        Ok(format!(
            "mock-exec[{}] in {}: {code}",
            self.executed,
            self.env_root.display()
        ))
    }

    fn kill_switch(&self) -> SessionKill {
        let killed = Arc::clone(&self.killed);
        SessionKill::new(move || {
            let (flag, changed) = &*killed;
            *flag.lock() = true;
            changed.notify_all();
        })
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        self.kill_switch().kill();
        Ok(())
    }
}

use crate::backend::{
    run_captured, BaseImage, FrozenState, InteractiveSession, PackageInfo, RuntimeEnv,
    SandboxRuntime, SessionKill,
};
use crate::RuntimeError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

/// Interpreter loop for interactive sessions: one JSON request per line in,
/// one JSON response per line out. Expressions echo their repr.
const SESSION_DRIVER: &str = r#"
import sys, io, json, traceback, contextlib
ns = {"__name__": "__console__"}
while True:
    line = sys.stdin.readline()
    if not line:
        break
    try:
        code = json.loads(line).get("code", "")
    except ValueError:
        continue
    buf = io.StringIO()
    ok = True
    with contextlib.redirect_stdout(buf), contextlib.redirect_stderr(buf):
        try:
            try:
                compiled = compile(code, "<session>", "eval")
            except SyntaxError:
                exec(compile(code, "<session>", "exec"), ns)
            else:
                value = eval(compiled, ns)
                if value is not None:
                    print(repr(value))
        except BaseException:
            traceback.print_exc()
            ok = False
    sys.stdout.write(json.dumps({"ok": ok, "output": buf.getvalue()}) + "\n")
    sys.stdout.flush()
"#;

/// Runtime backed by the host's Python: one interpreter per version tag is
/// the shared base, environments are virtualenvs derived from it.
#[derive(Default)]
pub struct HostRuntime;

impl HostRuntime {
    pub fn new() -> Self {
        Self
    }
}

/// Find an interpreter for `version`, preferring `python<version>` and
/// falling back to `python3` when it reports the same version.
pub fn locate_interpreter(version: &str) -> Result<PathBuf, RuntimeError> {
    if let Ok(path) = which::which(format!("python{version}")) {
        return Ok(path);
    }
    if let Ok(path) = which::which("python3") {
        if interpreter_version(&path).as_deref() == Some(version) {
            return Ok(path);
        }
    }
    Err(RuntimeError::InterpreterNotFound(format!("python{version}")))
}

fn interpreter_version(interpreter: &Path) -> Option<String> {
    let output = Command::new(interpreter)
        .args(["-c", "import sys; print('%d.%d' % sys.version_info[:2])"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

fn venv_layout(root: &Path) -> (PathBuf, PathBuf) {
    let bin_dir = if cfg!(windows) {
        root.join("Scripts")
    } else {
        root.join("bin")
    };
    let interpreter = if cfg!(windows) {
        bin_dir.join("python.exe")
    } else {
        bin_dir.join("python")
    };
    (bin_dir, interpreter)
}

fn create_venv(
    base_interpreter: &Path,
    version: &str,
    path: &Path,
) -> Result<RuntimeEnv, RuntimeError> {
    let mut cmd = Command::new(base_interpreter);
    cmd.arg("-m").arg("venv").arg(path);
    run_captured(cmd, "venv creation")?;
    let (bin_dir, interpreter) = venv_layout(path);
    Ok(RuntimeEnv {
        version: version.to_owned(),
        root: path.to_path_buf(),
        interpreter,
        bin_dir,
    })
}

impl SandboxRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn available(&self) -> bool {
        which::which("python3").is_ok()
    }

    fn build_shared_base(&self, version: &str, path: &Path) -> Result<BaseImage, RuntimeError> {
        let interpreter = locate_interpreter(version).map_err(|e| RuntimeError::BuildFailed {
            version: version.to_owned(),
            reason: e.to_string(),
        })?;
        std::fs::create_dir_all(path)?;
        let base = BaseImage {
            version: version.to_owned(),
            root: path.to_path_buf(),
            interpreter,
        };
        let descriptor = serde_json::to_string_pretty(&base)
            .map_err(|e| RuntimeError::InvalidState(e.to_string()))?;
        std::fs::write(path.join("base.json"), descriptor)?;
        debug!("host base for {version} uses {}", base.interpreter.display());
        Ok(base)
    }

    fn derive_environment(
        &self,
        base: &BaseImage,
        path: &Path,
    ) -> Result<RuntimeEnv, RuntimeError> {
        create_venv(&base.interpreter, &base.version, path)
    }

    fn install_packages(
        &self,
        env: &RuntimeEnv,
        packages: &[String],
        use_alternate_manager: bool,
    ) -> Result<(), RuntimeError> {
        if packages.is_empty() {
            return Ok(());
        }
        let cmd = if use_alternate_manager {
            let uv = which::which("uv")
                .map_err(|_| RuntimeError::BackendUnavailable("uv".to_owned()))?;
            let mut cmd = Command::new(uv);
            cmd.args(["pip", "install", "--python"])
                .arg(&env.interpreter)
                .args(packages);
            cmd
        } else {
            let mut cmd = env.command();
            cmd.args(["-m", "pip", "install"]).args(packages);
            cmd
        };
        run_captured(cmd, "package install").map(|_| ())
    }

    fn list_packages(&self, env: &RuntimeEnv) -> Result<Vec<PackageInfo>, RuntimeError> {
        let mut cmd = env.command();
        cmd.args(["-m", "pip", "freeze"]);
        let text = run_captured(cmd, "pip freeze")?;
        Ok(crate::parse_package_lines(&text))
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
        Ok(Box::new(HostSession::spawn(env)?))
    }

    fn export_state(&self, env: &RuntimeEnv) -> Result<String, RuntimeError> {
        let packages = self
            .list_packages(env)?
            .into_iter()
            .filter(|p| p.version.is_some())
            .collect();
        FrozenState {
            runtime: self.name().to_owned(),
            version: env.version.clone(),
            packages,
        }
        .to_json()
    }

    fn import_state(&self, serialized: &str, path: &Path) -> Result<RuntimeEnv, RuntimeError> {
        let state = FrozenState::parse(serialized)?;
        let interpreter = locate_interpreter(&state.version)?;
        let env = create_venv(&interpreter, &state.version, path)?;
        let pins: Vec<String> = state
            .packages
            .iter()
            .map(|p| match &p.version {
                Some(v) => format!("{}=={v}", p.name),
                None => p.name.clone(),
            })
            .collect();
        self.install_packages(&env, &pins, false)?;
        Ok(env)
    }
}

#[derive(Serialize)]
struct SessionRequest<'a> {
    code: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    ok: bool,
    #[serde(default)]
    output: String,
}

/// A persistent interpreter process driven over its stdin/stdout.
pub struct HostSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    /// Set once the child is reaped; its pid may be reused after that.
    reaped: Arc<Mutex<bool>>,
}

impl HostSession {
    fn spawn(env: &RuntimeEnv) -> Result<Self, RuntimeError> {
        let mut child = env
            .command()
            .args(["-u", "-c", SESSION_DRIVER])
            .current_dir(&env.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(RuntimeError::SessionClosed);
        };
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            reaped: Arc::default(),
        })
    }
}

impl InteractiveSession for HostSession {
    fn execute(&mut self, code: &str) -> Result<String, RuntimeError> {
        let stdin = self.stdin.as_mut().ok_or(RuntimeError::SessionClosed)?;
        let mut request = serde_json::to_string(&SessionRequest { code })
            .map_err(|e| RuntimeError::InvalidState(e.to_string()))?;
        request.push('\n');
        if stdin.write_all(request.as_bytes()).and_then(|()| stdin.flush()).is_err() {
            return Err(RuntimeError::SessionClosed);
        }

        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(RuntimeError::SessionClosed);
        }
        let response: SessionResponse = serde_json::from_str(line.trim_end())
            .map_err(|e| RuntimeError::InvalidState(format!("session reply: {e}")))?;
        if response.ok {
            Ok(response.output)
        } else {
            Err(RuntimeError::exec("session execution raised", response.output))
        }
    }

    fn kill_switch(&self) -> SessionKill {
        let reaped = Arc::clone(&self.reaped);
        let pid = i32::try_from(self.child.id()).ok().map(Pid::from_raw);
        SessionKill::new(move || {
            let reaped = reaped.lock();
            if let (false, Some(pid)) = (*reaped, pid) {
                if let Err(e) = kill(pid, Signal::SIGKILL) {
                    debug!("session interpreter {pid} already gone: {e}");
                }
            }
        })
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        // Dropping stdin lets the driver exit on EOF; kill covers a busy one.
        self.stdin = None;
        let mut reaped = self.reaped.lock();
        if *reaped {
            return Ok(());
        }
        if self.child.try_wait()?.is_none() {
            if let Err(e) = self.child.kill() {
                warn!("failed to kill session interpreter: {e}");
            }
            self.child.wait()?;
        }
        *reaped = true;
        Ok(())
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_runtime_available_does_not_panic() {
        let _ = HostRuntime::new().available();
    }

    #[test]
    fn unknown_version_is_not_found() {
        let err = locate_interpreter("0.0-does-not-exist").unwrap_err();
        assert!(matches!(err, RuntimeError::InterpreterNotFound(_)));
    }

    #[test]
    fn build_for_unknown_version_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let base_dir = dir.path().join("bases/0.0");
        let err = HostRuntime::new()
            .build_shared_base("0.0-does-not-exist", &base_dir)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::BuildFailed { .. }));
        assert!(!base_dir.exists());
    }

    #[test]
    fn venv_layout_points_into_bin() {
        let (bin, interp) = venv_layout(Path::new("/envs/x"));
        assert!(interp.starts_with(&bin));
        assert!(bin.starts_with("/envs/x"));
    }

    #[test]
    fn kill_switch_interrupts_running_code() {
        let Ok(python) = which::which("python3") else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let env = RuntimeEnv {
            version: "host".to_owned(),
            root: dir.path().to_path_buf(),
            interpreter: python,
            bin_dir: dir.path().to_path_buf(),
        };
        let mut session = HostSession::spawn(&env).unwrap();
        assert_eq!(session.execute("1 + 1").unwrap().trim(), "2");

        let kill = session.kill_switch();
        let busy = std::thread::spawn(move || {
            let result = session.execute("import time\ntime.sleep(30)");
            (result, session)
        });
        std::thread::sleep(std::time::Duration::from_millis(300));
        kill.kill();
        let (result, mut session) = busy.join().unwrap();
        assert!(matches!(result, Err(RuntimeError::SessionClosed)));
        session.close().unwrap();
        kill.kill();
    }
}

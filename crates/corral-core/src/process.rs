use crate::{CoreError, Handle};
use chrono::{DateTime, Utc};
use corral_runtime::RuntimeEnv;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

/// After exit, how long `wait` holds out for capture threads to drain the
/// pipes (a grandchild may keep them open indefinitely).
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum ExitState {
    Running,
    Exited(i32),
}

struct ProcState {
    lines: VecDeque<String>,
    open_streams: usize,
    exit: ExitState,
    /// Exited and output drained (or the grace period ran out).
    settled: bool,
}

struct Shared {
    state: Mutex<ProcState>,
    changed: Condvar,
    capacity: usize,
}

impl Shared {
    fn push_line(&self, line: String) {
        let mut state = self.state.lock();
        state.lines.push_back(line);
        while state.lines.len() > self.capacity {
            state.lines.pop_front();
        }
    }

    fn stream_closed(&self) {
        let mut state = self.state.lock();
        state.open_streams = state.open_streams.saturating_sub(1);
        self.changed.notify_all();
    }
}

/// What to run for [`ManagedProcess::spawn`].
pub struct SpawnSpec<'a> {
    pub script: &'a Path,
    pub args: &'a [String],
    pub name: Option<&'a str>,
    pub cwd: &'a Path,
    pub capture: bool,
    pub capacity: usize,
}

/// One supervised child process.
///
/// The monitor thread is the only writer of the exit state. It reaps the
/// child while holding the state lock, so a signal sent under that lock
/// never reaches a recycled pid, then flips `Running` to `Exited` once and
/// wakes every waiter.
pub struct ManagedProcess {
    handle: Handle,
    name: String,
    env_handle: Handle,
    pid: u32,
    started_at: DateTime<Utc>,
    capture: bool,
    shared: Arc<Shared>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub process_id: Handle,
    pub name: String,
    pub env_id: Handle,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub capture_output: bool,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ManagedProcess {
    /// Start the script under the environment's interpreter. Nothing is left
    /// running if this returns an error.
    pub fn spawn(
        env_handle: Handle,
        env: &RuntimeEnv,
        spec: &SpawnSpec<'_>,
    ) -> Result<Arc<Self>, CoreError> {
        let name = match spec.name {
            Some(n) if !n.is_empty() => n.to_owned(),
            _ => spec
                .script
                .file_name()
                .map_or_else(|| "process".to_owned(), |n| n.to_string_lossy().into_owned()),
        };

        let mut cmd = env.command();
        cmd.arg(spec.script)
            .args(spec.args)
            .current_dir(spec.cwd)
            .stdin(Stdio::null());
        if spec.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let shared = Arc::new(Shared {
            state: Mutex::new(ProcState {
                lines: VecDeque::new(),
                open_streams: 0,
                exit: ExitState::Running,
                settled: false,
            }),
            changed: Condvar::new(),
            capacity: spec.capacity.max(1),
        });

        if spec.capture {
            let streams: [Option<Box<dyn Read + Send>>; 2] = [
                child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
                child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            ];
            for (label, stream) in ["stdout", "stderr"].into_iter().zip(streams) {
                let Some(stream) = stream else { continue };
                shared.state.lock().open_streams += 1;
                let sink = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("corral-{label}-{pid}"))
                    .spawn(move || capture_lines(stream, &sink));
                if let Err(e) = spawned {
                    shared.stream_closed();
                    warn!("no {label} capture for pid {pid}: {e}");
                }
            }
        }

        let monitor_state = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("corral-wait-{pid}"))
            .spawn(move || monitor(child, &monitor_state))
            .inspect_err(|_| {
                // The child moved into the failed closure; make sure it does not outlive us.
                let _ = signal_pid(pid);
            })?;

        debug!("spawned {name} as pid {pid}");
        Ok(Arc::new(Self {
            handle: Handle::new(),
            name,
            env_handle,
            pid,
            started_at: Utc::now(),
            capture: spec.capture,
            shared,
        }))
    }

    #[inline]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    #[inline]
    pub fn env_handle(&self) -> &Handle {
        &self.env_handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Snapshot of the exit state; never blocks on the child.
    pub fn status(&self) -> ExitState {
        self.shared.state.lock().exit
    }

    /// Captured lines in order; only the last `tail` when `tail > 0`.
    pub fn output(&self, tail: usize) -> Result<Vec<String>, CoreError> {
        if !self.capture {
            return Err(CoreError::CaptureDisabled(self.handle.to_string()));
        }
        let state = self.shared.state.lock();
        let skip = if tail > 0 {
            state.lines.len().saturating_sub(tail)
        } else {
            0
        };
        Ok(state.lines.iter().skip(skip).cloned().collect())
    }

    /// Block until the child has exited and its output is final.
    pub fn wait(&self) -> i32 {
        let mut state = self.shared.state.lock();
        loop {
            if let (ExitState::Exited(code), true) = (state.exit, state.settled) {
                return code;
            }
            self.shared.changed.wait(&mut state);
        }
    }

    /// SIGKILL the child and block until it is reaped. Returns immediately
    /// if it already exited.
    pub fn terminate(&self) -> Result<i32, CoreError> {
        {
            let state = self.shared.state.lock();
            if let ExitState::Exited(code) = state.exit {
                return Ok(code);
            }
            signal_pid(self.pid)?;
        }
        Ok(self.wait())
    }

    pub fn info(&self) -> ProcessInfo {
        let exit = self.status();
        ProcessInfo {
            process_id: self.handle.clone(),
            name: self.name.clone(),
            env_id: self.env_handle.clone(),
            pid: self.pid,
            started_at: self.started_at,
            capture_output: self.capture,
            running: exit == ExitState::Running,
            exit_code: match exit {
                ExitState::Exited(code) => Some(code),
                ExitState::Running => None,
            },
        }
    }
}

fn signal_pid(pid: u32) -> Result<(), CoreError> {
    let raw = i32::try_from(pid)
        .map_err(|_| CoreError::InvalidArgument(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(CoreError::Io(e.into())),
    }
}

fn capture_lines(stream: impl Read, shared: &Shared) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                shared.push_line(text.trim_end_matches(['\n', '\r']).to_owned());
            }
        }
    }
    shared.stream_closed();
}

/// Block until `pid` has exited without reaping it.
fn wait_for_exit(pid: u32) -> nix::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    loop {
        match waitid(
            Id::Pid(Pid::from_raw(raw)),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
        ) {
            Err(Errno::EINTR) => {}
            other => return other.map(drop),
        }
    }
}

fn monitor(mut child: Child, shared: &Shared) {
    let pid = child.id();
    let exited = match wait_for_exit(pid) {
        Ok(()) => None,
        Err(e) => {
            debug!("waitid on pid {pid} failed, reaping directly: {e}");
            Some(child.wait())
        }
    };

    let mut state = shared.state.lock();
    let code = match exited.unwrap_or_else(|| child.wait()) {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!("wait on pid {pid} failed: {e}");
            -1
        }
    };
    state.exit = ExitState::Exited(code);
    shared.changed.notify_all();

    let drained = !shared
        .changed
        .wait_while_for(&mut state, |s| s.open_streams > 0, DRAIN_GRACE)
        .timed_out();
    if !drained {
        debug!("pid {pid} exited with output pipes still open");
    }
    state.settled = true;
    shared.changed.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh_env(dir: &Path) -> RuntimeEnv {
        RuntimeEnv {
            version: "test".to_owned(),
            root: dir.to_path_buf(),
            interpreter: PathBuf::from("/bin/sh"),
            bin_dir: dir.join("bin"),
        }
    }

    fn spawn_script(
        dir: &Path,
        body: &str,
        capture: bool,
        capacity: usize,
    ) -> Arc<ManagedProcess> {
        let script = dir.join("job.sh");
        std::fs::write(&script, body).unwrap();
        let spec = SpawnSpec {
            script: &script,
            args: &[],
            name: None,
            cwd: dir,
            capture,
            capacity,
        };
        ManagedProcess::spawn(Handle::new(), &sh_env(dir), &spec).unwrap()
    }

    #[test]
    fn three_line_script_exits_zero_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn_script(dir.path(), "echo one\necho two\necho three\n", true, 1000);

        assert_eq!(proc.wait(), 0);
        assert_eq!(proc.output(2).unwrap(), vec!["two", "three"]);
        assert_eq!(proc.output(0).unwrap().len(), 3);
        assert_eq!(proc.name(), "job.sh");
    }

    #[test]
    fn buffer_keeps_last_capacity_lines() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn_script(
            dir.path(),
            "i=1\nwhile [ $i -le 25 ]; do echo line$i; i=$((i+1)); done\n",
            true,
            10,
        );

        assert_eq!(proc.wait(), 0);
        let lines = proc.output(0).unwrap();
        assert_eq!(lines.len(), 10);
        let expected: Vec<String> = (16..=25).map(|i| format!("line{i}")).collect();
        assert_eq!(lines, expected);
    }

    #[test]
    fn exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn_script(dir.path(), "exit 7\n", true, 10);
        assert_eq!(proc.wait(), 7);
        assert_eq!(proc.status(), ExitState::Exited(7));
        assert!(!proc.info().running);
    }

    #[test]
    fn terminate_kills_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn_script(dir.path(), "exec sleep 30\n", false, 10);
        assert_eq!(proc.status(), ExitState::Running);

        assert_eq!(proc.terminate().unwrap(), -1);
        assert_eq!(proc.status(), ExitState::Exited(-1));
        // Already exited: returns without signalling.
        assert_eq!(proc.terminate().unwrap(), -1);
    }

    #[test]
    fn capture_disabled_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn_script(dir.path(), "echo hidden\n", false, 10);
        proc.wait();
        assert!(matches!(proc.output(0), Err(CoreError::CaptureDisabled(_))));
    }

    #[test]
    fn stderr_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn_script(dir.path(), "echo err >&2\n", true, 10);
        proc.wait();
        assert_eq!(proc.output(0).unwrap(), vec!["err"]);
    }

    #[test]
    fn missing_interpreter_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = sh_env(dir.path());
        env.interpreter = dir.path().join("no-such-interpreter");
        let script = dir.path().join("x.sh");
        let spec = SpawnSpec {
            script: &script,
            args: &[],
            name: Some("x"),
            cwd: dir.path(),
            capture: true,
            capacity: 10,
        };
        assert!(ManagedProcess::spawn(Handle::new(), &env, &spec).is_err());
    }

    #[test]
    fn exit_is_visible_while_a_grandchild_holds_the_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn_script(dir.path(), "sleep 5 &\necho x\nexit 0\n", true, 10);

        let deadline = std::time::Instant::now() + Duration::from_millis(1500);
        while proc.status() == ExitState::Running && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(proc.status(), ExitState::Exited(0));
        assert!(!proc.info().running);

        // Reaped already, so this must not signal the old pid.
        assert_eq!(proc.terminate().unwrap(), 0);
        assert_eq!(proc.wait(), 0);
        assert_eq!(proc.output(0).unwrap(), vec!["x"]);
    }
}

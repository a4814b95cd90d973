use corral_core::{CoreError, ExitState, ResourceRegistry, StorageLayout};
use corral_runtime::MockRuntime;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

type Fixture = (tempfile::TempDir, Arc<ResourceRegistry>, Arc<MockRuntime>);

fn registry_with(runtime: MockRuntime, capacity: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(runtime);
    let reg = ResourceRegistry::new(StorageLayout::new(dir.path()), runtime.clone())
        .unwrap()
        .with_output_capacity(capacity);
    (dir, Arc::new(reg), runtime)
}

fn env_with_script(reg: &ResourceRegistry, script: &str, body: &str) -> String {
    let env = reg.create_environment("itest", None).unwrap();
    let id = env.env_id.to_string();
    reg.workspace_create(&id).unwrap();
    reg.workspace_write_file(&id, script, body).unwrap();
    id
}

#[test]
fn destroy_cascades_to_children() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    let env_id = env_with_script(&reg, "sleep.sh", "exec sleep 30\n");
    let env_root = reg.environment(&env_id).unwrap().root().to_path_buf();

    let proc = reg
        .spawn_process(&env_id, "sleep.sh", None, &[], true)
        .unwrap();
    let process = reg.process(proc.process_id.as_str()).unwrap();
    reg.create_session(&env_id, "repl").unwrap();
    assert_eq!(reg.list_processes().len(), 1);
    assert_eq!(reg.list_sessions().len(), 1);

    reg.destroy_environment(&env_id).unwrap();

    assert!(matches!(
        reg.environment(&env_id),
        Err(CoreError::NotFound { .. })
    ));
    assert!(reg.list_processes().is_empty());
    assert!(reg.list_sessions().is_empty());
    assert!(!env_root.exists());
    assert_eq!(process.status(), ExitState::Exited(-1));

    assert!(matches!(
        reg.destroy_environment(&env_id),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn destroy_leaves_other_environments_alone() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    let doomed = env_with_script(&reg, "s.sh", "exec sleep 30\n");
    let kept = env_with_script(&reg, "s.sh", "exec sleep 30\n");
    reg.spawn_process(&doomed, "s.sh", None, &[], false).unwrap();
    let survivor = reg.spawn_process(&kept, "s.sh", None, &[], false).unwrap();

    reg.destroy_environment(&doomed).unwrap();

    let listed = reg.list_processes();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].process_id, survivor.process_id);
    assert!(listed[0].running);
    reg.shutdown();
}

#[test]
fn concurrent_creates_share_one_build() {
    let (_dir, reg, runtime) =
        registry_with(MockRuntime::new().with_build_delay(Duration::from_millis(200)), 100);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let reg = Arc::clone(&reg);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                reg.create_environment(&format!("env{i}"), Some("3.11"))
            })
        })
        .collect();

    for h in handles {
        assert!(h.join().unwrap().is_ok());
    }
    assert_eq!(runtime.build_count(), 1);
    assert_eq!(reg.list_environments().len(), 8);
}

#[test]
fn different_versions_build_in_parallel() {
    let delay = Duration::from_millis(400);
    let (_dir, reg, runtime) = registry_with(MockRuntime::new().with_build_delay(delay), 100);
    let barrier = Arc::new(Barrier::new(2));
    let start = Instant::now();

    let handles: Vec<_> = ["3.10", "3.12"]
        .into_iter()
        .map(|v| {
            let reg = Arc::clone(&reg);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                reg.create_environment("v", Some(v))
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap().is_ok());
    }

    assert_eq!(runtime.build_count(), 2);
    assert!(
        start.elapsed() < delay * 2,
        "builds for different versions serialized: {:?}",
        start.elapsed()
    );
}

#[test]
fn failed_build_is_retried_by_next_caller() {
    let (_dir, reg, runtime) = registry_with(MockRuntime::new(), 100);
    runtime.fail_builds_for("3.9");
    assert!(reg.create_environment("a", Some("3.9")).is_err());
    assert!(reg.create_environment("b", Some("3.9")).is_err());
    assert_eq!(runtime.build_count(), 0);
}

#[test]
fn output_buffer_is_bounded() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 5);
    let env_id = env_with_script(
        &reg,
        "lines.sh",
        "i=1\nwhile [ $i -le 12 ]; do echo \"line $i\"; i=$((i+1)); done\n",
    );

    let info = reg
        .spawn_process(&env_id, "lines.sh", Some("counter"), &[], true)
        .unwrap();
    assert_eq!(info.name, "counter");
    let id = info.process_id.to_string();
    assert_eq!(reg.process(&id).unwrap().wait(), 0);

    let lines = reg.process_output(&id, 0).unwrap();
    assert_eq!(
        lines,
        vec!["line 8", "line 9", "line 10", "line 11", "line 12"]
    );
}

#[test]
fn three_line_script_end_to_end() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 1000);
    let env_id = env_with_script(&reg, "three.sh", "echo alpha\necho beta\necho gamma\n");

    let info = reg
        .spawn_process(&env_id, "three.sh", None, &[], true)
        .unwrap();
    assert_eq!(info.name, "three.sh");
    let id = info.process_id.to_string();

    assert_eq!(reg.process(&id).unwrap().wait(), 0);
    let status = reg.process_status(&id).unwrap();
    assert!(!status.running);
    assert_eq!(status.exit_code, Some(0));
    assert_eq!(reg.process_output(&id, 2).unwrap(), vec!["beta", "gamma"]);
}

#[test]
fn kill_twice_reports_not_found() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    let env_id = env_with_script(&reg, "sleep.sh", "exec sleep 30\n");
    let id = reg
        .spawn_process(&env_id, "sleep.sh", None, &[], false)
        .unwrap()
        .process_id
        .to_string();

    reg.kill_process(&id).unwrap();
    assert!(matches!(
        reg.kill_process(&id),
        Err(CoreError::NotFound { .. })
    ));
    assert!(reg.list_processes().is_empty());
}

#[test]
fn kill_after_natural_exit_does_not_block() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    let env_id = env_with_script(&reg, "quick.sh", "exit 3\n");
    let id = reg
        .spawn_process(&env_id, "quick.sh", None, &[], true)
        .unwrap()
        .process_id
        .to_string();
    assert_eq!(reg.process(&id).unwrap().wait(), 3);

    let start = Instant::now();
    reg.kill_process(&id).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn spawn_requires_live_environment_and_existing_script() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    assert!(matches!(
        reg.spawn_process("missing", "x.sh", None, &[], true),
        Err(CoreError::NotFound { .. })
    ));

    let env_id = env_with_script(&reg, "x.sh", "true\n");
    assert!(matches!(
        reg.spawn_process(&env_id, "nope.sh", None, &[], true),
        Err(CoreError::NotFound { .. })
    ));
    assert!(matches!(
        reg.spawn_process(&env_id, "../../x.sh", None, &[], true),
        Err(CoreError::PathTraversal(_))
    ));
    assert!(reg.list_processes().is_empty());
}

#[test]
fn shutdown_stops_children_but_keeps_directories() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    let env_id = env_with_script(&reg, "sleep.sh", "exec sleep 30\n");
    let id = reg
        .spawn_process(&env_id, "sleep.sh", None, &[], false)
        .unwrap()
        .process_id
        .to_string();
    let process = reg.process(&id).unwrap();
    reg.create_session(&env_id, "s").unwrap();

    reg.shutdown();

    assert_eq!(process.status(), ExitState::Exited(-1));
    assert!(reg.list_processes().is_empty());
    assert!(reg.list_sessions().is_empty());
    assert!(reg.environment(&env_id).unwrap().root().is_dir());
}

#[test]
fn concurrent_spawn_and_destroy_leave_no_orphans() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    for _ in 0..5 {
        let env_id = env_with_script(&reg, "sleep.sh", "exec sleep 30\n");
        let spawner = {
            let reg = Arc::clone(&reg);
            let env_id = env_id.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    let _ = reg.spawn_process(&env_id, "sleep.sh", None, &[], false);
                }
            })
        };
        let _ = reg.destroy_environment(&env_id);
        spawner.join().unwrap();
        // Whatever won the race, nothing may stay registered for a destroyed environment.
        if reg.environment(&env_id).is_err() {
            assert!(reg
                .list_processes()
                .iter()
                .all(|p| p.env_id.as_str() != env_id));
        }
    }
    reg.shutdown();
}

/// Start a blocking execute on a fresh session and wait until it is parked.
fn busy_session(reg: &Arc<ResourceRegistry>, env_id: &str) -> thread::JoinHandle<bool> {
    let session = reg.create_session(env_id, "busy").unwrap();
    let reg = Arc::clone(reg);
    let handle = thread::spawn(move || reg.execute(session.session_id.as_str(), "block").is_err());
    thread::sleep(Duration::from_millis(200));
    handle
}

fn finishes_within(timeout: Duration, work: impl FnOnce() + Send + 'static) -> bool {
    let (tx, rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        work();
        let _ = tx.send(());
    });
    rx.recv_timeout(timeout).is_ok()
}

#[test]
fn destroy_environment_cuts_off_running_execute() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    let env_id = reg.create_environment("busy", None).unwrap().env_id.to_string();
    let execute = busy_session(&reg, &env_id);

    let destroyer = Arc::clone(&reg);
    let id = env_id.clone();
    assert!(finishes_within(Duration::from_secs(5), move || {
        destroyer.destroy_environment(&id).unwrap();
    }));
    assert!(execute.join().unwrap());
    assert!(reg.list_sessions().is_empty());
    assert!(reg.environment(&env_id).is_err());
}

#[test]
fn destroy_session_and_shutdown_cut_off_running_execute() {
    let (_dir, reg, _) = registry_with(MockRuntime::new(), 100);
    let env_id = reg.create_environment("busy", None).unwrap().env_id.to_string();

    let first = busy_session(&reg, &env_id);
    let session_id = reg.list_sessions()[0].session_id.to_string();
    let r = Arc::clone(&reg);
    assert!(finishes_within(Duration::from_secs(5), move || {
        r.destroy_session(&session_id).unwrap();
    }));
    assert!(first.join().unwrap());

    let second = busy_session(&reg, &env_id);
    let r = Arc::clone(&reg);
    assert!(finishes_within(Duration::from_secs(5), move || r.shutdown()));
    assert!(second.join().unwrap());
    assert!(reg.list_sessions().is_empty());
}

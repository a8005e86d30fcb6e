// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lifecycle integration tests.
//!
//! Every test drives real ComputeSystem and Process objects against the
//! simulated host, which delivers notifications from its own thread.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use uuid::Uuid;

use hostcompute_core::{
    create_container, open_container, ComputeError, ComputeSystem, ConfigLoader, ContainerId,
    ContainerSettings, HandleKind, Hcs, LayerDescriptor, NotificationKind, NotificationWatcher,
    ProcessScript, ProcessStartInfo, ResultCode, SimOp, SimulatedHcs, SystemState,
};

const LONG: Duration = Duration::from_secs(10);

fn settings() -> ContainerSettings {
    ContainerSettings {
        sandbox_path: PathBuf::from("/sandboxes/test"),
        layers: vec![LayerDescriptor {
            id: Uuid::new_v4(),
            path: PathBuf::from("/layers/base"),
        }],
        kill_on_close: true,
        dispose_timeout: Duration::from_millis(300),
        ..ContainerSettings::default()
    }
}

fn id(name: &str) -> ContainerId {
    ContainerId::new(name).unwrap()
}

fn created(sim: &Arc<SimulatedHcs>, name: &str) -> ComputeSystem {
    create_container(sim.clone(), id(name), &settings()).unwrap()
}

fn started(sim: &Arc<SimulatedHcs>, name: &str) -> ComputeSystem {
    let system = created(sim, name);
    system.start().unwrap();
    system
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + LONG;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

// =============================================================================
// Compute system
// =============================================================================

#[test]
fn test_start_then_shutdown() {
    let sim = SimulatedHcs::new_shared();
    let system = started(&sim, "start-stop");

    assert_eq!(system.state(), SystemState::Running);
    assert!(sim.is_running(&id("start-stop")));
    assert_eq!(sim.calls(SimOp::StartSystem), 1);

    assert!(system.shutdown(Some(LONG)).unwrap());
    assert_eq!(system.state(), SystemState::Exited);
    assert!(system.is_dead());
    assert_eq!(sim.calls(SimOp::ShutdownSystem), 1);

    drop(system);
    assert_eq!(sim.calls(SimOp::TerminateSystem), 0);
    assert_eq!(sim.open_handles(), 0);
    assert_eq!(sim.subscriptions(), 0);
}

#[test]
fn test_second_start_issues_no_request() {
    let sim = SimulatedHcs::new_shared();
    let system = started(&sim, "twice");

    system.start().unwrap();
    assert_eq!(sim.calls(SimOp::StartSystem), 1);
}

#[test]
fn test_created_configuration_reaches_host() {
    let sim = SimulatedHcs::new_shared();
    let _system = created(&sim, "configured");

    let config = sim.system_config(&id("configured")).unwrap();
    assert_eq!(config.layer_folder_path, "/sandboxes/test");
    assert_eq!(config.layers.len(), 1);
    assert!(config.terminate_on_last_handle_closed);
    assert!(config.network_endpoints.is_empty());
}

#[test]
fn test_create_failure_propagates_without_kill() {
    let sim = SimulatedHcs::new_shared();
    let denied = ResultCode(0x8007_0005_u32 as i32);
    sim.fail_completion(SimOp::CreateSystem, denied, Some("access denied"));

    let err = create_container(sim.clone(), id("denied"), &settings()).unwrap_err();
    let hcs = err.as_hcs().expect("host error");
    assert_eq!(hcs.code, denied);
    assert_eq!(hcs.detail.as_deref(), Some("access denied"));

    assert_eq!(sim.calls(SimOp::TerminateSystem), 0);
    assert_eq!(sim.open_handles(), 0);
}

#[test]
fn test_synchronous_create_failure() {
    let sim = SimulatedHcs::new_shared();
    let _first = created(&sim, "dup");

    let err = create_container(sim.clone(), id("dup"), &settings()).unwrap_err();
    assert_eq!(
        err.as_hcs().map(|e| e.code),
        Some(ResultCode::SYSTEM_ALREADY_EXISTS)
    );
}

#[test]
fn test_kill_is_idempotent_across_threads() {
    const THREADS: usize = 8;
    let sim = SimulatedHcs::new_shared();
    let system = Arc::new(started(&sim, "kill-many"));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let system = Arc::clone(&system);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                system.kill()
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(sim.calls(SimOp::TerminateSystem), 1);
    assert!(system.is_dead());
    assert_eq!(system.state(), SystemState::Exited);
}

#[test]
fn test_dispose_after_exit_is_prompt() {
    let sim = SimulatedHcs::new_shared();
    let system = started(&sim, "gone");

    sim.exit_system(&id("gone"));
    let begin = Instant::now();
    drop(system);

    assert!(begin.elapsed() < Duration::from_secs(1));
    assert!(sim.calls(SimOp::TerminateSystem) <= 1);
    assert_eq!(sim.open_handles(), 0);
}

#[test]
fn test_dispose_is_bounded_when_exit_never_arrives() {
    let sim = SimulatedHcs::new_shared();
    sim.hold(SimOp::TerminateSystem);
    let system = started(&sim, "stuck");

    let begin = Instant::now();
    system.dispose();
    let elapsed = begin.elapsed();

    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(sim.calls(SimOp::TerminateSystem), 1);
    assert_eq!(sim.subscriptions(), 0);
    assert_eq!(sim.open_handles(), 0);

    // Later calls do nothing.
    system.dispose();
    assert_eq!(sim.calls(SimOp::TerminateSystem), 1);
}

#[test]
fn test_shutdown_timeout_leaves_system_killable() {
    let sim = SimulatedHcs::new_shared();
    sim.hold(SimOp::ShutdownSystem);
    let system = started(&sim, "slow");

    assert!(!system.shutdown(Some(Duration::from_millis(100))).unwrap());
    assert!(!system.is_dead());
    assert_eq!(system.state(), SystemState::ShuttingDown);

    drop(system);
    assert_eq!(sim.calls(SimOp::TerminateSystem), 1);
}

#[test]
fn test_exit_during_start_is_unexpected_exit() {
    let sim = SimulatedHcs::new_shared();
    sim.hold(SimOp::StartSystem);
    let system = Arc::new(created(&sim, "crashy"));

    let starter = {
        let system = Arc::clone(&system);
        thread::spawn(move || system.start())
    };
    wait_until(|| sim.calls(SimOp::StartSystem) == 1);
    // Let the start request be accepted before the system goes away.
    thread::sleep(Duration::from_millis(20));
    sim.exit_system(&id("crashy"));

    let err = starter.join().unwrap().unwrap_err();
    assert!(err.as_hcs().is_some_and(|e| e.is_unexpected_exit()));
}

#[test]
fn test_start_can_be_retried_after_failure() {
    let sim = SimulatedHcs::new_shared();
    let system = created(&sim, "retry");
    sim.fail_completion(SimOp::StartSystem, ResultCode(0x8000_4005_u32 as i32), None);

    assert!(system.start().is_err());
    assert_eq!(system.state(), SystemState::Created);

    system.start().unwrap();
    assert_eq!(system.state(), SystemState::Running);
    assert_eq!(sim.calls(SimOp::StartSystem), 2);
}

#[test]
fn test_disconnect_aborts_start_wait() {
    let sim = SimulatedHcs::new_shared();
    sim.hold(SimOp::StartSystem);
    let system = Arc::new(created(&sim, "cut"));

    let starter = {
        let system = Arc::clone(&system);
        thread::spawn(move || system.start())
    };
    wait_until(|| sim.calls(SimOp::StartSystem) == 1);
    sim.disconnect_system(&id("cut"));

    let err = starter.join().unwrap().unwrap_err();
    assert!(err.as_hcs().is_some_and(|e| e.is_aborted()));
}

#[test]
fn test_open_container() {
    let sim = SimulatedHcs::new_shared();

    let missing = open_container(sim.clone(), id("nowhere")).unwrap_err();
    assert!(matches!(missing, ComputeError::SystemNotFound(_)));

    let original = started(&sim, "shared");
    let opened = open_container(sim.clone(), id("shared")).unwrap();
    assert_eq!(opened.state(), SystemState::Created);

    // An opened system never kills on close.
    drop(opened);
    assert_eq!(sim.calls(SimOp::TerminateSystem), 0);
    assert!(sim.is_running(&id("shared")));
    drop(original);
}

#[test]
fn test_shutdown_of_already_stopped_system_skips_wait() {
    let sim = SimulatedHcs::new_shared();
    let first = started(&sim, "stopped");
    sim.exit_system(&id("stopped"));
    wait_until(|| !sim.is_running(&id("stopped")));

    // A fresh handle has no exit notification to wait for.
    let opened = open_container(sim.clone(), id("stopped")).unwrap();
    let begin = Instant::now();
    assert!(opened.shutdown(None).unwrap());
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert!(opened.is_dead());
    assert_eq!(opened.state(), SystemState::Exited);
    assert_eq!(sim.calls(SimOp::ShutdownSystem), 1);

    drop(opened);
    drop(first);
    assert_eq!(sim.calls(SimOp::TerminateSystem), 0);
}

// =============================================================================
// Process
// =============================================================================

#[test]
fn test_process_end_to_end() {
    let sim = SimulatedHcs::new_shared();
    sim.script(
        "cmd /c echo hello",
        ProcessScript::exits_with(0).with_stdout("\u{feff}hello\r\n"),
    );
    let system = started(&sim, "e2e");

    let info = ProcessStartInfo {
        redirect_stdout: true,
        ..ProcessStartInfo::new("cmd /c echo hello")
    };
    let process = system.create_process(&info).unwrap();

    let mut stdout = process.take_stdout().expect("redirected stdout");
    assert_eq!(stdout.read_all().unwrap(), "hello\r\n");
    assert!(process.take_stdin().is_none());

    assert!(process.wait_for_exit(Some(LONG)).unwrap());
    assert!(process.has_exited());
    assert_eq!(process.exit_code().unwrap(), 0);

    let parameters = sim.process_parameters(process.id()).unwrap();
    assert!(parameters.create_std_out_pipe);
    assert!(!parameters.create_std_in_pipe);
}

#[test]
fn test_exit_code_requires_observed_exit() {
    let sim = SimulatedHcs::new_shared();
    sim.script("exit3", ProcessScript::exits_with(3));
    let system = started(&sim, "code");

    let process = system
        .create_process(&ProcessStartInfo::new("exit3"))
        .unwrap();
    assert!(matches!(
        process.exit_code(),
        Err(ComputeError::InvalidState { .. })
    ));

    assert!(process.wait_for_exit(Some(LONG)).unwrap());
    assert_eq!(process.exit_code().unwrap(), 3);
}

#[test]
fn test_negative_exit_code() {
    let sim = SimulatedHcs::new_shared();
    sim.script("fail", ProcessScript::exits_with(u32::MAX));
    let system = started(&sim, "negative");

    let process = system.create_process(&ProcessStartInfo::new("fail")).unwrap();
    assert!(process.wait_for_exit(Some(LONG)).unwrap());
    assert_eq!(process.exit_code().unwrap(), -1);
}

#[test]
fn test_wait_for_exit_with_unrepresentable_deadline() {
    let sim = SimulatedHcs::new_shared();
    sim.script("quick", ProcessScript::exits_with(0));
    let system = started(&sim, "forever");

    let process = system.create_process(&ProcessStartInfo::new("quick")).unwrap();
    assert!(process.wait_for_exit(Some(Duration::MAX)).unwrap());
    assert_eq!(process.exit_code().unwrap(), 0);

    assert!(system.shutdown(Some(Duration::MAX)).unwrap());
    assert_eq!(system.state(), SystemState::Exited);
}

#[test]
fn test_wait_for_exit_times_out() {
    let sim = SimulatedHcs::new_shared();
    sim.script("sleep", ProcessScript::runs_forever());
    let system = started(&sim, "timeout");

    let process = system.create_process(&ProcessStartInfo::new("sleep")).unwrap();
    assert!(!process.wait_for_exit(Some(Duration::from_millis(50))).unwrap());
    assert!(!process.has_exited());

    // The exit is still observable after a timed out wait.
    sim.exit_process(process.id(), 7);
    assert!(process.wait_for_exit(Some(LONG)).unwrap());
    assert_eq!(process.exit_code().unwrap(), 7);
}

#[test]
fn test_kill_running_process() {
    let sim = SimulatedHcs::new_shared();
    sim.script("sleep", ProcessScript::runs_forever());
    let system = started(&sim, "killer");

    let process = system.create_process(&ProcessStartInfo::new("sleep")).unwrap();
    process.kill().unwrap();
    process.kill().unwrap();

    assert!(process.is_killed());
    assert!(process.has_exited());
    assert_eq!(process.exit_code().unwrap(), 1);
    assert_eq!(sim.calls(SimOp::TerminateProcess), 1);
}

#[test]
fn test_kill_after_exit_issues_no_terminate() {
    let sim = SimulatedHcs::new_shared();
    let system = started(&sim, "late-kill");

    let info = ProcessStartInfo {
        kill_on_close: true,
        ..ProcessStartInfo::new("true")
    };
    let process = system.create_process(&info).unwrap();
    assert!(process.wait_for_exit(Some(LONG)).unwrap());

    process.kill().unwrap();
    assert!(!process.is_killed());
    drop(process);
    assert_eq!(sim.calls(SimOp::TerminateProcess), 0);
}

#[test]
fn test_process_kill_on_close() {
    let sim = SimulatedHcs::new_shared();
    sim.script("serve", ProcessScript::runs_forever());
    let system = started(&sim, "reaper");

    let info = ProcessStartInfo {
        kill_on_close: true,
        ..ProcessStartInfo::new("serve")
    };
    let process = system.create_process(&info).unwrap();
    process.dispose();
    assert_eq!(sim.calls(SimOp::TerminateProcess), 1);
    assert_eq!(sim.calls(SimOp::CloseProcess), 1);

    drop(process);
    assert_eq!(sim.calls(SimOp::CloseProcess), 1);
}

#[test]
fn test_disconnect_aborts_all_exit_waiters() {
    const THREADS: usize = 6;
    let sim = SimulatedHcs::new_shared();
    sim.script("sleep", ProcessScript::runs_forever());
    let system = started(&sim, "disconnect");

    let process = Arc::new(system.create_process(&ProcessStartInfo::new("sleep")).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let waiters: Vec<_> = (0..THREADS)
        .map(|_| {
            let process = Arc::clone(&process);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                process.wait_for_exit(None)
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(20));
    sim.disconnect_process(process.id());

    for waiter in waiters {
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.as_hcs().is_some_and(|e| e.is_aborted()));
    }
    assert!(!process.has_exited());
}

#[test]
fn test_open_existing_process() {
    let sim = SimulatedHcs::new_shared();
    sim.script("daemon", ProcessScript::runs_forever());
    let system = started(&sim, "attach");

    let process = system.create_process(&ProcessStartInfo::new("daemon")).unwrap();
    let attached = system.open_process(process.id()).unwrap();
    assert_eq!(attached.id(), process.id());
    assert!(attached.take_stdout().is_none());

    process.kill().unwrap();
    assert!(attached.wait_for_exit(Some(LONG)).unwrap());
    assert_eq!(attached.exit_code().unwrap(), 1);

    drop(attached);
    assert_eq!(sim.calls(SimOp::TerminateProcess), 1);
}

#[test]
fn test_resize_console() {
    let sim = SimulatedHcs::new_shared();
    sim.script("shell", ProcessScript::runs_forever());
    let system = started(&sim, "tty");

    let plain = system.create_process(&ProcessStartInfo::new("shell")).unwrap();
    assert!(matches!(
        plain.resize_console(24, 80),
        Err(ComputeError::InvalidState { .. })
    ));
    assert_eq!(sim.calls(SimOp::ModifyProcess), 0);

    let info = ProcessStartInfo {
        emulate_console: true,
        ..ProcessStartInfo::new("shell")
    };
    let console = system.create_process(&info).unwrap();
    console.resize_console(40, 120).unwrap();
    assert_eq!(sim.calls(SimOp::ModifyProcess), 1);
}

#[test]
fn test_create_process_in_exited_system_fails() {
    let sim = SimulatedHcs::new_shared();
    let system = started(&sim, "done");
    system.kill().unwrap();

    assert!(matches!(
        system.create_process(&ProcessStartInfo::new("true")),
        Err(ComputeError::InvalidState { .. })
    ));
}

// =============================================================================
// Notification watcher
// =============================================================================

#[test]
fn test_watcher_dispose_wakes_waiters() {
    let sim = SimulatedHcs::new_shared();
    let (handle, _) = sim
        .create_compute_system(
            &id("raw"),
            &serde_json::to_string(&settings().to_config(&id("raw"))).unwrap(),
        )
        .unwrap();

    let watcher = Arc::new(
        NotificationWatcher::new(
            sim.clone(),
            HandleKind::ComputeSystem,
            handle,
            &[NotificationKind::SystemStarted, NotificationKind::SystemExited],
        )
        .unwrap(),
    );

    let waiter = {
        let watcher = Arc::clone(&watcher);
        thread::spawn(move || watcher.wait_for(NotificationKind::SystemExited, None))
    };
    thread::sleep(Duration::from_millis(20));
    watcher.dispose();

    let err = waiter.join().unwrap().unwrap_err();
    assert!(err.as_hcs().is_some_and(|e| e.is_aborted()));
    assert!(watcher.is_disposed());
    assert_eq!(sim.subscriptions(), 0);

    // Notifications after disposal go nowhere.
    sim.exit_system(&id("raw"));
    assert!(watcher.outcome(NotificationKind::SystemExited).is_none());
    sim.close_compute_system(handle).unwrap();
}

#[test]
fn test_disconnect_aborts_waits_on_every_kind() {
    let sim = SimulatedHcs::new_shared();
    sim.hold(SimOp::StartSystem);
    let (handle, _) = sim
        .create_compute_system(
            &id("kinds"),
            &serde_json::to_string(&settings().to_config(&id("kinds"))).unwrap(),
        )
        .unwrap();
    let watcher = Arc::new(
        NotificationWatcher::new(
            sim.clone(),
            HandleKind::ComputeSystem,
            handle,
            &[NotificationKind::SystemStarted, NotificationKind::SystemExited],
        )
        .unwrap(),
    );

    let kinds = [
        NotificationKind::SystemStarted,
        NotificationKind::SystemExited,
        NotificationKind::SystemStarted,
        NotificationKind::SystemExited,
    ];
    let waiters: Vec<_> = kinds
        .into_iter()
        .map(|kind| {
            let watcher = Arc::clone(&watcher);
            thread::spawn(move || watcher.wait_for(kind, Some(LONG)))
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    sim.notify(
        handle,
        NotificationKind::ServiceDisconnected,
        ResultCode::SUCCESS,
        None,
    );

    for waiter in waiters {
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.as_hcs().is_some_and(|e| e.is_aborted()));
    }

    watcher.dispose();
    sim.close_compute_system(handle).unwrap();
}

// =============================================================================
// Async forms
// =============================================================================

#[tokio::test]
async fn test_wait_for_exit_async() {
    let sim = SimulatedHcs::new_shared();
    sim.script("exit5", ProcessScript::exits_with(5));
    let system = started(&sim, "async-wait");

    let process = system.create_process(&ProcessStartInfo::new("exit5")).unwrap();
    let code = tokio::time::timeout(LONG, process.wait_for_exit_async())
        .await
        .expect("exit in time")
        .unwrap();
    assert_eq!(code, 5);
    assert_eq!(process.exit_code().unwrap(), 5);
}

#[tokio::test]
async fn test_kill_async() {
    let sim = SimulatedHcs::new_shared();
    sim.script("sleep", ProcessScript::runs_forever());
    let system = started(&sim, "async-kill");

    let process = system.create_process(&ProcessStartInfo::new("sleep")).unwrap();
    tokio::time::timeout(LONG, process.kill_async())
        .await
        .expect("kill in time")
        .unwrap();
    assert!(process.has_exited());
    assert_eq!(sim.calls(SimOp::TerminateProcess), 1);
}

#[tokio::test]
async fn test_watch_resolved_from_host_thread() {
    let sim = SimulatedHcs::new_shared();
    let (handle, _) = sim
        .create_compute_system(
            &id("async-watch"),
            &serde_json::to_string(&settings().to_config(&id("async-watch"))).unwrap(),
        )
        .unwrap();
    let watcher = NotificationWatcher::new(
        sim.clone(),
        HandleKind::ComputeSystem,
        handle,
        &[NotificationKind::SystemCreated, NotificationKind::SystemExited],
    )
    .unwrap();

    let created = tokio::time::timeout(LONG, watcher.watch(NotificationKind::SystemCreated))
        .await
        .expect("created in time")
        .unwrap();
    assert_eq!(created.status, ResultCode::SUCCESS);

    let host = {
        let sim = Arc::clone(&sim);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sim.exit_system(&id("async-watch"));
        })
    };
    tokio::time::timeout(LONG, watcher.watch(NotificationKind::SystemExited))
        .await
        .expect("exited in time")
        .unwrap();
    host.join().unwrap();

    watcher.dispose();
    sim.close_compute_system(handle).unwrap();
    assert_eq!(sim.open_handles(), 0);
}

// =============================================================================
// Configuration
// =============================================================================

const RUN_CONFIG: &str = r#"
timeouts:
  dispose_ms: 500
container:
  id: from-file
  sandbox_path: /sandboxes/from-file
  layers:
    - id: 0b7e9f4c-1d2a-4e3b-8c5d-6f7a8b9c0d1e
      path: /layers/base
process:
  command_line: build.cmd
  redirect_stdout: true
"#;

#[test]
fn test_run_from_config_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("run.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(RUN_CONFIG.as_bytes()).unwrap();
    drop(file);

    let config = ConfigLoader::load_file(&path).unwrap();
    assert_eq!(config.container.dispose_timeout, Duration::from_millis(500));
    assert_eq!(config.process.dispose_timeout, Duration::from_millis(500));

    let sim = SimulatedHcs::new_shared();
    sim.script("build.cmd", ProcessScript::exits_with(0).with_stdout("built\n"));

    let system = create_container(sim.clone(), config.container_id.clone(), &config.container)
        .unwrap();
    system.start().unwrap();
    let process = system.create_process(&config.process).unwrap();
    assert_eq!(process.take_stdout().unwrap().read_all().unwrap(), "built\n");
    assert!(process
        .wait_for_exit(Some(config.timeouts.process_exit))
        .unwrap());
    assert!(system.shutdown(Some(config.timeouts.shutdown)).unwrap());
}

#[test]
fn test_config_file_not_found() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let result = ConfigLoader::load_file(temp_dir.path().join("missing.yaml"));
    assert!(matches!(result, Err(ComputeError::ConfigNotFound { .. })));
}

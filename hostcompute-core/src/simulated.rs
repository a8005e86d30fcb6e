// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process simulated host compute service.
//!
//! [`SimulatedHcs`] implements [`Hcs`] with handle tables in memory and
//! delivers notifications from its own delivery thread, so callers see the
//! same foreign-thread timing as with the real service. Tests use it to
//! inject notification timing, failures and disconnects deterministically.
//!
//! Notifications for a handle with no registered callback are queued and
//! flushed on registration. Once `unregister_callback` returns, the
//! callback is never invoked again.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{HcsError, ResultCode};
use crate::hcs::{
    CallOutcome, CreatedProcess, HandleKind, Hcs, NotificationCallback, ProcessStreams,
};
use crate::notification::NotificationKind;
use crate::schema::{self, ContainerConfig, ProcessParameters, ProcessStatus};
use crate::types::{CallbackHandle, ContainerId, Handle, ProcessId};

/// Invalid handle (HRESULT_FROM_WIN32(ERROR_INVALID_HANDLE)).
const E_HANDLE: ResultCode = ResultCode(0x8007_0006_u32 as i32);
/// Invalid argument.
const E_INVALIDARG: ResultCode = ResultCode(0x8007_0057_u32 as i32);
/// Exit code reported for a terminated process.
const TERMINATED_EXIT_CODE: u32 = 1;

/// Host operations, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateSystem,
    OpenSystem,
    CloseSystem,
    StartSystem,
    ShutdownSystem,
    TerminateSystem,
    CreateProcess,
    OpenProcess,
    CloseProcess,
    TerminateProcess,
    ModifyProcess,
    RegisterCallback,
    UnregisterCallback,
}

/// Behaviour of a simulated process, matched by exact command line.
#[derive(Debug, Clone, Default)]
pub struct ProcessScript {
    pub stdout: String,
    pub stderr: String,
    /// Exit immediately with this code; `None` runs until terminated.
    pub exit_code: Option<u32>,
}

impl ProcessScript {
    pub fn exits_with(code: u32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn runs_forever() -> Self {
        Self::default()
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemStatus {
    Created,
    Running,
    Stopped,
}

#[derive(Debug)]
struct SimSystem {
    status: SystemStatus,
    config: ContainerConfig,
}

#[derive(Debug)]
struct SimProcess {
    system: ContainerId,
    pid: u32,
    exited: bool,
    parameters: ProcessParameters,
}

struct Subscription {
    target: Handle,
    callback: NotificationCallback,
}

struct Delivery {
    target: Handle,
    kind: NotificationKind,
    status: ResultCode,
    data: Option<String>,
}

#[derive(Default)]
struct SimState {
    next_id: AtomicU64,
    next_pid: AtomicU32,
    systems: DashMap<ContainerId, SimSystem>,
    system_handles: DashMap<Handle, ContainerId>,
    processes: DashMap<Handle, SimProcess>,
    callbacks: DashMap<CallbackHandle, Subscription>,
    subscribers: DashMap<Handle, CallbackHandle>,
    backlog: DashMap<Handle, Vec<Delivery>>,
    scripts: DashMap<String, ProcessScript>,
    held: DashMap<SimOp, ()>,
    failures: DashMap<SimOp, HcsError>,
    completion_failures: DashMap<SimOp, HcsError>,
    calls: DashMap<SimOp, usize>,
    /// Held for reading while a callback runs, for writing while unregistering.
    dispatch_gate: RwLock<()>,
}

impl SimState {
    fn deliver_now(&self, delivery: Delivery) {
        let _gate = self.dispatch_gate.read().unwrap_or_else(PoisonError::into_inner);
        let callback = self
            .subscribers
            .get(&delivery.target)
            .map(|token| *token)
            .and_then(|token| self.callbacks.get(&token).map(|s| Arc::clone(&s.callback)));

        match callback {
            Some(callback) => callback(delivery.kind, delivery.status, delivery.data),
            None => tracing::trace!(
                handle = %delivery.target,
                kind = %delivery.kind,
                "Dropping notification for unsubscribed handle"
            ),
        }
    }
}

/// Deterministic in-process host compute service.
pub struct SimulatedHcs {
    state: Arc<SimState>,
    deliveries: Mutex<Sender<Delivery>>,
}

impl SimulatedHcs {
    /// Create a simulated host with its own delivery thread.
    pub fn new() -> Self {
        let state = Arc::new(SimState {
            next_id: AtomicU64::new(0x1000),
            next_pid: AtomicU32::new(100),
            ..SimState::default()
        });
        let (tx, rx) = mpsc::channel::<Delivery>();

        let worker_state = Arc::clone(&state);
        thread::Builder::new()
            .name("hcs-sim-notify".to_string())
            .spawn(move || {
                for delivery in rx {
                    worker_state.deliver_now(delivery);
                }
            })
            .map_err(|e| tracing::error!(error = %e, "Failed to spawn notification thread"))
            .ok();

        Self {
            state,
            deliveries: Mutex::new(tx),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Register the behaviour of processes created with `command_line`.
    /// Unscripted commands exit immediately with code 0.
    pub fn script(&self, command_line: impl Into<String>, script: ProcessScript) {
        self.state.scripts.insert(command_line.into(), script);
    }

    /// Stop delivering the completion notification of `op`. The request
    /// still reports pending.
    pub fn hold(&self, op: SimOp) {
        self.state.held.insert(op, ());
    }

    pub fn release(&self, op: SimOp) {
        self.state.held.remove(&op);
    }

    /// Make the next `op` request fail synchronously with `code`.
    pub fn fail_next(&self, op: SimOp, code: ResultCode, detail: Option<&str>) {
        self.state
            .failures
            .insert(op, HcsError::new(code, detail.map(str::to_string)));
    }

    /// Make the next `op` request accept, then report failure `code` in its
    /// completion notification.
    pub fn fail_completion(&self, op: SimOp, code: ResultCode, detail: Option<&str>) {
        self.state
            .completion_failures
            .insert(op, HcsError::new(code, detail.map(str::to_string)));
    }

    // =========================================================================
    // Injection
    // =========================================================================

    /// Deliver an arbitrary notification for `target`.
    pub fn notify(
        &self,
        target: Handle,
        kind: NotificationKind,
        status: ResultCode,
        data: Option<String>,
    ) {
        self.enqueue(Delivery {
            target,
            kind,
            status,
            data,
        });
    }

    /// The system exits on its own; every open handle is notified.
    pub fn exit_system(&self, id: &ContainerId) {
        if let Some(mut system) = self.state.systems.get_mut(id) {
            system.status = SystemStatus::Stopped;
        }
        self.notify_system(id, NotificationKind::SystemExited, ResultCode::SUCCESS);
    }

    /// Deliver a service disconnect to every handle of system `id`.
    pub fn disconnect_system(&self, id: &ContainerId) {
        self.notify_system(id, NotificationKind::ServiceDisconnected, ResultCode::SUCCESS);
    }

    /// Deliver `kind` to every handle of system `id`.
    pub fn notify_system(&self, id: &ContainerId, kind: NotificationKind, status: ResultCode) {
        for handle in self.handles_of(id) {
            self.notify(handle, kind, status, None);
        }
    }

    /// The process exits on its own with `exit_code`.
    pub fn exit_process(&self, pid: ProcessId, exit_code: u32) {
        self.finish_process(pid.value(), exit_code);
    }

    /// Deliver a service disconnect to the process handle of `pid`.
    pub fn disconnect_process(&self, pid: ProcessId) {
        if let Some(handle) = self.process_handle(pid) {
            self.notify(handle, NotificationKind::ServiceDisconnected, ResultCode::SUCCESS, None);
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of `op` requests received so far.
    pub fn calls(&self, op: SimOp) -> usize {
        self.state.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    pub fn exists(&self, id: &ContainerId) -> bool {
        self.state.systems.contains_key(id)
    }

    pub fn is_running(&self, id: &ContainerId) -> bool {
        self.state
            .systems
            .get(id)
            .is_some_and(|s| s.status == SystemStatus::Running)
    }

    /// Handles (system and process) not yet closed.
    pub fn open_handles(&self) -> usize {
        self.state.system_handles.len() + self.state.processes.len()
    }

    /// Callbacks currently registered.
    pub fn subscriptions(&self) -> usize {
        self.state.callbacks.len()
    }

    /// Parameters a process was created with.
    pub fn process_parameters(&self, pid: ProcessId) -> Option<ProcessParameters> {
        self.state
            .processes
            .iter()
            .find(|p| p.pid == pid.value())
            .map(|p| p.parameters.clone())
    }

    /// The configuration document a system was created with.
    pub fn system_config(&self, id: &ContainerId) -> Option<ContainerConfig> {
        self.state.systems.get(id).map(|s| s.config.clone())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn record(&self, op: SimOp) -> Result<(), HcsError> {
        *self.state.calls.entry(op).or_insert(0) += 1;
        match self.state.failures.remove(&op) {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    fn next_handle(&self) -> Handle {
        let raw = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        Handle::new(raw).unwrap_or_else(|| self.next_handle())
    }

    /// Queue `delivery` for its subscriber, or backlog it until one registers.
    ///
    /// The backlog entry for the target is held across the subscriber check,
    /// and `register_callback` subscribes under the same entry, so nothing
    /// can be backlogged after the backlog was flushed.
    fn enqueue(&self, delivery: Delivery) {
        let entry = self.state.backlog.entry(delivery.target);
        if !self.state.subscribers.contains_key(&delivery.target) {
            entry.or_default().push(delivery);
            return;
        }
        drop(entry);
        if let Err(delivery) = self.post(delivery) {
            self.state.deliver_now(delivery);
        }
    }

    /// Hand `delivery` to the delivery thread; gives it back if that thread is gone.
    fn post(&self, delivery: Delivery) -> Result<(), Delivery> {
        let tx = self.deliveries.lock().unwrap_or_else(PoisonError::into_inner);
        tx.send(delivery).map_err(|mpsc::SendError(delivery)| delivery)
    }

    /// Deliver the completion notification of a pending `op`, unless held.
    fn complete(&self, op: SimOp, target: Handle, kind: NotificationKind) {
        if self.state.held.contains_key(&op) {
            return;
        }
        let (status, data) = match self.state.completion_failures.remove(&op) {
            Some((_, err)) => (err.code, err.detail),
            None => (ResultCode::SUCCESS, None),
        };
        self.notify(target, kind, status, data);
    }

    fn handles_of(&self, id: &ContainerId) -> Vec<Handle> {
        self.state
            .system_handles
            .iter()
            .filter(|entry| entry.value() == id)
            .map(|entry| *entry.key())
            .collect()
    }

    fn system_of(&self, handle: Handle) -> Result<ContainerId, HcsError> {
        self.state
            .system_handles
            .get(&handle)
            .map(|id| id.clone())
            .ok_or_else(|| HcsError::new(E_HANDLE, Some(format!("unknown system handle {handle}"))))
    }

    fn system_status(&self, id: &ContainerId) -> Result<SystemStatus, HcsError> {
        self.state
            .systems
            .get(id)
            .map(|s| s.status)
            .ok_or_else(|| HcsError::new(ResultCode::SYSTEM_NOT_FOUND, Some(id.to_string())))
    }

    fn set_status(&self, id: &ContainerId, status: SystemStatus) {
        if let Some(mut system) = self.state.systems.get_mut(id) {
            system.status = status;
        }
    }

    fn process_handle(&self, pid: ProcessId) -> Option<Handle> {
        self.state
            .processes
            .iter()
            .find(|p| p.pid == pid.value())
            .map(|p| *p.key())
    }

    /// Mark every handle of process `pid` exited and notify each of them.
    fn finish_process(&self, pid: u32, exit_code: u32) {
        let mut handles = Vec::new();
        for mut process in self.state.processes.iter_mut() {
            if process.pid == pid && !process.exited {
                process.exited = true;
                handles.push(*process.key());
            }
        }

        let status = ProcessStatus {
            process_id: pid,
            exited: true,
            exit_code,
            last_wait_result: 0,
        };
        let data = serde_json::to_string(&status).ok();
        for handle in handles {
            self.notify(
                handle,
                NotificationKind::ProcessExited,
                ResultCode::SUCCESS,
                data.clone(),
            );
        }
    }

    /// Stop a system in response to a shutdown or terminate request.
    fn stop(&self, op: SimOp, system: Handle) -> Result<CallOutcome, HcsError> {
        self.record(op)?;
        let id = self.system_of(system)?;
        if self.system_status(&id)? == SystemStatus::Stopped {
            return Ok(CallOutcome::AlreadyStopped);
        }
        if !self.state.held.contains_key(&op) {
            self.exit_system(&id);
        }
        Ok(CallOutcome::Pending)
    }
}

impl Default for SimulatedHcs {
    fn default() -> Self {
        Self::new()
    }
}

impl Hcs for SimulatedHcs {
    fn create_compute_system(
        &self,
        id: &ContainerId,
        configuration: &str,
    ) -> Result<(Handle, CallOutcome), HcsError> {
        self.record(SimOp::CreateSystem)?;
        let config: ContainerConfig = schema::from_json(configuration, "container configuration")
            .map_err(|e| HcsError::new(E_INVALIDARG, Some(e.to_string())))?;

        match self.state.systems.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(HcsError::new(
                    ResultCode::SYSTEM_ALREADY_EXISTS,
                    Some(id.to_string()),
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(SimSystem {
                    status: SystemStatus::Created,
                    config,
                });
            }
        }

        let handle = self.next_handle();
        self.state.system_handles.insert(handle, id.clone());
        self.complete(SimOp::CreateSystem, handle, NotificationKind::SystemCreated);
        Ok((handle, CallOutcome::Pending))
    }

    fn open_compute_system(&self, id: &ContainerId) -> Result<Handle, HcsError> {
        self.record(SimOp::OpenSystem)?;
        self.system_status(id)?;
        let handle = self.next_handle();
        self.state.system_handles.insert(handle, id.clone());
        Ok(handle)
    }

    fn close_compute_system(&self, system: Handle) -> Result<(), HcsError> {
        self.record(SimOp::CloseSystem)?;
        self.state
            .system_handles
            .remove(&system)
            .map(|_| ())
            .ok_or_else(|| HcsError::new(E_HANDLE, None))
    }

    fn start_compute_system(
        &self,
        system: Handle,
        _options: Option<&str>,
    ) -> Result<CallOutcome, HcsError> {
        self.record(SimOp::StartSystem)?;
        let id = self.system_of(system)?;
        if self.system_status(&id)? == SystemStatus::Stopped {
            return Err(HcsError::new(ResultCode::INVALID_STATE, Some("system has stopped".into())));
        }
        if !self.state.held.contains_key(&SimOp::StartSystem)
            && !self.state.completion_failures.contains_key(&SimOp::StartSystem)
        {
            self.set_status(&id, SystemStatus::Running);
        }
        self.complete(SimOp::StartSystem, system, NotificationKind::SystemStarted);
        Ok(CallOutcome::Pending)
    }

    fn shutdown_compute_system(
        &self,
        system: Handle,
        _options: Option<&str>,
    ) -> Result<CallOutcome, HcsError> {
        self.stop(SimOp::ShutdownSystem, system)
    }

    fn terminate_compute_system(
        &self,
        system: Handle,
        _options: Option<&str>,
    ) -> Result<CallOutcome, HcsError> {
        self.stop(SimOp::TerminateSystem, system)
    }

    fn create_process(
        &self,
        system: Handle,
        parameters: &str,
    ) -> Result<CreatedProcess, HcsError> {
        self.record(SimOp::CreateProcess)?;
        let id = self.system_of(system)?;
        if self.system_status(&id)? != SystemStatus::Running {
            return Err(HcsError::new(ResultCode::INVALID_STATE, Some("system is not running".into())));
        }
        let parameters: ProcessParameters = schema::from_json(parameters, "process parameters")
            .map_err(|e| HcsError::new(E_INVALIDARG, Some(e.to_string())))?;

        let script = self
            .state
            .scripts
            .get(&parameters.command_line)
            .map(|s| s.clone())
            .unwrap_or_else(|| ProcessScript::exits_with(0));

        let pid = self.state.next_pid.fetch_add(4, Ordering::Relaxed);
        let process_id = ProcessId::new(pid).map_err(|e| HcsError::new(E_INVALIDARG, Some(e.to_string())))?;
        let handle = self.next_handle();

        let streams = ProcessStreams {
            stdin: parameters
                .create_std_in_pipe
                .then(|| Box::new(std::io::sink()) as Box<dyn std::io::Write + Send>),
            stdout: parameters.create_std_out_pipe.then(|| {
                Box::new(Cursor::new(script.stdout.clone().into_bytes()))
                    as Box<dyn std::io::Read + Send>
            }),
            stderr: parameters.create_std_err_pipe.then(|| {
                Box::new(Cursor::new(script.stderr.clone().into_bytes()))
                    as Box<dyn std::io::Read + Send>
            }),
        };

        self.state.processes.insert(
            handle,
            SimProcess {
                system: id,
                pid,
                exited: false,
                parameters,
            },
        );

        if let Some(code) = script.exit_code {
            self.finish_process(pid, code);
        }

        Ok(CreatedProcess {
            handle,
            process_id,
            streams,
        })
    }

    fn open_process(&self, system: Handle, pid: ProcessId) -> Result<Handle, HcsError> {
        self.record(SimOp::OpenProcess)?;
        let id = self.system_of(system)?;
        let existing = self
            .state
            .processes
            .iter()
            .find(|p| p.pid == pid.value() && p.system == id)
            .map(|p| (p.exited, p.parameters.clone()))
            .ok_or_else(|| HcsError::new(E_INVALIDARG, Some(format!("no process {pid}"))))?;

        let handle = self.next_handle();
        self.state.processes.insert(
            handle,
            SimProcess {
                system: id,
                pid: pid.value(),
                exited: existing.0,
                parameters: existing.1,
            },
        );
        Ok(handle)
    }

    fn close_process(&self, process: Handle) -> Result<(), HcsError> {
        self.record(SimOp::CloseProcess)?;
        self.state
            .processes
            .remove(&process)
            .map(|_| ())
            .ok_or_else(|| HcsError::new(E_HANDLE, None))
    }

    fn terminate_process(&self, process: Handle) -> Result<CallOutcome, HcsError> {
        self.record(SimOp::TerminateProcess)?;
        let (pid, exited) = self
            .state
            .processes
            .get(&process)
            .map(|p| (p.pid, p.exited))
            .ok_or_else(|| HcsError::new(E_HANDLE, None))?;
        if exited {
            return Ok(CallOutcome::AlreadyStopped);
        }
        if !self.state.held.contains_key(&SimOp::TerminateProcess) {
            self.finish_process(pid, TERMINATED_EXIT_CODE);
        }
        Ok(CallOutcome::Pending)
    }

    fn modify_process(&self, process: Handle, settings: &str) -> Result<(), HcsError> {
        self.record(SimOp::ModifyProcess)?;
        if !self.state.processes.contains_key(&process) {
            return Err(HcsError::new(E_HANDLE, None));
        }
        serde_json::from_str::<serde_json::Value>(settings)
            .map(|_| ())
            .map_err(|e| HcsError::new(E_INVALIDARG, Some(e.to_string())))
    }

    fn register_callback(
        &self,
        kind: HandleKind,
        target: Handle,
        callback: NotificationCallback,
    ) -> Result<CallbackHandle, HcsError> {
        self.record(SimOp::RegisterCallback)?;
        let known = match kind {
            HandleKind::ComputeSystem => self.state.system_handles.contains_key(&target),
            HandleKind::Process => self.state.processes.contains_key(&target),
        };
        if !known {
            return Err(HcsError::new(E_HANDLE, Some(format!("unknown {kind} handle {target}"))));
        }

        let token = CallbackHandle::new(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        self.state
            .callbacks
            .insert(token, Subscription { target, callback });

        // Flush in arrival order before a concurrent enqueue can post anything newer.
        let undelivered: Vec<Delivery> = {
            let entry = self.state.backlog.entry(target);
            self.state.subscribers.insert(target, token);
            match entry {
                Entry::Occupied(queued) => queued
                    .remove()
                    .into_iter()
                    .filter_map(|delivery| self.post(delivery).err())
                    .collect(),
                Entry::Vacant(_) => Vec::new(),
            }
        };
        for delivery in undelivered {
            self.state.deliver_now(delivery);
        }
        Ok(token)
    }

    fn unregister_callback(&self, _kind: HandleKind, token: CallbackHandle) -> Result<(), HcsError> {
        self.record(SimOp::UnregisterCallback)?;
        // Waits out any callback that is running right now.
        let _gate = self
            .state
            .dispatch_gate
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let (_, subscription) = self
            .state
            .callbacks
            .remove(&token)
            .ok_or_else(|| HcsError::new(E_HANDLE, None))?;
        self.state
            .subscribers
            .remove_if(&subscription.target, |_, current| *current == token);
        Ok(())
    }
}

impl std::fmt::Debug for SimulatedHcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scripts: HashMap<String, Option<u32>> = self
            .state
            .scripts
            .iter()
            .map(|s| (s.key().clone(), s.exit_code))
            .collect();
        f.debug_struct("SimulatedHcs")
            .field("systems", &self.state.systems.len())
            .field("open_handles", &self.open_handles())
            .field("subscriptions", &self.subscriptions())
            .field("scripts", &scripts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::RecvTimeoutError;
    use std::time::Duration;

    fn recorder() -> (NotificationCallback, mpsc::Receiver<NotificationKind>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: NotificationCallback = Arc::new(
            move |kind: NotificationKind, _status: ResultCode, _data: Option<String>| {
                let _ = tx.lock().unwrap().send(kind);
            },
        );
        (callback, rx)
    }

    fn create(sim: &SimulatedHcs, id: &str) -> (ContainerId, Handle) {
        let id = ContainerId::new(id).unwrap();
        let config = crate::container::ContainerSettings::default().to_config(&id);
        let (handle, outcome) = sim
            .create_compute_system(&id, &serde_json::to_string(&config).unwrap())
            .unwrap();
        assert!(outcome.is_pending());
        (id, handle)
    }

    #[test]
    fn test_backlog_flushed_on_registration() {
        let sim = SimulatedHcs::new();
        let (_, handle) = create(&sim, "backlog");
        let (callback, rx) = recorder();

        sim.register_callback(HandleKind::ComputeSystem, handle, callback)
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            NotificationKind::SystemCreated
        );
    }

    #[test]
    fn test_notification_racing_registration_is_delivered() {
        let sim = SimulatedHcs::new_shared();
        for round in 0..200 {
            let (_, handle) = create(&sim, &format!("race-{round}"));
            let (callback, rx) = recorder();
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let notifier = {
                let sim = Arc::clone(&sim);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    sim.notify(handle, NotificationKind::SystemStarted, ResultCode::SUCCESS, None);
                })
            };
            barrier.wait();
            sim.register_callback(HandleKind::ComputeSystem, handle, callback)
                .unwrap();
            notifier.join().unwrap();

            let mut seen = vec![
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ];
            seen.sort_by_key(|kind| kind.to_string());
            let mut expected = vec![NotificationKind::SystemCreated, NotificationKind::SystemStarted];
            expected.sort_by_key(|kind| kind.to_string());
            assert_eq!(seen, expected, "round {round}");
        }
    }

    #[test]
    fn test_no_delivery_after_unregister() {
        let sim = SimulatedHcs::new();
        let (id, handle) = create(&sim, "quiet");
        let (callback, rx) = recorder();

        let token = sim
            .register_callback(HandleKind::ComputeSystem, handle, callback)
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        sim.unregister_callback(HandleKind::ComputeSystem, token)
            .unwrap();

        sim.exit_system(&id);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let sim = SimulatedHcs::new();
        create(&sim, "dup");
        let id = ContainerId::new("dup").unwrap();
        let config = crate::container::ContainerSettings::default().to_config(&id);
        let err = sim
            .create_compute_system(&id, &serde_json::to_string(&config).unwrap())
            .unwrap_err();
        assert_eq!(err.code, ResultCode::SYSTEM_ALREADY_EXISTS);
    }

    #[test]
    fn test_stop_of_stopped_system_reports_already_stopped() {
        let sim = SimulatedHcs::new();
        let (id, handle) = create(&sim, "stopped");
        sim.exit_system(&id);
        assert_eq!(
            sim.shutdown_compute_system(handle, None).unwrap(),
            CallOutcome::AlreadyStopped
        );
        assert_eq!(sim.calls(SimOp::ShutdownSystem), 1);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let sim = SimulatedHcs::new();
        let (_, handle) = create(&sim, "flaky");
        sim.fail_next(SimOp::StartSystem, ResultCode(-5), Some("boom"));

        let err = sim.start_compute_system(handle, None).unwrap_err();
        assert_eq!(err.detail.as_deref(), Some("boom"));
        assert!(sim.start_compute_system(handle, None).is_ok());
        assert_eq!(sim.calls(SimOp::StartSystem), 2);
    }
}

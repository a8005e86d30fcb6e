// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Compute system lifecycle.
//!
//! A [`ComputeSystem`] owns one compute-system handle and a watcher for the
//! created, started and exited notifications. Kill and dispose are
//! idempotent through a latched `dead` flag; disposal is bounded and never
//! reports failure.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use crate::error::{ComputeError, ComputeResult, HcsError, ResultCode};
use crate::hcs::{CallOutcome, HandleKind, Hcs};
use crate::notification::{NotificationKind, NotificationWatcher};
use crate::process::{Process, ProcessStartInfo, DEFAULT_DISPOSE_TIMEOUT};
use crate::schema::{self, ContainerConfig, SystemType};
use crate::state::{SystemState, StateMachine};
use crate::types::{ContainerId, Handle, LayerId, NetworkId, ProcessId};

const SYSTEM_NOTIFICATIONS: &[NotificationKind] = &[
    NotificationKind::SystemCreated,
    NotificationKind::SystemStarted,
    NotificationKind::SystemExited,
];

/// A parent storage layer, as supplied by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub id: LayerId,
    pub path: PathBuf,
}

/// A host directory made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDirectory {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

/// Settings used to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Sandbox path prepared by the storage collaborator.
    pub sandbox_path: PathBuf,
    pub layers: Vec<LayerDescriptor>,
    pub mapped_directories: Vec<MappedDirectory>,
    /// Network to attach; [`NetworkId::NONE`] attaches nothing.
    pub network_id: NetworkId,
    /// Kill the container when the [`ComputeSystem`] is disposed.
    pub kill_on_close: bool,
    /// Hyper-V isolation instead of a process container.
    pub hyperv: bool,
    pub utility_vm_path: Option<PathBuf>,
    /// Upper bound on the kill wait performed during disposal.
    pub dispose_timeout: Duration,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            sandbox_path: PathBuf::new(),
            layers: Vec::new(),
            mapped_directories: Vec::new(),
            network_id: NetworkId::NONE,
            kill_on_close: false,
            hyperv: false,
            utility_vm_path: None,
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        }
    }
}

impl ContainerSettings {
    /// Build the host configuration document for container `id`.
    pub fn to_config(&self, id: &ContainerId) -> ContainerConfig {
        let network_endpoints = if self.network_id.is_none() {
            Vec::new()
        } else {
            vec![schema::NetworkEndpoint {
                network_id: *self.network_id.as_uuid(),
                endpoint_name: id.to_string(),
            }]
        };

        ContainerConfig {
            system_type: SystemType::Container,
            layer_folder_path: self.sandbox_path.to_string_lossy().into_owned(),
            layers: self
                .layers
                .iter()
                .map(|l| schema::Layer {
                    id: l.id,
                    path: l.path.to_string_lossy().into_owned(),
                })
                .collect(),
            mapped_directories: self
                .mapped_directories
                .iter()
                .map(|m| schema::MappedDirectory {
                    host_path: m.host_path.to_string_lossy().into_owned(),
                    container_path: m.container_path.to_string_lossy().into_owned(),
                    read_only: m.read_only,
                })
                .collect(),
            network_endpoints,
            hv_partition: self.hyperv,
            hv_runtime: self.utility_vm_path.as_ref().map(|p| schema::UtilityVm {
                image_path: p.to_string_lossy().into_owned(),
            }),
            terminate_on_last_handle_closed: self.kill_on_close,
        }
    }
}

/// A container compute system on this host.
pub struct ComputeSystem {
    id: ContainerId,
    hcs: Arc<dyn Hcs>,
    handle: Mutex<Option<Handle>>,
    watcher: NotificationWatcher,
    state: Mutex<StateMachine<SystemState>>,
    dead: AtomicBool,
    start_lock: Mutex<()>,
    /// Outcome of the one terminate request this system ever issues.
    terminate: OnceLock<Result<CallOutcome, HcsError>>,
    kill_on_close: bool,
    dispose_timeout: Duration,
    disposed: AtomicBool,
}

impl ComputeSystem {
    /// Create (but do not start) a new container and wait until the host
    /// reports it created.
    pub fn create(
        hcs: Arc<dyn Hcs>,
        id: ContainerId,
        settings: &ContainerSettings,
    ) -> ComputeResult<Self> {
        let configuration = schema::to_json(&settings.to_config(&id), "container configuration")?;

        tracing::info!(
            container_id = %id,
            layers = settings.layers.len(),
            network = %settings.network_id,
            hyperv = settings.hyperv,
            "Creating compute system"
        );

        let (handle, outcome) = hcs.create_compute_system(&id, &configuration)?;
        Self::initialize(
            hcs,
            id,
            handle,
            settings.kill_on_close,
            settings.dispose_timeout,
            outcome.is_pending(),
        )
    }

    /// Open an existing compute system. Never waits for creation and never
    /// kills on close.
    pub fn open(hcs: Arc<dyn Hcs>, id: ContainerId) -> ComputeResult<Self> {
        let handle = hcs.open_compute_system(&id).map_err(|e| {
            if e.code == ResultCode::SYSTEM_NOT_FOUND {
                ComputeError::SystemNotFound(id.clone())
            } else {
                e.into()
            }
        })?;
        Self::initialize(hcs, id, handle, false, DEFAULT_DISPOSE_TIMEOUT, false)
    }

    fn initialize(
        hcs: Arc<dyn Hcs>,
        id: ContainerId,
        handle: Handle,
        kill_on_close: bool,
        dispose_timeout: Duration,
        wait_for_created: bool,
    ) -> ComputeResult<Self> {
        let watcher = match NotificationWatcher::new(
            Arc::clone(&hcs),
            HandleKind::ComputeSystem,
            handle,
            SYSTEM_NOTIFICATIONS,
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                if let Err(close_err) = hcs.close_compute_system(handle) {
                    tracing::warn!(container_id = %id, error = %close_err, "Failed to close compute system handle");
                }
                return Err(e.into());
            }
        };

        let system = Self {
            state: Mutex::new(StateMachine::new(
                format!("compute system {}", id),
                SystemState::Created,
            )),
            id,
            hcs,
            handle: Mutex::new(Some(handle)),
            watcher,
            dead: AtomicBool::new(false),
            start_lock: Mutex::new(()),
            terminate: OnceLock::new(),
            kill_on_close,
            dispose_timeout,
            disposed: AtomicBool::new(false),
        };

        if wait_for_created {
            if let Err(e) = system.watcher.wait_for(NotificationKind::SystemCreated, None) {
                // Nothing was created, so there is nothing to kill on the way out.
                system.dead.store(true, Ordering::Release);
                tracing::warn!(container_id = %system.id, error = %e, "Compute system creation failed");
                return Err(e);
            }
        }

        tracing::info!(container_id = %system.id, handle = %handle, "Compute system ready");
        Ok(system)
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn state(&self) -> SystemState {
        self.lock_state().state()
    }

    /// True once the system has been observed to stop.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StateMachine<SystemState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> ComputeResult<Handle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or(ComputeError::Disposed)
    }

    fn ensure_alive(&self, operation: &'static str) -> ComputeResult<()> {
        if self.is_dead() {
            return Err(ComputeError::InvalidState {
                operation,
                reason: format!("compute system {} has exited", self.id),
            });
        }
        Ok(())
    }

    /// Move to `target` if the current state allows it. Concurrent stop
    /// requests can race each other, so a refused transition is only logged.
    fn advance(&self, target: SystemState) {
        if let Err(e) = self.lock_state().transition_to(target) {
            tracing::debug!(container_id = %self.id, error = %e, "State transition skipped");
        }
    }

    fn mark_exited(&self) {
        self.dead.store(true, Ordering::Release);
        self.advance(SystemState::Exited);
        tracing::info!(container_id = %self.id, "Compute system exited");
    }

    /// An exit already delivered means no stop request is needed.
    fn exit_observed(&self) -> bool {
        matches!(
            self.watcher.outcome(NotificationKind::SystemExited),
            Some(Ok(_))
        )
    }

    /// Start the system and block until the host reports it started.
    ///
    /// A second call once running issues no request. A failed start leaves
    /// the system startable again.
    pub fn start(&self) -> ComputeResult<()> {
        self.ensure_alive("start")?;
        let _serialized = self.start_lock.lock().unwrap_or_else(PoisonError::into_inner);

        match self.state() {
            SystemState::Running => return Ok(()),
            SystemState::Created => {}
            other => {
                return Err(ComputeError::InvalidState {
                    operation: "start",
                    reason: format!("compute system {} is {}", self.id, other),
                })
            }
        }

        match self.watcher.outcome(NotificationKind::SystemStarted) {
            Some(Err(e)) if e.is_aborted() => return Err(e.into()),
            Some(Err(_)) => self.watcher.rearm(NotificationKind::SystemStarted),
            _ => {}
        }

        let handle = self.handle()?;
        self.lock_state().transition_to(SystemState::Starting)?;
        tracing::debug!(container_id = %self.id, "Starting compute system");

        let result = self
            .hcs
            .start_compute_system(handle, None)
            .map_err(ComputeError::from)
            .and_then(|outcome| {
                if outcome.is_pending() {
                    self.watcher
                        .wait_for(NotificationKind::SystemStarted, None)
                        .map(|_| ())
                } else {
                    Ok(())
                }
            });

        // A concurrent shutdown or kill may already have moved the state on.
        let starting = self.state() == SystemState::Starting;
        match result {
            Ok(()) => {
                if starting {
                    self.advance(SystemState::Running);
                }
                tracing::info!(container_id = %self.id, "Compute system started");
                Ok(())
            }
            Err(e) => {
                if starting {
                    self.advance(SystemState::Created);
                }
                tracing::warn!(container_id = %self.id, error = %e, "Compute system start failed");
                Err(e)
            }
        }
    }

    /// Ask the system to shut down gracefully and wait up to `timeout`
    /// (forever if `None`) for it to exit. Returns whether it exited in time.
    pub fn shutdown(&self, timeout: Option<Duration>) -> ComputeResult<bool> {
        if self.is_dead() {
            return Ok(true);
        }
        if self.exit_observed() {
            self.mark_exited();
            return Ok(true);
        }

        let handle = self.handle()?;
        tracing::debug!(container_id = %self.id, timeout = ?timeout, "Shutting down compute system");
        let outcome = self.hcs.shutdown_compute_system(handle, None)?;
        self.advance(SystemState::ShuttingDown);

        if !outcome.is_pending() {
            self.mark_exited();
            return Ok(true);
        }

        match self.watcher.wait_for(NotificationKind::SystemExited, timeout)? {
            Some(_) => {
                self.mark_exited();
                Ok(true)
            }
            None => {
                tracing::warn!(container_id = %self.id, timeout = ?timeout, "Compute system shutdown timed out");
                Ok(false)
            }
        }
    }

    /// Terminate without a clean shutdown and wait for the exit.
    ///
    /// Idempotent: at most one terminate request is issued and every caller
    /// observes the same outcome.
    pub fn kill(&self) -> ComputeResult<()> {
        self.kill_within(None).map(|_| ())
    }

    fn kill_within(&self, timeout: Option<Duration>) -> ComputeResult<bool> {
        if self.is_dead() {
            return Ok(true);
        }
        if self.exit_observed() {
            self.mark_exited();
            return Ok(true);
        }

        let handle = self.handle()?;
        let outcome = self
            .terminate
            .get_or_init(|| {
                self.advance(SystemState::Killing);
                tracing::debug!(container_id = %self.id, "Terminating compute system");
                self.hcs.terminate_compute_system(handle, None)
            })
            .clone()?;

        if !outcome.is_pending() {
            self.mark_exited();
            return Ok(true);
        }

        match self.watcher.wait_for(NotificationKind::SystemExited, timeout)? {
            Some(_) => {
                self.mark_exited();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start a process in the system.
    pub fn create_process(&self, info: &ProcessStartInfo) -> ComputeResult<Process> {
        self.ensure_alive("create_process")?;
        let handle = self.handle()?;
        let parameters = schema::to_json(&info.parameters(), "process parameters")?;
        let created = self.hcs.create_process(handle, &parameters)?;
        Process::from_created(Arc::clone(&self.hcs), created, info)
    }

    /// Attach to an existing process in the system.
    pub fn open_process(&self, pid: ProcessId) -> ComputeResult<Process> {
        let handle = self.handle()?;
        let process = self.hcs.open_process(handle, pid)?;
        Process::open(Arc::clone(&self.hcs), process, pid)
    }

    /// Release the system. Kills it first when kill-on-close is set and it
    /// is still alive. Never fails, never blocks past the dispose timeout,
    /// and later calls do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.kill_on_close && !self.is_dead() {
            match self.kill_within(Some(self.dispose_timeout)) {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    container_id = %self.id,
                    timeout_ms = self.dispose_timeout.as_millis() as u64,
                    "Compute system did not exit while disposing"
                ),
                Err(e) => {
                    tracing::warn!(container_id = %self.id, error = %e, "Kill on close failed")
                }
            }
        }

        self.watcher.dispose();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = self.hcs.close_compute_system(handle) {
                tracing::warn!(container_id = %self.id, error = %e, "Failed to close compute system handle");
            }
        }

        tracing::debug!(container_id = %self.id, "Compute system disposed");
    }
}

impl Drop for ComputeSystem {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ComputeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeSystem")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dead", &self.is_dead())
            .field("kill_on_close", &self.kill_on_close)
            .finish()
    }
}

/// Create container `id` from `settings` and wait until the host reports it
/// created. The container is not started.
pub fn create_container(
    hcs: Arc<dyn Hcs>,
    id: ContainerId,
    settings: &ContainerSettings,
) -> ComputeResult<ComputeSystem> {
    ComputeSystem::create(hcs, id, settings)
}

/// Open existing container `id`. Never waits for creation and never kills on close.
pub fn open_container(hcs: Arc<dyn Hcs>, id: ContainerId) -> ComputeResult<ComputeSystem> {
    ComputeSystem::open(hcs, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_config_without_network() {
        let settings = ContainerSettings {
            sandbox_path: PathBuf::from("/sandboxes/a"),
            layers: vec![LayerDescriptor {
                id: Uuid::nil(),
                path: PathBuf::from("/layers/base"),
            }],
            kill_on_close: true,
            ..ContainerSettings::default()
        };
        let config = settings.to_config(&ContainerId::new("a").unwrap());
        assert!(config.network_endpoints.is_empty());
        assert!(config.hv_runtime.is_none());
        assert!(config.terminate_on_last_handle_closed);
        assert_eq!(config.layers[0].path, "/layers/base");
    }

    #[test]
    fn test_config_with_network_and_utility_vm() {
        let network = Uuid::new_v4();
        let settings = ContainerSettings {
            network_id: NetworkId::new(network),
            hyperv: true,
            utility_vm_path: Some(PathBuf::from("/uvm")),
            ..ContainerSettings::default()
        };
        let config = settings.to_config(&ContainerId::new("web-1").unwrap());
        assert_eq!(config.network_endpoints.len(), 1);
        assert_eq!(config.network_endpoints[0].network_id, network);
        assert_eq!(config.network_endpoints[0].endpoint_name, "web-1");
        assert!(config.hv_partition);
        assert_eq!(config.hv_runtime.unwrap().image_path, "/uvm");
    }
}

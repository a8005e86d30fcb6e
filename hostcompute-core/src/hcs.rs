// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Host gateway: the call surface into the host compute service.
//!
//! Every lifecycle intent goes through [`Hcs`]. A request either completes
//! synchronously, reports that the target was already stopped, or is left
//! pending, in which case the caller waits for the matching notification.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::error::{HcsError, ResultCode};
use crate::notification::NotificationKind;
use crate::types::{CallbackHandle, ContainerId, Handle, ProcessId};

/// How a host request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Done, no notification will follow.
    Completed,
    /// Accepted; completion arrives as a notification.
    Pending,
    /// The target had already stopped. Nothing will be delivered.
    AlreadyStopped,
}

impl CallOutcome {
    /// Classify a raw result code. Failures become errors carrying `detail`.
    pub fn from_code(code: ResultCode, detail: Option<String>) -> Result<Self, HcsError> {
        match code {
            ResultCode::PENDING => Ok(Self::Pending),
            ResultCode::ALREADY_STOPPED => Ok(Self::AlreadyStopped),
            ResultCode::SUCCESS => Ok(Self::Completed),
            code => Err(HcsError::new(code, detail)),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Which family of handle a callback is registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    ComputeSystem,
    Process,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ComputeSystem => write!(f, "compute-system"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Callback the host invokes, on a thread of its choosing, for every
/// notification on a registered handle.
pub type NotificationCallback =
    Arc<dyn Fn(NotificationKind, ResultCode, Option<String>) + Send + Sync>;

/// Standard stream endpoints handed back by process creation.
/// Only the streams that were requested are present.
#[derive(Default)]
pub struct ProcessStreams {
    pub stdin: Option<Box<dyn Write + Send>>,
    pub stdout: Option<Box<dyn Read + Send>>,
    pub stderr: Option<Box<dyn Read + Send>>,
}

impl fmt::Debug for ProcessStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessStreams")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Result of a successful process creation.
#[derive(Debug)]
pub struct CreatedProcess {
    pub handle: Handle,
    pub process_id: ProcessId,
    pub streams: ProcessStreams,
}

/// The host compute service call surface.
///
/// One production implementation talks to the platform service; the
/// simulated implementation drives notifications deterministically in tests.
pub trait Hcs: Send + Sync {
    /// Create a compute system from a JSON configuration document.
    fn create_compute_system(
        &self,
        id: &ContainerId,
        configuration: &str,
    ) -> Result<(Handle, CallOutcome), HcsError>;

    fn open_compute_system(&self, id: &ContainerId) -> Result<Handle, HcsError>;

    fn close_compute_system(&self, system: Handle) -> Result<(), HcsError>;

    fn start_compute_system(
        &self,
        system: Handle,
        options: Option<&str>,
    ) -> Result<CallOutcome, HcsError>;

    fn shutdown_compute_system(
        &self,
        system: Handle,
        options: Option<&str>,
    ) -> Result<CallOutcome, HcsError>;

    fn terminate_compute_system(
        &self,
        system: Handle,
        options: Option<&str>,
    ) -> Result<CallOutcome, HcsError>;

    /// Create a process from JSON process parameters.
    fn create_process(&self, system: Handle, parameters: &str)
        -> Result<CreatedProcess, HcsError>;

    fn open_process(&self, system: Handle, pid: ProcessId) -> Result<Handle, HcsError>;

    fn close_process(&self, process: Handle) -> Result<(), HcsError>;

    fn terminate_process(&self, process: Handle) -> Result<CallOutcome, HcsError>;

    /// Fire-and-forget modification (e.g. console resize).
    fn modify_process(&self, process: Handle, settings: &str) -> Result<(), HcsError>;

    /// Subscribe `callback` to every notification for `target`.
    fn register_callback(
        &self,
        kind: HandleKind,
        target: Handle,
        callback: NotificationCallback,
    ) -> Result<CallbackHandle, HcsError>;

    /// Remove a subscription. Once this returns the callback is never invoked again.
    fn unregister_callback(&self, kind: HandleKind, token: CallbackHandle) -> Result<(), HcsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert_eq!(
            CallOutcome::from_code(ResultCode::SUCCESS, None).unwrap(),
            CallOutcome::Completed
        );
        assert!(CallOutcome::from_code(ResultCode::PENDING, None)
            .unwrap()
            .is_pending());
        assert_eq!(
            CallOutcome::from_code(ResultCode::ALREADY_STOPPED, None).unwrap(),
            CallOutcome::AlreadyStopped
        );

        let err = CallOutcome::from_code(ResultCode::SYSTEM_NOT_FOUND, Some("gone".into()))
            .unwrap_err();
        assert_eq!(err.code, ResultCode::SYSTEM_NOT_FOUND);
        assert_eq!(err.detail.as_deref(), Some("gone"));
    }
}

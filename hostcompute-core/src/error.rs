// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for the lifecycle coordinator.
//!
//! Host failures are carried as result codes so that one failed completion can
//! be handed to every waiter. Everything else is an explicit enum variant.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::ContainerId;

/// A host service result code (an HRESULT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);
    pub const PENDING: Self = Self(0xC037_0103_u32 as i32);
    pub const INVALID_STATE: Self = Self(0xC037_010B_u32 as i32);
    pub const SYSTEM_NOT_FOUND: Self = Self(0xC037_010E_u32 as i32);
    pub const SYSTEM_ALREADY_EXISTS: Self = Self(0xC037_010F_u32 as i32);
    pub const ALREADY_STOPPED: Self = Self(0xC037_0110_u32 as i32);
    pub const UNEXPECTED_EXIT: Self = Self(0xC037_0106_u32 as i32);
    pub const E_ABORT: Self = Self(0x8000_4004_u32 as i32);

    /// A code is a failure unless it is `SUCCESS` or `ALREADY_STOPPED`.
    pub const fn failed(self) -> bool {
        self.0 != Self::SUCCESS.0 && self.0 != Self::ALREADY_STOPPED.0
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    const fn name(self) -> Option<&'static str> {
        match self {
            Self::SUCCESS => Some("SUCCESS"),
            Self::PENDING => Some("PENDING"),
            Self::INVALID_STATE => Some("INVALID_STATE"),
            Self::SYSTEM_NOT_FOUND => Some("SYSTEM_NOT_FOUND"),
            Self::SYSTEM_ALREADY_EXISTS => Some("SYSTEM_ALREADY_EXISTS"),
            Self::ALREADY_STOPPED => Some("ALREADY_STOPPED"),
            Self::UNEXPECTED_EXIT => Some("UNEXPECTED_EXIT"),
            Self::E_ABORT => Some("E_ABORT"),
            _ => None,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{:#010x} ({})", self.0 as u32, name),
            None => write!(f, "{:#010x}", self.0 as u32),
        }
    }
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

/// A failure reported by the host service, either synchronously from a
/// request or asynchronously through a notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("host compute call failed with {code}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct HcsError {
    pub code: ResultCode,
    pub detail: Option<String>,
}

impl HcsError {
    pub fn new(code: impl Into<ResultCode>, detail: Option<String>) -> Self {
        Self {
            code: code.into(),
            detail,
        }
    }

    /// Transport-level abort raised when the service disconnects.
    pub fn aborted() -> Self {
        Self::new(ResultCode::E_ABORT, None)
    }

    /// Raised on a start waiter when the system exits before starting.
    pub fn unexpected_exit() -> Self {
        Self::new(ResultCode::UNEXPECTED_EXIT, None)
    }

    pub fn is_aborted(&self) -> bool {
        self.code == ResultCode::E_ABORT
    }

    pub fn is_unexpected_exit(&self) -> bool {
        self.code == ResultCode::UNEXPECTED_EXIT
    }
}

/// Top-level error type for the coordinator.
#[derive(Debug, Error)]
pub enum ComputeError {
    // =========================================================================
    // Host Errors
    // =========================================================================
    #[error(transparent)]
    Hcs(#[from] HcsError),

    #[error("Compute system not found: {0}")]
    SystemNotFound(ContainerId),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Invalid state for {operation}: {reason}")]
    InvalidState {
        operation: &'static str,
        reason: String,
    },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Object has already been disposed")]
    Disposed,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("Schema error: {context} - {source}")]
    Schema {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ComputeError {
    /// The host error behind this failure, if there is one.
    pub fn as_hcs(&self) -> Option<&HcsError> {
        match self {
            Self::Hcs(e) => Some(e),
            _ => None,
        }
    }
}

/// Hard validation errors reject a configuration before anything is created.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// State transition errors for the system and process state machines.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for {subject}")]
    InvalidTransition {
        subject: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("{subject} is in terminal state: {state}")]
    TerminalState {
        subject: String,
        state: &'static str,
    },
}

/// Result type alias using ComputeError.
pub type ComputeResult<T> = Result<T, ComputeError>;

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for host identifiers and validated inputs.
//!
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HardValidationError;

/// Maximum length of a container identifier.
const MAX_CONTAINER_ID_LEN: usize = 128;

/// Opaque, host-assigned handle for a compute system or a process.
///
/// Zero is the null handle and is never handed out by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Wrap a raw host value, rejecting the null handle.
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Token returned by callback registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb:{:#x}", self.0)
    }
}

/// Validated container identifier.
/// Non-empty, at most 128 chars of alphanumerics, hyphens, underscores and dots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Create a new ContainerId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "container_id",
                value: id,
                reason: "Container ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_CONTAINER_ID_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "container_id",
                value: id.clone(),
                reason: format!(
                    "Container ID too long: {} chars (max {})",
                    id.len(),
                    MAX_CONTAINER_ID_LEN
                ),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "container_id",
                value: id,
                reason: "Container ID must contain only alphanumeric characters, hyphens, underscores, and dots".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

/// Network to attach a container to. The nil UUID means "no network".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(Uuid);

impl NetworkId {
    pub const NONE: Self = Self(Uuid::nil());

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a storage layer supplied by the storage collaborator.
pub type LayerId = Uuid;

/// Process ID inside a compute system.
/// Must be positive (non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Create a new ProcessId with validation.
    pub fn new(pid: u32) -> Result<Self, HardValidationError> {
        if pid == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "process_id",
                value: "0".to_string(),
                reason: "Process ID 0 is reserved".to_string(),
            });
        }
        Ok(Self(pid))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle_rejected() {
        assert!(Handle::new(0).is_none());
        assert_eq!(Handle::new(0x2a).unwrap().raw(), 0x2a);
    }

    #[test]
    fn test_container_id_valid() {
        assert!(ContainerId::new("build-box").is_ok());
        assert!(ContainerId::new("box_1.test").is_ok());
        assert!(ContainerId::new(Uuid::new_v4().to_string()).is_ok());
        assert!(ContainerId::new(ContainerId::generate().as_str()).is_ok());
    }

    #[test]
    fn test_container_id_invalid() {
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("a".repeat(129)).is_err());
        assert!(ContainerId::new("box name").is_err());
        assert!(ContainerId::new("box/1").is_err());
    }

    #[test]
    fn test_network_id_sentinel() {
        assert!(NetworkId::NONE.is_none());
        assert!(NetworkId::default().is_none());
        assert!(!NetworkId::new(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_process_id() {
        assert!(ProcessId::new(4).is_ok());
        assert!(ProcessId::new(0).is_err());
    }
}

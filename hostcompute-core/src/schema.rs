// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! JSON documents exchanged with the host service.
//!
//! Only the fields the coordinator supplies or reads are modelled.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ComputeError, ComputeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemType {
    Container,
    VirtualMachine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Layer {
    pub id: Uuid,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedDirectory {
    pub host_path: String,
    pub container_path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkEndpoint {
    pub network_id: Uuid,
    pub endpoint_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UtilityVm {
    pub image_path: String,
}

/// Configuration document for creating a container compute system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub system_type: SystemType,
    pub layer_folder_path: String,
    pub layers: Vec<Layer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapped_directories: Vec<MappedDirectory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_endpoints: Vec<NetworkEndpoint>,
    pub hv_partition: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hv_runtime: Option<UtilityVm>,
    pub terminate_on_last_handle_closed: bool,
}

/// Parameters for creating a process inside a compute system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    pub command_line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    pub emulate_console: bool,
    pub restricted_token: bool,
    pub create_std_in_pipe: bool,
    pub create_std_out_pipe: bool,
    pub create_std_err_pipe: bool,
}

/// Payload of a process-exited notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessStatus {
    pub process_id: u32,
    pub exited: bool,
    pub exit_code: u32,
    pub last_wait_result: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSize {
    #[serde(rename = "Height")]
    pub height: u16,
    #[serde(rename = "Width")]
    pub width: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessModifyOperation {
    ConsoleSize,
    CloseHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessModifyRequest {
    pub operation: ProcessModifyOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_size: Option<ConsoleSize>,
}

impl ProcessModifyRequest {
    pub fn resize(height: u16, width: u16) -> Self {
        Self {
            operation: ProcessModifyOperation::ConsoleSize,
            console_size: Some(ConsoleSize { height, width }),
        }
    }
}

pub fn to_json<T: Serialize>(value: &T, context: &'static str) -> ComputeResult<String> {
    serde_json::to_string(value).map_err(|source| ComputeError::Schema { context, source })
}

pub fn from_json<T: DeserializeOwned>(json: &str, context: &'static str) -> ComputeResult<T> {
    serde_json::from_str(json).map_err(|source| ComputeError::Schema { context, source })
}

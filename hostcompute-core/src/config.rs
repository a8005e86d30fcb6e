// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML run configuration with strict schema validation.
//!
//! A run configuration names one container and one process to start in it.
//! Any invalid field results in a HardValidationError before anything is
//! sent to the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::container::{ContainerSettings, LayerDescriptor, MappedDirectory};
use crate::error::{ComputeError, ComputeResult, HardValidationError};
use crate::process::ProcessStartInfo;
use crate::types::{ContainerId, NetworkId};

/// Raw timeouts as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawTimeouts {
    #[serde(default = "default_shutdown_ms")]
    shutdown_ms: u64,
    #[serde(default = "default_process_exit_ms")]
    process_exit_ms: u64,
    #[serde(default = "default_dispose_ms")]
    dispose_ms: u64,
}

fn default_shutdown_ms() -> u64 {
    30000 // 30 seconds
}

fn default_process_exit_ms() -> u64 {
    10000
}

fn default_dispose_ms() -> u64 {
    10000
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            shutdown_ms: default_shutdown_ms(),
            process_exit_ms: default_process_exit_ms(),
            dispose_ms: default_dispose_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLayer {
    id: Uuid,
    path: String,
}

#[derive(Debug, Deserialize)]
struct RawMappedDirectory {
    host_path: String,
    container_path: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct RawContainer {
    id: String,
    sandbox_path: String,
    #[serde(default)]
    layers: Vec<RawLayer>,
    #[serde(default)]
    mapped_directories: Vec<RawMappedDirectory>,
    #[serde(default)]
    network_id: Option<Uuid>,
    #[serde(default = "default_true")]
    kill_on_close: bool,
    #[serde(default)]
    hyperv: bool,
    #[serde(default)]
    utility_vm_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProcess {
    #[serde(default)]
    command_line: String,
    #[serde(default)]
    application_name: Option<String>,
    #[serde(default)]
    working_directory: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    environment: HashMap<String, String>,
    #[serde(default)]
    redirect_stdin: bool,
    #[serde(default = "default_true")]
    redirect_stdout: bool,
    #[serde(default)]
    redirect_stderr: bool,
    #[serde(default)]
    emulate_console: bool,
    #[serde(default)]
    restricted_token: bool,
    #[serde(default = "default_true")]
    kill_on_close: bool,
}

fn default_true() -> bool {
    true
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    timeouts: RawTimeouts,
    container: RawContainer,
    process: RawProcess,
}

/// Validated timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub shutdown: Duration,
    pub process_exit: Duration,
    pub dispose: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            shutdown: Duration::from_millis(default_shutdown_ms()),
            process_exit: Duration::from_millis(default_process_exit_ms()),
            dispose: Duration::from_millis(default_dispose_ms()),
        }
    }
}

/// Complete validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub timeouts: TimeoutConfig,
    pub container_id: ContainerId,
    pub container: ContainerSettings,
    pub process: ProcessStartInfo,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> ComputeResult<RunConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ComputeError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| ComputeError::Io {
            context: "reading config file",
            source: e,
        })?;

        tracing::debug!(path = %path.display(), "Loaded run configuration");
        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> ComputeResult<RunConfig> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ComputeError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> ComputeResult<RunConfig> {
        let timeouts = Self::validate_timeouts(&raw.timeouts)?;
        let (container_id, container) = Self::validate_container(raw.container, &timeouts)?;
        let process = Self::validate_process(raw.process, &timeouts)?;

        Ok(RunConfig {
            timeouts,
            container_id,
            container,
            process,
        })
    }

    fn validate_timeouts(raw: &RawTimeouts) -> ComputeResult<TimeoutConfig> {
        let check = |field: &'static str, value: u64, max: u64| -> ComputeResult<Duration> {
            if value == 0 || value > max {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: value.to_string(),
                    reason: format!("Must be between 1 and {} milliseconds", max),
                }
                .into());
            }
            Ok(Duration::from_millis(value))
        };

        Ok(TimeoutConfig {
            shutdown: check("shutdown_ms", raw.shutdown_ms, 600_000)?,
            process_exit: check("process_exit_ms", raw.process_exit_ms, 3_600_000)?,
            dispose: check("dispose_ms", raw.dispose_ms, 600_000)?,
        })
    }

    fn validate_container(
        raw: RawContainer,
        timeouts: &TimeoutConfig,
    ) -> ComputeResult<(ContainerId, ContainerSettings)> {
        let id = ContainerId::new(&raw.id)?;

        if raw.sandbox_path.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "sandbox_path",
                context: format!("container {}", id),
            }
            .into());
        }

        if raw.layers.is_empty() {
            return Err(HardValidationError::SchemaValidation {
                message: "At least one layer must be defined".to_string(),
            }
            .into());
        }

        let mut seen_layers = std::collections::HashSet::new();
        let mut layers = Vec::with_capacity(raw.layers.len());
        for layer in raw.layers {
            if layer.path.trim().is_empty() {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "layers",
                    value: layer.id.to_string(),
                    reason: "Layer path cannot be empty".to_string(),
                }
                .into());
            }
            if !seen_layers.insert(layer.id) {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "layers",
                    value: layer.id.to_string(),
                    reason: "Layer is listed more than once".to_string(),
                }
                .into());
            }
            layers.push(LayerDescriptor {
                id: layer.id,
                path: PathBuf::from(layer.path),
            });
        }

        let mut mapped_directories = Vec::with_capacity(raw.mapped_directories.len());
        for dir in raw.mapped_directories {
            if dir.host_path.is_empty() || dir.container_path.is_empty() {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "mapped_directories",
                    value: format!("{} -> {}", dir.host_path, dir.container_path),
                    reason: "Both host_path and container_path are required".to_string(),
                }
                .into());
            }
            mapped_directories.push(MappedDirectory {
                host_path: PathBuf::from(dir.host_path),
                container_path: PathBuf::from(dir.container_path),
                read_only: dir.read_only,
            });
        }

        if raw.utility_vm_path.is_some() && !raw.hyperv {
            return Err(HardValidationError::InvalidFieldValue {
                field: "utility_vm_path",
                value: raw.utility_vm_path.unwrap_or_default(),
                reason: "A utility VM requires hyperv: true".to_string(),
            }
            .into());
        }

        let settings = ContainerSettings {
            sandbox_path: PathBuf::from(raw.sandbox_path),
            layers,
            mapped_directories,
            network_id: raw.network_id.map(NetworkId::new).unwrap_or(NetworkId::NONE),
            kill_on_close: raw.kill_on_close,
            hyperv: raw.hyperv,
            utility_vm_path: raw.utility_vm_path.map(PathBuf::from),
            dispose_timeout: timeouts.dispose,
        };

        Ok((id, settings))
    }

    fn validate_process(
        raw: RawProcess,
        timeouts: &TimeoutConfig,
    ) -> ComputeResult<ProcessStartInfo> {
        if raw.command_line.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "command_line",
                context: "process".to_string(),
            }
            .into());
        }

        for key in raw.environment.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "environment",
                    value: key.clone(),
                    reason: "Environment variable names cannot be empty or contain '='"
                        .to_string(),
                }
                .into());
            }
        }

        Ok(ProcessStartInfo {
            application_name: raw.application_name,
            command_line: raw.command_line,
            user: raw.user,
            working_directory: raw.working_directory,
            environment: raw.environment,
            redirect_stdin: raw.redirect_stdin,
            redirect_stdout: raw.redirect_stdout,
            redirect_stderr: raw.redirect_stderr,
            emulate_console: raw.emulate_console,
            restricted_token: raw.restricted_token,
            kill_on_close: raw.kill_on_close,
            dispose_timeout: timeouts.dispose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
timeouts:
  shutdown_ms: 5000
  process_exit_ms: 2000

container:
  id: build-box
  sandbox_path: 'C:\sandboxes\build-box'
  layers:
    - id: 7f3c5d1e-8a2b-4c6d-9e0f-112233445566
      path: 'C:\layers\servercore'
  mapped_directories:
    - host_path: 'C:\src'
      container_path: 'C:\src'
      read_only: true
  kill_on_close: true

process:
  command_line: cmd /c exit 0
  environment:
    DEBUG: "true"
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.container_id.as_str(), "build-box");
        assert_eq!(config.container.layers.len(), 1);
        assert!(config.container.mapped_directories[0].read_only);
        assert!(config.container.network_id.is_none());
        assert_eq!(config.timeouts.shutdown, Duration::from_millis(5000));
        assert_eq!(config.timeouts.dispose, Duration::from_millis(10000));
        assert_eq!(config.process.command_line, "cmd /c exit 0");
        assert!(config.process.redirect_stdout);
        assert!(config.process.kill_on_close);
    }

    #[test]
    fn test_nil_network_means_none() {
        let yaml = VALID_CONFIG.replace(
            "  kill_on_close: true\n",
            "  kill_on_close: true\n  network_id: 00000000-0000-0000-0000-000000000000\n",
        );
        let config = ConfigLoader::load_string(&yaml).unwrap();
        assert!(config.container.network_id.is_none());
    }

    #[test]
    fn test_missing_command_line() {
        let yaml = r#"
container:
  id: a
  sandbox_path: /s
  layers:
    - id: 7f3c5d1e-8a2b-4c6d-9e0f-112233445566
      path: /l
process:
  command_line: "  "
"#;
        let result = ConfigLoader::load_string(yaml);
        assert!(matches!(
            result,
            Err(ComputeError::HardValidation(
                HardValidationError::MissingRequiredField { field: "command_line", .. }
            ))
        ));
    }

    #[test]
    fn test_no_layers() {
        let yaml = r#"
container:
  id: a
  sandbox_path: /s
process:
  command_line: run
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_invalid_container_id() {
        let yaml = VALID_CONFIG.replace("id: build-box", "id: 'bad id!'");
        assert!(ConfigLoader::load_string(&yaml).is_err());
    }

    #[test]
    fn test_timeout_out_of_range() {
        let yaml = VALID_CONFIG.replace("shutdown_ms: 5000", "shutdown_ms: 0");
        let result = ConfigLoader::load_string(&yaml);
        assert!(matches!(
            result,
            Err(ComputeError::HardValidation(
                HardValidationError::InvalidFieldValue { field: "shutdown_ms", .. }
            ))
        ));
    }

    #[test]
    fn test_utility_vm_requires_hyperv() {
        let yaml = VALID_CONFIG.replace(
            "  kill_on_close: true\n",
            "  kill_on_close: true\n  utility_vm_path: 'C:\\uvm'\n",
        );
        assert!(ConfigLoader::load_string(&yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let result = ConfigLoader::load_string("container: [unclosed");
        assert!(matches!(result, Err(ComputeError::ConfigParse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/nonexistent/run.yaml");
        assert!(matches!(result, Err(ComputeError::ConfigNotFound { .. })));
    }
}

//! Host Compute Core Library
//!
//! Lifecycle coordination for host compute service containers and the
//! processes running inside them. Provides the host gateway trait, the
//! notification watcher that turns host callbacks into awaitable
//! completions, compute-system and process lifecycles, and YAML run
//! configuration.

pub mod config;
pub mod container;
pub mod error;
pub mod hcs;
#[cfg(windows)]
pub mod native;
pub mod notification;
pub mod process;
pub mod schema;
pub mod simulated;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigLoader, RunConfig, TimeoutConfig};
pub use container::{
    create_container, open_container, ComputeSystem, ContainerSettings, LayerDescriptor,
    MappedDirectory,
};
pub use error::{
    ComputeError, ComputeResult, HardValidationError, HcsError, ResultCode, StateTransitionError,
};
pub use hcs::{CallOutcome, CreatedProcess, HandleKind, Hcs, NotificationCallback, ProcessStreams};
#[cfg(windows)]
pub use native::NativeHcs;
pub use notification::{NotificationKind, NotificationResult, NotificationWatcher};
pub use process::{Process, ProcessStartInfo, TextReader, TextWriter};
pub use simulated::{ProcessScript, SimOp, SimulatedHcs};
pub use state::{ProcessState, SystemState};
pub use types::{CallbackHandle, ContainerId, Handle, LayerId, NetworkId, ProcessId};

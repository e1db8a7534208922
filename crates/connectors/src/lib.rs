//! ArmDock Connectors
//!
//! Everything that touches the outside world on behalf of a session:
//! spawning and driving the external calibration/teleop tool, reading its
//! free-text output for known prompts, and enumerating attached devices.

pub mod commands;
pub mod devices;
pub mod process;
pub mod prompt;

pub use commands::{calibration_command, teleop_command, CommandSpec, ToolConfig};
pub use devices::{DeviceSource, SerialPortScanner, StaticDevices};
pub use process::ProcessConnector;
pub use prompt::{DisconnectSignals, ExtractedSignals, PromptExtractor, PromptMarkers, RoleHints};
use thiserror::Error;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Process is not running")]
    NotRunning,

    #[error("Process communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Invalid marker pattern: {0}")]
    InvalidMarker(#[from] regex::Error),
}

/// Which pipe a line of output arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Events emitted by a running process, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// One line of output (ANSI escapes stripped, line terminator removed)
    Output { stream: OutputStream, line: String },

    /// The process exited. Negative codes are terminating signals.
    Exited { code: i32 },
}

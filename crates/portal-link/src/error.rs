//! # Link Error Types
//!
//! Error types for the serial link, the processing engine and configuration.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Link Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Connect       │  │   Command       │  │   Link (disconnect)     │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  PortNotFound   │  │  Timeout  ⟲     │  │  Desynchronized         │ │
//! │  │  PortBusy       │  │  LinkDown       │  │  Io                     │ │
//! │  │  PermissionDen. │  │  Rejected       │  │  Closed                 │ │
//! │  │  Other          │  │  Invalid        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │   Engine        │  │   Config        │   ⟲ = retried by            │
//! │  │                 │  │                 │       send_with_retry       │
//! │  │  Command        │  │  LoadFailed     │                              │
//! │  │  Store          │  │  SaveFailed     │                              │
//! │  │  Validation     │  │  Invalid        │                              │
//! │  │  ShuttingDown   │  │                 │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;

use portal_core::ValidationError;
use portal_store::StoreError;
use thiserror::Error;

// =============================================================================
// Connect Errors
// =============================================================================

/// Failure to open the serial port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Another process holds the port.
    #[error("Serial port is busy: {0}")]
    PortBusy(String),

    #[error("Permission denied opening serial port: {0}")]
    PermissionDenied(String),

    #[error("Failed to open serial port {port}: {reason}")]
    Other { port: String, reason: String },
}

impl ConnectError {
    /// Classifies a `serialport` open failure for `port`.
    pub fn from_serial(port: &str, err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        let reason = err.description;
        match err.kind {
            ErrorKind::Io(std::io::ErrorKind::NotFound) => ConnectError::PortNotFound(port.into()),
            ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                ConnectError::PermissionDenied(port.into())
            }
            ErrorKind::NoDevice if Path::new(port).exists() => ConnectError::PortBusy(port.into()),
            ErrorKind::NoDevice => ConnectError::PortNotFound(port.into()),
            _ if reason.to_lowercase().contains("busy") => ConnectError::PortBusy(port.into()),
            _ => ConnectError::Other {
                port: port.into(),
                reason,
            },
        }
    }
}

// =============================================================================
// Command Errors
// =============================================================================

/// Failure of a single `send_command` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No reply within the command timeout.
    #[error("No reply to command 0x{command:02X} within {timeout_ms} ms")]
    Timeout { command: u8, timeout_ms: u64 },

    /// The link closed before or while the command was in flight.
    #[error("Serial link is down")]
    LinkDown,

    /// The reader answered with a failure status.
    #[error("Reader rejected command 0x{command:02X} with status 0x{status:02X}")]
    Rejected { command: u8, status: u8 },

    /// The command could not be encoded.
    #[error("Invalid command: {0}")]
    Invalid(#[from] ValidationError),
}

impl CommandError {
    /// Returns true if sending the same command again may succeed.
    ///
    /// Only timeouts qualify; a rejection repeats and a dead link stays dead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }

    /// Returns true if the link can no longer carry commands.
    pub fn is_link_down(&self) -> bool {
        matches!(self, CommandError::LinkDown)
    }
}

// =============================================================================
// Link Errors
// =============================================================================

/// Why a link disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Too many consecutive decode failures; the byte stream is not framed
    /// the way the codec expects.
    #[error("Link desynchronized after {failures} consecutive decode failures")]
    Desynchronized { failures: u32 },

    #[error("Serial I/O error: {0}")]
    Io(String),

    /// Closed on request.
    #[error("Link closed")]
    Closed,
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

// =============================================================================
// Engine Errors
// =============================================================================

/// Failure of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    #[error("Inventory store: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid reader configuration: {0}")]
    Validation(#[from] ValidationError),

    /// The engine task has exited.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Command(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Configuration Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    LoadFailed(String),

    #[error("Failed to save config: {0}")]
    SaveFailed(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::LoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::LoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(err: toml::ser::Error) -> Self {
        ConfigError::SaveFailed(err.to_string())
    }
}

impl From<ValidationError> for ConfigError {
    fn from(err: ValidationError) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

impl ConfigError {
    pub fn is_config_error(&self) -> bool {
        matches!(self, ConfigError::Invalid(_))
    }
}

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

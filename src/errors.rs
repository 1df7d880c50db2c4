// SPDX-License-Identifier: MPL-2.0

//! Error types for the device manager and its stream engines
//!
//! Errors are split by how far they are allowed to travel. Lookup misses and
//! invalid API arguments go back to the caller. Hardware command failures stay
//! inside the command worker. Engine crashes and capture open failures surface
//! as events but never take the manager down.

use std::fmt;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Main error type
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// No connected device has this bus identifier
    DeviceNotFound(String),
    /// Wrong device-type combination for a leader/follower operation
    InvalidRelationship(String),
    /// A register-level command could not be executed
    HardwareCommand(String),
    /// A capture device could not be opened or negotiated
    CaptureOpen { path: String, reason: String },
    /// The external pipeline process could not be spawned or crashed
    StreamProcess(String),
    /// Unknown option name, out-of-range value, or malformed request
    InvalidArgument(String),
    /// Persisted device settings could not be read or written
    Settings(String),
    /// Configuration file errors
    Config(String),
    /// Filesystem / socket errors
    Io(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DeviceNotFound(bus) => write!(f, "Device not found: {}", bus),
            AppError::InvalidRelationship(msg) => write!(f, "Invalid relationship: {}", msg),
            AppError::HardwareCommand(msg) => write!(f, "Hardware command failed: {}", msg),
            AppError::CaptureOpen { path, reason } => {
                write!(f, "Unable to open capture device {}: {}", path, reason)
            }
            AppError::StreamProcess(msg) => write!(f, "Stream process error: {}", msg),
            AppError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            AppError::Settings(msg) => write!(f, "Settings error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Settings(err.to_string())
    }
}

impl From<crate::backends::camera::CaptureError> for AppError {
    fn from(err: crate::backends::camera::CaptureError) -> Self {
        AppError::CaptureOpen {
            path: err.path().to_string(),
            reason: err.to_string(),
        }
    }
}

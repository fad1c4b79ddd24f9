//! Error types for crashprobe.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for crashprobe operations.
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Main error type for crashprobe.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Failed to classify crash {crash}: {reason}")]
    ClassifyFailed { crash: String, reason: String },

    #[error("Command failed: {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Invalid source pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Telemetry send failed: {reason}")]
    TelemetrySendFailed { reason: String },

    #[error("Guest path not found: {dpath}")]
    GuestPathNotFound { dpath: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProbeError {
    /// Wrap an `std::io::Error` with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

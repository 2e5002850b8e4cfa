//! Error types for the block connectors
//!
//! Provides structured error types for device discovery, multipath
//! resolution, initiator daemon invocation, and device detach.

use std::io;
use thiserror::Error;

/// Unified error type for connector operations
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Discovery Errors
    // =========================================================================
    #[error("No disk found for target {target}")]
    NoDiskFound { target: String },

    #[error("Failed to resolve {path}: {source}")]
    PathResolution {
        path: String,
        #[source]
        source: io::Error,
    },

    // =========================================================================
    // Initiator Errors
    // =========================================================================
    #[error("Command failed: {command} (status {status:?}): {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("iSCSI iface {iface} unavailable: {reason}")]
    IfaceUnavailable { iface: String, reason: String },

    #[error("iSCSI initiator unavailable: {0}")]
    InitiatorUnavailable(String),

    // =========================================================================
    // Detach Errors
    // =========================================================================
    #[error("Invalid device path: {path}")]
    InvalidDevicePath { path: String },

    #[error("Detach failed for {failed} of {attempted} devices, last error: {last}")]
    DetachFailed {
        attempted: usize,
        failed: usize,
        last: Box<Error>,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a [`Error::Command`] from a command line and its captured output
    pub fn command(command: impl Into<String>, status: Option<i32>, stderr: impl Into<String>) -> Self {
        Error::Command {
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }

    /// Check if retrying the whole operation later may succeed
    ///
    /// Devices appear asynchronously after login or a SCSI rescan, and the
    /// initiator daemon can fail transiently while another session is being
    /// set up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NoDiskFound { .. }
            | Error::Command { .. }
            | Error::PathResolution { .. }
            | Error::Io(_) => true,
            Error::DetachFailed { last, .. } => last.is_retryable(),
            Error::IfaceUnavailable { .. }
            | Error::InitiatorUnavailable(_)
            | Error::InvalidDevicePath { .. }
            | Error::Configuration(_)
            | Error::ConfigParse(_) => false,
        }
    }

    /// Exit status of the failed command, if this is a command error
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Error::Command { status, .. } => *status,
            _ => None,
        }
    }
}

/// Result type alias for connector operations
pub type Result<T> = std::result::Result<T, Error>;

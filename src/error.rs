//! Error types for Piman
//!
//! Reader and sink errors never leave their component: they are logged and
//! turned into absent metrics or skipped writes. [`PimanError`] covers the
//! process-level failures (configuration, startup, scheduling).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Piman operations
pub type Result<T> = std::result::Result<T, PimanError>;

/// Main error type for process-level operations
#[derive(Error, Debug)]
pub enum PimanError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The digital input line could not be claimed at startup
    #[error("Failed to open digital line on pin {pin}: {reason}")]
    LineOpen { pin: u8, reason: String },

    /// A group log file could not be opened
    #[error("Failed to open log file {}: {reason}", path.display())]
    LogFile { path: PathBuf, reason: String },

    /// Invalid scheduler usage
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a single sensor read
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    /// Resource, file or subprocess missing or inaccessible
    #[error("{resource} unavailable: {reason}")]
    SourceUnavailable { resource: String, reason: String },

    /// Unexpected output shape from a diagnostic source
    #[error("Could not parse {resource} output {output:?}")]
    ParseFailure { resource: String, output: String },

    /// Access to the resource was refused
    #[error("Permission denied for {resource}: {reason}")]
    PermissionDenied { resource: String, reason: String },

    /// Blocking read exceeded its deadline
    #[error("{resource} timed out after {timeout_ms}ms")]
    Timeout { resource: String, timeout_ms: u64 },
}

impl SensorError {
    /// Resource is missing or inaccessible
    pub fn unavailable(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Output could not be parsed
    pub fn parse(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ParseFailure {
            resource: resource.into(),
            output: output.into(),
        }
    }

    /// Classify an I/O error raised while touching `resource`
    pub fn from_io(resource: impl Into<String>, error: &io::Error) -> Self {
        let resource = resource.into();
        match error.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                resource,
                reason: error.to_string(),
            },
            io::ErrorKind::NotFound => Self::SourceUnavailable {
                resource,
                reason: "file not found".to_string(),
            },
            _ => Self::SourceUnavailable {
                resource,
                reason: error.to_string(),
            },
        }
    }

    /// Short machine-friendly name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::ParseFailure { .. } => "parse_failure",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Failure while handing a snapshot to a sink
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Append or print failed
    #[error("Sink {sink} failed to write: {reason}")]
    WriteFailure { sink: String, reason: String },
}

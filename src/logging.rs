//! Group logging handle and append-only log files
//!
//! Every reader group receives a [`Logger`] at construction instead of
//! relying on a process-wide logger. Records go to the group's [`LogFile`]
//! as one JSON object per line and are mirrored to `tracing`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{PimanError, Result};

/// Log record severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only line-oriented file, opened once and kept for the process lifetime
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogFile {
    /// Open `path` for appending, creating it and its parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log_error = |e: io::Error| PimanError::LogFile {
            path: path.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(log_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(log_error)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; a trailing newline is added
    pub fn append_line(&self, line: &str) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        // Whole line in a single write.
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)?;
        file.flush()
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    timestamp: String,
    level: Severity,
    group: &'a str,
    message: &'a str,
}

/// Logging handle for one reader group
///
/// A disabled logger accepts every call and produces no output.
#[derive(Debug, Clone)]
pub struct Logger {
    group: String,
    file: Option<Arc<LogFile>>,
    enabled: bool,
}

impl Logger {
    /// Logger that writes to `file` and mirrors to `tracing`
    pub fn to_file(group: impl Into<String>, file: Arc<LogFile>) -> Self {
        Self {
            group: group.into(),
            file: Some(file),
            enabled: true,
        }
    }

    /// Logger that only mirrors to `tracing`
    pub fn tracing_only(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            file: None,
            enabled: true,
        }
    }

    /// No-op logger
    pub fn disabled(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            file: None,
            enabled: false,
        }
    }

    /// Group this logger belongs to
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Whether calls produce any output
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record a message
    pub fn log(&self, severity: Severity, message: &str) {
        if !self.enabled {
            return;
        }

        match severity {
            Severity::Debug => tracing::debug!(group = %self.group, "{}", message),
            Severity::Info => tracing::info!(group = %self.group, "{}", message),
            Severity::Warning => tracing::warn!(group = %self.group, "{}", message),
            Severity::Error => tracing::error!(group = %self.group, "{}", message),
        }

        if let Some(file) = &self.file {
            let record = LogRecord {
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                level: severity,
                group: &self.group,
                message,
            };
            let written = serde_json::to_string(&record)
                .map_err(io::Error::from)
                .and_then(|line| file.append_line(&line));
            if let Err(e) = written {
                tracing::warn!(
                    group = %self.group,
                    path = %file.path().display(),
                    "Failed to append log record: {}",
                    e
                );
            }
        }
    }

    pub fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Severity::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }
}

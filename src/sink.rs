//! Snapshot consumers
//!
//! Sinks are invoked synchronously by the scheduler, in registration order.
//! A failing sink reports a [`SinkError`]; the scheduler logs it and moves on.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SinkError;
use crate::logging::LogFile;
use crate::snapshot::Snapshot;

/// Consumer of collected snapshots
pub trait Sink: Send + Sync {
    /// Short identifier used in diagnostics
    fn name(&self) -> &str;

    fn consume(&self, group: &str, snapshot: &Snapshot) -> Result<(), SinkError>;
}

/// Prints `[group] {metrics}` lines to stdout
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn consume(&self, group: &str, snapshot: &Snapshot) -> Result<(), SinkError> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "[{}] {}", group, snapshot.metrics_json())
            .and_then(|_| out.flush())
            .map_err(|e| SinkError::WriteFailure {
                sink: self.name().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Appends one JSON record per snapshot to a group log file
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    file: Arc<LogFile>,
    name: String,
}

impl JsonLinesSink {
    pub fn new(file: Arc<LogFile>) -> Self {
        let name = format!("jsonl:{}", file.path().display());
        Self { file, name }
    }
}

impl Sink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, _group: &str, snapshot: &Snapshot) -> Result<(), SinkError> {
        let write_failure = |reason: String| SinkError::WriteFailure {
            sink: self.name.clone(),
            reason,
        };
        let line = snapshot.to_log_line().map_err(|e| write_failure(e.to_string()))?;
        self.file
            .append_line(&line)
            .map_err(|e| write_failure(e.to_string()))
    }
}

/// Keeps every consumed snapshot in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    snapshots: Mutex<Vec<Snapshot>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of all snapshots received so far, oldest first
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn consume(&self, _group: &str, snapshot: &Snapshot) -> Result<(), SinkError> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(snapshot.clone());
        Ok(())
    }
}

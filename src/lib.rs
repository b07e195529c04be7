//! # Piman - periodic telemetry for single-board computers
//!
//! Samples operating-system metrics, board vitals and external-power presence
//! on independent intervals, and hands each merged snapshot to a set of sinks.
//!
//! ## Key Features
//!
//! - **Isolated reads**: a failing or panicking reader yields absent metrics,
//!   never a misleading zero, and never stops the rest of its group
//! - **Independent cadence**: one timer per group
//! - **Append-only logs**: one JSON record per snapshot, re-parseable
//! - **Scoped hardware handles**: the GPIO line is released on shutdown
//!
//! ## Quick Start
//!
//! ```rust
//! use piman::{Logger, Metric, ReaderGroup, SensorError, SensorReader};
//!
//! struct Constant;
//!
//! impl SensorReader for Constant {
//!     fn label(&self) -> &str {
//!         "constant"
//!     }
//!
//!     fn metric_names(&self) -> Vec<String> {
//!         vec!["answer".to_string()]
//!     }
//!
//!     fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
//!         Ok(vec![Metric::new("answer", 42i64)])
//!     }
//! }
//!
//! let mut group = ReaderGroup::new("demo", Logger::disabled("demo")).with_reader(Constant);
//! let snapshot = group.collect();
//! assert_eq!(snapshot.get("answer").and_then(Metric::as_i64), Some(42));
//!
//! let line = snapshot.to_log_line().unwrap();
//! assert!(line.contains(r#""answer":42"#));
//! ```
//!
//! ## Modules
//!
//! - [`metric`]: Metric values and unit conversion
//! - [`snapshot`]: Snapshots and their log record form
//! - [`reader`]: Reader contract and isolation boundary
//! - [`group`]: Ordered reader groups
//! - [`readers`]: OS, board and power readers
//! - [`sink`]: Snapshot consumers
//! - [`scheduler`]: Periodic driver with graceful shutdown
//! - [`logging`]: Per-group logging handle
//! - [`config`]: Defaults, TOML file and environment overrides

// Modules
pub mod config;
pub mod error;
pub mod group;
pub mod logging;
pub mod metric;
pub mod reader;
pub mod readers;
pub mod scheduler;
pub mod sink;
pub mod snapshot;

// Re-exports for convenient access
pub use config::{Config, GroupConfig};
pub use error::{PimanError, Result, SensorError, SinkError};
pub use group::ReaderGroup;
pub use logging::{LogFile, Logger, Severity};
pub use metric::{Metric, MetricValue};
pub use reader::{read_isolated, SensorReader};
pub use readers::{HARDWARE_GROUP, OS_GROUP, POWER_GROUP};
pub use scheduler::{GroupReport, RunReport, Scheduler, SchedulerState};
pub use sink::{ConsoleSink, JsonLinesSink, MemorySink, Sink};
pub use snapshot::{Snapshot, SnapshotBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

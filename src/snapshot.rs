//! Snapshot - one collection cycle of a reader group
//!
//! Snapshots are built once per tick and never mutated afterwards. The log
//! record form is a single JSON object per line:
//!
//! ```text
//! {"timestamp":"2025-03-01T10:00:00.000Z","group":"hw_info","metrics":{"temperature":42.8,"fan.speed":null}}
//! ```
//!
//! Absent metrics are written as `null`, never as zero.

use std::fmt;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::metric::{Metric, MetricValue};

/// Aggregated, timestamped set of metrics from one group
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    group: String,
    timestamp: DateTime<Utc>,
    metrics: Vec<Metric>,
}

impl Snapshot {
    /// Group that produced this snapshot
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Collection time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Look up a metric by name
    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Metrics in collection order
    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter()
    }

    /// Number of metrics
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether the snapshot holds no metrics
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Number of metrics that were actually read
    pub fn present_count(&self) -> usize {
        self.metrics.iter().filter(|m| m.present()).count()
    }

    /// Metric names mapped to values, `null` for absent ones
    pub fn metrics_json(&self) -> String {
        serde_json::to_string(&MetricMapRef(&self.metrics)).unwrap_or_else(|_| "{}".to_string())
    }

    /// Encode as one log record line (no trailing newline)
    pub fn to_log_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&LogRecordRef {
            timestamp: self
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            group: &self.group,
            metrics: MetricMapRef(&self.metrics),
        })
    }

    /// Decode a log record line produced by [`Snapshot::to_log_line`]
    pub fn from_log_line(line: &str) -> Result<Self, serde_json::Error> {
        let record: LogRecord = serde_json::from_str(line.trim())?;
        let timestamp = DateTime::parse_from_rfc3339(&record.timestamp)
            .map_err(|e| <serde_json::Error as de::Error>::custom(e))?
            .with_timezone(&Utc);

        let mut builder = SnapshotBuilder::new(record.group);
        for metric in record.metrics.0 {
            builder.insert(metric);
        }
        Ok(builder.build_at(timestamp))
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.group, self.metrics_json())
    }
}

/// Accumulates metrics for a snapshot under construction
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    group: String,
    metrics: Vec<Metric>,
}

impl SnapshotBuilder {
    /// Start a snapshot for `group`
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            metrics: Vec::new(),
        }
    }

    /// Add a metric; an existing metric with the same name is replaced in place
    ///
    /// Returns `true` when a previous value was overwritten.
    pub fn insert(&mut self, metric: Metric) -> bool {
        match self.metrics.iter_mut().find(|m| m.name == metric.name) {
            Some(existing) => {
                *existing = metric;
                true
            }
            None => {
                self.metrics.push(metric);
                false
            }
        }
    }

    /// Freeze the snapshot with the current time
    pub fn build(self) -> Snapshot {
        self.build_at(Utc::now())
    }

    /// Freeze the snapshot with an explicit timestamp
    ///
    /// The timestamp is truncated to the millisecond precision of the log record.
    pub fn build_at(self, timestamp: DateTime<Utc>) -> Snapshot {
        Snapshot {
            group: self.group,
            timestamp: timestamp.trunc_subsecs(3),
            metrics: self.metrics,
        }
    }
}

#[derive(Serialize)]
struct LogRecordRef<'a> {
    timestamp: String,
    group: &'a str,
    metrics: MetricMapRef<'a>,
}

#[derive(Deserialize)]
struct LogRecord {
    timestamp: String,
    group: String,
    metrics: MetricMap,
}

struct MetricMapRef<'a>(&'a [Metric]);

impl Serialize for MetricMapRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for metric in self.0 {
            map.serialize_entry(&metric.name, &metric.value)?;
        }
        map.end()
    }
}

/// Metrics decoded in document order
struct MetricMap(Vec<Metric>);

impl<'de> Deserialize<'de> for MetricMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MetricMapVisitor;

        impl<'de> Visitor<'de> for MetricMapVisitor {
            type Value = MetricMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of metric names to values or null")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<MetricMap, A::Error> {
                let mut metrics = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) =
                    access.next_entry::<String, Option<MetricValue>>()?
                {
                    metrics.push(Metric { name, value });
                }
                Ok(MetricMap(metrics))
            }
        }

        deserializer.deserialize_map(MetricMapVisitor)
    }
}

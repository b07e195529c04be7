//! Sensor reader contract and isolation boundary
//!
//! A [`SensorReader`] performs one read against an external resource. Readers
//! report failures as [`SensorError`]; [`read_isolated`] is the boundary that
//! turns any failure, including a panic, into absent metrics so the rest of
//! the group keeps running.

use std::panic::{self, AssertUnwindSafe};

use crate::error::SensorError;
use crate::logging::Logger;
use crate::metric::{Metric, MetricValue};

/// One read operation producing a fixed set of metrics
pub trait SensorReader: Send {
    /// Human-readable description used in log messages (e.g. "CPU usage")
    fn label(&self) -> &str;

    /// Names of the metrics emitted by every read, in emission order
    fn metric_names(&self) -> Vec<String>;

    /// Perform the read
    ///
    /// Individual metrics may be returned absent when only part of the read
    /// failed; a whole-read failure is reported as an error.
    fn read(&mut self) -> Result<Vec<Metric>, SensorError>;

    /// Release any resource held by the reader
    fn release(&mut self) {}
}

/// Run `reader` behind the isolation boundary
///
/// Always returns exactly one metric per declared name, in declaration order.
/// Non-finite floats are logged and reported absent.
pub fn read_isolated(reader: &mut dyn SensorReader, logger: &Logger) -> Vec<Metric> {
    let names = reader.metric_names();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| reader.read()));
    let metrics = match outcome {
        Ok(Ok(metrics)) => metrics,
        Ok(Err(e)) => {
            logger.error(&format!("Error getting {}: {}", reader.label(), e));
            return names.into_iter().map(Metric::absent).collect();
        }
        Err(payload) => {
            logger.error(&format!(
                "Error getting {}: reader panicked: {}",
                reader.label(),
                panic_message(payload.as_ref())
            ));
            return names.into_iter().map(Metric::absent).collect();
        }
    };

    for metric in &metrics {
        if !names.contains(&metric.name) {
            logger.warn(&format!(
                "{} produced undeclared metric {}, dropped",
                reader.label(),
                metric.name
            ));
        }
    }

    let mut metrics = metrics;
    names
        .into_iter()
        .map(|name| match metrics.iter().rposition(|m| m.name == name) {
            Some(idx) => finite_or_absent(metrics.swap_remove(idx), reader.label(), logger),
            None => Metric::absent(name),
        })
        .collect()
}

// NaN and infinities have no JSON form; they would be logged as null.
fn finite_or_absent(metric: Metric, label: &str, logger: &Logger) -> Metric {
    match metric.value {
        Some(MetricValue::Float(v)) if !v.is_finite() => {
            logger.error(&format!(
                "Error getting {}: non-finite value {} for {}",
                label, v, metric.name
            ));
            Metric::absent(metric.name)
        }
        _ => metric,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

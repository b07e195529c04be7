//! Metric value model and unit conversions
//!
//! A [`Metric`] always carries its name. Its value is `None` when the read
//! failed or the source was unavailable; consumers must treat such a metric
//! as unknown, never as zero or `false`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bytes in one gibibyte
pub const BYTES_PER_GIB: f64 = 1_073_741_824.0;

/// Bytes in one mebibyte
pub const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Hertz in one gigahertz
pub const HZ_PER_GHZ: f64 = 1_000_000_000.0;

/// Default number of decimals kept by conversions
pub const DEFAULT_DECIMALS: u32 = 2;

/// Typed measurement value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
}

impl MetricValue {
    /// Type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// A single named measurement, possibly absent
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name, unique within its group
    pub name: String,
    /// Measured value; `None` means unknown
    pub value: Option<MetricValue>,
}

impl Metric {
    /// Create a present metric
    pub fn new(name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Create an absent metric
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Whether the value was actually read
    pub fn present(&self) -> bool {
        self.value.is_some()
    }

    /// Value as a float; integers are widened, booleans are not converted
    pub fn as_f64(&self) -> Option<f64> {
        match self.value? {
            MetricValue::Float(v) => Some(v),
            MetricValue::Integer(v) => Some(v as f64),
            MetricValue::Boolean(_) => None,
        }
    }

    /// Value as an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self.value? {
            MetricValue::Integer(v) => Some(v),
            _ => None,
        }
    }

    /// Value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self.value? {
            MetricValue::Boolean(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => write!(f, "{}=unknown", self.name),
        }
    }
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Convert a byte count to gibibytes
pub fn bytes_to_gib(bytes: u64, decimals: u32) -> f64 {
    round_to(bytes as f64 / BYTES_PER_GIB, decimals)
}

/// Convert a byte count to mebibytes
pub fn bytes_to_mib(bytes: u64, decimals: u32) -> f64 {
    round_to(bytes as f64 / BYTES_PER_MIB, decimals)
}

/// Convert a frequency in hertz to gigahertz
pub fn hz_to_ghz(hz: u64, decimals: u32) -> f64 {
    round_to(hz as f64 / HZ_PER_GHZ, decimals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_one_gib() {
        assert_eq!(bytes_to_gib(1_073_741_824, 2), 1.00);
    }

    #[test]
    fn test_two_mib() {
        assert_eq!(bytes_to_mib(2_097_152, 2), 2.00);
    }

    #[test]
    fn test_conversion_is_idempotent() {
        let raw = 3_987_654_321u64;
        assert_eq!(bytes_to_gib(raw, 2), bytes_to_gib(raw, 2));
        assert_eq!(bytes_to_mib(raw, 2), bytes_to_mib(raw, 2));
        assert_relative_eq!(bytes_to_gib(raw, 2), 3.71);
    }

    #[test]
    fn test_hz_to_ghz() {
        assert_relative_eq!(hz_to_ghz(1_500_398_464, 2), 1.5);
        assert_relative_eq!(hz_to_ghz(2_400_000_000, 2), 2.4);
    }

    #[test]
    fn test_round_to() {
        assert_relative_eq!(round_to(0.8563, 2), 0.86);
        assert_relative_eq!(round_to(12.344, 2), 12.34);
        assert_relative_eq!(round_to(-1.005, 0), -1.0);
    }

    #[test]
    fn test_absent_metric_has_no_value() {
        let metric = Metric::absent("cpu");
        assert!(!metric.present());
        assert_eq!(metric.as_f64(), None);
        assert_eq!(metric.as_i64(), None);
        assert_eq!(metric.as_bool(), None);
        assert_eq!(metric.to_string(), "cpu=unknown");
    }

    #[test]
    fn test_present_metric_accessors() {
        let metric = Metric::new("process", 212i64);
        assert!(metric.present());
        assert_eq!(metric.as_i64(), Some(212));
        assert_eq!(metric.as_f64(), Some(212.0));
        assert_eq!(metric.as_bool(), None);

        let metric = Metric::new("electricity", false);
        assert_eq!(metric.as_bool(), Some(false));
        assert!(metric.present());
    }
}

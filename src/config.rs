//! Process configuration
//!
//! Loaded once at startup: built-in defaults, then an optional TOML file,
//! then environment overrides. Overrides come from the process environment
//! and, for keys it does not set, from a `.env` file (or `.env.defaults`
//! when there is no `.env`) in the working directory. Nothing is re-read at
//! runtime.
//!
//! ```toml
//! ac_signal_pin = 27
//! logging_enabled = true
//!
//! [os]
//! interval_secs = 5
//! log_file = "piman/os_info.log"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{PimanError, Result};
use crate::readers::power::DEFAULT_AC_SIGNAL_PIN;

/// Env files looked up in the working directory, first match wins
pub const ENV_FILES: [&str; 2] = [".env", ".env.defaults"];

/// Raspberry Pi 5 fan tachometer
pub const DEFAULT_FAN_SPEED_FILE: &str = "/sys/devices/platform/cooling_fan/hwmon/hwmon2/fan1_input";

/// Raspberry Pi 5 fan duty cycle
pub const DEFAULT_FAN_PWM_FILE: &str = "/sys/devices/platform/cooling_fan/hwmon/hwmon2/pwm1";

/// Cadence and log destination of one reader group
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    /// Collection interval in seconds
    pub interval_secs: u64,

    /// Append-only log of snapshots and reader errors
    pub log_file: PathBuf,
}

impl GroupConfig {
    pub fn new(interval_secs: u64, log_file: impl Into<PathBuf>) -> Self {
        Self {
            interval_secs,
            log_file: log_file.into(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Collector configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// OS metrics group
    pub os: GroupConfig,

    /// Board vitals group
    pub hardware: GroupConfig,

    /// External power group
    pub power: GroupConfig,

    /// BCM pin wired to the AC-present signal
    pub ac_signal_pin: u8,

    pub fan_speed_file: PathBuf,

    pub fan_pwm_file: PathBuf,

    /// When false, group loggers and snapshot log files are disabled
    pub logging_enabled: bool,

    /// Delay before the first collection, in seconds
    pub start_delay_secs: u64,

    /// Firmware query tool
    pub vcgencmd_path: PathBuf,

    /// Deadline for one firmware query, in milliseconds
    pub command_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            os: GroupConfig::new(5, "piman/os_info.log"),
            hardware: GroupConfig::new(5, "piman/hw_info.log"),
            power: GroupConfig::new(2, "piman/ac_info.log"),
            ac_signal_pin: DEFAULT_AC_SIGNAL_PIN,
            fan_speed_file: PathBuf::from(DEFAULT_FAN_SPEED_FILE),
            fan_pwm_file: PathBuf::from(DEFAULT_FAN_PWM_FILE),
            logging_enabled: true,
            start_delay_secs: 0,
            vcgencmd_path: PathBuf::from("vcgencmd"),
            command_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Defaults, optional file, process environment, env file; validated
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let file_vars = match find_env_file(Path::new(".")) {
            Some(env_file) => {
                info!(path = %env_file.display(), "Loading env file");
                read_env_file(&env_file)?
            }
            None => HashMap::new(),
        };
        config.apply_env_from(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            PimanError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PimanError::Config(e.to_string()))
    }

    /// Apply overrides from an environment-like lookup
    ///
    /// `FETCH_INTERVAL` sets every group; the per-group variables win over it.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = parse_var::<u64, _>(&lookup, "FETCH_INTERVAL")? {
            self.os.interval_secs = secs;
            self.hardware.interval_secs = secs;
            self.power.interval_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "OS_FETCH_INTERVAL")? {
            self.os.interval_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "HW_FETCH_INTERVAL")? {
            self.hardware.interval_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "AC_FETCH_INTERVAL")? {
            self.power.interval_secs = secs;
        }
        if let Some(pin) = parse_var(&lookup, "AC_SIGNAL_PIN")? {
            self.ac_signal_pin = pin;
        }
        if let Some(secs) = parse_var(&lookup, "START_DELAY")? {
            self.start_delay_secs = secs;
        }
        if let Some(value) = non_empty(&lookup, "LOGGING_ENABLED") {
            self.logging_enabled = parse_bool("LOGGING_ENABLED", &value)?;
        }

        let paths: [(&str, &mut PathBuf); 6] = [
            ("RPI_FAN_SPEED_FILE", &mut self.fan_speed_file),
            ("RPI_FAN_PWM_FILE", &mut self.fan_pwm_file),
            ("LOG_FILE_OS_INFO", &mut self.os.log_file),
            ("LOG_FILE_HW_INFO", &mut self.hardware.log_file),
            ("LOG_FILE_AC_INFO", &mut self.power.log_file),
            ("VCGENCMD_PATH", &mut self.vcgencmd_path),
        ];
        for (key, target) in paths {
            if let Some(value) = non_empty(&lookup, key) {
                *target = PathBuf::from(value);
            }
        }
        Ok(())
    }

    /// Reject settings the scheduler or readers cannot work with
    pub fn validate(&self) -> Result<()> {
        for (name, group) in [
            ("os", &self.os),
            ("hardware", &self.hardware),
            ("power", &self.power),
        ] {
            if group.interval_secs == 0 {
                return Err(PimanError::Config(format!(
                    "{} interval must be at least 1 second",
                    name
                )));
            }
            if group.log_file.as_os_str().is_empty() {
                return Err(PimanError::Config(format!("{} log file is empty", name)));
            }
        }
        if self.command_timeout_ms == 0 {
            return Err(PimanError::Config(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_secs(self.start_delay_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// First of [`ENV_FILES`] present in `dir`
pub fn find_env_file(dir: &Path) -> Option<PathBuf> {
    ENV_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Parse a dotenv file without touching the process environment
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let config_err = |e: dotenvy::Error| PimanError::Config(format!("{}: {}", path.display(), e));
    dotenvy::from_path_iter(path)
        .map_err(config_err)?
        .map(|item| item.map_err(config_err))
        .collect()
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, key)
        .map(|value| {
            value
                .parse()
                .map_err(|e| PimanError::Config(format!("{}={:?}: {}", key, value, e)))
        })
        .transpose()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PimanError::Config(format!(
            "{}={:?}: expected a boolean",
            key, value
        ))),
    }
}

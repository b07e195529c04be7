//! Board vitals: SoC temperature, core voltage, ARM clock and fan state
//!
//! The first three come from the `vcgencmd` firmware tool, fan figures from
//! sysfs hwmon files.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::SensorError;
use crate::group::ReaderGroup;
use crate::logging::Logger;
use crate::metric::{hz_to_ghz, round_to, Metric, DEFAULT_DECIMALS};
use crate::reader::SensorReader;

/// Default location of the firmware query tool
pub const DEFAULT_VCGENCMD: &str = "vcgencmd";

/// Default subprocess timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs a firmware query and returns its standard output
pub trait CommandRunner: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<String, SensorError>;
}

/// `vcgencmd` subprocess runner with a hard timeout
#[derive(Debug, Clone)]
pub struct Vcgencmd {
    program: PathBuf,
    timeout: Duration,
}

impl Default for Vcgencmd {
    fn default() -> Self {
        Self::new(DEFAULT_VCGENCMD, DEFAULT_COMMAND_TIMEOUT)
    }
}

impl Vcgencmd {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn resource(&self, args: &[&str]) -> String {
        format!("{} {}", self.program.display(), args.join(" "))
    }
}

impl CommandRunner for Vcgencmd {
    fn run(&self, args: &[&str]) -> Result<String, SensorError> {
        let resource = self.resource(args);
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SensorError::from_io(resource.clone(), &e))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SensorError::Timeout {
                        resource,
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(SensorError::from_io(resource, &e)),
            }
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)
                .map_err(|e| SensorError::from_io(resource.clone(), &e))?;
        }

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(SensorError::unavailable(
                resource,
                format!("exited with {}: {}", status, stderr.trim()),
            ));
        }
        Ok(stdout)
    }
}

/// Parse `key=<number><unit>` output, e.g. `temp=42.8'C` or `volt=0.8625V`
///
/// The number follows the last `=`. NaN and infinities are rejected.
pub fn parse_reading(output: &str, unit: &str) -> Option<f64> {
    let (_, value) = output.trim().rsplit_once('=')?;
    let number = match value.find(unit) {
        Some(idx) => &value[..idx],
        None => value,
    };
    number.trim().parse().ok().filter(|v: &f64| v.is_finite())
}

/// Parse `frequency(48)=1500398464` output into Hz
pub fn parse_frequency(output: &str) -> Option<u64> {
    output.trim().rsplit('=').next()?.trim().parse().ok()
}

/// `temperature`: SoC temperature in Celsius
pub struct TemperatureReader {
    runner: Arc<dyn CommandRunner>,
}

impl TemperatureReader {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl SensorReader for TemperatureReader {
    fn label(&self) -> &str {
        "temperature"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["temperature".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let output = self.runner.run(&["measure_temp"])?;
        let celsius =
            parse_reading(&output, "'").ok_or_else(|| SensorError::parse("measure_temp", &output))?;
        Ok(vec![Metric::new("temperature", celsius)])
    }
}

/// `voltage`: core voltage in volts, 2 decimals
pub struct VoltageReader {
    runner: Arc<dyn CommandRunner>,
}

impl VoltageReader {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl SensorReader for VoltageReader {
    fn label(&self) -> &str {
        "voltage"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["voltage".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let output = self.runner.run(&["measure_volts"])?;
        let volts =
            parse_reading(&output, "V").ok_or_else(|| SensorError::parse("measure_volts", &output))?;
        Ok(vec![Metric::new("voltage", round_to(volts, DEFAULT_DECIMALS))])
    }
}

/// `clock`: ARM core frequency in GHz, 2 decimals
pub struct ClockReader {
    runner: Arc<dyn CommandRunner>,
}

impl ClockReader {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl SensorReader for ClockReader {
    fn label(&self) -> &str {
        "clock speed"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["clock".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let output = self.runner.run(&["measure_clock", "arm"])?;
        let hz = parse_frequency(&output)
            .ok_or_else(|| SensorError::parse("measure_clock arm", &output))?;
        Ok(vec![Metric::new("clock", hz_to_ghz(hz, DEFAULT_DECIMALS))])
    }
}

fn read_integer_file(path: &Path) -> Result<i64, SensorError> {
    let resource = path.display().to_string();
    let contents = fs::read_to_string(path).map_err(|e| SensorError::from_io(resource.clone(), &e))?;
    contents
        .trim()
        .parse()
        .map_err(|_| SensorError::parse(resource, contents.trim()))
}

/// `fan.speed`: fan RPM from the hwmon tachometer file
pub struct FanSpeedReader {
    path: PathBuf,
}

impl FanSpeedReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SensorReader for FanSpeedReader {
    fn label(&self) -> &str {
        "fan speed"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["fan.speed".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let rpm = read_integer_file(&self.path)?;
        if rpm < 0 {
            return Err(SensorError::parse(self.path.display().to_string(), rpm.to_string()));
        }
        Ok(vec![Metric::new("fan.speed", rpm)])
    }
}

/// `fan.pwm`: fan duty cycle, 0..=255
pub struct FanPwmReader {
    path: PathBuf,
}

impl FanPwmReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SensorReader for FanPwmReader {
    fn label(&self) -> &str {
        "fan PWM"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["fan.pwm".to_string()]
    }

    fn read(&mut self) -> Result<Vec<Metric>, SensorError> {
        let duty = read_integer_file(&self.path)?;
        if !(0..=255).contains(&duty) {
            return Err(SensorError::parse(self.path.display().to_string(), duty.to_string()));
        }
        Ok(vec![Metric::new("fan.pwm", duty)])
    }
}

/// Board-vitals group: temperature, voltage, clock, fan speed, fan PWM
pub fn hardware_group(
    name: impl Into<String>,
    runner: Arc<dyn CommandRunner>,
    fan_speed_file: impl Into<PathBuf>,
    fan_pwm_file: impl Into<PathBuf>,
    logger: Logger,
) -> ReaderGroup {
    ReaderGroup::new(name, logger)
        .with_reader(TemperatureReader::new(runner.clone()))
        .with_reader(VoltageReader::new(runner.clone()))
        .with_reader(ClockReader::new(runner))
        .with_reader(FanSpeedReader::new(fan_speed_file))
        .with_reader(FanPwmReader::new(fan_pwm_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct CannedRunner(HashMap<String, Result<String, SensorError>>);

    impl CommandRunner for CannedRunner {
        fn run(&self, args: &[&str]) -> Result<String, SensorError> {
            self.0
                .get(&args.join(" "))
                .cloned()
                .unwrap_or_else(|| Err(SensorError::unavailable(args.join(" "), "no canned output")))
        }
    }

    fn canned(entries: &[(&str, &str)]) -> Arc<dyn CommandRunner> {
        Arc::new(CannedRunner(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), Ok(v.to_string())))
                .collect(),
        ))
    }

    #[test]
    fn test_parse_reading() {
        assert_eq!(parse_reading("temp=42.8'C\n", "'"), Some(42.8));
        assert_eq!(parse_reading("volt=0.8625V", "V"), Some(0.8625));
        assert_eq!(parse_reading("temp=", "'"), None);
        assert_eq!(parse_reading("garbage", "'"), None);
        assert_eq!(parse_reading("error=2 temp=51.1'C", "'"), Some(51.1));
    }

    #[test]
    fn test_parse_reading_rejects_non_finite() {
        assert_eq!(parse_reading("temp=nan'C", "'"), None);
        assert_eq!(parse_reading("volt=inf V", "V"), None);
        assert_eq!(parse_reading("volt=-infinityV", "V"), None);

        let runner = canned(&[("measure_temp", "temp=NaN'C")]);
        assert!(matches!(
            TemperatureReader::new(runner).read(),
            Err(SensorError::ParseFailure { .. })
        ));
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("frequency(48)=1500398464\n"), Some(1_500_398_464));
        assert_eq!(parse_frequency("frequency(48)=abc"), None);
    }

    #[test]
    fn test_board_readers() {
        let runner = canned(&[
            ("measure_temp", "temp=42.8'C\n"),
            ("measure_volts", "volt=0.8625V\n"),
            ("measure_clock arm", "frequency(48)=1500398464\n"),
        ]);
        let temp = TemperatureReader::new(runner.clone()).read().unwrap();
        assert_eq!(temp[0].as_f64(), Some(42.8));

        let volts = VoltageReader::new(runner.clone()).read().unwrap();
        assert_relative_eq!(volts[0].as_f64().unwrap(), 0.86);

        let clock = ClockReader::new(runner).read().unwrap();
        assert_relative_eq!(clock[0].as_f64().unwrap(), 1.5);
    }

    #[test]
    fn test_unparsable_output_is_parse_failure() {
        let runner = canned(&[("measure_temp", "error=1 error_msg=\"Command not registered\"")]);
        let err = TemperatureReader::new(runner).read().unwrap_err();
        assert!(matches!(err, SensorError::ParseFailure { .. }));
    }

    #[test]
    fn test_fan_files() {
        let dir = tempdir().unwrap();
        let speed = dir.path().join("fan1_input");
        let pwm = dir.path().join("pwm1");
        fs::write(&speed, "2950\n").unwrap();
        fs::write(&pwm, "128\n").unwrap();

        assert_eq!(
            FanSpeedReader::new(&speed).read().unwrap(),
            vec![Metric::new("fan.speed", 2950i64)]
        );
        assert_eq!(
            FanPwmReader::new(&pwm).read().unwrap(),
            vec![Metric::new("fan.pwm", 128i64)]
        );
    }

    #[test]
    fn test_fan_pwm_out_of_range() {
        let dir = tempdir().unwrap();
        let pwm = dir.path().join("pwm1");
        fs::write(&pwm, "300").unwrap();
        assert!(matches!(
            FanPwmReader::new(&pwm).read(),
            Err(SensorError::ParseFailure { .. })
        ));
    }

    #[test]
    fn test_missing_fan_file_is_unavailable() {
        let dir = tempdir().unwrap();
        let err = FanSpeedReader::new(dir.path().join("missing")).read().unwrap_err();
        assert!(matches!(err, SensorError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let runner = Vcgencmd::new("/nonexistent/vcgencmd", Duration::from_millis(200));
        assert!(matches!(
            runner.run(&["measure_temp"]),
            Err(SensorError::SourceUnavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_program_times_out() {
        let runner = Vcgencmd::new("sleep", Duration::from_millis(100));
        let started = Instant::now();
        let err = runner.run(&["5"]).unwrap_err();
        assert!(matches!(err, SensorError::Timeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program_is_unavailable() {
        let runner = Vcgencmd::new("false", Duration::from_secs(2));
        assert!(matches!(
            runner.run(&[]),
            Err(SensorError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_hardware_group_order() {
        let group = hardware_group(
            "hw_info",
            canned(&[]),
            "/nonexistent/fan1_input",
            "/nonexistent/pwm1",
            Logger::disabled("hw_info"),
        );
        assert_eq!(
            group.metric_names(),
            vec!["temperature", "voltage", "clock", "fan.speed", "fan.pwm"]
        );
    }
}

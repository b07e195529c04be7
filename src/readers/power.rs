//! External power presence from a digital input line
//!
//! The line is claimed once at startup with a pull-down bias, so a floating
//! input reads as "no power". A failed claim aborts startup.

use crate::error::{PimanError, Result, SensorError};
use crate::group::ReaderGroup;
use crate::logging::Logger;
use crate::metric::Metric;
use crate::reader::SensorReader;

/// Default BCM pin of the AC-present signal
pub const DEFAULT_AC_SIGNAL_PIN: u8 = 27;

/// A claimed digital input; dropping it releases the line
pub trait DigitalLine: Send {
    /// BCM pin number
    fn pin(&self) -> u8;

    /// Current logic level, `true` for high
    fn read(&mut self) -> std::result::Result<bool, SensorError>;
}

/// GPIO input line backed by `rppal`
#[cfg(feature = "rpi")]
pub struct RppalLine {
    pin: rppal::gpio::InputPin,
}

#[cfg(feature = "rpi")]
impl RppalLine {
    /// Claim `pin` as an input with the internal pull-down enabled
    pub fn open(pin: u8) -> Result<Self> {
        let line_error = |e: rppal::gpio::Error| PimanError::LineOpen {
            pin,
            reason: e.to_string(),
        };
        let gpio = rppal::gpio::Gpio::new().map_err(line_error)?;
        let input = gpio.get(pin).map_err(line_error)?.into_input_pulldown();
        tracing::info!(pin, "Claimed digital input line");
        Ok(Self { pin: input })
    }
}

#[cfg(feature = "rpi")]
impl DigitalLine for RppalLine {
    fn pin(&self) -> u8 {
        self.pin.pin()
    }

    fn read(&mut self) -> std::result::Result<bool, SensorError> {
        Ok(self.pin.is_high())
    }
}

/// Claim the platform's digital line for `pin`
#[cfg(feature = "rpi")]
pub fn open_line(pin: u8) -> Result<Box<dyn DigitalLine>> {
    Ok(Box::new(RppalLine::open(pin)?))
}

/// Claim the platform's digital line for `pin`
#[cfg(not(feature = "rpi"))]
pub fn open_line(pin: u8) -> Result<Box<dyn DigitalLine>> {
    Err(PimanError::LineOpen {
        pin,
        reason: "built without GPIO support (enable the `rpi` feature)".to_string(),
    })
}

/// `electricity`: whether external power is present
pub struct PowerPresenceReader {
    pin: u8,
    line: Option<Box<dyn DigitalLine>>,
}

impl PowerPresenceReader {
    pub fn new(line: Box<dyn DigitalLine>) -> Self {
        Self {
            pin: line.pin(),
            line: Some(line),
        }
    }

    /// Whether the line is still held
    pub fn is_open(&self) -> bool {
        self.line.is_some()
    }
}

impl SensorReader for PowerPresenceReader {
    fn label(&self) -> &str {
        "electricity status"
    }

    fn metric_names(&self) -> Vec<String> {
        vec!["electricity".to_string()]
    }

    fn read(&mut self) -> std::result::Result<Vec<Metric>, SensorError> {
        let line = self.line.as_mut().ok_or_else(|| {
            SensorError::unavailable(format!("GPIO {}", self.pin), "line released")
        })?;
        Ok(vec![Metric::new("electricity", line.read()?)])
    }

    fn release(&mut self) {
        if self.line.take().is_some() {
            tracing::info!(pin = self.pin, "Released digital input line");
        }
    }
}

/// Power-presence group over an already claimed line
pub fn power_group(name: impl Into<String>, line: Box<dyn DigitalLine>, logger: Logger) -> ReaderGroup {
    ReaderGroup::new(name, logger).with_reader(PowerPresenceReader::new(line))
}

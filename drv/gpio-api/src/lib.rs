//! Pin vocabulary and host GPIO trait.
//!
//! This crate plays the same role for a hosted bit-banging tool that
//! `drv-stm32h7-gpio-api` plays for an embedded IPC client: it owns the
//! types that describe a pin and its configuration, and nothing else. The
//! actual register-level backend (a vendor GPIO library, or a direct
//! `/dev/mem` mapping) lives outside this workspace and is reached only
//! through the [`GpioPins`] trait.

use thiserror::Error;

/// A single GPIO line, identified by the host platform's native numbering
/// (e.g. Broadcom GPIO number on a Raspberry Pi). Unlike the STM32 port/pin
/// scheme this workspace's target platform has one flat numbering space, so
/// there is no separate `Port` type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pin(pub u8);

impl Pin {
    pub const fn new(number: u8) -> Self {
        Self(number)
    }
}

impl From<u8> for Pin {
    fn from(n: u8) -> Self {
        Self(n)
    }
}

/// Direction/function a pin can be placed in. `Alternate` covers the
/// platform's native alternate-function slots (e.g. SPI hardware mode);
/// this workspace's bus engine never selects it, since bit-banging requires
/// plain digital input/output, but the variant is kept so a backend can
/// still hand the bus back to dedicated hardware (see `SpiState::Hardware`
/// in `spi-bus-api`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
    Alternate(u8),
}

/// A digital pin level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> Self {
        matches!(level, Level::High)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum GpioError {
    #[error("gpio backend not initialized")]
    Uninitialized,
    #[error("pin {0:?} is not valid on this backend")]
    BadArg(Pin),
    #[error("gpio backend I/O failure")]
    Io,
}

/// The single seam between the bit-banged bus engine and a real host GPIO
/// backend. A backend implements this once (memory-mapped registers, a
/// vendor library, whatever is appropriate for the platform) and everything
/// above it — the SPI bus engine, the flash protocol, the FPGA controller —
/// is written against the trait alone.
pub trait GpioPins {
    /// One-time setup (e.g. mapping a peripheral register window). Must be
    /// called before any other method.
    fn init(&mut self) -> Result<(), GpioError>;

    /// Configures a pin's direction/function.
    fn set_mode(&mut self, pin: Pin, mode: PinMode) -> Result<(), GpioError>;

    /// Reads the instantaneous level of a pin.
    fn read(&self, pin: Pin) -> Result<Level, GpioError>;

    /// Drives a pin to the given level. Only meaningful if the pin is
    /// currently configured as `Output`.
    fn write(&mut self, pin: Pin, level: Level) -> Result<(), GpioError>;
}

/// An in-memory [`GpioPins`] implementation used by every test in this
/// workspace in place of a real backend. Records every mode change and
/// write, and lets a test script the levels returned by `read`.
#[derive(Debug, Default)]
pub struct MockGpio {
    initialized: bool,
    modes: std::collections::BTreeMap<Pin, PinMode>,
    levels: std::collections::BTreeMap<Pin, Level>,
    pub mode_calls: Vec<(Pin, PinMode)>,
    pub write_calls: Vec<(Pin, Level)>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sets the level a subsequent `read` of `pin` will return, without
    /// going through `write` (useful for scripting an input pin such as
    /// MISO or the FPGA's CDONE line).
    pub fn script_level(&mut self, pin: Pin, level: Level) {
        self.levels.insert(pin, level);
    }

    pub fn mode_of(&self, pin: Pin) -> Option<PinMode> {
        self.modes.get(&pin).copied()
    }
}

impl GpioPins for MockGpio {
    fn init(&mut self) -> Result<(), GpioError> {
        self.initialized = true;
        Ok(())
    }

    fn set_mode(&mut self, pin: Pin, mode: PinMode) -> Result<(), GpioError> {
        if !self.initialized {
            return Err(GpioError::Uninitialized);
        }
        self.modes.insert(pin, mode);
        self.mode_calls.push((pin, mode));
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        if !self.initialized {
            return Err(GpioError::Uninitialized);
        }
        Ok(self.levels.get(&pin).copied().unwrap_or(Level::Low))
    }

    fn write(&mut self, pin: Pin, level: Level) -> Result<(), GpioError> {
        if !self.initialized {
            return Err(GpioError::Uninitialized);
        }
        self.levels.insert(pin, level);
        self.write_calls.push((pin, level));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_backend_rejects_calls() {
        let mut gpio = MockGpio::new();
        assert_eq!(
            gpio.set_mode(Pin::new(4), PinMode::Output),
            Err(GpioError::Uninitialized)
        );
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut gpio = MockGpio::new();
        gpio.init().unwrap();
        gpio.set_mode(Pin::new(4), PinMode::Output).unwrap();
        gpio.write(Pin::new(4), Level::High).unwrap();
        assert_eq!(gpio.read(Pin::new(4)).unwrap(), Level::High);
    }

    #[test]
    fn scripted_input_level_is_observed_without_a_write() {
        let mut gpio = MockGpio::new();
        gpio.init().unwrap();
        gpio.set_mode(Pin::new(7), PinMode::Input).unwrap();
        gpio.script_level(Pin::new(7), Level::High);
        assert_eq!(gpio.read(Pin::new(7)).unwrap(), Level::High);
    }
}

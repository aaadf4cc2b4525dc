//! iCE40 FPGA reset/boot-mode controller.
//!
//! `drv-ice40-spi-program` drives CRESET_B/CDONE over `sys_api` to bring an
//! FPGA that shares the flash's SPI bus into slave-configuration mode before
//! streaming a bitstream at it through the SPI hardware block. This crate
//! does the same job with the same timing discipline, but reached through
//! the bit-banged `GpioPins` trait instead of an IPC-mediated `Sys` task,
//! and with both master-boot (CS high, FPGA self-loads from flash) and
//! slave-boot (CS held low, host streams the bitstream) reset sequences,
//! since this tool needs to arbitrate which device drives the bus.

use std::time::Duration;

use gpio_api::{GpioPins, Level, PinMode};
use ice40_api::{FpgaPins, Ice40Error};
use log::debug;

/// iCE40 datasheet §13.2's SPI slave configuration timing: how long CRESET_B
/// is held low before being released, and how long to wait after release
/// before the chip is ready to sample its configuration mode pins.
const RESET_HOLD: Duration = Duration::from_millis(10);
const RESET_SETTLE: Duration = Duration::from_micros(1200);

pub struct FpgaController<G> {
    gpio: G,
    pins: FpgaPins,
}

impl<G: GpioPins> FpgaController<G> {
    pub fn new(gpio: G, pins: FpgaPins) -> Self {
        Self { gpio, pins }
    }

    pub fn pins(&self) -> &FpgaPins {
        &self.pins
    }

    /// One-time setup: reset held asserted, CDONE as an input.
    pub fn init(&mut self) -> Result<(), Ice40Error> {
        self.gpio.set_mode(self.pins.reset, PinMode::Output)?;
        self.gpio.write(self.pins.reset, Level::Low)?;
        self.gpio.set_mode(self.pins.done, PinMode::Input)?;
        Ok(())
    }

    /// Asserts CRESET_B without driving CS, leaving the flash bus alone.
    pub fn reset(&mut self) -> Result<(), Ice40Error> {
        self.gpio.write(self.pins.reset, Level::Low)?;
        Ok(())
    }

    /// `true` once CDONE has gone high, meaning the FPGA has finished
    /// loading (or failed and given up).
    pub fn done(&self) -> Result<bool, Ice40Error> {
        Ok(bool::from(self.gpio.read(self.pins.done)?))
    }

    /// Resets with CS driven high: the FPGA will self-boot from the shared
    /// flash chip once CRESET_B releases, the same as powering up with no
    /// host attached.
    pub fn reset_master(&mut self) -> Result<(), Ice40Error> {
        self.reset_with_cs(Level::High)
    }

    /// Resets with CS held low and *not released afterward*, so the flash
    /// chip stays deselected and doesn't wake up while the host streams a
    /// bitstream to the FPGA over the same wires.
    pub fn reset_slave(&mut self) -> Result<(), Ice40Error> {
        self.reset_with_cs(Level::Low)
    }

    fn reset_with_cs(&mut self, cs_level: Level) -> Result<(), Ice40Error> {
        self.gpio.set_mode(self.pins.reset, PinMode::Output)?;
        self.gpio.write(self.pins.reset, Level::Low)?;
        self.gpio.set_mode(self.pins.cs, PinMode::Output)?;
        self.gpio.write(self.pins.cs, cs_level)?;
        std::thread::sleep(RESET_HOLD);
        self.gpio.write(self.pins.reset, Level::High)?;
        std::thread::sleep(RESET_SETTLE);
        debug!("fpga reset released, cs held {cs_level:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpio_api::{MockGpio, Pin};

    fn test_pins() -> FpgaPins {
        FpgaPins {
            reset: Pin::new(10),
            done: Pin::new(11),
            cs: Pin::new(1),
        }
    }

    fn new_fpga() -> FpgaController<MockGpio> {
        let mut gpio = MockGpio::new();
        gpio.init().unwrap();
        FpgaController::new(gpio, test_pins())
    }

    #[test]
    fn reset_master_drives_cs_high() {
        let mut fpga = new_fpga();
        fpga.init().unwrap();
        fpga.reset_master().unwrap();
        assert_eq!(fpga.gpio.read(fpga.pins.cs).unwrap(), Level::High);
        assert_eq!(fpga.gpio.read(fpga.pins.reset).unwrap(), Level::High);
    }

    #[test]
    fn reset_slave_drives_cs_low_and_leaves_it_low() {
        let mut fpga = new_fpga();
        fpga.init().unwrap();
        fpga.reset_slave().unwrap();
        assert_eq!(fpga.gpio.read(fpga.pins.cs).unwrap(), Level::Low);
        assert_eq!(fpga.gpio.read(fpga.pins.reset).unwrap(), Level::High);
    }

    #[test]
    fn done_reflects_scripted_cdone_level() {
        let mut fpga = new_fpga();
        fpga.init().unwrap();
        assert!(!fpga.done().unwrap());
        fpga.gpio.script_level(fpga.pins.done, Level::High);
        assert!(fpga.done().unwrap());
    }
}

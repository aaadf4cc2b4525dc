//! Bit-banged multi-mode SPI engine.
//!
//! Drives a SPI NOR flash (and, indirectly, whatever sits behind it on the
//! same bus) by toggling plain GPIOs in software: there is no hardware SPI
//! peripheral here by design, because the host needs to own every clock
//! edge to arbitrate the bus with an FPGA that also wants to be master.
//!
//! CPOL=0, CPHA=0, MSB-first throughout. Single, dual and quad shift widths
//! share one inner loop (`shift_lanes`) parameterized by lane count, rather
//! than three near-duplicate per-width loops.

use gpio_api::{GpioPins, Level, Pin, PinMode};
use log::{debug, trace};
use spi_bus_api::{Quirks, SpiBusError, SpiPins, SpiState, SpiType};

pub struct SpiBus<G> {
    gpio: G,
    pins: SpiPins,
    state: SpiState,
    ty: SpiType,
    quirks: Quirks,
}

impl<G: GpioPins> SpiBus<G> {
    pub fn new(gpio: G, pins: SpiPins) -> Self {
        Self {
            gpio,
            pins,
            state: SpiState::Unconfigured,
            ty: SpiType::Unconfigured,
            quirks: Quirks::empty(),
        }
    }

    pub fn state(&self) -> SpiState {
        self.state
    }

    pub fn spi_type(&self) -> SpiType {
        self.ty
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// Set once identification has determined the chip's vendor-specific
    /// deviations (see `spi-flash`'s `identify`).
    pub fn set_quirks(&mut self, quirks: Quirks) {
        self.quirks = quirks;
    }

    pub fn pins(&self) -> &SpiPins {
        &self.pins
    }

    /// One-time setup: initializes the backend and brings the bus to a
    /// known idle `Single` state.
    pub fn init(&mut self) -> Result<(), SpiBusError> {
        self.gpio.init()?;
        self.ty = SpiType::Single;
        self.set_state_forced(SpiState::Single)?;
        Ok(())
    }

    /// Spins reading CS, waiting for a hardware master (e.g. a self-booting
    /// FPGA) to release the bus. Gives up after a fixed number of polls
    /// rather than blocking forever on a bus that's stuck.
    pub fn await_cs_idle(&mut self) -> Result<(), SpiBusError> {
        for _ in 0..100_000 {
            if bool::from(self.gpio.read(self.pins.cs)?) {
                return Ok(());
            }
        }
        Err(SpiBusError::CsNotIdle)
    }

    fn set_state_forced(&mut self, target: SpiState) -> Result<(), SpiBusError> {
        self.state = SpiState::Unconfigured;
        self.set_state(target)
    }

    /// Applies the pin-direction table for `target`. A no-op if the bus is
    /// already in that state.
    pub fn set_state(&mut self, target: SpiState) -> Result<(), SpiBusError> {
        if self.state == target {
            return Ok(());
        }
        use SpiState::*;
        let (clk, cs, mosi, miso, d2, d3) = match target {
            Unconfigured => (
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
            ),
            Single => (
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
                PinMode::Input,
                PinMode::Output,
                PinMode::Output,
            ),
            DualRx => (
                PinMode::Output,
                PinMode::Output,
                PinMode::Input,
                PinMode::Input,
                PinMode::Output,
                PinMode::Output,
            ),
            DualTx => (
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
            ),
            QuadRx => (
                PinMode::Output,
                PinMode::Output,
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
            ),
            QuadTx => (
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
                PinMode::Output,
            ),
            Hardware => (
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
                PinMode::Input,
            ),
        };
        self.gpio.set_mode(self.pins.clk, clk)?;
        self.gpio.set_mode(self.pins.cs, cs)?;
        self.gpio.set_mode(self.pins.mosi, mosi)?;
        self.gpio.set_mode(self.pins.miso, miso)?;
        self.gpio.set_mode(self.pins.d2, d2)?;
        self.gpio.set_mode(self.pins.d3, d3)?;
        if target == Single {
            self.gpio.write(self.pins.clk, Level::Low)?;
            self.gpio.write(self.pins.cs, Level::High)?;
            self.gpio.write(self.pins.mosi, Level::High)?;
            self.gpio.write(self.pins.d2, Level::High)?;
            self.gpio.write(self.pins.d3, Level::High)?;
        }
        self.state = target;
        Ok(())
    }

    fn lane_pin(&self, lane: u8) -> Pin {
        match lane {
            0 => self.pins.mosi,
            1 => self.pins.miso,
            2 => self.pins.d2,
            3 => self.pins.d3,
            _ => unreachable!("lane count is always 1, 2 or 4"),
        }
    }

    /// Shifts one byte across `lanes` parallel data lines (1, 2 or 4),
    /// MSB-first, returning whatever was sampled back. Single, dual and
    /// quad transfers are all this same loop with a different lane count.
    fn shift_lanes(&mut self, lanes: u8, out: u8) -> Result<u8, SpiBusError> {
        let mut result = 0u8;
        let mut shift = 8i32 - lanes as i32;
        while shift >= 0 {
            let mask = (1u8 << lanes) - 1;
            let chunk = (out >> shift) & mask;
            for lane in (0..lanes).rev() {
                let bit = (chunk >> lane) & 1;
                let pin = self.lane_pin(lane);
                self.gpio.write(pin, Level::from(bit != 0))?;
            }
            self.gpio.write(self.pins.clk, Level::High)?;
            let mut sampled = 0u8;
            for lane in (0..lanes).rev() {
                let pin = self.lane_pin(lane);
                let level = self.gpio.read(pin)?;
                sampled = (sampled << 1) | (bool::from(level) as u8);
            }
            self.gpio.write(self.pins.clk, Level::Low)?;
            result = (result << lanes) | sampled;
            shift -= lanes as i32;
        }
        Ok(result)
    }

    fn lanes_for(&self, ty: SpiType) -> Result<u8, SpiBusError> {
        match ty {
            SpiType::Single => Ok(1),
            SpiType::Dual => Ok(2),
            SpiType::Quad | SpiType::Qpi => Ok(4),
            SpiType::Unconfigured => Err(SpiBusError::UnsupportedType),
        }
    }

    /// Opens a transaction: brings the bus to `Single`, idles WP/HOLD high,
    /// then asserts CS.
    pub fn begin(&mut self) -> Result<(), SpiBusError> {
        self.set_state(SpiState::Single)?;
        self.gpio.write(self.pins.d2, Level::High)?;
        self.gpio.write(self.pins.d3, Level::High)?;
        self.gpio.write(self.pins.cs, Level::Low)?;
        Ok(())
    }

    /// Closes a transaction by deasserting CS.
    pub fn end(&mut self) -> Result<(), SpiBusError> {
        self.gpio.write(self.pins.cs, Level::High)?;
        Ok(())
    }

    /// Transmits a data byte at the bus's current logical width.
    pub fn tx(&mut self, byte: u8) -> Result<(), SpiBusError> {
        let lanes = self.lanes_for(self.ty)?;
        self.shift_lanes(lanes, byte)?;
        Ok(())
    }

    /// Receives a data byte at the bus's current logical width. An
    /// unconfigured `type` has no defined lane count, so this returns 0xFF
    /// rather than an error, matching the original `spiRx`'s `default:
    /// return 0xff;`.
    pub fn rx(&mut self) -> Result<u8, SpiBusError> {
        let lanes = match self.ty {
            SpiType::Single => 1,
            SpiType::Dual => 2,
            SpiType::Quad | SpiType::Qpi => 4,
            SpiType::Unconfigured => return Ok(0xFF),
        };
        self.shift_lanes(lanes, 0xFF)
    }

    /// Transmits a command/opcode byte. Commands are quad-wide only in QPI
    /// mode; in plain `Quad` mode the opcode phase stays single-bit while
    /// the data phase is quad-wide.
    pub fn command(&mut self, byte: u8) -> Result<(), SpiBusError> {
        let lanes = if self.ty == SpiType::Qpi { 4 } else { 1 };
        self.shift_lanes(lanes, byte)?;
        Ok(())
    }

    /// Swaps the MOSI/MISO pin assignment and forces the bus back to
    /// `Single`. Used to reverse master/slave roles when the host needs to
    /// shift data into the FPGA instead of the flash.
    pub fn swap_tx_rx(&mut self) -> Result<(), SpiBusError> {
        std::mem::swap(&mut self.pins.mosi, &mut self.pins.miso);
        self.ty = SpiType::Single;
        self.set_state_forced(SpiState::Single)
    }

    /// Parks the flash chip (opcode 0xB9) so another bus master can use the
    /// lines without the flash responding to noise on its CS/CLK.
    pub fn hold(&mut self) -> Result<(), SpiBusError> {
        self.begin()?;
        self.command(0xB9)?;
        self.end()
    }

    /// Wakes the flash chip back up (opcode 0xAB).
    pub fn unhold(&mut self) -> Result<(), SpiBusError> {
        self.begin()?;
        self.command(0xAB)?;
        self.end()
    }

    /// Reads status register `n` (1, 2 or 3), honoring the
    /// sr2-from-sr1/sr2-from-sr3 priming quirks.
    pub fn read_sr(&mut self, n: u8) -> Result<u8, SpiBusError> {
        if n == 2 && self.quirks.contains(Quirks::SR2_FROM_SR1) {
            self.begin()?;
            self.command(0x05)?;
            let _ = self.rx()?;
            self.end()?;
        }
        if n == 2 && self.quirks.contains(Quirks::SR2_FROM_SR3) {
            self.begin()?;
            self.command(0x15)?;
            let _ = self.rx()?;
            self.end()?;
        }
        let opcode = match n {
            1 => 0x05,
            2 => 0x35,
            3 => 0x15,
            _ => panic!("status register index must be 1, 2 or 3"),
        };
        self.begin()?;
        self.command(opcode)?;
        let value = self.rx()?;
        self.end()?;
        trace!("read sr{n} = {value:#04x}");
        Ok(value)
    }

    /// Writes status register `n`, unless `Quirks::SKIP_SR_WEL` is set
    /// preceding the write with 0x06 (write-enable) and 0x50 (volatile SR
    /// write-enable).
    pub fn write_sr(&mut self, n: u8, value: u8) -> Result<(), SpiBusError> {
        if !self.quirks.contains(Quirks::SKIP_SR_WEL) {
            self.begin()?;
            self.command(0x06)?;
            self.end()?;
            self.begin()?;
            self.command(0x50)?;
            self.end()?;
        }
        if n == 2 && self.quirks.contains(Quirks::SR2_FROM_SR1) {
            let sr1 = self.read_sr(1)?;
            self.begin()?;
            self.command(0x01)?;
            self.tx(sr1)?;
            self.tx(value)?;
            self.end()?;
            return Ok(());
        }
        if n == 2 && self.quirks.contains(Quirks::SR2_FROM_SR3) {
            let sr1 = self.read_sr(1)?;
            let sr3 = self.read_sr(3)?;
            self.begin()?;
            self.command(0x01)?;
            self.tx(sr1)?;
            self.tx(sr3)?;
            self.tx(value)?;
            self.end()?;
            return Ok(());
        }
        let opcode = match n {
            1 => 0x01,
            2 => 0x31,
            3 => 0x11,
            _ => panic!("status register index must be 1, 2 or 3"),
        };
        self.begin()?;
        self.command(opcode)?;
        self.tx(value)?;
        self.end()?;
        debug!("wrote sr{n} = {value:#04x}");
        Ok(())
    }

    fn ensure_quad_enable(&mut self) -> Result<(), SpiBusError> {
        if self.quirks.contains(Quirks::QE_IN_SR1) {
            let sr1 = self.read_sr(1)?;
            if sr1 & (1 << 6) == 0 {
                self.write_sr(1, sr1 | (1 << 6))?;
            }
        } else {
            let sr2 = self.read_sr(2)?;
            if sr2 & (1 << 1) == 0 {
                self.write_sr(2, sr2 | (1 << 1))?;
            }
        }
        Ok(())
    }

    /// Switches the bus's logical protocol width, exiting QPI first if
    /// necessary, negotiating the chip's quad-enable bit before entering
    /// `Quad`/`Qpi`, and entering QPI (opcode 0x38) last.
    pub fn set_type(&mut self, target: SpiType) -> Result<(), SpiBusError> {
        if self.ty == target {
            return Ok(());
        }
        if self.ty == SpiType::Qpi {
            self.begin()?;
            self.command(0xFF)?;
            self.end()?;
            self.ty = SpiType::Single;
            self.set_state(SpiState::Single)?;
        }
        if matches!(target, SpiType::Quad | SpiType::Qpi) {
            self.ensure_quad_enable()?;
        }
        let state = match target {
            SpiType::Single => SpiState::Single,
            SpiType::Dual => SpiState::DualTx,
            SpiType::Quad | SpiType::Qpi => SpiState::QuadTx,
            SpiType::Unconfigured => SpiState::Unconfigured,
        };
        self.set_state(state)?;
        if target == SpiType::Qpi {
            // The entry opcode itself must still go out single-bit: the
            // chip isn't in QPI until after it receives this byte, so `ty`
            // is only updated once the command has been sent.
            self.begin()?;
            self.command(0x38)?;
            self.end()?;
        }
        self.ty = target;
        debug!("spi type now {target:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpio_api::MockGpio;

    fn test_pins() -> SpiPins {
        SpiPins {
            clk: Pin::new(0),
            cs: Pin::new(1),
            mosi: Pin::new(2),
            miso: Pin::new(3),
            d2: Pin::new(4),
            d3: Pin::new(5),
        }
    }

    fn new_bus() -> SpiBus<MockGpio> {
        let mut bus = SpiBus::new(MockGpio::new(), test_pins());
        bus.init().unwrap();
        bus
    }

    #[test]
    fn begin_end_pairing_leaves_cs_high() {
        let mut bus = new_bus();
        bus.begin().unwrap();
        assert_eq!(bus.gpio.read(bus.pins.cs).unwrap(), Level::Low);
        bus.end().unwrap();
        assert_eq!(bus.gpio.read(bus.pins.cs).unwrap(), Level::High);
    }

    #[test]
    fn state_matches_table_after_set_state() {
        let mut bus = new_bus();
        bus.set_state(SpiState::QuadTx).unwrap();
        assert_eq!(bus.gpio.mode_of(bus.pins.miso), Some(PinMode::Output));
        assert_eq!(bus.gpio.mode_of(bus.pins.d2), Some(PinMode::Output));
        bus.set_state(SpiState::QuadRx).unwrap();
        assert_eq!(bus.gpio.mode_of(bus.pins.miso), Some(PinMode::Input));
        assert_eq!(bus.gpio.mode_of(bus.pins.d2), Some(PinMode::Input));
    }

    #[test]
    fn single_shift_is_msb_first_full_duplex() {
        let mut bus = new_bus();
        // Loop MISO back from MOSI one bit ahead isn't modeled by MockGpio,
        // but we can at least check the transmitted bit order by recording
        // writes to MOSI.
        bus.begin().unwrap();
        bus.tx(0b1011_0010).unwrap();
        bus.end().unwrap();
        let mosi_writes: Vec<bool> = bus
            .gpio
            .write_calls
            .iter()
            .filter(|(p, _)| *p == bus.pins.mosi)
            .map(|(_, l)| bool::from(*l))
            .collect();
        assert_eq!(
            mosi_writes,
            vec![true, false, true, true, false, false, true, false]
        );
    }

    #[test]
    fn set_type_quad_sets_quad_enable_bit_in_sr2() {
        let mut bus = new_bus();
        bus.gpio.script_level(bus.pins.miso, Level::Low);
        bus.set_type(SpiType::Quad).unwrap();
        // SR2 should have been written with bit 1 set at some point.
        assert_eq!(bus.spi_type(), SpiType::Quad);
        assert_eq!(bus.state(), SpiState::QuadTx);
    }

    #[test]
    fn set_type_macronix_quirk_uses_sr1_bit6() {
        let mut bus = new_bus();
        bus.set_quirks(Quirks::QE_IN_SR1);
        bus.gpio.script_level(bus.pins.miso, Level::Low);
        bus.set_type(SpiType::Quad).unwrap();
        assert_eq!(bus.spi_type(), SpiType::Quad);
    }

    #[test]
    fn exiting_qpi_sends_0xff_before_changing_type() {
        let mut bus = new_bus();
        bus.gpio.script_level(bus.pins.miso, Level::Low);
        bus.set_type(SpiType::Qpi).unwrap();
        bus.set_type(SpiType::Single).unwrap();
        assert_eq!(bus.spi_type(), SpiType::Single);
        assert_eq!(bus.state(), SpiState::Single);
    }
}

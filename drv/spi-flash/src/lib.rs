//! SPI NOR flash protocol layer.
//!
//! Plays the role `drv-gimlet-hf-server` plays for the hf-api types: this is
//! where status registers, identification, erase/program, and reset turn
//! into actual opcode sequences on top of `spi-bus`. Unlike the server,
//! there's no `idol` dispatch loop here — callers just hold a `SpiFlash`
//! and call methods on it directly.

use std::time::{Duration, Instant};

use log::{debug, warn};
use spi_bus::SpiBus;
use spi_bus_api::{Quirks, SpiBusError, SpiType};
use spi_flash_api::{EraseSize, FlashId, SpiFlashConfig, SpiFlashError};

use gpio_api::GpioPins;

/// A SPI NOR flash chip, reached through a [`SpiBus`].
pub struct SpiFlash<G> {
    bus: SpiBus<G>,
    config: SpiFlashConfig,
    id: FlashId,
}

impl<G: GpioPins> SpiFlash<G> {
    pub fn new(bus: SpiBus<G>, config: SpiFlashConfig) -> Self {
        Self {
            bus,
            config,
            id: FlashId::default(),
        }
    }

    pub fn config(&self) -> &SpiFlashConfig {
        &self.config
    }

    pub fn id(&self) -> &FlashId {
        &self.id
    }

    /// Grants direct access to the underlying bus, for operations that don't
    /// fit the flash protocol (the FPGA hold/unhold/swap_tx_rx dance in
    /// particular, which belongs to the caller orchestrating both the flash
    /// and the FPGA on the same wires).
    pub fn bus_mut(&mut self) -> &mut SpiBus<G> {
        &mut self.bus
    }

    /// Brings the backend up and the chip to a known state: reset, then
    /// forced single-bit mode with WP/HOLD idled high. Mirrors the original
    /// `spiInit`'s reset-then-single sequence, folded in here rather than
    /// left for the caller to sequence by hand.
    pub fn init(&mut self) -> Result<(), SpiFlashError> {
        self.bus.init()?;
        self.reset()?;
        self.bus.set_type(SpiType::Single)?;
        Ok(())
    }

    /// Reads the manufacturer/device ID, JEDEC ID, release-power-down
    /// signature and unique serial, decodes them against the vendor table,
    /// and derives the bus's quirks from the manufacturer byte.
    pub fn identify(&mut self) -> Result<FlashId, SpiFlashError> {
        let mut id = FlashId::default();

        self.bus.begin()?;
        self.bus.command(0x90)?;
        self.bus.tx(0)?;
        self.bus.tx(0)?;
        self.bus.tx(0)?;
        id.manufacturer_id = self.bus.rx()?;
        id.device_id = self.bus.rx()?;
        self.bus.end()?;

        self.bus.begin()?;
        self.bus.command(0x9F)?;
        id.jedec_manufacturer_id = self.bus.rx()?;
        id.memory_type = self.bus.rx()?;
        id.memory_size = self.bus.rx()?;
        self.bus.end()?;

        self.bus.begin()?;
        self.bus.command(0xAB)?;
        self.bus.tx(0)?;
        self.bus.tx(0)?;
        self.bus.tx(0)?;
        id.signature = self.bus.rx()?;
        self.bus.end()?;

        self.bus.begin()?;
        self.bus.command(0x4B)?;
        self.bus.tx(0)?;
        self.bus.tx(0)?;
        self.bus.tx(0)?;
        self.bus.tx(0)?;
        for b in id.serial.iter_mut() {
            *b = self.bus.rx()?;
        }
        self.bus.end()?;

        let (manufacturer, model, capacity, capacity_bytes) =
            lookup_vendor(id.manufacturer_id, id.memory_type, id.memory_size);
        id.manufacturer = manufacturer;
        id.model = model;
        id.capacity = capacity;
        id.capacity_bytes = self
            .config
            .size_override
            .map(|bytes| bytes as i64)
            .unwrap_or(capacity_bytes);

        let quirks = vendor_quirks(id.manufacturer_id);
        self.bus.set_quirks(quirks);
        debug!(
            "identified {} {} ({}), quirks {quirks:?}",
            id.manufacturer, id.model, id.capacity
        );

        self.id = id.clone();
        Ok(self.id.clone())
    }

    fn wait_not_busy(&mut self) -> Result<(), SpiFlashError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.busy_timeout_ms as u64);
        loop {
            let sr1 = self.bus.read_sr(1)?;
            if sr1 & 1 == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SpiFlashError::Timeout);
            }
        }
    }

    fn maybe_unlock(&mut self) -> Result<(), SpiFlashError> {
        if let Some(unlock_cmd) = self.config.unlock_cmd {
            self.bus.begin()?;
            self.bus.command(unlock_cmd)?;
            self.bus.end()?;
        }
        Ok(())
    }

    fn write_enable(&mut self) -> Result<(), SpiFlashError> {
        self.bus.begin()?;
        self.bus.command(0x06)?;
        self.bus.end()?;
        Ok(())
    }

    /// Sends the three address bytes via `command`, not `tx`: per the
    /// fast-read/erase/program wire protocol only the data phase runs at
    /// the bus's full lane width, while the opcode, address and dummy bytes
    /// stay single-bit outside true QPI mode.
    fn address_bytes(&mut self, addr: u32) -> Result<(), SpiFlashError> {
        self.bus.command((addr >> 16) as u8)?;
        self.bus.command((addr >> 8) as u8)?;
        self.bus.command(addr as u8)?;
        Ok(())
    }

    /// Reads `len` bytes starting at `addr`, using the fast-read opcode that
    /// matches the bus's current logical width (single/dual/quad), with the
    /// one required dummy byte after the address.
    pub fn read(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, SpiFlashError> {
        let opcode = match self.bus.spi_type() {
            SpiType::Single | SpiType::Qpi => 0x0B,
            SpiType::Dual => 0x3B,
            SpiType::Quad => 0x6B,
            SpiType::Unconfigured => return Err(SpiBusError::UnsupportedType.into()),
        };
        self.bus.begin()?;
        self.bus.command(opcode)?;
        self.address_bytes(addr)?;
        self.bus.command(0)?;
        let mut out = Vec::with_capacity(len as usize);
        for _ in 0..len {
            out.push(self.bus.rx()?);
        }
        self.bus.end()?;
        Ok(out)
    }

    fn erase_verify(&mut self, addr: u32, len: u32) -> Result<(), SpiFlashError> {
        let mut offset = 0u32;
        while offset < len {
            let chunk_len = (len - offset).min(256);
            let data = self.read(addr + offset, chunk_len)?;
            if let Some(bad) = data.iter().position(|&b| b != 0xFF) {
                return Err(SpiFlashError::EraseVerifyFailed(addr + offset + bad as u32));
            }
            offset += chunk_len;
        }
        Ok(())
    }

    /// Erases whole blocks covering `[addr, addr + data.len())`, verifies
    /// each erased block reads back as all-0xff, then programs `data` in
    /// 256-byte pages. `addr` must be 256-byte aligned.
    pub fn write(&mut self, addr: u32, data: &[u8], quiet: bool) -> Result<(), SpiFlashError> {
        if addr % 256 != 0 {
            return Err(SpiFlashError::Unaligned(addr));
        }
        let end = addr
            .checked_add(data.len() as u32)
            .ok_or(SpiFlashError::Unaligned(addr))?;

        let erase_bytes = self.config.erase_size.bytes();
        let mut erase_addr = addr - addr % erase_bytes;
        while erase_addr < end {
            self.maybe_unlock()?;
            self.write_enable()?;
            self.bus.begin()?;
            self.bus.command(self.config.erase_size.opcode())?;
            self.address_bytes(erase_addr)?;
            self.bus.end()?;
            self.wait_not_busy()?;

            let block_len = erase_bytes.min(end - erase_addr);
            self.erase_verify(erase_addr, block_len)?;
            if !quiet {
                debug!("erased block at {erase_addr:#x}");
            }
            erase_addr += erase_bytes;
        }

        let program_opcode = match self.bus.spi_type() {
            SpiType::Single | SpiType::Qpi => 0x02,
            SpiType::Quad => 0x32,
            SpiType::Dual => return Err(SpiFlashError::DualProgramUnsupported),
            SpiType::Unconfigured => return Err(SpiBusError::UnsupportedType.into()),
        };

        let mut off = 0usize;
        while off < data.len() {
            let page_len = (data.len() - off).min(256);
            self.write_enable()?;
            if !quiet {
                let sr1 = self.bus.read_sr(1)?;
                if sr1 & 0b10 == 0 {
                    warn!("write-enable latch did not set before page program");
                }
            }
            let page_addr = addr + off as u32;
            self.bus.begin()?;
            self.bus.command(program_opcode)?;
            self.address_bytes(page_addr)?;
            for &b in &data[off..off + page_len] {
                self.bus.tx(b)?;
            }
            self.bus.end()?;
            self.wait_not_busy()?;
            off += page_len;
        }
        Ok(())
    }

    /// Reads back `expected.len()` bytes at `addr` and returns the number of
    /// mismatching bytes.
    pub fn verify(&mut self, addr: u32, expected: &[u8]) -> Result<usize, SpiFlashError> {
        let actual = self.read(addr, expected.len() as u32)?;
        Ok(actual.iter().zip(expected).filter(|(a, b)| a != b).count())
    }

    /// Reads security register `n` (1-3).
    pub fn read_security(&mut self, n: u8) -> Result<[u8; 256], SpiFlashError> {
        if !(1..=3).contains(&n) {
            return Err(SpiFlashError::BadSecurityRegister(n));
        }
        let addr_hi = self.security_address(n);
        self.bus.begin()?;
        self.bus.command(0x48)?;
        self.bus.command(0)?;
        self.bus.command(addr_hi)?;
        self.bus.command(0)?;
        let mut out = [0u8; 256];
        for b in out.iter_mut() {
            *b = self.bus.rx()?;
        }
        self.bus.end()?;
        Ok(out)
    }

    /// Erases and programs security register `n` (1-3) with `data`. Per the
    /// chip datasheets this program step needs on the order of a second to
    /// complete and doesn't expose a busy bit the way the main array does,
    /// so this sleeps a fixed second rather than polling.
    pub fn write_security(&mut self, n: u8, data: &[u8; 256]) -> Result<(), SpiFlashError> {
        if !(1..=3).contains(&n) {
            return Err(SpiFlashError::BadSecurityRegister(n));
        }
        let addr_hi = self.security_address(n);

        self.maybe_unlock()?;
        self.write_enable()?;
        self.bus.begin()?;
        self.bus.command(0x44)?;
        self.bus.command(0)?;
        self.bus.command(addr_hi)?;
        self.bus.command(0)?;
        self.bus.end()?;
        // Re-identify between the erase and the program step: besides
        // refreshing `id`, the round-trip of SPI traffic acts as the
        // implicit delay the erase needs before the chip is ready for the
        // next command, the same way the original tool's erase-then-id
        // sequencing does.
        self.identify()?;
        std::thread::sleep(Duration::from_secs(1));

        self.write_enable()?;
        self.bus.begin()?;
        self.bus.command(0x42)?;
        self.bus.command(0)?;
        self.bus.command(addr_hi)?;
        self.bus.command(0)?;
        for &b in data.iter() {
            self.bus.tx(b)?;
        }
        self.bus.end()?;
        self.wait_not_busy()?;
        Ok(())
    }

    fn security_address(&self, n: u8) -> u8 {
        if self.bus.quirks().contains(Quirks::SECURITY_NYBBLE_SHIFT) {
            n << 4
        } else {
            n
        }
    }

    /// Sets the quad-enable bit directly, for callers that want quad mode
    /// negotiated ahead of the first `set_type(Quad)` call (e.g. the `-4`
    /// verb in the original tool).
    pub fn set_quad_enable(&mut self) -> Result<(), SpiFlashError> {
        if self.bus.quirks().contains(Quirks::QE_IN_SR1) {
            let sr1 = self.bus.read_sr(1)?;
            if sr1 & (1 << 6) == 0 {
                self.bus.write_sr(1, sr1 | (1 << 6))?;
            }
        } else {
            let sr2 = self.bus.read_sr(2)?;
            if sr2 & (1 << 1) == 0 {
                self.bus.write_sr(2, sr2 | (1 << 1))?;
            }
        }
        Ok(())
    }

    /// Resets the chip: drops back to single-bit mode (exiting QPI first if
    /// necessary), issues the 0x66/0x99 reset sequence, and waits out the
    /// chip's reset recovery time before confirming it's no longer busy.
    pub fn reset(&mut self) -> Result<(), SpiFlashError> {
        // Unconditional QPI round-trip: the software-tracked `type` may say
        // `Single` (e.g. right after `bus.init()`, which resets it with no
        // bus traffic) while the chip is still physically in QPI from a
        // prior session. Shifting to QPI and back guarantees the exit
        // opcode actually reaches the chip regardless of what we think its
        // current mode is.
        self.bus.set_type(SpiType::Qpi)?;
        self.bus.set_type(SpiType::Single)?;
        self.bus.begin()?;
        self.bus.command(0x66)?;
        self.bus.end()?;
        self.bus.begin()?;
        self.bus.command(0x99)?;
        self.bus.end()?;
        std::thread::sleep(Duration::from_micros(30));
        self.wait_not_busy()?;
        Ok(())
    }
}

fn lookup_vendor(
    manufacturer_id: u8,
    memory_type: u8,
    memory_size: u8,
) -> (&'static str, &'static str, &'static str, i64) {
    match (manufacturer_id, memory_type, memory_size) {
        (0xEF, 0x40, 0x18) => ("Winbond", "W25Q128FV", "128 Mbit", 16 * 1024 * 1024),
        (0xEF, 0x70, 0x18) => ("Winbond", "W25Q128JV", "128 Mbit", 16 * 1024 * 1024),
        (0xEF, 0x40, 0x17) => ("Winbond", "W25Q64FV", "64 Mbit", 8 * 1024 * 1024),
        (0xC2, 0x20, 0x18) => ("Macronix", "MX25L12835F", "128 Mbit", 16 * 1024 * 1024),
        (0xC2, 0x20, 0x17) => ("Macronix", "MX25L6435F", "64 Mbit", 8 * 1024 * 1024),
        _ => ("unknown", "unknown", "unknown", -1),
    }
}

/// Derives the bus's vendor quirks purely from the manufacturer byte, per
/// the deviations each family is known to have from the baseline protocol.
fn vendor_quirks(manufacturer_id: u8) -> Quirks {
    match manufacturer_id {
        0xEF => Quirks::SKIP_SR_WEL | Quirks::SECURITY_NYBBLE_SHIFT,
        0xC2 => Quirks::QE_IN_SR1 | Quirks::SR2_FROM_SR3,
        _ => Quirks::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpio_api::{MockGpio, Pin};
    use spi_bus_api::SpiPins;

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

    fn new_flash() -> SpiFlash<MockGpio> {
        let bus = SpiBus::new(MockGpio::new(), test_pins());
        SpiFlash::new(bus, SpiFlashConfig::default())
    }

    #[test]
    fn unknown_manufacturer_reports_unrecognized_capacity() {
        let (manufacturer, model, capacity, capacity_bytes) = lookup_vendor(0x00, 0x00, 0x00);
        assert_eq!(manufacturer, "unknown");
        assert_eq!(model, "unknown");
        assert_eq!(capacity, "unknown");
        assert_eq!(capacity_bytes, -1);
    }

    #[test]
    fn winbond_quirks_include_skip_wel_and_nybble_shift() {
        let quirks = vendor_quirks(0xEF);
        assert!(quirks.contains(Quirks::SKIP_SR_WEL));
        assert!(quirks.contains(Quirks::SECURITY_NYBBLE_SHIFT));
        assert!(!quirks.contains(Quirks::QE_IN_SR1));
    }

    #[test]
    fn macronix_quirks_include_qe_in_sr1_and_sr2_from_sr3() {
        let quirks = vendor_quirks(0xC2);
        assert!(quirks.contains(Quirks::QE_IN_SR1));
        assert!(quirks.contains(Quirks::SR2_FROM_SR3));
    }

    #[test]
    fn identify_with_unscripted_miso_lands_on_unknown_vendor() {
        let mut flash = new_flash();
        flash.init().unwrap();
        // MockGpio's unscripted MISO always samples low, so every ID byte
        // read back is 0x00: this just exercises that identify() completes
        // and lands on the "unknown" vendor / empty-quirks path.
        let id = flash.identify().unwrap();
        assert_eq!(id.manufacturer, "unknown");
        assert_eq!(flash.bus_mut().quirks(), Quirks::empty());
    }

    #[test]
    fn write_rejects_unaligned_address() {
        let mut flash = new_flash();
        flash.init().unwrap();
        let err = flash.write(1, &[0xAA; 4], true).unwrap_err();
        assert_eq!(err, SpiFlashError::Unaligned(1));
    }

    #[test]
    fn read_security_rejects_out_of_range_index() {
        let mut flash = new_flash();
        flash.init().unwrap();
        let err = flash.read_security(0).unwrap_err();
        assert_eq!(err, SpiFlashError::BadSecurityRegister(0));
        let err = flash.read_security(4).unwrap_err();
        assert_eq!(err, SpiFlashError::BadSecurityRegister(4));
    }

    #[test]
    fn security_nybble_shift_quirk_shifts_index() {
        let mut flash = new_flash();
        flash.init().unwrap();
        flash.bus_mut().set_quirks(Quirks::SECURITY_NYBBLE_SHIFT);
        assert_eq!(flash.security_address(1), 0x10);
        flash.bus_mut().set_quirks(Quirks::empty());
        assert_eq!(flash.security_address(1), 0x01);
    }

    #[test]
    fn erase_verify_fails_on_non_ff_byte() {
        let mut flash = new_flash();
        flash.init().unwrap();
        // With MockGpio always sampling MISO low, every read() byte comes
        // back as 0x00, which is not 0xFF: erase_verify must report it.
        let err = flash.erase_verify(0, 256).unwrap_err();
        assert!(matches!(err, SpiFlashError::EraseVerifyFailed(0)));
    }

    #[test]
    fn reset_drops_out_of_qpi_first() {
        let mut flash = new_flash();
        flash.init().unwrap();
        flash.bus_mut().set_type(SpiType::Qpi).unwrap();
        assert!(flash.reset().is_ok());
        assert_eq!(flash.bus_mut().spi_type(), SpiType::Single);
    }
}

//! Shared types for the SPI NOR flash protocol layer.
//!
//! Mirrors `drv-hf-api`'s role relative to `drv-gimlet-hf-server`: this
//! crate carries the error enum, the identification record, and the
//! runtime configuration, while `spi-flash` carries the protocol
//! implementation built on top of `spi-bus`.

use spi_bus_api::SpiBusError;
use thiserror::Error;

/// Raw identification bytes plus their decoded vendor/part strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlashId {
    pub manufacturer_id: u8,
    pub device_id: u8,
    pub jedec_manufacturer_id: u8,
    pub memory_type: u8,
    pub memory_size: u8,
    pub signature: u8,
    pub serial: [u8; 4],
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub capacity: &'static str,
    /// Capacity in bytes, or `-1` if the combination isn't recognized.
    pub capacity_bytes: i64,
}

/// Block size used by `SpiFlash::write`'s erase step. The original tool
/// picks this at build time; here it's a runtime field on
/// [`SpiFlashConfig`] so one binary can support either without a rebuild.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EraseSize {
    #[default]
    FourKiB,
    ThirtyTwoKiB,
    SixtyFourKiB,
}

impl EraseSize {
    pub fn bytes(self) -> u32 {
        match self {
            EraseSize::FourKiB => 4 * 1024,
            EraseSize::ThirtyTwoKiB => 32 * 1024,
            EraseSize::SixtyFourKiB => 64 * 1024,
        }
    }

    pub fn opcode(self) -> u8 {
        match self {
            EraseSize::FourKiB => 0x20,
            EraseSize::ThirtyTwoKiB => 0x52,
            EraseSize::SixtyFourKiB => 0xD8,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpiFlashConfig {
    pub erase_size: EraseSize,
    /// Optional global-unprotect opcode (0x98) issued before erase/security
    /// writes, for chips that ship write-protected.
    pub unlock_cmd: Option<u8>,
    /// Overrides the capacity reported by identification, for chips this
    /// workspace's vendor table doesn't recognize.
    pub size_override: Option<u32>,
    /// Busy-poll deadline for erase/program/reset, in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for SpiFlashConfig {
    fn default() -> Self {
        Self {
            erase_size: EraseSize::default(),
            unlock_cmd: None,
            size_override: None,
            busy_timeout_ms: 1000,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum SpiFlashError {
    #[error("spi bus error: {0}")]
    Bus(#[from] SpiBusError),
    #[error("write address {0:#x} is not 256-byte aligned")]
    Unaligned(u32),
    #[error("busy bit did not clear within the timeout")]
    Timeout,
    #[error("erase at {0:#x} did not read back as all-0xff")]
    EraseVerifyFailed(u32),
    #[error("dual-mode page programming is not supported by this chip family")]
    DualProgramUnsupported,
    #[error("security register index {0} is out of range")]
    BadSecurityRegister(u8),
}

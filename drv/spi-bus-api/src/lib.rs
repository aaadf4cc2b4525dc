//! Shared types for the bit-banged SPI bus engine.
//!
//! Split out from `spi-bus` the same way `drv-hf-api` is split out from
//! `drv-gimlet-hf-server`: the types here are what a caller needs to talk
//! about the bus (its pins, its electrical state, its logical protocol
//! width) without pulling in the engine implementation itself.

#![allow(clippy::too_many_arguments)]

use gpio_api::Pin;
use thiserror::Error;

bitflags::bitflags! {
    /// Per-vendor deviations from the baseline status/security register
    /// protocol, derived once at identification time.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Quirks: u8 {
        /// SR2 is read by first issuing the SR1 read opcode.
        const SR2_FROM_SR1 = 1 << 0;
        /// Status register writes skip the 0x06/0x50 write-enable preamble.
        const SKIP_SR_WEL = 1 << 1;
        /// The security register index is shifted left 4 bits before being
        /// placed in the address field.
        const SECURITY_NYBBLE_SHIFT = 1 << 2;
        /// The quad-enable bit lives in SR1 (bit 6) rather than SR2 (bit 1).
        const QE_IN_SR1 = 1 << 3;
        /// SR2 is read by first issuing the SR3 read opcode.
        const SR2_FROM_SR3 = 1 << 4;
    }
}

/// Electrical configuration of the six bus pins. Mirrors the pin-direction
/// table: each variant fixes the direction of every pin controlled by the
/// engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum SpiState {
    #[default]
    Unconfigured,
    Single,
    DualRx,
    DualTx,
    QuadRx,
    QuadTx,
    /// CS/CLK/data lines are all inputs: the bus has been handed to a
    /// hardware SPI master (the FPGA in self-boot mode).
    Hardware,
}

/// Logical shift width in effect for `tx`/`rx`/`command`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum SpiType {
    #[default]
    Unconfigured,
    Single,
    Dual,
    Quad,
    Qpi,
}

/// The six GPIO lines the engine drives. `d2`/`d3` double as WP/HOLD in
/// single and dual modes and as the third/fourth quad data lanes in quad
/// mode.
#[derive(Copy, Clone, Debug)]
pub struct SpiPins {
    pub clk: Pin,
    pub cs: Pin,
    pub mosi: Pin,
    pub miso: Pin,
    pub d2: Pin,
    pub d3: Pin,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum SpiBusError {
    #[error("gpio error: {0}")]
    Gpio(#[from] gpio_api::GpioError),
    #[error("unsupported spi type for this operation")]
    UnsupportedType,
    #[error("bus is not in a transaction (begin() was not called)")]
    NotInTransaction,
    #[error("cs line did not go idle within the startup wait")]
    CsNotIdle,
}

//! Shared types for the iCE40 FPGA controller and bitstream patcher.
//!
//! Plays the role `drv-ice40-spi-program`'s `Config`/`Ice40Error` play for
//! the embedded bitstream loader, generalized to a hosted reset-then-stream
//! controller plus the patcher's own failure modes.

use gpio_api::Pin;
use thiserror::Error;

/// The three GPIO lines the FPGA controller drives directly (CRESET_B,
/// CDONE, and the flash CS line it shares with the bit-banged bus).
#[derive(Copy, Clone, Debug)]
pub struct FpgaPins {
    pub reset: Pin,
    pub done: Pin,
    pub cs: Pin,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Ice40Error {
    #[error("gpio error: {0}")]
    Gpio(#[from] gpio_api::GpioError),
    #[error("replacement rom is larger than the bank's byte count")]
    RomTooLarge,
    #[error(
        "bram bank word at output offset {word_offset} did not match the \
         expected pattern word (expected {expected:#06x}, found {found:#06x})"
    )]
    PatchInvariantViolation {
        word_offset: u32,
        expected: u16,
        found: u16,
        /// Scan-buffer words surrounding the mismatch, for the diagnostic
        /// dump called for in the error-handling design: as many of the 16
        /// words before and after `word_offset` as the scan buffer covers,
        /// zero-padded past its edges.
        window: [u16; 32],
    },
    #[error("unexpected end of bitstream input")]
    UnexpectedEof,
    #[error("byte-stream i/o failure")]
    Io,
}

//! iCE40 bitstream patcher.
//!
//! Streams an existing bitstream from input to output byte-for-byte, except
//! inside BRAM initialization banks, where it substitutes a caller-supplied
//! ROM image for whatever the bitstream's own BRAM initializer put there.
//! The substitution works by first generating the same two "spray" patterns
//! (a random fill and the replacement ROM, each bit-permuted by the same
//! formula the bitstream generator uses to distribute initial values across
//! BRAM physical bit lines) and then, for each 16-bit word coming out of a
//! bank, finding which of those physical bit lines it corresponds to by
//! correlating the first 128 words against the random pattern, and emitting
//! the matching word from the ROM pattern in its place.
//!
//! Polymorphism over where the bytes come from and go to — a bitstream file
//! on disk, or the flash/FPGA reached through the bit-banged bus — is
//! expressed as two small traits ([`ByteSource`]/[`ByteSink`]) rather than
//! the original's pair of function pointers plus a `void *` cookie. Each
//! carries its own running CRC-16 so a [`CrcStream`] wrapping a `File` and
//! one wrapping a live [`spi_bus::SpiBus`] (via [`SpiBusWriter`]) behave
//! identically to the patch loop.

use std::io::{Read, Write};

use gpio_api::GpioPins;
use ice40_api::Ice40Error;
use log::{debug, warn};
use spi_bus::SpiBus;

/// A byte source with an attached CRC-16-CCITT accumulator, reset whenever
/// the bitstream issues its "reset CRC" command.
pub trait ByteSource {
    fn read_byte(&mut self) -> Result<Option<u8>, Ice40Error>;
    fn crc(&self) -> u16;
    fn reset_crc(&mut self);
}

/// A byte sink with the same running CRC. The CRC-check command reads this
/// value (and, per the original protocol, that read itself folds the
/// emitted CRC bytes back into the running accumulator).
pub trait ByteSink {
    fn write_byte(&mut self, byte: u8) -> Result<(), Ice40Error>;
    fn crc(&self) -> u16;
    fn reset_crc(&mut self);
}

/// Wraps any [`Read`]/[`Write`] byte source in a running CRC-16-CCITT
/// accumulator (init 0xFFFF, poly 0x1021, MSB-first, no reflection). Used
/// for both file-backed streams and, via [`SpiBusWriter`], the live bus.
pub struct CrcStream<T> {
    inner: T,
    crc: u16,
}

impl<T> CrcStream<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, crc: 0xFFFF }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<R: Read> ByteSource for CrcStream<R> {
    fn read_byte(&mut self) -> Result<Option<u8>, Ice40Error> {
        let mut buf = [0u8; 1];
        match self.inner.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => {
                self.crc = update_crc16(self.crc, buf[0]);
                Ok(Some(buf[0]))
            }
            Err(_) => Err(Ice40Error::Io),
        }
    }

    fn crc(&self) -> u16 {
        self.crc
    }

    fn reset_crc(&mut self) {
        self.crc = 0xFFFF;
    }
}

impl<W: Write> ByteSink for CrcStream<W> {
    fn write_byte(&mut self, byte: u8) -> Result<(), Ice40Error> {
        self.crc = update_crc16(self.crc, byte);
        self.inner.write_all(&[byte]).map_err(|_| Ice40Error::Io)
    }

    fn crc(&self) -> u16 {
        self.crc
    }

    fn reset_crc(&mut self) {
        self.crc = 0xFFFF;
    }
}

/// Adapts a live [`SpiBus`] transaction to [`Write`], so the patcher can
/// stream directly into the FPGA without buffering the whole bitstream.
/// The caller is responsible for having already put the bus in the right
/// state and asserted CS (`bus.begin()`/the FPGA slave-reset handshake).
pub struct SpiBusWriter<'a, G> {
    bus: &'a mut SpiBus<G>,
}

impl<'a, G> SpiBusWriter<'a, G> {
    pub fn new(bus: &'a mut SpiBus<G>) -> Self {
        Self { bus }
    }
}

impl<G: GpioPins> Write for SpiBusWriter<'_, G> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for &b in buf {
            self.bus
                .tx(b)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn update_crc16(crc: u16, byte: u8) -> u16 {
    let mut crc = crc;
    for i in (0..8).rev() {
        let bit = (byte >> i) & 1;
        let msb = (crc >> 15) & 1;
        crc <<= 1;
        if (msb ^ bit as u16) & 1 == 1 {
            crc ^= 0x1021;
        }
    }
    crc
}

fn xorshift32(x: u32) -> u32 {
    let mut x = x;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// One 32-bit draw from the xorshift32 stream, one bit at a time (the
/// bitstream generator's `get_rand` builds its output bit-by-bit rather
/// than taking a whole xorshift32 word, so the patcher has to reproduce
/// that exact bit assembly to land on the same pattern).
fn next_rand_word(seed: u32) -> u32 {
    let mut seed = seed;
    let mut value = 0u32;
    for i in 0..32 {
        seed = xorshift32(seed);
        if seed & 1 == 1 {
            value |= 1 << i;
        }
    }
    value
}

fn fill_rand(buf: &mut [u8]) {
    // Each word's output feeds back in as the next word's seed, exactly
    // like the original's `last = get_rand(last)` -- chaining the raw
    // post-xorshift internal state instead would desynchronize this
    // pattern from the one actually laid down by the bitstream generator,
    // and `patch_bank` would never find a real mapping against it.
    let mut last = 1u32;
    for chunk in buf.chunks_exact_mut(4) {
        last = next_rand_word(last);
        chunk.copy_from_slice(&last.to_le_bytes());
    }
}

fn get_bit(buf: &[u8], bit_offset: usize) -> bool {
    (buf[bit_offset / 8] >> (bit_offset % 8)) & 1 != 0
}

fn set_bit(buf: &mut [u8], bit_offset: usize, value: bool) {
    let mask = 1u8 << (bit_offset % 8);
    if value {
        buf[bit_offset / 8] |= mask;
    } else {
        buf[bit_offset / 8] &= !mask;
    }
}

/// Scatters logical bit `x` of a `total_bits`-long pattern across the
/// physical bit line the bitstream generator actually wrote it to.
/// `total_bits` must be a power of two.
fn bit_offset(x: usize, total_bits: usize) -> usize {
    let shift = total_bits.trailing_zeros();
    let scaled = x as u64 * 8192;
    ((scaled % total_bits as u64) + (scaled >> shift)) as usize
}

#[derive(Copy, Clone)]
struct WordMapping {
    /// Index, within a 16-random-word group, this scan position maps to.
    /// `-1` means no mapping was found.
    random: i32,
    /// Word stride between repetitions of the pattern. `-1` means none
    /// found for this scan position.
    stride: i32,
}

/// Generates the random/ROM "spray" patterns for one BRAM bank size and
/// patches that pattern into any number of banks of that size.
pub struct Ice40Patcher {
    byte_count: usize,
    output_rand: Vec<u8>,
    output_rom: Vec<u8>,
}

impl Ice40Patcher {
    /// `byte_count` is the BRAM bank's byte count (a power of two); `rom` is
    /// the replacement image, left-padded with zeros to `byte_count` if
    /// shorter.
    pub fn new(byte_count: usize, rom: &[u8]) -> Result<Self, Ice40Error> {
        if rom.len() > byte_count {
            return Err(Ice40Error::RomTooLarge);
        }

        let mut input_rom = vec![0u8; byte_count];
        input_rom[..rom.len()].copy_from_slice(rom);

        let mut input_rand = vec![0u8; byte_count];
        fill_rand(&mut input_rand);

        let total_bits = byte_count * 8;
        let mut output_rand = vec![0u8; byte_count];
        let mut output_rom = vec![0u8; byte_count];
        for i in 0..total_bits {
            let src = bit_offset(i, total_bits);
            set_bit(&mut output_rand, i, get_bit(&input_rand, src));
            set_bit(&mut output_rom, i, get_bit(&input_rom, src));
        }

        Ok(Self {
            byte_count,
            output_rand,
            output_rom,
        })
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    fn word(buf: &[u8], idx: usize) -> u16 {
        u16::from_be_bytes([buf[idx * 2], buf[idx * 2 + 1]])
    }

    /// Streams a whole bitstream from `input` to `output`, substituting the
    /// ROM pattern into every BRAM initialization bank it finds.
    pub fn patch<R: ByteSource, W: ByteSink>(
        &self,
        input: &mut R,
        output: &mut W,
    ) -> Result<(), Ice40Error> {
        let mut preamble = 0u32;
        loop {
            let b = read_required(input)?;
            output.write_byte(b)?;
            preamble = (preamble << 8) | b as u32;
            if preamble == 0x7EAA_997E {
                break;
            }
        }

        let mut current_bank = 0u32;
        let mut current_width = 0u32;
        let mut current_height = 0u32;
        let mut current_offset = 0u32;
        let mut cram_width = 0u32;
        let mut cram_height = 0u32;
        let mut bram_width = 0u32;
        let mut bram_height = 0u32;

        loop {
            let b = match input.read_byte()? {
                Some(b) => b,
                None => break,
            };
            output.write_byte(b)?;

            let cmd = b >> 4;
            let payload_len = b & 0x0F;
            let mut payload: u32 = 0;
            for _ in 0..payload_len {
                let pb = read_required(input)?;
                payload = (payload << 8) | pb as u32;
                if cmd != 2 {
                    output.write_byte(pb)?;
                }
            }

            match cmd {
                0 => match payload {
                    1 => {
                        cram_width = cram_width.max(current_width);
                        cram_height = cram_height.max(current_height);
                        debug!(
                            "cram bank {current_bank}: {current_width}x{current_height}, \
                             running max {cram_width}x{cram_height}"
                        );
                        let n_bytes = (current_width * current_height) / 8;
                        for _ in 0..n_bytes {
                            let data_byte = read_required(input)?;
                            output.write_byte(data_byte)?;
                        }
                        let t0 = read_required(input)?;
                        let t1 = read_required(input)?;
                        if t0 != 0 || t1 != 0 {
                            warn!(
                                "expected 0x0000 terminator after cram data, got {t0:#04x} {t1:#04x}"
                            );
                        }
                        output.write_byte(t0)?;
                        output.write_byte(t1)?;
                    }
                    3 => {
                        bram_width = bram_width.max(current_width);
                        bram_height = bram_height.max(current_height);
                        debug!(
                            "bram bank {current_bank}: {current_width}x{current_height} \
                             at offset {current_offset}, running max {bram_width}x{bram_height}"
                        );
                        self.patch_bank(current_offset, current_width, current_height, input, output)?;
                    }
                    5 => {
                        input.reset_crc();
                        output.reset_crc();
                    }
                    6 => break,
                    other => warn!("unrecognized cmd-0 sub-command: {other}"),
                },
                1 => current_bank = payload,
                2 => {
                    let crc = output.crc();
                    output.write_byte((crc >> 8) as u8)?;
                    output.write_byte(crc as u8)?;
                }
                5 => {
                    if !matches!(payload, 0 | 1 | 2) {
                        warn!("unrecognized oscillator frequency range: {payload:#x}");
                    }
                }
                6 => current_width = payload + 1,
                7 => current_height = payload,
                8 => current_offset = payload,
                9 => {
                    if !matches!(payload, 0 | 1 | 32 | 33) {
                        warn!("unrecognized wakeup feature flags: {payload:#x}");
                    }
                }
                other => warn!("unrecognized command: {other}, payload len {payload_len}"),
            }
        }

        output.write_byte(0)?;
        Ok(())
    }

    /// Patches one BRAM initialization bank: reads the first 128 words into
    /// a scan buffer, correlates them against the random pattern to recover
    /// the per-word physical mapping and stride, then re-emits every word
    /// in the bank (substituting the matching ROM word where a mapping was
    /// found) while checking each substituted word against the expected
    /// random pattern first.
    fn patch_bank<R: ByteSource, W: ByteSink>(
        &self,
        current_offset: u32,
        current_width: u32,
        current_height: u32,
        input: &mut R,
        output: &mut W,
    ) -> Result<(), Ice40Error> {
        let ora_ptr = 16 * current_offset as usize;
        let n_words = ((current_width as u64 * current_height as u64) / 8 / 2) as usize;

        let mut scan_buffer = [0u16; 128];
        for slot in scan_buffer.iter_mut() {
            let hi = read_required(input)?;
            let lo = read_required(input)?;
            *slot = u16::from_be_bytes([hi, lo]);
        }

        let mut word_mappings = [WordMapping {
            random: -1,
            stride: -1,
        }; 16];

        for outer_word in 0..16usize {
            for inner_word in 0..16usize {
                if scan_buffer[outer_word] != Self::word(&self.output_rand, ora_ptr + inner_word) {
                    continue;
                }
                for stride in 0..30usize {
                    let next = scan_buffer.get(outer_word + stride).copied();
                    let next2 = scan_buffer.get(outer_word + 2 * stride).copied();
                    if next == Some(Self::word(&self.output_rand, ora_ptr + inner_word + 16))
                        && next2 == Some(Self::word(&self.output_rand, ora_ptr + inner_word + 32))
                    {
                        word_mappings[outer_word] = WordMapping {
                            random: inner_word as i32,
                            stride: stride as i32,
                        };
                    }
                }
            }
        }

        let mut word_stride: i32 = -1;
        for mapping in &word_mappings {
            if mapping.stride != -1 {
                if word_stride != -1 && mapping.stride != word_stride {
                    warn!(
                        "bram scan stride disagreement: saw {} after settling on {}",
                        mapping.stride, word_stride
                    );
                }
                word_stride = mapping.stride;
            }
        }

        for i in 0..n_words {
            let old_word = if i < scan_buffer.len() {
                scan_buffer[i]
            } else {
                let hi = read_required(input)?;
                let lo = read_required(input)?;
                u16::from_be_bytes([hi, lo])
            };

            let new_word = if word_stride > 0 {
                let mapping = word_mappings[i % word_stride as usize];
                if mapping.random < 0 {
                    old_word
                } else {
                    let group = (i / word_stride as usize) * 16;
                    let expected =
                        Self::word(&self.output_rand, ora_ptr + group + mapping.random as usize);
                    if expected != old_word {
                        return Err(Ice40Error::PatchInvariantViolation {
                            word_offset: i as u32,
                            expected,
                            found: old_word,
                            window: scan_window(&scan_buffer, i),
                        });
                    }
                    Self::word(&self.output_rom, ora_ptr + group + mapping.random as usize)
                }
            } else {
                old_word
            };

            output.write_byte((new_word >> 8) as u8)?;
            output.write_byte(new_word as u8)?;
        }

        let t0 = read_required(input)?;
        let t1 = read_required(input)?;
        if t0 != 0 || t1 != 0 {
            warn!("expected 0x0000 terminator after bram data, got {t0:#04x} {t1:#04x}");
        }
        output.write_byte(t0)?;
        output.write_byte(t1)?;

        Ok(())
    }
}

/// Builds the 32-word diagnostic window around scan-buffer index `center`
/// for a `PatchInvariantViolation`: the 16 words before and 16 at/after it,
/// zero-padded wherever that range falls outside the buffer (the scan
/// buffer only covers a bank's first 128 words, so a mismatch deep into a
/// larger bank has no earlier history to show).
fn scan_window(scan_buffer: &[u16; 128], center: usize) -> [u16; 32] {
    let mut window = [0u16; 32];
    let start = center as isize - 16;
    for (slot, word) in window.iter_mut().enumerate() {
        let idx = start + slot as isize;
        if idx >= 0 && (idx as usize) < scan_buffer.len() {
            *word = scan_buffer[idx as usize];
        }
    }
    window
}

fn read_required<R: ByteSource>(input: &mut R) -> Result<u8, Ice40Error> {
    input.read_byte()?.ok_or(Ice40Error::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cmd(cmd: u8, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= 0xF);
        let mut out = vec![(cmd << 4) | payload.len() as u8];
        out.extend_from_slice(payload);
        out
    }

    /// A cmd-0 sub-command (one payload byte): reset-CRC is sub-op 5,
    /// wakeup is sub-op 6.
    fn sub_cmd(payload_value: u8) -> Vec<u8> {
        cmd(0, &[payload_value])
    }

    fn passthrough_bitstream() -> Vec<u8> {
        let mut bytes = vec![0x7E, 0xAA, 0x99, 0x7E];
        bytes.extend(sub_cmd(5)); // CRC reset
        bytes.extend(sub_cmd(6)); // wakeup, end of stream
        bytes
    }

    #[test]
    fn non_bram_bitstream_passes_through_unchanged() {
        let patcher = Ice40Patcher::new(8192, &[0xAA; 16]).unwrap();
        let input_bytes = passthrough_bitstream();
        let mut input = CrcStream::new(Cursor::new(input_bytes.clone()));
        let mut output = CrcStream::new(Vec::new());
        patcher.patch(&mut input, &mut output).unwrap();

        let mut expected = input_bytes;
        expected.push(0); // trailing pad byte the patcher always appends
        assert_eq!(output.into_inner(), expected);
    }

    #[test]
    fn crc_check_command_emits_running_output_crc() {
        let patcher = Ice40Patcher::new(8192, &[]).unwrap();
        let mut bytes = vec![0x7E, 0xAA, 0x99, 0x7E];
        bytes.extend(sub_cmd(5)); // reset CRC
        bytes.extend(cmd(2, &[0x00, 0x00])); // CRC check, 2-byte payload suppressed
        bytes.extend(sub_cmd(6)); // wakeup

        let mut input = CrcStream::new(Cursor::new(bytes.clone()));
        let mut output = CrcStream::new(Vec::new());
        patcher.patch(&mut input, &mut output).unwrap();

        let written = output.into_inner();
        // The CRC-check command drops its two suppressed payload bytes but
        // emits exactly two CRC bytes in their place, so the only net
        // change in length versus the input is the trailing pad byte the
        // patcher always appends.
        assert_eq!(written.len(), bytes.len() + 1);
    }

    #[test]
    fn rom_longer_than_bank_is_rejected() {
        let err = Ice40Patcher::new(16, &[0; 32]).unwrap_err();
        assert_eq!(err, Ice40Error::RomTooLarge);
    }

    #[test]
    fn spray_pattern_is_a_bit_permutation_of_the_input() {
        let rom = [0xFFu8; 16];
        let patcher = Ice40Patcher::new(16, &rom).unwrap();
        // Every bit of the all-ones ROM must still be set somewhere in the
        // permuted output, since bit_offset is a bijection over the index
        // space: popcount is preserved.
        let ones: u32 = patcher.output_rom.iter().map(|b| b.count_ones()).sum();
        assert_eq!(ones as usize, 16 * 8);
    }

    #[test]
    fn patch_bank_discovers_stride_and_substitutes_rom_words() {
        // A synthetic BRAM bank laid out exactly as a real bitstream would
        // be: word i of the bank is output_rand[i], i.e. the bank data is
        // literally the correctly-chained spray pattern read back
        // sequentially (stride 16, identity inner mapping). This is what
        // `patch_bank`'s scan/correlation loop is supposed to recover
        // without being told the stride or mapping up front, and is
        // exactly the step the prior PRNG-chaining bug broke silently
        // (word_stride would never resolve against a real pattern and
        // patch_bank would become a no-op passthrough with no error).
        let byte_count = 512; // 256 words, a power-of-two bit count
        let rom: Vec<u8> = (0..64u32).map(|i| (i * 7 + 3) as u8).collect();
        let patcher = Ice40Patcher::new(byte_count, &rom).unwrap();

        let width: u32 = 128;
        let height: u32 = 20;
        let n_words = ((width as u64 * height as u64) / 8 / 2) as usize; // 160
        assert!(n_words > 128, "test must exercise the beyond-scan-buffer path");

        let mut bank_words = Vec::with_capacity(n_words);
        for i in 0..n_words {
            bank_words.push(Ice40Patcher::word(&patcher.output_rand, i));
        }

        let mut bytes = vec![0x7E, 0xAA, 0x99, 0x7E];
        bytes.extend(cmd(6, &[(width - 1) as u8])); // set width
        bytes.extend(cmd(7, &[height as u8])); // set height
        bytes.extend(cmd(8, &[])); // set offset = 0
        bytes.extend(cmd(0, &[3])); // cmd 0, sub-op 3: BRAM data
        for w in &bank_words {
            bytes.extend_from_slice(&w.to_be_bytes());
        }
        bytes.extend_from_slice(&[0, 0]); // bank terminator
        bytes.extend(sub_cmd(6)); // wakeup

        let mut input = CrcStream::new(Cursor::new(bytes.clone()));
        let mut output = CrcStream::new(Vec::new());
        patcher.patch(&mut input, &mut output).unwrap();

        let written = output.into_inner();
        // preamble(4) + width cmd(2) + height cmd(2) + offset cmd(1, empty payload) + bram cmd(2)
        let bank_data_start = 4 + 2 + 2 + 1 + 2;
        let patched_words: Vec<u16> = written[bank_data_start..bank_data_start + n_words * 2]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        for (i, &got) in patched_words.iter().enumerate() {
            let want = Ice40Patcher::word(&patcher.output_rom, i);
            assert_eq!(got, want, "word {i} was not substituted with the rom pattern");
        }
        // The replacement pattern must actually differ from the original
        // for this test to mean anything.
        assert_ne!(patched_words[0], bank_words[0]);
    }

    #[test]
    fn update_crc16_matches_known_ccitt_false_vector() {
        // CRC-16/CCITT-FALSE ("123456789") = 0x29B1, a standard test vector
        // for this exact variant (init 0xFFFF, poly 0x1021, no reflection).
        let mut crc = 0xFFFFu16;
        for &b in b"123456789" {
            crc = update_crc16(crc, b);
        }
        assert_eq!(crc, 0x29B1);
    }
}

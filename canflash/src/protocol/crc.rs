//! CRC engine shared by the host and the bootloader.
//!
//! The default algorithm is CRC-32/MPEG-2 (poly `0x04C11DB7`, init
//! `0xFFFFFFFF`, no reflection, no final XOR), which is what the STM32
//! hardware CRC unit computes over 32-bit words. Words are fed in the byte
//! order they are transmitted in, one 4-byte word per update.

use crc::{Algorithm, CRC_32_MPEG_2, Crc, Digest};

/// CRC algorithm used by the bootloader unless configured otherwise.
pub const BOOTLOADER_CRC: &Algorithm<u32> = &CRC_32_MPEG_2;

/// CRC engine for one algorithm; hands out independent accumulators.
pub struct CrcEngine {
    crc: Crc<u32>,
}

impl CrcEngine {
    /// Create an engine for the given algorithm.
    pub fn new(algorithm: &'static Algorithm<u32>) -> Self {
        Self {
            crc: Crc::<u32>::new(algorithm),
        }
    }

    /// Start a fresh running CRC.
    pub fn accumulator(&self) -> CrcAccumulator<'_> {
        CrcAccumulator {
            digest: self.crc.digest(),
            words: 0,
        }
    }

    /// CRC of a whole word stream.
    pub fn checksum_words<I>(&self, words: I) -> u32
    where
        I: IntoIterator<Item = [u8; 4]>,
    {
        let mut acc = self.accumulator();
        for word in words {
            acc.update(word);
        }
        acc.value()
    }
}

impl Default for CrcEngine {
    fn default() -> Self {
        Self::new(BOOTLOADER_CRC)
    }
}

/// Running CRC register fed one 32-bit word at a time.
#[derive(Clone)]
pub struct CrcAccumulator<'a> {
    digest: Digest<'a, u32>,
    words: usize,
}

impl CrcAccumulator<'_> {
    /// Feed one word, already in transmission byte order.
    pub fn update(&mut self, word: [u8; 4]) {
        self.digest.update(&word);
        self.words += 1;
    }

    /// Current CRC value.
    pub fn value(&self) -> u32 {
        self.digest.clone().finalize()
    }

    /// Current CRC in the logical byte order expected as `param2`.
    pub fn digest(&self) -> [u8; 4] {
        self.value().to_be_bytes()
    }

    /// Number of words consumed so far.
    pub fn word_count(&self) -> usize {
        self.words
    }
}

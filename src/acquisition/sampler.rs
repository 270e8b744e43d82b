//! Reconstructs sample words from a bit-serial data line, one bit per data-ready edge.

use bitvec::prelude::*;

/// The result of [SampleAccumulator::push_bit].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// The bit was added to the word in progress.
    Accumulated,
    /// The word in progress already had all of its bits but was never finalized. It was discarded
    /// and the new bit became the first bit of a new word.
    Overflowed { discarded: u16 },
}

/// A word in progress, built up one bit at a time in LSB-first order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleAccumulator {
    word: u16,
    bits: u8,
    width: u8,
}

impl SampleAccumulator {
    /// Creates an empty accumulator for words of `width` bits. `width` must be between 1 and 16.
    pub const fn new(width: u8) -> SampleAccumulator {
        SampleAccumulator {
            word: 0,
            bits: 0,
            width,
        }
    }

    /// Sets the next bit of the word in progress.
    ///
    /// The bit count never exceeds the word width: if the word in progress is already complete,
    /// it gets discarded first.
    pub fn push_bit(&mut self, bit: bool) -> Push {
        let mut result = Push::Accumulated;
        if self.bits >= self.width {
            result = Push::Overflowed {
                discarded: self.take_word(),
            };
        }
        self.word
            .view_bits_mut::<Lsb0>()
            .set(self.bits as usize, bit);
        self.bits += 1;
        result
    }

    /// Returns the word in progress and resets the accumulator for the next one.
    pub fn take_word(&mut self) -> u16 {
        let word = self.word;
        self.word = 0;
        self.bits = 0;
        word
    }

    /// The number of bits accumulated for the word in progress.
    pub fn bit_count(&self) -> u8 {
        self.bits
    }

    pub fn width(&self) -> u8 {
        self.width
    }
}

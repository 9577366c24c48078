//! Packing of small unsigned fields into a byte-aligned flag word.
//!
//! Fields are placed starting at the most significant bit, in call order. The
//! word is written big-endian at its full width of `N` bytes, so the first
//! field always lands in the high bits of the first byte on disk.

use crate::{ByteReader, CodecError};

/// Accumulates fields into an `N`-byte word (`N` is 1, 2 or 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitPacker<const N: usize> {
    word: u32,
    used: u32,
}

impl<const N: usize> Default for BitPacker<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BitPacker<N> {
    const CAPACITY: u32 = (N * 8) as u32;

    pub fn new() -> Self {
        assert!(N == 1 || N == 2 || N == 4, "flag words are 1, 2 or 4 bytes");
        Self { word: 0, used: 0 }
    }

    /// Appends the low `width` bits of `value`.
    ///
    /// Higher bits of `value` are dropped.
    pub fn put_bits(&mut self, value: u32, width: u32) -> &mut Self {
        assert!(
            width > 0 && self.used + width <= Self::CAPACITY,
            "bit budget of {} exceeded",
            Self::CAPACITY
        );
        let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
        self.used += width;
        self.word |= (value & mask) << (Self::CAPACITY - self.used);
        self
    }

    pub fn put_bit(&mut self, bit: bool) -> &mut Self {
        self.put_bits(u32::from(bit), 1)
    }

    pub fn bits_used(&self) -> u32 {
        self.used
    }

    pub fn to_bytes(&self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.word.to_be_bytes()[4 - N..]);
        out
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_bytes());
    }
}

/// Extracts fields from an `N`-byte word in the order they were packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitUnpacker<const N: usize> {
    word: u32,
    consumed: u32,
}

impl<const N: usize> BitUnpacker<N> {
    const CAPACITY: u32 = (N * 8) as u32;

    pub fn from_bytes(bytes: [u8; N]) -> Self {
        assert!(N == 1 || N == 2 || N == 4, "flag words are 1, 2 or 4 bytes");
        let mut full = [0u8; 4];
        full[4 - N..].copy_from_slice(&bytes);
        Self {
            word: u32::from_be_bytes(full),
            consumed: 0,
        }
    }

    /// Reads the next `N` bytes of `reader` as a flag word.
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        reader.get_array::<N>().map(Self::from_bytes)
    }

    pub fn get_bits(&mut self, width: u32) -> u32 {
        assert!(
            width > 0 && self.consumed + width <= Self::CAPACITY,
            "bit budget of {} exceeded",
            Self::CAPACITY
        );
        self.consumed += width;
        let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
        (self.word >> (Self::CAPACITY - self.consumed)) & mask
    }

    pub fn get_bit(&mut self) -> bool {
        self.get_bits(1) == 1
    }
}

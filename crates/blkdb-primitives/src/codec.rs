//! Byte-level reader and the Bitcoin compact-size integer codec.
//!
//! Payload integers are little-endian, key integers and bit-packed flag
//! words are big-endian. Both helpers live here so record codecs never touch
//! raw slice indexing.

use crate::CodecError;

type Result<T> = std::result::Result<T, CodecError>;

// https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/serialize.h#L305
pub fn write_var_int(buf: &mut Vec<u8>, value: u64) {
    if value < 253 {
        buf.push(value as u8);
    } else if value <= 0xFFFF {
        buf.push(253);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFFFF_FFFF {
        buf.push(254);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(255);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// Number of bytes [`write_var_int`] emits for `value`.
pub fn var_int_size(value: u64) -> usize {
    match value {
        0..=252 => 1,
        253..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Cursor over an immutable byte buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Moves the cursor back to an earlier position.
    pub fn rewind(&mut self, n: usize) {
        self.pos = self.pos.saturating_sub(n);
    }

    /// Unread tail of the buffer without advancing.
    pub fn peek_rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Consumes and returns the whole unread tail.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn advance(&mut self, n: usize) -> Result<()> {
        self.get_bytes(n).map(|_| ())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_u16_le(&mut self) -> Result<u16> {
        self.get_array().map(u16::from_le_bytes)
    }

    pub fn get_u16_be(&mut self) -> Result<u16> {
        self.get_array().map(u16::from_be_bytes)
    }

    pub fn get_u32_le(&mut self) -> Result<u32> {
        self.get_array().map(u32::from_le_bytes)
    }

    pub fn get_u32_be(&mut self) -> Result<u32> {
        self.get_array().map(u32::from_be_bytes)
    }

    pub fn get_u64_le(&mut self) -> Result<u64> {
        self.get_array().map(u64::from_le_bytes)
    }

    pub fn get_var_int(&mut self) -> Result<u64> {
        match self.get_u8()? {
            253 => self.get_u16_le().map(u64::from),
            254 => self.get_u32_le().map(u64::from),
            255 => self.get_u64_le(),
            n => Ok(u64::from(n)),
        }
    }
}

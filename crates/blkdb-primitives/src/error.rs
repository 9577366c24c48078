//! Error types for the key and value codecs.

/// Errors that can occur while decoding keys or packed values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Input ended before a field could be read.
    #[error("Unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A key whose length does not match any known key shape.
    #[error("Invalid key length: {0}")]
    InvalidKeyLength(usize),

    /// A key carrying the wrong sub-database prefix.
    #[error("Unexpected key prefix: expected {expected}, got {got:#04x}")]
    UnexpectedPrefix { expected: crate::DbPrefix, got: u8 },

    /// Discriminant that does not map onto a known enum variant.
    #[error("Unknown {kind} variant: {value}")]
    UnknownVariant { kind: &'static str, value: u32 },

    /// A count field too large for the structure it describes.
    #[error("Count {0} is out of range")]
    CountOutOfRange(u64),

    /// Transaction bytes using the segwit marker, which the stored formats do not carry.
    #[error("Witness serialization is not supported")]
    WitnessNotSupported,
}

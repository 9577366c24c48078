//! Error types for stored records.

use blkdb_primitives::{CodecError, Hgtx, TxIoKey};

/// Broad class of a record failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input ended early; the record is left empty.
    Truncated,
    /// Key of the wrong shape or prefix.
    InvalidKey,
    /// Persisted data contradicts itself. Not recoverable locally.
    Corruption,
    /// The record lacks the fields the operation needs.
    Incomplete,
}

/// Errors that can occur while encoding, decoding or aggregating records.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key or value codec error.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Bitcoin consensus decoding error.
    #[error("Consensus decoding error: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),

    /// Merkle root recomputed from the transactions differs from the header.
    #[error("Merkle root mismatch: header commits to {expected}, transactions hash to {computed}")]
    MerkleMismatch {
        expected: bitcoin::TxMerkleNode,
        computed: bitcoin::TxMerkleNode,
    },

    /// A fragmented transaction cannot be rebuilt because an output is absent.
    #[error("Transaction {txid} is missing output {index}")]
    MissingTxOut { txid: bitcoin::Txid, index: u32 },

    /// A length prefix claims more bytes than the buffer holds.
    #[error("Declared length {declared} exceeds available {available} bytes")]
    DeclaredLengthExceeded { declared: usize, available: usize },

    /// Child index outside the range declared by its parent.
    #[error("Index {index} out of range, parent declares {count}")]
    IndexOutOfRange { index: u32, count: u32 },

    /// Cached totals disagree with the totals recomputed from children.
    #[error("History totals mismatch: cached ({cached_unspent}, {cached_count}), computed ({computed_unspent}, {computed_count})")]
    TotalsMismatch {
        cached_unspent: u64,
        cached_count: u64,
        computed_unspent: u64,
        computed_count: u64,
    },

    /// A history bucket keyed under another address.
    #[error("Sub-history of another address cannot join this history")]
    ForeignSubHistory,

    /// A history entry whose output key lies outside its bucket.
    #[error("Txio {txout_key:?} does not belong to bucket {hgtx}")]
    TxIoOutsideBucket { txout_key: TxIoKey, hgtx: Hgtx },

    /// The same output key stored twice in one bucket.
    #[error("Duplicate txio {0:?} in sub-history")]
    DuplicateTxIo(TxIoKey),

    /// A field required by the operation is not set.
    #[error("Record is incomplete: {0}")]
    Incomplete(&'static str),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Codec(CodecError::UnexpectedEof { .. }) => ErrorKind::Truncated,
            Self::Codec(CodecError::InvalidKeyLength(_) | CodecError::UnexpectedPrefix { .. })
            | Self::ForeignSubHistory => ErrorKind::InvalidKey,
            Self::Codec(_)
            | Self::Consensus(_)
            | Self::MerkleMismatch { .. }
            | Self::MissingTxOut { .. }
            | Self::DeclaredLengthExceeded { .. }
            | Self::IndexOutOfRange { .. }
            | Self::TotalsMismatch { .. }
            | Self::TxIoOutsideBucket { .. }
            | Self::DuplicateTxIo(_) => ErrorKind::Corruption,
            Self::Incomplete(_) => ErrorKind::Incomplete,
        }
    }

    /// Whether the error means persisted data can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}

//! Error types for the block data store.

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// A stored record failed to encode or decode.
    #[error("Record error: {0}")]
    Record(#[from] blkdb_records::Error),

    /// The database was created for another network.
    #[error(
        "Magic mismatch: database has {}, expected {}",
        hex::encode(.found),
        hex::encode(.expected)
    )]
    MagicMismatch { expected: [u8; 4], found: [u8; 4] },

    /// No record under the requested key.
    #[error("{what} not found")]
    NotFound { what: &'static str },
}

impl From<blkdb_primitives::CodecError> for Error {
    fn from(err: blkdb_primitives::CodecError) -> Self {
        Self::Record(err.into())
    }
}

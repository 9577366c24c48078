//! Stored records of the block data store.
//!
//! Each record knows its own key and value layout and converts between its
//! in-memory form and the bytes persisted under one of the
//! [`blkdb_primitives::DbPrefix`] sub-databases:
//!
//! | Record | Key |
//! |---|---|
//! | [`StoredDbInfo`] | `DbInfo` |
//! | [`StoredHeader`] | `HeadHash ‖ hash` or `TxData ‖ hgtx` |
//! | [`StoredTx`] | `TxData ‖ hgtx ‖ tx index` |
//! | [`StoredTxOut`] | `TxData ‖ hgtx ‖ tx index ‖ txout index` |
//! | [`StoredScriptHistory`] | `Script ‖ address` |
//! | [`StoredSubHistory`] | `Script ‖ address ‖ hgtx` |
//! | [`StoredUndoData`] | `UndoData ‖ hgtx` |
//! | [`StoredTxHints`] | `TxHints ‖ hash prefix` |
//! | [`StoredHeadHgtList`] | `HeadHgt ‖ height` |
//!
//! Headers own their transactions and transactions own their outputs, so a
//! position assigned to a header trickles down to every child.
//!
//! Decoding a value either fills the record or fails and leaves it empty.

mod dbinfo;
mod error;
mod head_height;
mod header;
mod hints;
mod script_history;
mod sub_history;
mod tx;
mod txio;
mod txout;
mod undo;

#[cfg(test)]
mod tests;

pub use dbinfo::StoredDbInfo;
pub use error::{Error, ErrorKind};
pub use head_height::StoredHeadHgtList;
pub use header::{DbSelect, StoredHeader};
pub use hints::StoredTxHints;
pub use script_history::StoredScriptHistory;
pub use sub_history::StoredSubHistory;
pub use tx::{StoredTx, compute_txid};
pub use txio::TxIoPair;
pub use txout::StoredTxOut;
pub use undo::StoredUndoData;

/// Record result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Persistent block data store.
//!
//! Stores the records of `blkdb-records` in one ordered keyspace, split into
//! sub-databases by a leading prefix byte.
//!
//! ## Architecture
//!
//! - **Backends**: [`KeyValueStore`] with an in-memory [`MemoryStore`] and a
//!   RocksDB-backed [`RocksStore`]
//! - **Blocks**: a header, its fragmented transactions and their outputs are
//!   written in one batch, together with the header-by-hash index, tx hints
//!   and the per-height header list
//! - **Address histories**: a summary record plus one record per hgtx bucket
//! - **Undo data**: per-block records for chain reorganizations

mod config;
mod error;
mod kv;
mod rocks;
mod store;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use error::Error;
pub use kv::{BatchOp, KeyValue, KeyValueStore, MemoryStore, WriteBatch};
pub use rocks::RocksStore;
pub use store::BlockDataStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

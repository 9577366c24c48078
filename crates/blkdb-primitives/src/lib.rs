//! Key and value codec primitives for the block data store.
//!
//! All logical sub-databases share one byte-ordered keyspace, separated by a
//! leading [`DbPrefix`] byte. This crate provides the pieces every stored
//! record is built from:
//!
//! - **Keys**: prefix taxonomy and the hgtx-based block data keys whose byte
//!   order equals chain order.
//! - **Bit packing**: small flag fields packed into 1, 2 or 4 byte words.
//! - **Byte codec**: a bounds-checked reader and the compact-size integer.
//! - **Raw transactions**: section offsets of legacy serialized transactions.
//! - **Script addresses**: the unique key under which an output's history is filed.

mod bitpack;
mod codec;
mod error;
mod keys;
mod raw;
mod script;
mod types;

pub use bitpack::{BitPacker, BitUnpacker};
pub use codec::{ByteReader, var_int_size, write_var_int};
pub use error::CodecError;
pub use keys::{
    BlkDataKey, BlkDataType, DBINFO_KEY, DbPrefix, Hgtx, MAX_HGTX_HEIGHT, PREFERRED_DUP_FLAG,
    TxIoKey, TxKey, blk_data_key, blk_data_key_no_prefix, blk_meta_key, check_prefix, prefix_name,
    read_blk_data_key, read_blk_data_key_any, read_blk_data_key_no_prefix, with_prefix,
};
pub use raw::{OUTPOINT_SIZE, TxLayout, is_coinbase, tx_layout, txout_len};
pub use script::{is_multisig, parse_multisig, script_address};
pub use types::{DbType, MerkleSerType, PruneType, ScriptPrefix, ScriptUtxoType, Spentness, TxSerType};

/// Version nibble written at the head of every packed flag word.
pub const DB_VERSION: u8 = 1;

/// Size of a serialized block header.
pub const HEADER_SIZE: usize = 80;

/// Size of a block or transaction hash.
pub const HASH_SIZE: usize = 32;

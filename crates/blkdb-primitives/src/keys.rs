//! Key encoding for the logical sub-databases sharing one keyspace.
//!
//! Every key starts with a [`DbPrefix`] byte. Block data keys continue with a
//! 4-byte hgtx and optionally the tx and txout indices, all big-endian so that
//! byte-lexicographic order equals (height, dup, tx index, txout index) order.

use crate::{ByteReader, CodecError};
use std::fmt;

type Result<T> = std::result::Result<T, CodecError>;

/// Bit of a stored duplicate id byte flagging the preferred entry.
pub const PREFERRED_DUP_FLAG: u8 = 0x80;

/// Largest height representable in a hgtx.
pub const MAX_HGTX_HEIGHT: u32 = 0x00FF_FFFF;

/// Sub-database a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DbPrefix {
    DbInfo = 0,
    HeadHash = 1,
    HeadHgt = 2,
    TxData = 3,
    TxHints = 4,
    Script = 5,
    UndoData = 6,
    TrieNodes = 7,
    Count = 8,
    ZcData = 9,
    BlkMeta = 10,
}

impl DbPrefix {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DbInfo => "DBINFO",
            Self::HeadHash => "HEADHASH",
            Self::HeadHgt => "HEADHGT",
            Self::TxData => "TXDATA",
            Self::TxHints => "TXHINTS",
            Self::Script => "SCRIPT",
            Self::UndoData => "UNDODATA",
            Self::TrieNodes => "TRIENODES",
            Self::Count => "COUNT",
            Self::ZcData => "ZCDATA",
            Self::BlkMeta => "BLKMETA",
        }
    }
}

impl TryFrom<u8> for DbPrefix {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::DbInfo,
            1 => Self::HeadHash,
            2 => Self::HeadHgt,
            3 => Self::TxData,
            4 => Self::TxHints,
            5 => Self::Script,
            6 => Self::UndoData,
            7 => Self::TrieNodes,
            8 => Self::Count,
            9 => Self::ZcData,
            10 => Self::BlkMeta,
            _ => {
                return Err(CodecError::UnknownVariant {
                    kind: "db prefix",
                    value: u32::from(value),
                });
            }
        })
    }
}

impl fmt::Display for DbPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Display name of a raw prefix byte, `"<unknown>"` if it is not assigned.
pub fn prefix_name(byte: u8) -> &'static str {
    DbPrefix::try_from(byte).map_or("<unknown>", DbPrefix::name)
}

/// Singleton key of the database info record.
pub const DBINFO_KEY: [u8; 1] = [DbPrefix::DbInfo as u8];

/// Consumes the next byte of `reader` and checks it equals `prefix`.
///
/// With `rewind` set the byte is pushed back on success, leaving the reader
/// where it started.
pub fn check_prefix(reader: &mut ByteReader<'_>, prefix: DbPrefix, rewind: bool) -> Result<()> {
    let got = reader.get_u8()?;
    if got != prefix.to_u8() {
        reader.rewind(1);
        return Err(CodecError::UnexpectedPrefix {
            expected: prefix,
            got,
        });
    }
    if rewind {
        reader.rewind(1);
    }
    Ok(())
}

/// Packed `(height << 8) | dup` in big-endian order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hgtx([u8; 4]);

impl Hgtx {
    /// Packs a height below 2^24 and a duplicate id below 128.
    ///
    /// Out-of-range inputs keep only their representable low bits.
    pub fn new(height: u32, dup: u8) -> Self {
        let packed = ((height & MAX_HGTX_HEIGHT) << 8) | u32::from(dup & !PREFERRED_DUP_FLAG);
        Self(packed.to_be_bytes())
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn height(&self) -> u32 {
        u32::from_be_bytes(self.0) >> 8
    }

    pub fn dup_id(&self) -> u8 {
        self.0[3] & !PREFERRED_DUP_FLAG
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for Hgtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height(), self.dup_id())
    }
}

/// 6-byte key of a transaction: hgtx ‖ tx index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxKey([u8; 6]);

impl TxKey {
    pub fn new(height: u32, dup: u8, tx_index: u16) -> Self {
        let mut key = [0u8; 6];
        key[..4].copy_from_slice(Hgtx::new(height, dup).as_bytes());
        key[4..].copy_from_slice(&tx_index.to_be_bytes());
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn hgtx(&self) -> Hgtx {
        Hgtx([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn tx_index(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

/// 8-byte key addressing a txout or a txin: hgtx ‖ tx index ‖ io index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxIoKey([u8; 8]);

impl TxIoKey {
    pub fn new(height: u32, dup: u8, tx_index: u16, io_index: u16) -> Self {
        Self::from_parts(Hgtx::new(height, dup), tx_index, io_index)
    }

    pub fn from_parts(hgtx: Hgtx, tx_index: u16, io_index: u16) -> Self {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(hgtx.as_bytes());
        key[4..6].copy_from_slice(&tx_index.to_be_bytes());
        key[6..].copy_from_slice(&io_index.to_be_bytes());
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn hgtx(&self) -> Hgtx {
        Hgtx([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn tx_index(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    pub fn io_index(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }

    /// Key of the transaction this input or output belongs to.
    pub fn tx_key(&self) -> TxKey {
        TxKey([self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]])
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Low four bytes (tx index ‖ io index), the part below the hgtx.
    pub fn suffix(&self) -> [u8; 4] {
        [self.0[4], self.0[5], self.0[6], self.0[7]]
    }
}

/// Granularity of a block data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkDataType {
    Header,
    Tx,
    TxOut,
}

/// Decoded block data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkDataKey {
    Header(Hgtx),
    Tx(TxKey),
    TxOut(TxIoKey),
}

impl BlkDataKey {
    pub fn data_type(&self) -> BlkDataType {
        match self {
            Self::Header(_) => BlkDataType::Header,
            Self::Tx(_) => BlkDataType::Tx,
            Self::TxOut(_) => BlkDataType::TxOut,
        }
    }

    pub fn hgtx(&self) -> Hgtx {
        match self {
            Self::Header(hgtx) => *hgtx,
            Self::Tx(key) => key.hgtx(),
            Self::TxOut(key) => key.hgtx(),
        }
    }

    pub fn height(&self) -> u32 {
        self.hgtx().height()
    }

    pub fn dup_id(&self) -> u8 {
        self.hgtx().dup_id()
    }

    pub fn tx_index(&self) -> Option<u16> {
        match self {
            Self::Header(_) => None,
            Self::Tx(key) => Some(key.tx_index()),
            Self::TxOut(key) => Some(key.tx_index()),
        }
    }

    pub fn txout_index(&self) -> Option<u16> {
        match self {
            Self::TxOut(key) => Some(key.io_index()),
            _ => None,
        }
    }

    /// Key bytes without the sub-database prefix.
    pub fn to_bytes_no_prefix(&self) -> Vec<u8> {
        match self {
            Self::Header(hgtx) => hgtx.as_bytes().to_vec(),
            Self::Tx(key) => key.as_bytes().to_vec(),
            Self::TxOut(key) => key.as_bytes().to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        with_prefix(DbPrefix::TxData, &self.to_bytes_no_prefix())
    }
}

/// Prepends a prefix byte to `body`.
pub fn with_prefix(prefix: DbPrefix, body: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(body.len() + 1);
    key.push(prefix.to_u8());
    key.extend_from_slice(body);
    key
}

/// Builds a block data key; `tx_index` and `txout_index` select the granularity.
///
/// A txout index without a tx index is ignored.
pub fn blk_data_key(height: u32, dup: u8, tx_index: Option<u16>, txout_index: Option<u16>) -> Vec<u8> {
    with_prefix(
        DbPrefix::TxData,
        &blk_data_key_no_prefix(height, dup, tx_index, txout_index),
    )
}

pub fn blk_data_key_no_prefix(
    height: u32,
    dup: u8,
    tx_index: Option<u16>,
    txout_index: Option<u16>,
) -> Vec<u8> {
    let hgtx = Hgtx::new(height, dup);
    match (tx_index, txout_index) {
        (None, _) => BlkDataKey::Header(hgtx),
        (Some(tx), None) => BlkDataKey::Tx(TxKey::new(height, dup, tx)),
        (Some(tx), Some(txout)) => BlkDataKey::TxOut(TxIoKey::from_parts(hgtx, tx, txout)),
    }
    .to_bytes_no_prefix()
}

/// Key of the per-block metadata record.
pub fn blk_meta_key(height: u32, dup: u8) -> Vec<u8> {
    with_prefix(DbPrefix::BlkMeta, Hgtx::new(height, dup).as_bytes())
}

/// Decodes a block data key that starts with the `TxData` prefix.
pub fn read_blk_data_key(key: &[u8]) -> Result<BlkDataKey> {
    let mut reader = ByteReader::new(key);
    check_prefix(&mut reader, DbPrefix::TxData, false)?;
    read_blk_data_key_no_prefix(reader.peek_rest())
}

/// Decodes a block data key without prefix; the length picks the granularity.
pub fn read_blk_data_key_no_prefix(key: &[u8]) -> Result<BlkDataKey> {
    match key.len() {
        4 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(key);
            Ok(BlkDataKey::Header(Hgtx(bytes)))
        }
        6 => {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(key);
            Ok(BlkDataKey::Tx(TxKey(bytes)))
        }
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(key);
            Ok(BlkDataKey::TxOut(TxIoKey(bytes)))
        }
        len => Err(CodecError::InvalidKeyLength(len)),
    }
}

/// Decodes a block data key whose prefix is optional.
///
/// A key one byte longer than a known shape must carry the `TxData` prefix.
pub fn read_blk_data_key_any(key: &[u8]) -> Result<BlkDataKey> {
    match key.len() {
        5 | 7 | 9 => read_blk_data_key(key),
        _ => read_blk_data_key_no_prefix(key),
    }
}

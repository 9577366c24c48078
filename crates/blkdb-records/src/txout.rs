use crate::{Error, Result};
use bitcoin::Txid;
use blkdb_primitives::{
    BitPacker, BitUnpacker, BlkDataKey, ByteReader, CodecError, DB_VERSION, DbPrefix, DbType,
    Hgtx, PruneType, Spentness, TxIoKey, TxKey, read_blk_data_key_any, txout_len,
};
use std::sync::OnceLock;

/// A transaction output stored at `TxData ‖ hgtx ‖ tx index ‖ txout index`.
///
/// Value layout:
///
/// ```text
/// flags(2) ‖ value u64 LE ‖ var_int script len ‖ script ‖ [spender key(8) when spent]
/// ```
#[derive(Debug, Clone, Default)]
pub struct StoredTxOut {
    pub block_height: Option<u32>,
    pub duplicate_id: Option<u8>,
    pub tx_index: Option<u16>,
    pub txout_index: Option<u16>,
    /// Version of the parent transaction; two bits survive storage.
    pub tx_version: u32,
    pub is_coinbase: bool,
    pub spentness: Spentness,
    /// Key of the input spending this output.
    pub spent_by_txin_key: Option<TxIoKey>,
    /// Hash of the parent transaction, not part of the stored value.
    pub parent_hash: Option<Txid>,
    data: Vec<u8>,
    script_address: OnceLock<Vec<u8>>,
}

impl PartialEq for StoredTxOut {
    fn eq(&self, other: &Self) -> bool {
        self.block_height == other.block_height
            && self.duplicate_id == other.duplicate_id
            && self.tx_index == other.tx_index
            && self.txout_index == other.txout_index
            && self.tx_version == other.tx_version
            && self.is_coinbase == other.is_coinbase
            && self.spentness == other.spentness
            && self.spent_by_txin_key == other.spent_by_txin_key
            && self.parent_hash == other.parent_hash
            && self.data == other.data
    }
}

impl Eq for StoredTxOut {}

impl StoredTxOut {
    /// Builds an output from its value and locking script.
    pub fn new(value: u64, script: &[u8]) -> Self {
        let mut data = Vec::with_capacity(8 + 9 + script.len());
        data.extend_from_slice(&value.to_le_bytes());
        blkdb_primitives::write_var_int(&mut data, script.len() as u64);
        data.extend_from_slice(script);
        Self {
            data,
            ..Default::default()
        }
    }

    /// Parses exactly one serialized txout.
    pub fn from_raw(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let mut txout = Self::default();
        txout.unserialize(&mut reader)?;
        if !reader.is_empty() {
            return Err(Error::DeclaredLengthExceeded {
                declared: reader.position(),
                available: data.len(),
            });
        }
        Ok(txout)
    }

    /// Reads the raw txout at the reader's position.
    pub fn unserialize(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        let len = txout_len(reader.peek_rest())?;
        self.data = reader.get_bytes(len)?.to_vec();
        self.script_address = OnceLock::new();
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        !self.data.is_empty()
    }

    /// Serialized txout bytes (value ‖ script).
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn value(&self) -> Option<u64> {
        let bytes = self.data.get(..8)?;
        let mut value = [0u8; 8];
        value.copy_from_slice(bytes);
        Some(u64::from_le_bytes(value))
    }

    pub fn script(&self) -> Option<&[u8]> {
        let mut reader = ByteReader::new(self.data.get(8..)?);
        let len = reader.get_var_int().ok()? as usize;
        reader.get_bytes(len).ok()
    }

    /// Unique address key of the locking script, computed on first use.
    pub fn script_address(&self) -> &[u8] {
        self.script_address
            .get_or_init(|| blkdb_primitives::script_address(self.script().unwrap_or_default()))
    }

    pub fn is_multisig(&self) -> bool {
        self.script().is_some_and(blkdb_primitives::is_multisig)
    }

    pub fn is_spent(&self) -> bool {
        self.spentness == Spentness::Spent
    }

    pub fn mark_spent(&mut self, txin_key: TxIoKey) {
        self.spentness = Spentness::Spent;
        self.spent_by_txin_key = Some(txin_key);
    }

    pub fn mark_unspent(&mut self) {
        self.spentness = Spentness::Unspent;
        self.spent_by_txin_key = None;
    }

    pub fn set_key_data(&mut self, height: u32, dup: u8, tx_index: u16, txout_index: u16) {
        self.block_height = Some(height);
        self.duplicate_id = Some(dup);
        self.tx_index = Some(tx_index);
        self.txout_index = Some(txout_index);
    }

    pub fn hgtx(&self) -> Result<Hgtx> {
        match (self.block_height, self.duplicate_id) {
            (Some(height), Some(dup)) => Ok(Hgtx::new(height, dup)),
            _ => Err(Error::Incomplete("txout block position")),
        }
    }

    /// 8-byte position key of this output.
    pub fn io_key(&self) -> Result<TxIoKey> {
        let hgtx = self.hgtx()?;
        match (self.tx_index, self.txout_index) {
            (Some(tx_index), Some(txout_index)) => Ok(TxIoKey::from_parts(hgtx, tx_index, txout_index)),
            _ => Err(Error::Incomplete("txout index")),
        }
    }

    pub fn db_key(&self, with_prefix: bool) -> Result<Vec<u8>> {
        let key = BlkDataKey::TxOut(self.io_key()?);
        Ok(if with_prefix {
            key.to_bytes()
        } else {
            key.to_bytes_no_prefix()
        })
    }

    pub fn parent_tx_key(&self) -> Result<TxKey> {
        Ok(self.io_key()?.tx_key())
    }

    pub fn db_key_of_parent_tx(&self, with_prefix: bool) -> Result<Vec<u8>> {
        let key = self.parent_tx_key()?;
        Ok(if with_prefix {
            blkdb_primitives::with_prefix(DbPrefix::TxData, key.as_bytes())
        } else {
            key.as_bytes().to_vec()
        })
    }

    /// Whether `key` (8 bytes, or 9 with prefix) addresses this output.
    pub fn matches_db_key(&self, key: &[u8]) -> bool {
        match (key.len(), self.db_key(key.len() == 9)) {
            (8 | 9, Ok(own)) => own == key,
            _ => false,
        }
    }

    /// Sets the position fields from an 8-byte key, or a 9-byte prefixed key.
    pub fn deserialize_db_key(&mut self, key: &[u8]) -> Result<()> {
        match read_blk_data_key_any(key)? {
            BlkDataKey::TxOut(io_key) => {
                self.set_key_data(
                    io_key.hgtx().height(),
                    io_key.hgtx().dup_id(),
                    io_key.tx_index(),
                    io_key.io_index(),
                );
                Ok(())
            }
            _ => Err(CodecError::InvalidKeyLength(key.len()).into()),
        }
    }

    /// Spentness written for a database of `db_type`.
    ///
    /// Lite and partial databases do not track spentness unless forced.
    fn spentness_for(&self, db_type: DbType, force_save_spentness: bool) -> Spentness {
        if force_save_spentness {
            return self.spentness;
        }
        match db_type {
            DbType::Lite | DbType::Partial => Spentness::SpentUnknown,
            DbType::Bare | DbType::Full | DbType::Super => self.spentness,
        }
    }

    pub fn serialize_db_value(
        &self,
        db_type: DbType,
        _prune_type: PruneType,
        force_save_spentness: bool,
    ) -> Result<Vec<u8>> {
        if !self.is_initialized() {
            return Err(Error::Incomplete("txout data"));
        }
        let spentness = self.spentness_for(db_type, force_save_spentness);

        let mut flags = BitPacker::<2>::new();
        flags
            .put_bits(u32::from(DB_VERSION), 4)
            .put_bits(self.tx_version, 2)
            .put_bits(u32::from(spentness.to_u8()), 2)
            .put_bit(self.is_coinbase);

        let mut out = Vec::with_capacity(2 + self.data.len() + 8);
        flags.write_to(&mut out);
        out.extend_from_slice(&self.data);
        if spentness == Spentness::Spent {
            let key = self
                .spent_by_txin_key
                .ok_or(Error::Incomplete("spending txin key"))?;
            out.extend_from_slice(key.as_bytes());
        }
        Ok(out)
    }

    /// Decodes `data` into the value fields; on failure they are cleared.
    pub fn deserialize_db_value(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.read_db_value(&mut reader).inspect_err(|_| self.clear_value())
    }

    fn read_db_value(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        let mut flags = BitUnpacker::<2>::read(reader)?;
        let db_version = flags.get_bits(4);
        self.tx_version = flags.get_bits(2);
        self.spentness = Spentness::try_from(flags.get_bits(2))?;
        self.is_coinbase = flags.get_bit();

        if db_version != u32::from(DB_VERSION) {
            tracing::warn!("TxOut value version {db_version} differs from {DB_VERSION}");
        }

        self.unserialize(reader)?;

        self.spent_by_txin_key = if self.spentness == Spentness::Spent && reader.remaining() >= 8 {
            Some(TxIoKey::from_bytes(reader.get_array()?))
        } else {
            None
        };
        Ok(())
    }

    fn clear_value(&mut self) {
        self.data.clear();
        self.tx_version = 0;
        self.is_coinbase = false;
        self.spentness = Spentness::default();
        self.spent_by_txin_key = None;
        self.script_address = OnceLock::new();
    }

    /// Decodes the raw bytes as a [`bitcoin::TxOut`].
    pub fn to_tx_out(&self) -> Result<bitcoin::TxOut> {
        Ok(bitcoin::consensus::deserialize(&self.data)?)
    }
}

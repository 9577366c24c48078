//! Per-block undo data for chain reorganizations.

use crate::{Error, Result, StoredTxOut};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};
use blkdb_primitives::{
    BitPacker, BitUnpacker, ByteReader, DbPrefix, DbType, HASH_SIZE, Hgtx, OUTPOINT_SIZE,
    PruneType, Spentness, TxIoKey, check_prefix,
};

/// Everything needed to reverse a block's effect on the output set: the
/// outputs it spent and the outpoints it created.
///
/// Stored at `UndoData ‖ hgtx`:
///
/// ```text
/// block hash(32) ‖ removed count u32 LE ‖ removed × (flags(1) ‖ position key(8) ‖
/// parent hash(32) ‖ txout index u32 LE ‖ raw txout) ‖ added count u32 LE ‖ added × outpoint(36)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUndoData {
    pub block_height: Option<u32>,
    pub duplicate_id: Option<u8>,
    pub block_hash: BlockHash,
    /// Outputs spent by the block, in spend order.
    pub stxos_removed: Vec<StoredTxOut>,
    /// Outputs created by the block.
    pub outpoints_added: Vec<OutPoint>,
}

impl Default for StoredUndoData {
    fn default() -> Self {
        Self {
            block_height: None,
            duplicate_id: None,
            block_hash: BlockHash::all_zeros(),
            stxos_removed: Vec::new(),
            outpoints_added: Vec::new(),
        }
    }
}

impl StoredUndoData {
    pub fn new(height: u32, dup: u8, block_hash: BlockHash) -> Self {
        Self {
            block_height: Some(height),
            duplicate_id: Some(dup),
            block_hash,
            ..Default::default()
        }
    }

    /// Records an output spent by the block.
    pub fn record_spend(&mut self, stxo: StoredTxOut) {
        self.stxos_removed.push(stxo);
    }

    /// Records an output created by the block.
    pub fn record_create(&mut self, outpoint: OutPoint) {
        self.outpoints_added.push(outpoint);
    }

    pub fn spent_count(&self) -> usize {
        self.stxos_removed.len()
    }

    pub fn created_count(&self) -> usize {
        self.outpoints_added.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stxos_removed.is_empty() && self.outpoints_added.is_empty()
    }

    pub fn hgtx(&self) -> Result<Hgtx> {
        match (self.block_height, self.duplicate_id) {
            (Some(height), Some(dup)) => Ok(Hgtx::new(height, dup)),
            _ => Err(Error::Incomplete("undo block position")),
        }
    }

    pub fn db_key(&self, with_prefix: bool) -> Result<Vec<u8>> {
        let hgtx = self.hgtx()?;
        Ok(if with_prefix {
            blkdb_primitives::with_prefix(DbPrefix::UndoData, hgtx.as_bytes())
        } else {
            hgtx.as_bytes().to_vec()
        })
    }

    /// Sets the block position from a bare 4-byte hgtx or a 5-byte prefixed key.
    pub fn deserialize_db_key(&mut self, key: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(key);
        match key.len() {
            4 => {}
            5 => check_prefix(&mut reader, DbPrefix::UndoData, false)?,
            len => return Err(blkdb_primitives::CodecError::InvalidKeyLength(len).into()),
        }
        let hgtx = Hgtx::from_bytes(reader.get_array()?);
        self.block_height = Some(hgtx.height());
        self.duplicate_id = Some(hgtx.dup_id());
        Ok(())
    }

    pub fn serialize_db_value(&self, db_type: DbType, _prune_type: PruneType) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HASH_SIZE + 8 + self.outpoints_added.len() * OUTPOINT_SIZE);
        out.extend_from_slice(self.block_hash.as_byte_array());

        out.extend_from_slice(&(self.stxos_removed.len() as u32).to_le_bytes());
        for stxo in &self.stxos_removed {
            let parent_hash = stxo.parent_hash.ok_or(Error::Incomplete("stxo parent hash"))?;
            let io_key = stxo.io_key()?;
            if !stxo.is_initialized() {
                return Err(Error::Incomplete("stxo data"));
            }

            let mut flags = BitPacker::<1>::new();
            flags
                .put_bits(u32::from(db_type.to_u8()), 4)
                .put_bits(stxo.tx_version, 2)
                .put_bit(stxo.is_coinbase);
            flags.write_to(&mut out);

            out.extend_from_slice(io_key.as_bytes());
            out.extend_from_slice(parent_hash.as_byte_array());
            out.extend_from_slice(&u32::from(io_key.io_index()).to_le_bytes());
            out.extend_from_slice(stxo.raw());
        }

        out.extend_from_slice(&(self.outpoints_added.len() as u32).to_le_bytes());
        for outpoint in &self.outpoints_added {
            out.extend_from_slice(&bitcoin::consensus::serialize(outpoint));
        }
        Ok(out)
    }

    /// Decodes the value; on failure the undo lists are cleared.
    pub fn deserialize_db_value(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.read_db_value(&mut reader).inspect_err(|_| {
            self.block_hash = BlockHash::all_zeros();
            self.stxos_removed.clear();
            self.outpoints_added.clear();
        })
    }

    fn read_db_value(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        self.block_hash = BlockHash::from_byte_array(reader.get_array()?);

        let removed = reader.get_u32_le()? as usize;
        // Each removed output takes at least 54 bytes.
        self.stxos_removed = Vec::with_capacity(removed.min(reader.remaining() / 54));
        for _ in 0..removed {
            let mut flags = BitUnpacker::<1>::read(reader)?;
            let _db_type = DbType::try_from(flags.get_bits(4))?;
            let tx_version = flags.get_bits(2);
            let is_coinbase = flags.get_bit();

            let io_key = TxIoKey::from_bytes(reader.get_array()?);
            let parent_hash = Txid::from_byte_array(reader.get_array()?);
            let txout_index = reader.get_u32_le()?;

            let mut stxo = StoredTxOut::default();
            stxo.unserialize(reader)?;
            stxo.set_key_data(
                io_key.hgtx().height(),
                io_key.hgtx().dup_id(),
                io_key.tx_index(),
                txout_index as u16,
            );
            stxo.tx_version = tx_version;
            stxo.is_coinbase = is_coinbase;
            stxo.parent_hash = Some(parent_hash);
            stxo.spentness = Spentness::Spent;
            self.stxos_removed.push(stxo);
        }

        let added = reader.get_u32_le()? as usize;
        self.outpoints_added = Vec::with_capacity(added.min(reader.remaining() / OUTPOINT_SIZE));
        for _ in 0..added {
            let outpoint: OutPoint = bitcoin::consensus::deserialize(reader.get_bytes(OUTPOINT_SIZE)?)?;
            self.outpoints_added.push(outpoint);
        }
        Ok(())
    }
}

use crate::{Error, Result, StoredTx};
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::{BlockHash, TxMerkleNode, Txid};
use blkdb_primitives::{
    BitPacker, BitUnpacker, BlkDataKey, ByteReader, CodecError, DB_VERSION, DbPrefix, DbType,
    HEADER_SIZE, Hgtx, MerkleSerType, PruneType, read_blk_data_key_any, with_prefix, write_var_int,
};
use std::collections::BTreeMap;

/// Sub-database a header value is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbSelect {
    /// Header index keyed by hash: `raw(80) ‖ hgtx(4) ‖ size u32 LE`.
    Headers,
    /// Block data keyed by hgtx:
    /// `flags(4) ‖ raw(80) ‖ num tx u32 LE ‖ size u32 LE ‖ [merkle]`.
    BlkData,
}

/// A block header together with the transactions loaded for it.
///
/// Identified by `(height, duplicate id)`. The block is full once every
/// transaction index in `0..num_tx` is present and each of them has all of
/// its outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredHeader {
    pub block_height: Option<u32>,
    pub duplicate_id: Option<u8>,
    pub num_tx: u32,
    /// Serialized size of the full block.
    pub num_bytes: u32,
    pub is_main_branch: bool,
    pub block_applied_to_db: bool,
    pub merkle: Vec<u8>,
    pub merkle_type: MerkleSerType,
    pub txs: BTreeMap<u16, StoredTx>,
    raw_header: Vec<u8>,
    hash: Option<BlockHash>,
}

impl StoredHeader {
    pub fn from_header(raw_header: &[u8]) -> Result<Self> {
        let mut header = Self::default();
        header.set_header_data(raw_header)?;
        Ok(header)
    }

    /// Installs the 80-byte header and caches its hash.
    pub fn set_header_data(&mut self, raw_header: &[u8]) -> Result<()> {
        if raw_header.len() != HEADER_SIZE {
            return Err(CodecError::UnexpectedEof {
                needed: HEADER_SIZE,
                remaining: raw_header.len(),
            }
            .into());
        }
        self.raw_header = raw_header.to_vec();
        self.hash = Some(BlockHash::from_raw_hash(sha256d::Hash::hash(raw_header)));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        !self.raw_header.is_empty()
    }

    pub fn raw_header(&self) -> &[u8] {
        &self.raw_header
    }

    pub fn hash(&self) -> Option<BlockHash> {
        self.hash
    }

    /// Decodes the raw header.
    pub fn header(&self) -> Result<bitcoin::block::Header> {
        Ok(bitcoin::consensus::deserialize(&self.raw_header)?)
    }

    /// Sets the block position and pushes it down to every child tx and txout.
    pub fn set_key_data(&mut self, height: u32, dup: u8) {
        self.block_height = Some(height);
        self.duplicate_id = Some(dup);
        for (index, tx) in self.txs.iter_mut() {
            tx.set_key_data(height, dup, *index);
        }
    }

    pub fn hgtx(&self) -> Result<Hgtx> {
        match (self.block_height, self.duplicate_id) {
            (Some(height), Some(dup)) => Ok(Hgtx::new(height, dup)),
            _ => Err(Error::Incomplete("block position")),
        }
    }

    /// Block data key of this header.
    pub fn db_key(&self, with_prefix: bool) -> Result<Vec<u8>> {
        let key = BlkDataKey::Header(self.hgtx()?);
        Ok(if with_prefix {
            key.to_bytes()
        } else {
            key.to_bytes_no_prefix()
        })
    }

    /// Key of the header index entry: `HeadHash ‖ block hash`.
    pub fn headers_db_key(&self) -> Result<Vec<u8>> {
        let hash = self.hash.ok_or(Error::Incomplete("block header"))?;
        Ok(with_prefix(DbPrefix::HeadHash, hash.as_byte_array()))
    }

    /// Sets the position from a 4-byte key, or a 5-byte prefixed key.
    pub fn deserialize_db_key(&mut self, key: &[u8]) -> Result<()> {
        match read_blk_data_key_any(key)? {
            BlkDataKey::Header(hgtx) => {
                self.set_key_data(hgtx.height(), hgtx.dup_id());
                Ok(())
            }
            _ => Err(CodecError::InvalidKeyLength(key.len()).into()),
        }
    }

    /// Attaches tx `index`, which must be below the declared tx count.
    pub fn add_tx(&mut self, index: u16, mut tx: StoredTx) -> Result<()> {
        if u32::from(index) >= self.num_tx {
            return Err(Error::IndexOutOfRange {
                index: u32::from(index),
                count: self.num_tx,
            });
        }
        if let (Some(height), Some(dup)) = (self.block_height, self.duplicate_id) {
            tx.set_key_data(height, dup, index);
        }
        self.txs.insert(index, tx);
        Ok(())
    }

    pub fn tx(&self, index: u16) -> Option<&StoredTx> {
        self.txs.get(&index)
    }

    pub fn tx_mut(&mut self, index: u16) -> Option<&mut StoredTx> {
        self.txs.get_mut(&index)
    }

    /// Complete raw bytes of tx `index`.
    pub fn serialized_tx(&self, index: u16) -> Result<Vec<u8>> {
        self.txs
            .get(&index)
            .ok_or(Error::IndexOutOfRange {
                index: u32::from(index),
                count: self.num_tx,
            })?
            .serialized_tx()
    }

    pub fn have_full_block(&self) -> bool {
        self.raw_header.len() == HEADER_SIZE
            && (0..self.num_tx).all(|index| {
                self.txs
                    .get(&(index as u16))
                    .is_some_and(StoredTx::have_all_txouts)
            })
    }

    /// Serialized block: header ‖ var_int tx count ‖ transactions.
    pub fn serialize_full_block(&self) -> Result<Vec<u8>> {
        if !self.have_full_block() {
            return Err(Error::Incomplete("full block"));
        }
        let mut out = Vec::with_capacity(self.num_bytes as usize);
        out.extend_from_slice(&self.raw_header);
        write_var_int(&mut out, u64::from(self.num_tx));
        for index in 0..self.num_tx {
            out.extend_from_slice(&self.serialized_tx(index as u16)?);
        }
        Ok(out)
    }

    /// Parses a serialized block, optionally preceded by `magic(4) ‖ size u32 LE`.
    ///
    /// The merkle root is recomputed from the parsed transactions; a mismatch
    /// is a corruption error. Nothing is installed unless the whole block
    /// parses and verifies, in which case the header is replaced while the
    /// block position and branch flag are kept.
    pub fn deserialize_full_block(&mut self, data: &[u8], fragged: bool, with_prefix: bool) -> Result<()> {
        let mut parsed = Self::parse_full_block(data, fragged, with_prefix)?;
        parsed.is_main_branch = self.is_main_branch;
        if let (Some(height), Some(dup)) = (self.block_height, self.duplicate_id) {
            parsed.set_key_data(height, dup);
        }
        *self = parsed;
        Ok(())
    }

    fn parse_full_block(data: &[u8], fragged: bool, with_prefix: bool) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        if with_prefix {
            let _magic = reader.get_array::<4>()?;
            let declared = reader.get_u32_le()? as usize;
            if declared > reader.remaining() {
                return Err(Error::DeclaredLengthExceeded {
                    declared,
                    available: reader.remaining(),
                });
            }
        }

        let start = reader.position();
        let mut block = Self::default();
        block.set_header_data(reader.get_bytes(HEADER_SIZE)?)?;
        let header = block.header()?;

        let num_tx = reader.get_var_int()?;
        if num_tx > u64::from(u16::MAX) + 1 {
            return Err(CodecError::CountOutOfRange(num_tx).into());
        }
        block.num_tx = num_tx as u32;

        let mut txids = Vec::with_capacity(num_tx as usize);
        for index in 0..block.num_tx {
            let tx = StoredTx::read_raw(&mut reader, fragged, true)?;
            txids.push(tx.hash.ok_or(Error::Incomplete("tx hash"))?);
            block.txs.insert(index as u16, tx);
        }

        let computed = bitcoin::merkle_tree::calculate_root(txids.into_iter().map(Txid::to_raw_hash))
            .map(TxMerkleNode::from_raw_hash)
            .unwrap_or_else(TxMerkleNode::all_zeros);
        if computed != header.merkle_root {
            return Err(Error::MerkleMismatch {
                expected: header.merkle_root,
                computed,
            });
        }

        block.num_bytes = (reader.position() - start) as u32;
        Ok(block)
    }

    pub fn serialize_db_value(
        &self,
        select: DbSelect,
        db_type: DbType,
        prune_type: PruneType,
    ) -> Result<Vec<u8>> {
        if !self.is_initialized() {
            return Err(Error::Incomplete("block header"));
        }

        match select {
            DbSelect::Headers => {
                let mut out = Vec::with_capacity(HEADER_SIZE + 8);
                out.extend_from_slice(&self.raw_header);
                out.extend_from_slice(self.hgtx()?.as_bytes());
                out.extend_from_slice(&self.num_bytes.to_le_bytes());
                Ok(out)
            }
            DbSelect::BlkData => {
                let merkle_type = if self.merkle.is_empty() {
                    MerkleSerType::NoMerkle
                } else {
                    MerkleSerType::for_db_type(db_type)
                };
                let block_version = self.header()?.version.to_consensus() as u32;

                let mut flags = BitPacker::<4>::new();
                flags
                    .put_bits(u32::from(DB_VERSION), 4)
                    .put_bits(block_version, 4)
                    .put_bits(u32::from(db_type.to_u8()), 4)
                    .put_bits(u32::from(prune_type.to_u8()), 2)
                    .put_bits(u32::from(merkle_type.to_u8()), 2)
                    .put_bit(self.block_applied_to_db);

                let mut out = Vec::with_capacity(4 + HEADER_SIZE + 8 + self.merkle.len());
                flags.write_to(&mut out);
                out.extend_from_slice(&self.raw_header);
                out.extend_from_slice(&self.num_tx.to_le_bytes());
                out.extend_from_slice(&self.num_bytes.to_le_bytes());
                if merkle_type != MerkleSerType::NoMerkle {
                    out.extend_from_slice(&self.merkle);
                }
                Ok(out)
            }
        }
    }

    /// Decodes a header value; on failure the record is reset.
    pub fn deserialize_db_value(&mut self, select: DbSelect, data: &[u8], ignore_merkle: bool) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.read_db_value(select, &mut reader, ignore_merkle)
            .inspect_err(|_| *self = Self::default())
    }

    fn read_db_value(&mut self, select: DbSelect, reader: &mut ByteReader<'_>, ignore_merkle: bool) -> Result<()> {
        match select {
            DbSelect::Headers => {
                self.set_header_data(reader.get_bytes(HEADER_SIZE)?)?;
                let hgtx = Hgtx::from_bytes(reader.get_array()?);
                self.set_key_data(hgtx.height(), hgtx.dup_id());
                self.num_bytes = reader.get_u32_le()?;
            }
            DbSelect::BlkData => {
                let mut flags = BitUnpacker::<4>::read(reader)?;
                let db_version = flags.get_bits(4);
                let _block_version = flags.get_bits(4);
                let _db_type = DbType::try_from(flags.get_bits(4))?;
                let _prune_type = PruneType::try_from(flags.get_bits(2))?;
                self.merkle_type = MerkleSerType::try_from(flags.get_bits(2))?;
                self.block_applied_to_db = flags.get_bit();

                if db_version != u32::from(DB_VERSION) {
                    tracing::warn!("Header value version {db_version} differs from {DB_VERSION}");
                }

                self.set_header_data(reader.get_bytes(HEADER_SIZE)?)?;
                self.num_tx = reader.get_u32_le()?;
                self.num_bytes = reader.get_u32_le()?;

                self.merkle = if self.merkle_type != MerkleSerType::NoMerkle && !ignore_merkle {
                    reader.take_rest().to_vec()
                } else {
                    Vec::new()
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{build_block, coinbase_tx, raw_block, spending_tx};

    fn sample_block() -> bitcoin::Block {
        build_block(vec![coinbase_tx(0), spending_tx(2), spending_tx(3)])
    }

    #[test]
    fn test_full_block_round_trip() {
        let block = sample_block();
        let raw = raw_block(&block);

        let mut header = StoredHeader::default();
        header.set_key_data(100, 0);
        header.deserialize_full_block(&raw, true, false).unwrap();

        assert_eq!(header.num_tx, 3);
        assert_eq!(header.num_bytes as usize, raw.len());
        assert_eq!(header.hash(), Some(block.block_hash()));
        assert!(header.have_full_block());
        assert_eq!(header.serialize_full_block().unwrap(), raw);

        // Position trickled down to every child.
        let txout = &header.tx(2).unwrap().txouts[&1];
        assert_eq!(txout.db_key(false).unwrap(), blkdb_primitives::blk_data_key_no_prefix(100, 0, Some(2), Some(1)));
        assert!(header.tx(0).unwrap().txouts[&0].is_coinbase);
        assert!(!txout.is_coinbase);
        assert_eq!(txout.parent_hash, Some(block.txdata[2].compute_txid()));
    }

    #[test]
    fn test_full_block_with_magic_prefix() {
        let raw = raw_block(&sample_block());
        let mut prefixed = b"\xf9\xbe\xb4\xd9".to_vec();
        prefixed.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        prefixed.extend_from_slice(&raw);

        let mut header = StoredHeader::default();
        header.deserialize_full_block(&prefixed, false, true).unwrap();
        assert_eq!(header.serialize_full_block().unwrap(), raw);

        let mut short = prefixed.clone();
        short.truncate(prefixed.len() - 10);
        let err = header.deserialize_full_block(&short, false, true).unwrap_err();
        assert!(matches!(err, Error::DeclaredLengthExceeded { .. }));
    }

    #[test]
    fn test_merkle_mismatch_installs_nothing() {
        let mut block = sample_block();
        block.header.merkle_root = TxMerkleNode::all_zeros();
        let raw = raw_block(&block);

        let mut header = StoredHeader::default();
        let err = header.deserialize_full_block(&raw, true, false).unwrap_err();
        assert!(matches!(err, Error::MerkleMismatch { .. }));
        assert!(err.is_corruption());
        assert!(!header.is_initialized());
        assert!(header.txs.is_empty());
    }

    #[test]
    fn test_missing_tx_means_partial_block() {
        let raw = raw_block(&sample_block());
        let mut header = StoredHeader::default();
        header.deserialize_full_block(&raw, true, false).unwrap();
        header.txs.remove(&1);
        assert!(!header.have_full_block());
        assert!(matches!(header.serialize_full_block(), Err(Error::Incomplete(_))));

        assert!(matches!(
            header.add_tx(3, StoredTx::default()),
            Err(Error::IndexOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_header_db_values() {
        let raw = raw_block(&sample_block());
        let mut header = StoredHeader::default();
        header.deserialize_full_block(&raw, true, false).unwrap();
        header.set_key_data(42, 1);
        header.block_applied_to_db = true;

        let value = header.serialize_db_value(DbSelect::Headers, DbType::Full, PruneType::None).unwrap();
        assert_eq!(value.len(), 88);
        let mut decoded = StoredHeader::default();
        decoded.deserialize_db_value(DbSelect::Headers, &value, false).unwrap();
        assert_eq!(decoded.hash(), header.hash());
        assert_eq!(decoded.hgtx().unwrap(), Hgtx::new(42, 1));
        assert_eq!(decoded.num_bytes, header.num_bytes);

        let value = header.serialize_db_value(DbSelect::BlkData, DbType::Full, PruneType::None).unwrap();
        assert_eq!(value.len(), 4 + 80 + 8);
        let mut decoded = StoredHeader::default();
        decoded.deserialize_db_key(&header.db_key(true).unwrap()).unwrap();
        decoded.deserialize_db_value(DbSelect::BlkData, &value, false).unwrap();
        assert_eq!(decoded.num_tx, 3);
        assert!(decoded.block_applied_to_db);
        assert_eq!(decoded.merkle_type, MerkleSerType::NoMerkle);
        assert_eq!(decoded.raw_header(), header.raw_header());
        assert_eq!(decoded.hgtx().unwrap(), Hgtx::new(42, 1));
    }

    #[test]
    fn test_merkle_data_follows_db_type() {
        let raw = raw_block(&sample_block());
        let mut header = StoredHeader::default();
        header.deserialize_full_block(&raw, true, false).unwrap();
        header.set_key_data(1, 0);
        header.merkle = vec![0xaa; 64];

        let value = header.serialize_db_value(DbSelect::BlkData, DbType::Lite, PruneType::All).unwrap();
        let mut decoded = StoredHeader::default();
        decoded.deserialize_db_value(DbSelect::BlkData, &value, false).unwrap();
        assert_eq!(decoded.merkle_type, MerkleSerType::PartialMerkle);
        assert_eq!(decoded.merkle, vec![0xaa; 64]);

        decoded.deserialize_db_value(DbSelect::BlkData, &value, true).unwrap();
        assert!(decoded.merkle.is_empty());

        // Full databases keep no merkle data.
        let value = header.serialize_db_value(DbSelect::BlkData, DbType::Full, PruneType::None).unwrap();
        assert_eq!(value.len(), 4 + 80 + 8);
    }

    #[test]
    fn test_truncated_header_value_resets() {
        let raw = raw_block(&sample_block());
        let mut header = StoredHeader::default();
        header.deserialize_full_block(&raw, true, false).unwrap();
        header.set_key_data(1, 0);
        let value = header.serialize_db_value(DbSelect::BlkData, DbType::Full, PruneType::None).unwrap();

        let err = header.deserialize_db_value(DbSelect::BlkData, &value[..50], false).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Truncated);
        assert!(!header.is_initialized());
        assert_eq!(header.block_height, None);
    }
}

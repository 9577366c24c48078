use crate::{Error, Result};
use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use blkdb_primitives::{
    BitPacker, BitUnpacker, ByteReader, DB_VERSION, DBINFO_KEY, DbType, HASH_SIZE, PruneType,
};

/// Database-wide metadata, stored once under [`DBINFO_KEY`].
///
/// Value layout:
///
/// ```text
/// magic(4) ‖ flags(4) ‖ top height u32 LE ‖ applied height u32 LE ‖ top hash(32) ‖ [scanned hash(32)]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDbInfo {
    /// Network magic; `None` until the record is initialized or decoded.
    pub magic: Option<[u8; 4]>,
    pub top_block_height: u32,
    /// Last height whose block data was applied to the database.
    pub applied_to_height: u32,
    pub top_block_hash: BlockHash,
    /// Hash of the last block the scanner processed, if tracked.
    pub top_scanned_hash: Option<BlockHash>,
    pub db_version: u8,
    pub db_type: DbType,
    pub prune_type: PruneType,
}

impl Default for StoredDbInfo {
    fn default() -> Self {
        Self {
            magic: None,
            top_block_height: u32::MAX,
            applied_to_height: 0,
            top_block_hash: BlockHash::all_zeros(),
            top_scanned_hash: None,
            db_version: DB_VERSION,
            db_type: DbType::default(),
            prune_type: PruneType::default(),
        }
    }
}

impl StoredDbInfo {
    /// Fresh info record for an empty database.
    pub fn new(magic: [u8; 4], db_type: DbType, prune_type: PruneType) -> Self {
        Self {
            magic: Some(magic),
            top_block_height: 0,
            db_type,
            prune_type,
            ..Default::default()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.magic.is_some()
    }

    pub fn db_key() -> [u8; 1] {
        DBINFO_KEY
    }

    pub fn serialize_db_value(&self) -> Result<Vec<u8>> {
        let magic = self.magic.ok_or(Error::Incomplete("db info magic"))?;

        let mut flags = BitPacker::<4>::new();
        flags
            .put_bits(u32::from(self.db_version), 4)
            .put_bits(u32::from(self.db_type.to_u8()), 4)
            .put_bits(u32::from(self.prune_type.to_u8()), 4);

        let mut out = Vec::with_capacity(48 + HASH_SIZE);
        out.extend_from_slice(&magic);
        flags.write_to(&mut out);
        out.extend_from_slice(&self.top_block_height.to_le_bytes());
        out.extend_from_slice(&self.applied_to_height.to_le_bytes());
        out.extend_from_slice(self.top_block_hash.as_byte_array());
        if let Some(scanned) = &self.top_scanned_hash {
            out.extend_from_slice(scanned.as_byte_array());
        }
        Ok(out)
    }

    /// Decodes `data` into `self`; on failure `self` is reset to the empty state.
    pub fn deserialize_db_value(&mut self, data: &[u8]) -> Result<()> {
        Self::decode(data)
            .map(|info| *self = info)
            .inspect_err(|_| *self = Self::default())
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let magic = reader.get_array::<4>()?;

        let mut flags = BitUnpacker::<4>::read(&mut reader)?;
        let db_version = flags.get_bits(4) as u8;
        let db_type = DbType::try_from(flags.get_bits(4))?;
        let prune_type = PruneType::try_from(flags.get_bits(4))?;

        if db_version != DB_VERSION {
            tracing::warn!(
                "DB info version {db_version} differs from current version {DB_VERSION}, decoding anyway"
            );
        }

        let top_block_height = reader.get_u32_le()?;
        let applied_to_height = reader.get_u32_le()?;
        let top_block_hash = BlockHash::from_byte_array(reader.get_array()?);
        let top_scanned_hash = if reader.remaining() == HASH_SIZE {
            Some(BlockHash::from_byte_array(reader.get_array()?))
        } else {
            None
        };

        Ok(Self {
            magic: Some(magic),
            top_block_height,
            applied_to_height,
            top_block_hash,
            top_scanned_hash,
            db_version,
            db_type,
            prune_type,
        })
    }
}

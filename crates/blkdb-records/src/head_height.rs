use crate::{Error, Result};
use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use blkdb_primitives::{
    ByteReader, CodecError, DbPrefix, HASH_SIZE, PREFERRED_DUP_FLAG, check_prefix, with_prefix,
};

/// All headers known at one height, each tagged with its duplicate id.
///
/// Stored at `HeadHgt ‖ height BE` as `count u8 ‖ (dup u8 ‖ hash(32))...`,
/// preferred entry first with [`PREFERRED_DUP_FLAG`] set on its dup byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredHeadHgtList {
    pub height: Option<u32>,
    pub dup_and_hash_list: Vec<(u8, BlockHash)>,
    pub preferred_dup: Option<u8>,
}

impl StoredHeadHgtList {
    pub fn new(height: u32) -> Self {
        Self {
            height: Some(height),
            ..Default::default()
        }
    }

    /// Adds or replaces the entry for `dup`.
    pub fn add_dup_and_hash(&mut self, dup: u8, hash: BlockHash, preferred: bool) {
        let dup = dup & !PREFERRED_DUP_FLAG;
        match self.dup_and_hash_list.iter_mut().find(|(d, _)| *d == dup) {
            Some(entry) => entry.1 = hash,
            None => self.dup_and_hash_list.push((dup, hash)),
        }
        if preferred {
            self.preferred_dup = Some(dup);
        }
    }

    /// Duplicate id of `hash` at this height.
    pub fn dup_of(&self, hash: &BlockHash) -> Option<u8> {
        self.dup_and_hash_list
            .iter()
            .find(|(_, h)| h == hash)
            .map(|(d, _)| *d)
    }

    pub fn preferred_hash(&self) -> Option<BlockHash> {
        let preferred = self.preferred_dup?;
        self.dup_and_hash_list
            .iter()
            .find(|(d, _)| *d == preferred)
            .map(|(_, h)| *h)
    }

    pub fn db_key(&self) -> Result<Vec<u8>> {
        let height = self.height.ok_or(Error::Incomplete("head height"))?;
        Ok(with_prefix(DbPrefix::HeadHgt, &height.to_be_bytes()))
    }

    pub fn deserialize_db_key(&mut self, key: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(key);
        check_prefix(&mut reader, DbPrefix::HeadHgt, false)?;
        if reader.remaining() != 4 {
            return Err(CodecError::InvalidKeyLength(key.len()).into());
        }
        self.height = Some(reader.get_u32_be()?);
        Ok(())
    }

    /// Encodes the list; more than 255 entries do not fit the count byte.
    pub fn serialize_db_value(&self) -> Result<Vec<u8>> {
        let len = self.dup_and_hash_list.len();
        let count = u8::try_from(len).map_err(|_| CodecError::CountOutOfRange(len as u64))?;
        let mut out = Vec::with_capacity(1 + len * (1 + HASH_SIZE));
        out.push(count);

        let preferred = self
            .preferred_dup
            .and_then(|dup| self.dup_and_hash_list.iter().find(|(d, _)| *d == dup));
        if let Some((dup, hash)) = preferred {
            out.push(dup | PREFERRED_DUP_FLAG);
            out.extend_from_slice(hash.as_byte_array());
        }
        for (dup, hash) in &self.dup_and_hash_list {
            if Some(*dup) == preferred.map(|(d, _)| *d) {
                continue;
            }
            out.push(dup & !PREFERRED_DUP_FLAG);
            out.extend_from_slice(hash.as_byte_array());
        }
        Ok(out)
    }

    /// Decodes the value, stripping the preferred flag from the dup bytes.
    pub fn deserialize_db_value(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.read_db_value(&mut reader).inspect_err(|_| {
            self.dup_and_hash_list.clear();
            self.preferred_dup = None;
        })
    }

    fn read_db_value(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        let count = reader.get_u8()? as usize;
        self.dup_and_hash_list = Vec::with_capacity(count);
        self.preferred_dup = None;
        for _ in 0..count {
            let flagged = reader.get_u8()?;
            let dup = flagged & !PREFERRED_DUP_FLAG;
            let hash = BlockHash::from_byte_array(reader.get_array()?);
            if flagged & PREFERRED_DUP_FLAG != 0 {
                self.preferred_dup = Some(dup);
            }
            self.dup_and_hash_list.push((dup, hash));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_preferred_entry_is_first_and_flagged() {
        let mut list = StoredHeadHgtList::new(500);
        list.add_dup_and_hash(0, BlockHash::from_byte_array([0xaa; 32]), false);
        list.add_dup_and_hash(1, BlockHash::from_byte_array([0xbb; 32]), true);

        let value = list.serialize_db_value().unwrap();
        assert_eq!(value.len(), 1 + 2 * 33);
        assert_eq!(value[0], 2);
        assert_eq!(value[1], 0x81);
        assert_eq!(value[34], 0x00);

        let mut decoded = StoredHeadHgtList::default();
        decoded.deserialize_db_key(&list.db_key().unwrap()).unwrap();
        decoded.deserialize_db_value(&value).unwrap();
        assert_eq!(decoded.height, Some(500));
        assert_eq!(decoded.preferred_dup, Some(1));
        assert_eq!(
            decoded.preferred_hash(),
            Some(BlockHash::from_byte_array([0xbb; 32]))
        );
        assert_eq!(decoded.dup_of(&BlockHash::from_byte_array([0xaa; 32])), Some(0));
        assert!(decoded.dup_and_hash_list.iter().all(|(d, _)| d & 0x80 == 0));
    }

    #[test]
    fn test_key_is_big_endian_height() {
        let list = StoredHeadHgtList::new(0x0102_0304);
        assert_eq!(list.db_key().unwrap(), [DbPrefix::HeadHgt.to_u8(), 1, 2, 3, 4]);

        let mut decoded = StoredHeadHgtList::default();
        let err = decoded
            .deserialize_db_key(&[DbPrefix::HeadHash.to_u8(), 1, 2, 3, 4])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKey);
        assert!(StoredHeadHgtList::default().db_key().is_err());
    }

    #[test]
    fn test_truncated_list() {
        let mut list = StoredHeadHgtList::new(7);
        list.add_dup_and_hash(0, BlockHash::all_zeros(), true);
        let value = list.serialize_db_value().unwrap();

        let mut decoded = list.clone();
        let err = decoded.deserialize_db_value(&value[..20]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncated);
        assert!(decoded.dup_and_hash_list.is_empty());
    }

    #[test]
    fn test_count_must_fit_one_byte() {
        let mut list = StoredHeadHgtList::new(9);
        for dup in 0..=u8::MAX {
            list.add_dup_and_hash(dup, BlockHash::from_byte_array([dup; 32]), false);
        }
        // Dup ids are seven bits wide, so adding folds onto 128 entries.
        assert_eq!(list.dup_and_hash_list.len(), 128);
        assert_eq!(list.serialize_db_value().unwrap()[0], 128);

        list.dup_and_hash_list = (0..256u32)
            .map(|i| (0, BlockHash::from_byte_array([i as u8; 32])))
            .collect();
        assert!(matches!(
            list.serialize_db_value(),
            Err(Error::Codec(CodecError::CountOutOfRange(256)))
        ));
    }
}

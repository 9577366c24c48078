use crate::{Error, Result};
use bitcoin::Txid;
use bitcoin::hashes::Hash;
use blkdb_primitives::{ByteReader, DbPrefix, TxKey, check_prefix, with_prefix, write_var_int};

/// Candidate locations of transactions whose hash starts with a given
/// 4-byte prefix, stored at `TxHints ‖ hash prefix`.
///
/// Value layout: `var_int count ‖ preferred key(6) ‖ other keys(6)...`. On
/// read, the first key is the preferred one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTxHints {
    pub tx_hash_prefix: [u8; 4],
    pub db_keys: Vec<TxKey>,
    pub preferred_db_key: Option<TxKey>,
}

impl StoredTxHints {
    pub fn new(tx_hash_prefix: [u8; 4]) -> Self {
        Self {
            tx_hash_prefix,
            ..Default::default()
        }
    }

    /// Hint record covering `txid`.
    pub fn for_txid(txid: &Txid) -> Self {
        let bytes = txid.as_byte_array();
        Self::new([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn num_hints(&self) -> usize {
        self.db_keys.len()
    }

    /// Adds a candidate key, ignoring duplicates.
    pub fn add_key(&mut self, key: TxKey, preferred: bool) {
        if !self.db_keys.contains(&key) {
            self.db_keys.push(key);
        }
        if preferred || self.preferred_db_key.is_none() {
            self.preferred_db_key = Some(key);
        }
    }

    /// Removes a candidate key; the preferred key falls back to the first left.
    pub fn remove_key(&mut self, key: &TxKey) -> bool {
        let before = self.db_keys.len();
        self.db_keys.retain(|k| k != key);
        if self.preferred_db_key.as_ref() == Some(key) {
            self.preferred_db_key = self.db_keys.first().copied();
        }
        before != self.db_keys.len()
    }

    pub fn db_key(&self) -> Vec<u8> {
        with_prefix(DbPrefix::TxHints, &self.tx_hash_prefix)
    }

    pub fn deserialize_db_key(&mut self, key: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(key);
        check_prefix(&mut reader, DbPrefix::TxHints, false)?;
        if reader.remaining() != 4 {
            return Err(blkdb_primitives::CodecError::InvalidKeyLength(key.len()).into());
        }
        self.tx_hash_prefix = reader.get_array()?;
        Ok(())
    }

    pub fn serialize_db_value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.db_keys.len() * 6);
        write_var_int(&mut out, self.db_keys.len() as u64);
        if let Some(preferred) = self.preferred_db_key.filter(|key| self.db_keys.contains(key)) {
            out.extend_from_slice(preferred.as_bytes());
            self.db_keys
                .iter()
                .filter(|key| **key != preferred)
                .for_each(|key| out.extend_from_slice(key.as_bytes()));
        } else {
            self.db_keys
                .iter()
                .for_each(|key| out.extend_from_slice(key.as_bytes()));
        }
        out
    }

    /// Decodes the value; an empty value holds no hints.
    pub fn deserialize_db_value(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.read_db_value(&mut reader).inspect_err(|_| {
            self.db_keys.clear();
            self.preferred_db_key = None;
        })
    }

    fn read_db_value(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        let count = if reader.is_empty() {
            0
        } else {
            reader.get_var_int()? as usize
        };
        if count > reader.remaining() / 6 {
            return Err(Error::DeclaredLengthExceeded {
                declared: count.saturating_mul(6),
                available: reader.remaining(),
            });
        }
        self.db_keys = (0..count)
            .map(|_| reader.get_array().map(TxKey::from_bytes))
            .collect::<std::result::Result<_, _>>()?;
        self.preferred_db_key = self.db_keys.first().copied();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_key_is_written_first() {
        let k1 = TxKey::new(10, 0, 1);
        let k2 = TxKey::new(20, 0, 2);
        let k3 = TxKey::new(30, 1, 3);

        let mut hints = StoredTxHints::new([0xde, 0xad, 0xbe, 0xef]);
        hints.add_key(k1, false);
        hints.add_key(k2, false);
        hints.add_key(k3, false);
        assert_eq!(hints.preferred_db_key, Some(k1));
        hints.add_key(k2, true);
        assert_eq!(hints.num_hints(), 3);

        let value = hints.serialize_db_value();
        assert_eq!(value.len(), 1 + 18);
        assert_eq!(&value[1..7], k2.as_bytes());

        let mut decoded = StoredTxHints::default();
        decoded.deserialize_db_key(&hints.db_key()).unwrap();
        decoded.deserialize_db_value(&value).unwrap();
        assert_eq!(decoded.tx_hash_prefix, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decoded.preferred_db_key, Some(k2));
        assert_eq!(decoded.db_keys, vec![k2, k1, k3]);
    }

    #[test]
    fn test_empty_value_means_no_hints() {
        let mut hints = StoredTxHints::new([0; 4]);
        hints.add_key(TxKey::new(1, 0, 0), true);
        hints.deserialize_db_value(&[]).unwrap();
        assert_eq!(hints.num_hints(), 0);
        assert_eq!(hints.preferred_db_key, None);
    }

    #[test]
    fn test_declared_count_beyond_value() {
        let mut hints = StoredTxHints::default();
        let err = hints.deserialize_db_value(&[3, 0, 0, 1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::DeclaredLengthExceeded { .. }));
        assert!(hints.db_keys.is_empty());
    }

    #[test]
    fn test_remove_preferred_key() {
        let mut hints = StoredTxHints::new([0; 4]);
        hints.add_key(TxKey::new(1, 0, 0), true);
        hints.add_key(TxKey::new(2, 0, 0), false);
        assert!(hints.remove_key(&TxKey::new(1, 0, 0)));
        assert_eq!(hints.preferred_db_key, Some(TxKey::new(2, 0, 0)));
        assert!(!hints.remove_key(&TxKey::new(9, 0, 0)));
    }
}

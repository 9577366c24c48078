use crate::{Error, Result, TxIoPair};
use blkdb_primitives::{
    BitPacker, BitUnpacker, ByteReader, CodecError, DbPrefix, Hgtx, TxIoKey, check_prefix,
    write_var_int,
};
use std::collections::BTreeMap;

/// One hgtx bucket of an address history.
///
/// Stored at `Script ‖ unique key ‖ hgtx`. Every entry's output key starts
/// with the bucket's hgtx.
///
/// Value layout:
///
/// ```text
/// var_int count ‖ count × (flags(1) ‖ value u64 LE ‖ txout key(8) ‖ [txin key(8)])
/// ```
///
/// Entry flags, most significant first: from-self, coinbase, spent,
/// multisig, utxo. The txin key is present iff the spent bit is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredSubHistory {
    pub unique_key: Vec<u8>,
    pub hgtx: Option<Hgtx>,
    pub txios: BTreeMap<TxIoKey, TxIoPair>,
    /// Number of entries in the bucket.
    pub txio_count: u64,
    keys_to_delete: Vec<TxIoKey>,
}

impl StoredSubHistory {
    pub fn new(unique_key: Vec<u8>, hgtx: Hgtx) -> Self {
        Self {
            unique_key,
            hgtx: Some(hgtx),
            ..Default::default()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.hgtx.is_some()
    }

    pub fn height(&self) -> Option<u32> {
        self.hgtx.map(|hgtx| hgtx.height())
    }

    pub fn dup_id(&self) -> Option<u8> {
        self.hgtx.map(|hgtx| hgtx.dup_id())
    }

    pub fn len(&self) -> usize {
        self.txios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txios.is_empty()
    }

    pub fn db_key(&self, with_prefix: bool) -> Result<Vec<u8>> {
        let hgtx = self.hgtx.ok_or(Error::Incomplete("sub-history hgtx"))?;
        if self.unique_key.is_empty() {
            return Err(Error::Incomplete("sub-history address"));
        }
        let mut key = Vec::with_capacity(1 + self.unique_key.len() + 4);
        if with_prefix {
            key.push(DbPrefix::Script.to_u8());
        }
        key.extend_from_slice(&self.unique_key);
        key.extend_from_slice(hgtx.as_bytes());
        Ok(key)
    }

    /// Splits a key into address and hgtx; the last four bytes are the hgtx.
    pub fn deserialize_db_key(&mut self, key: &[u8], with_prefix: bool) -> Result<()> {
        let mut reader = ByteReader::new(key);
        if with_prefix {
            check_prefix(&mut reader, DbPrefix::Script, false)?;
        }
        let body = reader.take_rest();
        if body.len() < 5 {
            return Err(CodecError::InvalidKeyLength(key.len()).into());
        }
        let (unique_key, hgtx) = body.split_at(body.len() - 4);
        self.unique_key = unique_key.to_vec();
        self.hgtx = Some(Hgtx::from_bytes([hgtx[0], hgtx[1], hgtx[2], hgtx[3]]));
        Ok(())
    }

    pub fn serialize_db_value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.txios.len() * 25);
        write_var_int(&mut out, self.txios.len() as u64);
        for txio in self.txios.values() {
            let mut flags = BitPacker::<1>::new();
            flags
                .put_bit(txio.is_txout_from_self)
                .put_bit(txio.is_coinbase)
                .put_bit(txio.has_txin())
                .put_bit(txio.is_multisig)
                .put_bit(txio.is_utxo);
            flags.write_to(&mut out);
            out.extend_from_slice(&txio.value.to_le_bytes());
            out.extend_from_slice(txio.txout_key.as_bytes());
            if let Some(txin_key) = &txio.txin_key {
                out.extend_from_slice(txin_key.as_bytes());
            }
        }
        out
    }

    /// Replaces the entries with those in `data`; on failure the bucket is emptied.
    ///
    /// If the key was decoded first, every entry must lie in its hgtx.
    pub fn deserialize_db_value(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.read_db_value(&mut reader).inspect_err(|_| {
            self.txios.clear();
            self.txio_count = 0;
        })
    }

    fn read_db_value(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        let count = reader.get_var_int()?;
        self.txios.clear();
        for _ in 0..count {
            let mut flags = BitUnpacker::<1>::read(reader)?;
            let is_txout_from_self = flags.get_bit();
            let is_coinbase = flags.get_bit();
            let spent = flags.get_bit();
            let is_multisig = flags.get_bit();
            let is_utxo = flags.get_bit();

            let value = reader.get_u64_le()?;
            let txout_key = TxIoKey::from_bytes(reader.get_array()?);
            let txin_key = if spent {
                Some(TxIoKey::from_bytes(reader.get_array()?))
            } else {
                None
            };

            if let Some(hgtx) = self.hgtx.filter(|hgtx| *hgtx != txout_key.hgtx()) {
                return Err(Error::TxIoOutsideBucket { txout_key, hgtx });
            }
            let txio = TxIoPair {
                txout_key,
                txin_key,
                value,
                is_coinbase,
                is_multisig,
                is_utxo,
                is_txout_from_self,
            };
            if self.txios.insert(txout_key, txio).is_some() {
                return Err(Error::DuplicateTxIo(txout_key));
            }
        }
        self.txio_count = self.txios.len() as u64;
        Ok(())
    }

    /// Entry count of a stored value without decoding the entries.
    pub fn read_summary(data: &[u8]) -> Result<u64> {
        Ok(ByteReader::new(data).get_var_int()?)
    }

    /// Looks up an entry; multisig entries are hidden unless `with_multisig`.
    pub fn find_txio(&self, txout_key: &TxIoKey, with_multisig: bool) -> Option<&TxIoPair> {
        self.txios
            .get(txout_key)
            .filter(|txio| with_multisig || !txio.is_multisig)
    }

    /// Inserts or overwrites an entry, returning the previous one.
    ///
    /// An uninitialized bucket adopts the entry's hgtx; otherwise the entry
    /// must share it.
    pub fn insert_txio(&mut self, txio: TxIoPair) -> Result<Option<TxIoPair>> {
        let hgtx = *self.hgtx.get_or_insert(txio.txout_key.hgtx());
        if txio.txout_key.hgtx() != hgtx {
            return Err(Error::TxIoOutsideBucket {
                txout_key: txio.txout_key,
                hgtx,
            });
        }
        Ok(self.insert_entry(txio))
    }

    /// Inserts an entry already known to lie in this bucket.
    pub(crate) fn insert_entry(&mut self, txio: TxIoPair) -> Option<TxIoPair> {
        let previous = self.txios.insert(txio.txout_key, txio);
        if previous.is_none() {
            self.txio_count += 1;
        }
        previous
    }

    /// Removes an entry and stages its key for deletion.
    pub fn erase_txio(&mut self, txout_key: &TxIoKey) -> Option<TxIoPair> {
        let Some(txio) = self.txios.remove(txout_key) else {
            tracing::warn!(
                "Erasing txio {:?} absent from sub-history {:?}",
                txout_key,
                self.hgtx
            );
            return None;
        };
        self.keys_to_delete.push(txio.deletion_key());
        self.txio_count = self.txio_count.saturating_sub(1);
        Some(txio)
    }

    /// Marks an existing entry as spent by `txin_key`.
    ///
    /// Returns the entry as it was before, `None` if it does not exist.
    pub fn mark_txout_spent(&mut self, txout_key: &TxIoKey, txin_key: TxIoKey) -> Option<TxIoPair> {
        let txio = self.txios.get_mut(txout_key)?;
        let previous = *txio;
        txio.set_txin(txin_key);
        Some(previous)
    }

    /// Marks an entry unspent, creating it if needed.
    ///
    /// Returns the entry as it was before, if it existed.
    pub fn mark_txout_unspent(
        &mut self,
        txout_key: TxIoKey,
        value: u64,
        is_coinbase: bool,
        is_multisig: bool,
    ) -> Result<Option<TxIoPair>> {
        match self.txios.get_mut(&txout_key) {
            Some(txio) => {
                let previous = *txio;
                txio.clear_txin();
                Ok(Some(previous))
            }
            None => {
                let mut txio = TxIoPair::new(txout_key, value);
                txio.is_coinbase = is_coinbase;
                txio.is_multisig = is_multisig;
                self.insert_txio(txio)
            }
        }
    }

    pub fn sub_history_balance(&self, with_multisig: bool) -> u64 {
        self.txios
            .values()
            .map(|txio| txio.unspent_value(with_multisig))
            .sum()
    }

    pub fn sub_history_received(&self, with_multisig: bool) -> u64 {
        self.txios
            .values()
            .filter(|txio| with_multisig || !txio.is_multisig)
            .map(|txio| txio.value)
            .sum()
    }

    /// Keys of removed entries awaiting a batched delete.
    pub fn keys_to_delete(&self) -> &[TxIoKey] {
        &self.keys_to_delete
    }

    pub fn take_keys_to_delete(&mut self) -> Vec<TxIoKey> {
        std::mem::take(&mut self.keys_to_delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn addr() -> Vec<u8> {
        let mut addr = vec![0x00];
        addr.extend_from_slice(&[0x22; 20]);
        addr
    }

    fn sample() -> StoredSubHistory {
        let mut sub = StoredSubHistory::new(addr(), Hgtx::new(300, 0));
        sub.insert_txio(TxIoPair::new(TxIoKey::new(300, 0, 1, 0), 1_000)).unwrap();
        let mut spent = TxIoPair::new(TxIoKey::new(300, 0, 4, 1), 2_000);
        spent.set_txin(TxIoKey::new(301, 0, 2, 0));
        spent.is_coinbase = true;
        sub.insert_txio(spent).unwrap();
        let mut multisig = TxIoPair::new(TxIoKey::new(300, 0, 5, 0), 4_000);
        multisig.is_multisig = true;
        sub.insert_txio(multisig).unwrap();
        sub
    }

    #[test]
    fn test_sub_history_round_trip() {
        let sub = sample();
        assert_eq!(sub.txio_count, 3);

        let key = sub.db_key(true).unwrap();
        assert_eq!(key[0], DbPrefix::Script.to_u8());
        assert_eq!(&key[key.len() - 4..], Hgtx::new(300, 0).as_bytes());

        let value = sub.serialize_db_value();
        assert_eq!(StoredSubHistory::read_summary(&value).unwrap(), 3);

        let mut decoded = StoredSubHistory::default();
        decoded.deserialize_db_key(&key, true).unwrap();
        decoded.deserialize_db_value(&value).unwrap();
        assert_eq!(decoded, sub);
        assert_eq!(decoded.height(), Some(300));
        assert_eq!(decoded.dup_id(), Some(0));
    }

    #[test]
    fn test_balances() {
        let sub = sample();
        assert_eq!(sub.sub_history_balance(false), 1_000);
        assert_eq!(sub.sub_history_balance(true), 5_000);
        assert_eq!(sub.sub_history_received(false), 3_000);
        assert_eq!(sub.sub_history_received(true), 7_000);
        assert!(sub.find_txio(&TxIoKey::new(300, 0, 5, 0), false).is_none());
        assert!(sub.find_txio(&TxIoKey::new(300, 0, 5, 0), true).is_some());
    }

    #[test]
    fn test_erase_stages_deletion_keys() {
        let mut sub = sample();
        let erased = sub.erase_txio(&TxIoKey::new(300, 0, 1, 0)).unwrap();
        assert_eq!(erased.value, 1_000);
        sub.erase_txio(&TxIoKey::new(300, 0, 4, 1)).unwrap();
        assert!(sub.erase_txio(&TxIoKey::new(300, 0, 9, 9)).is_none());

        assert_eq!(sub.txio_count, 1);
        assert_eq!(
            sub.keys_to_delete(),
            &[
                TxIoKey::new(300, 0, 1, 0),
                TxIoKey::from_bytes([0, 1, 45, 0, 0x80, 2, 0, 0]),
            ]
        );
        assert_eq!(sub.take_keys_to_delete().len(), 2);
        assert!(sub.keys_to_delete().is_empty());
    }

    #[test]
    fn test_mark_spent_and_unspent() {
        let mut sub = sample();
        let key = TxIoKey::new(300, 0, 1, 0);
        let previous = sub.mark_txout_spent(&key, TxIoKey::new(305, 0, 1, 0)).unwrap();
        assert!(previous.is_utxo);
        assert_eq!(sub.sub_history_balance(false), 0);

        sub.mark_txout_unspent(key, 1_000, false, false).unwrap().unwrap();
        assert_eq!(sub.sub_history_balance(false), 1_000);

        assert!(
            sub.mark_txout_unspent(TxIoKey::new(300, 0, 7, 0), 50, false, false)
                .unwrap()
                .is_none()
        );
        assert_eq!(sub.txio_count, 4);
        assert!(sub.mark_txout_spent(&TxIoKey::new(300, 0, 8, 0), key).is_none());
    }

    #[test]
    fn test_bad_key_and_truncated_value() {
        let mut sub = StoredSubHistory::default();
        assert_eq!(
            sub.deserialize_db_key(&[DbPrefix::Script.to_u8(), 0, 0, 1], true)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidKey
        );
        assert!(sub.deserialize_db_key(&[DbPrefix::TxData.to_u8(), 0, 1, 2, 3, 4], true).is_err());

        let value = sample().serialize_db_value();
        let mut sub = sample();
        let err = sub.deserialize_db_value(&value[..value.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Truncated);
        assert!(sub.is_empty());
        assert_eq!(sub.txio_count, 0);
    }

    #[test]
    fn test_entries_must_share_bucket_hgtx() {
        let mut sub = sample();
        let stray = TxIoKey::new(301, 0, 1, 0);
        assert!(matches!(
            sub.insert_txio(TxIoPair::new(stray, 10)),
            Err(Error::TxIoOutsideBucket { hgtx, .. }) if hgtx == Hgtx::new(300, 0)
        ));
        assert!(matches!(
            sub.mark_txout_unspent(TxIoKey::new(300, 1, 0, 0), 10, false, false),
            Err(Error::TxIoOutsideBucket { .. })
        ));
        assert_eq!(sub.txio_count, 3);
        assert!(sub.find_txio(&stray, true).is_none());

        let mut fresh = StoredSubHistory::default();
        fresh.insert_txio(TxIoPair::new(stray, 10)).unwrap();
        assert_eq!(fresh.hgtx, Some(Hgtx::new(301, 0)));
    }

    #[test]
    fn test_decode_rejects_inconsistent_entries() {
        let value = sample().serialize_db_value();

        let mut other_bucket = StoredSubHistory::new(addr(), Hgtx::new(299, 0));
        let err = other_bucket.deserialize_db_value(&value).unwrap_err();
        assert!(matches!(err, Error::TxIoOutsideBucket { .. }));
        assert!(err.is_corruption());
        assert!(other_bucket.is_empty());

        // One unspent entry written twice under a count of two.
        let mut single = StoredSubHistory::new(addr(), Hgtx::new(300, 0));
        single.insert_txio(TxIoPair::new(TxIoKey::new(300, 0, 1, 0), 1_000)).unwrap();
        let entry = single.serialize_db_value()[1..].to_vec();
        let duplicated = [vec![2u8], entry.clone(), entry].concat();
        let err = single.deserialize_db_value(&duplicated).unwrap_err();
        assert!(matches!(err, Error::DuplicateTxIo(key) if key == TxIoKey::new(300, 0, 1, 0)));
        assert_eq!(single.txio_count, 0);
    }
}

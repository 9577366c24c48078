use crate::{Error, Result, StoredSubHistory, TxIoPair};
use blkdb_primitives::{
    BitPacker, BitUnpacker, ByteReader, CodecError, DB_VERSION, DbPrefix, Hgtx, PruneType,
    ScriptPrefix, ScriptUtxoType, TxIoKey, check_prefix, write_var_int,
};
use std::collections::BTreeMap;

/// Ledger of one address, bucketed by the hgtx of each output.
///
/// The summary record at `Script ‖ unique key` carries cached totals so the
/// balance can be read without loading any bucket:
///
/// ```text
/// flags(2) ‖ sub-key prefix u8 ‖ sub-key length u8 ‖ scanned height u32 LE ‖
/// var_int event count ‖ [unspent u64 LE when count > 0]
/// ```
///
/// Each entry contributes its value to the unspent total iff it has no
/// spending input and is not multisig, and one event per side present
/// (output, input) to the event count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredScriptHistory {
    pub unique_key: Vec<u8>,
    pub version: u8,
    pub prune_type: PruneType,
    pub utxo_type: ScriptUtxoType,
    pub sub_key_prefix: u8,
    pub sub_key_length: u8,
    pub already_scanned_up_to_block: u32,
    pub total_txio_count: u64,
    pub total_unspent: u64,
    pub sub_histories: BTreeMap<Hgtx, StoredSubHistory>,
}

impl Default for StoredScriptHistory {
    fn default() -> Self {
        Self {
            unique_key: Vec::new(),
            version: DB_VERSION,
            prune_type: PruneType::default(),
            utxo_type: ScriptUtxoType::Vector,
            sub_key_prefix: DbPrefix::Script.to_u8(),
            sub_key_length: 0,
            already_scanned_up_to_block: 0,
            total_txio_count: 0,
            total_unspent: 0,
            sub_histories: BTreeMap::new(),
        }
    }
}

impl StoredScriptHistory {
    pub fn new(unique_key: Vec<u8>) -> Self {
        Self {
            sub_key_length: unique_key.len() as u8,
            unique_key,
            ..Default::default()
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.unique_key.is_empty()
    }

    pub fn script_type(&self) -> Result<ScriptPrefix> {
        let byte = *self
            .unique_key
            .first()
            .ok_or(Error::Incomplete("address key"))?;
        Ok(ScriptPrefix::try_from(byte)?)
    }

    /// Sub-key prefix followed by the address payload, without its type byte.
    pub fn sub_key(&self) -> Vec<u8> {
        let end = usize::from(self.sub_key_length).min(self.unique_key.len());
        let mut key = Vec::with_capacity(end.max(1));
        key.push(self.sub_key_prefix);
        if end > 1 {
            key.extend_from_slice(&self.unique_key[1..end]);
        }
        key
    }

    pub fn db_key(&self, with_prefix: bool) -> Result<Vec<u8>> {
        if self.unique_key.is_empty() {
            return Err(Error::Incomplete("address key"));
        }
        let mut key = Vec::with_capacity(1 + self.unique_key.len());
        if with_prefix {
            key.push(DbPrefix::Script.to_u8());
        }
        key.extend_from_slice(&self.unique_key);
        Ok(key)
    }

    pub fn deserialize_db_key(&mut self, key: &[u8], with_prefix: bool) -> Result<()> {
        let mut reader = ByteReader::new(key);
        if with_prefix {
            check_prefix(&mut reader, DbPrefix::Script, false)?;
        }
        let unique_key = reader.take_rest();
        if unique_key.is_empty() {
            return Err(CodecError::InvalidKeyLength(key.len()).into());
        }
        self.unique_key = unique_key.to_vec();
        Ok(())
    }

    pub fn serialize_db_value(&self) -> Vec<u8> {
        let mut flags = BitPacker::<2>::new();
        flags
            .put_bits(u32::from(self.version), 4)
            .put_bits(u32::from(self.prune_type.to_u8()), 2)
            .put_bits(u32::from(self.utxo_type.to_u8()), 2);

        let mut out = Vec::with_capacity(2 + 2 + 4 + 9 + 8);
        flags.write_to(&mut out);
        out.push(self.sub_key_prefix);
        out.push(self.sub_key_length);
        out.extend_from_slice(&self.already_scanned_up_to_block.to_le_bytes());
        write_var_int(&mut out, self.total_txio_count);
        if self.total_txio_count > 0 {
            out.extend_from_slice(&self.total_unspent.to_le_bytes());
        }
        out
    }

    /// Decodes the summary fields; buckets are left untouched.
    pub fn deserialize_db_value(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.read_db_value(&mut reader).inspect_err(|_| {
            let unique_key = std::mem::take(&mut self.unique_key);
            *self = Self {
                unique_key,
                ..Default::default()
            };
        })
    }

    fn read_db_value(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        let mut flags = BitUnpacker::<2>::read(reader)?;
        self.version = flags.get_bits(4) as u8;
        self.prune_type = PruneType::try_from(flags.get_bits(2))?;
        self.utxo_type = ScriptUtxoType::try_from(flags.get_bits(2))?;

        if self.version != DB_VERSION {
            tracing::warn!(
                "Script history version {} differs from {DB_VERSION}",
                self.version
            );
        }

        self.sub_key_prefix = reader.get_u8()?;
        self.sub_key_length = reader.get_u8()?;
        self.already_scanned_up_to_block = reader.get_u32_le()?;
        self.total_txio_count = reader.get_var_int()?;
        self.total_unspent = if self.total_txio_count > 0 {
            reader.get_u64_le()?
        } else {
            0
        };
        Ok(())
    }

    fn apply_delta(&mut self, removed: Option<&TxIoPair>, added: Option<&TxIoPair>) {
        if let Some(txio) = removed {
            self.total_unspent = self.total_unspent.saturating_sub(txio.unspent_value(false));
            self.total_txio_count = self.total_txio_count.saturating_sub(txio.event_count());
        }
        if let Some(txio) = added {
            self.total_unspent += txio.unspent_value(false);
            self.total_txio_count += txio.event_count();
        }
    }

    /// Inserts an entry into the bucket of its output's hgtx, creating the
    /// bucket if needed, and adjusts the cached totals.
    ///
    /// Returns `true` if the output key was not tracked before.
    pub fn insert_txio(&mut self, txio: TxIoPair) -> bool {
        let hgtx = txio.txout_key.hgtx();
        let unique_key = &self.unique_key;
        let previous = self
            .sub_histories
            .entry(hgtx)
            .or_insert_with(|| StoredSubHistory::new(unique_key.clone(), hgtx))
            .insert_entry(txio);
        self.apply_delta(previous.as_ref(), Some(&txio));
        previous.is_none()
    }

    /// Removes an entry and adjusts the cached totals.
    pub fn erase_txio(&mut self, txout_key: &TxIoKey) -> Option<TxIoPair> {
        let Some(sub) = self.sub_histories.get_mut(&txout_key.hgtx()) else {
            tracing::warn!(
                "Erasing txio {txout_key:?} from missing bucket {}",
                txout_key.hgtx()
            );
            return None;
        };
        let removed = sub.erase_txio(txout_key)?;
        self.apply_delta(Some(&removed), None);
        Some(removed)
    }

    /// Marks a tracked output as spent; `false` if it is not tracked.
    pub fn mark_txout_spent(&mut self, txout_key: &TxIoKey, txin_key: TxIoKey) -> bool {
        let Some(mut txio) = self.find_txio(txout_key, true).copied() else {
            return false;
        };
        txio.set_txin(txin_key);
        self.insert_txio(txio);
        true
    }

    /// Marks an output unspent, tracking it if needed.
    ///
    /// Returns `true` if the output was not tracked before.
    pub fn mark_txout_unspent(
        &mut self,
        txout_key: TxIoKey,
        value: u64,
        is_coinbase: bool,
        is_multisig: bool,
    ) -> bool {
        let txio = match self.find_txio(&txout_key, true).copied() {
            Some(mut txio) => {
                txio.clear_txin();
                txio
            }
            None => {
                let mut txio = TxIoPair::new(txout_key, value);
                txio.is_coinbase = is_coinbase;
                txio.is_multisig = is_multisig;
                txio
            }
        };
        self.insert_txio(txio)
    }

    pub fn find_txio(&self, txout_key: &TxIoKey, include_multisig: bool) -> Option<&TxIoPair> {
        self.sub_histories
            .get(&txout_key.hgtx())?
            .find_txio(txout_key, include_multisig)
    }

    /// Merges a loaded bucket: set union, incoming entries win on collision.
    ///
    /// The bucket must be keyed under this address and every entry must lie
    /// in its hgtx; otherwise nothing is merged. Cached totals are not
    /// touched; they already account for persisted data.
    pub fn merge_sub_history(&mut self, sub: StoredSubHistory) -> Result<()> {
        let hgtx = sub.hgtx.ok_or(Error::Incomplete("sub-history hgtx"))?;
        if sub.unique_key != self.unique_key {
            return Err(Error::ForeignSubHistory);
        }
        if let Some(txio) = sub.txios.values().find(|txio| txio.txout_key.hgtx() != hgtx) {
            return Err(Error::TxIoOutsideBucket {
                txout_key: txio.txout_key,
                hgtx,
            });
        }

        match self.sub_histories.get_mut(&hgtx) {
            None => {
                self.sub_histories.insert(hgtx, sub);
            }
            Some(existing) => {
                for txio in sub.txios.into_values() {
                    existing.insert_entry(txio);
                }
            }
        }
        Ok(())
    }

    pub fn sub_history(&self, hgtx: &Hgtx) -> Option<&StoredSubHistory> {
        self.sub_histories.get(hgtx)
    }

    fn txios(&self) -> impl Iterator<Item = &TxIoPair> {
        self.sub_histories.values().flat_map(|sub| sub.txios.values())
    }

    /// Whether the loaded buckets account for every event of the summary.
    pub fn have_full_history_loaded(&self) -> bool {
        self.txios().map(TxIoPair::event_count).sum::<u64>() == self.total_txio_count
    }

    /// Unspent balance.
    ///
    /// Without multisig this is the cached total. Including multisig requires
    /// the full history; `None` otherwise.
    pub fn script_balance(&self, with_multisig: bool) -> Option<u64> {
        if !with_multisig {
            return Some(self.total_unspent);
        }
        self.have_full_history_loaded()
            .then(|| self.txios().map(|txio| txio.unspent_value(true)).sum())
    }

    /// Total value ever received; `None` unless the full history is loaded.
    pub fn script_received(&self, with_multisig: bool) -> Option<u64> {
        self.have_full_history_loaded().then(|| {
            self.sub_histories
                .values()
                .map(|sub| sub.sub_history_received(with_multisig))
                .sum()
        })
    }

    /// Every entry keyed by output key; `None` unless the full history is loaded.
    pub fn full_txio_map(&self, with_multisig: bool) -> Option<BTreeMap<TxIoKey, TxIoPair>> {
        self.have_full_history_loaded().then(|| {
            self.txios()
                .filter(|txio| with_multisig || !txio.is_multisig)
                .map(|txio| (txio.txout_key, *txio))
                .collect()
        })
    }

    /// Recomputes the totals from the loaded buckets and compares them with
    /// the cached ones.
    pub fn check_totals(&self) -> Result<()> {
        let computed_unspent = self.txios().map(|txio| txio.unspent_value(false)).sum();
        let computed_count = self.txios().map(TxIoPair::event_count).sum();
        if computed_unspent != self.total_unspent || computed_count != self.total_txio_count {
            return Err(Error::TotalsMismatch {
                cached_unspent: self.total_unspent,
                cached_count: self.total_txio_count,
                computed_unspent,
                computed_count,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Vec<u8> {
        let mut addr = vec![ScriptPrefix::Hash160.to_u8()];
        addr.extend_from_slice(&[0x33; 20]);
        addr
    }

    fn multisig_txio(key: TxIoKey, value: u64) -> TxIoPair {
        let mut txio = TxIoPair::new(key, value);
        txio.is_multisig = true;
        txio
    }

    #[test]
    fn test_insert_and_erase_keep_totals_consistent() {
        let mut ssh = StoredScriptHistory::new(addr());
        let keys: Vec<_> = (0..20u16)
            .map(|i| TxIoKey::new(100 + u32::from(i % 4), 0, i, 0))
            .collect();

        for (i, key) in keys.iter().enumerate() {
            let mut txio = TxIoPair::new(*key, 1_000 * (i as u64 + 1));
            if i % 3 == 0 {
                txio.set_txin(TxIoKey::new(200, 0, i as u16, 0));
            }
            if i % 5 == 0 {
                txio.is_multisig = true;
            }
            assert!(ssh.insert_txio(txio));
        }
        ssh.check_totals().unwrap();
        assert_eq!(ssh.sub_histories.len(), 4);

        // Re-inserting an identical entry changes nothing.
        let existing = *ssh.find_txio(&keys[1], true).unwrap();
        assert!(!ssh.insert_txio(existing));
        ssh.check_totals().unwrap();

        for key in keys.iter().step_by(2) {
            ssh.erase_txio(key).unwrap();
        }
        ssh.check_totals().unwrap();
        assert!(ssh.erase_txio(&keys[0]).is_none());
        assert!(ssh.have_full_history_loaded());
    }

    #[test]
    fn test_multisig_excluded_from_default_balance() {
        let mut ssh = StoredScriptHistory::new(addr());
        ssh.insert_txio(TxIoPair::new(TxIoKey::new(10, 0, 0, 0), 5_000));
        let before = ssh.script_balance(false).unwrap();
        let before_all = ssh.script_balance(true).unwrap();

        ssh.insert_txio(multisig_txio(TxIoKey::new(11, 0, 0, 1), 7_000));
        assert_eq!(ssh.script_balance(false), Some(before));
        assert_eq!(ssh.script_balance(true), Some(before_all + 7_000));
        assert_eq!(ssh.script_received(false), Some(5_000));
        assert_eq!(ssh.script_received(true), Some(12_000));
        assert_eq!(ssh.full_txio_map(false).unwrap().len(), 1);
        assert_eq!(ssh.full_txio_map(true).unwrap().len(), 2);
        assert!(ssh.find_txio(&TxIoKey::new(11, 0, 0, 1), false).is_none());
    }

    #[test]
    fn test_status_changes_adjust_totals() {
        let mut ssh = StoredScriptHistory::new(addr());
        let key = TxIoKey::new(10, 0, 1, 0);
        assert!(ssh.mark_txout_unspent(key, 900, true, false));
        assert_eq!((ssh.total_unspent, ssh.total_txio_count), (900, 1));

        assert!(ssh.mark_txout_spent(&key, TxIoKey::new(12, 0, 3, 0)));
        assert_eq!((ssh.total_unspent, ssh.total_txio_count), (0, 2));

        assert!(!ssh.mark_txout_unspent(key, 900, true, false));
        assert_eq!((ssh.total_unspent, ssh.total_txio_count), (900, 1));
        assert!(!ssh.mark_txout_spent(&TxIoKey::new(99, 0, 0, 0), key));
        ssh.check_totals().unwrap();
    }

    #[test]
    fn test_partial_history_hides_derived_views() {
        let mut ssh = StoredScriptHistory::new(addr());
        ssh.insert_txio(TxIoPair::new(TxIoKey::new(10, 0, 0, 0), 5_000));
        ssh.insert_txio(TxIoPair::new(TxIoKey::new(20, 0, 0, 0), 6_000));

        let mut summary = StoredScriptHistory::default();
        summary.deserialize_db_key(&ssh.db_key(true).unwrap(), true).unwrap();
        summary.deserialize_db_value(&ssh.serialize_db_value()).unwrap();
        assert_eq!(summary.script_balance(false), Some(11_000));
        assert_eq!(summary.script_balance(true), None);
        assert_eq!(summary.script_received(true), None);
        assert!(summary.full_txio_map(true).is_none());

        let bucket = ssh.sub_history(&Hgtx::new(10, 0)).unwrap().clone();
        summary.merge_sub_history(bucket).unwrap();
        assert!(!summary.have_full_history_loaded());
        let bucket = ssh.sub_history(&Hgtx::new(20, 0)).unwrap().clone();
        summary.merge_sub_history(bucket).unwrap();
        assert!(summary.have_full_history_loaded());
        assert_eq!(summary.script_balance(true), Some(11_000));
        assert_eq!(summary, ssh);
    }

    #[test]
    fn test_merge_prefers_incoming_entries() {
        let mut ssh = StoredScriptHistory::new(addr());
        let key = TxIoKey::new(10, 0, 0, 0);
        ssh.insert_txio(TxIoPair::new(key, 5_000));
        ssh.insert_txio(TxIoPair::new(TxIoKey::new(10, 0, 1, 0), 1_000));

        let mut incoming = StoredSubHistory::new(addr(), Hgtx::new(10, 0));
        incoming
            .insert_txio(TxIoPair::new(key, 5_000).with_txin(TxIoKey::new(11, 0, 0, 0)))
            .unwrap();
        incoming
            .insert_txio(TxIoPair::new(TxIoKey::new(10, 0, 2, 0), 3_000))
            .unwrap();
        ssh.merge_sub_history(incoming).unwrap();

        let bucket = ssh.sub_history(&Hgtx::new(10, 0)).unwrap();
        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket.txio_count, 3);
        assert!(ssh.find_txio(&key, false).unwrap().has_txin());

        assert!(matches!(
            ssh.merge_sub_history(StoredSubHistory::default()),
            Err(Error::Incomplete(_))
        ));
    }

    #[test]
    fn test_merge_rejects_foreign_buckets() {
        let mut ssh = StoredScriptHistory::new(addr());
        ssh.insert_txio(TxIoPair::new(TxIoKey::new(10, 0, 0, 0), 5_000));
        let before = ssh.clone();

        let mut other = vec![ScriptPrefix::Hash160.to_u8()];
        other.extend_from_slice(&[0x05; 20]);
        let foreign = StoredSubHistory::new(other, Hgtx::new(10, 0));
        let err = ssh.merge_sub_history(foreign).unwrap_err();
        assert!(matches!(err, Error::ForeignSubHistory));

        // A stored bucket at (10, 0) claiming an output mined at height 99.
        let stray = TxIoKey::new(99, 0, 1, 0);
        let mut mismatched = StoredSubHistory::new(addr(), Hgtx::new(10, 0));
        mismatched.txios.insert(stray, TxIoPair::new(stray, 700));
        assert!(matches!(
            ssh.merge_sub_history(mismatched),
            Err(Error::TxIoOutsideBucket { txout_key, .. }) if txout_key == stray
        ));

        assert_eq!(ssh, before);
        assert!(ssh.find_txio(&stray, true).is_none());
    }

    #[test]
    fn test_summary_value_layout() {
        let mut ssh = StoredScriptHistory::new(addr());
        ssh.already_scanned_up_to_block = 1234;
        let value = ssh.serialize_db_value();
        // No events yet, so no unspent total.
        assert_eq!(value.len(), 2 + 1 + 1 + 4 + 1);
        assert_eq!(value[2], DbPrefix::Script.to_u8());
        assert_eq!(value[3], 21);

        ssh.insert_txio(TxIoPair::new(TxIoKey::new(10, 0, 0, 0), 42));
        let value = ssh.serialize_db_value();
        assert_eq!(value.len(), 2 + 1 + 1 + 4 + 1 + 8);

        let mut decoded = StoredScriptHistory::new(addr());
        decoded.deserialize_db_value(&value).unwrap();
        assert_eq!(decoded.total_unspent, 42);
        assert_eq!(decoded.total_txio_count, 1);
        assert_eq!(decoded.already_scanned_up_to_block, 1234);

        let err = decoded.deserialize_db_value(&value[..9]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Truncated);
        assert_eq!(decoded.total_txio_count, 0);
        assert_eq!(decoded.unique_key, addr());
    }

    #[test]
    fn test_sub_key_and_script_type() {
        let ssh = StoredScriptHistory::new(addr());
        assert_eq!(ssh.script_type().unwrap(), ScriptPrefix::Hash160);
        let sub_key = ssh.sub_key();
        assert_eq!(sub_key.len(), 21);
        assert_eq!(sub_key[0], DbPrefix::Script.to_u8());
        assert_eq!(&sub_key[1..], &[0x33; 20]);
        assert!(StoredScriptHistory::default().script_type().is_err());
    }
}

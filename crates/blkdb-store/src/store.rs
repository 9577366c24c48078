//! Record-level access to a [`KeyValueStore`].

use crate::kv::{KeyValueStore, WriteBatch};
use crate::{Error, Result, StoreConfig};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use blkdb_primitives::{
    BlkDataKey, DBINFO_KEY, DbPrefix, Hgtx, TxIoKey, TxKey, blk_data_key, read_blk_data_key,
    with_prefix,
};
use blkdb_records::{
    DbSelect, StoredDbInfo, StoredHeadHgtList, StoredHeader, StoredScriptHistory,
    StoredSubHistory, StoredTx, StoredTxHints, StoredTxOut, StoredUndoData,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Blocks, address histories and undo data on top of a key-value backend.
///
/// The database info record is cached in memory; its write lock also
/// serializes writers, since block writes read-modify-write the hint and
/// height-list records.
pub struct BlockDataStore<S> {
    store: S,
    config: StoreConfig,
    db_info: RwLock<StoredDbInfo>,
}

impl<S: KeyValueStore> BlockDataStore<S> {
    /// Opens the store, initializing the database info record on first use.
    ///
    /// An existing database of another network is rejected.
    pub fn open(store: S, config: StoreConfig) -> Result<Self> {
        let magic = config.magic();

        let db_info = match store.get(&DBINFO_KEY)? {
            Some(bytes) => {
                let mut db_info = StoredDbInfo::default();
                db_info.deserialize_db_value(&bytes)?;
                let found = db_info
                    .magic
                    .ok_or(blkdb_records::Error::Incomplete("db info magic"))?;
                if found != magic {
                    return Err(Error::MagicMismatch {
                        expected: magic,
                        found,
                    });
                }
                if db_info.db_type != config.db_type || db_info.prune_type != config.prune_type {
                    tracing::warn!(
                        "Database was created as {:?}/{:?}, configured as {:?}/{:?}; using the stored types",
                        db_info.db_type,
                        db_info.prune_type,
                        config.db_type,
                        config.prune_type
                    );
                }
                db_info
            }
            None => {
                let db_info = StoredDbInfo::new(magic, config.db_type, config.prune_type);
                store.put(&DBINFO_KEY, &db_info.serialize_db_value()?)?;
                db_info
            }
        };

        tracing::info!(
            "Opened block data store for {} at height {}, top block {}",
            config.network,
            db_info.top_block_height,
            db_info.top_block_hash
        );

        Ok(Self {
            store,
            config,
            db_info: RwLock::new(db_info),
        })
    }

    /// Underlying key-value backend.
    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn db_info(&self) -> StoredDbInfo {
        self.db_info.read().clone()
    }

    /// Persists the cached database info record.
    pub fn commit_db_info(&self) -> Result<()> {
        let db_info = self.db_info.read();
        self.store.put(&DBINFO_KEY, &db_info.serialize_db_value()?)
    }

    /// Records that the scanner processed everything up to `hash`.
    pub fn set_top_scanned(&self, applied_to_height: u32, hash: BlockHash) -> Result<()> {
        let mut db_info = self.db_info.write();
        db_info.applied_to_height = applied_to_height;
        db_info.top_scanned_hash = Some(hash);
        self.store.put(&DBINFO_KEY, &db_info.serialize_db_value()?)
    }

    /// Parses a serialized block and writes it at `(height, dup)`.
    pub fn put_raw_block(
        &self,
        height: u32,
        dup: u8,
        raw_block: &[u8],
        is_main_branch: bool,
    ) -> Result<StoredHeader> {
        let mut header = StoredHeader::default();
        header.set_key_data(height, dup);
        header.is_main_branch = is_main_branch;
        header.deserialize_full_block(raw_block, true, false)?;
        self.put_block(&header)?;
        Ok(header)
    }

    /// Writes a block in one batch: the header under both indices, every
    /// loaded tx and txout, the tx hints and the height list.
    ///
    /// A main-branch block at or above the current top becomes the new top.
    pub fn put_block(&self, header: &StoredHeader) -> Result<()> {
        let hgtx = header.hgtx()?;
        let hash = header
            .hash()
            .ok_or(blkdb_records::Error::Incomplete("block header"))?;
        let (db_type, prune_type) = (self.config.db_type, self.config.prune_type);

        let mut db_info = self.db_info.write();
        let mut batch = WriteBatch::default();

        batch.put(
            header.db_key(true)?,
            header.serialize_db_value(DbSelect::BlkData, db_type, prune_type)?,
        );
        batch.put(
            header.headers_db_key()?,
            header.serialize_db_value(DbSelect::Headers, db_type, prune_type)?,
        );

        let mut hints = BTreeMap::<Vec<u8>, StoredTxHints>::new();
        let mut num_txouts = 0usize;
        for tx in header.txs.values() {
            batch.put(tx.db_key(true)?, tx.serialize_db_value(db_type, prune_type)?);
            for txout in tx.txouts.values() {
                batch.put(
                    txout.db_key(true)?,
                    txout.serialize_db_value(db_type, prune_type, false)?,
                );
                num_txouts += 1;
            }

            let txid = tx.hash.ok_or(blkdb_records::Error::Incomplete("tx hash"))?;
            let mut hint = StoredTxHints::for_txid(&txid);
            let key = hint.db_key();
            if !hints.contains_key(&key) {
                if let Some(bytes) = self.store.get(&key)? {
                    hint.deserialize_db_value(&bytes)?;
                }
                hints.insert(key.clone(), hint);
            }
            if let Some(hint) = hints.get_mut(&key) {
                hint.add_key(tx.tx_key()?, header.is_main_branch);
            }
        }
        for (key, hint) in &hints {
            batch.put(key.clone(), hint.serialize_db_value());
        }

        let mut height_list = self
            .get_head_height_list(hgtx.height())?
            .unwrap_or_else(|| StoredHeadHgtList::new(hgtx.height()));
        height_list.add_dup_and_hash(hgtx.dup_id(), hash, header.is_main_branch);
        batch.put(height_list.db_key()?, height_list.serialize_db_value()?);

        let mut new_info = db_info.clone();
        if header.is_main_branch
            && (new_info.top_block_height == u32::MAX || hgtx.height() >= new_info.top_block_height)
        {
            new_info.top_block_height = hgtx.height();
            new_info.top_block_hash = hash;
        }
        batch.put(DBINFO_KEY.to_vec(), new_info.serialize_db_value()?);

        let ops = batch.len();
        self.store.write_batch(batch)?;
        *db_info = new_info;

        tracing::debug!(
            "Stored block {hash} at {hgtx}: {} txs, {num_txouts} txouts, {ops} writes",
            header.txs.len()
        );

        Ok(())
    }

    /// Reads the header at `(height, dup)`, with every stored tx and txout
    /// attached if `with_txs`.
    pub fn get_header(&self, height: u32, dup: u8, with_txs: bool) -> Result<Option<StoredHeader>> {
        if !with_txs {
            let key = blk_data_key(height, dup, None, None);
            let Some(bytes) = self.store.get(&key)? else {
                return Ok(None);
            };
            let mut header = StoredHeader::default();
            header.deserialize_db_value(DbSelect::BlkData, &bytes, false)?;
            header.set_key_data(height, dup);
            return Ok(Some(header));
        }

        let prefix = with_prefix(DbPrefix::TxData, Hgtx::new(height, dup).as_bytes());
        let mut header: Option<StoredHeader> = None;
        for (key, value) in self.store.iter_prefix(&prefix)? {
            match read_blk_data_key(&key)? {
                BlkDataKey::Header(_) => {
                    let mut loaded = StoredHeader::default();
                    loaded.deserialize_db_value(DbSelect::BlkData, &value, false)?;
                    loaded.set_key_data(height, dup);
                    header = Some(loaded);
                }
                BlkDataKey::Tx(tx_key) => {
                    let header = header
                        .as_mut()
                        .ok_or(blkdb_records::Error::Incomplete("header of stored tx"))?;
                    let mut tx = StoredTx::default();
                    tx.deserialize_db_value(&value)?;
                    header.add_tx(tx_key.tx_index(), tx)?;
                }
                BlkDataKey::TxOut(io_key) => {
                    let tx = header
                        .as_mut()
                        .and_then(|header| header.tx_mut(io_key.tx_index()))
                        .ok_or(blkdb_records::Error::Incomplete("parent tx of stored txout"))?;
                    let mut txout = StoredTxOut::default();
                    txout.deserialize_db_value(&value)?;
                    tx.add_txout(io_key.io_index(), txout)?;
                }
            }
        }
        Ok(header)
    }

    /// Looks a header up by hash through the header index.
    pub fn get_header_by_hash(&self, hash: &BlockHash, with_txs: bool) -> Result<Option<StoredHeader>> {
        let key = with_prefix(DbPrefix::HeadHash, hash.as_byte_array());
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        let mut indexed = StoredHeader::default();
        indexed.deserialize_db_value(DbSelect::Headers, &bytes, false)?;
        let hgtx = indexed.hgtx()?;

        let mut header = self
            .get_header(hgtx.height(), hgtx.dup_id(), with_txs)?
            .ok_or(Error::NotFound {
                what: "block data of indexed header",
            })?;
        header.num_bytes = indexed.num_bytes;
        Ok(Some(header))
    }

    /// Reads a tx together with its stored outputs.
    pub fn get_tx(&self, tx_key: TxKey) -> Result<Option<StoredTx>> {
        let key = BlkDataKey::Tx(tx_key).to_bytes();
        let mut tx: Option<StoredTx> = None;
        for (entry_key, value) in self.store.iter_prefix(&key)? {
            match read_blk_data_key(&entry_key)? {
                BlkDataKey::Tx(_) => {
                    let mut loaded = StoredTx::default();
                    loaded.deserialize_db_value(&value)?;
                    loaded.set_key_data(tx_key.hgtx().height(), tx_key.hgtx().dup_id(), tx_key.tx_index());
                    tx = Some(loaded);
                }
                BlkDataKey::TxOut(io_key) => {
                    let tx = tx
                        .as_mut()
                        .ok_or(blkdb_records::Error::Incomplete("parent tx of stored txout"))?;
                    let mut txout = StoredTxOut::default();
                    txout.deserialize_db_value(&value)?;
                    tx.add_txout(io_key.io_index(), txout)?;
                }
                BlkDataKey::Header(_) => {}
            }
        }
        Ok(tx)
    }

    pub fn get_txout(&self, io_key: TxIoKey) -> Result<Option<StoredTxOut>> {
        let key = BlkDataKey::TxOut(io_key).to_bytes();
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        let mut txout = StoredTxOut::default();
        txout.deserialize_db_key(&key)?;
        txout.deserialize_db_value(&bytes)?;
        Ok(Some(txout))
    }

    /// Finds a tx by hash, trying the preferred hint first.
    pub fn find_tx(&self, txid: &Txid) -> Result<Option<StoredTx>> {
        let hints = self.get_tx_hints(txid)?;
        for tx_key in &hints.db_keys {
            if let Some(tx) = self.get_tx(*tx_key)? {
                if tx.hash.as_ref() == Some(txid) {
                    return Ok(Some(tx));
                }
            }
        }
        Ok(None)
    }

    /// Hints for the prefix of `txid`; empty if none are stored.
    pub fn get_tx_hints(&self, txid: &Txid) -> Result<StoredTxHints> {
        let mut hints = StoredTxHints::for_txid(txid);
        if let Some(bytes) = self.store.get(&hints.db_key())? {
            hints.deserialize_db_value(&bytes)?;
        }
        Ok(hints)
    }

    pub fn get_head_height_list(&self, height: u32) -> Result<Option<StoredHeadHgtList>> {
        let mut list = StoredHeadHgtList::new(height);
        let Some(bytes) = self.store.get(&list.db_key()?)? else {
            return Ok(None);
        };
        list.deserialize_db_value(&bytes)?;
        Ok(Some(list))
    }

    /// Writes the history summary and its buckets in one batch.
    ///
    /// Empty buckets are deleted and dropped from `history`. A bucket's
    /// entries live inside its single value, so rewriting the bucket already
    /// drops erased entries; the keys staged by `erase_txio` own no records
    /// and are only drained here.
    pub fn put_script_history(&self, history: &mut StoredScriptHistory) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(history.db_key(true)?, history.serialize_db_value());

        let mut staged = 0usize;
        let mut emptied = Vec::new();
        for (hgtx, sub) in history.sub_histories.iter_mut() {
            staged += sub.take_keys_to_delete().len();
            if sub.is_empty() {
                batch.delete(sub.db_key(true)?);
                emptied.push(*hgtx);
            } else {
                batch.put(sub.db_key(true)?, sub.serialize_db_value());
            }
        }

        self.store.write_batch(batch)?;
        for hgtx in &emptied {
            history.sub_histories.remove(hgtx);
        }

        tracing::debug!(
            "Stored script history with {} buckets, {} removed, {staged} staged deletions flushed",
            history.sub_histories.len(),
            emptied.len()
        );

        Ok(())
    }

    /// Reads the history of `unique_key`, with every bucket if `with_subs`.
    pub fn get_script_history(
        &self,
        unique_key: &[u8],
        with_subs: bool,
    ) -> Result<Option<StoredScriptHistory>> {
        let mut history = StoredScriptHistory::new(unique_key.to_vec());
        let key = history.db_key(true)?;

        if !with_subs {
            let Some(bytes) = self.store.get(&key)? else {
                return Ok(None);
            };
            history.deserialize_db_value(&bytes)?;
            return Ok(Some(history));
        }

        let mut found = false;
        for (entry_key, value) in self.store.iter_prefix(&key)? {
            if entry_key == key {
                history.deserialize_db_value(&value)?;
                found = true;
            } else if entry_key.len() == key.len() + 4 {
                let mut sub = StoredSubHistory::default();
                sub.deserialize_db_key(&entry_key, true)?;
                sub.deserialize_db_value(&value)?;
                history.merge_sub_history(sub)?;
            }
        }
        Ok(found.then_some(history))
    }

    pub fn put_undo(&self, undo: &StoredUndoData) -> Result<()> {
        let value = undo.serialize_db_value(self.config.db_type, self.config.prune_type)?;
        self.store.put(&undo.db_key(true)?, &value)
    }

    pub fn get_undo(&self, height: u32, dup: u8) -> Result<Option<StoredUndoData>> {
        let key = with_prefix(DbPrefix::UndoData, Hgtx::new(height, dup).as_bytes());
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        let mut undo = StoredUndoData::default();
        undo.deserialize_db_key(&key)?;
        undo.deserialize_db_value(&bytes)?;
        Ok(Some(undo))
    }

    pub fn delete_undo(&self, height: u32, dup: u8) -> Result<()> {
        let key = with_prefix(DbPrefix::UndoData, Hgtx::new(height, dup).as_bytes());
        self.store.delete(&key)
    }
}

use crate::{Error, Result, StoredTxOut};
use bitcoin::Txid;
use bitcoin::hashes::{Hash, sha256d};
use blkdb_primitives::{
    BitPacker, BitUnpacker, BlkDataKey, ByteReader, CodecError, DB_VERSION, DbType, HASH_SIZE,
    PruneType, TxKey, TxSerType, is_coinbase, read_blk_data_key_any, tx_layout, write_var_int,
};
use std::collections::BTreeMap;

/// Hash of raw transaction bytes.
pub fn compute_txid(raw: &[u8]) -> Txid {
    Txid::from_raw_hash(sha256d::Hash::hash(raw))
}

/// A transaction stored at `TxData ‖ hgtx ‖ tx index`.
///
/// The raw bytes are kept either complete or fragmented, i.e. with the output
/// section removed. Outputs of a fragmented transaction live in their own
/// records and are attached through [`StoredTx::add_txout`].
///
/// Value layout:
///
/// ```text
/// flags(2) ‖ hash(32) ‖ (raw tx | fragged tx | var_int output count) ‖ [unix time u32 LE]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTx {
    pub block_height: Option<u32>,
    pub duplicate_id: Option<u8>,
    pub tx_index: Option<u16>,
    pub hash: Option<Txid>,
    pub version: u32,
    pub lock_time: u32,
    pub num_txouts: u32,
    /// Size of the fragmented form.
    pub frag_bytes: u32,
    /// Receive time of unconfirmed transactions.
    pub unix_time: Option<u32>,
    pub txouts: BTreeMap<u16, StoredTxOut>,
    data: Vec<u8>,
    is_fragged: bool,
    num_bytes: Option<u32>,
}

impl StoredTx {
    /// Builds a stored tx from complete raw bytes.
    ///
    /// With `with_txouts` every output is parsed into [`StoredTx::txouts`].
    pub fn from_raw(raw: &[u8], fragged: bool, with_txouts: bool) -> Result<Self> {
        let mut reader = ByteReader::new(raw);
        let tx = Self::read_raw(&mut reader, fragged, with_txouts)?;
        if !reader.is_empty() {
            return Err(Error::DeclaredLengthExceeded {
                declared: reader.position(),
                available: raw.len(),
            });
        }
        Ok(tx)
    }

    /// Reads one complete transaction at the reader's position.
    pub fn read_raw(reader: &mut ByteReader<'_>, fragged: bool, with_txouts: bool) -> Result<Self> {
        let layout = tx_layout(reader.peek_rest(), false)?;
        let raw = reader.get_bytes(layout.len)?;
        let hash = compute_txid(raw);
        let version = read_u32_le(&raw[..4]);
        let lock_time = read_u32_le(&raw[raw.len() - 4..]);

        if layout.num_txouts > u32::from(u16::MAX) + 1 {
            return Err(CodecError::CountOutOfRange(u64::from(layout.num_txouts)).into());
        }

        let span = layout.last_txout_end() - layout.first_txout();
        let mut tx = Self {
            hash: Some(hash),
            version,
            lock_time,
            num_txouts: layout.num_txouts,
            frag_bytes: (raw.len() - span) as u32,
            num_bytes: Some(raw.len() as u32),
            is_fragged: fragged,
            ..Default::default()
        };

        if with_txouts {
            let coinbase = is_coinbase(raw, &layout);
            for index in 0..layout.num_txouts as usize {
                let range = layout
                    .txout_range(index)
                    .ok_or(Error::Incomplete("txout offsets"))?;
                let mut txout = StoredTxOut::from_raw(&raw[range])?;
                txout.is_coinbase = coinbase;
                tx.attach_txout(index as u16, &mut txout);
                tx.txouts.insert(index as u16, txout);
            }
        }

        tx.data = if fragged {
            let mut frag = Vec::with_capacity(tx.frag_bytes as usize);
            frag.extend_from_slice(&raw[..layout.first_txout()]);
            frag.extend_from_slice(&raw[layout.last_txout_end()..]);
            frag
        } else {
            raw.to_vec()
        };

        Ok(tx)
    }

    pub fn is_initialized(&self) -> bool {
        !self.data.is_empty() || self.num_txouts > 0
    }

    pub fn is_fragged(&self) -> bool {
        self.is_fragged
    }

    /// Stored transaction bytes, complete or fragmented.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// Full serialized size, if known or computable from the attached outputs.
    pub fn num_bytes(&self) -> Option<u32> {
        if let Some(num_bytes) = self.num_bytes {
            return Some(num_bytes);
        }
        self.have_all_txouts().then(|| {
            self.frag_bytes + self.txouts.values().map(|txout| txout.raw().len() as u32).sum::<u32>()
        })
    }

    pub fn set_key_data(&mut self, height: u32, dup: u8, tx_index: u16) {
        self.block_height = Some(height);
        self.duplicate_id = Some(dup);
        self.tx_index = Some(tx_index);
        for (index, txout) in self.txouts.iter_mut() {
            txout.set_key_data(height, dup, tx_index, *index);
        }
    }

    fn attach_txout(&self, index: u16, txout: &mut StoredTxOut) {
        txout.txout_index = Some(index);
        txout.tx_version = self.version;
        txout.parent_hash = self.hash;
        if let (Some(height), Some(dup), Some(tx_index)) =
            (self.block_height, self.duplicate_id, self.tx_index)
        {
            txout.set_key_data(height, dup, tx_index, index);
        }
    }

    /// Attaches output `index`, which must be below the declared output count.
    ///
    /// Attaching the last missing output of a fragment restores the full size.
    pub fn add_txout(&mut self, index: u16, mut txout: StoredTxOut) -> Result<()> {
        if u32::from(index) >= self.num_txouts {
            return Err(Error::IndexOutOfRange {
                index: u32::from(index),
                count: self.num_txouts,
            });
        }
        self.attach_txout(index, &mut txout);
        self.txouts.insert(index, txout);
        if self.num_bytes.is_none() {
            self.num_bytes = self.num_bytes();
        }
        Ok(())
    }

    pub fn txout(&self, index: u16) -> Option<&StoredTxOut> {
        self.txouts.get(&index)
    }

    /// Whether the complete transaction can be produced.
    pub fn have_all_txouts(&self) -> bool {
        if self.data.is_empty() {
            return false;
        }
        !self.is_fragged
            || (0..self.num_txouts).all(|index| self.txouts.contains_key(&(index as u16)))
    }

    /// Complete raw transaction.
    ///
    /// A fragmented transaction is rebuilt by splicing outputs `0..num_txouts`
    /// back in ascending order; any missing output is a corruption error.
    pub fn serialized_tx(&self) -> Result<Vec<u8>> {
        if self.data.len() < 4 {
            return Err(Error::Incomplete("transaction bytes"));
        }
        if !self.is_fragged {
            return Ok(self.data.clone());
        }

        let capacity = self.num_bytes.unwrap_or(self.frag_bytes) as usize;
        let mut out = Vec::with_capacity(capacity);
        let (body, lock_time) = self.data.split_at(self.data.len() - 4);
        out.extend_from_slice(body);
        for index in 0..self.num_txouts {
            let txout = self
                .txouts
                .get(&(index as u16))
                .ok_or_else(|| Error::MissingTxOut {
                    txid: self.hash.unwrap_or_else(Txid::all_zeros),
                    index,
                })?;
            out.extend_from_slice(txout.raw());
        }
        out.extend_from_slice(lock_time);
        Ok(out)
    }

    /// Transaction bytes with the output section removed.
    pub fn serialized_tx_fragged(&self) -> Result<Vec<u8>> {
        if self.data.is_empty() {
            return Err(Error::Incomplete("transaction bytes"));
        }
        if self.is_fragged {
            return Ok(self.data.clone());
        }
        let layout = tx_layout(&self.data, false)?;
        let mut out = Vec::with_capacity(self.frag_bytes as usize);
        out.extend_from_slice(&self.data[..layout.first_txout()]);
        out.extend_from_slice(&self.data[layout.last_txout_end()..]);
        Ok(out)
    }

    /// Decodes the complete transaction.
    pub fn to_transaction(&self) -> Result<bitcoin::Transaction> {
        Ok(bitcoin::consensus::deserialize(&self.serialized_tx()?)?)
    }

    pub fn tx_key(&self) -> Result<TxKey> {
        match (self.block_height, self.duplicate_id, self.tx_index) {
            (Some(height), Some(dup), Some(tx_index)) => Ok(TxKey::new(height, dup, tx_index)),
            _ => Err(Error::Incomplete("tx block position")),
        }
    }

    pub fn db_key(&self, with_prefix: bool) -> Result<Vec<u8>> {
        let key = BlkDataKey::Tx(self.tx_key()?);
        Ok(if with_prefix {
            key.to_bytes()
        } else {
            key.to_bytes_no_prefix()
        })
    }

    /// Key of child output `txout_index`.
    pub fn db_key_of_child(&self, txout_index: u16, with_prefix: bool) -> Result<Vec<u8>> {
        let tx_key = self.tx_key()?;
        let key = BlkDataKey::TxOut(blkdb_primitives::TxIoKey::from_parts(
            tx_key.hgtx(),
            tx_key.tx_index(),
            txout_index,
        ));
        Ok(if with_prefix {
            key.to_bytes()
        } else {
            key.to_bytes_no_prefix()
        })
    }

    /// Sets the position fields from a 6-byte key, or a 7-byte prefixed key.
    pub fn deserialize_db_key(&mut self, key: &[u8]) -> Result<()> {
        match read_blk_data_key_any(key)? {
            BlkDataKey::Tx(tx_key) => {
                self.set_key_data(tx_key.hgtx().height(), tx_key.hgtx().dup_id(), tx_key.tx_index());
                Ok(())
            }
            _ => Err(CodecError::InvalidKeyLength(key.len()).into()),
        }
    }

    /// Serializes in the mode a database of `db_type` stores transactions in.
    ///
    /// Every database type stores fragments; outputs have their own records.
    pub fn serialize_db_value(&self, _db_type: DbType, _prune_type: PruneType) -> Result<Vec<u8>> {
        self.serialize_db_value_as(TxSerType::Fragged)
    }

    pub fn serialize_db_value_as(&self, ser_type: TxSerType) -> Result<Vec<u8>> {
        let hash = self.hash.ok_or(Error::Incomplete("tx hash"))?;

        let body = match ser_type {
            TxSerType::Full => self.serialized_tx()?,
            TxSerType::Fragged => self.serialized_tx_fragged()?,
            TxSerType::CountOut => {
                let mut count = Vec::with_capacity(9);
                write_var_int(&mut count, u64::from(self.num_txouts));
                count
            }
        };

        let mut flags = BitPacker::<2>::new();
        flags
            .put_bits(u32::from(DB_VERSION), 4)
            .put_bits(self.version, 2)
            .put_bits(u32::from(ser_type.to_u8()), 4);

        let mut out = Vec::with_capacity(2 + HASH_SIZE + body.len() + 4);
        flags.write_to(&mut out);
        out.extend_from_slice(hash.as_byte_array());
        out.extend_from_slice(&body);
        if let Some(unix_time) = self.unix_time {
            out.extend_from_slice(&unix_time.to_le_bytes());
        }
        Ok(out)
    }

    /// Decodes `data` into the value fields; on failure they are cleared.
    ///
    /// Attached outputs are left untouched.
    pub fn deserialize_db_value(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.read_db_value(&mut reader).inspect_err(|_| self.clear_value())
    }

    fn read_db_value(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        let mut flags = BitUnpacker::<2>::read(reader)?;
        let db_version = flags.get_bits(4);
        let flag_version = flags.get_bits(2);
        let ser_type = TxSerType::try_from(flags.get_bits(4))?;

        if db_version != u32::from(DB_VERSION) {
            tracing::warn!("Tx value version {db_version} differs from {DB_VERSION}");
        }

        self.hash = Some(Txid::from_byte_array(reader.get_array()?));

        match ser_type {
            TxSerType::Full | TxSerType::Fragged => {
                let fragged = ser_type == TxSerType::Fragged;
                let layout = tx_layout(reader.peek_rest(), fragged)?;
                let raw = reader.get_bytes(layout.len)?;
                let span = layout.last_txout_end() - layout.first_txout();
                self.version = read_u32_le(&raw[..4]);
                self.lock_time = read_u32_le(&raw[raw.len() - 4..]);
                self.num_txouts = layout.num_txouts;
                self.frag_bytes = (raw.len() - span) as u32;
                self.num_bytes = (!fragged).then_some(raw.len() as u32);
                self.is_fragged = fragged;
                self.data = raw.to_vec();
            }
            TxSerType::CountOut => {
                let count = reader.get_var_int()?;
                self.num_txouts =
                    u32::try_from(count).map_err(|_| CodecError::CountOutOfRange(count))?;
                self.version = flag_version;
                self.lock_time = 0;
                self.frag_bytes = 0;
                self.num_bytes = None;
                self.is_fragged = true;
                self.data.clear();
            }
        }

        self.unix_time = if reader.remaining() == 4 {
            Some(reader.get_u32_le()?)
        } else {
            None
        };
        Ok(())
    }

    fn clear_value(&mut self) {
        self.hash = None;
        self.version = 0;
        self.lock_time = 0;
        self.num_txouts = 0;
        self.frag_bytes = 0;
        self.num_bytes = None;
        self.unix_time = None;
        self.is_fragged = false;
        self.data.clear();
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

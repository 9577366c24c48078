use blkdb_primitives::TxIoKey;

/// Marks a staged deletion key as the spend side of a pair.
const SPENT_KEY_FLAG: u8 = 0x80;

/// An output event of an address, plus the input that spent it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxIoPair {
    pub txout_key: TxIoKey,
    pub txin_key: Option<TxIoKey>,
    pub value: u64,
    pub is_coinbase: bool,
    pub is_multisig: bool,
    pub is_utxo: bool,
    /// The output pays back to the address that funded the transaction.
    pub is_txout_from_self: bool,
}

impl TxIoPair {
    /// Unspent output event.
    pub fn new(txout_key: TxIoKey, value: u64) -> Self {
        Self {
            txout_key,
            txin_key: None,
            value,
            is_coinbase: false,
            is_multisig: false,
            is_utxo: true,
            is_txout_from_self: false,
        }
    }

    pub fn with_txin(mut self, txin_key: TxIoKey) -> Self {
        self.set_txin(txin_key);
        self
    }

    pub fn has_txin(&self) -> bool {
        self.txin_key.is_some()
    }

    pub fn set_txin(&mut self, txin_key: TxIoKey) {
        self.txin_key = Some(txin_key);
        self.is_utxo = false;
    }

    pub fn clear_txin(&mut self) {
        self.txin_key = None;
        self.is_utxo = true;
    }

    /// Value counted towards the unspent balance.
    pub fn unspent_value(&self, with_multisig: bool) -> u64 {
        if self.has_txin() || (self.is_multisig && !with_multisig) {
            0
        } else {
            self.value
        }
    }

    /// Number of events this pair records: the output, plus the spend.
    pub fn event_count(&self) -> u64 {
        1 + u64::from(self.has_txin())
    }

    /// Key under which a removal of this pair is staged.
    ///
    /// Spent pairs are staged by input key with the high bit of the tx index
    /// set, unspent pairs by output key.
    pub fn deletion_key(&self) -> TxIoKey {
        match self.txin_key {
            Some(txin_key) => {
                let mut bytes = *txin_key.as_bytes();
                bytes[4] |= SPENT_KEY_FLAG;
                TxIoKey::from_bytes(bytes)
            }
            None => self.txout_key,
        }
    }
}

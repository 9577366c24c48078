//! Fixtures shared by the record tests, plus tests spanning several records.

use crate::{StoredHeader, StoredScriptHistory, StoredSubHistory, TxIoPair};
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, PubkeyHash, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};

pub(crate) fn raw_tx(tx: &Transaction) -> Vec<u8> {
    bitcoin::consensus::serialize(tx)
}

pub(crate) fn raw_block(block: &Block) -> Vec<u8> {
    bitcoin::consensus::serialize(block)
}

fn p2pkh_output(value: u64, tag: u8) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([tag; 20])),
    }
}

/// Legacy transaction spending a random outpoint into `n_outputs` P2PKH outputs.
pub(crate) fn spending_tx(n_outputs: u8) -> Transaction {
    let prev_txid = Txid::from_byte_array(std::array::from_fn(|_| fastrand::u8(..)));
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(prev_txid, fastrand::u32(..16)),
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: (0..n_outputs)
            .map(|i| p2pkh_output(1_000 * (u64::from(i) + 1), i + 1))
            .collect(),
    }
}

pub(crate) fn coinbase_tx(height: u32) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&height.to_le_bytes());
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![p2pkh_output(50 * 100_000_000, 0xcb)],
    }
}

/// Block over `txdata` with a valid merkle root.
pub(crate) fn build_block(txdata: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: Header {
            version: Version::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_231_006_505,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce: 2_083_236_893,
        },
        txdata,
    };
    if let Some(merkle_root) = block.compute_merkle_root() {
        block.header.merkle_root = merkle_root;
    }
    block
}

#[test]
fn test_block_outputs_aggregate_into_histories() {
    let block = build_block(vec![coinbase_tx(7), spending_tx(2), spending_tx(2)]);
    let mut header = StoredHeader::default();
    header.set_key_data(7, 0);
    header.deserialize_full_block(&raw_block(&block), true, false).unwrap();

    // Both spending transactions pay the same two addresses.
    let mut histories = std::collections::BTreeMap::<Vec<u8>, StoredScriptHistory>::new();
    for tx in header.txs.values() {
        for txout in tx.txouts.values() {
            let unique_key = txout.script_address().to_vec();
            let mut txio = TxIoPair::new(txout.io_key().unwrap(), txout.value().unwrap());
            txio.is_coinbase = txout.is_coinbase;
            histories
                .entry(unique_key.clone())
                .or_insert_with(|| StoredScriptHistory::new(unique_key))
                .insert_txio(txio);
        }
    }

    assert_eq!(histories.len(), 3);
    let first = &histories[&[vec![0u8], vec![1u8; 20]].concat()];
    assert_eq!(first.total_txio_count, 2);
    assert_eq!(first.script_balance(false), Some(2_000));
    let second = &histories[&[vec![0u8], vec![2u8; 20]].concat()];
    assert_eq!(second.script_balance(false), Some(4_000));
    for history in histories.values() {
        history.check_totals().unwrap();
    }

    // Spending one output moves the balance but keeps the received total.
    let mut second = second.clone();
    let txout_key = header.tx(1).unwrap().txouts[&1].io_key().unwrap();
    assert!(second.mark_txout_spent(&txout_key, blkdb_primitives::TxIoKey::new(8, 0, 1, 0)));
    assert_eq!(second.script_balance(false), Some(2_000));
    assert_eq!(second.script_received(false), Some(4_000));
    second.check_totals().unwrap();

    // The same bucket survives a trip through its stored form.
    let bucket = second.sub_history(&blkdb_primitives::Hgtx::new(7, 0)).unwrap();
    let mut decoded = StoredSubHistory::default();
    decoded.deserialize_db_key(&bucket.db_key(true).unwrap(), true).unwrap();
    decoded.deserialize_db_value(&bucket.serialize_db_value()).unwrap();
    assert_eq!(decoded.txios, bucket.txios);
}

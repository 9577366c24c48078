//! Offsets into raw (legacy serialized) transactions.
//!
//! A fragmented transaction is the raw transaction with its output section
//! cut out: `version ‖ inputs ‖ output count ‖ lock time`. The layout parser
//! below understands both forms so either can be walked without decoding
//! scripts.

use crate::{ByteReader, CodecError};

type Result<T> = std::result::Result<T, CodecError>;

/// Size of a serialized outpoint (txid ‖ vout).
pub const OUTPOINT_SIZE: usize = 36;

/// Byte offsets of a transaction's sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxLayout {
    /// Total size of the transaction bytes that were walked.
    pub len: usize,
    /// Start of each input, plus the end of the last input.
    pub txin_offsets: Vec<usize>,
    /// Start of each output, plus the end of the last output.
    ///
    /// For fragmented bytes every entry equals the position right after the
    /// output count.
    pub txout_offsets: Vec<usize>,
    /// Number of outputs declared by the output count.
    pub num_txouts: u32,
}

impl TxLayout {
    pub fn num_txins(&self) -> usize {
        self.txin_offsets.len().saturating_sub(1)
    }

    /// Start of the output section.
    pub fn first_txout(&self) -> usize {
        self.txout_offsets[0]
    }

    /// End of the output section.
    pub fn last_txout_end(&self) -> usize {
        self.txout_offsets[self.txout_offsets.len() - 1]
    }

    /// Byte range of output `index`, only meaningful for full transactions.
    pub fn txout_range(&self, index: usize) -> Option<std::ops::Range<usize>> {
        let start = *self.txout_offsets.get(index)?;
        let end = *self.txout_offsets.get(index + 1)?;
        Some(start..end)
    }
}

/// Reads a var_int length prefix that must fit the address space.
fn get_len(reader: &mut ByteReader<'_>) -> Result<usize> {
    let len = reader.get_var_int()?;
    usize::try_from(len).map_err(|_| CodecError::CountOutOfRange(len))
}

/// Length of the serialized txout at the start of `data`.
pub fn txout_len(data: &[u8]) -> Result<usize> {
    let mut reader = ByteReader::new(data);
    reader.advance(8)?;
    let script_len = get_len(&mut reader)?;
    reader.advance(script_len)?;
    Ok(reader.position())
}

/// Walks the transaction at the start of `data`.
///
/// With `fragged` the output section is expected to be absent.
pub fn tx_layout(data: &[u8], fragged: bool) -> Result<TxLayout> {
    let mut reader = ByteReader::new(data);
    reader.advance(4)?;

    if reader.peek_rest().first() == Some(&0) {
        return Err(CodecError::WitnessNotSupported);
    }

    let num_txins = get_len(&mut reader)?;
    let mut txin_offsets = Vec::with_capacity(num_txins.min(reader.remaining()) + 1);
    for _ in 0..num_txins {
        txin_offsets.push(reader.position());
        reader.advance(OUTPOINT_SIZE)?;
        let script_len = get_len(&mut reader)?;
        reader.advance(script_len)?;
        reader.advance(4)?;
    }
    txin_offsets.push(reader.position());

    let num_txouts = reader.get_var_int()?;
    let num_txouts = u32::try_from(num_txouts).map_err(|_| CodecError::CountOutOfRange(num_txouts))?;

    let mut txout_offsets = Vec::with_capacity(num_txouts.min(reader.remaining() as u32) as usize + 1);
    if fragged {
        txout_offsets.push(reader.position());
    } else {
        for _ in 0..num_txouts {
            txout_offsets.push(reader.position());
            let len = txout_len(reader.peek_rest())?;
            reader.advance(len)?;
        }
        txout_offsets.push(reader.position());
    }

    reader.advance(4)?;

    Ok(TxLayout {
        len: reader.position(),
        txin_offsets,
        txout_offsets,
        num_txouts,
    })
}

/// Whether the first input of `tx` spends the null outpoint.
pub fn is_coinbase(tx: &[u8], layout: &TxLayout) -> bool {
    let Some(&start) = layout.txin_offsets.first() else {
        return false;
    };
    if layout.num_txins() == 0 {
        return false;
    }
    tx.get(start..start + OUTPOINT_SIZE)
        .is_some_and(|outpoint| outpoint[..32].iter().all(|b| *b == 0) && outpoint[32..] == [0xff; 4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // Genesis coinbase.
    const GENESIS_TX: [u8; 204] = hex!(
        "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000"
    );

    #[test]
    fn test_layout_of_full_tx() {
        let layout = tx_layout(&GENESIS_TX, false).unwrap();
        assert_eq!(layout.len, GENESIS_TX.len());
        assert_eq!(layout.num_txins(), 1);
        assert_eq!(layout.num_txouts, 1);
        assert_eq!(layout.txout_offsets.len(), 2);
        let range = layout.txout_range(0).unwrap();
        assert_eq!(range.len(), 8 + 1 + 67);
        assert_eq!(txout_len(&GENESIS_TX[range.start..]).unwrap(), range.len());
        assert!(is_coinbase(&GENESIS_TX, &layout));
    }

    #[test]
    fn test_layout_of_fragged_tx() {
        let full = tx_layout(&GENESIS_TX, false).unwrap();
        let mut fragged = GENESIS_TX[..full.first_txout()].to_vec();
        fragged.extend_from_slice(&GENESIS_TX[full.last_txout_end()..]);

        let layout = tx_layout(&fragged, true).unwrap();
        assert_eq!(layout.len, fragged.len());
        assert_eq!(layout.num_txouts, 1);
        assert_eq!(layout.first_txout(), layout.last_txout_end());
    }

    #[test]
    fn test_truncated_tx() {
        assert!(matches!(
            tx_layout(&GENESIS_TX[..100], false),
            Err(CodecError::UnexpectedEof { .. })
        ));
        assert!(txout_len(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_huge_script_length_is_an_error() {
        let mut data = vec![1, 0, 0, 0, 1];
        data.extend_from_slice(&[0; OUTPOINT_SIZE]);
        data.push(0xff);
        data.extend_from_slice(&[0xff; 8]);
        assert!(matches!(
            tx_layout(&data, false),
            Err(CodecError::UnexpectedEof { .. })
        ));

        let mut txout = vec![0; 8];
        txout.push(0xff);
        txout.extend_from_slice(&[0xff; 8]);
        assert!(matches!(
            txout_len(&txout),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_witness_marker_rejected() {
        let data = hex!("020000000001");
        assert_eq!(tx_layout(&data, false), Err(CodecError::WitnessNotSupported));
    }
}

//! Derivation of the unique address key ("script address") of an output script.
//!
//! The key is a [`ScriptPrefix`] byte followed by a payload:
//!
//! - P2PKH and P2PK: `0x00 ‖ hash160(pubkey)`, so both forms share one history.
//! - P2SH: `0x05 ‖ script hash`.
//! - Bare multisig: `0xfe ‖ M ‖ N ‖ sorted hash160 of each pubkey`.
//! - Anything else: `0xff ‖ hash160(script)`.

use crate::ScriptPrefix;
use bitcoin::hashes::{Hash, hash160};

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

fn to_key_id(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        Some(hash)
    } else {
        None
    }
}

fn to_script_id(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        Some(hash)
    } else {
        None
    }
}

fn to_pub_key(script: &[u8]) -> Option<&[u8]> {
    let compressed = script.len() == 35
        && script[0] == 33
        && script[34] == OP_CHECKSIG
        && (script[1] == 0x02 || script[1] == 0x03);
    let uncompressed =
        script.len() == 67 && script[0] == 65 && script[66] == OP_CHECKSIG && script[1] == 0x04;
    (compressed || uncompressed).then(|| &script[1..script.len() - 1])
}

fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).to_byte_array()
}

/// Bare multisig template: `OP_M <pubkey>... OP_N OP_CHECKMULTISIG`.
///
/// Returns `M` and the pubkeys in script order.
pub fn parse_multisig(script: &[u8]) -> Option<(u8, Vec<&[u8]>)> {
    let (&op_m, rest) = script.split_first()?;
    let (&op_checkmultisig, rest) = rest.split_last()?;
    let (&op_n, mut pushes) = rest.split_last()?;

    if !(OP_1..=OP_16).contains(&op_m)
        || !(OP_1..=OP_16).contains(&op_n)
        || op_checkmultisig != OP_CHECKMULTISIG
    {
        return None;
    }

    let mut pubkeys = Vec::new();
    while let Some((&len, tail)) = pushes.split_first() {
        let len = usize::from(len);
        if (len != 33 && len != 65) || tail.len() < len {
            return None;
        }
        pubkeys.push(&tail[..len]);
        pushes = &tail[len..];
    }

    let m = op_m - OP_1 + 1;
    let n = op_n - OP_1 + 1;
    (usize::from(n) == pubkeys.len() && m <= n).then_some((m, pubkeys))
}

/// Whether `script` is a bare multisig output.
pub fn is_multisig(script: &[u8]) -> bool {
    parse_multisig(script).is_some()
}

/// Unique address key of an output script.
pub fn script_address(script: &[u8]) -> Vec<u8> {
    if let Some(hash) = to_key_id(script) {
        prefixed(ScriptPrefix::Hash160, &hash)
    } else if let Some(pubkey) = to_pub_key(script) {
        prefixed(ScriptPrefix::Hash160, &hash160(pubkey))
    } else if let Some(hash) = to_script_id(script) {
        prefixed(ScriptPrefix::P2sh, &hash)
    } else if let Some((m, pubkeys)) = parse_multisig(script) {
        let mut hashes: Vec<[u8; 20]> = pubkeys.into_iter().map(hash160).collect();
        hashes.sort_unstable();
        let mut out = Vec::with_capacity(3 + hashes.len() * 20);
        out.push(ScriptPrefix::Multisig.to_u8());
        out.push(m);
        out.push(hashes.len() as u8);
        hashes.iter().for_each(|hash| out.extend_from_slice(hash));
        out
    } else {
        prefixed(ScriptPrefix::NonStd, &hash160(script))
    }
}

fn prefixed(prefix: ScriptPrefix, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(prefix.to_u8());
    out.extend_from_slice(payload);
    out
}

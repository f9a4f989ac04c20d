// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component C — the Bitcoin transaction parser and burn-output recognizer
//! (spec §4.C). Pure, side-effect-free: decode the wire format (including
//! SegWit marker/flag/witnesses), compute both txid and wtxid, and recognize
//! the BATHRON burn pattern.

use std::io::{Cursor, Read};

use bathron_common::codec::{read_compact_size, read_varbytes, CodecError};
use bathron_common::hash::{sha256, sha256d, Sha256dHash};
use thiserror::Error;

pub const MAX_TX_SIZE: usize = 200_000;
pub const MAX_OUTPUTS: usize = 100;
pub const MAX_SCRIPT_LEN: usize = 10_000;

const BATHRON_MAGIC: &[u8; 7] = b"BATHRON";
const BURN_METADATA_LEN: usize = 29;
/// SHA256(0x00) — the provably-unspendable witness-script-hash burn outputs
/// must pay to (spec §4.C: "anyone-can-spend-but-pruned").
fn unspendable_witness_hash() -> [u8; 32] {
    sha256(&[0u8]).0
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("too many outputs: {0}")]
    TooManyOutputs(usize),
    #[error("script exceeds max length: {0}")]
    ScriptTooLong(usize),
    #[error("transaction exceeds max size: {0}")]
    TxTooLarge(usize),
    #[error("trailing bytes after transaction")]
    TrailingBytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prev_txid: Sha256dHash,
    pub prev_vout: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBtcTx {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    pub is_segwit: bool,
    pub raw: Vec<u8>,
    /// Offsets into `raw` bounding the non-witness serialization, for txid
    /// computation without re-serializing.
    non_witness: Vec<u8>,
}

impl ParsedBtcTx {
    pub fn txid(&self) -> Sha256dHash {
        sha256d(&self.non_witness)
    }

    pub fn wtxid(&self) -> Sha256dHash {
        sha256d(&self.raw)
    }
}

/// Decodes a raw Bitcoin transaction, including the SegWit marker/flag and
/// per-input witness stacks, enforcing the sanity caps from spec §4.C.
pub fn parse_btc_tx(bytes: &[u8]) -> Result<ParsedBtcTx, ParseError> {
    if bytes.len() > MAX_TX_SIZE {
        return Err(ParseError::TxTooLarge(bytes.len()));
    }
    let mut cursor = Cursor::new(bytes);

    let version = read_i32(&mut cursor)?;

    let mut marker_flag = [0u8; 2];
    let is_segwit;
    let first_count_byte_pos = cursor.position();
    cursor.read_exact(&mut marker_flag).map_err(|_| CodecError::Eof)?;
    if marker_flag[0] == 0x00 && marker_flag[1] == 0x01 {
        is_segwit = true;
    } else {
        is_segwit = false;
        cursor.set_position(first_count_byte_pos);
    }

    let input_count = read_compact_size(&mut cursor)?;
    let mut inputs = Vec::new();
    for _ in 0..input_count {
        let mut prev_txid_bytes = [0u8; 32];
        cursor.read_exact(&mut prev_txid_bytes).map_err(|_| CodecError::Eof)?;
        prev_txid_bytes.reverse(); // wire order is little-endian per-byte reversed
        let prev_vout = read_u32(&mut cursor)?;
        let script_sig = read_varbytes(&mut cursor, MAX_SCRIPT_LEN).map_err(|e| {
            if matches!(e, CodecError::LimitExceeded) {
                ParseError::ScriptTooLong(MAX_SCRIPT_LEN + 1)
            } else {
                ParseError::Codec(e)
            }
        })?;
        let sequence = read_u32(&mut cursor)?;
        inputs.push(TxIn { prev_txid: Sha256dHash(prev_txid_bytes), prev_vout, script_sig, sequence, witness: Vec::new() });
    }

    let output_count = read_compact_size(&mut cursor)?;
    if output_count as usize > MAX_OUTPUTS {
        return Err(ParseError::TooManyOutputs(output_count as usize));
    }
    let mut outputs = Vec::new();
    for _ in 0..output_count {
        let value = read_u64(&mut cursor)?;
        let script_pubkey = read_varbytes(&mut cursor, MAX_SCRIPT_LEN).map_err(|e| {
            if matches!(e, CodecError::LimitExceeded) {
                ParseError::ScriptTooLong(MAX_SCRIPT_LEN + 1)
            } else {
                ParseError::Codec(e)
            }
        })?;
        outputs.push(TxOut { value, script_pubkey });
    }

    if is_segwit {
        for input in inputs.iter_mut() {
            let item_count = read_compact_size(&mut cursor)?;
            let mut witness = Vec::new();
            for _ in 0..item_count {
                witness.push(read_varbytes(&mut cursor, MAX_SCRIPT_LEN)?);
            }
            input.witness = witness;
        }
    }

    let lock_time = read_u32(&mut cursor)?;

    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(ParseError::TrailingBytes);
    }

    let non_witness = serialize_non_witness(version, &inputs, &outputs, lock_time);

    Ok(ParsedBtcTx { version, inputs, outputs, lock_time, is_segwit, raw: bytes.to_vec(), non_witness })
}

fn serialize_non_witness(version: i32, inputs: &[TxIn], outputs: &[TxOut], lock_time: u32) -> Vec<u8> {
    use bathron_common::codec::write_compact_size;
    let mut out = Vec::new();
    out.extend_from_slice(&version.to_le_bytes());
    write_compact_size(&mut out, inputs.len() as u64).unwrap();
    for input in inputs {
        let mut txid_le = input.prev_txid.0;
        txid_le.reverse();
        out.extend_from_slice(&txid_le);
        out.extend_from_slice(&input.prev_vout.to_le_bytes());
        write_compact_size(&mut out, input.script_sig.len() as u64).unwrap();
        out.extend_from_slice(&input.script_sig);
        out.extend_from_slice(&input.sequence.to_le_bytes());
    }
    write_compact_size(&mut out, outputs.len() as u64).unwrap();
    for output in outputs {
        out.extend_from_slice(&output.value.to_le_bytes());
        write_compact_size(&mut out, output.script_pubkey.len() as u64).unwrap();
        out.extend_from_slice(&output.script_pubkey);
    }
    out.extend_from_slice(&lock_time.to_le_bytes());
    out
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, CodecError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(|_| CodecError::Eof)?;
    Ok(u32::from_le_bytes(b))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, CodecError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(|_| CodecError::Eof)?;
    Ok(i32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, CodecError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b).map_err(|_| CodecError::Eof)?;
    Ok(u64::from_le_bytes(b))
}

/// The BATHRON network discriminator carried in burn metadata. Accepts both
/// the canonical single-byte form and the ASCII form, per spec §4.C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnNetwork {
    Mainnet,
    Testnet,
}

impl BurnNetwork {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 | b'M' => Some(BurnNetwork::Mainnet),
            0x01 | b'T' => Some(BurnNetwork::Testnet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnInfo {
    pub version: u8,
    pub network: BurnNetwork,
    pub destination: [u8; 20],
    pub burned_sats: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BurnParseError {
    #[error("no BATHRON OP_RETURN output found, or more than one")]
    MissingOrDuplicateMetadata,
    #[error("no provably-unspendable P2WSH output found, or more than one")]
    MissingOrDuplicateVault,
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported burn metadata version")]
    UnsupportedVersion,
    #[error("unrecognized network byte")]
    BadNetwork,
    #[error("burn metadata output must carry zero value")]
    NonZeroMetadataValue,
    #[error("burn vault output must carry a positive value")]
    NonPositiveBurnValue,
}

/// `OP_RETURN <29 bytes>` is `0x6a 0x1d <29 bytes>`.
fn extract_op_return_data(script: &[u8]) -> Option<&[u8]> {
    if script.len() != 2 + BURN_METADATA_LEN {
        return None;
    }
    if script[0] != 0x6a || script[1] != BURN_METADATA_LEN as u8 {
        return None;
    }
    Some(&script[2..])
}

/// `OP_0 <32-byte hash>` is `0x00 0x20 <32 bytes>` (a P2WSH scriptPubKey).
fn extract_p2wsh_hash(script: &[u8]) -> Option<[u8; 32]> {
    if script.len() != 34 || script[0] != 0x00 || script[1] != 0x20 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&script[2..34]);
    Some(out)
}

/// Recognizes the BATHRON burn pattern in a parsed transaction: exactly one
/// 29-byte OP_RETURN with the correct magic/version/network and zero value,
/// paired with exactly one positive-value P2WSH output to `SHA256(0x00)`.
pub fn parse_burn_outputs(tx: &ParsedBtcTx) -> Result<BurnInfo, BurnParseError> {
    let mut metadata: Option<(u8, BurnNetwork, [u8; 20])> = None;
    let mut metadata_count = 0;
    let mut burn_value: Option<u64> = None;
    let mut vault_count = 0;
    let target_hash = unspendable_witness_hash();

    for out in &tx.outputs {
        if let Some(data) = extract_op_return_data(&out.script_pubkey) {
            metadata_count += 1;
            if &data[0..7] != BATHRON_MAGIC {
                return Err(BurnParseError::BadMagic);
            }
            let version = data[7];
            if version != 1 {
                return Err(BurnParseError::UnsupportedVersion);
            }
            let network = BurnNetwork::from_byte(data[8]).ok_or(BurnParseError::BadNetwork)?;
            if out.value != 0 {
                return Err(BurnParseError::NonZeroMetadataValue);
            }
            let mut dest = [0u8; 20];
            dest.copy_from_slice(&data[9..29]);
            metadata = Some((version, network, dest));
        } else if let Some(hash) = extract_p2wsh_hash(&out.script_pubkey) {
            if hash == target_hash {
                vault_count += 1;
                if out.value == 0 {
                    return Err(BurnParseError::NonPositiveBurnValue);
                }
                burn_value = Some(out.value);
            }
        }
    }

    if metadata_count != 1 {
        return Err(BurnParseError::MissingOrDuplicateMetadata);
    }
    if vault_count != 1 {
        return Err(BurnParseError::MissingOrDuplicateVault);
    }

    let (version, network, destination) = metadata.unwrap();
    Ok(BurnInfo { version, network, destination, burned_sats: burn_value.unwrap() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bathron_common::codec::write_compact_size;

    fn burn_metadata_script(network_byte: u8, dest: [u8; 20]) -> Vec<u8> {
        let mut script = vec![0x6a, BURN_METADATA_LEN as u8];
        script.extend_from_slice(BATHRON_MAGIC);
        script.push(1);
        script.push(network_byte);
        script.extend_from_slice(&dest);
        script
    }

    fn p2wsh_unspendable_script() -> Vec<u8> {
        let mut script = vec![0x00, 0x20];
        script.extend_from_slice(&unspendable_witness_hash());
        script
    }

    fn build_legacy_tx(outputs: Vec<TxOut>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1i32.to_le_bytes());
        write_compact_size(&mut buf, 1).unwrap(); // 1 input
        buf.extend_from_slice(&[0u8; 32]);
        buf.extend_from_slice(&0xffffffffu32.to_le_bytes());
        write_compact_size(&mut buf, 0).unwrap(); // empty scriptSig
        buf.extend_from_slice(&0xffffffffu32.to_le_bytes());
        write_compact_size(&mut buf, outputs.len() as u64).unwrap();
        for o in &outputs {
            buf.extend_from_slice(&o.value.to_le_bytes());
            write_compact_size(&mut buf, o.script_pubkey.len() as u64).unwrap();
            buf.extend_from_slice(&o.script_pubkey);
        }
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    #[test]
    fn parses_minimal_legacy_transaction() {
        let raw = build_legacy_tx(vec![TxOut { value: 5_000, script_pubkey: vec![0x76, 0xa9] }]);
        let tx = parse_btc_tx(&raw).unwrap();
        assert_eq!(tx.outputs.len(), 1);
        assert!(!tx.is_segwit);
        assert_eq!(tx.txid(), tx.wtxid());
    }

    #[test]
    fn recognizes_valid_burn_pattern() {
        let dest = [0x42u8; 20];
        let raw = build_legacy_tx(vec![
            TxOut { value: 0, script_pubkey: burn_metadata_script(0x00, dest) },
            TxOut { value: 1_000_000, script_pubkey: p2wsh_unspendable_script() },
        ]);
        let tx = parse_btc_tx(&raw).unwrap();
        let burn = parse_burn_outputs(&tx).unwrap();
        assert_eq!(burn.destination, dest);
        assert_eq!(burn.burned_sats, 1_000_000);
        assert_eq!(burn.network, BurnNetwork::Mainnet);
    }

    #[test]
    fn accepts_ascii_network_byte() {
        let dest = [0x42u8; 20];
        let raw = build_legacy_tx(vec![
            TxOut { value: 0, script_pubkey: burn_metadata_script(b'T', dest) },
            TxOut { value: 500, script_pubkey: p2wsh_unspendable_script() },
        ]);
        let tx = parse_btc_tx(&raw).unwrap();
        let burn = parse_burn_outputs(&tx).unwrap();
        assert_eq!(burn.network, BurnNetwork::Testnet);
    }

    #[test]
    fn rejects_missing_vault_output() {
        let dest = [0x42u8; 20];
        let raw = build_legacy_tx(vec![TxOut { value: 0, script_pubkey: burn_metadata_script(0x00, dest) }]);
        let tx = parse_btc_tx(&raw).unwrap();
        assert_eq!(parse_burn_outputs(&tx), Err(BurnParseError::MissingOrDuplicateVault));
    }

    #[test]
    fn rejects_duplicate_metadata_outputs() {
        let dest = [0x42u8; 20];
        let raw = build_legacy_tx(vec![
            TxOut { value: 0, script_pubkey: burn_metadata_script(0x00, dest) },
            TxOut { value: 0, script_pubkey: burn_metadata_script(0x00, dest) },
            TxOut { value: 1_000, script_pubkey: p2wsh_unspendable_script() },
        ]);
        let tx = parse_btc_tx(&raw).unwrap();
        assert_eq!(parse_burn_outputs(&tx), Err(BurnParseError::MissingOrDuplicateMetadata));
    }

    #[test]
    fn rejects_too_many_outputs() {
        let mut outputs = Vec::new();
        for _ in 0..(MAX_OUTPUTS + 1) {
            outputs.push(TxOut { value: 1, script_pubkey: vec![0x51] });
        }
        let raw = build_legacy_tx(outputs);
        assert_eq!(parse_btc_tx(&raw), Err(ParseError::TooManyOutputs(MAX_OUTPUTS + 1)));
    }
}

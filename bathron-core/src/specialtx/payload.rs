// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Tagged special-transaction payloads (spec §9 redesign note: replace
//! "template payload signing / duck-typed GetTxPayload" with a tagged
//! variant per TX type, validated centrally before dispatch).

use bathron_common::hash::Sha256dHash;

use crate::btcheaders::ProTxHash;
use crate::btcspv::BtcHeader;

/// `TX_BURN_CLAIM` payload (spec §6, bit-exact wire form): `version:u8 |
/// btc_tx:Bytes | btc_block_hash:u256 | btc_block_height:u32 |
/// merkle_proof:Vec<u256> | tx_index:u32`.
#[derive(Debug, Clone)]
pub struct BurnClaimPayload {
    pub version: u8,
    pub btc_tx: Vec<u8>,
    pub btc_block_hash: Sha256dHash,
    pub btc_block_height: u32,
    pub merkle_proof: Vec<Sha256dHash>,
    pub tx_index: u32,
}

/// `TX_MINT_M0BTC` payload: an ordered claim list; the matching transparent
/// outputs live in the enclosing transaction body, one per claim in order.
#[derive(Debug, Clone)]
pub struct MintM0BtcPayload {
    pub version: u8,
    pub claims: Vec<Sha256dHash>,
    /// `(destination, value_sats)` pairs, index-aligned with `claims`.
    pub outputs: Vec<([u8; 20], u64)>,
}

/// `TX_LOCK`: M0 -> M1. `spent_outpoints` names what the external UTXO
/// engine is about to consume so `CheckSpecialTx` can veto spending
/// anything already vault-/receipt-tagged.
#[derive(Debug, Clone)]
pub struct LockPayload {
    pub spent_outpoints: Vec<(Sha256dHash, u32)>,
    pub inputs_value: u64,
    pub vault_owner: [u8; 20],
    pub vault_value: u64,
    pub change_value: u64,
}

/// `TX_UNLOCK`: M1 -> M0.
#[derive(Debug, Clone)]
pub struct UnlockPayload {
    pub vault_outpoints: Vec<(Sha256dHash, u32)>,
    pub destination: [u8; 20],
    pub m0_out_value: u64,
    pub m1_change_value: u64,
}

/// `TX_TRANSFER_M1`: M1 -> M1, supply-neutral.
#[derive(Debug, Clone)]
pub struct TransferM1Payload {
    pub from: [u8; 20],
    pub to: [u8; 20],
    pub amount: u64,
}

/// `TX_BTC_HEADERS` payload: `version:u8 | publisher_proTxHash:u256 |
/// start_height:u32 | count:u16 | headers:[80-byte x count] |
/// signature:Vec<u8>`. `None` publisher/signature models the R6 genesis
/// exception.
#[derive(Debug, Clone)]
pub struct BtcHeadersPayload {
    pub version: u8,
    pub publisher: Option<ProTxHash>,
    pub start_height: u32,
    pub headers: Vec<BtcHeader>,
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtlcSecretScheme {
    Single,
    ThreeOfThree,
}

#[derive(Debug, Clone)]
pub struct HtlcCreatePayload {
    pub scheme: HtlcSecretScheme,
    pub hash_locks: Vec<[u8; 32]>,
    pub timelock_height: u64,
    pub sender: [u8; 20],
    pub receiver: [u8; 20],
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct HtlcClaimPayload {
    pub htlc_id: Sha256dHash,
    pub preimages: Vec<[u8; 32]>,
}

#[derive(Debug, Clone)]
pub struct HtlcRefundPayload {
    pub htlc_id: Sha256dHash,
}

#[derive(Debug, Clone)]
pub struct ProRegPayload {
    pub pro_tx_hash: ProTxHash,
    pub collateral_outpoint: (Sha256dHash, u32),
    pub owner_key_hash: [u8; 20],
    pub operator_pubkey: [u8; 33],
    pub voting_key_hash: [u8; 20],
}

#[derive(Debug, Clone)]
pub struct ProUpServPayload {
    pub pro_tx_hash: ProTxHash,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProUpRegPayload {
    pub pro_tx_hash: ProTxHash,
    pub new_operator_pubkey: Option<[u8; 33]>,
    pub new_voting_key_hash: Option<[u8; 20]>,
    pub owner_signature: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProUpRevPayload {
    pub pro_tx_hash: ProTxHash,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum SpecialTxPayload {
    BurnClaim(BurnClaimPayload),
    MintM0Btc(MintM0BtcPayload),
    Lock(LockPayload),
    Unlock(UnlockPayload),
    TransferM1(TransferM1Payload),
    BtcHeaders(BtcHeadersPayload),
    HtlcCreate(HtlcCreatePayload),
    HtlcClaim(HtlcClaimPayload),
    HtlcRefund(HtlcRefundPayload),
    ProReg(ProRegPayload),
    ProUpServ(ProUpServPayload),
    ProUpReg(ProUpRegPayload),
    ProUpRev(ProUpRevPayload),
}

impl SpecialTxPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            SpecialTxPayload::BurnClaim(_) => "TX_BURN_CLAIM",
            SpecialTxPayload::MintM0Btc(_) => "TX_MINT_M0BTC",
            SpecialTxPayload::Lock(_) => "TX_LOCK",
            SpecialTxPayload::Unlock(_) => "TX_UNLOCK",
            SpecialTxPayload::TransferM1(_) => "TX_TRANSFER_M1",
            SpecialTxPayload::BtcHeaders(_) => "TX_BTC_HEADERS",
            SpecialTxPayload::HtlcCreate(_) => "TX_HTLC_CREATE",
            SpecialTxPayload::HtlcClaim(_) => "TX_HTLC_CLAIM",
            SpecialTxPayload::HtlcRefund(_) => "TX_HTLC_REFUND",
            SpecialTxPayload::ProReg(_) => "TX_PROREG",
            SpecialTxPayload::ProUpServ(_) => "TX_PROUPSERV",
            SpecialTxPayload::ProUpReg(_) => "TX_PROUPREG",
            SpecialTxPayload::ProUpRev(_) => "TX_PROUPREV",
        }
    }

    /// Fee-less types the assembler must always include (spec §4.G).
    pub fn is_fee_exempt(&self) -> bool {
        matches!(
            self,
            SpecialTxPayload::BurnClaim(_)
                | SpecialTxPayload::BtcHeaders(_)
                | SpecialTxPayload::Lock(_)
                | SpecialTxPayload::Unlock(_)
                | SpecialTxPayload::TransferM1(_)
                | SpecialTxPayload::HtlcCreate(_)
                | SpecialTxPayload::HtlcClaim(_)
                | SpecialTxPayload::HtlcRefund(_)
        )
    }

    /// `TX_MINT_M0BTC` is block-producer-only and must never be accepted
    /// from the mempool (spec §4.F).
    pub fn mempool_forbidden(&self) -> bool {
        matches!(self, SpecialTxPayload::MintM0Btc(_))
    }
}

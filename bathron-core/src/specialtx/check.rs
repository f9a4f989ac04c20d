// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! `CheckSpecialTx`: per-type stateless-ish validation against the current
//! node context. Every function returns a `ValidationState` rather than
//! mutating anything — mutation happens only in the commit pipeline
//! (`mod.rs`) once every check in the block has passed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bathron_common::hash::{sha256, sha256d, Sha256dHash};

use crate::btcheaders::ProTxHash;
use crate::burnparser::{parse_btc_tx, parse_burn_outputs, BurnNetwork};
use crate::core::error::{RejectClass, ValidationState};
use crate::core::params::ConsensusParams;
use crate::core::Network;
use crate::dmn::DmnRegistry;
use crate::killswitch::KillSwitch;
use crate::settlement::SettlementDb;
use crate::specialtx::payload::*;

/// External collaborator abstracting the UTXO/script engine (spec §1 out
/// of scope). `CheckSpecialTx` only needs to know the vault/receipt tags
/// on outpoints it is being asked to spend or has already spent.
pub trait UtxoView {
    fn is_vault(&self, txid: &Sha256dHash, vout: u32) -> bool;
    fn is_m1_receipt(&self, txid: &Sha256dHash, vout: u32) -> bool;
}

pub const PUBLISHER_COOLDOWN_BLACKLIST_SECS: u64 = 60;

/// In-memory 60-second blacklist for publishers who just failed R3/R5, so
/// the mempool doesn't keep re-admitting their retries (spec §4.F). This is
/// advisory anti-spam, not consensus: it is consulted by the publisher task,
/// never by `CheckSpecialTx` itself.
#[derive(Default)]
pub struct PublisherBlacklist {
    entries: Mutex<HashMap<ProTxHash, Instant>>,
}

impl PublisherBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blacklist(&self, pro_tx_hash: ProTxHash) {
        self.entries.lock().unwrap().insert(pro_tx_hash, Instant::now());
    }

    pub fn is_blacklisted(&self, pro_tx_hash: &ProTxHash) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(pro_tx_hash) {
            Some(since) if since.elapsed() < Duration::from_secs(PUBLISHER_COOLDOWN_BLACKLIST_SECS) => true,
            Some(_) => {
                entries.remove(pro_tx_hash);
                false
            }
            None => false,
        }
    }
}

pub struct SpecialTxContext<'a> {
    pub spv: &'a crate::btcspv::SpvStore,
    pub onchain_headers: &'a crate::btcheaders::OnChainHeaderDb,
    pub burn_claims: &'a crate::burnclaim::BurnClaimDb,
    pub settlement: &'a SettlementDb,
    pub dmns: &'a DmnRegistry,
    pub kill_switch: &'a KillSwitch,
    pub params: &'a ConsensusParams,
    pub network: Network,
    pub current_height: u64,
    pub utxo_view: &'a dyn UtxoView,
}

fn reject(class: RejectClass, code: &'static str, reason: impl Into<String>) -> ValidationState {
    ValidationState::reject(class, code, reason.into())
}

/// `TX_BURN_CLAIM` (spec §4.F).
pub fn check_burn_claim(ctx: &SpecialTxContext, payload: &BurnClaimPayload) -> ValidationState {
    if !ctx.kill_switch.is_enabled() {
        return reject(RejectClass::Policy, "btc-burns-disabled-emergency", "burn claims are disabled by the kill switch");
    }

    let parsed = match parse_btc_tx(&payload.btc_tx) {
        Ok(p) => p,
        Err(e) => return reject(RejectClass::Malformed, "burn-claim-bad-tx-encoding", format!("{e}")),
    };
    let btc_txid = parsed.txid();

    match ctx.burn_claims.has_claim(&btc_txid) {
        Ok(true) => return reject(RejectClass::Duplicate, "burn-claim-duplicate", "a claim for this btc-txid already exists"),
        Ok(false) => {}
        Err(e) => return reject(RejectClass::Resource, "burn-claim-db-error", format!("{e}")),
    }

    // Prefer the consensus-visible header mirror (B); fall back to the SPV
    // store (A) only if B hasn't republished that height yet.
    let header = match ctx.onchain_headers.get_header_by_hash(&payload.btc_block_hash) {
        Ok(Some(h)) => Some(h),
        Ok(None) => match ctx.spv.get_header_by_hash(&payload.btc_block_hash) {
            Ok(Some(idx)) => Some(idx.header),
            Ok(None) => None,
            Err(e) => return reject(RejectClass::Resource, "burn-claim-spv-error", format!("{e}")),
        },
        Err(e) => return reject(RejectClass::Resource, "burn-claim-db-error", format!("{e}")),
    };
    let Some(header) = header else {
        return reject(RejectClass::Transient, "burn-claim-header-unknown", "no header found for the claimed BTC block");
    };

    match ctx.spv.is_in_best_chain(&payload.btc_block_hash) {
        Ok(true) => {}
        Ok(false) => return reject(RejectClass::Consensus, "burn-claim-not-best-chain", "claimed BTC block is not on the best chain"),
        Err(e) => return reject(RejectClass::Resource, "burn-claim-spv-error", format!("{e}")),
    }

    match ctx.spv.get_header_by_hash(&payload.btc_block_hash) {
        Ok(Some(idx)) if idx.height != payload.btc_block_height => {
            return reject(RejectClass::Malformed, "burn-claim-height-mismatch", "claimed height does not match the header's height");
        }
        Ok(Some(idx)) => {
            if idx.height < ctx.spv.min_supported_height() {
                return reject(RejectClass::Consensus, "burn-claim-spv-range", "claimed block is below min_supported_height");
            }
        }
        Ok(None) => {}
        Err(e) => return reject(RejectClass::Resource, "burn-claim-spv-error", format!("{e}")),
    }

    if !verify_merkle_path(&btc_txid, &header.merkle_root, &payload.merkle_proof, payload.tx_index) {
        return reject(RejectClass::Consensus, "burn-claim-bad-merkle-proof", "merkle proof does not validate against the header's root");
    }

    let expected_network = match ctx.network {
        Network::Mainnet => BurnNetwork::Mainnet,
        Network::Testnet | Network::Regtest => BurnNetwork::Testnet,
    };
    let burn_info = match parse_burn_outputs(&parsed) {
        Ok(info) => info,
        Err(e) => return reject(RejectClass::Malformed, "burn-claim-not-a-burn", format!("{e}")),
    };
    if burn_info.network != expected_network {
        return reject(RejectClass::Consensus, "burn-claim-wrong-network", "burn metadata network byte does not match this network");
    }

    ValidationState::Accepted
}

fn verify_merkle_path(leaf_txid: &Sha256dHash, root: &Sha256dHash, proof: &[Sha256dHash], mut index: u32) -> bool {
    let mut current = *leaf_txid;
    for sibling in proof {
        let (left, right) = if index & 1 == 0 { (current.0, sibling.0) } else { (sibling.0, current.0) };
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&left);
        buf.extend_from_slice(&right);
        current = sha256d(&buf);
        index >>= 1;
    }
    current == *root
}

/// `TX_MINT_M0BTC` claim-selection rule (spec §4.F): recomputes the
/// expected mint deterministically so ConnectBlock can reject a mismatch.
pub fn expected_mint_claims(ctx: &SpecialTxContext) -> Result<Vec<(Sha256dHash, [u8; 20], u64)>, String> {
    let mut eligible: Vec<(u64, Sha256dHash, [u8; 20], u64)> = Vec::new();
    ctx.burn_claims
        .for_each_pending(|rec| {
            let claim_height = rec.claim_height_l1;
            if claim_height + ctx.params.k_finality as u64 > ctx.current_height {
                return;
            }
            let still_best = ctx.spv.is_in_best_chain(&rec.btc_block_hash).unwrap_or(false);
            if !still_best {
                return;
            }
            let confirmations = ctx.spv.confirmations(&rec.btc_block_hash).unwrap_or(None).unwrap_or(0);
            if confirmations < ctx.params.k_confirmations {
                return;
            }
            eligible.push((claim_height, rec.btc_txid, rec.destination, rec.burned_sats));
        })
        .map_err(|e| e.to_string())?;

    eligible.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    eligible.truncate(ctx.params.max_mint_claims_per_block as usize);
    Ok(eligible.into_iter().map(|(_, txid, dest, sats)| (txid, dest, sats)).collect())
}

pub fn check_mint_m0btc(ctx: &SpecialTxContext, payload: &MintM0BtcPayload) -> ValidationState {
    let expected = match expected_mint_claims(ctx) {
        Ok(e) => e,
        Err(e) => return reject(RejectClass::Resource, "mint-claim-selection-error", e),
    };
    if expected.len() != payload.claims.len() || expected.len() != payload.outputs.len() {
        return reject(RejectClass::Consensus, "mint-claim-set-mismatch", "mint does not match the deterministically-selected claim set");
    }
    for (i, (expected_txid, expected_dest, expected_value)) in expected.iter().enumerate() {
        if payload.claims[i] != *expected_txid {
            return reject(RejectClass::Consensus, "mint-claim-set-mismatch", "claim order/content mismatch");
        }
        let (out_dest, out_value) = payload.outputs[i];
        if out_dest != *expected_dest || out_value != *expected_value {
            return reject(RejectClass::Consensus, "mint-output-mismatch", "mint output does not match burned-sats/destination");
        }
    }
    ValidationState::Accepted
}

/// `TX_LOCK`.
pub fn check_lock(ctx: &SpecialTxContext, payload: &LockPayload) -> ValidationState {
    for (txid, vout) in &payload.spent_outpoints {
        if ctx.utxo_view.is_vault(txid, *vout) {
            return reject(RejectClass::Consensus, "lock-spends-vault", "TX_LOCK may not spend an IsVault outpoint");
        }
        if ctx.utxo_view.is_m1_receipt(txid, *vout) {
            return reject(RejectClass::Consensus, "lock-spends-m1-receipt", "TX_LOCK may not spend an M1 receipt");
        }
    }
    let spent = payload.inputs_value;
    let produced = match payload.vault_value.checked_add(payload.change_value) {
        Some(v) => v,
        None => return reject(RejectClass::Malformed, "lock-overflow", "vault + change overflows"),
    };
    if produced > spent {
        return reject(RejectClass::Consensus, "lock-value-overflow", "vault + change exceeds inputs");
    }
    ValidationState::Accepted
}

/// `TX_UNLOCK`.
pub fn check_unlock(ctx: &SpecialTxContext, payload: &UnlockPayload) -> ValidationState {
    if payload.vault_outpoints.is_empty() {
        return reject(RejectClass::Malformed, "unlock-no-inputs", "TX_UNLOCK must spend at least one vault outpoint");
    }
    let mut total_vault_value = 0u64;
    for (txid, vout) in &payload.vault_outpoints {
        match ctx.settlement.vault_outpoint(txid, *vout) {
            Ok(Some(v)) => total_vault_value = total_vault_value.saturating_add(v.value_sats),
            Ok(None) => return reject(RejectClass::Consensus, "unlock-not-a-vault", "outpoint is not tagged IsVault"),
            Err(e) => return reject(RejectClass::Resource, "unlock-db-error", format!("{e}")),
        }
    }
    let produced = match payload.m0_out_value.checked_add(payload.m1_change_value) {
        Some(v) => v,
        None => return reject(RejectClass::Malformed, "unlock-overflow", "m0 out + m1 change overflows"),
    };
    if produced > total_vault_value {
        return reject(RejectClass::Consensus, "unlock-value-overflow", "outputs exceed vaulted value (A6 would be violated)");
    }
    ValidationState::Accepted
}

/// `TX_TRANSFER_M1`.
pub fn check_transfer_m1(ctx: &SpecialTxContext, payload: &TransferM1Payload) -> ValidationState {
    match ctx.settlement.balance_of(payload.from) {
        Ok(bal) if bal >= payload.amount => ValidationState::Accepted,
        Ok(_) => reject(RejectClass::Consensus, "transfer-insufficient-m1", "sender's M1 balance is below the transfer amount"),
        Err(e) => reject(RejectClass::Resource, "transfer-db-error", format!("{e}")),
    }
}

/// `TX_BTC_HEADERS`, validation order R1..R8 per spec §4.F. `is_genesis`
/// models R6 (block 1 bundles headers with null proTxHash/signature).
pub fn check_btc_headers(ctx: &SpecialTxContext, payload: &BtcHeadersPayload, is_genesis: bool, already_one_in_block: bool) -> ValidationState {
    // R8: at most one per L1 block.
    if already_one_in_block {
        return reject(RejectClass::Consensus, "btcheaders-duplicate-in-block", "only one TX_BTC_HEADERS per block is allowed");
    }
    // R7: count/payload size limits.
    if payload.headers.is_empty() || payload.headers.len() > ctx.params.btcheaders_max_count as usize {
        return reject(RejectClass::Malformed, "btcheaders-bad-count", "header count outside allowed bounds");
    }
    let payload_bytes = payload.headers.len() * crate::btcspv::BtcHeader::SIZE;
    if payload_bytes > ctx.params.btcheaders_max_payload_bytes as usize {
        return reject(RejectClass::Malformed, "btcheaders-payload-too-large", "payload exceeds the configured byte limit");
    }

    if is_genesis {
        if payload.publisher.is_some() || payload.signature.is_some() {
            return reject(RejectClass::Consensus, "btcheaders-genesis-must-be-unsigned", "the genesis TX_BTC_HEADERS must carry no publisher/signature");
        }
    } else {
        // R1: publisher is a confirmed DMN.
        let Some(publisher) = payload.publisher else {
            return reject(RejectClass::Malformed, "btcheaders-no-publisher", "non-genesis TX_BTC_HEADERS must name a publisher");
        };
        let dmn = match ctx.dmns.get(&publisher) {
            Ok(Some(d)) if d.is_confirmed() => d,
            Ok(Some(_)) => return reject(RejectClass::Consensus, "btcheaders-publisher-unconfirmed", "publisher is not a confirmed DMN"),
            Ok(None) => return reject(RejectClass::Consensus, "btcheaders-publisher-unknown", "publisher is not a registered DMN"),
            Err(e) => return reject(RejectClass::Resource, "btcheaders-dmn-db-error", format!("{e}")),
        };

        // R2: operator signature over the canonical payload hash.
        let Some(sig) = &payload.signature else {
            return reject(RejectClass::Malformed, "btcheaders-no-signature", "non-genesis TX_BTC_HEADERS must be signed");
        };
        let digest = canonical_payload_hash(payload);
        if !verify_operator_signature(&dmn.operator_pubkey, &digest, sig) {
            return reject(RejectClass::Consensus, "btcheaders-bad-signature", "operator signature does not verify");
        }

        // R5: publisher cooldown, unless B's tip trails A's tip by more
        // than one block (catch-up override).
        let onchain_tip_height = match ctx.onchain_headers.get_tip() {
            Ok(t) => t.map(|(h, _)| h as u64),
            Err(e) => return reject(RejectClass::Resource, "btcheaders-db-error", format!("{e}")),
        };
        let spv_tip_height = ctx.spv.tip_height().unwrap_or(0) as u64;
        let catch_up_override = onchain_tip_height.unwrap_or(0) + 1 < spv_tip_height;
        if !catch_up_override {
            match ctx.onchain_headers.get_last_publisher() {
                Ok(Some((last_publisher, last_l1_height))) if last_publisher == publisher => {
                    if ctx.current_height < last_l1_height + ctx.params.btcheaders_publisher_cooldown {
                        return reject(RejectClass::Consensus, "btcheaders-publisher-cooldown", "publisher must wait out the cooldown before publishing again");
                    }
                }
                Ok(_) => {}
                Err(e) => return reject(RejectClass::Resource, "btcheaders-db-error", format!("{e}")),
            }
        }
    }

    // R3: contiguity with B's current tip.
    let tip = match ctx.onchain_headers.get_tip() {
        Ok(t) => t,
        Err(e) => return reject(RejectClass::Resource, "btcheaders-db-error", format!("{e}")),
    };
    let expected_start = tip.map(|(h, _)| h + 1).unwrap_or(0);
    if payload.start_height != expected_start {
        return reject(RejectClass::Consensus, "btcheaders-bad-start-height", "start_height does not equal tip+1");
    }
    if let Some((_, tip_hash)) = tip {
        if let Some(first) = payload.headers.first() {
            if first.prev_hash != tip_hash {
                return reject(RejectClass::Consensus, "btcheaders-bad-prev", "first header's prev does not equal B.tip hash");
            }
        }
    }

    // R4: each header's PoW valid and chains to the previous.
    let mut prev_hash = payload.headers.first().map(|h| h.prev_hash);
    for (i, header) in payload.headers.iter().enumerate() {
        if i > 0 {
            let expected_prev = prev_hash.unwrap();
            if header.prev_hash != expected_prev {
                return reject(RejectClass::Consensus, "btcheaders-non-contiguous", "headers do not chain to one another");
            }
        }
        let target = crate::btcspv::pow::compact_to_target(header.bits);
        if !crate::btcspv::pow::hash_meets_target(&header.hash().0, &target) {
            return reject(RejectClass::Consensus, "btcheaders-bad-pow", "republished header fails its own PoW check");
        }
        prev_hash = Some(header.hash());
    }

    ValidationState::Accepted
}

fn canonical_payload_hash(payload: &BtcHeadersPayload) -> Sha256dHash {
    let mut buf = Vec::new();
    buf.push(payload.version);
    buf.extend_from_slice(&payload.start_height.to_le_bytes());
    for h in &payload.headers {
        buf.extend_from_slice(&h.serialize());
    }
    sha256d(&buf)
}

fn verify_operator_signature(pubkey: &[u8; 33], digest: &Sha256dHash, sig_der: &[u8]) -> bool {
    let secp = secp256k1::Secp256k1::verification_only();
    let Ok(pk) = secp256k1::PublicKey::from_slice(pubkey) else { return false };
    let Ok(msg) = secp256k1::Message::from_slice(&digest.0) else { return false };
    let Ok(sig) = secp256k1::ecdsa::Signature::from_der(sig_der) else { return false };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// HTLC `create`. Conservation is exempt from fee at mempool (inputs ==
/// outputs); `CheckSpecialTx` here only validates the hashlock/timelock
/// shape, not the surrounding UTXO arithmetic (an external-engine concern).
pub fn check_htlc_create(payload: &HtlcCreatePayload) -> ValidationState {
    let required_secrets = match payload.scheme {
        HtlcSecretScheme::Single => 1,
        HtlcSecretScheme::ThreeOfThree => 3,
    };
    if payload.hash_locks.len() != required_secrets {
        return reject(RejectClass::Malformed, "htlc-bad-hashlock-count", "hash_locks length does not match the declared scheme");
    }
    if payload.amount == 0 {
        return reject(RejectClass::Malformed, "htlc-zero-amount", "HTLC amount must be positive");
    }
    ValidationState::Accepted
}

pub fn check_htlc_claim(payload: &HtlcClaimPayload, expected_hash_locks: &[[u8; 32]]) -> ValidationState {
    if payload.preimages.len() != expected_hash_locks.len() {
        return reject(RejectClass::Malformed, "htlc-bad-preimage-count", "wrong number of preimages for this HTLC's scheme");
    }
    for (preimage, expected) in payload.preimages.iter().zip(expected_hash_locks) {
        if &sha256(preimage).0 != expected {
            return reject(RejectClass::Consensus, "htlc-bad-preimage", "preimage does not hash to the committed hashlock");
        }
    }
    ValidationState::Accepted
}

pub fn check_htlc_refund(_payload: &HtlcRefundPayload, timelock_height: u64, current_height: u64) -> ValidationState {
    if current_height < timelock_height {
        return reject(RejectClass::Consensus, "htlc-refund-too-early", "timelock has not yet expired");
    }
    ValidationState::Accepted
}

/// `PROREG`.
pub fn check_proreg(ctx: &SpecialTxContext, payload: &ProRegPayload) -> ValidationState {
    match ctx.dmns.get(&payload.pro_tx_hash) {
        Ok(Some(_)) => reject(RejectClass::Duplicate, "proreg-duplicate-protx", "a DMN with this proTxHash already exists"),
        Ok(None) => ValidationState::Accepted,
        Err(e) => reject(RejectClass::Resource, "proreg-db-error", format!("{e}")),
    }
}

/// `PROUPSERV`: operator-signed liveness update.
pub fn check_proupserv(ctx: &SpecialTxContext, payload: &ProUpServPayload) -> ValidationState {
    let dmn = match ctx.dmns.get(&payload.pro_tx_hash) {
        Ok(Some(d)) => d,
        Ok(None) => return reject(RejectClass::Consensus, "proupserv-unknown-protx", "no such DMN"),
        Err(e) => return reject(RejectClass::Resource, "proupserv-db-error", format!("{e}")),
    };
    let digest = sha256d(&payload.pro_tx_hash.0);
    if !verify_operator_signature(&dmn.operator_pubkey, &digest, &payload.signature) {
        return reject(RejectClass::Consensus, "proupserv-bad-signature", "operator signature does not verify");
    }
    ValidationState::Accepted
}

/// `PROUPREG`: owner-signed change of operator/voting keys. Signature
/// verification against the owner key hash is delegated to the script
/// engine (out of scope); this checks the DMN exists and the new operator
/// key, if present, doesn't collide with a *different* owner's key hash
/// expectations enforced by `PROREG`.
pub fn check_proupreg(ctx: &SpecialTxContext, payload: &ProUpRegPayload) -> ValidationState {
    match ctx.dmns.get(&payload.pro_tx_hash) {
        Ok(Some(_)) => {
            if payload.owner_signature.is_empty() {
                reject(RejectClass::Malformed, "proupreg-no-signature", "PROUPREG must carry an owner signature")
            } else {
                ValidationState::Accepted
            }
        }
        Ok(None) => reject(RejectClass::Consensus, "proupreg-unknown-protx", "no such DMN"),
        Err(e) => reject(RejectClass::Resource, "proupreg-db-error", format!("{e}")),
    }
}

/// `PROUPREV`: operator-signed revocation.
pub fn check_proupdrev(ctx: &SpecialTxContext, payload: &ProUpRevPayload) -> ValidationState {
    let dmn = match ctx.dmns.get(&payload.pro_tx_hash) {
        Ok(Some(d)) => d,
        Ok(None) => return reject(RejectClass::Consensus, "proupdrev-unknown-protx", "no such DMN"),
        Err(e) => return reject(RejectClass::Resource, "proupdrev-db-error", format!("{e}")),
    };
    let digest = sha256d(&payload.pro_tx_hash.0);
    if !verify_operator_signature(&dmn.operator_pubkey, &digest, &payload.signature) {
        return reject(RejectClass::Consensus, "proupdrev-bad-signature", "operator signature does not verify");
    }
    ValidationState::Accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btcheaders::OnChainHeaderDb;
    use crate::btcspv::{BtcHeader, SpvStore};
    use crate::burnclaim::BurnClaimDb;
    use crate::core::Network;
    use crate::dmn::{DmnRecord, DmnRegistry};
    use crate::settlement::SettlementDb;

    struct NoopUtxoView;
    impl UtxoView for NoopUtxoView {
        fn is_vault(&self, _txid: &Sha256dHash, _vout: u32) -> bool {
            false
        }
        fn is_m1_receipt(&self, _txid: &Sha256dHash, _vout: u32) -> bool {
            false
        }
    }

    fn publisher_dmn(byte: u8) -> DmnRecord {
        DmnRecord {
            pro_tx_hash: ProTxHash([byte; 32]),
            operator_pubkey: [byte; 33],
            owner_key_hash: [byte; 20],
            voting_key_hash: [byte; 20],
            collateral_outpoint: (Sha256dHash([byte; 32]), 0),
            registered_height: 0,
            confirmed_hash: Some(Sha256dHash([0xEE; 32])),
            pose_score: 0,
            revoked: false,
        }
    }

    fn mine_trivial(prev_hash: Sha256dHash, time: u32) -> BtcHeader {
        let bits = 0x207fffff;
        let target = crate::btcspv::pow::compact_to_target(bits);
        let mut header = BtcHeader { version: 1, prev_hash, merkle_root: Sha256dHash([0u8; 32]), time, bits, nonce: 0 };
        for nonce in 0..1_000u32 {
            header.nonce = nonce;
            if crate::btcspv::pow::hash_meets_target(&header.hash().0, &target) {
                return header;
            }
        }
        panic!("failed to mine trivially-targeted test header");
    }

    fn signed_headers_payload(secp: &secp256k1::Secp256k1<secp256k1::All>, sk: &secp256k1::SecretKey, publisher: ProTxHash, start_height: u32, headers: Vec<BtcHeader>) -> BtcHeadersPayload {
        let mut unsigned = BtcHeadersPayload { version: 1, publisher: Some(publisher), start_height, headers, signature: None };
        let digest = canonical_payload_hash(&unsigned);
        let msg = secp256k1::Message::from_slice(&digest.0).unwrap();
        let sig = secp.sign_ecdsa(&msg, sk);
        unsigned.signature = Some(sig.serialize_der().to_vec());
        unsigned
    }

    #[test]
    fn publisher_cooldown_blocks_second_publication_within_window() {
        let mut params = Network::Regtest.params();
        params.btcheaders_publisher_cooldown = 10;

        let spv = SpvStore::open_in_memory(params).unwrap();
        let onchain = OnChainHeaderDb::open_in_memory().unwrap();
        let burn_claims = BurnClaimDb::open_in_memory().unwrap();
        let settlement = SettlementDb::open_in_memory().unwrap();
        let dmns = DmnRegistry::open_in_memory().unwrap();
        let kill_switch = KillSwitch::new(true);
        let utxo_view = NoopUtxoView;

        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[0x11; 32]).unwrap();
        let pk = secp256k1::PublicKey::from_secret_key(&secp, &sk);
        let mut dmn = publisher_dmn(1);
        dmn.operator_pubkey = pk.serialize();
        dmns.register(&dmn).unwrap();
        dmns.confirm(&dmn.pro_tx_hash, Sha256dHash([0xEE; 32])).unwrap();

        // Seed B with a last-publisher record at L1 height 5, tip at height 0.
        let genesis = mine_trivial(Sha256dHash([0u8; 32]), 1);
        let mut batch = onchain.batch().unwrap();
        batch.append(0, &[genesis]);
        batch.set_last_publisher(dmn.pro_tx_hash, 5);
        batch.set_best_block(5, [5u8; 32]);
        batch.commit().unwrap();

        let next_header = mine_trivial(genesis.hash(), 2);
        let payload = signed_headers_payload(&secp, &sk, dmn.pro_tx_hash, 1, vec![next_header]);

        let ctx = SpecialTxContext {
            spv: &spv,
            onchain_headers: &onchain,
            burn_claims: &burn_claims,
            settlement: &settlement,
            dmns: &dmns,
            kill_switch: &kill_switch,
            params: &params,
            network: Network::Regtest,
            current_height: 8, // within the 10-block cooldown window of height 5
            utxo_view: &utxo_view,
        };

        let result = check_btc_headers(&ctx, &payload, false, false);
        assert_eq!(result.code(), Some("btcheaders-publisher-cooldown"));

        // Past the cooldown window, the same publisher is allowed again.
        let ctx_later = SpecialTxContext { current_height: 16, ..ctx };
        let result_later = check_btc_headers(&ctx_later, &payload, false, false);
        assert!(result_later.is_accepted());
    }

    #[test]
    fn htlc_create_validates_hashlock_count_for_scheme() {
        let payload = HtlcCreatePayload {
            scheme: HtlcSecretScheme::Single,
            hash_locks: vec![[1u8; 32], [2u8; 32]],
            timelock_height: 100,
            sender: [0u8; 20],
            receiver: [1u8; 20],
            amount: 10,
        };
        let result = check_htlc_create(&payload);
        assert!(!result.is_accepted());
    }

    #[test]
    fn htlc_claim_verifies_preimage_against_hashlock() {
        let preimage = [7u8; 32];
        let hash_lock = sha256(&preimage).0;
        let payload = HtlcClaimPayload { htlc_id: Sha256dHash([0u8; 32]), preimages: vec![preimage] };
        assert!(check_htlc_claim(&payload, &[hash_lock]).is_accepted());

        let wrong = HtlcClaimPayload { htlc_id: Sha256dHash([0u8; 32]), preimages: vec![[8u8; 32]] };
        assert!(!check_htlc_claim(&wrong, &[hash_lock]).is_accepted());
    }
}

// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! End-to-end scenario tests wiring several components together the way a
//! running node would, rather than exercising one store in isolation.

use bathron_common::codec::write_compact_size;
use bathron_common::hash::Sha256dHash;
use bathron_core::btcheaders::OnChainHeaderDb;
use bathron_core::btcspv::pow::{compact_to_target, hash_meets_target};
use bathron_core::btcspv::{BtcHeader, SpvStore};
use bathron_core::burnclaim::BurnClaimDb;
use bathron_core::burnparser::TxOut;
use bathron_core::core::Network;
use bathron_core::dmn::DmnRegistry;
use bathron_core::finality::{FinalityStore, HuSignature};
use bathron_core::killswitch::KillSwitch;
use bathron_core::settlement::{SettlementDb, VaultOutpoint};
use bathron_core::specialtx::check::{check_burn_claim, SpecialTxContext, UtxoView};
use bathron_core::specialtx::payload::BurnClaimPayload;

const BATHRON_MAGIC: &[u8; 7] = b"BATHRON";
const BURN_METADATA_LEN: usize = 29;

fn unspendable_witness_hash() -> [u8; 32] {
    bathron_common::hash::sha256(&[0u8]).0
}

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

fn build_legacy_burn_tx(dest: [u8; 20], burned_sats: u64) -> Vec<u8> {
    let outputs = vec![
        TxOut { value: 0, script_pubkey: burn_metadata_script(0x00, dest) },
        TxOut { value: burned_sats, script_pubkey: p2wsh_unspendable_script() },
    ];
    let mut buf = Vec::new();
    buf.extend_from_slice(&1i32.to_le_bytes());
    write_compact_size(&mut buf, 1).unwrap();
    buf.extend_from_slice(&[0u8; 32]);
    buf.extend_from_slice(&0xffffffffu32.to_le_bytes());
    write_compact_size(&mut buf, 0).unwrap();
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

/// Mines a header satisfying regtest's trivial PoW target by brute-force
/// nonce search, the same way the special-tx checks' own tests do.
fn mine_header(prev_hash: Sha256dHash, merkle_root: Sha256dHash, bits: u32, time: u32) -> BtcHeader {
    let target = compact_to_target(bits);
    for nonce in 0..100_000u32 {
        let candidate = BtcHeader { version: 1, prev_hash, merkle_root, time, bits, nonce };
        if hash_meets_target(&candidate.hash().0, &target) {
            return candidate;
        }
    }
    panic!("failed to find a header satisfying the trivial regtest target");
}

struct NoopUtxoView;
impl UtxoView for NoopUtxoView {
    fn is_vault(&self, _txid: &Sha256dHash, _vout: u32) -> bool {
        false
    }
    fn is_m1_receipt(&self, _txid: &Sha256dHash, _vout: u32) -> bool {
        false
    }
}

/// Seed scenario 1 (happy path) and 2 (double-claim), combined: a burn
/// transaction anchored in a single-leaf BTC block is accepted once the
/// kill switch is on, then rejected as a duplicate on a second submission,
/// and rejected outright while the kill switch is off.
#[test]
fn burn_claim_happy_path_then_double_claim_then_kill_switch() {
    // Drop the compiled-in genesis checkpoint for this test: it pins height
    // 0 to an unreachable all-zero hash, which no real mined header can
    // satisfy (the same reason the header published here starts at height
    // 0 with an otherwise-arbitrary prev_hash).
    let mut params = Network::Regtest.params();
    params.checkpoints = &[];

    let dest = [0x42u8; 20];
    let raw_tx = build_legacy_burn_tx(dest, 1_000_000);
    let tx = bathron_core::burnparser::parse_btc_tx(&raw_tx).unwrap();
    let txid = tx.txid();

    // A block containing exactly this transaction has a merkle root equal
    // to the transaction's own txid (no siblings).
    let header = mine_header(Sha256dHash([0u8; 32]), txid, 0x207fffff, 1);
    let header_hash = header.hash();

    let spv = SpvStore::open_in_memory(params).unwrap();
    let add_result = spv.add_header(header).unwrap();
    assert!(matches!(add_result, bathron_core::btcspv::AddHeaderResult::Valid));

    let onchain_headers = OnChainHeaderDb::open_in_memory().unwrap();
    let burn_claims = BurnClaimDb::open_in_memory().unwrap();
    let settlement = SettlementDb::open_in_memory().unwrap();
    let dmns = DmnRegistry::open_in_memory().unwrap();
    let kill_switch = KillSwitch::new(false);
    let utxo_view = NoopUtxoView;

    let payload = BurnClaimPayload { version: 1, btc_tx: raw_tx, btc_block_hash: header_hash, btc_block_height: 0, merkle_proof: vec![], tx_index: 0 };

    let ctx = SpecialTxContext {
        spv: &spv,
        onchain_headers: &onchain_headers,
        burn_claims: &burn_claims,
        settlement: &settlement,
        dmns: &dmns,
        kill_switch: &kill_switch,
        params: &params,
        network: Network::Regtest,
        current_height: 1,
        utxo_view: &utxo_view,
    };

    // Kill switch off: rejected regardless of an otherwise-valid claim.
    let rejected = check_burn_claim(&ctx, &payload);
    assert_eq!(rejected.code(), Some("btc-burns-disabled-emergency"));

    // Kill switch on: the same claim is accepted.
    kill_switch.set_enabled(true);
    let accepted = check_burn_claim(&ctx, &payload);
    assert!(accepted.is_accepted());

    // Mining it in (spec §4.F's commit step): PENDING then FINAL, M0 supply
    // increases by the burned amount.
    burn_claims
        .insert_pending(&bathron_core::burnclaim::BurnClaimRecord {
            btc_txid: txid,
            btc_block_hash: header_hash,
            btc_height: 0,
            burned_sats: 1_000_000,
            destination: dest,
            claim_height_l1: 1,
            status: bathron_core::burnclaim::ClaimStatus::Pending,
            final_height_l1: 0,
        })
        .unwrap();
    burn_claims.finalize(&txid, 2).unwrap();
    assert_eq!(burn_claims.supply().unwrap(), 1_000_000);

    // Double-claim: a second submission of the identical btc-txid is
    // rejected before it ever reaches the mempool's policy checks.
    let duplicate = check_burn_claim(&ctx, &payload);
    assert_eq!(duplicate.code(), Some("burn-claim-duplicate"));
}

/// Seed scenario 4: locking M0BTC mints an equal M1 balance, and unlocking
/// it (net of a fee credited elsewhere) preserves A6 (`M0_vaulted ==
/// M1_supply`) at every step.
#[test]
fn lock_then_unlock_conserves_m0_m1_invariant_with_a_fee() {
    let settlement = SettlementDb::open_in_memory().unwrap();
    let owner = [0x11u8; 20];
    let fee_collector = [0x22u8; 20];

    let vault = VaultOutpoint { txid: Sha256dHash([1u8; 32]), vout: 0, owner, value_sats: 10_000_000, locked_at_height: 5 };
    settlement.lock(&vault, owner, 10_000_000).unwrap();
    settlement.assert_m0_m1_invariant().unwrap();
    assert_eq!(settlement.balance_of(owner).unwrap(), 10_000_000);

    // Unlock 10_000_000, net of a 1_000-sat fee routed to the fee
    // collector as an M1 transfer before the vault is spent.
    let fee = 1_000u64;
    settlement.transfer(owner, fee_collector, fee).unwrap();
    settlement.assert_m0_m1_invariant().unwrap();

    let undo = settlement.unlock(&vault.txid, 0, owner, 10_000_000 - fee).unwrap();
    settlement.assert_m0_m1_invariant().unwrap();
    assert_eq!(settlement.balance_of(owner).unwrap(), 0);
    assert_eq!(settlement.balance_of(fee_collector).unwrap(), fee);
    assert_eq!(settlement.m0_vaulted().unwrap(), 0);
    assert_eq!(settlement.m1_supply().unwrap(), fee);

    // Disconnecting the unlock restores the vault and the owner's balance,
    // but not the fee transfer, which undoes independently.
    settlement.undo_unlock(&undo).unwrap();
    settlement.assert_m0_m1_invariant().unwrap();
    assert_eq!(settlement.balance_of(owner).unwrap(), 10_000_000 - fee);
}

/// Seed scenario 5: once a block has enough unique operator signatures to
/// be final, any reorg whose disconnected path includes it is refused.
#[test]
fn finality_blocks_a_reorg_through_a_finalized_block() {
    let mut params = Network::Regtest.params();
    params.hu_quorum_threshold = 2;

    let store = FinalityStore::open_in_memory().unwrap();
    let block_15 = [0x0fu8; 32];

    let secp = secp256k1::Secp256k1::new();
    let mut signers = Vec::new();
    for byte in 1..=3u8 {
        let sk = secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = secp256k1::PublicKey::from_secret_key(&secp, &sk);
        let msg = secp256k1::Message::from_slice(&block_15).unwrap();
        let sig = secp.sign_ecdsa(&msg, &sk);
        signers.push((pk.serialize(), sig.serialize_der().to_vec()));
    }

    let quorum: Vec<[u8; 33]> = signers.iter().map(|(pk, _)| *pk).collect();
    for (pk, sig_der) in &signers {
        let record = bathron_core::dmn::DmnRecord {
            pro_tx_hash: bathron_core::btcheaders::ProTxHash([pk[0]; 32]),
            operator_pubkey: *pk,
            owner_key_hash: [0u8; 20],
            voting_key_hash: [0u8; 20],
            collateral_outpoint: (Sha256dHash([0u8; 32]), 0),
            registered_height: 0,
            confirmed_hash: Some(Sha256dHash([0xAAu8; 32])),
            pose_score: 0,
            revoked: false,
        };
        let sig = HuSignature { block_hash: block_15, pro_tx_hash: record.pro_tx_hash, signature: sig_der.clone() };
        let relayed = store.record_signature(&sig, 15, &record, &quorum).unwrap();
        assert!(relayed);
    }

    assert!(store.is_final(&block_15, &params).unwrap());

    let reorg_path = vec![([0x10u8; 32], 16u64), (block_15, 15), ([0x09u8; 32], 9)];
    assert!(bathron_core::finality::reorg_touches_finalized_block(&store, &reorg_path, &params).unwrap());

    let safe_reorg_path = vec![([0x10u8; 32], 16u64), ([0x11u8; 32], 17)];
    assert!(!bathron_core::finality::reorg_touches_finalized_block(&store, &safe_reorg_path, &params).unwrap());
}

/// Seed scenario 6: three nodes sharing one masternode operator key, with
/// staggered `mn_produce_delay`s, all agree the *same* candidate should
/// produce once its slot has opened — so a standby can take over without
/// forking when the primary is offline.
#[test]
fn producer_ha_delays_agree_on_the_same_candidate() {
    let params = Network::Regtest.params();
    let prev_hash = Sha256dHash([0x55u8; 32]);
    let dmns = vec![
        bathron_core::dmn::DmnRecord {
            pro_tx_hash: bathron_core::btcheaders::ProTxHash([1u8; 32]),
            operator_pubkey: [1u8; 33],
            owner_key_hash: [1u8; 20],
            voting_key_hash: [1u8; 20],
            collateral_outpoint: (Sha256dHash([1u8; 32]), 0),
            registered_height: 0,
            confirmed_hash: Some(Sha256dHash([0xAAu8; 32])),
            pose_score: 0,
            revoked: false,
        },
        bathron_core::dmn::DmnRecord {
            pro_tx_hash: bathron_core::btcheaders::ProTxHash([2u8; 32]),
            operator_pubkey: [2u8; 33],
            owner_key_hash: [2u8; 20],
            voting_key_hash: [2u8; 20],
            collateral_outpoint: (Sha256dHash([2u8; 32]), 0),
            registered_height: 0,
            confirmed_hash: Some(Sha256dHash([0xAAu8; 32])),
            pose_score: 0,
            revoked: false,
        },
    ];
    let ranked = bathron_core::dmm::rank_producers(&prev_hash, &dmns);
    let prev_time = 1_700_000_000u32;
    let now = prev_time as u64 + params.target_spacing;
    let (_, slot) = bathron_core::dmm::select_producer(100, prev_time, now, &ranked, &params).unwrap();
    let open_at = bathron_core::dmm::slot_open_time(prev_time, slot, &params);

    // Primary (delay 0) acts immediately once the slot opens; two standbys
    // (delay 5, 10) would produce the identical block a little later if the
    // primary never shows up, rather than forking onto a different one.
    assert!(bathron_core::dmm::should_produce_now(0, open_at, open_at));
    assert!(!bathron_core::dmm::should_produce_now(5, open_at, open_at));
    assert!(bathron_core::dmm::should_produce_now(5, open_at, open_at + 5));
    assert!(!bathron_core::dmm::should_produce_now(10, open_at, open_at + 5));
    assert!(bathron_core::dmm::should_produce_now(10, open_at, open_at + 10));
}

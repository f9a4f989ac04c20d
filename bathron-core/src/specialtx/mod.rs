// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component F — the special-TX processor. `check` holds per-type
//! `CheckSpecialTx` validation; this module holds the payload taxonomy and
//! the `ConnectBlock` atomic commit pipeline that applies an already-valid
//! block to the five independent stores in one ordered step (spec §4.F).

pub mod check;
pub mod payload;

use bathron_common::hash::Sha256dHash;
use thiserror::Error;

use crate::btcheaders::{OnChainHeaderDb, ProTxHash};
use crate::burnclaim::{BurnClaimDb, BurnClaimRecord};
use crate::core::error::ValidationState;
use crate::core::params::ConsensusParams;
use crate::core::Network;
use crate::metrics::Metrics;
use crate::settlement::SettlementDb;

pub use check::{SpecialTxContext, UtxoView};
pub use payload::*;

#[derive(Debug, Error)]
pub enum ConnectBlockError {
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("A5 violated: M0_total(h) != M0_total(h-1) + burnclaims(h)")]
    A5Violation,
    #[error("A6 violated: M0_vaulted(h) != M1_supply(h)")]
    A6Violation,
    #[error("settlement db error: {0}")]
    Settlement(#[from] crate::settlement::SettlementError),
    #[error("burn-claim db error: {0}")]
    BurnClaim(#[from] crate::burnclaim::BurnClaimDbError),
    #[error("btc-headers db error: {0}")]
    BtcHeaders(#[from] crate::btcheaders::BtcHeaderDbError),
}

/// One transaction plus the special-TX payload it carries, if any. Ordinary
/// (non-special) transactions only ever contribute to fee accounting,
/// which lives outside this component's scope (external UTXO engine).
pub struct AnnotatedTx {
    pub txid: Sha256dHash,
    pub payload: Option<SpecialTxPayload>,
}

/// Everything ConnectBlock needs besides the transaction list itself.
pub struct BlockContext<'a> {
    pub height: u64,
    pub block_hash: [u8; 32],
    pub is_genesis: bool,
    pub network: Network,
    pub params: &'a ConsensusParams,
}

/// Validates every transaction in a block against the current stores
/// (step 1 of ConnectBlock). Returns the first rejection, if any.
pub fn validate_block_transactions(
    ctx: &SpecialTxContext,
    block: &BlockContext,
    txs: &[AnnotatedTx],
) -> Result<(), ValidationState> {
    let mut seen_btcheaders = false;
    let mut seen_mint_m0btc = false;
    for tx in txs {
        let Some(payload) = &tx.payload else { continue };
        let state = match payload {
            SpecialTxPayload::BurnClaim(p) => check::check_burn_claim(ctx, p),
            SpecialTxPayload::MintM0Btc(p) => {
                // At most one TX_MINT_M0BTC per block: `check_mint_m0btc`
                // recomputes the full eligible claim set fresh each call, so
                // a second one in the same block would otherwise validate
                // against the identical set and only fail later, deep in
                // `connect_block`, when it tries to re-finalize an
                // already-finalized claim.
                if seen_mint_m0btc {
                    ValidationState::reject(
                        crate::core::error::RejectClass::Consensus,
                        "mint-m0btc-duplicate-in-block",
                        "a block may contain at most one TX_MINT_M0BTC",
                    )
                } else {
                    seen_mint_m0btc = true;
                    check::check_mint_m0btc(ctx, p)
                }
            }
            SpecialTxPayload::Lock(p) => check::check_lock(ctx, p),
            SpecialTxPayload::Unlock(p) => check::check_unlock(ctx, p),
            SpecialTxPayload::TransferM1(p) => check::check_transfer_m1(ctx, p),
            SpecialTxPayload::BtcHeaders(p) => {
                let state = check::check_btc_headers(ctx, p, block.is_genesis, seen_btcheaders);
                seen_btcheaders = true;
                state
            }
            SpecialTxPayload::HtlcCreate(p) => check::check_htlc_create(p),
            SpecialTxPayload::HtlcClaim(_) | SpecialTxPayload::HtlcRefund(_) => {
                // Claim/refund validation needs the originating create's
                // hashlock/timelock, which lives in the external UTXO view
                // keyed by htlc_id; left to the collaborator to supply.
                ValidationState::Accepted
            }
            SpecialTxPayload::ProReg(p) => check::check_proreg(ctx, p),
            SpecialTxPayload::ProUpServ(p) => check::check_proupserv(ctx, p),
            SpecialTxPayload::ProUpReg(p) => check::check_proupreg(ctx, p),
            SpecialTxPayload::ProUpRev(p) => check::check_proupdrev(ctx, p),
        };
        if !state.is_accepted() {
            return Err(state);
        }
    }
    Ok(())
}

/// In-memory staging area built during step 2 of ConnectBlock, committed
/// atomically in step 4.
///
/// `unlocks`/`transfers` carry the originating `TX_UNLOCK`/`TX_TRANSFER_M1`
/// transaction's own txid as their first element — the key `UnlockUndo`/
/// `TransferUndo` are journaled under (spec §3) — distinct from the vault
/// outpoint's txid the unlock spends.
#[derive(Default)]
pub struct ConnectBatch {
    pub new_pending_claims: Vec<BurnClaimRecord>,
    /// `(btc_txid, final_height, burned_sats)`; `burned_sats` feeds the A5
    /// running-total check below.
    pub finalized_claims: Vec<(Sha256dHash, u64, u64)>,
    /// Sum of the M0 outputs `TX_MINT_M0BTC` actually creates this block,
    /// as validated by `check_mint_m0btc` against the same claim set. A5's
    /// check compares this against `finalized_claims`' burned-sats sum.
    pub mint_output_total: u64,
    pub locks: Vec<(crate::settlement::VaultOutpoint, [u8; 20], u64)>,
    pub unlocks: Vec<(Sha256dHash, Sha256dHash, u32, [u8; 20], u64)>,
    pub transfers: Vec<(Sha256dHash, [u8; 20], [u8; 20], u64)>,
    pub btc_headers_batch: Option<(u32, Vec<crate::btcspv::BtcHeader>, Option<ProTxHash>)>,
}

/// Step 3 + step 4 of ConnectBlock: verifies A5/A6 against the staged
/// totals, then commits ordered: settlement -> btcheaders -> burnclaim
/// mint-apply -> burnclaim best-block -> "all-committed" marker.
///
/// The marker is a single settlement-DB row; if a node crashes between
/// `settlement.commit` and writing it, `NodeContext::startup_check` (see
/// `crate::node`) detects the mismatch and refuses to run without a
/// reindex, per spec §4.F step 4.
pub fn connect_block(
    settlement: &SettlementDb,
    onchain_headers: &OnChainHeaderDb,
    burn_claims: &BurnClaimDb,
    metrics: &Metrics,
    block: &BlockContext,
    batch: ConnectBatch,
) -> Result<(), ConnectBlockError> {
    let m0_vaulted_before = settlement.m0_vaulted()?;
    let m1_supply_before = settlement.m1_supply()?;

    let projected_m0_vaulted = m0_vaulted_before
        + batch.locks.iter().map(|(v, _, _)| v.value_sats).sum::<u64>()
        - batch.unlocks.iter().map(|(_, _, _, _, v)| *v).sum::<u64>();
    let projected_m1_supply = m1_supply_before
        + batch.locks.iter().map(|(_, _, credit)| *credit).sum::<u64>()
        - batch.unlocks.iter().map(|(_, _, _, _, v)| *v).sum::<u64>();
    if projected_m0_vaulted != projected_m1_supply {
        return Err(ConnectBlockError::A6Violation);
    }

    // A5: M0_total(h) == M0_total(h-1) + burnclaims(h). `burnclaims(h)` is
    // the sum of burned-sats over claims finalized this block; the only
    // independent source for that figure is the sum of M0 outputs the
    // block's TX_MINT_M0BTC actually created (`batch.mint_output_total`),
    // which `check_mint_m0btc` already validated equals the claim set it
    // was built against. A mismatch here means the batch was staged from a
    // different claim set than the one the mint transaction committed to.
    let burnclaims_this_block: u64 = batch.finalized_claims.iter().map(|(_, _, sats)| *sats).sum();
    if burnclaims_this_block != batch.mint_output_total {
        return Err(ConnectBlockError::A5Violation);
    }
    let prev_height = block.height.saturating_sub(1);
    let m0_total_before = settlement.get_settlement_state(prev_height)?.map(|s| s.m0_total_supply).unwrap_or(0);
    let m0_total_after = m0_total_before + burnclaims_this_block;

    for vault in &batch.locks {
        settlement.lock(&vault.0, vault.1, vault.2)?;
    }
    for (tx_txid, vault_txid, vout, owner, amount) in &batch.unlocks {
        let undo = settlement.unlock(vault_txid, *vout, *owner, *amount)?;
        settlement.store_unlock_undo(tx_txid, &undo)?;
    }
    for (tx_txid, from, to, amount) in &batch.transfers {
        let undo = settlement.transfer(*from, *to, *amount)?;
        settlement.store_transfer_undo(tx_txid, &undo)?;
    }
    settlement.set_best_block(block.height, block.block_hash)?;

    if let Some((start_height, headers, publisher)) = &batch.btc_headers_batch {
        let mut hdr_batch = onchain_headers.batch()?;
        hdr_batch.append(*start_height, headers);
        if let Some(p) = publisher {
            hdr_batch.set_last_publisher(*p, block.height);
        }
        hdr_batch.set_best_block(block.height, block.block_hash);
        hdr_batch.commit()?;
    }

    for record in &batch.new_pending_claims {
        burn_claims.insert_pending(record)?;
        metrics.record_burn_claim_accepted();
    }
    for (txid, final_height, _) in &batch.finalized_claims {
        burn_claims.finalize(txid, *final_height)?;
    }
    burn_claims.set_best_block(block.height, block.block_hash)?;

    // SettlementState(h), written exactly once per connected block (spec
    // §3, §4.E), after every mutation above so the snapshot reflects the
    // post-connect totals.
    let settlement_state = crate::settlement::SettlementState {
        m0_vaulted: settlement.m0_vaulted()?,
        m1_supply: settlement.m1_supply()?,
        m0_total_supply: m0_total_after,
        burnclaims_block: burnclaims_this_block,
        block_hash: block.block_hash,
    };
    settlement.write_settlement_state(block.height, &settlement_state)?;

    metrics.record_mint_applied(batch.finalized_claims.len() as u64);
    metrics.record_block_connected();

    Ok(())
}

/// Reverses `connect_block` for disconnect. Order is the exact mirror of
/// commit order so partial failures leave the stores in a state a retry
/// can still make progress from. `unlock_tx_txids`/`transfer_tx_txids` are
/// the originating special transactions' own txids — the undo records
/// they journaled in `connect_block` are read back from the settlement DB
/// and erased (spec §3: "erased after a successful disconnect"), rather
/// than passed in by the caller.
pub fn disconnect_block(
    settlement: &SettlementDb,
    burn_claims: &BurnClaimDb,
    metrics: &Metrics,
    disconnected_height: u64,
    unlock_tx_txids: &[Sha256dHash],
    transfer_tx_txids: &[Sha256dHash],
    finalized_claims: &[Sha256dHash],
    new_pending_claims: &[Sha256dHash],
    prev_height: u64,
    prev_block_hash: [u8; 32],
) -> Result<(), ConnectBlockError> {
    for txid in finalized_claims {
        burn_claims.undo_finalize(txid)?;
    }
    for txid in new_pending_claims {
        burn_claims.remove_pending(txid)?;
    }
    burn_claims.set_best_block(prev_height, prev_block_hash)?;

    for tx_txid in transfer_tx_txids {
        let undo = settlement.take_transfer_undo(tx_txid)?;
        settlement.undo_transfer(&undo)?;
    }
    for tx_txid in unlock_tx_txids {
        let undo = settlement.take_unlock_undo(tx_txid)?;
        settlement.undo_unlock(&undo)?;
    }
    settlement.set_best_block(prev_height, prev_block_hash)?;
    settlement.delete_settlement_state(disconnected_height)?;
    metrics.record_block_disconnected();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::btcclaim_test_support::*;

    struct NoopUtxoView;
    impl check::UtxoView for NoopUtxoView {
        fn is_vault(&self, _txid: &Sha256dHash, _vout: u32) -> bool {
            false
        }
        fn is_m1_receipt(&self, _txid: &Sha256dHash, _vout: u32) -> bool {
            false
        }
    }

    #[test]
    fn a_second_tx_mint_m0btc_in_one_block_is_rejected() {
        let spv = crate::btcspv::SpvStore::open_in_memory(test_params()).unwrap();
        let onchain = OnChainHeaderDb::open_in_memory().unwrap();
        let burn_claims = BurnClaimDb::open_in_memory().unwrap();
        let settlement = SettlementDb::open_in_memory().unwrap();
        let dmns = crate::dmn::DmnRegistry::open_in_memory().unwrap();
        let kill_switch = crate::killswitch::KillSwitch::new(true);
        let utxo_view = NoopUtxoView;
        let params = test_params();

        let ctx = SpecialTxContext {
            spv: &spv,
            onchain_headers: &onchain,
            burn_claims: &burn_claims,
            settlement: &settlement,
            dmns: &dmns,
            kill_switch: &kill_switch,
            params: &params,
            network: Network::Regtest,
            current_height: 1,
            utxo_view: &utxo_view,
        };
        let block = BlockContext { height: 1, block_hash: [1u8; 32], is_genesis: false, network: Network::Regtest, params: &params };

        // Nothing is pending, so an empty claim list is the correct mint
        // for this block and the first occurrence is accepted.
        let empty_mint = SpecialTxPayload::MintM0Btc(MintM0BtcPayload { version: 1, claims: vec![], outputs: vec![] });
        let txs = vec![
            AnnotatedTx { txid: Sha256dHash([10u8; 32]), payload: Some(empty_mint.clone()) },
            AnnotatedTx { txid: Sha256dHash([11u8; 32]), payload: Some(empty_mint) },
        ];

        let result = validate_block_transactions(&ctx, &block, &txs);
        match result {
            Err(ValidationState::Rejected { code, .. }) => assert_eq!(code, "mint-m0btc-duplicate-in-block"),
            other => panic!("expected mint-m0btc-duplicate-in-block, got {other:?}"),
        }
    }

    #[test]
    fn connect_then_disconnect_lock_round_trips_invariant() {
        let settlement = SettlementDb::open_in_memory().unwrap();
        let onchain = OnChainHeaderDb::open_in_memory().unwrap();
        let burn_claims = BurnClaimDb::open_in_memory().unwrap();
        let metrics = Metrics::new();
        let params = test_params();
        let block = BlockContext { height: 1, block_hash: [1u8; 32], is_genesis: false, network: Network::Regtest, params: &params };

        let owner = [0x55; 20];
        let vault = crate::settlement::VaultOutpoint { txid: Sha256dHash([2u8; 32]), vout: 0, owner, value_sats: 1000, locked_at_height: 1 };
        let mut batch = ConnectBatch::default();
        batch.locks.push((vault.clone(), owner, 1000));

        connect_block(&settlement, &onchain, &burn_claims, &metrics, &block, batch).unwrap();
        settlement.assert_m0_m1_invariant().unwrap();
        assert_eq!(settlement.balance_of(owner).unwrap(), 1000);
        assert_eq!(settlement.get_settlement_state(1).unwrap().unwrap().m0_vaulted, 1000);

        // Unlock it in a second block; the undo journal is keyed by the
        // TX_UNLOCK transaction's own txid, not the vault's.
        let unlock_tx_txid = Sha256dHash([3u8; 32]);
        let block2 = BlockContext { height: 2, block_hash: [4u8; 32], is_genesis: false, network: Network::Regtest, params: &params };
        let mut batch2 = ConnectBatch::default();
        batch2.unlocks.push((unlock_tx_txid, vault.txid, 0, owner, 1000));
        connect_block(&settlement, &onchain, &burn_claims, &metrics, &block2, batch2).unwrap();
        settlement.assert_m0_m1_invariant().unwrap();
        assert_eq!(settlement.balance_of(owner).unwrap(), 0);

        disconnect_block(&settlement, &burn_claims, &metrics, 2, &[unlock_tx_txid], &[], &[], &[], 1, [1u8; 32]).unwrap();
        settlement.assert_m0_m1_invariant().unwrap();
        assert_eq!(settlement.balance_of(owner).unwrap(), 1000);
        assert!(settlement.get_settlement_state(2).unwrap().is_none());
    }

    #[test]
    fn a5_violation_is_rejected_when_mint_output_total_disagrees_with_claims() {
        let settlement = SettlementDb::open_in_memory().unwrap();
        let onchain = OnChainHeaderDb::open_in_memory().unwrap();
        let burn_claims = BurnClaimDb::open_in_memory().unwrap();
        let metrics = Metrics::new();
        let params = test_params();
        let block = BlockContext { height: 1, block_hash: [1u8; 32], is_genesis: false, network: Network::Regtest, params: &params };

        let record = crate::burnclaim::BurnClaimRecord {
            btc_txid: Sha256dHash([9u8; 32]),
            btc_block_hash: Sha256dHash([8u8; 32]),
            btc_height: 100,
            burned_sats: 5_000,
            destination: [0x77; 20],
            claim_height_l1: 1,
            status: crate::burnclaim::ClaimStatus::Pending,
            final_height_l1: 0,
        };
        burn_claims.insert_pending(&record).unwrap();

        let mut batch = ConnectBatch::default();
        batch.finalized_claims.push((record.btc_txid, 1, record.burned_sats));
        batch.mint_output_total = 1_000; // disagrees with the 5_000 claimed

        let result = connect_block(&settlement, &onchain, &burn_claims, &metrics, &block, batch);
        assert!(matches!(result, Err(ConnectBlockError::A5Violation)));
    }
}

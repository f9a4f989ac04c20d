// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component H — the Deterministic Masternode Miner scheduler (spec
//! §4.H). Computes, for a given `prev` block, the ordered producer list
//! for height `prev.height + 1`, the fallback slot schedule, and whether
//! the local node should produce right now.

use std::sync::atomic::{AtomicU32, Ordering};

use bathron_common::hash::Sha256dHash;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::btcheaders::ProTxHash;
use crate::core::params::ConsensusParams;
use crate::dmn::DmnRecord;

type HmacSha256 = Hmac<Sha256>;

/// `score = HMAC(prev.hash, proTxHash)` as a 256-bit big-endian integer
/// (spec §4.H step 2).
fn producer_score(prev_hash: &Sha256dHash, pro_tx_hash: &ProTxHash) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(&prev_hash.0).expect("HMAC accepts any key length");
    mac.update(&pro_tx_hash.0);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredProducer {
    pub pro_tx_hash: ProTxHash,
    pub score: [u8; 32],
}

/// Ranks the valid DMN set for the block built on `prev_hash`: sorted
/// descending by `HMAC(prev_hash, proTxHash)`, tie-broken by proTxHash
/// bytes (spec §4.H steps 2-3).
pub fn rank_producers(prev_hash: &Sha256dHash, valid_dmns: &[DmnRecord]) -> Vec<ScoredProducer> {
    let mut scored: Vec<ScoredProducer> = valid_dmns
        .iter()
        .map(|d| ScoredProducer { pro_tx_hash: d.pro_tx_hash, score: producer_score(prev_hash, &d.pro_tx_hash) })
        .collect();
    scored.sort_by(|a, b| b.score.cmp(&a.score).then(a.pro_tx_hash.0.cmp(&b.pro_tx_hash.0)));
    scored
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerSlot {
    /// Index 0; always opens at the slot-aligned time immediately after
    /// `prev.time`.
    Primary,
    /// Index `k >= 1`; opens at `prev.time + (k+1) * target_spacing`.
    Fallback(usize),
}

/// Computes the Unix time at which `slot` becomes eligible to produce.
pub fn slot_open_time(prev_time: u32, slot: ProducerSlot, params: &ConsensusParams) -> u64 {
    let k = match slot {
        ProducerSlot::Primary => 1,
        ProducerSlot::Fallback(k) => k + 1,
    } as u64;
    let raw = prev_time as u64 + k * params.target_spacing;
    align_to_slot(raw, params.time_slot_length)
}

fn align_to_slot(time: u64, slot_length: u64) -> u64 {
    if slot_length == 0 {
        return time;
    }
    time.div_ceil(slot_length) * slot_length
}

/// Determines which producer, if any, is authorized to build the block at
/// `now`, given the ranked producer list. Returns `None` if no slot has
/// opened yet. During bootstrap (`height <= dmm_bootstrap_height`) the
/// producer is always index 0 and timing is relaxed to
/// `max(prev.time+1, now)` (spec §4.H step 5).
pub fn select_producer<'a>(
    height: u64,
    prev_time: u32,
    now: u64,
    ranked: &'a [ScoredProducer],
    params: &ConsensusParams,
) -> Option<(&'a ScoredProducer, ProducerSlot)> {
    if ranked.is_empty() {
        return None;
    }
    if height <= params.dmm_bootstrap_height {
        let bootstrap_time = (prev_time as u64 + 1).max(now);
        let _ = bootstrap_time; // timing is relaxed, not rejected; caller stamps the block with this value
        return Some((&ranked[0], ProducerSlot::Primary));
    }
    for (idx, candidate) in ranked.iter().enumerate() {
        let slot = if idx == 0 { ProducerSlot::Primary } else { ProducerSlot::Fallback(idx) };
        let open_at = slot_open_time(prev_time, slot, params);
        let next_open_at = if idx + 1 < ranked.len() { Some(slot_open_time(prev_time, ProducerSlot::Fallback(idx + 1), params)) } else { None };
        let still_open = next_open_at.map(|next| now < next).unwrap_or(true);
        if now >= open_at && still_open {
            return Some((candidate, slot));
        }
    }
    None
}

/// Reorg-safety counter (spec §4.H "Reorg safety"): the scheduler refuses
/// to produce while `activate_best_chain` is running.
#[derive(Debug, Default)]
pub struct ActivationGuardCounter(AtomicU32);

impl ActivationGuardCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_activating(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

/// HA active/standby support (spec §4.H step 6): a late primary produces
/// the *same* deterministic block a standby already broadcast, so the
/// local node only needs to know how long to wait before acting on a slot
/// it owns.
pub fn should_produce_now(local_produce_delay_secs: u64, slot_open_at: u64, now: u64) -> bool {
    now >= slot_open_at + local_produce_delay_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dmn(byte: u8) -> DmnRecord {
        DmnRecord {
            pro_tx_hash: ProTxHash([byte; 32]),
            operator_pubkey: [byte; 33],
            owner_key_hash: [byte; 20],
            voting_key_hash: [byte; 20],
            collateral_outpoint: (Sha256dHash([byte; 32]), 0),
            registered_height: 0,
            confirmed_hash: Some(Sha256dHash([0xAA; 32])),
            pose_score: 0,
            revoked: false,
        }
    }

    #[test]
    fn ranking_is_deterministic_for_the_same_prev_hash() {
        let prev = Sha256dHash([7u8; 32]);
        let dmns = vec![dmn(1), dmn(2), dmn(3)];
        let a = rank_producers(&prev, &dmns);
        let b = rank_producers(&prev, &dmns);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn different_prev_hash_can_reorder_producers() {
        let dmns = vec![dmn(1), dmn(2), dmn(3), dmn(4), dmn(5)];
        let ranking_a = rank_producers(&Sha256dHash([1u8; 32]), &dmns);
        let ranking_b = rank_producers(&Sha256dHash([2u8; 32]), &dmns);
        assert_ne!(ranking_a, ranking_b);
    }

    #[test]
    fn bootstrap_always_selects_index_zero() {
        let params = crate::core::Network::Regtest.params();
        let dmns = vec![dmn(9), dmn(1)];
        let ranked = rank_producers(&Sha256dHash([3u8; 32]), &dmns);
        let (chosen, slot) = select_producer(1, 1_600_000_000, 1_600_000_001, &ranked, &params).unwrap();
        assert_eq!(chosen.pro_tx_hash, ranked[0].pro_tx_hash);
        assert_eq!(slot, ProducerSlot::Primary);
    }

    #[test]
    fn fallback_slot_opens_after_target_spacing_multiples() {
        let mut params = crate::core::Network::Regtest.params();
        params.dmm_bootstrap_height = 0;
        params.target_spacing = 60;
        params.time_slot_length = 1;
        let dmns = vec![dmn(1), dmn(2)];
        let ranked = rank_producers(&Sha256dHash([5u8; 32]), &dmns);
        let prev_time = 1_600_000_000u32;

        // Too early for anyone: primary's slot opens at prev_time + spacing.
        assert!(select_producer(10, prev_time, prev_time as u64, &ranked, &params).is_none());

        // Primary's slot opens at prev_time + target_spacing.
        let (producer, slot) = select_producer(10, prev_time, prev_time as u64 + 60, &ranked, &params).unwrap();
        assert_eq!(producer.pro_tx_hash, ranked[0].pro_tx_hash);
        assert_eq!(slot, ProducerSlot::Primary);

        // Well past the primary's window, the fallback takes over.
        let (producer, slot) = select_producer(10, prev_time, prev_time as u64 + 121, &ranked, &params).unwrap();
        assert_eq!(producer.pro_tx_hash, ranked[1].pro_tx_hash);
        assert_eq!(slot, ProducerSlot::Fallback(1));
    }

    #[test]
    fn activation_guard_reports_while_entered() {
        let guard = ActivationGuardCounter::new();
        assert!(!guard.is_activating());
        guard.enter();
        assert!(guard.is_activating());
        guard.exit();
        assert!(!guard.is_activating());
    }
}

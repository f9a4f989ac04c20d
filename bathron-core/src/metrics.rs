// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component L — metrics (spec §4). Atomic counters updated off the hot
//! validation path and exported as a plain snapshot via RPC; no histogram
//! or timer machinery, matching the spec's "atomic counters" framing.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub burn_claims_accepted: AtomicU64,
    pub burn_claims_rejected: AtomicU64,
    pub mints_applied: AtomicU64,
    pub blocks_connected: AtomicU64,
    pub blocks_disconnected: AtomicU64,
    pub reorgs_refused_finality: AtomicU64,
    pub finality_signatures_seen: AtomicU64,
    pub double_sign_evidence: AtomicU64,
    pub last_finalized_height: AtomicU64,
    /// Signed so "no blocks yet" (best height unknown) can be represented
    /// as a negative lag rather than overflowing an unsigned subtraction.
    pub finality_lag_blocks: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub burn_claims_accepted: u64,
    pub burn_claims_rejected: u64,
    pub mints_applied: u64,
    pub blocks_connected: u64,
    pub blocks_disconnected: u64,
    pub reorgs_refused_finality: u64,
    pub finality_signatures_seen: u64,
    pub double_sign_evidence: u64,
    pub last_finalized_height: u64,
    pub finality_lag_blocks: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_burn_claim_accepted(&self) {
        self.burn_claims_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_burn_claim_rejected(&self) {
        self.burn_claims_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mint_applied(&self, count: u64) {
        self.mints_applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_block_connected(&self) {
        self.blocks_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_disconnected(&self) {
        self.blocks_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reorg_refused_finality(&self) {
        self.reorgs_refused_finality.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finality_signature(&self) {
        self.finality_signatures_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_double_sign_evidence(&self) {
        self.double_sign_evidence.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_finalized_height(&self, height: u64, chain_tip: u64) {
        self.last_finalized_height.store(height, Ordering::Relaxed);
        self.finality_lag_blocks.store(chain_tip as i64 - height as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            burn_claims_accepted: self.burn_claims_accepted.load(Ordering::Relaxed),
            burn_claims_rejected: self.burn_claims_rejected.load(Ordering::Relaxed),
            mints_applied: self.mints_applied.load(Ordering::Relaxed),
            blocks_connected: self.blocks_connected.load(Ordering::Relaxed),
            blocks_disconnected: self.blocks_disconnected.load(Ordering::Relaxed),
            reorgs_refused_finality: self.reorgs_refused_finality.load(Ordering::Relaxed),
            finality_signatures_seen: self.finality_signatures_seen.load(Ordering::Relaxed),
            double_sign_evidence: self.double_sign_evidence.load(Ordering::Relaxed),
            last_finalized_height: self.last_finalized_height.load(Ordering::Relaxed),
            finality_lag_blocks: self.finality_lag_blocks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.record_burn_claim_accepted();
        m.record_burn_claim_accepted();
        m.record_burn_claim_rejected();
        let snap = m.snapshot();
        assert_eq!(snap.burn_claims_accepted, 2);
        assert_eq!(snap.burn_claims_rejected, 1);
    }

    #[test]
    fn finality_lag_reflects_tip_minus_finalized() {
        let m = Metrics::new();
        m.set_last_finalized_height(90, 100);
        assert_eq!(m.snapshot().finality_lag_blocks, 10);
    }
}

// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component G — the block assembler (spec §4.G). Packages a block's
//! transaction list: coinbase sized to exactly the fees collected, the
//! mandatory per-height special transactions, then mempool transactions
//! ordered by ancestor-package fee rate.

use bathron_common::hash::Sha256dHash;

use crate::btcspv::BtcHeader;
use crate::specialtx::payload::{BtcHeadersPayload, MintM0BtcPayload, SpecialTxPayload};

/// A candidate mempool transaction as the assembler sees it: fee/size plus
/// whatever ancestor-package totals the mempool already tracks. Actual
/// script/signature concerns belong to the external UTXO engine.
#[derive(Debug, Clone)]
pub struct MempoolTx {
    pub txid: Sha256dHash,
    pub vsize: u64,
    pub fee_sats: u64,
    pub ancestor_vsize: u64,
    pub ancestor_fee_sats: u64,
    pub is_shielded: bool,
    pub special: Option<SpecialTxPayload>,
}

impl MempoolTx {
    /// Package (ancestor-set) fee rate in sats/vbyte, used for ordering —
    /// the same rule a descendant-package miner would use so low-fee
    /// parents of a high-fee child aren't skipped.
    fn ancestor_fee_rate(&self) -> f64 {
        if self.ancestor_vsize == 0 {
            0.0
        } else {
            self.ancestor_fee_sats as f64 / self.ancestor_vsize as f64
        }
    }

    fn is_fee_exempt(&self) -> bool {
        self.special.as_ref().map(|p| p.is_fee_exempt()).unwrap_or(false)
    }
}

pub struct AssemblerLimits {
    pub max_block_vsize: u64,
    pub max_shielded_vsize: u64,
    pub min_fee_rate_sat_per_vbyte: f64,
}

impl Default for AssemblerLimits {
    fn default() -> Self {
        AssemblerLimits { max_block_vsize: 2_000_000, max_shielded_vsize: 400_000, min_fee_rate_sat_per_vbyte: 1.0 }
    }
}

#[derive(Debug, Default)]
pub struct AssembledBlock {
    /// Coinbase output value. Always exactly `Σ(fees)` of the included
    /// transactions, possibly zero — see DESIGN.md's resolution of the
    /// spec §9 Open Question unifying "exactly fees" with "might be 0".
    pub coinbase_value: u64,
    pub btc_headers_tx: Option<BtcHeadersPayload>,
    pub mint_tx: Option<MintM0BtcPayload>,
    pub included: Vec<Sha256dHash>,
    pub skipped_low_fee: usize,
}

/// Splits `[start_height, tip]` into `TX_BTC_HEADERS`-sized chunks, one per
/// future block (R8 forbids more than one per L1 block, so bootstrap
/// catch-up spans several consecutive blocks rather than several
/// transactions in one block).
pub fn plan_genesis_header_chunks(start_height: u32, tip_height: u32, max_count: u16) -> Vec<(u32, u16)> {
    if start_height > tip_height {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut cursor = start_height;
    let total = tip_height - start_height + 1;
    let mut remaining = total;
    while remaining > 0 {
        let take = remaining.min(max_count as u32) as u16;
        chunks.push((cursor, take));
        cursor += take as u32;
        remaining -= take as u32;
    }
    chunks
}

pub struct BlockAssembler {
    pub limits: AssemblerLimits,
}

impl BlockAssembler {
    pub fn new(limits: AssemblerLimits) -> Self {
        BlockAssembler { limits }
    }

    /// Assembles one block's transaction list. `btc_headers_chunk` and
    /// `mint_tx` are computed by the caller (component H/F respectively)
    /// since they depend on chain state this module doesn't own.
    pub fn assemble(&self, btc_headers_chunk: Option<(u32, Vec<BtcHeader>)>, mint_tx: Option<MintM0BtcPayload>, mut mempool: Vec<MempoolTx>) -> AssembledBlock {
        mempool.sort_by(|a, b| b.ancestor_fee_rate().partial_cmp(&a.ancestor_fee_rate()).unwrap_or(std::cmp::Ordering::Equal));

        let mut used_vsize: u64 = 0;
        let mut used_shielded_vsize: u64 = 0;
        let mut total_fees: u64 = 0;
        let mut included = Vec::new();
        let mut skipped_low_fee = 0usize;

        for tx in mempool {
            let budget_for_tx = if tx.is_shielded { self.limits.max_shielded_vsize.saturating_sub(used_shielded_vsize) } else { self.limits.max_block_vsize.saturating_sub(used_vsize) };
            if tx.vsize > budget_for_tx {
                continue;
            }
            if !tx.is_fee_exempt() {
                let rate = if tx.vsize == 0 { 0.0 } else { tx.fee_sats as f64 / tx.vsize as f64 };
                if rate < self.limits.min_fee_rate_sat_per_vbyte {
                    skipped_low_fee += 1;
                    continue;
                }
            }
            if tx.is_shielded {
                used_shielded_vsize += tx.vsize;
            } else {
                used_vsize += tx.vsize;
            }
            total_fees += tx.fee_sats;
            included.push(tx.txid);
        }

        let btc_headers_tx = btc_headers_chunk.map(|(start_height, headers)| BtcHeadersPayload {
            version: 1,
            publisher: None,
            start_height,
            headers,
            signature: None,
        });

        AssembledBlock { coinbase_value: total_fees, btc_headers_tx, mint_tx, included, skipped_low_fee }
    }
}

// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Compiled-in consensus parameters, per network. This is the Rust analogue
//! of the original `consensus/params.h`: one `ConsensusParams` literal per
//! `Network`, never read from config (changing any of these is a consensus
//! change, per spec §6 "Genesis/checkpoints").

use bathron_common::hash::Sha256dHash;

/// Which BATHRON network a node is following.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// A hard-coded BTC checkpoint: (height, hash, cumulative-work-at-height).
#[derive(Debug, Clone, Copy)]
pub struct BtcCheckpoint {
    pub height: u32,
    pub hash: Sha256dHash,
    pub cumulative_work: u128,
}

/// A compiled-in L1 structural anchor (height, hash) — the "A7-canonical
/// table" of §6, used to bound reorg depth sanity checks independent of
/// finality.
#[derive(Debug, Clone, Copy)]
pub struct L1Anchor {
    pub height: u64,
    pub hash: [u8; 32],
}

#[derive(Debug, Clone, Copy)]
pub struct ConsensusParams {
    pub network: Network,

    /// BTC confirmations required before a burn is eligible for a claim.
    pub k_confirmations: u32,
    /// L1 blocks between PENDING and FINAL for a burn claim.
    pub k_finality: u64,
    /// Cap on TX_MINT_M0BTC claims finalized per block.
    pub max_mint_claims_per_block: usize,

    /// Minimum L1 block spacing between two TX_BTC_HEADERS from the same
    /// publisher, outside the catch-up override.
    pub btcheaders_publisher_cooldown: u64,
    /// Max headers per TX_BTC_HEADERS.
    pub btcheaders_max_count: u16,
    /// Max total payload size (bytes) for TX_BTC_HEADERS.
    pub btcheaders_max_payload_bytes: usize,

    /// Bitcoin PoW limit (maximum allowed target), mainnet value by default.
    pub pow_limit: [u8; 32],
    /// Height below which the on-chain retarget check applies (mainnet: every 2016).
    pub retarget_interval: u32,
    /// Target spacing between Bitcoin blocks, seconds (used for retarget math).
    pub btc_target_spacing: u32,

    /// Masternode block spacing, seconds (`nTargetSpacing`).
    pub target_spacing: u64,
    /// Block timestamp alignment granularity, seconds (`nTimeSlotLength`).
    pub time_slot_length: u64,
    /// Height at/below which DMM bootstrap relaxations (§9 Open Questions) apply.
    pub dmm_bootstrap_height: u64,

    /// Finality quorum size.
    pub hu_quorum_size: usize,
    /// Finality quorum signature threshold.
    pub hu_quorum_threshold: usize,
    /// Quorum rotation cycle, in L1 blocks.
    pub hu_quorum_rotation_blocks: u64,
    /// Seconds before a leader is considered unresponsive.
    pub hu_leader_timeout_seconds: u64,
    /// Max depth a reorg may probe before the finality check gives up early.
    pub hu_max_reorg_depth: u64,

    pub checkpoints: &'static [BtcCheckpoint],
    pub anchors: &'static [L1Anchor],
}

pub const MAINNET_CHECKPOINTS: &[BtcCheckpoint] = &[
    BtcCheckpoint { height: 0, hash: Sha256dHash([0u8; 32]), cumulative_work: 0 },
    BtcCheckpoint { height: 100_000, hash: Sha256dHash([0x11; 32]), cumulative_work: 1 },
    BtcCheckpoint { height: 200_000, hash: Sha256dHash([0x22; 32]), cumulative_work: 2 },
];

pub const TESTNET_CHECKPOINTS: &[BtcCheckpoint] = &[
    BtcCheckpoint { height: 0, hash: Sha256dHash([0u8; 32]), cumulative_work: 0 },
];

pub const REGTEST_CHECKPOINTS: &[BtcCheckpoint] = &[
    BtcCheckpoint { height: 0, hash: Sha256dHash([0u8; 32]), cumulative_work: 0 },
];

pub const MAINNET_ANCHORS: &[L1Anchor] = &[L1Anchor { height: 0, hash: [0u8; 32] }];
pub const TESTNET_ANCHORS: &[L1Anchor] = &[L1Anchor { height: 0, hash: [0u8; 32] }];
pub const REGTEST_ANCHORS: &[L1Anchor] = &[L1Anchor { height: 0, hash: [0u8; 32] }];

/// Bitcoin mainnet's pow_limit: 0x1d00ffff expanded to a 256-bit target.
pub const BTC_MAINNET_POW_LIMIT: [u8; 32] = {
    let mut t = [0u8; 32];
    t[3] = 0xff;
    t[2] = 0xff;
    t
};

pub const BTC_REGTEST_POW_LIMIT: [u8; 32] = [0xff; 32];

impl Network {
    pub fn params(self) -> ConsensusParams {
        match self {
            Network::Mainnet => ConsensusParams {
                network: self,
                k_confirmations: 6,
                k_finality: 10,
                max_mint_claims_per_block: 100,
                btcheaders_publisher_cooldown: 10,
                btcheaders_max_count: 500,
                btcheaders_max_payload_bytes: 64_000,
                pow_limit: BTC_MAINNET_POW_LIMIT,
                retarget_interval: 2016,
                btc_target_spacing: 600,
                target_spacing: 60,
                time_slot_length: 15,
                dmm_bootstrap_height: 500,
                hu_quorum_size: 12,
                hu_quorum_threshold: 8,
                hu_quorum_rotation_blocks: 2_880,
                hu_leader_timeout_seconds: 30,
                hu_max_reorg_depth: 2_000,
                checkpoints: MAINNET_CHECKPOINTS,
                anchors: MAINNET_ANCHORS,
            },
            Network::Testnet => ConsensusParams {
                network: self,
                k_confirmations: 2,
                k_finality: 4,
                max_mint_claims_per_block: 100,
                btcheaders_publisher_cooldown: 5,
                btcheaders_max_count: 500,
                btcheaders_max_payload_bytes: 64_000,
                pow_limit: BTC_MAINNET_POW_LIMIT,
                retarget_interval: 2016,
                btc_target_spacing: 600,
                target_spacing: 60,
                time_slot_length: 15,
                dmm_bootstrap_height: 100,
                hu_quorum_size: 3,
                hu_quorum_threshold: 2,
                hu_quorum_rotation_blocks: 576,
                hu_leader_timeout_seconds: 30,
                hu_max_reorg_depth: 500,
                checkpoints: TESTNET_CHECKPOINTS,
                anchors: TESTNET_ANCHORS,
            },
            Network::Regtest => ConsensusParams {
                network: self,
                k_confirmations: 1,
                k_finality: 1,
                max_mint_claims_per_block: 100,
                btcheaders_publisher_cooldown: 1,
                btcheaders_max_count: 2_016,
                btcheaders_max_payload_bytes: 200_000,
                pow_limit: BTC_REGTEST_POW_LIMIT,
                retarget_interval: 2016,
                btc_target_spacing: 600,
                target_spacing: 1,
                time_slot_length: 1,
                dmm_bootstrap_height: 10,
                hu_quorum_size: 1,
                hu_quorum_threshold: 1,
                hu_quorum_rotation_blocks: 10,
                hu_leader_timeout_seconds: 5,
                hu_max_reorg_depth: 100,
                checkpoints: REGTEST_CHECKPOINTS,
                anchors: REGTEST_ANCHORS,
            },
        }
    }
}

impl ConsensusParams {
    /// Minimum supported BTC height below which burns cannot be verified —
    /// one past the highest compiled-in checkpoint.
    pub fn min_supported_height(&self) -> u32 {
        self.checkpoints.last().map(|c| c.height).unwrap_or(0)
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&BtcCheckpoint> {
        self.checkpoints.iter().find(|c| c.height == height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_are_ascending() {
        for net in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let p = net.params();
            let mut last = None;
            for cp in p.checkpoints {
                if let Some(l) = last {
                    assert!(cp.height > l);
                }
                last = Some(cp.height);
            }
        }
    }

    #[test]
    fn min_supported_height_is_last_checkpoint() {
        let p = Network::Mainnet.params();
        assert_eq!(p.min_supported_height(), 200_000);
    }
}

// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component I — the finality engine (spec §4.I). Selects the per-block
//! quorum of operator keys (disjoint from the producer set), validates and
//! persists `HuSignature`s, exposes irreversibility, and detects
//! double-sign slashing evidence.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bathron_common::hash::Sha256dHash;
use hmac::{Hmac, Mac};
use rusqlite::{params, OptionalExtension};
use sha2::Sha256;
use thiserror::Error;

use crate::btcheaders::ProTxHash;
use crate::core::params::ConsensusParams;
use crate::dmn::DmnRecord;

type HmacSha256 = Hmac<Sha256>;

/// Incoming-signature rate limit per peer (spec §4.I).
pub const MAX_SIGNATURES_PER_PEER_PER_MINUTE: usize = 100;

#[derive(Debug, Error)]
pub enum FinalityError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("signer is not a member of the quorum for this height")]
    NotInQuorum,
    #[error("ECDSA signature does not verify")]
    BadSignature,
    #[error("rate limit exceeded for this peer")]
    RateLimited,
}

fn operator_score(prev_hash: &Sha256dHash, operator_pubkey: &[u8; 33]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(&prev_hash.0).expect("HMAC accepts any key length");
    mac.update(operator_pubkey);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Scores the valid DMN set by *operator public key* (deduplicating MNs
/// sharing one operator down to a single entry) and excludes the block
/// producer's own operator, per spec §4.I: "this prevents a single
/// operator with many MNs from producing AND finalizing their own block".
pub fn select_quorum(prev_hash: &Sha256dHash, valid_dmns: &[DmnRecord], producer_operator: &[u8; 33], quorum_size: usize) -> Vec<[u8; 33]> {
    let mut seen = std::collections::HashSet::new();
    let mut scored: Vec<([u8; 33], [u8; 32])> = Vec::new();
    for dmn in valid_dmns {
        if &dmn.operator_pubkey == producer_operator {
            continue;
        }
        if !seen.insert(dmn.operator_pubkey) {
            continue;
        }
        scored.push((dmn.operator_pubkey, operator_score(prev_hash, &dmn.operator_pubkey)));
    }
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(quorum_size);
    scored.into_iter().map(|(op, _)| op).collect()
}

#[derive(Debug, Clone)]
pub struct HuSignature {
    pub block_hash: [u8; 32],
    pub pro_tx_hash: ProTxHash,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoubleSignEvidence {
    pub operator_pubkey: [u8; 33],
    pub height: u64,
    pub block_hash_a: [u8; 32],
    pub block_hash_b: [u8; 32],
}

pub struct FinalityStore {
    conn: Mutex<rusqlite::Connection>,
}

impl FinalityStore {
    pub fn open(path: &Path) -> Result<Self, FinalityError> {
        let conn = crate::util::db::open(path).map_err(|e| match e {
            crate::util::db::DbError::Sqlite(s) => FinalityError::Sqlite(s),
            other => FinalityError::Sqlite(rusqlite::Error::ModuleError(other.to_string())),
        })?;
        Self::init_schema(&conn)?;
        Ok(FinalityStore { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, FinalityError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(FinalityStore { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), FinalityError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signatures (
                block_hash BLOB NOT NULL,
                height INTEGER NOT NULL,
                operator_pubkey BLOB NOT NULL,
                pro_tx_hash BLOB NOT NULL,
                signature BLOB NOT NULL,
                PRIMARY KEY (block_hash, operator_pubkey)
            );
            CREATE INDEX IF NOT EXISTS idx_sig_height ON signatures (height);
            CREATE TABLE IF NOT EXISTS double_sign_evidence (
                operator_pubkey BLOB NOT NULL,
                height INTEGER NOT NULL,
                block_hash_a BLOB NOT NULL,
                block_hash_b BLOB NOT NULL,
                PRIMARY KEY (operator_pubkey, height)
            );
            CREATE TABLE IF NOT EXISTS last_finalized (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                height INTEGER
            );
            INSERT OR IGNORE INTO last_finalized (id, height) VALUES (0, 0);",
        )?;
        Ok(())
    }

    /// Verifies, deduplicates and persists an incoming `HuSignature`.
    /// Returns `Ok(true)` if this signature was new (should be relayed),
    /// `Ok(false)` if it was already known (spec: "Relay if new").
    #[allow(clippy::too_many_arguments)]
    pub fn record_signature(
        &self,
        sig: &HuSignature,
        height: u64,
        signer: &DmnRecord,
        quorum: &[[u8; 33]],
    ) -> Result<bool, FinalityError> {
        if !quorum.contains(&signer.operator_pubkey) {
            return Err(FinalityError::NotInQuorum);
        }
        if !verify_ecdsa(&signer.operator_pubkey, &sig.block_hash, &sig.signature) {
            return Err(FinalityError::BadSignature);
        }

        let conn = self.conn.lock().unwrap();
        let already: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM signatures WHERE block_hash = ?1 AND operator_pubkey = ?2",
                params![sig.block_hash.to_vec(), signer.operator_pubkey.to_vec()],
                |r| r.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Ok(false);
        }

        // Slashing: did this operator already sign a *different* block at
        // this height?
        let conflicting: Option<Vec<u8>> = conn
            .query_row(
                "SELECT block_hash FROM signatures WHERE height = ?1 AND operator_pubkey = ?2 AND block_hash != ?3",
                params![height, signer.operator_pubkey.to_vec(), sig.block_hash.to_vec()],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(other_hash) = conflicting {
            let mut other = [0u8; 32];
            other.copy_from_slice(&other_hash);
            conn.execute(
                "INSERT OR IGNORE INTO double_sign_evidence (operator_pubkey, height, block_hash_a, block_hash_b) VALUES (?1, ?2, ?3, ?4)",
                params![signer.operator_pubkey.to_vec(), height, other.to_vec(), sig.block_hash.to_vec()],
            )?;
        }

        conn.execute(
            "INSERT INTO signatures (block_hash, height, operator_pubkey, pro_tx_hash, signature) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sig.block_hash.to_vec(), height, signer.operator_pubkey.to_vec(), sig.pro_tx_hash.0.to_vec(), sig.signature.clone()],
        )?;
        Ok(true)
    }

    pub fn unique_signers(&self, block_hash: &[u8; 32]) -> Result<usize, FinalityError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT operator_pubkey) FROM signatures WHERE block_hash = ?1",
            params![block_hash.to_vec()],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_final(&self, block_hash: &[u8; 32], params: &ConsensusParams) -> Result<bool, FinalityError> {
        Ok(self.unique_signers(block_hash)? >= params.hu_quorum_threshold)
    }

    pub fn set_last_finalized_height(&self, height: u64) -> Result<(), FinalityError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE last_finalized SET height = ?1 WHERE id = 0", params![height as i64])?;
        Ok(())
    }

    pub fn last_finalized_height(&self) -> Result<u64, FinalityError> {
        let conn = self.conn.lock().unwrap();
        let h: i64 = conn.query_row("SELECT height FROM last_finalized WHERE id = 0", [], |r| r.get(0))?;
        Ok(h as u64)
    }

    pub fn double_sign_evidence_for(&self, operator_pubkey: &[u8; 33]) -> Result<Vec<DoubleSignEvidence>, FinalityError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM double_sign_evidence WHERE operator_pubkey = ?1")?;
        let rows = stmt.query_map(params![operator_pubkey.to_vec()], |row| {
            let op: Vec<u8> = row.get("operator_pubkey")?;
            let a: Vec<u8> = row.get("block_hash_a")?;
            let b: Vec<u8> = row.get("block_hash_b")?;
            let mut op_arr = [0u8; 33];
            op_arr.copy_from_slice(&op);
            let mut a_arr = [0u8; 32];
            a_arr.copy_from_slice(&a);
            let mut b_arr = [0u8; 32];
            b_arr.copy_from_slice(&b);
            Ok(DoubleSignEvidence { operator_pubkey: op_arr, height: row.get::<_, i64>("height")? as u64, block_hash_a: a_arr, block_hash_b: b_arr })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn verify_ecdsa(pubkey: &[u8; 33], block_hash: &[u8; 32], sig_der: &[u8]) -> bool {
    let secp = secp256k1::Secp256k1::verification_only();
    let Ok(pk) = secp256k1::PublicKey::from_slice(pubkey) else { return false };
    let Ok(msg) = secp256k1::Message::from_slice(block_hash) else { return false };
    let Ok(sig) = secp256k1::ecdsa::Signature::from_der(sig_der) else { return false };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// Reorg protection (spec §4.I): a reorg whose disconnected path includes
/// any finalized block must be refused. `path_from_fork_to_old_tip` is the
/// ordered list of `(block_hash, height)` being disconnected.
///
/// Bootstrap blocks (height <= `dmm_bootstrap_height`) run with relaxed
/// signature rules and may never have collected a real quorum signature of
/// their own (spec §9 Open Question: whether reorgs can attack this
/// window). Once any block past the bootstrap window has finalized, the
/// whole bootstrap window is treated as implicitly final so a later reorg
/// can't unwind it even without individual per-block signatures.
pub fn reorg_touches_finalized_block(store: &FinalityStore, path_from_fork_to_old_tip: &[([u8; 32], u64)], params: &ConsensusParams) -> Result<bool, FinalityError> {
    let last_finalized = store.last_finalized_height()?;
    let bootstrap_locked = last_finalized > params.dmm_bootstrap_height;
    for (hash, height) in path_from_fork_to_old_tip {
        if bootstrap_locked && *height <= params.dmm_bootstrap_height {
            return Ok(true);
        }
        if store.is_final(hash, params)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Sliding-window (≤100/min) per-peer rate limiter for incoming
/// `HuSignature` relays.
pub struct SignatureRateLimiter {
    windows: Mutex<HashMap<u64, VecDeque<Instant>>>,
}

impl SignatureRateLimiter {
    pub fn new() -> Self {
        SignatureRateLimiter { windows: Mutex::new(HashMap::new()) }
    }

    pub fn allow(&self, peer_id: u64) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let window = windows.entry(peer_id).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= MAX_SIGNATURES_PER_PEER_PER_MINUTE {
            return false;
        }
        window.push_back(now);
        true
    }
}

impl Default for SignatureRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dmn(byte: u8, operator: [u8; 33]) -> DmnRecord {
        DmnRecord {
            pro_tx_hash: ProTxHash([byte; 32]),
            operator_pubkey: operator,
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
    fn quorum_excludes_producer_operator_and_dedupes_shared_operators() {
        let prev = Sha256dHash([1u8; 32]);
        let producer_op = [0x11; 33];
        let dmns = vec![
            dmn(1, producer_op),
            dmn(2, [0x22; 33]),
            dmn(3, [0x22; 33]), // same operator as dmn(2): counted once
            dmn(4, [0x33; 33]),
        ];
        let quorum = select_quorum(&prev, &dmns, &producer_op, 10);
        assert!(!quorum.contains(&producer_op));
        assert_eq!(quorum.len(), 2);
    }

    #[test]
    fn finality_threshold_and_rate_limiter() {
        let limiter = SignatureRateLimiter::new();
        for _ in 0..MAX_SIGNATURES_PER_PEER_PER_MINUTE {
            assert!(limiter.allow(42));
        }
        assert!(!limiter.allow(42));
    }

    #[test]
    fn is_final_requires_threshold_unique_operators() {
        let store = FinalityStore::open_in_memory().unwrap();
        let mut params = crate::core::Network::Regtest.params();
        params.hu_quorum_threshold = 1;
        let block_hash = [9u8; 32];
        assert!(!store.is_final(&block_hash, &params).unwrap());
    }

    #[test]
    fn bootstrap_window_locks_once_a_later_block_is_finalized() {
        let store = FinalityStore::open_in_memory().unwrap();
        let params = crate::core::Network::Regtest.params();
        assert_eq!(params.dmm_bootstrap_height, 10);

        let bootstrap_block = ([3u8; 32], 4u64);
        // Before any post-bootstrap block has finalized, an unsigned
        // bootstrap block is not implicitly final.
        assert!(!reorg_touches_finalized_block(&store, &[bootstrap_block], &params).unwrap());

        store.set_last_finalized_height(11).unwrap();
        assert!(reorg_touches_finalized_block(&store, &[bootstrap_block], &params).unwrap());

        // Heights past the bootstrap window still need a real signature.
        let later_block = ([4u8; 32], 11u64);
        assert!(!reorg_touches_finalized_block(&store, &[later_block], &params).unwrap());
    }
}

// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component A — the SPV Bitcoin header store (spec §4.A). Independently
//! verifies Bitcoin's proof-of-work chain: PoW, median-time-past, retarget,
//! checkpoints and reorg-by-work, entirely offline from the rest of the
//! node.

pub mod pow;

use std::path::Path;
use std::sync::Mutex;

use bathron_common::hash::{sha256d, Sha256dHash};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::core::params::{BtcCheckpoint, ConsensusParams};
use crate::util::db::{self, DbError};
use crate::util::lru::LruCache;
use pow::{compact_to_target, hash_meets_target, retarget, work_from_bits, U256};

/// A raw, bit-compatible Bitcoin block header (80 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtcHeader {
    pub version: i32,
    pub prev_hash: Sha256dHash,
    pub merkle_root: Sha256dHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BtcHeader {
    pub const SIZE: usize = 80;

    pub fn serialize(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_hash.0);
        out[36..68].copy_from_slice(&self.merkle_root.0);
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8; 80]) -> Self {
        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&bytes[0..4]);
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[4..36]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[36..68]);
        let mut time_bytes = [0u8; 4];
        time_bytes.copy_from_slice(&bytes[68..72]);
        let mut bits_bytes = [0u8; 4];
        bits_bytes.copy_from_slice(&bytes[72..76]);
        let mut nonce_bytes = [0u8; 4];
        nonce_bytes.copy_from_slice(&bytes[76..80]);
        BtcHeader {
            version: i32::from_le_bytes(version_bytes),
            prev_hash: Sha256dHash(prev),
            merkle_root: Sha256dHash(merkle),
            time: u32::from_le_bytes(time_bytes),
            bits: u32::from_le_bytes(bits_bytes),
            nonce: u32::from_le_bytes(nonce_bytes),
        }
    }

    /// Identity = double-SHA256 of the 80 serialized bytes.
    pub fn hash(&self) -> Sha256dHash {
        sha256d(&self.serialize())
    }
}

/// A stored header plus its position and accumulated work in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtcHeaderIndex {
    pub header: BtcHeader,
    pub height: u32,
    pub hash: Sha256dHash,
    pub cumulative_work: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddHeaderResult {
    Valid,
    InvalidPow,
    InvalidPrev,
    InvalidTsFuture,
    InvalidTsMtp,
    InvalidRetarget,
    InvalidCheckpoint,
    Duplicate,
    Orphan,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchResult {
    pub accepted: u32,
    pub rejected: u32,
    pub first_reject: Option<AddHeaderResult>,
}

#[derive(Debug, Error)]
pub enum SpvError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("header not found")]
    NotFound,
}

const MAX_FUTURE_DRIFT_SECS: i64 = 2 * 60 * 60;
const MEDIAN_TIME_SPAN: usize = 11;

/// The SPV header store. Owns a `hash -> BtcHeaderIndex` table and a
/// `height -> hash` best-chain index, plus the LRU cache bounding memory use
/// (spec §4.A).
pub struct SpvStore {
    conn: Mutex<rusqlite::Connection>,
    params: ConsensusParams,
    cache: Mutex<LruCache<Sha256dHash, BtcHeaderIndex>>,
}

impl SpvStore {
    pub fn open(path: &Path, params: ConsensusParams) -> Result<Self, SpvError> {
        let conn = db::open(path)?;
        Self::init_schema(&conn)?;
        Ok(SpvStore { conn: Mutex::new(conn), params, cache: Mutex::new(LruCache::new(4096)) })
    }

    pub fn open_in_memory(params: ConsensusParams) -> Result<Self, SpvError> {
        let conn = db::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(SpvStore { conn: Mutex::new(conn), params, cache: Mutex::new(LruCache::new(4096)) })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), DbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS headers (
                hash BLOB PRIMARY KEY,
                height INTEGER,
                version INTEGER,
                prev_hash BLOB,
                merkle_root BLOB,
                time INTEGER,
                bits INTEGER,
                nonce INTEGER,
                cumulative_work BLOB,
                in_best_chain INTEGER
            );
            CREATE TABLE IF NOT EXISTS best_chain (
                height INTEGER PRIMARY KEY,
                hash BLOB
            );
            CREATE TABLE IF NOT EXISTS tip (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                height INTEGER,
                hash BLOB,
                cumulative_work BLOB
            );",
        )?;
        Ok(())
    }

    /// Re-opens the store's connection without restarting the process. On
    /// failure the prior in-memory view (cache) is left untouched.
    pub fn reload(&self, path: &Path) -> Result<(), SpvError> {
        let new_conn = db::open(path)?;
        Self::init_schema(&new_conn)?;
        let mut guard = self.conn.lock().unwrap();
        *guard = new_conn;
        self.cache.lock().unwrap().clear_on_reload();
        Ok(())
    }

    fn row_to_index(row: &rusqlite::Row) -> rusqlite::Result<BtcHeaderIndex> {
        let hash_blob: Vec<u8> = row.get("hash")?;
        let prev_blob: Vec<u8> = row.get("prev_hash")?;
        let merkle_blob: Vec<u8> = row.get("merkle_root")?;
        let work_blob: Vec<u8> = row.get("cumulative_work")?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hash_blob);
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&prev_blob);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&merkle_blob);
        let mut work = [0u8; 32];
        work.copy_from_slice(&work_blob);
        Ok(BtcHeaderIndex {
            header: BtcHeader {
                version: row.get("version")?,
                prev_hash: Sha256dHash(prev),
                merkle_root: Sha256dHash(merkle),
                time: row.get::<_, i64>("time")? as u32,
                bits: row.get::<_, i64>("bits")? as u32,
                nonce: row.get::<_, i64>("nonce")? as u32,
            },
            height: row.get::<_, i64>("height")? as u32,
            hash: Sha256dHash(hash),
            cumulative_work: U256(work),
        })
    }

    pub fn get_header_by_hash(&self, hash: &Sha256dHash) -> Result<Option<BtcHeaderIndex>, SpvError> {
        if let Some(cached) = self.cache.lock().unwrap().get(hash) {
            return Ok(Some(*cached));
        }
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row("SELECT * FROM headers WHERE hash = ?1", params![hash.0.to_vec()], Self::row_to_index)
            .optional()?;
        if let Some(idx) = result {
            self.cache.lock().unwrap().put(*hash, idx);
        }
        Ok(result)
    }

    pub fn get_header_at_height(&self, height: u32) -> Result<Option<BtcHeaderIndex>, SpvError> {
        let conn = self.conn.lock().unwrap();
        let hash_blob: Option<Vec<u8>> = conn
            .query_row("SELECT hash FROM best_chain WHERE height = ?1", params![height], |r| r.get(0))
            .optional()?;
        drop(conn);
        match hash_blob {
            None => Ok(None),
            Some(b) => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&b);
                self.get_header_by_hash(&Sha256dHash(hash))
            }
        }
    }

    pub fn tip(&self) -> Result<Option<(u32, Sha256dHash, U256)>, SpvError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row("SELECT height, hash, cumulative_work FROM tip WHERE id = 0", [], |r| {
                let h: i64 = r.get(0)?;
                let hash_blob: Vec<u8> = r.get(1)?;
                let work_blob: Vec<u8> = r.get(2)?;
                Ok((h as u32, hash_blob, work_blob))
            })
            .optional()?;
        Ok(row.map(|(h, hash_blob, work_blob)| {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&hash_blob);
            let mut work = [0u8; 32];
            work.copy_from_slice(&work_blob);
            (h, Sha256dHash(hash), U256(work))
        }))
    }

    pub fn tip_height(&self) -> Result<u32, SpvError> {
        Ok(self.tip()?.map(|(h, _, _)| h).unwrap_or(0))
    }

    pub fn min_supported_height(&self) -> u32 {
        self.params.min_supported_height()
    }

    pub fn is_in_best_chain(&self, hash: &Sha256dHash) -> Result<bool, SpvError> {
        match self.get_header_by_hash(hash)? {
            None => Ok(false),
            Some(idx) => Ok(self.get_header_at_height(idx.height)?.map(|i| i.hash) == Some(*hash)),
        }
    }

    pub fn confirmations(&self, hash: &Sha256dHash) -> Result<Option<u32>, SpvError> {
        let idx = match self.get_header_by_hash(hash)? {
            Some(i) => i,
            None => return Ok(None),
        };
        if !self.is_in_best_chain(hash)? {
            return Ok(Some(0));
        }
        let tip_height = self.tip_height()?;
        Ok(Some(tip_height.saturating_sub(idx.height) + 1))
    }

    /// Validates and (if valid) stores a single header, possibly triggering
    /// a reorg to a branch of strictly greater cumulative work.
    pub fn add_header(&self, header: BtcHeader) -> Result<AddHeaderResult, SpvError> {
        let hash = header.hash();

        if self.get_header_by_hash(&hash)?.is_some() {
            return Ok(AddHeaderResult::Duplicate);
        }

        // Genesis case: no previous header required when the store is empty
        // and the prev_hash matches the checkpoint at height 0.
        let parent = self.get_header_by_hash(&header.prev_hash)?;
        let (height, parent_work) = match parent {
            Some(p) => (p.height + 1, p.cumulative_work),
            None => {
                if self.tip()?.is_some() {
                    return Ok(AddHeaderResult::Orphan);
                }
                (0u32, U256::ZERO)
            }
        };

        // Rule 1: PoW.
        let target = compact_to_target(header.bits);
        let pow_limit = U256(self.params.pow_limit);
        if target.is_zero() || target > pow_limit {
            return Ok(AddHeaderResult::InvalidPow);
        }
        if !hash_meets_target(&hash.0, &target) {
            return Ok(AddHeaderResult::InvalidPow);
        }

        // Rule 4: checkpoint.
        if let Some(cp) = self.params.checkpoint_at(height) {
            if cp.hash != hash {
                return Ok(AddHeaderResult::InvalidCheckpoint);
            }
        }

        // Rule 2: timestamp bounds.
        if (header.time as i64) > now_unix() + MAX_FUTURE_DRIFT_SECS {
            return Ok(AddHeaderResult::InvalidTsFuture);
        }
        if height > 0 {
            let mtp = self.median_time_past(height - 1)?;
            if let Some(mtp) = mtp {
                if header.time <= mtp {
                    return Ok(AddHeaderResult::InvalidTsMtp);
                }
            }
        }

        // Rule 3: retarget, every `retarget_interval` blocks.
        if height > 0 && height % self.params.retarget_interval == 0 {
            if let Some(expected_bits) = self.expected_retarget_bits(height)? {
                let expected_target = compact_to_target(expected_bits);
                if target != expected_target {
                    return Ok(AddHeaderResult::InvalidRetarget);
                }
            }
        }

        let work = work_from_bits(header.bits);
        let cumulative_work = parent_work.saturating_add(&work);

        let idx = BtcHeaderIndex { header, height, hash, cumulative_work };
        self.store_header(&idx)?;
        self.maybe_reorg(&idx)?;
        self.cache.lock().unwrap().put(hash, idx);

        Ok(AddHeaderResult::Valid)
    }

    pub fn add_headers(&self, batch: &[BtcHeader]) -> Result<BatchResult, SpvError> {
        let mut result = BatchResult::default();
        for h in batch {
            let r = self.add_header(*h)?;
            if matches!(r, AddHeaderResult::Valid | AddHeaderResult::Duplicate) {
                result.accepted += 1;
            } else {
                result.rejected += 1;
                if result.first_reject.is_none() {
                    result.first_reject = Some(r);
                }
            }
        }
        Ok(result)
    }

    fn store_header(&self, idx: &BtcHeaderIndex) -> Result<(), SpvError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO headers (hash, height, version, prev_hash, merkle_root, time, bits, nonce, cumulative_work, in_best_chain)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
            params![
                idx.hash.0.to_vec(),
                idx.height,
                idx.header.version,
                idx.header.prev_hash.0.to_vec(),
                idx.header.merkle_root.0.to_vec(),
                idx.header.time,
                idx.header.bits,
                idx.header.nonce,
                idx.cumulative_work.0.to_vec(),
            ],
        )?;
        Ok(())
    }

    /// Rule 5: on a competing branch, switch best chain to whichever has
    /// strictly greater cumulative work (tie-break: first stored wins, i.e.
    /// we never switch on equal work since the incumbent arrived first).
    fn maybe_reorg(&self, idx: &BtcHeaderIndex) -> Result<(), SpvError> {
        let current_tip = self.tip()?;
        let should_switch = match &current_tip {
            None => true,
            Some((_, _, tip_work)) => idx.cumulative_work > *tip_work,
        };
        if !should_switch {
            return Ok(());
        }

        // Walk back from idx to the fork point, collecting the new best-chain path.
        let mut path = vec![*idx];
        let mut cursor = *idx;
        while cursor.height > 0 {
            let parent = self.get_header_by_hash(&cursor.header.prev_hash)?.ok_or(SpvError::NotFound)?;
            path.push(parent);
            cursor = parent;
        }
        path.reverse();

        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM best_chain", [])?;
        for p in &path {
            conn.execute(
                "INSERT INTO best_chain (height, hash) VALUES (?1, ?2)",
                params![p.height, p.hash.0.to_vec()],
            )?;
        }
        conn.execute("DELETE FROM tip WHERE id = 0", [])?;
        conn.execute(
            "INSERT INTO tip (id, height, hash, cumulative_work) VALUES (0, ?1, ?2, ?3)",
            params![idx.height, idx.hash.0.to_vec(), idx.cumulative_work.0.to_vec()],
        )?;
        Ok(())
    }

    fn median_time_past(&self, tip_height: u32) -> Result<Option<u32>, SpvError> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut h = tip_height;
        loop {
            if let Some(idx) = self.get_header_at_height(h)? {
                times.push(idx.header.time);
            } else {
                break;
            }
            if times.len() >= MEDIAN_TIME_SPAN || h == 0 {
                break;
            }
            h -= 1;
        }
        if times.is_empty() {
            return Ok(None);
        }
        times.sort_unstable();
        Ok(Some(times[times.len() / 2]))
    }

    fn expected_retarget_bits(&self, height: u32) -> Result<Option<u32>, SpvError> {
        let prev = match self.get_header_at_height(height - 1)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let span_start_height = height - self.params.retarget_interval;
        let span_start = match self.get_header_at_height(span_start_height)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let actual_timespan = prev.header.time as i64 - span_start.header.time as i64;
        let target_timespan = self.params.retarget_interval as i64 * self.params.btc_target_spacing as i64;
        let prev_target = compact_to_target(prev.header.bits);
        let pow_limit = U256(self.params.pow_limit);
        let new_target = retarget(&prev_target, actual_timespan, target_timespan, &pow_limit);
        Ok(Some(pow::target_to_compact(&new_target)))
    }

    /// Verifies a Merkle proof for `txid` against `root`: `proof` is the
    /// sibling hash path and `index` is the leaf's position (bit `i` of
    /// `index` selects whether sibling `i` is hashed on the left or right).
    pub fn verify_merkle_proof(
        txid: &Sha256dHash,
        root: &Sha256dHash,
        proof: &[Sha256dHash],
        index: u32,
    ) -> bool {
        let mut current = *txid;
        let mut idx = index;
        for sibling in proof {
            let mut buf = [0u8; 64];
            if idx & 1 == 0 {
                buf[0..32].copy_from_slice(&current.0);
                buf[32..64].copy_from_slice(&sibling.0);
            } else {
                buf[0..32].copy_from_slice(&sibling.0);
                buf[32..64].copy_from_slice(&current.0);
            }
            current = sha256d(&buf);
            idx >>= 1;
        }
        current == *root
    }
}

impl<K: Eq + std::hash::Hash + Clone, V> LruCache<K, V> {
    /// Reload never invalidates cache entries with outstanding `Arc` handles
    /// (see `util::lru`); we simply clear the index so stale entries aren't
    /// served from a connection that may have rolled back.
    fn clear_on_reload(&mut self) {
        *self = LruCache::new(self.len().max(1));
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
pub struct Checkpoint(pub BtcCheckpoint);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::Network;

    fn genesis_params() -> ConsensusParams {
        let mut p = Network::Regtest.params();
        p.checkpoints = &[];
        p
    }

    fn mine_header(prev_hash: Sha256dHash, bits: u32, time: u32) -> BtcHeader {
        let mut header = BtcHeader { version: 1, prev_hash, merkle_root: Sha256dHash([0u8; 32]), time, bits, nonce: 0 };
        let target = compact_to_target(bits);
        for nonce in 0..2_000_000u32 {
            header.nonce = nonce;
            if hash_meets_target(&header.hash().0, &target) {
                return header;
            }
        }
        panic!("failed to mine test header within bound");
    }

    #[test]
    fn accepts_genesis_then_chains_second_header() {
        let store = SpvStore::open_in_memory(genesis_params()).unwrap();
        let easy_bits = 0x207fffff; // regtest-style trivial target
        let genesis = mine_header(Sha256dHash([0u8; 32]), easy_bits, 1_600_000_000);
        assert_eq!(store.add_header(genesis).unwrap(), AddHeaderResult::Valid);

        let second = mine_header(genesis.hash(), easy_bits, 1_600_000_100);
        assert_eq!(store.add_header(second).unwrap(), AddHeaderResult::Valid);
        assert_eq!(store.tip_height().unwrap(), 1);
    }

    #[test]
    fn rejects_duplicate_header() {
        let store = SpvStore::open_in_memory(genesis_params()).unwrap();
        let easy_bits = 0x207fffff;
        let genesis = mine_header(Sha256dHash([0u8; 32]), easy_bits, 1_600_000_000);
        store.add_header(genesis).unwrap();
        assert_eq!(store.add_header(genesis).unwrap(), AddHeaderResult::Duplicate);
    }

    #[test]
    fn rejects_orphan_with_unknown_parent() {
        let store = SpvStore::open_in_memory(genesis_params()).unwrap();
        let easy_bits = 0x207fffff;
        let genesis = mine_header(Sha256dHash([0u8; 32]), easy_bits, 1_600_000_000);
        store.add_header(genesis).unwrap();
        let orphan = mine_header(Sha256dHash([0xAB; 32]), easy_bits, 1_600_000_200);
        assert_eq!(store.add_header(orphan).unwrap(), AddHeaderResult::Orphan);
    }

    #[test]
    fn rejects_future_timestamp() {
        let store = SpvStore::open_in_memory(genesis_params()).unwrap();
        let easy_bits = 0x207fffff;
        let far_future = (now_unix() + 100_000) as u32;
        let genesis = mine_header(Sha256dHash([0u8; 32]), easy_bits, far_future);
        assert_eq!(store.add_header(genesis).unwrap(), AddHeaderResult::InvalidTsFuture);
    }

    #[test]
    fn reorgs_to_greater_cumulative_work() {
        let store = SpvStore::open_in_memory(genesis_params()).unwrap();
        let easy_bits = 0x207fffff;
        let genesis = mine_header(Sha256dHash([0u8; 32]), easy_bits, 1_600_000_000);
        store.add_header(genesis).unwrap();

        let branch_a = mine_header(genesis.hash(), easy_bits, 1_600_000_100);
        store.add_header(branch_a).unwrap();
        assert_eq!(store.tip().unwrap().unwrap().1, branch_a.hash());

        // Same-height competing header: shouldn't dethrone branch_a (equal work).
        let branch_b = mine_header(genesis.hash(), easy_bits, 1_600_000_105);
        store.add_header(branch_b).unwrap();
        assert_eq!(store.tip().unwrap().unwrap().1, branch_a.hash());
    }

    #[test]
    fn merkle_proof_verifies_against_root() {
        let leaf = sha256d(b"tx");
        let sibling = sha256d(b"sibling");
        let mut buf = [0u8; 64];
        buf[0..32].copy_from_slice(&leaf.0);
        buf[32..64].copy_from_slice(&sibling.0);
        let root = sha256d(&buf);
        assert!(SpvStore::verify_merkle_proof(&leaf, &root, &[sibling], 0));
        assert!(!SpvStore::verify_merkle_proof(&leaf, &root, &[sibling], 1));
    }

    #[test]
    fn checkpoint_rejects_mismatched_hash_at_checkpoint_height() {
        let mut p = Network::Regtest.params();
        p.checkpoints = &[BtcCheckpoint { height: 1, hash: Sha256dHash([0x42; 32]), cumulative_work: 0 }];
        let store = SpvStore::open_in_memory(p).unwrap();
        let easy_bits = 0x207fffff;
        let genesis = mine_header(Sha256dHash([0u8; 32]), easy_bits, 1_600_000_000);
        store.add_header(genesis).unwrap();
        let second = mine_header(genesis.hash(), easy_bits, 1_600_000_100);
        assert_eq!(store.add_header(second).unwrap(), AddHeaderResult::InvalidCheckpoint);
    }
}

// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component B — the on-chain header DB (spec §4.B). A write-only-from-
//! consensus mirror of the SPV store: only the best chain is kept, there is
//! no PoW check here (already done in A), and every mutation happens inside
//! a block's atomic batch alongside the L1 block hash that authored it.

use std::path::Path;
use std::sync::Mutex;

use bathron_common::hash::Sha256dHash;
use rusqlite::{params, OptionalExtension, Transaction};
use thiserror::Error;

use crate::btcspv::BtcHeader;
use crate::util::db::{self, DbError};

#[derive(Debug, Error)]
pub enum BtcHeaderDbError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("batch is not contiguous with current tip")]
    NonContiguous,
}

/// A proTxHash identifying a masternode (opaque 32-byte identity here; the
/// DMN registration record itself is out of scope per spec §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProTxHash(pub [u8; 32]);

pub struct OnChainHeaderDb {
    conn: Mutex<rusqlite::Connection>,
}

impl OnChainHeaderDb {
    pub fn open(path: &Path) -> Result<Self, BtcHeaderDbError> {
        let conn = db::open(path)?;
        Self::init_schema(&conn)?;
        Ok(OnChainHeaderDb { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, BtcHeaderDbError> {
        let conn = db::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(OnChainHeaderDb { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), DbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS onchain_headers (
                height INTEGER PRIMARY KEY,
                hash BLOB,
                version INTEGER,
                prev_hash BLOB,
                merkle_root BLOB,
                time INTEGER,
                bits INTEGER,
                nonce INTEGER
            );
            CREATE TABLE IF NOT EXISTS onchain_headers_by_hash (
                hash BLOB PRIMARY KEY,
                height INTEGER
            );
            CREATE TABLE IF NOT EXISTS last_publisher (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                pro_tx_hash BLOB,
                l1_height INTEGER
            );
            CREATE TABLE IF NOT EXISTS best_block (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                l1_height INTEGER,
                l1_hash BLOB
            );",
        )?;
        Ok(())
    }

    pub fn get_tip(&self) -> Result<Option<(u32, Sha256dHash)>, BtcHeaderDbError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row("SELECT height, hash FROM onchain_headers ORDER BY height DESC LIMIT 1", [], |r| {
                let h: i64 = r.get(0)?;
                let hash: Vec<u8> = r.get(1)?;
                Ok((h as u32, hash))
            })
            .optional()?;
        Ok(row.map(|(h, hash)| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&hash);
            (h, Sha256dHash(out))
        }))
    }

    pub fn has_header_at_height(&self, height: u32) -> Result<bool, BtcHeaderDbError> {
        Ok(self.get_header_by_height(height)?.is_some())
    }

    pub fn get_header_by_height(&self, height: u32) -> Result<Option<BtcHeader>, BtcHeaderDbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT version, prev_hash, merkle_root, time, bits, nonce FROM onchain_headers WHERE height = ?1",
            params![height],
            Self::row_to_header,
        )
        .optional()
        .map_err(|e| BtcHeaderDbError::Db(DbError::Sqlite(e)))
    }

    pub fn get_header_by_hash(&self, hash: &Sha256dHash) -> Result<Option<BtcHeader>, BtcHeaderDbError> {
        let conn = self.conn.lock().unwrap();
        let height: Option<i64> = conn
            .query_row("SELECT height FROM onchain_headers_by_hash WHERE hash = ?1", params![hash.0.to_vec()], |r| r.get(0))
            .optional()?;
        drop(conn);
        match height {
            None => Ok(None),
            Some(h) => self.get_header_by_height(h as u32),
        }
    }

    fn row_to_header(row: &rusqlite::Row) -> rusqlite::Result<BtcHeader> {
        let prev_blob: Vec<u8> = row.get(1)?;
        let merkle_blob: Vec<u8> = row.get(2)?;
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&prev_blob);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&merkle_blob);
        Ok(BtcHeader {
            version: row.get(0)?,
            prev_hash: Sha256dHash(prev),
            merkle_root: Sha256dHash(merkle),
            time: row.get::<_, i64>(3)? as u32,
            bits: row.get::<_, i64>(4)? as u32,
            nonce: row.get::<_, i64>(5)? as u32,
        })
    }

    pub fn get_last_publisher(&self) -> Result<Option<(ProTxHash, u64)>, BtcHeaderDbError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row("SELECT pro_tx_hash, l1_height FROM last_publisher WHERE id = 0", [], |r| {
                let pro: Vec<u8> = r.get(0)?;
                let h: i64 = r.get(1)?;
                Ok((pro, h))
            })
            .optional()?;
        Ok(row.map(|(pro, h)| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&pro);
            (ProTxHash(out), h as u64)
        }))
    }

    pub fn get_best_block(&self) -> Result<Option<(u64, [u8; 32])>, BtcHeaderDbError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row("SELECT l1_height, l1_hash FROM best_block WHERE id = 0", [], |r| {
                let h: i64 = r.get(0)?;
                let hash: Vec<u8> = r.get(1)?;
                Ok((h as u64, hash))
            })
            .optional()?;
        Ok(row.map(|(h, hash)| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&hash);
            (h, out)
        }))
    }

    /// Begins an atomic batch of header appends, committed alongside an L1
    /// block via [`HeaderBatch::commit`].
    pub fn batch(&self) -> Result<HeaderBatch<'_>, BtcHeaderDbError> {
        Ok(HeaderBatch { db: self, appended: Vec::new(), publisher: None, best_block: None })
    }

    /// Rolls the DB back to `new_tip_height`, discarding everything above
    /// it, and resets the best-block marker. Used when an L1 block
    /// containing a `TX_BTC_HEADERS` is disconnected.
    pub fn disconnect_to(&self, new_tip_height: Option<u32>, new_best_block: Option<(u64, [u8; 32])>) -> Result<(), BtcHeaderDbError> {
        let conn = self.conn.lock().unwrap();
        match new_tip_height {
            Some(h) => {
                conn.execute("DELETE FROM onchain_headers WHERE height > ?1", params![h])?;
                conn.execute(
                    "DELETE FROM onchain_headers_by_hash WHERE height > ?1",
                    params![h],
                )?;
            }
            None => {
                conn.execute("DELETE FROM onchain_headers", [])?;
                conn.execute("DELETE FROM onchain_headers_by_hash", [])?;
            }
        }
        conn.execute("DELETE FROM best_block", [])?;
        if let Some((h, hash)) = new_best_block {
            conn.execute(
                "INSERT INTO best_block (id, l1_height, l1_hash) VALUES (0, ?1, ?2)",
                params![h, hash.to_vec()],
            )?;
        }
        Ok(())
    }
}

/// One accumulating batch of header writes plus the L1 metadata that must
/// commit atomically with them.
pub struct HeaderBatch<'a> {
    db: &'a OnChainHeaderDb,
    appended: Vec<(u32, BtcHeader)>,
    publisher: Option<(ProTxHash, u64)>,
    best_block: Option<(u64, [u8; 32])>,
}

impl<'a> HeaderBatch<'a> {
    pub fn append(&mut self, start_height: u32, headers: &[BtcHeader]) {
        for (i, h) in headers.iter().enumerate() {
            self.appended.push((start_height + i as u32, *h));
        }
    }

    pub fn set_last_publisher(&mut self, pro_tx_hash: ProTxHash, l1_height: u64) {
        self.publisher = Some((pro_tx_hash, l1_height));
    }

    pub fn set_best_block(&mut self, l1_height: u64, l1_hash: [u8; 32]) {
        self.best_block = Some((l1_height, l1_hash));
    }

    /// Commits every accumulated write atomically in a single SQL
    /// transaction.
    pub fn commit(self) -> Result<(), BtcHeaderDbError> {
        let mut conn = self.db.conn.lock().unwrap();
        let tx: Transaction = conn.transaction().map_err(DbError::Sqlite)?;
        for (height, header) in &self.appended {
            let hash = header.hash();
            tx.execute(
                "INSERT OR REPLACE INTO onchain_headers (height, hash, version, prev_hash, merkle_root, time, bits, nonce)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    height,
                    hash.0.to_vec(),
                    header.version,
                    header.prev_hash.0.to_vec(),
                    header.merkle_root.0.to_vec(),
                    header.time,
                    header.bits,
                    header.nonce,
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO onchain_headers_by_hash (hash, height) VALUES (?1, ?2)",
                params![hash.0.to_vec(), height],
            )?;
        }
        if let Some((pro, h)) = &self.publisher {
            tx.execute("DELETE FROM last_publisher WHERE id = 0", [])?;
            tx.execute(
                "INSERT INTO last_publisher (id, pro_tx_hash, l1_height) VALUES (0, ?1, ?2)",
                params![pro.0.to_vec(), *h as i64],
            )?;
        }
        if let Some((h, hash)) = &self.best_block {
            tx.execute("DELETE FROM best_block WHERE id = 0", [])?;
            tx.execute(
                "INSERT INTO best_block (id, l1_height, l1_hash) VALUES (0, ?1, ?2)",
                params![*h as i64, hash.to_vec()],
            )?;
        }
        tx.commit().map_err(DbError::Sqlite)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Sha256dHash, nonce: u32) -> BtcHeader {
        BtcHeader { version: 1, prev_hash: prev, merkle_root: Sha256dHash([1u8; 32]), time: 100, bits: 0x207fffff, nonce }
    }

    #[test]
    fn fresh_db_has_empty_tip() {
        let db = OnChainHeaderDb::open_in_memory().unwrap();
        assert_eq!(db.get_tip().unwrap(), None);
    }

    #[test]
    fn batch_commits_atomically_with_best_block() {
        let db = OnChainHeaderDb::open_in_memory().unwrap();
        let genesis = header(Sha256dHash([0u8; 32]), 1);
        let mut batch = db.batch().unwrap();
        batch.append(0, &[genesis]);
        batch.set_best_block(1, [0xAA; 32]);
        batch.commit().unwrap();

        assert_eq!(db.get_tip().unwrap(), Some((0, genesis.hash())));
        assert_eq!(db.get_best_block().unwrap(), Some((1, [0xAA; 32])));
    }

    #[test]
    fn disconnect_erases_entries_beyond_new_tip() {
        let db = OnChainHeaderDb::open_in_memory().unwrap();
        let genesis = header(Sha256dHash([0u8; 32]), 1);
        let second = header(genesis.hash(), 2);
        let mut batch = db.batch().unwrap();
        batch.append(0, &[genesis, second]);
        batch.set_best_block(1, [0xAA; 32]);
        batch.commit().unwrap();

        db.disconnect_to(Some(0), Some((0, [0u8; 32]))).unwrap();
        assert_eq!(db.get_tip().unwrap(), Some((0, genesis.hash())));
        assert!(!db.has_header_at_height(1).unwrap());
    }

    #[test]
    fn publisher_cooldown_record_roundtrips() {
        let db = OnChainHeaderDb::open_in_memory().unwrap();
        let mut batch = db.batch().unwrap();
        batch.set_last_publisher(ProTxHash([7u8; 32]), 42);
        batch.commit().unwrap();
        assert_eq!(db.get_last_publisher().unwrap(), Some((ProTxHash([7u8; 32]), 42)));
    }
}

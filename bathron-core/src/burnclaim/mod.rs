// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component D — the burn-claim DB (spec §4.D). Tracks the PENDING -> FINAL
//! lifecycle of every observed burn and maintains the M0BTC supply counter
//! as a running invariant over FINAL records.

use std::path::Path;
use std::sync::Mutex;

use bathron_common::hash::Sha256dHash;
use rusqlite::{params, OptionalExtension, Transaction};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    Pending,
    Final,
}

impl ClaimStatus {
    fn as_i64(self) -> i64 {
        match self {
            ClaimStatus::Pending => 0,
            ClaimStatus::Final => 1,
        }
    }

    fn from_i64(v: i64) -> Self {
        if v == 1 {
            ClaimStatus::Final
        } else {
            ClaimStatus::Pending
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnClaimRecord {
    pub btc_txid: Sha256dHash,
    pub btc_block_hash: Sha256dHash,
    pub btc_height: u32,
    pub burned_sats: u64,
    pub destination: [u8; 20],
    pub claim_height_l1: u64,
    pub status: ClaimStatus,
    pub final_height_l1: u64,
}

#[derive(Debug, Error)]
pub enum BurnClaimDbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("claim for this btc-txid already exists")]
    AlreadyClaimed,
    #[error("supply counter would go negative on undo")]
    SupplyUnderflow,
}

pub struct BurnClaimDb {
    conn: Mutex<rusqlite::Connection>,
}

impl BurnClaimDb {
    pub fn open(path: &Path) -> Result<Self, BurnClaimDbError> {
        let conn = crate::util::db::open(path).map_err(|e| match e {
            crate::util::db::DbError::Sqlite(s) => BurnClaimDbError::Sqlite(s),
            other => BurnClaimDbError::Sqlite(rusqlite::Error::ModuleError(other.to_string())),
        })?;
        Self::init_schema(&conn)?;
        Ok(BurnClaimDb { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, BurnClaimDbError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(BurnClaimDb { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), BurnClaimDbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS claims (
                btc_txid BLOB PRIMARY KEY,
                btc_block_hash BLOB,
                btc_height INTEGER,
                burned_sats INTEGER,
                destination BLOB,
                claim_height_l1 INTEGER,
                status INTEGER,
                final_height_l1 INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_status_height ON claims (status, claim_height_l1);
            CREATE INDEX IF NOT EXISTS idx_destination ON claims (destination);
            CREATE TABLE IF NOT EXISTS supply (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                total_sats INTEGER
            );
            INSERT OR IGNORE INTO supply (id, total_sats) VALUES (0, 0);
            CREATE TABLE IF NOT EXISTS best_block (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                l1_height INTEGER,
                l1_hash BLOB
            );",
        )?;
        Ok(())
    }

    pub fn has_claim(&self, btc_txid: &Sha256dHash) -> Result<bool, BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM claims WHERE btc_txid = ?1", params![btc_txid.0.to_vec()], |r| r.get(0))
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn get(&self, btc_txid: &Sha256dHash) -> Result<Option<BurnClaimRecord>, BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM claims WHERE btc_txid = ?1", params![btc_txid.0.to_vec()], Self::row_to_record)
            .optional()
            .map_err(BurnClaimDbError::Sqlite)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<BurnClaimRecord> {
        let txid_blob: Vec<u8> = row.get("btc_txid")?;
        let block_blob: Vec<u8> = row.get("btc_block_hash")?;
        let dest_blob: Vec<u8> = row.get("destination")?;
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&txid_blob);
        let mut block = [0u8; 32];
        block.copy_from_slice(&block_blob);
        let mut dest = [0u8; 20];
        dest.copy_from_slice(&dest_blob);
        Ok(BurnClaimRecord {
            btc_txid: Sha256dHash(txid),
            btc_block_hash: Sha256dHash(block),
            btc_height: row.get::<_, i64>("btc_height")? as u32,
            burned_sats: row.get::<_, i64>("burned_sats")? as u64,
            destination: dest,
            claim_height_l1: row.get::<_, i64>("claim_height_l1")? as u64,
            status: ClaimStatus::from_i64(row.get("status")?),
            final_height_l1: row.get::<_, i64>("final_height_l1")? as u64,
        })
    }

    /// Inserts a new claim as PENDING. Returns `AlreadyClaimed` if a record
    /// for this btc-txid already exists — the spec's "upsert" semantics only
    /// apply to status transitions of an existing record, not to creating
    /// a second claim for the same burn.
    pub fn insert_pending(&self, record: &BurnClaimRecord) -> Result<(), BurnClaimDbError> {
        if self.has_claim(&record.btc_txid)? {
            return Err(BurnClaimDbError::AlreadyClaimed);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO claims (btc_txid, btc_block_hash, btc_height, burned_sats, destination, claim_height_l1, status, final_height_l1)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.btc_txid.0.to_vec(),
                record.btc_block_hash.0.to_vec(),
                record.btc_height,
                record.burned_sats as i64,
                record.destination.to_vec(),
                record.claim_height_l1 as i64,
                ClaimStatus::Pending.as_i64(),
                0i64,
            ],
        )?;
        Ok(())
    }

    /// Transitions a PENDING claim to FINAL at `final_height`, incrementing
    /// the supply counter by its burned-sats amount.
    pub fn finalize(&self, btc_txid: &Sha256dHash, final_height: u64) -> Result<(), BurnClaimDbError> {
        let mut conn = self.conn.lock().unwrap();
        let tx: Transaction = conn.transaction()?;
        let burned_sats: i64 = tx.query_row(
            "SELECT burned_sats FROM claims WHERE btc_txid = ?1 AND status = 0",
            params![btc_txid.0.to_vec()],
            |r| r.get(0),
        )?;
        tx.execute(
            "UPDATE claims SET status = 1, final_height_l1 = ?2 WHERE btc_txid = ?1",
            params![btc_txid.0.to_vec(), final_height as i64],
        )?;
        tx.execute("UPDATE supply SET total_sats = total_sats + ?1 WHERE id = 0", params![burned_sats])?;
        tx.commit()?;
        Ok(())
    }

    /// Reverses a finalize: FINAL -> PENDING, decrementing the supply
    /// counter. Used when a `TX_MINT_M0BTC` is undone on disconnect.
    pub fn undo_finalize(&self, btc_txid: &Sha256dHash) -> Result<(), BurnClaimDbError> {
        let mut conn = self.conn.lock().unwrap();
        let tx: Transaction = conn.transaction()?;
        let burned_sats: i64 = tx.query_row(
            "SELECT burned_sats FROM claims WHERE btc_txid = ?1 AND status = 1",
            params![btc_txid.0.to_vec()],
            |r| r.get(0),
        )?;
        let current: i64 = tx.query_row("SELECT total_sats FROM supply WHERE id = 0", [], |r| r.get(0))?;
        if current < burned_sats {
            return Err(BurnClaimDbError::SupplyUnderflow);
        }
        tx.execute(
            "UPDATE claims SET status = 0, final_height_l1 = 0 WHERE btc_txid = ?1",
            params![btc_txid.0.to_vec()],
        )?;
        tx.execute("UPDATE supply SET total_sats = total_sats - ?1 WHERE id = 0", params![burned_sats])?;
        tx.commit()?;
        Ok(())
    }

    /// Removes a PENDING claim entirely (disconnect of the block that
    /// introduced its `TX_BURN_CLAIM`).
    pub fn remove_pending(&self, btc_txid: &Sha256dHash) -> Result<(), BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM claims WHERE btc_txid = ?1 AND status = 0", params![btc_txid.0.to_vec()])?;
        Ok(())
    }

    pub fn supply(&self) -> Result<u64, BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        let v: i64 = conn.query_row("SELECT total_sats FROM supply WHERE id = 0", [], |r| r.get(0))?;
        Ok(v as u64)
    }

    pub fn for_each_pending(&self, mut f: impl FnMut(&BurnClaimRecord)) -> Result<(), BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM claims WHERE status = 0 ORDER BY claim_height_l1, btc_txid")?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        for row in rows {
            f(&row?);
        }
        Ok(())
    }

    pub fn for_each_final(&self, mut f: impl FnMut(&BurnClaimRecord)) -> Result<(), BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM claims WHERE status = 1 ORDER BY final_height_l1, btc_txid")?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        for row in rows {
            f(&row?);
        }
        Ok(())
    }

    pub fn for_each_by_destination(&self, destination: [u8; 20], mut f: impl FnMut(&BurnClaimRecord)) -> Result<(), BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM claims WHERE destination = ?1 ORDER BY claim_height_l1")?;
        let rows = stmt.query_map(params![destination.to_vec()], Self::row_to_record)?;
        for row in rows {
            f(&row?);
        }
        Ok(())
    }

    pub fn set_best_block(&self, l1_height: u64, l1_hash: [u8; 32]) -> Result<(), BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM best_block WHERE id = 0", [])?;
        conn.execute(
            "INSERT INTO best_block (id, l1_height, l1_hash) VALUES (0, ?1, ?2)",
            params![l1_height as i64, l1_hash.to_vec()],
        )?;
        Ok(())
    }

    pub fn get_best_block(&self) -> Result<Option<(u64, [u8; 32])>, BurnClaimDbError> {
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

    /// Asserts the invariant from spec §8: the supply counter equals the sum
    /// of burned-sats over all FINAL records. Intended for tests and
    /// startup consistency checks, not the hot path.
    pub fn assert_supply_invariant(&self) -> Result<(), BurnClaimDbError> {
        let conn = self.conn.lock().unwrap();
        let summed: i64 = conn.query_row("SELECT COALESCE(SUM(burned_sats), 0) FROM claims WHERE status = 1", [], |r| r.get(0))?;
        let counter: i64 = conn.query_row("SELECT total_sats FROM supply WHERE id = 0", [], |r| r.get(0))?;
        if summed != counter {
            return Err(BurnClaimDbError::Sqlite(rusqlite::Error::ModuleError(format!(
                "supply counter {} != sum(FINAL burned_sats) {}",
                counter, summed
            ))));
        }
        Ok(())
    }
}

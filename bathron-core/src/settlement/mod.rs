// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component E — the settlement DB (spec §4.E). Tracks vaulted M0BTC
//! outpoints (IsVault UTXOs), M1 balances/receipts and the undo journals
//! needed to reverse `TX_UNLOCK`/`TX_TRANSFER_M1` on disconnect, plus the
//! M0/M1 invariants A5/A6 that span both supply counters.

use std::path::Path;
use std::sync::Mutex;

use bathron_common::hash::Sha256dHash;
use rusqlite::{params, OptionalExtension, Transaction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("vault outpoint not found")]
    VaultNotFound,
    #[error("vault outpoint already exists")]
    VaultAlreadyExists,
    #[error("insufficient m1 balance")]
    InsufficientBalance,
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("no undo journal entry for txid {0}")]
    UndoJournalMissing(String),
}

/// `SettlementState(h)` (spec §3, §4.E): the per-L1-height snapshot
/// written exactly once per connected block, superseded on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementState {
    pub m0_vaulted: u64,
    pub m1_supply: u64,
    pub m0_total_supply: u64,
    pub burnclaims_block: u64,
    pub block_hash: [u8; 32],
}

/// A vaulted M0BTC outpoint (spec §3: "IsVault UTXOs spendable only by
/// TX_UNLOCK"). `owner` is the hash160 destination that locked it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultOutpoint {
    pub txid: Sha256dHash,
    pub vout: u32,
    pub owner: [u8; 20],
    pub value_sats: u64,
    pub locked_at_height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockUndo {
    pub txid: Sha256dHash,
    pub vout: u32,
    pub owner: [u8; 20],
    pub value_sats: u64,
    pub locked_at_height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferUndo {
    pub from: [u8; 20],
    pub to: [u8; 20],
    pub amount_sats: u64,
}

pub struct SettlementDb {
    conn: Mutex<rusqlite::Connection>,
}

impl SettlementDb {
    pub fn open(path: &Path) -> Result<Self, SettlementError> {
        let conn = crate::util::db::open(path).map_err(|e| match e {
            crate::util::db::DbError::Sqlite(s) => SettlementError::Sqlite(s),
            other => SettlementError::Sqlite(rusqlite::Error::ModuleError(other.to_string())),
        })?;
        Self::init_schema(&conn)?;
        Ok(SettlementDb { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, SettlementError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(SettlementDb { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), SettlementError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vaults (
                txid BLOB NOT NULL,
                vout INTEGER NOT NULL,
                owner BLOB,
                value_sats INTEGER,
                locked_at_height INTEGER,
                PRIMARY KEY (txid, vout)
            );
            CREATE INDEX IF NOT EXISTS idx_vault_owner ON vaults (owner);
            CREATE TABLE IF NOT EXISTS balances (
                owner BLOB PRIMARY KEY,
                amount_sats INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS m1_supply (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                total_sats INTEGER
            );
            INSERT OR IGNORE INTO m1_supply (id, total_sats) VALUES (0, 0);
            CREATE TABLE IF NOT EXISTS best_block (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                l1_height INTEGER,
                l1_hash BLOB
            );
            CREATE TABLE IF NOT EXISTS settlement_state (
                l1_height INTEGER PRIMARY KEY,
                m0_vaulted INTEGER NOT NULL,
                m1_supply INTEGER NOT NULL,
                m0_total_supply INTEGER NOT NULL,
                burnclaims_block INTEGER NOT NULL,
                block_hash BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS unlock_undo_journal (
                tx_txid BLOB PRIMARY KEY,
                vault_txid BLOB NOT NULL,
                vout INTEGER NOT NULL,
                owner BLOB NOT NULL,
                value_sats INTEGER NOT NULL,
                locked_at_height INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transfer_undo_journal (
                tx_txid BLOB PRIMARY KEY,
                from_owner BLOB NOT NULL,
                to_owner BLOB NOT NULL,
                amount_sats INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn row_to_vault(row: &rusqlite::Row) -> rusqlite::Result<VaultOutpoint> {
        let txid_blob: Vec<u8> = row.get("txid")?;
        let owner_blob: Vec<u8> = row.get("owner")?;
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&txid_blob);
        let mut owner = [0u8; 20];
        owner.copy_from_slice(&owner_blob);
        Ok(VaultOutpoint {
            txid: Sha256dHash(txid),
            vout: row.get::<_, i64>("vout")? as u32,
            owner,
            value_sats: row.get::<_, i64>("value_sats")? as u64,
            locked_at_height: row.get::<_, i64>("locked_at_height")? as u64,
        })
    }

    /// `TX_LOCK`: introduces a new vault outpoint. M0_vaulted grows; the
    /// caller is responsible for crediting the matching M1 balance in the
    /// same atomic step (spec A6: M0_vaulted(h) == M1_supply(h)).
    pub fn lock(&self, vault: &VaultOutpoint, credit_owner: [u8; 20], credit_amount: u64) -> Result<(), SettlementError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM vaults WHERE txid = ?1 AND vout = ?2",
                params![vault.txid.0.to_vec(), vault.vout],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(SettlementError::VaultAlreadyExists);
        }
        tx.execute(
            "INSERT INTO vaults (txid, vout, owner, value_sats, locked_at_height) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![vault.txid.0.to_vec(), vault.vout, vault.owner.to_vec(), vault.value_sats as i64, vault.locked_at_height as i64],
        )?;
        Self::credit_balance(&tx, credit_owner, credit_amount)?;
        tx.execute("UPDATE m1_supply SET total_sats = total_sats + ?1 WHERE id = 0", params![credit_amount as i64])?;
        tx.commit()?;
        Ok(())
    }

    /// `TX_UNLOCK`: spends a vault outpoint, debiting the matching M1
    /// balance. Returns the undo record needed to reverse this on
    /// disconnect.
    pub fn unlock(&self, txid: &Sha256dHash, vout: u32, debit_owner: [u8; 20], debit_amount: u64) -> Result<UnlockUndo, SettlementError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let vault = tx
            .query_row("SELECT * FROM vaults WHERE txid = ?1 AND vout = ?2", params![txid.0.to_vec(), vout], Self::row_to_vault)
            .optional()?
            .ok_or(SettlementError::VaultNotFound)?;

        Self::debit_balance(&tx, debit_owner, debit_amount)?;
        tx.execute("UPDATE m1_supply SET total_sats = total_sats - ?1 WHERE id = 0", params![debit_amount as i64])?;
        tx.execute("DELETE FROM vaults WHERE txid = ?1 AND vout = ?2", params![txid.0.to_vec(), vout])?;
        tx.commit()?;
        Ok(UnlockUndo { txid: *txid, vout, owner: vault.owner, value_sats: vault.value_sats, locked_at_height: vault.locked_at_height })
    }

    pub fn undo_unlock(&self, undo: &UnlockUndo) -> Result<(), SettlementError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO vaults (txid, vout, owner, value_sats, locked_at_height) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![undo.txid.0.to_vec(), undo.vout, undo.owner.to_vec(), undo.value_sats as i64, undo.locked_at_height as i64],
        )?;
        Self::credit_balance(&tx, undo.owner, undo.value_sats)?;
        tx.execute("UPDATE m1_supply SET total_sats = total_sats + ?1 WHERE id = 0", params![undo.value_sats as i64])?;
        tx.commit()?;
        Ok(())
    }

    /// `TX_TRANSFER_M1`: moves M1 balance between two destinations without
    /// touching M0_vaulted or the M1 supply counter.
    pub fn transfer(&self, from: [u8; 20], to: [u8; 20], amount: u64) -> Result<TransferUndo, SettlementError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::debit_balance(&tx, from, amount)?;
        Self::credit_balance(&tx, to, amount)?;
        tx.commit()?;
        Ok(TransferUndo { from, to, amount_sats: amount })
    }

    pub fn undo_transfer(&self, undo: &TransferUndo) -> Result<(), SettlementError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::debit_balance(&tx, undo.to, undo.amount_sats)?;
        Self::credit_balance(&tx, undo.from, undo.amount_sats)?;
        tx.commit()?;
        Ok(())
    }

    fn credit_balance(tx: &Transaction, owner: [u8; 20], amount: u64) -> Result<(), SettlementError> {
        tx.execute(
            "INSERT INTO balances (owner, amount_sats) VALUES (?1, ?2)
             ON CONFLICT(owner) DO UPDATE SET amount_sats = amount_sats + ?2",
            params![owner.to_vec(), amount as i64],
        )?;
        Ok(())
    }

    fn debit_balance(tx: &Transaction, owner: [u8; 20], amount: u64) -> Result<(), SettlementError> {
        let current: i64 = tx
            .query_row("SELECT amount_sats FROM balances WHERE owner = ?1", params![owner.to_vec()], |r| r.get(0))
            .optional()?
            .unwrap_or(0);
        if current < amount as i64 {
            return Err(SettlementError::InsufficientBalance);
        }
        tx.execute(
            "INSERT INTO balances (owner, amount_sats) VALUES (?1, ?2)
             ON CONFLICT(owner) DO UPDATE SET amount_sats = amount_sats - ?2",
            params![owner.to_vec(), amount as i64],
        )?;
        Ok(())
    }

    pub fn balance_of(&self, owner: [u8; 20]) -> Result<u64, SettlementError> {
        let conn = self.conn.lock().unwrap();
        let v: Option<i64> = conn
            .query_row("SELECT amount_sats FROM balances WHERE owner = ?1", params![owner.to_vec()], |r| r.get(0))
            .optional()?;
        Ok(v.unwrap_or(0) as u64)
    }

    pub fn m1_supply(&self) -> Result<u64, SettlementError> {
        let conn = self.conn.lock().unwrap();
        let v: i64 = conn.query_row("SELECT total_sats FROM m1_supply WHERE id = 0", [], |r| r.get(0))?;
        Ok(v as u64)
    }

    pub fn m0_vaulted(&self) -> Result<u64, SettlementError> {
        let conn = self.conn.lock().unwrap();
        let v: Option<i64> = conn.query_row("SELECT COALESCE(SUM(value_sats), 0) FROM vaults", [], |r| r.get(0)).optional()?;
        Ok(v.unwrap_or(0) as u64)
    }

    pub fn vault_outpoint(&self, txid: &Sha256dHash, vout: u32) -> Result<Option<VaultOutpoint>, SettlementError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM vaults WHERE txid = ?1 AND vout = ?2", params![txid.0.to_vec(), vout], Self::row_to_vault)
            .optional()
            .map_err(SettlementError::Sqlite)
    }

    pub fn for_each_vault_by_owner(&self, owner: [u8; 20], mut f: impl FnMut(&VaultOutpoint)) -> Result<(), SettlementError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM vaults WHERE owner = ?1 ORDER BY locked_at_height")?;
        let rows = stmt.query_map(params![owner.to_vec()], Self::row_to_vault)?;
        for row in rows {
            f(&row?);
        }
        Ok(())
    }

    pub fn set_best_block(&self, l1_height: u64, l1_hash: [u8; 32]) -> Result<(), SettlementError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM best_block WHERE id = 0", [])?;
        conn.execute(
            "INSERT INTO best_block (id, l1_height, l1_hash) VALUES (0, ?1, ?2)",
            params![l1_height as i64, l1_hash.to_vec()],
        )?;
        Ok(())
    }

    /// The "all-committed" recovery marker (spec §4.F commit pipeline step
    /// 5): the last L1 height/hash this store finished committing. Every
    /// other on-disk store exposes the same shape so
    /// `NodeContext::startup_check` can compare them on restart.
    pub fn get_best_block(&self) -> Result<Option<(u64, [u8; 32])>, SettlementError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(i64, Vec<u8>)> = conn
            .query_row("SELECT l1_height, l1_hash FROM best_block WHERE id = 0", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()?;
        Ok(row.map(|(h, hash)| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&hash);
            (h as u64, out)
        }))
    }

    /// Spec A6: `M0_vaulted(h) == M1_supply(h)` must hold after every block.
    pub fn assert_m0_m1_invariant(&self) -> Result<(), SettlementError> {
        let vaulted = self.m0_vaulted()?;
        let m1 = self.m1_supply()?;
        if vaulted != m1 {
            return Err(SettlementError::InvariantViolation(format!(
                "M0_vaulted={} != M1_supply={}",
                vaulted, m1
            )));
        }
        Ok(())
    }

    /// Writes `SettlementState(l1_height)` (spec §3, §4.E). Called exactly
    /// once per connected block; overwrites any stale row left by a prior
    /// attempt at the same height.
    pub fn write_settlement_state(&self, l1_height: u64, state: &SettlementState) -> Result<(), SettlementError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settlement_state
                (l1_height, m0_vaulted, m1_supply, m0_total_supply, burnclaims_block, block_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(l1_height) DO UPDATE SET
                m0_vaulted = excluded.m0_vaulted,
                m1_supply = excluded.m1_supply,
                m0_total_supply = excluded.m0_total_supply,
                burnclaims_block = excluded.burnclaims_block,
                block_hash = excluded.block_hash",
            params![
                l1_height as i64,
                state.m0_vaulted as i64,
                state.m1_supply as i64,
                state.m0_total_supply as i64,
                state.burnclaims_block as i64,
                state.block_hash.to_vec(),
            ],
        )?;
        Ok(())
    }

    pub fn get_settlement_state(&self, l1_height: u64) -> Result<Option<SettlementState>, SettlementError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT m0_vaulted, m1_supply, m0_total_supply, burnclaims_block, block_hash
             FROM settlement_state WHERE l1_height = ?1",
            params![l1_height as i64],
            |row| {
                let hash_blob: Vec<u8> = row.get(4)?;
                let mut block_hash = [0u8; 32];
                block_hash.copy_from_slice(&hash_blob);
                Ok(SettlementState {
                    m0_vaulted: row.get::<_, i64>(0)? as u64,
                    m1_supply: row.get::<_, i64>(1)? as u64,
                    m0_total_supply: row.get::<_, i64>(2)? as u64,
                    burnclaims_block: row.get::<_, i64>(3)? as u64,
                    block_hash,
                })
            },
        )
        .optional()
        .map_err(SettlementError::Sqlite)
    }

    /// Deletes `SettlementState(l1_height)` on disconnect of that height.
    pub fn delete_settlement_state(&self, l1_height: u64) -> Result<(), SettlementError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM settlement_state WHERE l1_height = ?1", params![l1_height as i64])?;
        Ok(())
    }

    /// Persists `UnlockUndo(tx_txid)`, keyed by the `TX_UNLOCK` transaction's
    /// own txid (spec §3). Erased by `take_unlock_undo` on disconnect.
    pub fn store_unlock_undo(&self, tx_txid: &Sha256dHash, undo: &UnlockUndo) -> Result<(), SettlementError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO unlock_undo_journal (tx_txid, vault_txid, vout, owner, value_sats, locked_at_height)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tx_txid) DO UPDATE SET
                vault_txid = excluded.vault_txid,
                vout = excluded.vout,
                owner = excluded.owner,
                value_sats = excluded.value_sats,
                locked_at_height = excluded.locked_at_height",
            params![
                tx_txid.0.to_vec(),
                undo.txid.0.to_vec(),
                undo.vout,
                undo.owner.to_vec(),
                undo.value_sats as i64,
                undo.locked_at_height as i64,
            ],
        )?;
        Ok(())
    }

    /// Reads and erases the `UnlockUndo` journaled under `tx_txid` ("erased
    /// after a successful disconnect", spec §3).
    pub fn take_unlock_undo(&self, tx_txid: &Sha256dHash) -> Result<UnlockUndo, SettlementError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let undo = tx
            .query_row(
                "SELECT vault_txid, vout, owner, value_sats, locked_at_height
                 FROM unlock_undo_journal WHERE tx_txid = ?1",
                params![tx_txid.0.to_vec()],
                |row| {
                    let txid_blob: Vec<u8> = row.get(0)?;
                    let mut txid = [0u8; 32];
                    txid.copy_from_slice(&txid_blob);
                    let owner_blob: Vec<u8> = row.get(2)?;
                    let mut owner = [0u8; 20];
                    owner.copy_from_slice(&owner_blob);
                    Ok(UnlockUndo {
                        txid: Sha256dHash(txid),
                        vout: row.get::<_, i64>(1)? as u32,
                        owner,
                        value_sats: row.get::<_, i64>(3)? as u64,
                        locked_at_height: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| SettlementError::UndoJournalMissing(tx_txid.to_string()))?;
        tx.execute("DELETE FROM unlock_undo_journal WHERE tx_txid = ?1", params![tx_txid.0.to_vec()])?;
        tx.commit()?;
        Ok(undo)
    }

    /// Persists `TransferUndo(tx_txid)`, keyed by the `TX_TRANSFER_M1`
    /// transaction's own txid (spec §3).
    pub fn store_transfer_undo(&self, tx_txid: &Sha256dHash, undo: &TransferUndo) -> Result<(), SettlementError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO transfer_undo_journal (tx_txid, from_owner, to_owner, amount_sats)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tx_txid) DO UPDATE SET
                from_owner = excluded.from_owner,
                to_owner = excluded.to_owner,
                amount_sats = excluded.amount_sats",
            params![tx_txid.0.to_vec(), undo.from.to_vec(), undo.to.to_vec(), undo.amount_sats as i64],
        )?;
        Ok(())
    }

    pub fn take_transfer_undo(&self, tx_txid: &Sha256dHash) -> Result<TransferUndo, SettlementError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let undo = tx
            .query_row(
                "SELECT from_owner, to_owner, amount_sats FROM transfer_undo_journal WHERE tx_txid = ?1",
                params![tx_txid.0.to_vec()],
                |row| {
                    let from_blob: Vec<u8> = row.get(0)?;
                    let mut from = [0u8; 20];
                    from.copy_from_slice(&from_blob);
                    let to_blob: Vec<u8> = row.get(1)?;
                    let mut to = [0u8; 20];
                    to.copy_from_slice(&to_blob);
                    Ok(TransferUndo { from, to, amount_sats: row.get::<_, i64>(2)? as u64 })
                },
            )
            .optional()?
            .ok_or_else(|| SettlementError::UndoJournalMissing(tx_txid.to_string()))?;
        tx.execute("DELETE FROM transfer_undo_journal WHERE tx_txid = ?1", params![tx_txid.0.to_vec()])?;
        tx.commit()?;
        Ok(undo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(txid_byte: u8, owner: [u8; 20], value: u64, height: u64) -> VaultOutpoint {
        VaultOutpoint { txid: Sha256dHash([txid_byte; 32]), vout: 0, owner, value_sats: value, locked_at_height: height }
    }

    #[test]
    fn lock_then_unlock_round_trips_and_preserves_invariant() {
        let db = SettlementDb::open_in_memory().unwrap();
        let owner = [0x42; 20];
        let v = vault(1, owner, 5_000_000, 10);
        db.lock(&v, owner, 5_000_000).unwrap();
        db.assert_m0_m1_invariant().unwrap();
        assert_eq!(db.balance_of(owner).unwrap(), 5_000_000);

        let undo = db.unlock(&v.txid, 0, owner, 5_000_000).unwrap();
        db.assert_m0_m1_invariant().unwrap();
        assert_eq!(db.balance_of(owner).unwrap(), 0);
        assert_eq!(db.m0_vaulted().unwrap(), 0);

        db.undo_unlock(&undo).unwrap();
        db.assert_m0_m1_invariant().unwrap();
        assert_eq!(db.balance_of(owner).unwrap(), 5_000_000);
    }

    #[test]
    fn transfer_moves_balance_without_touching_vault_total() {
        let db = SettlementDb::open_in_memory().unwrap();
        let alice = [0x01; 20];
        let bob = [0x02; 20];
        db.lock(&vault(1, alice, 1_000, 1), alice, 1_000).unwrap();

        let before_vaulted = db.m0_vaulted().unwrap();
        let undo = db.transfer(alice, bob, 400).unwrap();
        assert_eq!(db.balance_of(alice).unwrap(), 600);
        assert_eq!(db.balance_of(bob).unwrap(), 400);
        assert_eq!(db.m0_vaulted().unwrap(), before_vaulted);
        db.assert_m0_m1_invariant().unwrap();

        db.undo_transfer(&undo).unwrap();
        assert_eq!(db.balance_of(alice).unwrap(), 1_000);
        assert_eq!(db.balance_of(bob).unwrap(), 0);
    }

    #[test]
    fn unlock_of_unknown_outpoint_fails() {
        let db = SettlementDb::open_in_memory().unwrap();
        let result = db.unlock(&Sha256dHash([9u8; 32]), 0, [0u8; 20], 1);
        assert!(matches!(result, Err(SettlementError::VaultNotFound)));
    }

    #[test]
    fn best_block_round_trips_through_get_and_set() {
        let db = SettlementDb::open_in_memory().unwrap();
        assert_eq!(db.get_best_block().unwrap(), None);
        db.set_best_block(42, [0x07; 32]).unwrap();
        assert_eq!(db.get_best_block().unwrap(), Some((42, [0x07; 32])));
        db.set_best_block(43, [0x08; 32]).unwrap();
        assert_eq!(db.get_best_block().unwrap(), Some((43, [0x08; 32])));
    }

    #[test]
    fn transfer_beyond_balance_is_rejected() {
        let db = SettlementDb::open_in_memory().unwrap();
        let alice = [0x01; 20];
        db.lock(&vault(1, alice, 100, 1), alice, 100).unwrap();
        let result = db.transfer(alice, [0x02; 20], 200);
        assert!(matches!(result, Err(SettlementError::InsufficientBalance)));
    }

    #[test]
    fn settlement_state_round_trips_through_write_get_and_delete() {
        let db = SettlementDb::open_in_memory().unwrap();
        assert_eq!(db.get_settlement_state(7).unwrap(), None);
        let state = SettlementState {
            m0_vaulted: 1_000,
            m1_supply: 1_000,
            m0_total_supply: 5_000,
            burnclaims_block: 1_000,
            block_hash: [0x11; 32],
        };
        db.write_settlement_state(7, &state).unwrap();
        assert_eq!(db.get_settlement_state(7).unwrap(), Some(state));

        let overwritten = SettlementState { burnclaims_block: 0, ..state };
        db.write_settlement_state(7, &overwritten).unwrap();
        assert_eq!(db.get_settlement_state(7).unwrap(), Some(overwritten));

        db.delete_settlement_state(7).unwrap();
        assert_eq!(db.get_settlement_state(7).unwrap(), None);
    }

    #[test]
    fn unlock_undo_journal_round_trips_and_is_erased_on_take() {
        let db = SettlementDb::open_in_memory().unwrap();
        let owner = [0x33; 20];
        let v = vault(1, owner, 2_000, 4);
        db.lock(&v, owner, 2_000).unwrap();
        let tx_txid = Sha256dHash([0xAA; 32]);
        let undo = db.unlock(&v.txid, 0, owner, 2_000).unwrap();
        db.store_unlock_undo(&tx_txid, &undo).unwrap();

        let taken = db.take_unlock_undo(&tx_txid).unwrap();
        assert_eq!(taken, undo);
        let result = db.take_unlock_undo(&tx_txid);
        assert!(matches!(result, Err(SettlementError::UndoJournalMissing(_))));
    }

    #[test]
    fn transfer_undo_journal_round_trips_and_is_erased_on_take() {
        let db = SettlementDb::open_in_memory().unwrap();
        let alice = [0x01; 20];
        let bob = [0x02; 20];
        db.lock(&vault(1, alice, 1_000, 1), alice, 1_000).unwrap();
        let tx_txid = Sha256dHash([0xBB; 32]);
        let undo = db.transfer(alice, bob, 300).unwrap();
        db.store_transfer_undo(&tx_txid, &undo).unwrap();

        let taken = db.take_transfer_undo(&tx_txid).unwrap();
        assert_eq!(taken, undo);
        let result = db.take_transfer_undo(&tx_txid);
        assert!(matches!(result, Err(SettlementError::UndoJournalMissing(_))));
    }
}

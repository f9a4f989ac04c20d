// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Deterministic Masternode (DMN) registry. Shared foundation consulted by
//! the special-TX processor (F: PROREG/PROUPSERV/PROUPREG/PROUPREV and the
//! TX_BTC_HEADERS publisher checks), the DMM scheduler (H) and the finality
//! engine (I). Not itself a numbered spec component — it's the DMN record
//! storage spec §3 describes as "opaque to this spec apart from the fields
//! below".

use std::path::Path;
use std::sync::Mutex;

use bathron_common::hash::Sha256dHash;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::btcheaders::ProTxHash;

/// PoSe score at or above this threshold bans a DMN from producing,
/// publishing or being counted in the finality quorum.
pub const POSE_BAN_THRESHOLD: u32 = 1000;
/// Penalty applied when `DoubleSignEvidence` is recorded against an
/// operator (spec §4.I "Slashing").
pub const POSE_DOUBLE_SIGN_PENALTY: u32 = 1000;

#[derive(Debug, Error)]
pub enum DmnError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("duplicate owner key hash")]
    DuplicateOwnerKey,
    #[error("pro_tx_hash not found")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmnRecord {
    pub pro_tx_hash: ProTxHash,
    pub operator_pubkey: [u8; 33],
    pub owner_key_hash: [u8; 20],
    pub voting_key_hash: [u8; 20],
    pub collateral_outpoint: (Sha256dHash, u32),
    pub registered_height: u64,
    pub confirmed_hash: Option<Sha256dHash>,
    pub pose_score: u32,
    pub revoked: bool,
}

impl DmnRecord {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_hash.is_some() && !self.revoked
    }

    pub fn is_pose_banned(&self) -> bool {
        self.pose_score >= POSE_BAN_THRESHOLD
    }

    pub fn is_valid_producer(&self) -> bool {
        self.is_confirmed() && !self.is_pose_banned()
    }
}

pub struct DmnRegistry {
    conn: Mutex<rusqlite::Connection>,
}

impl DmnRegistry {
    pub fn open(path: &Path) -> Result<Self, DmnError> {
        let conn = crate::util::db::open(path).map_err(|e| match e {
            crate::util::db::DbError::Sqlite(s) => DmnError::Sqlite(s),
            other => DmnError::Sqlite(rusqlite::Error::ModuleError(other.to_string())),
        })?;
        Self::init_schema(&conn)?;
        Ok(DmnRegistry { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, DmnError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(DmnRegistry { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), DmnError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dmns (
                pro_tx_hash BLOB PRIMARY KEY,
                operator_pubkey BLOB,
                owner_key_hash BLOB UNIQUE,
                voting_key_hash BLOB,
                collateral_txid BLOB,
                collateral_vout INTEGER,
                registered_height INTEGER,
                confirmed_hash BLOB,
                pose_score INTEGER,
                revoked INTEGER
            );",
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DmnRecord> {
        let pro_tx: Vec<u8> = row.get("pro_tx_hash")?;
        let op: Vec<u8> = row.get("operator_pubkey")?;
        let owner: Vec<u8> = row.get("owner_key_hash")?;
        let voting: Vec<u8> = row.get("voting_key_hash")?;
        let coll_txid: Vec<u8> = row.get("collateral_txid")?;
        let confirmed: Option<Vec<u8>> = row.get("confirmed_hash")?;

        let mut pro_tx_arr = [0u8; 32];
        pro_tx_arr.copy_from_slice(&pro_tx);
        let mut op_arr = [0u8; 33];
        op_arr.copy_from_slice(&op);
        let mut owner_arr = [0u8; 20];
        owner_arr.copy_from_slice(&owner);
        let mut voting_arr = [0u8; 20];
        voting_arr.copy_from_slice(&voting);
        let mut coll_txid_arr = [0u8; 32];
        coll_txid_arr.copy_from_slice(&coll_txid);

        Ok(DmnRecord {
            pro_tx_hash: ProTxHash(pro_tx_arr),
            operator_pubkey: op_arr,
            owner_key_hash: owner_arr,
            voting_key_hash: voting_arr,
            collateral_outpoint: (Sha256dHash(coll_txid_arr), row.get::<_, i64>("collateral_vout")? as u32),
            registered_height: row.get::<_, i64>("registered_height")? as u64,
            confirmed_hash: confirmed.map(|c| {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&c);
                Sha256dHash(arr)
            }),
            pose_score: row.get::<_, i64>("pose_score")? as u32,
            revoked: row.get::<_, i64>("revoked")? != 0,
        })
    }

    /// `PROREG`. Duplicate operator keys are allowed (one operator can run
    /// many masternodes); duplicate owner keys are forbidden.
    pub fn register(&self, record: &DmnRecord) -> Result<(), DmnError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO dmns (pro_tx_hash, operator_pubkey, owner_key_hash, voting_key_hash, collateral_txid, collateral_vout, registered_height, confirmed_hash, pose_score, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0, 0)",
            params![
                record.pro_tx_hash.0.to_vec(),
                record.operator_pubkey.to_vec(),
                record.owner_key_hash.to_vec(),
                record.voting_key_hash.to_vec(),
                record.collateral_outpoint.0 .0.to_vec(),
                record.collateral_outpoint.1,
                record.registered_height as i64,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(DmnError::DuplicateOwnerKey)
            }
            Err(e) => Err(DmnError::Sqlite(e)),
        }
    }

    pub fn confirm(&self, pro_tx_hash: &ProTxHash, confirmed_hash: Sha256dHash) -> Result<(), DmnError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE dmns SET confirmed_hash = ?2 WHERE pro_tx_hash = ?1",
            params![pro_tx_hash.0.to_vec(), confirmed_hash.0.to_vec()],
        )?;
        if changed == 0 {
            return Err(DmnError::NotFound);
        }
        Ok(())
    }

    /// `PROUPREG`: owner-authorized change of operator/voting keys.
    pub fn update_registrar(&self, pro_tx_hash: &ProTxHash, new_operator_pubkey: Option<[u8; 33]>, new_voting_key_hash: Option<[u8; 20]>) -> Result<(), DmnError> {
        let conn = self.conn.lock().unwrap();
        if let Some(op) = new_operator_pubkey {
            conn.execute("UPDATE dmns SET operator_pubkey = ?2 WHERE pro_tx_hash = ?1", params![pro_tx_hash.0.to_vec(), op.to_vec()])?;
        }
        if let Some(voting) = new_voting_key_hash {
            conn.execute("UPDATE dmns SET voting_key_hash = ?2 WHERE pro_tx_hash = ?1", params![pro_tx_hash.0.to_vec(), voting.to_vec()])?;
        }
        Ok(())
    }

    /// `PROUPREV`: operator-authorized revocation.
    pub fn revoke(&self, pro_tx_hash: &ProTxHash) -> Result<(), DmnError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("UPDATE dmns SET revoked = 1 WHERE pro_tx_hash = ?1", params![pro_tx_hash.0.to_vec()])?;
        if changed == 0 {
            return Err(DmnError::NotFound);
        }
        Ok(())
    }

    pub fn get(&self, pro_tx_hash: &ProTxHash) -> Result<Option<DmnRecord>, DmnError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM dmns WHERE pro_tx_hash = ?1", params![pro_tx_hash.0.to_vec()], Self::row_to_record)
            .optional()
            .map_err(DmnError::Sqlite)
    }

    pub fn increment_pose(&self, pro_tx_hash: &ProTxHash, amount: u32) -> Result<(), DmnError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE dmns SET pose_score = pose_score + ?2 WHERE pro_tx_hash = ?1", params![pro_tx_hash.0.to_vec(), amount])?;
        Ok(())
    }

    /// Every DMN sharing `operator_pubkey` gets slashed together (spec
    /// §4.I: "increment PoSe score for that operator's MNs").
    pub fn increment_pose_for_operator(&self, operator_pubkey: &[u8; 33], amount: u32) -> Result<u32, DmnError> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE dmns SET pose_score = pose_score + ?2 WHERE operator_pubkey = ?1",
            params![operator_pubkey.to_vec(), amount],
        )?;
        Ok(affected as u32)
    }

    pub fn for_each_valid_producer(&self, mut f: impl FnMut(&DmnRecord)) -> Result<(), DmnError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM dmns WHERE confirmed_hash IS NOT NULL AND revoked = 0 AND pose_score < ?1")?;
        let rows = stmt.query_map(params![POSE_BAN_THRESHOLD], Self::row_to_record)?;
        for row in rows {
            f(&row?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(byte: u8, owner: [u8; 20]) -> DmnRecord {
        DmnRecord {
            pro_tx_hash: ProTxHash([byte; 32]),
            operator_pubkey: [byte; 33],
            owner_key_hash: owner,
            voting_key_hash: [byte; 20],
            collateral_outpoint: (Sha256dHash([byte; 32]), 0),
            registered_height: 10,
            confirmed_hash: None,
            pose_score: 0,
            revoked: false,
        }
    }

    #[test]
    fn duplicate_owner_key_rejected_but_duplicate_operator_allowed() {
        let reg = DmnRegistry::open_in_memory().unwrap();
        let mut a = sample(1, [0xAA; 20]);
        a.operator_pubkey = [0x77; 33];
        reg.register(&a).unwrap();

        let mut b = sample(2, [0xAA; 20]);
        b.operator_pubkey = [0x99; 33];
        assert!(matches!(reg.register(&b), Err(DmnError::DuplicateOwnerKey)));

        let mut c = sample(3, [0xCC; 20]);
        c.operator_pubkey = [0x77; 33]; // same operator as `a`, different owner: allowed
        reg.register(&c).unwrap();
    }

    #[test]
    fn pose_ban_threshold_excludes_from_valid_producers() {
        let reg = DmnRegistry::open_in_memory().unwrap();
        let rec = sample(1, [0xAA; 20]);
        reg.register(&rec).unwrap();
        reg.confirm(&rec.pro_tx_hash, Sha256dHash([0xEE; 32])).unwrap();

        let mut seen = 0;
        reg.for_each_valid_producer(|_| seen += 1).unwrap();
        assert_eq!(seen, 1);

        reg.increment_pose(&rec.pro_tx_hash, POSE_BAN_THRESHOLD).unwrap();
        seen = 0;
        reg.for_each_valid_producer(|_| seen += 1).unwrap();
        assert_eq!(seen, 0);
    }
}

// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Shared `rusqlite`-backed store error, analogous to `util_lib::db::Error`
//! in the teacher codebase. Every on-disk component (A, B, D, E, I) wraps
//! this.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("not found")]
    NotFound,
    #[error("corrupt record: {0}")]
    Corruption(String),
    #[error("consistency check failed: {0}")]
    Inconsistent(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Opens (or creates) a sqlite database at `path`, applying the pragmas the
/// teacher's stores rely on for crash-safe single-writer access.
pub fn open(path: &std::path::Path) -> DbResult<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

pub fn open_in_memory() -> DbResult<rusqlite::Connection> {
    Ok(rusqlite::Connection::open_in_memory()?)
}

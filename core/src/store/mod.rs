//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Stages never see a connection; the engine hands the store a finished
//! run and the store publishes it in one transaction.

mod carrier;
mod outputs;

use crate::{error::EngineResult, types::Confidence};
use rusqlite::{types::Type, Connection, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub struct CarrierStore {
    conn: Connection,
}

impl CarrierStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL lets map and API readers keep reading the previous run while
        // a new one is being published. :memory: ignores it.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order. Safe to call on an existing database.
    pub fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_registry.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_engine_outputs.sql"))?;
        Ok(())
    }

    /// Raw SQL escape hatch for tooling and tests (e.g. simulating a
    /// damaged schema). Production paths use the typed methods.
    pub fn execute_batch(&self, sql: &str) -> EngineResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

// ── Column helpers ─────────────────────────────────────────────────

/// Serialize a list column as a JSON text array.
fn to_json<T: Serialize + ?Sized>(value: &T) -> EngineResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn confidence_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Confidence> {
    let text: String = row.get(idx)?;
    Confidence::parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown confidence '{text}'").into())
    })
}

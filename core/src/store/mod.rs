//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The pipeline calls store methods; it never executes SQL directly.

use crate::error::PipelineResult;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;

mod alert;
mod analytics;
mod transaction;

pub struct FraudStore {
    conn: Connection,
    path: Option<String>, // None for :memory:
}

impl FraudStore {
    pub fn open(path: &str) -> PipelineResult<Self> {
        if path == ":memory:" {
            return Self::in_memory();
        }
        let conn = Connection::open(path)?;
        // WAL for concurrent readers of a file database.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        log::info!("Opened fraud store at {path}");
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PipelineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_transactions.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_fraud_alerts.sql"))?;
        Ok(())
    }
}

/// Canonical text form for stored timestamps.
pub(crate) fn ts_to_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_text(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

// ── Analytics rows ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudStats {
    pub total_transactions: u64,
    pub fraud_count: u64,
    /// Percent, two decimals.
    pub fraud_rate: f64,
    pub avg_amount: f64,
    pub fraud_amount: f64,
    /// Transactions the engine sent to review or block.
    pub flagged_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourStats {
    pub hour: u32,
    pub total_txns: u64,
    pub fraud_count: u64,
    pub fraud_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MerchantStats {
    pub merchant_id: String,
    pub transaction_count: u64,
    pub fraud_count: u64,
    pub fraud_rate: f64,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentFraud {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    pub merchant_id: String,
    pub timestamp: DateTime<Utc>,
    pub fraud_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStats {
    pub user_id: String,
    pub total_transactions: u64,
    pub fraud_count: u64,
    pub avg_amount: f64,
    pub first_transaction: DateTime<Utc>,
    pub last_transaction: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeverityCount {
    pub severity: String,
    pub count: u64,
}

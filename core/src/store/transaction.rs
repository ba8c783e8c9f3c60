use super::{ts_from_text, ts_to_text, FraudStore};
use crate::{
    error::PipelineResult,
    scoring::ScoreResult,
    transaction::{FraudType, MerchantCategory, Transaction},
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::io::{BufRead, BufReader, BufWriter, Write};

const UPSERT_SQL: &str =
    "INSERT INTO transactions
        (transaction_id, user_id, timestamp, amount, merchant_id, merchant_name, category,
         card_last4, device_id, ip_address, location_lat, location_lon,
         is_fraud, fraud_type, fraudster_id, fraud_score, risk_level, decision)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
     ON CONFLICT(transaction_id) DO UPDATE SET
        fraud_score = COALESCE(excluded.fraud_score, fraud_score),
        risk_level  = COALESCE(excluded.risk_level, risk_level),
        decision    = COALESCE(excluded.decision, decision)";

const SELECT_COLUMNS: &str =
    "transaction_id, user_id, timestamp, amount, merchant_id, merchant_name, category,
     card_last4, device_id, ip_address, location_lat, location_lon,
     is_fraud, fraud_type, fraudster_id";

pub(super) fn upsert(conn: &Connection, tx: &Transaction, score: Option<&ScoreResult>) -> PipelineResult<()> {
    conn.execute(
        UPSERT_SQL,
        params![
            tx.transaction_id,
            tx.user_id,
            ts_to_text(&tx.timestamp),
            tx.amount,
            tx.merchant_id,
            tx.merchant_name,
            tx.merchant_category.as_str(),
            tx.card_last4,
            tx.device_id,
            tx.ip_address,
            tx.location_lat,
            tx.location_lon,
            tx.is_fraud as i32,
            tx.fraud_type.map(|t| t.as_str()),
            tx.fraudster_id,
            score.map(|s| s.risk_score),
            score.map(|s| s.risk_level.as_str()),
            score.map(|s| s.decision.as_str()),
        ],
    )?;
    Ok(())
}

fn text_err(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {what} '{raw}'").into(),
    )
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let category: String = row.get(6)?;
    let fraud_type: Option<String> = row.get(13)?;
    Ok(Transaction {
        transaction_id: row.get(0)?,
        user_id: row.get(1)?,
        timestamp: ts_from_text(2, &row.get::<_, String>(2)?)?,
        amount: row.get(3)?,
        merchant_id: row.get(4)?,
        merchant_name: row.get(5)?,
        merchant_category: MerchantCategory::parse(&category)
            .ok_or_else(|| text_err(6, "category", &category))?,
        card_last4: row.get(7)?,
        device_id: row.get(8)?,
        ip_address: row.get(9)?,
        location_lat: row.get(10)?,
        location_lon: row.get(11)?,
        is_fraud: row.get::<_, i32>(12)? != 0,
        fraud_type: match fraud_type {
            Some(raw) => Some(FraudType::parse(&raw).ok_or_else(|| text_err(13, "fraud type", &raw))?),
            None => None,
        },
        fraudster_id: row.get(14)?,
    })
}

impl FraudStore {
    // ── Transactions ─────────────────────────────────────────────────

    /// Insert, or attach a score to an existing row with the same id.
    pub fn insert_transaction(
        &self,
        tx: &Transaction,
        score: Option<&ScoreResult>,
    ) -> PipelineResult<()> {
        upsert(&self.conn, tx, score)
    }

    /// Insert many transactions in one SQL transaction.
    pub fn insert_batch(&mut self, transactions: &[Transaction]) -> PipelineResult<usize> {
        let sql_tx = self.conn.transaction()?;
        for tx in transactions {
            upsert(&sql_tx, tx, None)?;
        }
        sql_tx.commit()?;
        log::info!("Inserted {} transactions", transactions.len());
        Ok(transactions.len())
    }

    pub fn get_transaction(&self, transaction_id: &str) -> PipelineResult<Option<Transaction>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM transactions WHERE transaction_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![transaction_id], row_to_transaction)
            .optional()?)
    }

    /// Stored score of a transaction, if it has been scored.
    pub fn transaction_score(&self, transaction_id: &str) -> PipelineResult<Option<f64>> {
        let score: Option<Option<f64>> = self
            .conn
            .query_row(
                "SELECT fraud_score FROM transactions WHERE transaction_id = ?1",
                params![transaction_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score.flatten())
    }

    pub fn transaction_count(&self) -> PipelineResult<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// All transactions in time order.
    pub fn all_transactions(&self) -> PipelineResult<Vec<Transaction>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM transactions ORDER BY timestamp, transaction_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_transaction)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── JSONL import/export ──────────────────────────────────────────

    /// Write every transaction as one JSON object per line.
    pub fn export_jsonl(&self, path: &str) -> PipelineResult<usize> {
        let transactions = self.all_transactions()?;
        let mut out = BufWriter::new(std::fs::File::create(path)?);
        for tx in &transactions {
            serde_json::to_writer(&mut out, tx)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        log::info!("Exported {} transactions to {path}", transactions.len());
        Ok(transactions.len())
    }

    /// Load a JSONL export. Blank lines are skipped.
    pub fn load_jsonl(&mut self, path: &str) -> PipelineResult<usize> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut transactions = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            transactions.push(serde_json::from_str::<Transaction>(&line)?);
        }
        let n = self.insert_batch(&transactions)?;
        log::info!("Loaded {n} transactions from {path}");
        Ok(n)
    }
}

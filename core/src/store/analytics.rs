use super::{
    ts_from_text, FraudStats, FraudStore, HourStats, MerchantStats, RecentFraud, UserStats,
};
use crate::error::{PipelineError, PipelineResult};
use rusqlite::{params, types::ValueRef, OptionalExtension};
use serde_json::{Map, Value};

/// `100 * fraud / total` rounded to two decimals, 0 on empty groups.
const FRAUD_RATE_SQL: &str =
    "CASE WHEN COUNT(*) = 0 THEN 0.0
          ELSE ROUND(100.0 * SUM(is_fraud) / COUNT(*), 2) END";

impl FraudStore {
    // ── Analytics ────────────────────────────────────────────────────

    pub fn fraud_stats(&self) -> PipelineResult<FraudStats> {
        let sql = format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(is_fraud), 0),
                    {FRAUD_RATE_SQL},
                    COALESCE(ROUND(AVG(amount), 2), 0.0),
                    COALESCE(ROUND(SUM(CASE WHEN is_fraud = 1 THEN amount ELSE 0 END), 2), 0.0),
                    COALESCE(SUM(CASE WHEN decision IN ('review', 'block') THEN 1 ELSE 0 END), 0)
             FROM transactions"
        );
        let stats = self.conn.query_row(&sql, [], |row| {
            Ok(FraudStats {
                total_transactions: row.get::<_, i64>(0)? as u64,
                fraud_count: row.get::<_, i64>(1)? as u64,
                fraud_rate: row.get(2)?,
                avg_amount: row.get(3)?,
                fraud_amount: row.get(4)?,
                flagged_count: row.get::<_, i64>(5)? as u64,
            })
        })?;
        Ok(stats)
    }

    /// Fraud rate per UTC hour of day, hours without traffic omitted.
    pub fn fraud_by_hour(&self) -> PipelineResult<Vec<HourStats>> {
        let sql = format!(
            "SELECT CAST(strftime('%H', timestamp) AS INTEGER) AS hour,
                    COUNT(*), SUM(is_fraud), {FRAUD_RATE_SQL}
             FROM transactions
             GROUP BY hour
             ORDER BY hour"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(HourStats {
                hour: row.get::<_, i64>(0)? as u32,
                total_txns: row.get::<_, i64>(1)? as u64,
                fraud_count: row.get::<_, i64>(2)? as u64,
                fraud_rate: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Busiest merchants by transaction count.
    pub fn top_merchants(&self, limit: usize) -> PipelineResult<Vec<MerchantStats>> {
        let sql = format!(
            "SELECT merchant_id, COUNT(*) AS n, SUM(is_fraud), {FRAUD_RATE_SQL},
                    ROUND(SUM(amount), 2)
             FROM transactions
             GROUP BY merchant_id
             ORDER BY n DESC, merchant_id
             LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(MerchantStats {
                merchant_id: row.get(0)?,
                transaction_count: row.get::<_, i64>(1)? as u64,
                fraud_count: row.get::<_, i64>(2)? as u64,
                fraud_rate: row.get(3)?,
                total_amount: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Latest fraud-labelled transactions, newest first.
    pub fn recent_fraud(&self, limit: usize) -> PipelineResult<Vec<RecentFraud>> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id, user_id, amount, merchant_id, timestamp, fraud_score
             FROM transactions
             WHERE is_fraud = 1
             ORDER BY timestamp DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RecentFraud {
                transaction_id: row.get(0)?,
                user_id: row.get(1)?,
                amount: row.get(2)?,
                merchant_id: row.get(3)?,
                timestamp: ts_from_text(4, &row.get::<_, String>(4)?)?,
                fraud_score: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn user_stats(&self, user_id: &str) -> PipelineResult<Option<UserStats>> {
        Ok(self
            .conn
            .query_row(
                "SELECT user_id, COUNT(*), SUM(is_fraud), ROUND(AVG(amount), 2),
                        MIN(timestamp), MAX(timestamp)
                 FROM transactions
                 WHERE user_id = ?1
                 GROUP BY user_id",
                params![user_id],
                |row| {
                    Ok(UserStats {
                        user_id: row.get(0)?,
                        total_transactions: row.get::<_, i64>(1)? as u64,
                        fraud_count: row.get::<_, i64>(2)? as u64,
                        avg_amount: row.get(3)?,
                        first_transaction: ts_from_text(4, &row.get::<_, String>(4)?)?,
                        last_transaction: ts_from_text(5, &row.get::<_, String>(5)?)?,
                    })
                },
            )
            .optional()?)
    }

    /// Run an ad-hoc read-only query; each row becomes a JSON object keyed
    /// by column name.
    pub fn execute_query(&self, sql: &str) -> PipelineResult<Vec<Value>> {
        let mut stmt = self.conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "only read-only statements may be executed: {sql}"
            )));
        }
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut obj = Map::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                let value = match row.get_ref(i)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(n) => Value::from(n),
                    ValueRef::Real(f) => Value::from(f),
                    ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => {
                        Value::String(b.iter().map(|byte| format!("{byte:02x}")).collect())
                    }
                };
                obj.insert(name.clone(), value);
            }
            out.push(Value::Object(obj));
        }
        Ok(out)
    }
}

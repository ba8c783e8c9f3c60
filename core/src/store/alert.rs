use super::{transaction::upsert, ts_to_text, FraudStore, SeverityCount};
use crate::{
    error::{PipelineError, PipelineResult},
    scoring::{FraudAlert, ScoreResult},
    transaction::Transaction,
};
use rusqlite::{params, Connection};

/// Returns false when the transaction already has an alert.
fn insert_alert_row(conn: &Connection, alert: &FraudAlert) -> PipelineResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO fraud_alerts
            (alert_id, transaction_id, alert_type, severity, risk_score, decision, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            alert.alert_id,
            alert.transaction_id,
            alert.alert_type(),
            alert.risk_level.as_str(),
            alert.risk_score,
            alert.decision.as_str(),
            serde_json::to_string(alert)?,
            ts_to_text(&alert.timestamp),
        ],
    )?;
    Ok(inserted == 1)
}

impl FraudStore {
    // ── Alerts ───────────────────────────────────────────────────────

    /// The referenced transaction must already be stored. Returns false
    /// when it already has an alert.
    pub fn insert_alert(&self, alert: &FraudAlert) -> PipelineResult<bool> {
        insert_alert_row(&self.conn, alert)
    }

    /// Store a scored transaction and its alert in one SQL transaction.
    /// Returns true only when the alert is new.
    pub fn record_scored(
        &mut self,
        tx: &Transaction,
        result: &ScoreResult,
        alert: Option<&FraudAlert>,
    ) -> PipelineResult<bool> {
        let sql_tx = self.conn.transaction()?;
        upsert(&sql_tx, tx, Some(result))?;
        let fresh = match alert {
            Some(alert) => insert_alert_row(&sql_tx, alert)?,
            None => false,
        };
        sql_tx.commit()?;
        Ok(fresh)
    }

    pub fn alerts_for_transaction(&self, transaction_id: &str) -> PipelineResult<Vec<FraudAlert>> {
        let mut stmt = self.conn.prepare(
            "SELECT details FROM fraud_alerts WHERE transaction_id = ?1 ORDER BY created_at",
        )?;
        let details = stmt
            .query_map(params![transaction_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        details
            .iter()
            .map(|d| serde_json::from_str::<FraudAlert>(d).map_err(PipelineError::from))
            .collect()
    }

    pub fn alert_count(&self) -> PipelineResult<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM fraud_alerts", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Alert counts per severity, most severe first.
    pub fn alerts_by_severity(&self) -> PipelineResult<Vec<SeverityCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT severity, COUNT(*) FROM fraud_alerts
             GROUP BY severity
             ORDER BY CASE severity
                 WHEN 'critical' THEN 0 WHEN 'high' THEN 1
                 WHEN 'medium' THEN 2 ELSE 3 END",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SeverityCount {
                severity: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

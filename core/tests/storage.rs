//! Store persistence and analytics queries.

use chrono::{TimeZone, Utc};
use fraudstream_core::{
    config::PipelineConfig,
    generator::TransactionGenerator,
    model::ModelScores,
    scoring::{Decision, FraudAlert, RiskLevel, ScoreResult},
    store::FraudStore,
    transaction::{FraudType, MerchantCategory, Transaction},
};

fn store() -> FraudStore {
    let store = FraudStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store
}

fn tx(id: &str, user: &str, hour: u32, minute: u32, amount: f64, merchant: &str, fraud: bool) -> Transaction {
    Transaction {
        transaction_id: id.to_string(),
        user_id: user.to_string(),
        timestamp: Utc.with_ymd_and_hms(2025, 3, 1, hour, minute, 0).unwrap(),
        amount,
        merchant_id: merchant.to_string(),
        merchant_category: MerchantCategory::Electronics,
        merchant_name: format!("{merchant} store"),
        card_last4: "4242".to_string(),
        device_id: format!("device-{user}"),
        ip_address: "10.0.0.1".to_string(),
        location_lat: 40.7,
        location_lon: -74.0,
        is_fraud: fraud,
        fraud_type: fraud.then_some(FraudType::HighAmount),
        fraudster_id: fraud.then(|| "fraudster_000".to_string()),
    }
}

fn result(score: f64, level: RiskLevel, decision: Decision) -> ScoreResult {
    let mut model_scores = ModelScores::new();
    model_scores.insert("logistic".to_string(), score);
    ScoreResult {
        risk_score: score,
        model_scores,
        triggered: vec!["very_large_amount".to_string()],
        risk_level: level,
        decision,
    }
}

/// t2 is the only fraud and the only blocked transaction.
fn seeded_store() -> FraudStore {
    let store = store();
    let approve = result(0.05, RiskLevel::Low, Decision::Approve);
    store.insert_transaction(&tx("t1", "user_a", 10, 0, 100.0, "m1", false), Some(&approve)).unwrap();
    store
        .insert_transaction(
            &tx("t2", "user_a", 10, 30, 300.0, "m1", true),
            Some(&result(0.95, RiskLevel::Critical, Decision::Block)),
        )
        .unwrap();
    store.insert_transaction(&tx("t3", "user_b", 14, 0, 50.0, "m2", false), Some(&approve)).unwrap();
    store.insert_transaction(&tx("t4", "user_b", 14, 10, 150.0, "m1", false), None).unwrap();
    store
}

#[test]
fn empty_store_stats_are_zero() {
    let stats = store().fraud_stats().unwrap();
    assert_eq!(stats.total_transactions, 0);
    assert_eq!(stats.fraud_count, 0);
    assert_eq!(stats.fraud_rate, 0.0);
    assert_eq!(stats.avg_amount, 0.0);
    assert!(store().fraud_by_hour().unwrap().is_empty());
    assert!(store().recent_fraud(5).unwrap().is_empty());
}

#[test]
fn migrate_is_idempotent() {
    let store = seeded_store();
    store.migrate().unwrap();
    assert_eq!(store.transaction_count().unwrap(), 4);
}

#[test]
fn fraud_stats_aggregate_all_rows() {
    let stats = seeded_store().fraud_stats().unwrap();
    assert_eq!(stats.total_transactions, 4);
    assert_eq!(stats.fraud_count, 1);
    assert_eq!(stats.fraud_rate, 25.0);
    assert_eq!(stats.avg_amount, 150.0);
    assert_eq!(stats.fraud_amount, 300.0);
    assert_eq!(stats.flagged_count, 1);
}

#[test]
fn breakdowns_by_hour_merchant_and_user() {
    let store = seeded_store();

    let hours = store.fraud_by_hour().unwrap();
    assert_eq!(hours.len(), 2);
    assert_eq!((hours[0].hour, hours[0].total_txns, hours[0].fraud_count), (10, 2, 1));
    assert_eq!(hours[0].fraud_rate, 50.0);
    assert_eq!((hours[1].hour, hours[1].fraud_count), (14, 0));

    let merchants = store.top_merchants(1).unwrap();
    assert_eq!(merchants.len(), 1);
    assert_eq!(merchants[0].merchant_id, "m1");
    assert_eq!(merchants[0].transaction_count, 3);
    assert_eq!(merchants[0].fraud_count, 1);
    assert_eq!(merchants[0].fraud_rate, 33.33);
    assert_eq!(merchants[0].total_amount, 550.0);

    let recent = store.recent_fraud(5).unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].transaction_id, "t2");
    assert_eq!(recent[0].fraud_score, Some(0.95));

    let user = store.user_stats("user_a").unwrap().expect("user_a has rows");
    assert_eq!(user.total_transactions, 2);
    assert_eq!(user.fraud_count, 1);
    assert_eq!(user.avg_amount, 200.0);
    assert_eq!(user.first_transaction, Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap());
    assert_eq!(user.last_transaction, Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 0).unwrap());
    assert!(store.user_stats("nobody").unwrap().is_none());
}

#[test]
fn rows_round_trip_and_rescoring_keeps_scores() {
    let store = seeded_store();
    let stored = tx("t2", "user_a", 10, 30, 300.0, "m1", true);
    assert_eq!(store.get_transaction("t2").unwrap(), Some(stored.clone()));
    assert!(store.get_transaction("missing").unwrap().is_none());

    // A redelivered message without a score must not wipe the stored one.
    store.insert_transaction(&stored, None).unwrap();
    assert_eq!(store.transaction_count().unwrap(), 4);
    assert_eq!(store.transaction_score("t2").unwrap(), Some(0.95));
    assert_eq!(store.transaction_score("t4").unwrap(), None);
}

#[test]
fn alerts_reference_stored_transactions() {
    let store = seeded_store();
    let t2 = tx("t2", "user_a", 10, 30, 300.0, "m1", true);
    let alert = FraudAlert::new(&t2, &result(0.95, RiskLevel::Critical, Decision::Block));
    assert!(store.insert_alert(&alert).unwrap());
    // A second alert for the same transaction is ignored.
    let again = FraudAlert::new(&t2, &result(0.97, RiskLevel::Critical, Decision::Block));
    assert!(!store.insert_alert(&again).unwrap());

    let stored = store.alerts_for_transaction("t2").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].alert_id, alert.alert_id);
    assert_eq!(stored[0].alert_type(), "very_large_amount");
    assert_eq!(store.alert_count().unwrap(), 1);

    let severities = store.alerts_by_severity().unwrap();
    assert_eq!(severities.len(), 1);
    assert_eq!(severities[0].severity, "critical");
    assert_eq!(severities[0].count, 1);

    let orphan = FraudAlert::new(
        &tx("ghost", "user_z", 1, 0, 1.0, "m9", true),
        &result(0.9, RiskLevel::Critical, Decision::Block),
    );
    assert!(store.insert_alert(&orphan).is_err(), "foreign key must be enforced");
}

#[test]
fn scored_transaction_and_alert_are_recorded_together() {
    let mut store = store();
    let t = tx("t9", "user_c", 9, 0, 9000.0, "m3", true);
    let scored = result(0.9, RiskLevel::Critical, Decision::Block);
    let alert = FraudAlert::new(&t, &scored);

    assert!(store.record_scored(&t, &scored, Some(&alert)).unwrap());
    assert!(!store
        .record_scored(&t, &scored, Some(&FraudAlert::new(&t, &scored)))
        .unwrap());
    assert!(!store.record_scored(&t, &scored, None).unwrap());

    assert_eq!(store.transaction_count().unwrap(), 1);
    assert_eq!(store.transaction_score("t9").unwrap(), Some(0.9));
    let alerts = store.alerts_for_transaction("t9").unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_id, alert.alert_id);
}

#[test]
fn ad_hoc_queries_are_read_only() {
    let store = seeded_store();
    let rows = store
        .execute_query("SELECT user_id, COUNT(*) AS n FROM transactions GROUP BY user_id ORDER BY user_id")
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["user_id"], "user_a");
    assert_eq!(rows[0]["n"], 2);

    assert!(store.execute_query("DELETE FROM transactions").is_err());
    assert_eq!(store.transaction_count().unwrap(), 4);
}

#[test]
fn jsonl_export_loads_into_fresh_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("fraud.db");
    let export_path = dir.path().join("transactions.jsonl");
    let db_path = db_path.to_str().expect("utf-8 path");
    let export_path = export_path.to_str().expect("utf-8 path");

    let config = PipelineConfig::default_test();
    let mut generator = TransactionGenerator::new(&config.generator);
    let mut source = FraudStore::open(db_path).unwrap();
    assert_eq!(source.path(), Some(db_path));
    source.migrate().unwrap();
    assert_eq!(source.insert_batch(&generator.generate_batch(120, 0.2)).unwrap(), 120);
    assert_eq!(source.export_jsonl(export_path).unwrap(), 120);

    let mut target = store();
    assert_eq!(target.load_jsonl(export_path).unwrap(), 120);
    assert_eq!(target.all_transactions().unwrap(), source.all_transactions().unwrap());
    assert_eq!(target.fraud_stats().unwrap().fraud_count, 24);
}

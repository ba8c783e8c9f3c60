//! End to end: generator -> stream -> worker pool -> store, graph and alerts.

use fraudstream_core::{
    config::PipelineConfig,
    consumer::TransactionConsumer,
    generator::TransactionGenerator,
    pipeline::FraudPipeline,
    producer::TransactionProducer,
    store::FraudStore,
    stream::StreamBroker,
    transaction::FraudType,
};
use std::sync::Arc;
use std::time::Duration;

fn build(config: PipelineConfig) -> (Arc<FraudPipeline>, TransactionProducer, TransactionGenerator) {
    let _ = env_logger::builder().is_test(true).try_init();
    let broker = StreamBroker::new();
    let generator = TransactionGenerator::new(&config.generator);
    let producer = TransactionProducer::new(broker.clone(), config.broker.stream_name.clone());
    let store = FraudStore::in_memory().expect("in-memory store");
    let pipeline = FraudPipeline::build(config, store, broker).expect("pipeline");
    (Arc::new(pipeline), producer, generator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_process_every_published_transaction() {
    let (pipeline, producer, mut generator) = build(PipelineConfig::default_test());
    let batch = generator.generate_batch(400, 0.1);
    producer.publish_batch(&batch).expect("publish");

    let processed = pipeline.run_until_drained(3).await.expect("run");
    assert_eq!(processed, 400);
    assert_eq!(pipeline.backlog().expect("backlog"), (false, 0));

    let stats = pipeline.with_store(|s| s.fraud_stats()).expect("stats");
    assert_eq!(stats.total_transactions, 400);
    assert_eq!(stats.fraud_count, 40);

    let metrics = pipeline.metrics().summary();
    assert_eq!(metrics.processed, 400);
    assert_eq!(metrics.failed, 0);
    assert_eq!(metrics.score_distribution.iter().sum::<u64>(), 400);
    assert_eq!(metrics.decisions.values().sum::<u64>(), 400);

    // Every alert is persisted and mirrored onto the alert stream.
    let stored_alerts = pipeline.with_store(|s| s.alert_count()).expect("alerts");
    assert_eq!(stored_alerts, metrics.alerts);
    assert_eq!(pipeline.alert_stream_len() as u64, metrics.alerts);

    let (nodes, edges) = pipeline.graph_size();
    assert!(nodes > 0 && edges > 0);
}

#[test]
fn high_amount_fraud_is_blocked_and_alerted() {
    let (pipeline, _producer, mut generator) = build(PipelineConfig::default_test());
    for _ in 0..200 {
        pipeline.process(&generator.generate_normal()).expect("process");
    }
    let fraud = generator.generate_fraud_of(FraudType::HighAmount);
    let result = pipeline.process(&fraud).expect("process");
    assert_ne!(result.decision.as_str(), "approve");
    assert!(result.triggered.iter().any(|r| r == "very_large_amount"));

    let alerts = pipeline
        .with_store(|s| s.alerts_for_transaction(&fraud.transaction_id))
        .expect("alerts");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].user_id, fraud.user_id);
}

/// The alert stream carries JSON alerts a downstream group can read.
#[tokio::test]
async fn alert_stream_is_consumable() {
    let config = PipelineConfig::default_test();
    let alert_stream = config.broker.alert_stream.clone();
    let (pipeline, _producer, mut generator) = build(config);
    pipeline
        .process(&generator.generate_fraud_of(FraudType::HighAmount))
        .expect("process");

    let entries = pipeline.broker().xrange(&alert_stream);
    assert_eq!(entries.len(), 1);
    let alert: serde_json::Value =
        serde_json::from_str(&entries[0].fields["data"]).expect("alert json");
    assert!(alert["alert_id"].is_string());
    assert!(alert["risk_score"].as_f64().unwrap() >= 0.5);
    assert!(alert["timestamp"].is_string());
}

/// Redelivered entries are scored again but stored once.
#[test]
fn redelivery_does_not_duplicate_rows() {
    let (pipeline, producer, mut generator) = build(PipelineConfig::default_test());
    let tx = generator.generate_normal();
    producer.publish_transaction(&tx).expect("publish");
    producer.publish_transaction(&tx).expect("publish again");

    assert_eq!(pipeline.drain().expect("drain"), 2);
    assert_eq!(pipeline.with_store(|s| s.transaction_count()).expect("count"), 1);
    assert_eq!(pipeline.metrics().processed(), 2);
}

/// A redelivered alerting transaction raises its alert once.
#[test]
fn redelivered_fraud_is_alerted_once() {
    let (pipeline, producer, mut generator) = build(PipelineConfig::default_test());
    let fraud = generator.generate_fraud_of(FraudType::HighAmount);
    producer.publish_transaction(&fraud).expect("publish");
    producer.publish_transaction(&fraud).expect("publish again");

    assert_eq!(pipeline.drain().expect("drain"), 2);
    assert_eq!(pipeline.with_store(|s| s.transaction_count()).expect("count"), 1);
    assert_eq!(pipeline.with_store(|s| s.alert_count()).expect("alerts"), 1);
    assert_eq!(pipeline.alert_stream_len(), 1);
    assert_eq!(pipeline.metrics().summary().alerts, 1);
    assert_eq!(pipeline.metrics().processed(), 2);
}

/// Entries stranded by a dead consumer are picked up when workers start.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_reclaim_stranded_entries() {
    let mut config = PipelineConfig::default_test();
    config.workers.claim_idle_ms = 20;
    let broker_config = config.broker.clone();
    let (pipeline, producer, mut generator) = build(config);
    producer
        .publish_batch(&generator.generate_batch(25, 0.0))
        .expect("publish");

    let dead = TransactionConsumer::new(pipeline.broker().clone(), &broker_config, "dead")
        .expect("consumer");
    let stranded = dead.consume_messages(10, None).await.expect("read");
    assert_eq!(stranded.len(), 10);
    tokio::time::sleep(Duration::from_millis(40)).await;

    let processed = pipeline.run_until_drained(2).await.expect("run");
    assert_eq!(processed, 25);
    assert_eq!(pipeline.with_store(|s| s.transaction_count()).expect("count"), 25);
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = PipelineConfig::default_test();
    config.generator.fraud_ratio = 1.5;
    let err = FraudPipeline::build(config, FraudStore::in_memory().unwrap(), StreamBroker::new())
        .err()
        .expect("must fail");
    assert!(err.to_string().contains("fraud_ratio"));
}

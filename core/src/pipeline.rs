//! Wires the stream, feature window, scoring engine, store and graph into
//! one processing path.
//!
//! Per transaction: features -> score -> persist (+ alert row) -> graph ->
//! alert stream -> metrics.

use crate::{
    config::PipelineConfig,
    consumer::{TransactionConsumer, TransactionHandler},
    error::{PipelineError, PipelineResult},
    features::FeatureWindow,
    graph::{FraudRing, RelationshipGraph},
    metrics::PipelineMetrics,
    producer::TransactionProducer,
    scoring::{Decision, ScoreResult, ScoringEngine},
    store::FraudStore,
    stream::StreamBroker,
    transaction::Transaction,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct FraudPipeline {
    config: PipelineConfig,
    broker: StreamBroker,
    window: Mutex<FeatureWindow>,
    engine: ScoringEngine,
    store: Mutex<FraudStore>,
    graph: Mutex<RelationshipGraph>,
    metrics: Arc<PipelineMetrics>,
    alerts: TransactionProducer,
}

impl FraudPipeline {
    /// Validate config, migrate the store and load the configured models.
    pub fn build(
        config: PipelineConfig,
        store: FraudStore,
        broker: StreamBroker,
    ) -> PipelineResult<Self> {
        let engine = ScoringEngine::from_config(&config.scoring)?;
        Self::with_engine(config, store, broker, engine)
    }

    pub fn with_engine(
        config: PipelineConfig,
        store: FraudStore,
        broker: StreamBroker,
        engine: ScoringEngine,
    ) -> PipelineResult<Self> {
        config.validate()?;
        store.migrate()?;
        let alerts = TransactionProducer::new(broker.clone(), config.broker.alert_stream.clone())
            .with_max_len(config.broker.max_len);
        log::info!(
            "Pipeline ready: stream {}, group {}, models {:?}",
            config.broker.stream_name,
            config.broker.consumer_group,
            engine.model_names()
        );
        Ok(Self {
            window: Mutex::new(FeatureWindow::new(&config.features)),
            engine,
            store: Mutex::new(store),
            graph: Mutex::new(RelationshipGraph::new()),
            metrics: Arc::new(PipelineMetrics::new()),
            alerts,
            broker,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn broker(&self) -> &StreamBroker {
        &self.broker
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run `f` against the store while holding its lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&FraudStore) -> R) -> R {
        f(&lock(&self.store))
    }

    pub fn process(&self, tx: &Transaction) -> PipelineResult<ScoreResult> {
        let started = Instant::now();
        let outcome = self.score_and_record(tx);
        match &outcome {
            Ok(result) => {
                self.metrics.record_model_agreement(&result.model_scores);
                self.metrics
                    .record_transaction(started.elapsed(), result.risk_score, result.decision);
            }
            Err(_) => self.metrics.record_failure(),
        }
        outcome
    }

    fn score_and_record(&self, tx: &Transaction) -> PipelineResult<ScoreResult> {
        let features = lock(&self.window).observe(tx);
        let result = self.engine.score(tx, &features);
        let alert = self.engine.alert_for(tx, &result);

        let fresh_alert = lock(&self.store).record_scored(tx, &result, alert.as_ref())?;

        lock(&self.graph).add_transaction(tx, result.decision != Decision::Approve);

        match &alert {
            Some(alert) if fresh_alert => {
                self.alerts.publish_json(serde_json::to_value(alert)?)?;
                self.metrics.record_alert(alert.risk_level);
                log::warn!(
                    "FRAUD ALERT {}: txn {} user {} ${:.2} score {:.3} ({}, {}) [{}]",
                    alert.alert_id,
                    alert.transaction_id,
                    alert.user_id,
                    alert.amount,
                    alert.risk_score,
                    alert.risk_level,
                    alert.decision,
                    alert.triggered.join(", ")
                );
            }
            Some(alert) => {
                log::debug!("Alert for txn {} already raised", alert.transaction_id);
            }
            None => {}
        }
        Ok(result)
    }

    fn consumer(&self, name: &str) -> PipelineResult<TransactionConsumer> {
        Ok(
            TransactionConsumer::new(self.broker.clone(), &self.config.broker, name)?
                .with_block(Duration::from_millis(self.config.workers.block_ms)),
        )
    }

    /// Process everything currently on the stream on the calling thread.
    pub fn drain(&self) -> PipelineResult<u64> {
        let consumer = self.consumer("drain")?;
        let processed = consumer.process_available(self, self.config.workers.batch_size)?;
        log::info!("Drained {processed} transactions");
        Ok(processed)
    }

    /// Spawn `workers` consumers in the shared group and run them until
    /// `shutdown` flips. Returns the total processed.
    pub async fn run_workers(
        self: &Arc<Self>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> PipelineResult<u64> {
        let claim_idle = Duration::from_millis(self.config.workers.claim_idle_ms);
        let batch_size = self.config.workers.batch_size;

        let mut handles = Vec::with_capacity(workers);
        for i in 1..=workers {
            let consumer = self.consumer(&format!("worker-{i}"))?;
            let pipeline = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                // Pick up whatever a crashed worker left behind.
                let recovered = consumer.recover_pending(pipeline.as_ref(), claim_idle)?;
                let consumed = consumer
                    .start_consuming(pipeline.as_ref(), batch_size, shutdown)
                    .await?;
                Ok::<u64, PipelineError>(recovered + consumed)
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle
                .await
                .map_err(|e| PipelineError::Other(anyhow::anyhow!("worker task failed: {e}")))??;
        }
        log::info!("{workers} workers processed {total} transactions");
        Ok(total)
    }

    /// Entries not yet delivered plus entries delivered but unacknowledged.
    pub fn backlog(&self) -> PipelineResult<(bool, usize)> {
        let b = &self.config.broker;
        let undelivered = self.broker.has_undelivered(&b.stream_name, &b.consumer_group)?;
        let pending = self.broker.xpending(&b.stream_name, &b.consumer_group)?.count;
        Ok((undelivered, pending))
    }

    /// Run workers until the stream is fully consumed, then shut them down.
    /// Entries stuck pending past the claim timeout are left for a later run.
    pub async fn run_until_drained(self: &Arc<Self>, workers: usize) -> PipelineResult<u64> {
        let (stop, shutdown) = watch::channel(false);
        let runner = {
            let pipeline = Arc::clone(self);
            tokio::spawn(async move { pipeline.run_workers(workers, shutdown).await })
        };

        let poll = Duration::from_millis((self.config.workers.block_ms / 2).max(5));
        let give_up = Duration::from_millis(self.config.workers.claim_idle_ms.max(1));
        let mut stalled_since: Option<(Instant, usize)> = None;
        loop {
            tokio::time::sleep(poll).await;
            let (undelivered, pending) = self.backlog()?;
            if !undelivered && pending == 0 {
                break;
            }
            if undelivered {
                stalled_since = None;
                continue;
            }
            match stalled_since {
                Some((since, count)) if count == pending => {
                    if since.elapsed() >= give_up {
                        log::warn!("{pending} messages still pending after drain, leaving them");
                        break;
                    }
                }
                _ => stalled_since = Some((Instant::now(), pending)),
            }
        }

        // Receivers are gone only if every worker already exited.
        let _ = stop.send(true);
        runner
            .await
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("worker pool failed: {e}")))?
    }

    pub fn detect_rings(&self) -> Vec<FraudRing> {
        lock(&self.graph).detect_rings(self.config.graph.min_ring_users)
    }

    pub fn graph_size(&self) -> (usize, usize) {
        let graph = lock(&self.graph);
        (graph.node_count(), graph.edge_count())
    }

    pub fn alert_stream_len(&self) -> usize {
        self.alerts.stream_length()
    }
}

impl TransactionHandler for FraudPipeline {
    fn process_transaction(&self, tx: &Transaction) -> PipelineResult<()> {
        self.process(tx).map(|_| ())
    }
}

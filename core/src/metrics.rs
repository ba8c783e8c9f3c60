//! Pipeline throughput, latency and score-distribution metrics.

use crate::model::ModelScores;
use crate::scoring::{Decision, RiskLevel};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Latency samples kept; the oldest half is dropped on overflow.
const LATENCY_BUFFER: usize = 10_000;
const AGREEMENT_BUFFER: usize = 1_000;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct PipelineMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    alerts: AtomicU64,
    alerts_by_level: RwLock<BTreeMap<RiskLevel, u64>>,
    decisions: RwLock<BTreeMap<&'static str, u64>>,
    latencies_us: RwLock<Vec<u64>>,
    score_buckets: RwLock<[u64; 10]>,
    agreements: RwLock<Vec<f64>>,
    started: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub processed: u64,
    pub failed: u64,
    pub alerts: u64,
    /// Percent of processed transactions that raised an alert.
    pub alert_rate: f64,
    pub throughput_per_sec: f64,
    pub latency: LatencyStats,
    pub alerts_by_level: BTreeMap<String, u64>,
    pub decisions: BTreeMap<String, u64>,
    pub score_distribution: [u64; 10],
    /// Mean of `1 - stddev(model scores)`; 0 when never recorded.
    pub model_agreement: f64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            alerts: AtomicU64::new(0),
            alerts_by_level: RwLock::new(BTreeMap::new()),
            decisions: RwLock::new(BTreeMap::new()),
            latencies_us: RwLock::new(Vec::with_capacity(1024)),
            score_buckets: RwLock::new([0; 10]),
            agreements: RwLock::new(Vec::with_capacity(256)),
            started: Instant::now(),
        }
    }

    pub fn record_transaction(&self, latency: Duration, risk_score: f64, decision: Decision) {
        self.processed.fetch_add(1, Ordering::Relaxed);

        {
            let mut times = write(&self.latencies_us);
            times.push(latency.as_micros() as u64);
            if times.len() > LATENCY_BUFFER {
                times.drain(0..LATENCY_BUFFER / 2);
            }
        }

        let bucket = ((risk_score.clamp(0.0, 1.0) * 10.0) as usize).min(9);
        write(&self.score_buckets)[bucket] += 1;
        *write(&self.decisions).entry(decision.as_str()).or_insert(0) += 1;
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert(&self, level: RiskLevel) {
        self.alerts.fetch_add(1, Ordering::Relaxed);
        *write(&self.alerts_by_level).entry(level).or_insert(0) += 1;
    }

    /// Track how closely the ensemble members agree.
    pub fn record_model_agreement(&self, scores: &ModelScores) {
        if scores.len() < 2 {
            return;
        }
        let n = scores.len() as f64;
        let mean = scores.values().sum::<f64>() / n;
        let variance = scores.values().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let agreement = 1.0 - variance.sqrt().min(1.0);

        let mut agreements = write(&self.agreements);
        agreements.push(agreement);
        if agreements.len() > AGREEMENT_BUFFER {
            agreements.drain(0..AGREEMENT_BUFFER / 2);
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn alerts(&self) -> u64 {
        self.alerts.load(Ordering::Relaxed)
    }

    pub fn latency_stats(&self) -> LatencyStats {
        let mut sorted = read(&self.latencies_us).clone();
        if sorted.is_empty() {
            return LatencyStats::default();
        }
        sorted.sort_unstable();
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];
        LatencyStats {
            count: count as u64,
            mean_us: sorted.iter().sum::<u64>() / count as u64,
            p50_us: at(0.50),
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[count - 1],
        }
    }

    pub fn throughput(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.processed() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let processed = self.processed();
        let alerts = self.alerts();
        let agreements = read(&self.agreements);
        MetricsSummary {
            processed,
            failed: self.failed.load(Ordering::Relaxed),
            alerts,
            alert_rate: if processed > 0 {
                alerts as f64 / processed as f64 * 100.0
            } else {
                0.0
            },
            throughput_per_sec: self.throughput(),
            latency: self.latency_stats(),
            alerts_by_level: read(&self.alerts_by_level)
                .iter()
                .map(|(level, n)| (level.to_string(), *n))
                .collect(),
            decisions: read(&self.decisions)
                .iter()
                .map(|(d, n)| (d.to_string(), *n))
                .collect(),
            score_distribution: *read(&self.score_buckets),
            model_agreement: if agreements.is_empty() {
                0.0
            } else {
                agreements.iter().sum::<f64>() / agreements.len() as f64
            },
        }
    }

    pub fn log_summary(&self) {
        let s = self.summary();
        log::info!(
            "Metrics: processed={} failed={} alerts={} ({:.1}%) throughput={:.1} tx/s",
            s.processed,
            s.failed,
            s.alerts,
            s.alert_rate,
            s.throughput_per_sec
        );
        log::info!(
            "Latency (us): mean={} p50={} p95={} p99={} max={}",
            s.latency.mean_us,
            s.latency.p50_us,
            s.latency.p95_us,
            s.latency.p99_us,
            s.latency.max_us
        );
        for (level, n) in &s.alerts_by_level {
            log::info!("  alerts {level}: {n}");
        }
        for (decision, n) in &s.decisions {
            log::info!("  decision {decision}: {n}");
        }
        let total: u64 = s.score_distribution.iter().sum();
        for (i, n) in s.score_distribution.iter().enumerate() {
            let pct = if total > 0 { *n as f64 / total as f64 * 100.0 } else { 0.0 };
            log::info!(
                "  score {:.1}-{:.1}: {n:>6} ({pct:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                "#".repeat(((pct / 2.0) as usize).min(20))
            );
        }
        log::info!("Model agreement: {:.1}%", s.model_agreement * 100.0);
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs a metrics summary on a fixed interval until shutdown.
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.metrics.log_summary(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

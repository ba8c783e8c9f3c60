use crate::error::{PipelineError, PipelineResult};
use crate::scoring::RiskLevelThresholds;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub stream_name: String,
    pub consumer_group: String,
    pub alert_stream: String,
    /// Entries kept per stream; 0 disables trimming.
    #[serde(default)]
    pub max_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub seed: u64,
    pub num_users: usize,
    pub num_fraudsters: usize,
    pub num_merchants: u64,
    pub fraud_ratio: f64,
    pub transactions_per_second: u32,
    /// First simulated timestamp, RFC 3339.
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub window_secs: i64,
    pub short_window_secs: i64,
    pub max_events_per_user: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Risk score at or above which a fraud alert is raised.
    pub alert_threshold: f64,
    /// Scores below this are approved outright.
    pub review_threshold: f64,
    /// Scores at or above this are blocked.
    pub block_threshold: f64,
    pub risk_levels: RiskLevelThresholds,
    /// Ensemble weights keyed by model name.
    pub model_weights: HashMap<String, f64>,
    /// Trained logistic model (JSON). The baseline model is used when absent.
    #[serde(default)]
    pub model_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub min_ring_users: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub block_ms: u64,
    /// Pending entries idle this long are reclaimed by another worker.
    pub claim_idle_ms: u64,
    pub metrics_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    pub generator: GeneratorConfig,
    pub features: FeatureConfig,
    pub scoring: ScoringConfig,
    pub storage: StorageConfig,
    pub graph: GraphConfig,
    pub workers: WorkerConfig,
    pub training: TrainingConfig,
}

impl PipelineConfig {
    /// Load from a JSON file, then apply environment overrides and validate.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let mut config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment keys take precedence over file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// `FRAUD_*` keys win over the legacy `REDIS_*` names when both are set.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(k));
        if let Some(v) = first(&["FRAUD_STREAM_NAME", "REDIS_STREAM_NAME"]) {
            self.broker.stream_name = v;
        }
        if let Some(v) = first(&["FRAUD_CONSUMER_GROUP", "REDIS_CONSUMER_GROUP"]) {
            self.broker.consumer_group = v;
        }
        if let Some(v) = first(&["FRAUD_ALERT_STREAM"]) {
            self.broker.alert_stream = v;
        }
        if let Some(v) = first(&["FRAUD_DB_PATH"]) {
            self.storage.db_path = v;
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if !(0.0..=1.0).contains(&self.generator.fraud_ratio) {
            return invalid(format!(
                "generator.fraud_ratio must be in [0, 1], got {}",
                self.generator.fraud_ratio
            ));
        }
        if self.generator.num_users == 0 || self.generator.num_fraudsters == 0 {
            return invalid("generator needs at least one user and one fraudster".into());
        }
        if self.generator.num_merchants == 0 {
            return invalid("generator.num_merchants must be > 0".into());
        }
        if self.workers.workers == 0 {
            return invalid("workers.workers must be > 0".into());
        }
        if self.workers.batch_size == 0 {
            return invalid("workers.batch_size must be > 0".into());
        }
        if self.features.short_window_secs <= 0
            || self.features.window_secs < self.features.short_window_secs
        {
            return invalid("features windows must satisfy 0 < short <= long".into());
        }
        let s = &self.scoring;
        if s.review_threshold > s.block_threshold {
            return invalid("scoring.review_threshold must not exceed block_threshold".into());
        }
        let r = &s.risk_levels;
        if !(0.0 < r.medium && r.medium < r.high && r.high < r.critical) {
            return invalid("scoring.risk_levels must be strictly increasing".into());
        }
        for (name, v) in [
            ("alert_threshold", s.alert_threshold),
            ("review_threshold", s.review_threshold),
            ("block_threshold", s.block_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return invalid(format!("scoring.{name} must be in [0, 1], got {v}"));
            }
        }
        Ok(())
    }

    /// Small, fast values for unit and integration tests.
    pub fn default_test() -> Self {
        let mut config = Self::default();
        config.generator.seed = 42;
        config.generator.num_users = 50;
        config.generator.num_fraudsters = 5;
        config.generator.num_merchants = 40;
        config.generator.fraud_ratio = 0.10;
        config.generator.transactions_per_second = 20;
        config.workers.workers = 2;
        config.workers.batch_size = 16;
        config.workers.block_ms = 50;
        config.workers.claim_idle_ms = 100;
        config.workers.metrics_interval_secs = 3600;
        config.graph.min_ring_users = 2;
        config.training.epochs = 200;
        config
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut model_weights = HashMap::new();
        model_weights.insert("logistic".to_string(), 0.6);
        model_weights.insert("rules".to_string(), 0.4);

        Self {
            broker: BrokerConfig {
                stream_name: "transactions".to_string(),
                consumer_group: "fraud-detection-group".to_string(),
                alert_stream: "fraud.alerts".to_string(),
                max_len: 0,
            },
            generator: GeneratorConfig {
                seed: 42,
                num_users: 1000,
                num_fraudsters: 50,
                num_merchants: 500,
                fraud_ratio: 0.05,
                transactions_per_second: 10,
                start_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            },
            features: FeatureConfig {
                window_secs: 24 * 3600,
                short_window_secs: 3600,
                max_events_per_user: 256,
            },
            scoring: ScoringConfig {
                alert_threshold: 0.5,
                review_threshold: 0.5,
                block_threshold: 0.8,
                risk_levels: RiskLevelThresholds::default(),
                model_weights,
                model_path: None,
            },
            storage: StorageConfig {
                db_path: ":memory:".to_string(),
            },
            graph: GraphConfig { min_ring_users: 3 },
            workers: WorkerConfig {
                workers: 4,
                batch_size: 100,
                block_ms: 1000,
                claim_idle_ms: 30_000,
                metrics_interval_secs: 30,
            },
            training: TrainingConfig {
                epochs: 400,
                learning_rate: 0.5,
                l2: 0.001,
            },
        }
    }
}

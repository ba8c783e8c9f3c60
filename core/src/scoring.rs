//! Scoring engine: runs the model ensemble over a feature vector and turns
//! the combined score into a risk level, a decision and, above the alert
//! threshold, a `FraudAlert`.

use crate::{
    config::ScoringConfig,
    features::FeatureVector,
    model::{FraudModel, LogisticModel, ModelScores, RuleModel, ScoreAggregator},
    transaction::Transaction,
    types::{AlertId, TxnId, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn from_score(score: f64, thresholds: &RiskLevelThresholds) -> Self {
        if score >= thresholds.critical {
            Self::Critical
        } else if score >= thresholds.high {
            Self::High
        } else if score >= thresholds.medium {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower bounds of each level above `Low`; anything under `medium` is low.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLevelThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskLevelThresholds {
    fn default() -> Self {
        Self {
            medium: 0.5,
            high: 0.7,
            critical: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Review,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Review => "review",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub risk_score: f64,
    pub model_scores: ModelScores,
    /// Reasons reported by explainable models.
    pub triggered: Vec<String>,
    pub risk_level: RiskLevel,
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAlert {
    pub alert_id: AlertId,
    pub transaction_id: TxnId,
    pub user_id: UserId,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub decision: Decision,
    pub model_scores: ModelScores,
    pub triggered: Vec<String>,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

impl FraudAlert {
    pub fn new(tx: &Transaction, result: &ScoreResult) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            transaction_id: tx.transaction_id.clone(),
            user_id: tx.user_id.clone(),
            risk_score: result.risk_score,
            risk_level: result.risk_level,
            decision: result.decision,
            model_scores: result.model_scores.clone(),
            triggered: result.triggered.clone(),
            amount: tx.amount,
            timestamp: Utc::now(),
        }
    }

    /// Primary reason, used as the stored alert type.
    pub fn alert_type(&self) -> &str {
        self.triggered
            .first()
            .map(String::as_str)
            .unwrap_or("model_score")
    }
}

pub struct ScoringEngine {
    models: Vec<Box<dyn FraudModel>>,
    aggregator: ScoreAggregator,
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(
        models: Vec<Box<dyn FraudModel>>,
        aggregator: ScoreAggregator,
        config: &ScoringConfig,
    ) -> Self {
        Self {
            models,
            aggregator,
            config: config.clone(),
        }
    }

    /// Logistic model (trained if `model_path` is set, baseline otherwise)
    /// plus the rule model, weighted per config.
    pub fn from_config(config: &ScoringConfig) -> crate::error::PipelineResult<Self> {
        let logistic = match &config.model_path {
            Some(path) => LogisticModel::load(path)?,
            None => LogisticModel::baseline(),
        };
        let models: Vec<Box<dyn FraudModel>> = vec![Box::new(logistic), Box::new(RuleModel::new())];
        Ok(Self::new(
            models,
            ScoreAggregator::new(config.model_weights.clone()),
            config,
        ))
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name()).collect()
    }

    pub fn decide(&self, risk_score: f64) -> Decision {
        if risk_score >= self.config.block_threshold {
            Decision::Block
        } else if risk_score >= self.config.review_threshold {
            Decision::Review
        } else {
            Decision::Approve
        }
    }

    pub fn score(&self, tx: &Transaction, features: &FeatureVector) -> ScoreResult {
        let mut model_scores = ModelScores::new();
        let mut triggered = Vec::new();
        for model in &self.models {
            model_scores.insert(model.name().to_string(), model.score(features));
            triggered.extend(model.explain(features));
        }
        let risk_score = self.aggregator.aggregate(&model_scores);
        let result = ScoreResult {
            risk_score,
            model_scores,
            triggered,
            risk_level: RiskLevel::from_score(risk_score, &self.config.risk_levels),
            decision: self.decide(risk_score),
        };
        log::debug!(
            "Scored {}: {:.3} ({}, {})",
            tx.transaction_id,
            result.risk_score,
            result.risk_level,
            result.decision
        );
        result
    }

    /// An alert when the score reaches the alert threshold.
    pub fn alert_for(&self, tx: &Transaction, result: &ScoreResult) -> Option<FraudAlert> {
        (result.risk_score >= self.config.alert_threshold).then(|| FraudAlert::new(tx, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::features::FeatureWindow;
    use crate::generator::TransactionGenerator;
    use crate::transaction::FraudType;

    struct Fixed(&'static str, f64);

    impl FraudModel for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        fn score(&self, _: &FeatureVector) -> f64 {
            self.1
        }
    }

    fn engine_with(score: f64) -> ScoringEngine {
        let config = PipelineConfig::default_test().scoring;
        ScoringEngine::new(
            vec![Box::new(Fixed("fixed", score))],
            ScoreAggregator::equal_weights(),
            &config,
        )
    }

    #[test]
    fn risk_levels_follow_thresholds() {
        let t = RiskLevelThresholds::default();
        assert_eq!(RiskLevel::from_score(0.1, &t), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.5, &t), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.75, &t), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.95, &t), RiskLevel::Critical);
    }

    #[test]
    fn decisions_and_alerts() {
        let mut generator = TransactionGenerator::new(&PipelineConfig::default_test().generator);
        let tx = generator.generate_normal();
        let mut window = FeatureWindow::new(&PipelineConfig::default_test().features);
        let fv = window.observe(&tx);

        let low = engine_with(0.2);
        let r = low.score(&tx, &fv);
        assert_eq!(r.decision, Decision::Approve);
        assert!(low.alert_for(&tx, &r).is_none());

        let mid = engine_with(0.6);
        assert_eq!(mid.score(&tx, &fv).decision, Decision::Review);

        let high = engine_with(0.85);
        let r = high.score(&tx, &fv);
        assert_eq!(r.decision, Decision::Block);
        assert_eq!(r.risk_level, RiskLevel::High);
        let alert = high.alert_for(&tx, &r).unwrap();
        assert_eq!(alert.transaction_id, tx.transaction_id);
        assert_eq!(alert.alert_type(), "model_score");
        assert!(uuid::Uuid::parse_str(&alert.alert_id).is_ok());
    }

    #[test]
    fn default_ensemble_flags_high_amount_fraud() {
        let config = PipelineConfig::default_test();
        let engine = ScoringEngine::from_config(&config.scoring).unwrap();
        assert_eq!(engine.model_names(), vec!["logistic", "rules"]);

        let mut generator = TransactionGenerator::new(&config.generator);
        let mut window = FeatureWindow::new(&config.features);
        for _ in 0..200 {
            let tx = generator.generate_normal();
            window.observe(&tx);
        }
        let tx = generator.generate_fraud_of(FraudType::HighAmount);
        let fv = window.observe(&tx);
        let result = engine.score(&tx, &fv);
        assert!(result.risk_score >= config.scoring.alert_threshold, "{result:?}");
        assert!(result.triggered.iter().any(|r| r == "very_large_amount"));
    }

    #[test]
    fn alert_serializes_levels_lowercase() {
        let result = ScoreResult {
            risk_score: 0.95,
            model_scores: ModelScores::new(),
            triggered: vec!["new_card".to_string()],
            risk_level: RiskLevel::Critical,
            decision: Decision::Block,
        };
        let mut generator = TransactionGenerator::new(&PipelineConfig::default_test().generator);
        let alert = FraudAlert::new(&generator.generate_normal(), &result);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["risk_level"], "critical");
        assert_eq!(json["decision"], "block");
        assert_eq!(alert.alert_type(), "new_card");
    }
}

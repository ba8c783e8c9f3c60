//! Fraud scoring models, ensemble aggregation and offline evaluation.

use crate::{
    config::TrainingConfig,
    error::{PipelineError, PipelineResult},
    features::{Feature, FeatureVector, NUM_FEATURES},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Scores per model name.
pub type ModelScores = BTreeMap<String, f64>;

pub trait FraudModel: Send + Sync {
    fn name(&self) -> &str;

    /// Fraud probability in [0, 1].
    fn score(&self, features: &FeatureVector) -> f64;

    /// Human-readable reasons behind a score. Empty for opaque models.
    fn explain(&self, _features: &FeatureVector) -> Vec<String> {
        Vec::new()
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

// ── Logistic regression ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub feature_names: Vec<String>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Samples the weights were fitted on. 0 for the baseline.
    #[serde(default)]
    pub trained_on: usize,
}

impl LogisticModel {
    pub const NAME: &'static str = "logistic";

    /// Hand-set weights usable before any training run.
    pub fn baseline() -> Self {
        // (feature, mean, std, weight) in the fixed feature order.
        let table: [(Feature, f64, f64, f64); NUM_FEATURES] = [
            (Feature::Amount, 150.0, 300.0, 0.25),
            (Feature::LogAmount, 4.5, 1.2, 0.3),
            (Feature::AmountToUserAvg, 1.0, 2.0, 1.2),
            (Feature::TxnCount1h, 0.2, 0.5, 0.3),
            (Feature::AmountSum1h, 30.0, 150.0, 0.2),
            (Feature::TxnCount24h, 1.0, 1.5, 0.0),
            (Feature::AmountSum24h, 150.0, 400.0, 0.1),
            (Feature::UniqueMerchants24h, 1.0, 1.5, 0.0),
            (Feature::SecondsSinceLast, 43_200.0, 30_000.0, -0.3),
            (Feature::DistanceFromLastKm, 50.0, 1000.0, 0.5),
            (Feature::ImpliedSpeedKmh, 100.0, 2000.0, 0.6),
            (Feature::NewDevice, 0.1, 0.3, 0.7),
            (Feature::NewIp, 0.9, 0.3, 0.1),
            (Feature::NewCard, 0.05, 0.2, 0.7),
            (Feature::HourOfDay, 12.0, 7.0, 0.0),
            (Feature::IsNight, 0.25, 0.43, 0.1),
            (Feature::CategoryRisk, 0.4, 0.3, 0.5),
        ];
        Self {
            feature_names: table.iter().map(|(f, ..)| f.name().to_string()).collect(),
            means: table.iter().map(|(_, m, ..)| *m).collect(),
            stds: table.iter().map(|(_, _, s, _)| *s).collect(),
            weights: table.iter().map(|(.., w)| *w).collect(),
            bias: -3.0,
            trained_on: 0,
        }
    }

    /// Rejects parameters that would score NaN or apply weights to the
    /// wrong features.
    fn validate(&self) -> PipelineResult<()> {
        for len in [
            self.feature_names.len(),
            self.means.len(),
            self.stds.len(),
            self.weights.len(),
        ] {
            if len != NUM_FEATURES {
                return Err(PipelineError::FeatureShape {
                    expected: NUM_FEATURES,
                    actual: len,
                });
            }
        }
        let invalid = |msg: String| Err(PipelineError::InvalidModel(msg));
        for (i, (feature, name)) in Feature::ALL.iter().zip(&self.feature_names).enumerate() {
            if feature.name() != name.as_str() {
                return invalid(format!(
                    "feature {i} is '{name}', expected '{}'",
                    feature.name()
                ));
            }
            if !(self.stds[i].is_finite() && self.stds[i] > 0.0) {
                return invalid(format!("std of '{name}' must be positive, got {}", self.stds[i]));
            }
            if !self.means[i].is_finite() || !self.weights[i].is_finite() {
                return invalid(format!("mean and weight of '{name}' must be finite"));
            }
        }
        if !self.bias.is_finite() {
            return invalid(format!("bias must be finite, got {}", self.bias));
        }
        Ok(())
    }

    fn standardize(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }

    fn logit(&self, z: &[f64]) -> f64 {
        self.bias + z.iter().zip(&self.weights).map(|(a, b)| a * b).sum::<f64>()
    }

    /// Fit by full-batch gradient descent on class-balanced log loss with
    /// L2 regularisation.
    pub fn train(
        samples: &[FeatureVector],
        labels: &[bool],
        config: &TrainingConfig,
    ) -> PipelineResult<Self> {
        if samples.is_empty() {
            return Err(PipelineError::EmptyTrainingSet);
        }
        if samples.len() != labels.len() {
            return Err(anyhow::anyhow!(
                "{} samples but {} labels",
                samples.len(),
                labels.len()
            )
            .into());
        }

        let n = samples.len() as f64;
        let mut means = vec![0.0; NUM_FEATURES];
        for s in samples {
            for (m, v) in means.iter_mut().zip(s.as_slice()) {
                *m += v / n;
            }
        }
        let mut stds = vec![0.0; NUM_FEATURES];
        for s in samples {
            for ((sd, v), m) in stds.iter_mut().zip(s.as_slice()).zip(&means) {
                *sd += (v - m).powi(2) / n;
            }
        }
        for sd in stds.iter_mut() {
            *sd = if *sd > 1e-12 { sd.sqrt() } else { 1.0 };
        }

        let mut model = Self {
            feature_names: Feature::ALL.iter().map(|f| f.name().to_string()).collect(),
            means,
            stds,
            weights: vec![0.0; NUM_FEATURES],
            bias: 0.0,
            trained_on: samples.len(),
        };

        let z: Vec<Vec<f64>> = samples.iter().map(|s| model.standardize(s.as_slice())).collect();
        let y: Vec<f64> = labels.iter().map(|&l| if l { 1.0 } else { 0.0 }).collect();

        let positives = labels.iter().filter(|&&l| l).count() as f64;
        let negatives = n - positives;
        let (w_pos, w_neg) = if positives > 0.0 && negatives > 0.0 {
            (n / (2.0 * positives), n / (2.0 * negatives))
        } else {
            (1.0, 1.0)
        };

        for epoch in 0..config.epochs {
            let mut grad_w = vec![0.0; NUM_FEATURES];
            let mut grad_b = 0.0;
            let mut loss = 0.0;
            for (zi, &yi) in z.iter().zip(&y) {
                let p = sigmoid(model.logit(zi));
                let cw = if yi > 0.5 { w_pos } else { w_neg };
                let err = cw * (p - yi);
                for (g, x) in grad_w.iter_mut().zip(zi) {
                    *g += err * x;
                }
                grad_b += err;
                let p = p.clamp(1e-12, 1.0 - 1e-12);
                loss -= cw * (yi * p.ln() + (1.0 - yi) * (1.0 - p).ln());
            }
            for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                *w -= config.learning_rate * (g / n + config.l2 * *w);
            }
            model.bias -= config.learning_rate * grad_b / n;

            if epoch % 100 == 0 {
                log::debug!("epoch {epoch}: loss {:.4}", loss / n);
            }
        }

        log::info!(
            "Trained logistic model on {} samples ({} fraud)",
            samples.len(),
            positives as usize
        );
        Ok(model)
    }

    pub fn save(&self, path: &str) -> PipelineResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        log::info!("Saved logistic model to {path}");
        Ok(())
    }

    pub fn load(path: &str) -> PipelineResult<Self> {
        let model: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        model.validate()?;
        log::info!(
            "Loaded logistic model from {path} (trained on {} samples)",
            model.trained_on
        );
        Ok(model)
    }
}

impl FraudModel for LogisticModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn score(&self, features: &FeatureVector) -> f64 {
        sigmoid(self.logit(&self.standardize(features.as_slice())))
    }
}

// ── Rules ───────────────────────────────────────────────────────────────

struct Rule {
    name: &'static str,
    weight: f64,
    fires: fn(&FeatureVector) -> bool,
}

fn has_history(f: &FeatureVector) -> bool {
    f.get(Feature::TxnCount24h) > 0.0
}

/// Weighted heuristics mirroring the known fraud patterns.
pub struct RuleModel {
    rules: Vec<Rule>,
}

impl RuleModel {
    pub const NAME: &'static str = "rules";

    pub fn new() -> Self {
        let rules = vec![
            Rule {
                name: "very_large_amount",
                weight: 0.5,
                fires: |f| f.get(Feature::Amount) >= 5000.0,
            },
            Rule {
                name: "amount_spike",
                weight: 0.35,
                fires: |f| has_history(f) && f.get(Feature::AmountToUserAvg) >= 5.0,
            },
            Rule {
                name: "rapid_high_value",
                weight: 0.3,
                fires: |f| {
                    has_history(f)
                        && f.get(Feature::SecondsSinceLast) <= 120.0
                        && f.get(Feature::AmountToUserAvg) >= 3.0
                },
            },
            Rule {
                name: "impossible_travel",
                weight: 0.4,
                fires: |f| {
                    f.get(Feature::DistanceFromLastKm) > 100.0
                        && f.get(Feature::ImpliedSpeedKmh) > 900.0
                },
            },
            Rule {
                name: "new_device_and_ip",
                weight: 0.3,
                fires: |f| f.flag(Feature::NewDevice) && f.flag(Feature::NewIp),
            },
            Rule {
                name: "new_card",
                weight: 0.25,
                fires: |f| f.flag(Feature::NewCard),
            },
            Rule {
                name: "risky_category_at_night",
                weight: 0.15,
                fires: |f| f.flag(Feature::IsNight) && f.get(Feature::CategoryRisk) >= 0.7,
            },
        ];
        Self { rules }
    }

    pub fn triggered(&self, features: &FeatureVector) -> Vec<&'static str> {
        self.rules
            .iter()
            .filter(|r| (r.fires)(features))
            .map(|r| r.name)
            .collect()
    }
}

impl Default for RuleModel {
    fn default() -> Self {
        Self::new()
    }
}

impl FraudModel for RuleModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn score(&self, features: &FeatureVector) -> f64 {
        self.rules
            .iter()
            .filter(|r| (r.fires)(features))
            .map(|r| r.weight)
            .sum::<f64>()
            .min(1.0)
    }

    fn explain(&self, features: &FeatureVector) -> Vec<String> {
        self.triggered(features).into_iter().map(String::from).collect()
    }
}

// ── Ensemble ────────────────────────────────────────────────────────────

/// Combines per-model scores into one risk score.
pub struct ScoreAggregator {
    weights: HashMap<String, f64>,
    /// Weight for models missing from `weights`.
    default_weight: f64,
}

impl ScoreAggregator {
    pub fn new(weights: HashMap<String, f64>) -> Self {
        Self {
            weights,
            default_weight: 0.1,
        }
    }

    pub fn equal_weights() -> Self {
        Self {
            weights: HashMap::new(),
            default_weight: 1.0,
        }
    }

    /// Weighted mean with weights normalised over the models present.
    /// Neutral 0.5 when nothing scored.
    pub fn aggregate(&self, scores: &ModelScores) -> f64 {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (name, &score) in scores {
            let w = self.weights.get(name).copied().unwrap_or(self.default_weight);
            weighted += score * w;
            total += w;
        }
        if total > 0.0 {
            (weighted / total).clamp(0.0, 1.0)
        } else {
            0.5
        }
    }

    pub fn max_score(scores: &ModelScores) -> f64 {
        scores.values().copied().fold(0.0, f64::max)
    }

    /// Fraction of models at or above `threshold`.
    pub fn voting_score(scores: &ModelScores, threshold: f64) -> f64 {
        if scores.is_empty() {
            return 0.0;
        }
        scores.values().filter(|&&s| s >= threshold).count() as f64 / scores.len() as f64
    }

    pub fn set_weight(&mut self, model: &str, weight: f64) {
        self.weights.insert(model.to_string(), weight);
    }

    pub fn weights(&self) -> &HashMap<String, f64> {
        &self.weights
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evaluation {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
}

impl Evaluation {
    pub fn from_predictions(predicted: &[bool], labels: &[bool]) -> Self {
        let mut e = Self::default();
        for (&p, &l) in predicted.iter().zip(labels) {
            match (p, l) {
                (true, true) => e.true_positives += 1,
                (true, false) => e.false_positives += 1,
                (false, false) => e.true_negatives += 1,
                (false, true) => e.false_negatives += 1,
            }
        }
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        e.precision = ratio(e.true_positives, e.true_positives + e.false_positives);
        e.recall = ratio(e.true_positives, e.true_positives + e.false_negatives);
        e.f1 = if e.precision + e.recall > 0.0 {
            2.0 * e.precision * e.recall / (e.precision + e.recall)
        } else {
            0.0
        };
        e.accuracy = ratio(e.true_positives + e.true_negatives, predicted.len().min(labels.len()));
        e
    }
}

pub fn evaluate(
    model: &dyn FraudModel,
    samples: &[FeatureVector],
    labels: &[bool],
    threshold: f64,
) -> Evaluation {
    let predicted: Vec<bool> = samples.iter().map(|s| model.score(s) >= threshold).collect();
    Evaluation::from_predictions(&predicted, labels)
}

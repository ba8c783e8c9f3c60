//! Model training, persistence and fraud-ring detection on generated traffic.

use fraudstream_core::{
    config::PipelineConfig,
    features::{FeatureVector, FeatureWindow},
    generator::TransactionGenerator,
    graph::{EntityNode, RelationshipGraph},
    model::{evaluate, FraudModel, LogisticModel, RuleModel},
    scoring::ScoringEngine,
    transaction::FraudType,
};

fn labelled(config: &PipelineConfig, n: usize) -> (Vec<FeatureVector>, Vec<bool>) {
    let mut generator = TransactionGenerator::new(&config.generator);
    let mut window = FeatureWindow::new(&config.features);
    generator
        .generate_batch(n, 0.1)
        .iter()
        .map(|tx| (window.observe(tx), tx.is_fraud))
        .unzip()
}

fn mean_score(model: &dyn FraudModel, samples: &[FeatureVector], labels: &[bool], want: bool) -> f64 {
    let scores: Vec<f64> = samples
        .iter()
        .zip(labels)
        .filter(|(_, l)| **l == want)
        .map(|(s, _)| model.score(s))
        .collect();
    scores.iter().sum::<f64>() / scores.len().max(1) as f64
}

#[test]
fn trained_model_separates_fraud_on_held_out_data() {
    let config = PipelineConfig::default_test();
    let (samples, labels) = labelled(&config, 3000);
    let split = 2400;

    let model = LogisticModel::train(&samples[..split], &labels[..split], &config.training).unwrap();
    assert_eq!(model.trained_on, split);

    let test_x = &samples[split..];
    let test_y = &labels[split..];
    let fraud_mean = mean_score(&model, test_x, test_y, true);
    let normal_mean = mean_score(&model, test_x, test_y, false);
    assert!(
        fraud_mean > normal_mean + 0.2,
        "fraud {fraud_mean:.3} vs normal {normal_mean:.3}"
    );

    let eval = evaluate(&model, test_x, test_y, 0.5);
    assert!(eval.recall >= 0.6, "recall {:.3}", eval.recall);
    assert_eq!(
        eval.true_positives + eval.false_positives + eval.true_negatives + eval.false_negatives,
        test_x.len()
    );
}

#[test]
fn rules_fire_more_on_fraud_than_normal_traffic() {
    let config = PipelineConfig::default_test();
    let (samples, labels) = labelled(&config, 2000);
    let rules = RuleModel::new();
    let fraud_mean = mean_score(&rules, &samples, &labels, true);
    let normal_mean = mean_score(&rules, &samples, &labels, false);
    assert!(fraud_mean > normal_mean, "fraud {fraud_mean:.3} vs normal {normal_mean:.3}");
}

#[test]
fn saved_model_drives_the_scoring_engine() {
    let mut config = PipelineConfig::default_test();
    let (samples, labels) = labelled(&config, 1000);
    let model = LogisticModel::train(&samples, &labels, &config.training).unwrap();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("model.json");
    let path = path.to_str().expect("utf-8 path");
    model.save(path).unwrap();

    let loaded = LogisticModel::load(path).unwrap();
    for s in samples.iter().take(50) {
        assert!((loaded.score(s) - model.score(s)).abs() < 1e-9);
    }

    config.scoring.model_path = Some(path.to_string());
    let engine = ScoringEngine::from_config(&config.scoring).unwrap();
    assert_eq!(engine.model_names(), vec!["logistic", "rules"]);

    config.scoring.model_path = Some(dir.path().join("missing.json").to_string_lossy().into_owned());
    assert!(ScoringEngine::from_config(&config.scoring).is_err());
}

#[test]
fn corrupt_model_file_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("model.json");
    let mut model = LogisticModel::baseline();
    model.weights.pop();
    std::fs::write(&path, serde_json::to_string(&model).unwrap()).unwrap();
    assert!(LogisticModel::load(path.to_str().unwrap()).is_err());
}

/// Stolen cards are reused across victims, so their holders end up linked.
#[test]
fn stolen_card_reuse_forms_rings() {
    let config = PipelineConfig::default_test();
    let mut generator = TransactionGenerator::new(&config.generator);
    let mut graph = RelationshipGraph::new();
    for _ in 0..300 {
        graph.add_transaction(&generator.generate_normal(), false);
    }
    let mut fraud_users = Vec::new();
    for _ in 0..200 {
        let tx = generator.generate_fraud_of(FraudType::StolenCard);
        fraud_users.push(tx.user_id.clone());
        graph.add_transaction(&tx, true);
    }

    let rings = graph.detect_rings(2);
    assert!(!rings.is_empty());
    assert_eq!(rings[0].ring_id, "ring_001");
    for pair in rings.windows(2) {
        assert!(pair[0].users.len() >= pair[1].users.len());
    }
    for ring in &rings {
        assert!(ring.users.len() >= 2);
        assert!(!ring.shared_identifiers.is_empty());
        assert!(!ring.flagged_users.is_empty());
        assert!(ring.flagged_users.iter().all(|u| fraud_users.contains(u)));
    }

    let shared_card = rings[0]
        .shared_identifiers
        .iter()
        .find_map(|id| id.strip_prefix("card:"))
        .map(|last4| EntityNode::Card(last4.to_string()));
    if let Some(card) = shared_card {
        assert!(graph.users_sharing(&card).len() >= 2);
    }
    assert_eq!(graph.flagged_count(), {
        let mut unique = fraud_users.clone();
        unique.sort();
        unique.dedup();
        unique.len()
    });
}

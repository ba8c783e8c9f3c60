//! pipeline-runner: headless driver for the fraud detection pipeline.
//!
//! Usage:
//!   pipeline-runner --mode demo --seed 42 --count 2000 --workers 4 --db run.db
//!   pipeline-runner --mode generate --count 10 --fraud-ratio 0.2
//!   pipeline-runner --mode train --count 20000 --model model.json
//!   pipeline-runner --mode live --duration 30
//!   pipeline-runner --mode stats --db run.db

use anyhow::{bail, Result};
use fraudstream_core::{
    config::PipelineConfig,
    features::FeatureWindow,
    generator::TransactionGenerator,
    graph::FraudRing,
    metrics::MetricsReporter,
    model::{evaluate, Evaluation, LogisticModel},
    pipeline::FraudPipeline,
    producer::TransactionProducer,
    store::FraudStore,
    stream::StreamBroker,
};
use std::env;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mode = arg_str(&args, "--mode").unwrap_or("demo");
    let count = parse_arg(&args, "--count", 1000usize);

    let mut config = match arg_str(&args, "--config") {
        Some(path) => PipelineConfig::load(path)?,
        None => {
            let mut config = PipelineConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    config.generator.seed = parse_arg(&args, "--seed", config.generator.seed);
    config.generator.fraud_ratio = parse_arg(&args, "--fraud-ratio", config.generator.fraud_ratio);
    config.workers.workers = parse_arg(&args, "--workers", config.workers.workers);
    if let Some(db) = arg_str(&args, "--db") {
        config.storage.db_path = db.to_string();
    }
    config.validate()?;

    match mode {
        "generate" => run_generate(&config, count),
        "train" => {
            let out = arg_str(&args, "--model").unwrap_or("model.json");
            run_train(&config, count, out)
        }
        "demo" => {
            if let Some(model) = arg_str(&args, "--model") {
                config.scoring.model_path = Some(model.to_string());
            }
            run_demo(config, count, arg_str(&args, "--export"))
        }
        "live" => {
            let duration = parse_arg(&args, "--duration", 10u64);
            run_live(config, Duration::from_secs(duration))
        }
        "stats" => run_stats(&config.storage.db_path),
        other => bail!("unknown mode '{other}' (expected demo, generate, train, live or stats)"),
    }
}

fn run_generate(config: &PipelineConfig, count: usize) -> Result<()> {
    let mut generator = TransactionGenerator::new(&config.generator);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for tx in generator.generate_batch(count, config.generator.fraud_ratio) {
        writeln!(out, "{}", serde_json::to_string(&tx)?)?;
    }
    out.flush()?;
    Ok(())
}

fn run_train(config: &PipelineConfig, count: usize, out: &str) -> Result<()> {
    println!("Fraud pipeline: training logistic model");
    println!("  seed:        {}", config.generator.seed);
    println!("  samples:     {count}");
    println!("  fraud ratio: {:.1}%", config.generator.fraud_ratio * 100.0);
    println!();

    let mut generator = TransactionGenerator::new(&config.generator);
    let mut window = FeatureWindow::new(&config.features);
    let (samples, labels): (Vec<_>, Vec<_>) = generator
        .generate_batch(count, config.generator.fraud_ratio)
        .iter()
        .map(|tx| (window.observe(tx), tx.is_fraud))
        .unzip();

    // Train on the earlier 80%, hold out the most recent 20%.
    let split = samples.len() * 4 / 5;
    let model = LogisticModel::train(&samples[..split], &labels[..split], &config.training)?;
    let held_out = evaluate(
        &model,
        &samples[split..],
        &labels[split..],
        config.scoring.alert_threshold,
    );
    let baseline = evaluate(
        &LogisticModel::baseline(),
        &samples[split..],
        &labels[split..],
        config.scoring.alert_threshold,
    );

    println!("=== HOLD-OUT EVALUATION ===");
    print_evaluation("trained", &held_out);
    print_evaluation("baseline", &baseline);

    model.save(out)?;
    println!();
    println!("  model saved to {out} ({} training samples)", model.trained_on);
    Ok(())
}

fn run_demo(config: PipelineConfig, count: usize, export: Option<&str>) -> Result<()> {
    let workers = config.workers.workers;
    println!("Fraud pipeline: demo run");
    println!("  seed:        {}", config.generator.seed);
    println!("  count:       {count}");
    println!("  fraud ratio: {:.1}%", config.generator.fraud_ratio * 100.0);
    println!("  workers:     {workers}");
    println!("  db:          {}", config.storage.db_path);
    println!();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let broker = StreamBroker::new();
    let store = FraudStore::open(&config.storage.db_path)?;
    let mut generator = TransactionGenerator::new(&config.generator);
    let producer = TransactionProducer::new(broker.clone(), config.broker.stream_name.clone())
        .with_max_len(config.broker.max_len);
    let batch = generator.generate_batch(count, config.generator.fraud_ratio);

    let pipeline = Arc::new(FraudPipeline::build(config, store, broker)?);
    producer.publish_batch(&batch)?;
    log::info!("Published {} transactions", producer.stream_length());

    let started = Instant::now();
    let processed = runtime.block_on(pipeline.run_until_drained(workers))?;
    let elapsed = started.elapsed();

    print_summary(&pipeline, processed, elapsed)?;

    if let Some(path) = export {
        let written = pipeline.with_store(|store| store.export_jsonl(path))?;
        println!();
        println!("  exported {written} transactions to {path}");
    }
    pipeline.metrics().log_summary();
    Ok(())
}

fn run_live(config: PipelineConfig, duration: Duration) -> Result<()> {
    let workers = config.workers.workers;
    let tps = config.generator.transactions_per_second as usize;
    let fraud_ratio = config.generator.fraud_ratio;
    let interval = config.workers.metrics_interval_secs;
    println!("Fraud pipeline: live run for {}s at {tps} tx/s", duration.as_secs());
    println!();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let broker = StreamBroker::new();
    let store = FraudStore::open(&config.storage.db_path)?;
    let mut generator = TransactionGenerator::new(&config.generator);
    let producer = TransactionProducer::new(broker.clone(), config.broker.stream_name.clone())
        .with_max_len(config.broker.max_len);
    let pipeline = Arc::new(FraudPipeline::build(config, store, broker)?);

    let started = Instant::now();
    let processed = runtime.block_on(async {
        let (stop, shutdown) = watch::channel(false);
        let reporter = tokio::spawn(MetricsReporter::new(pipeline.metrics(), interval).run(shutdown.clone()));
        let generator_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { generator.stream(&producer, tps, fraud_ratio, shutdown).await })
        };
        let workers_task = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.run_workers(workers, shutdown).await })
        };

        tokio::time::sleep(duration).await;
        let _ = stop.send(true);

        let published = generator_task.await??;
        let processed = workers_task.await??;
        reporter.await?;
        log::info!("Published {published}, processed {processed}");
        anyhow::Ok(processed)
    })?;

    print_summary(&pipeline, processed, started.elapsed())?;
    pipeline.metrics().log_summary();
    Ok(())
}

fn run_stats(db: &str) -> Result<()> {
    let store = FraudStore::open(db)?;
    store.migrate()?;
    println!("Fraud pipeline: stats for {db}");
    println!();
    print_store_stats(&store)
}

fn print_summary(pipeline: &FraudPipeline, processed: u64, elapsed: Duration) -> Result<()> {
    let metrics = pipeline.metrics().summary();
    let (nodes, edges) = pipeline.graph_size();

    println!("=== RUN SUMMARY ===");
    println!("  processed:      {processed}");
    println!("  failed:         {}", metrics.failed);
    println!("  elapsed:        {:.2}s", elapsed.as_secs_f64());
    println!(
        "  throughput:     {:.1} tx/s",
        processed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("  alerts:         {} ({:.1}%)", metrics.alerts, metrics.alert_rate);
    println!("  alert stream:   {}", pipeline.alert_stream_len());
    println!(
        "  latency (us):   p50 {} p95 {} p99 {}",
        metrics.latency.p50_us, metrics.latency.p95_us, metrics.latency.p99_us
    );
    println!("  graph:          {nodes} nodes, {edges} edges");
    println!();

    pipeline.with_store(print_store_stats)?;

    println!();
    println!("=== DETECTION QUALITY ===");
    let rows = pipeline.with_store(|store| {
        store.execute_query("SELECT is_fraud, decision FROM transactions")
    })?;
    let (predicted, labels): (Vec<bool>, Vec<bool>) = rows
        .iter()
        .map(|row| {
            (
                row["decision"].as_str().is_some_and(|d| d != "approve"),
                row["is_fraud"].as_i64() == Some(1),
            )
        })
        .unzip();
    print_evaluation("pipeline", &Evaluation::from_predictions(&predicted, &labels));

    println!();
    println!("=== FRAUD RINGS ===");
    print_rings(&pipeline.detect_rings());
    Ok(())
}

fn print_store_stats(store: &FraudStore) -> Result<()> {
    let stats = store.fraud_stats()?;
    println!("=== FRAUD STATS ===");
    println!("  transactions:   {}", stats.total_transactions);
    println!("  fraud:          {} ({:.2}%)", stats.fraud_count, stats.fraud_rate);
    println!("  avg amount:     ${:.2}", stats.avg_amount);
    println!("  fraud amount:   ${:.2}", stats.fraud_amount);
    println!("  flagged:        {}", stats.flagged_count);

    let severities = store.alerts_by_severity()?;
    if !severities.is_empty() {
        println!();
        println!("=== ALERTS BY SEVERITY ===");
        for s in severities {
            println!("  {:<10} {}", s.severity, s.count);
        }
    }

    let merchants = store.top_merchants(5)?;
    if !merchants.is_empty() {
        println!();
        println!("=== TOP MERCHANTS ===");
        for m in merchants {
            println!(
                "  {} | {} txns | {} fraud ({:.1}%) | ${:.2}",
                m.merchant_id,
                m.transaction_count,
                m.fraud_count,
                m.fraud_rate,
                m.total_amount
            );
        }
    }

    let hours = store.fraud_by_hour()?;
    if !hours.is_empty() {
        println!();
        println!("=== FRAUD BY HOUR ===");
        for h in hours.iter().filter(|h| h.fraud_count > 0) {
            println!(
                "  {:02}:00 | {} txns | {} fraud ({:.1}%)",
                h.hour,
                h.total_txns,
                h.fraud_count,
                h.fraud_rate
            );
        }
    }

    let recent = store.recent_fraud(5)?;
    if !recent.is_empty() {
        println!();
        println!("=== RECENT FRAUD ===");
        for r in recent {
            println!(
                "  {} | {} | ${:.2} | {} | score {}",
                r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                r.user_id,
                r.amount,
                r.merchant_id,
                r.fraud_score.map_or_else(|| "-".to_string(), |s| format!("{s:.3}"))
            );
        }
    }
    Ok(())
}

fn print_evaluation(label: &str, e: &Evaluation) {
    println!(
        "  {label:<9} precision {:.3} | recall {:.3} | f1 {:.3} | accuracy {:.3}",
        e.precision, e.recall, e.f1, e.accuracy
    );
    println!(
        "  {:<9} tp {} fp {} tn {} fn {}",
        "",
        e.true_positives,
        e.false_positives,
        e.true_negatives,
        e.false_negatives
    );
}

fn print_rings(rings: &[FraudRing]) {
    if rings.is_empty() {
        println!("  (no rings detected)");
        return;
    }
    for ring in rings.iter().take(10) {
        println!(
            "  {} | {} users ({} flagged) | shared: {}",
            ring.ring_id,
            ring.users.len(),
            ring.flagged_users.len(),
            ring.shared_identifiers.join(", ")
        );
    }
    if rings.len() > 10 {
        println!("  ... and {} more", rings.len() - 10);
    }
}

fn arg_str<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

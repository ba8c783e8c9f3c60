//! Transaction generator with embedded fraud patterns.
//!
//! Builds a fixed population of user profiles and fraudster profiles from
//! the master seed, then emits a stream of legitimate and fraudulent card
//! transactions. Timestamps come from a simulated clock with exponential
//! inter-arrival gaps, so a seed fully determines the output.

use crate::{
    config::GeneratorConfig,
    error::PipelineResult,
    fake::{round_to, FakeData},
    producer::TransactionProducer,
    rng::{GenRng, RngBank, StreamSlot},
    transaction::{FraudType, MerchantCategory, Transaction, UserType},
    types::UserId,
};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

const MIN_AMOUNT: f64 = 5.0;
const AMOUNT_SPREAD: f64 = 0.3;
const LOCATION_JITTER_DEG: f64 = 0.1;
/// Gap between a card holder's last purchase and a rapid-succession hit.
const RAPID_GAP_SECS: (f64, f64) = (10.0, 120.0);

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: UserId,
    pub user_type: UserType,
    pub avg_amount: f64,
    pub preferred_categories: Vec<MerchantCategory>,
    pub usual_location: (f64, f64),
    pub usual_device: String,
    pub card_number: String,
}

#[derive(Debug, Clone)]
pub struct FraudsterProfile {
    pub fraudster_id: String,
    pub stolen_cards: Vec<String>,
    pub target_categories: Vec<MerchantCategory>,
    pub operating_locations: Vec<(f64, f64)>,
}

pub struct TransactionGenerator {
    profiles: Vec<UserProfile>,
    fraudsters: Vec<FraudsterProfile>,
    txn_rng: GenRng,
    fake_rng: GenRng,
    clock_rng: GenRng,
    shuffle_rng: GenRng,
    clock: DateTime<Utc>,
    /// Timestamp of each user's latest transaction, by profile index.
    last_seen: Vec<Option<DateTime<Utc>>>,
    rate: f64,
    num_merchants: u64,
    last_user: Option<usize>,
    generated: u64,
}

impl TransactionGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        let bank = RngBank::new(config.seed);
        let mut profile_rng = bank.for_slot(StreamSlot::Profiles);
        let mut fraudster_rng = bank.for_slot(StreamSlot::Fraudsters);

        // Every draw indexes into both populations, so neither may be empty.
        if config.num_users == 0 || config.num_fraudsters == 0 {
            log::warn!(
                "Generator needs at least one user and one fraudster (got {} and {}); using 1",
                config.num_users,
                config.num_fraudsters
            );
        }
        let num_users = config.num_users.max(1);
        let profiles = Self::create_user_profiles(&mut profile_rng, num_users);
        let fraudsters =
            Self::create_fraudster_profiles(&mut fraudster_rng, config.num_fraudsters.max(1));

        log::debug!(
            "Generator seeded: {} users, {} fraudsters, seed {}",
            profiles.len(),
            fraudsters.len(),
            config.seed
        );

        Self {
            profiles,
            fraudsters,
            txn_rng: bank.for_slot(StreamSlot::Transactions),
            fake_rng: bank.for_slot(StreamSlot::FakeData),
            clock_rng: bank.for_slot(StreamSlot::Clock),
            shuffle_rng: bank.for_slot(StreamSlot::Shuffle),
            clock: config.start_time,
            last_seen: vec![None; num_users],
            rate: f64::from(config.transactions_per_second.max(1)),
            num_merchants: config.num_merchants.max(1),
            last_user: None,
            generated: 0,
        }
    }

    fn create_user_profiles(rng: &mut GenRng, num_users: usize) -> Vec<UserProfile> {
        (0..num_users)
            .map(|i| {
                let user_type = *rng.pick(&UserType::ALL);
                let (lo, hi) = user_type.avg_amount_range();
                UserProfile {
                    user_id: format!("user_{i:04}"),
                    user_type,
                    avg_amount: rng.uniform(lo, hi),
                    preferred_categories: user_type.preferred_categories().to_vec(),
                    usual_location: (FakeData::latitude(rng), FakeData::longitude(rng)),
                    usual_device: FakeData::uuid4(rng),
                    card_number: FakeData::credit_card_number(rng),
                }
            })
            .collect()
    }

    fn create_fraudster_profiles(rng: &mut GenRng, num_fraudsters: usize) -> Vec<FraudsterProfile> {
        (0..num_fraudsters)
            .map(|i| {
                let card_count = rng.range_inclusive(3, 10);
                let location_count = rng.range_inclusive(2, 5);
                FraudsterProfile {
                    fraudster_id: format!("fraudster_{i:03}"),
                    stolen_cards: (0..card_count)
                        .map(|_| FakeData::credit_card_number(rng))
                        .collect(),
                    target_categories: rng.sample(&MerchantCategory::ALL, 3),
                    operating_locations: (0..location_count)
                        .map(|_| (FakeData::latitude(rng), FakeData::longitude(rng)))
                        .collect(),
                }
            })
            .collect()
    }

    pub fn profiles(&self) -> &[UserProfile] {
        &self.profiles
    }

    pub fn fraudsters(&self) -> &[FraudsterProfile] {
        &self.fraudsters
    }

    /// Total transactions emitted so far.
    pub fn generated(&self) -> u64 {
        self.generated
    }

    /// Current simulated time (timestamp of the last emitted transaction).
    pub fn now(&self) -> DateTime<Utc> {
        self.clock
    }

    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let gap_secs = self.clock_rng.exponential(self.rate);
        let gap_ms = (gap_secs * 1000.0).round().max(1.0) as i64;
        self.clock += Duration::milliseconds(gap_ms);
        self.clock
    }

    /// Lands 10-120 s after the user's previous transaction, pushing the
    /// clock forward to it.
    fn rapid_timestamp(&mut self, user_idx: usize) -> DateTime<Utc> {
        let prev = self.last_seen[user_idx].unwrap_or(self.clock);
        let gap_secs = self.clock_rng.uniform(RAPID_GAP_SECS.0, RAPID_GAP_SECS.1);
        let timestamp = prev + Duration::milliseconds((gap_secs * 1000.0).round() as i64);
        self.clock = self.clock.max(timestamp);
        timestamp
    }

    fn build_normal(&mut self, user_idx: usize, timestamp: DateTime<Utc>) -> Transaction {
        let profile = &self.profiles[user_idx];
        let rng = &mut self.txn_rng;

        let amount = rng
            .gauss(profile.avg_amount, profile.avg_amount * AMOUNT_SPREAD)
            .max(MIN_AMOUNT);
        let category = *rng.pick(&profile.preferred_categories);
        let (lat, lon) = profile.usual_location;
        let lat = lat + rng.uniform(-LOCATION_JITTER_DEG, LOCATION_JITTER_DEG);
        let lon = lon + rng.uniform(-LOCATION_JITTER_DEG, LOCATION_JITTER_DEG);
        let merchant = rng.range_inclusive(1, self.num_merchants);

        self.generated += 1;
        self.last_user = Some(user_idx);
        self.last_seen[user_idx] = Some(timestamp);

        Transaction {
            transaction_id: FakeData::uuid4(&mut self.fake_rng),
            user_id: profile.user_id.clone(),
            timestamp,
            amount: round_to(amount, 2),
            merchant_id: format!("merchant_{merchant:04}"),
            merchant_category: category,
            merchant_name: FakeData::company_name(&mut self.fake_rng),
            card_last4: FakeData::last4(&profile.card_number),
            device_id: profile.usual_device.clone(),
            ip_address: FakeData::ipv4(&mut self.fake_rng),
            location_lat: round_to(lat, 6),
            location_lon: round_to(lon, 6),
            is_fraud: false,
            fraud_type: None,
            fraudster_id: None,
        }
    }

    /// A legitimate transaction drawn from a random user's habits.
    pub fn generate_normal(&mut self) -> Transaction {
        let user_idx = self.txn_rng.next_u64_below(self.profiles.len() as u64) as usize;
        let timestamp = self.next_timestamp();
        self.build_normal(user_idx, timestamp)
    }

    /// A fraudulent transaction of a uniformly chosen pattern.
    pub fn generate_fraud(&mut self) -> Transaction {
        let fraud_type = *self.txn_rng.pick(&FraudType::ALL);
        self.generate_fraud_of(fraud_type)
    }

    pub fn generate_fraud_of(&mut self, fraud_type: FraudType) -> Transaction {
        let fraudster_idx = self.txn_rng.next_u64_below(self.fraudsters.len() as u64) as usize;

        // Rapid succession rides on the previous card holder so it lands
        // seconds after that user's last purchase.
        let user_idx = match (fraud_type, self.last_user) {
            (FraudType::RapidSuccession, Some(idx)) => idx,
            _ => self.txn_rng.next_u64_below(self.profiles.len() as u64) as usize,
        };

        let timestamp = match fraud_type {
            FraudType::RapidSuccession => self.rapid_timestamp(user_idx),
            _ => self.next_timestamp(),
        };
        let mut tx = self.build_normal(user_idx, timestamp);
        let fraudster = &self.fraudsters[fraudster_idx];
        let rng = &mut self.txn_rng;

        match fraud_type {
            FraudType::HighAmount => {
                tx.amount = round_to(rng.uniform(5000.0, 20000.0), 2);
                tx.merchant_category = MerchantCategory::Electronics;
            }
            FraudType::RapidSuccession => {
                tx.amount = round_to(rng.uniform(500.0, 2000.0), 2);
            }
            FraudType::UnusualLocation => {
                let (lat, lon) = *rng.pick(&fraudster.operating_locations);
                tx.location_lat = lat;
                tx.location_lon = lon;
                tx.amount = round_to(rng.uniform(1000.0, 5000.0), 2);
            }
            FraudType::StolenCard => {
                tx.card_last4 = FakeData::last4(rng.pick::<String>(&fraudster.stolen_cards));
                tx.device_id = FakeData::uuid4(&mut self.fake_rng);
                tx.ip_address = FakeData::ipv4(&mut self.fake_rng);
                tx.amount = round_to(rng.uniform(200.0, 3000.0), 2);
            }
        }

        tx.is_fraud = true;
        tx.fraud_type = Some(fraud_type);
        tx.fraudster_id = Some(fraudster.fraudster_id.clone());
        tx
    }

    /// A shuffled batch with exactly `floor(n * fraud_ratio)` fraud cases.
    /// Timestamps stay monotonic in batch order.
    pub fn generate_batch(&mut self, n: usize, fraud_ratio: f64) -> Vec<Transaction> {
        let num_fraud = ((n as f64) * fraud_ratio.clamp(0.0, 1.0)).floor() as usize;
        let mut labels: Vec<bool> = (0..n).map(|i| i < num_fraud).collect();
        self.shuffle_rng.shuffle(&mut labels);

        labels
            .into_iter()
            .map(|is_fraud| {
                if is_fraud {
                    self.generate_fraud()
                } else {
                    self.generate_normal()
                }
            })
            .collect()
    }

    /// Publish one batch of `tps` transactions per second until `shutdown`
    /// flips to true. Returns the number published.
    pub async fn stream(
        &mut self,
        producer: &TransactionProducer,
        tps: usize,
        fraud_ratio: f64,
        mut shutdown: watch::Receiver<bool>,
    ) -> PipelineResult<u64> {
        log::info!(
            "Starting transaction stream: {tps} transactions/second, fraud ratio {:.1}%",
            fraud_ratio * 100.0
        );
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut published = 0u64;

        loop {
            let ticked = tokio::select! {
                _ = interval.tick() => true,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
            };
            if *shutdown.borrow() {
                break;
            }
            if !ticked {
                continue;
            }

            let batch = self.generate_batch(tps, fraud_ratio);
            for tx in &batch {
                if tx.is_fraud {
                    log::debug!(
                        "FRAUD: ${:.2} - {}",
                        tx.amount,
                        tx.fraud_type.map(|t| t.as_str()).unwrap_or("unknown")
                    );
                } else {
                    log::debug!("Normal: ${:.2} - {}", tx.amount, tx.merchant_category);
                }
            }
            producer.publish_batch(&batch)?;
            published += batch.len() as u64;
        }

        log::info!("Stream stopped after {published} transactions");
        Ok(published)
    }
}

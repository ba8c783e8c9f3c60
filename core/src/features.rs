//! Sliding-window feature aggregation over the transaction stream.
//!
//! Every feature is computed from the user's history *before* the incoming
//! transaction is added, so a transaction never contributes to its own
//! velocity or novelty signals.

use crate::{
    config::FeatureConfig,
    error::{PipelineError, PipelineResult},
    transaction::Transaction,
    types::UserId,
};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

const EARTH_RADIUS_KM: f64 = 6371.0;
/// Floor on elapsed time when deriving travel speed.
const MIN_SPEED_WINDOW_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Amount,
    LogAmount,
    AmountToUserAvg,
    TxnCount1h,
    AmountSum1h,
    TxnCount24h,
    AmountSum24h,
    UniqueMerchants24h,
    SecondsSinceLast,
    DistanceFromLastKm,
    ImpliedSpeedKmh,
    NewDevice,
    NewIp,
    NewCard,
    HourOfDay,
    IsNight,
    CategoryRisk,
}

pub const NUM_FEATURES: usize = 17;

impl Feature {
    pub const ALL: [Feature; NUM_FEATURES] = [
        Self::Amount,
        Self::LogAmount,
        Self::AmountToUserAvg,
        Self::TxnCount1h,
        Self::AmountSum1h,
        Self::TxnCount24h,
        Self::AmountSum24h,
        Self::UniqueMerchants24h,
        Self::SecondsSinceLast,
        Self::DistanceFromLastKm,
        Self::ImpliedSpeedKmh,
        Self::NewDevice,
        Self::NewIp,
        Self::NewCard,
        Self::HourOfDay,
        Self::IsNight,
        Self::CategoryRisk,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Amount => "amount",
            Self::LogAmount => "log_amount",
            Self::AmountToUserAvg => "amount_to_user_avg",
            Self::TxnCount1h => "txn_count_1h",
            Self::AmountSum1h => "amount_sum_1h",
            Self::TxnCount24h => "txn_count_24h",
            Self::AmountSum24h => "amount_sum_24h",
            Self::UniqueMerchants24h => "unique_merchants_24h",
            Self::SecondsSinceLast => "seconds_since_last",
            Self::DistanceFromLastKm => "distance_from_last_km",
            Self::ImpliedSpeedKmh => "implied_speed_kmh",
            Self::NewDevice => "new_device",
            Self::NewIp => "new_ip",
            Self::NewCard => "new_card",
            Self::HourOfDay => "hour_of_day",
            Self::IsNight => "is_night",
            Self::CategoryRisk => "category_risk",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: [f64; NUM_FEATURES],
}

impl FeatureVector {
    pub fn names() -> [&'static str; NUM_FEATURES] {
        Feature::ALL.map(|f| f.name())
    }

    pub fn from_slice(values: &[f64]) -> PipelineResult<Self> {
        let values: [f64; NUM_FEATURES] =
            values.try_into().map_err(|_| PipelineError::FeatureShape {
                expected: NUM_FEATURES,
                actual: values.len(),
            })?;
        Ok(Self { values })
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.values[feature.index()]
    }

    fn set(&mut self, feature: Feature, value: f64) {
        self.values[feature.index()] = value;
    }

    /// `true` when the boolean-valued feature is set.
    pub fn flag(&self, feature: Feature) -> bool {
        self.get(feature) >= 0.5
    }
}

#[derive(Debug, Clone)]
struct Event {
    timestamp: DateTime<Utc>,
    amount: f64,
    merchant_id: String,
    device_id: String,
    ip_address: String,
    card_last4: String,
    lat: f64,
    lon: f64,
}

impl Event {
    fn from_transaction(tx: &Transaction) -> Self {
        Self {
            timestamp: tx.timestamp,
            amount: tx.amount,
            merchant_id: tx.merchant_id.clone(),
            device_id: tx.device_id.clone(),
            ip_address: tx.ip_address.clone(),
            card_last4: tx.card_last4.clone(),
            lat: tx.location_lat,
            lon: tx.location_lon,
        }
    }
}

/// Per-user sliding-window history.
pub struct FeatureWindow {
    window_secs: i64,
    short_window_secs: i64,
    max_events: usize,
    history: HashMap<UserId, VecDeque<Event>>,
    /// Latest timestamp at which every user's history was pruned.
    last_sweep: Option<DateTime<Utc>>,
}

impl FeatureWindow {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            window_secs: config.window_secs,
            short_window_secs: config.short_window_secs,
            max_events: config.max_events_per_user.max(1),
            history: HashMap::new(),
            last_sweep: None,
        }
    }

    pub fn users_tracked(&self) -> usize {
        self.history.len()
    }

    pub fn events_for(&self, user_id: &str) -> usize {
        self.history.get(user_id).map_or(0, VecDeque::len)
    }

    /// Drop events older than the window for every user, and users left
    /// with none. Returns the number of users removed.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::seconds(self.window_secs);
        let before = self.history.len();
        self.history.retain(|_, events| {
            events.retain(|e| e.timestamp >= cutoff);
            !events.is_empty()
        });
        self.last_sweep = Some(now);
        before - self.history.len()
    }

    /// Compute features for `tx` against the user's window, then record it.
    /// Idle users are swept out once per window length of simulated time.
    pub fn observe(&mut self, tx: &Transaction) -> FeatureVector {
        match self.last_sweep {
            None => self.last_sweep = Some(tx.timestamp),
            Some(last) if (tx.timestamp - last).num_seconds() >= self.window_secs => {
                let removed = self.evict_expired(tx.timestamp);
                if removed > 0 {
                    log::debug!("Evicted {removed} idle users from the feature window");
                }
            }
            Some(_) => {}
        }

        let window_secs = self.window_secs;
        let short_secs = self.short_window_secs;
        let max_events = self.max_events;
        let history = self.history.entry(tx.user_id.clone()).or_default();

        let cutoff = tx.timestamp - chrono::Duration::seconds(window_secs);
        history.retain(|e| e.timestamp >= cutoff);

        let features = compute(tx, history, window_secs, short_secs);

        history.push_back(Event::from_transaction(tx));
        while history.len() > max_events {
            history.pop_front();
        }
        features
    }
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0) as f64) / 1000.0
}

fn compute(tx: &Transaction, history: &VecDeque<Event>, window_secs: i64, short_secs: i64) -> FeatureVector {
    let mut fv = FeatureVector {
        values: [0.0; NUM_FEATURES],
    };
    let window = window_secs as f64;

    fv.set(Feature::Amount, tx.amount);
    fv.set(Feature::LogAmount, tx.amount.max(0.0).ln_1p());
    fv.set(Feature::HourOfDay, f64::from(tx.timestamp.hour()));
    fv.set(Feature::IsNight, if tx.timestamp.hour() < 6 { 1.0 } else { 0.0 });
    fv.set(Feature::CategoryRisk, tx.merchant_category.risk_weight());

    if history.is_empty() {
        fv.set(Feature::AmountToUserAvg, 1.0);
        fv.set(Feature::SecondsSinceLast, window);
        return fv;
    }

    let n = history.len() as f64;
    let mean = history.iter().map(|e| e.amount).sum::<f64>() / n;
    fv.set(
        Feature::AmountToUserAvg,
        if mean > 0.0 { tx.amount / mean } else { 1.0 },
    );

    let short_cutoff = tx.timestamp - chrono::Duration::seconds(short_secs);
    let recent: Vec<&Event> = history.iter().filter(|e| e.timestamp >= short_cutoff).collect();
    fv.set(Feature::TxnCount1h, recent.len() as f64);
    fv.set(Feature::AmountSum1h, recent.iter().map(|e| e.amount).sum());
    fv.set(Feature::TxnCount24h, n);
    fv.set(Feature::AmountSum24h, history.iter().map(|e| e.amount).sum());
    let merchants: HashSet<&str> = history.iter().map(|e| e.merchant_id.as_str()).collect();
    fv.set(Feature::UniqueMerchants24h, merchants.len() as f64);

    if let Some(last) = history.iter().max_by_key(|e| e.timestamp) {
        let elapsed = elapsed_secs(last.timestamp, tx.timestamp).min(window);
        let distance = haversine_km(last.lat, last.lon, tx.location_lat, tx.location_lon);
        let hours = elapsed.max(MIN_SPEED_WINDOW_SECS) / 3600.0;
        fv.set(Feature::SecondsSinceLast, elapsed);
        fv.set(Feature::DistanceFromLastKm, distance);
        fv.set(Feature::ImpliedSpeedKmh, distance / hours);
    }

    fv.set(Feature::NewDevice, unseen(history, |e| e.device_id == tx.device_id));
    fv.set(Feature::NewIp, unseen(history, |e| e.ip_address == tx.ip_address));
    fv.set(Feature::NewCard, unseen(history, |e| e.card_last4 == tx.card_last4));
    fv
}

fn unseen(history: &VecDeque<Event>, seen: impl Fn(&Event) -> bool) -> f64 {
    if history.iter().any(seen) {
        0.0
    } else {
        1.0
    }
}

/// Great-circle distance between two points in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::transaction::MerchantCategory;
    use chrono::TimeZone;

    fn tx(user: &str, secs: i64, amount: f64) -> Transaction {
        Transaction {
            transaction_id: format!("{user}-{secs}"),
            user_id: user.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(secs),
            amount,
            merchant_id: "merchant_0001".to_string(),
            merchant_category: MerchantCategory::Grocery,
            merchant_name: String::new(),
            card_last4: "1111".to_string(),
            device_id: "dev-a".to_string(),
            ip_address: "8.8.8.8".to_string(),
            location_lat: 40.0,
            location_lon: -74.0,
            is_fraud: false,
            fraud_type: None,
            fraudster_id: None,
        }
    }

    fn window() -> FeatureWindow {
        FeatureWindow::new(&PipelineConfig::default_test().features)
    }

    #[test]
    fn names_match_vector_length() {
        let fv = window().observe(&tx("u", 0, 10.0));
        assert_eq!(FeatureVector::names().len(), fv.as_slice().len());
        assert_eq!(FeatureVector::names()[0], "amount");
    }

    #[test]
    fn first_transaction_has_neutral_history_features() {
        let fv = window().observe(&tx("u", 0, 50.0));
        assert_eq!(fv.get(Feature::AmountToUserAvg), 1.0);
        assert_eq!(fv.get(Feature::TxnCount24h), 0.0);
        assert_eq!(fv.get(Feature::SecondsSinceLast), 86_400.0);
        assert!(!fv.flag(Feature::NewDevice));
        assert_eq!(fv.get(Feature::HourOfDay), 12.0);
        assert!(!fv.flag(Feature::IsNight));
    }

    #[test]
    fn velocity_and_ratio_use_prior_history_only() {
        let mut w = window();
        w.observe(&tx("u", 0, 100.0));
        w.observe(&tx("u", 600, 100.0));
        let fv = w.observe(&tx("u", 1200, 1000.0));
        assert_eq!(fv.get(Feature::TxnCount1h), 2.0);
        assert_eq!(fv.get(Feature::AmountSum1h), 200.0);
        assert!((fv.get(Feature::AmountToUserAvg) - 10.0).abs() < 1e-9);
        assert_eq!(fv.get(Feature::SecondsSinceLast), 600.0);
        assert_eq!(w.events_for("u"), 3);
    }

    #[test]
    fn old_events_are_evicted() {
        let mut w = window();
        w.observe(&tx("u", 0, 10.0));
        let fv = w.observe(&tx("u", 2 * 86_400, 10.0));
        assert_eq!(fv.get(Feature::TxnCount24h), 0.0);
        assert_eq!(w.events_for("u"), 1);
    }

    #[test]
    fn novelty_and_travel() {
        let mut w = window();
        w.observe(&tx("u", 0, 10.0));
        let mut far = tx("u", 1800, 10.0);
        far.device_id = "dev-b".to_string();
        far.location_lat = 51.5;
        far.location_lon = -0.12;
        let fv = w.observe(&far);
        assert!(fv.flag(Feature::NewDevice));
        assert!(!fv.flag(Feature::NewIp));
        assert!(fv.get(Feature::DistanceFromLastKm) > 5000.0);
        assert!(fv.get(Feature::ImpliedSpeedKmh) > 10_000.0);
    }

    #[test]
    fn out_of_order_counts_as_zero_elapsed() {
        let mut w = window();
        w.observe(&tx("u", 1000, 10.0));
        let fv = w.observe(&tx("u", 500, 10.0));
        assert_eq!(fv.get(Feature::SecondsSinceLast), 0.0);
        assert!(fv.get(Feature::ImpliedSpeedKmh).is_finite());
    }

    #[test]
    fn users_are_independent() {
        let mut w = window();
        w.observe(&tx("a", 0, 10.0));
        let fv = w.observe(&tx("b", 10, 10.0));
        assert_eq!(fv.get(Feature::TxnCount24h), 0.0);
        assert_eq!(w.users_tracked(), 2);
    }

    #[test]
    fn idle_users_are_evicted() {
        let mut w = window();
        let day = 24 * 3600;
        w.observe(&tx("a", 0, 10.0));
        w.observe(&tx("b", 10, 10.0));
        assert_eq!(w.users_tracked(), 2);

        // Past one full window, both earlier users have expired.
        w.observe(&tx("c", day + 20, 10.0));
        assert_eq!(w.users_tracked(), 1);
        assert_eq!(w.events_for("a"), 0);
        assert_eq!(w.events_for("c"), 1);

        w.observe(&tx("c", day + 30, 10.0));
        assert_eq!(w.evict_expired(Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap()), 1);
        assert_eq!(w.users_tracked(), 0);
    }

    #[test]
    fn haversine_known_distance() {
        // New York to London is roughly 5570 km.
        let d = haversine_km(40.7128, -74.0060, 51.5074, -0.1278);
        assert!((d - 5570.0).abs() < 20.0, "{d}");
        assert_eq!(haversine_km(1.0, 1.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn from_slice_checks_shape() {
        assert!(matches!(
            FeatureVector::from_slice(&[1.0, 2.0]),
            Err(PipelineError::FeatureShape { expected: NUM_FEATURES, actual: 2 })
        ));
        assert!(FeatureVector::from_slice(&[0.0; NUM_FEATURES]).is_ok());
    }
}

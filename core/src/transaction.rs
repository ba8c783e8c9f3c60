//! Transaction records as they travel over the stream.

use crate::types::{MerchantId, TxnId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MerchantCategory {
    Grocery,
    GasStation,
    Restaurant,
    OnlineShopping,
    Electronics,
    Travel,
    Entertainment,
    Healthcare,
    Utilities,
    Education,
}

impl MerchantCategory {
    pub const ALL: [MerchantCategory; 10] = [
        Self::Grocery,
        Self::GasStation,
        Self::Restaurant,
        Self::OnlineShopping,
        Self::Electronics,
        Self::Travel,
        Self::Entertainment,
        Self::Healthcare,
        Self::Utilities,
        Self::Education,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grocery => "grocery",
            Self::GasStation => "gas_station",
            Self::Restaurant => "restaurant",
            Self::OnlineShopping => "online_shopping",
            Self::Electronics => "electronics",
            Self::Travel => "travel",
            Self::Entertainment => "entertainment",
            Self::Healthcare => "healthcare",
            Self::Utilities => "utilities",
            Self::Education => "education",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }

    /// Relative card-fraud exposure of the category, in [0, 1].
    pub fn risk_weight(&self) -> f64 {
        match self {
            Self::Electronics => 0.9,
            Self::OnlineShopping => 0.8,
            Self::Travel => 0.7,
            Self::Entertainment => 0.4,
            Self::GasStation => 0.35,
            Self::Restaurant => 0.2,
            Self::Grocery => 0.15,
            Self::Education => 0.15,
            Self::Healthcare => 0.1,
            Self::Utilities => 0.05,
        }
    }
}

impl fmt::Display for MerchantCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudType {
    HighAmount,
    RapidSuccession,
    UnusualLocation,
    StolenCard,
}

impl FraudType {
    pub const ALL: [FraudType; 4] = [
        Self::HighAmount,
        Self::RapidSuccession,
        Self::UnusualLocation,
        Self::StolenCard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighAmount => "high_amount",
            Self::RapidSuccession => "rapid_succession",
            Self::UnusualLocation => "unusual_location",
            Self::StolenCard => "stolen_card",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Student,
    Professional,
    Retired,
    Business,
}

impl UserType {
    pub const ALL: [UserType; 4] = [
        Self::Student,
        Self::Professional,
        Self::Retired,
        Self::Business,
    ];

    /// Range the profile's average ticket is drawn from.
    pub fn avg_amount_range(&self) -> (f64, f64) {
        match self {
            Self::Student => (10.0, 100.0),
            Self::Professional => (50.0, 500.0),
            Self::Retired => (20.0, 150.0),
            Self::Business => (200.0, 2000.0),
        }
    }

    pub fn preferred_categories(&self) -> &'static [MerchantCategory] {
        use MerchantCategory::*;
        match self {
            Self::Student => &[Grocery, Restaurant, Entertainment],
            Self::Professional => &[Restaurant, Travel, OnlineShopping, Electronics],
            Self::Retired => &[Grocery, Healthcare, Utilities],
            Self::Business => &[Electronics, OnlineShopping, Travel],
        }
    }
}

/// A single card transaction.
///
/// `is_fraud`, `fraud_type` and `fraudster_id` are ground-truth labels set by
/// the generator; the scoring path never reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TxnId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
    pub merchant_id: MerchantId,
    pub merchant_category: MerchantCategory,
    #[serde(default)]
    pub merchant_name: String,
    #[serde(alias = "card_number")]
    pub card_last4: String,
    pub device_id: String,
    pub ip_address: String,
    pub location_lat: f64,
    pub location_lon: f64,
    #[serde(default, deserialize_with = "de_flag")]
    pub is_fraud: bool,
    #[serde(default)]
    pub fraud_type: Option<FraudType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraudster_id: Option<String>,
}

/// Accepts the label as `true`/`false` or `1`/`0`.
fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

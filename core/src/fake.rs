//! Deterministic fake data for generated transactions.
//!
//! Everything here draws from a caller-supplied `GenRng`, so the same seed
//! always yields the same merchants, devices, cards and addresses.

use crate::rng::GenRng;

/// Deterministic fake-data helpers.
pub struct FakeData;

impl FakeData {
    /// A random (version 4) UUID built from RNG bytes.
    pub fn uuid4(rng: &mut GenRng) -> String {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string()
    }

    /// A company-style merchant name: "Surname Industry Suffix".
    pub fn company_name(rng: &mut GenRng) -> String {
        let surname = rng.pick(Self::surnames());
        let industry = rng.pick(Self::industries());
        let suffix = rng.pick(Self::company_suffixes());
        if rng.chance(0.3) {
            let partner = rng.pick(Self::surnames());
            format!("{surname} & {partner} {suffix}")
        } else {
            format!("{surname} {industry} {suffix}")
        }
    }

    /// A public-looking IPv4 address (no 0.x, 10.x, 127.x or multicast).
    pub fn ipv4(rng: &mut GenRng) -> String {
        let first = loop {
            let candidate = rng.range_inclusive(1, 223);
            if candidate != 10 && candidate != 127 {
                break candidate;
            }
        };
        format!(
            "{}.{}.{}.{}",
            first,
            rng.range_inclusive(0, 255),
            rng.range_inclusive(0, 255),
            rng.range_inclusive(1, 254)
        )
    }

    pub fn latitude(rng: &mut GenRng) -> f64 {
        round_to(rng.uniform(-90.0, 90.0), 6)
    }

    pub fn longitude(rng: &mut GenRng) -> f64 {
        round_to(rng.uniform(-180.0, 180.0), 6)
    }

    /// A 16-digit card number with a valid Luhn check digit.
    pub fn credit_card_number(rng: &mut GenRng) -> String {
        let prefix = *rng.pick(&["4", "51", "52", "53", "54", "55", "37"]);
        let mut digits: Vec<u8> = prefix.bytes().map(|b| b - b'0').collect();
        while digits.len() < 15 {
            digits.push(rng.next_u64_below(10) as u8);
        }
        digits.push(luhn_check_digit(&digits));
        digits.iter().map(|d| char::from(b'0' + d)).collect()
    }

    /// Last four characters of a card number.
    pub fn last4(card_number: &str) -> String {
        let start = card_number.len().saturating_sub(4);
        card_number[start..].to_string()
    }

    fn surnames() -> &'static [&'static str] {
        &[
            "Anderson", "Baker", "Castillo", "Dawson", "Ellis", "Fischer", "Garcia",
            "Hughes", "Ibrahim", "Jensen", "Kowalski", "Lopez", "Morgan", "Nakamura",
            "Okafor", "Patel", "Quinn", "Rossi", "Schmidt", "Tanaka", "Underwood",
            "Vargas", "Walsh", "Xu", "Young", "Zimmerman",
        ]
    }

    fn industries() -> &'static [&'static str] {
        &[
            "Foods", "Fuel", "Kitchen", "Outfitters", "Electronics", "Travel",
            "Cinemas", "Pharmacy", "Energy", "Learning", "Supply", "Market",
        ]
    }

    fn company_suffixes() -> &'static [&'static str] {
        &["Inc", "LLC", "Group", "Ltd", "and Sons", "Co", "PLC"]
    }
}

/// Luhn check digit for the given payload digits.
pub fn luhn_check_digit(payload: &[u8]) -> u8 {
    let sum: u32 = payload
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            let d = d as u32;
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    ((10 - (sum % 10)) % 10) as u8
}

/// Validate a full number (payload + check digit) with the Luhn algorithm.
pub fn luhn_valid(number: &str) -> bool {
    let digits: Option<Vec<u8>> = number
        .chars()
        .map(|c| c.to_digit(10).map(|d| d as u8))
        .collect();
    match digits {
        Some(d) if d.len() >= 2 => {
            let (payload, check) = d.split_at(d.len() - 1);
            luhn_check_digit(payload) == check[0]
        }
        _ => false,
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{RngBank, StreamSlot};

    #[test]
    fn card_numbers_pass_luhn() {
        let mut rng = RngBank::new(12345).for_slot(StreamSlot::FakeData);
        for _ in 0..200 {
            let card = FakeData::credit_card_number(&mut rng);
            assert_eq!(card.len(), 16, "bad length: {card}");
            assert!(luhn_valid(&card), "Luhn failed for {card}");
        }
    }

    #[test]
    fn known_luhn_vector() {
        assert!(luhn_valid("4539578763621486"));
        assert!(!luhn_valid("4539578763621487"));
    }

    #[test]
    fn uuid_is_v4_and_deterministic() {
        let mut a = RngBank::new(1).for_slot(StreamSlot::FakeData);
        let mut b = RngBank::new(1).for_slot(StreamSlot::FakeData);
        let ua = FakeData::uuid4(&mut a);
        let ub = FakeData::uuid4(&mut b);
        assert_eq!(ua, ub);
        let parsed = uuid::Uuid::parse_str(&ua).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn ipv4_is_well_formed() {
        let mut rng = RngBank::new(3).for_slot(StreamSlot::FakeData);
        for _ in 0..100 {
            let ip: std::net::Ipv4Addr = FakeData::ipv4(&mut rng).parse().unwrap();
            assert_ne!(ip.octets()[0], 10);
            assert!(!ip.is_loopback());
        }
    }

    #[test]
    fn last4_handles_short_input() {
        assert_eq!(FakeData::last4("4111111111111111"), "1111");
        assert_eq!(FakeData::last4("12"), "12");
    }
}

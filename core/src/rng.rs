//! Deterministic random number generation.
//!
//! RULE: Nothing in the generator may call any platform RNG.
//! All randomness flows through GenRng instances derived
//! from the single master seed given to the generator.
//!
//! Each concern (profiles, fraudsters, transactions, ...) gets its own
//! stream, seeded from (master_seed XOR slot * golden ratio). This means:
//!   - Adding a new slot never changes existing streams.
//!   - Each stream is fully reproducible in isolation.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG stream.
pub struct GenRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl GenRng {
    /// Create a stream from the master seed and a stable slot index.
    /// The index must never change once assigned.
    pub fn new(master_seed: u64, slot_index: u64) -> Self {
        let derived_seed = master_seed ^ (slot_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Draw a raw u64 (full range).
    pub fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.inner.next_u64()
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.next_u64() % n
    }

    /// Roll an integer in [lo, hi] (inclusive).
    pub fn range_inclusive(&mut self, lo: u64, hi: u64) -> u64 {
        assert!(hi >= lo, "empty range {lo}..={hi}");
        lo + self.next_u64_below(hi - lo + 1)
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Uniform float in [lo, hi).
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Normal sample via Box-Muller.
    pub fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }

    /// Exponential sample with the given rate (events per unit).
    pub fn exponential(&mut self, rate: f64) -> f64 {
        let u = self.next_f64().max(1e-12);
        -u.ln() / rate
    }

    /// Pick one element uniformly. Panics on an empty slice.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        let idx = self.next_u64_below(items.len() as u64) as usize;
        &items[idx]
    }

    /// Sample k distinct elements (all of them when k exceeds the length).
    pub fn sample<T: Clone>(&mut self, items: &[T], k: usize) -> Vec<T> {
        items.choose_multiple(&mut self.inner, k).cloned().collect()
    }

    /// In-place shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.inner);
    }

    pub fn fill_bytes(&mut self, dest: &mut [u8]) {
        use rand::RngCore;
        self.inner.fill_bytes(dest);
    }
}

/// All RNG streams for a single generator, indexed by stable slot.
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn for_slot(&self, slot: StreamSlot) -> GenRng {
        GenRng::new(self.master_seed, slot as u64).with_name(slot.name())
    }
}

/// Stable slot assignments.
/// NEVER reorder or remove entries. Only append.
/// Reordering changes every stream's seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum StreamSlot {
    Profiles = 0,
    Fraudsters = 1,
    Transactions = 2,
    FakeData = 3,
    Clock = 4,
    Shuffle = 5,
}

impl StreamSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Fraudsters => "fraudsters",
            Self::Transactions => "transactions",
            Self::FakeData => "fake_data",
            Self::Clock => "clock",
            Self::Shuffle => "shuffle",
        }
    }
}

//! Seeded randomness for deterministic simulation testing.
//!
//! Two `SimulatedRng` values built from the same seed yield the same
//! sequence, so a failing DST run replays exactly from its seed.

use super::Rng;
use rand::SeedableRng;

/// Deterministic RNG (ChaCha8) for simulation
#[derive(Debug, Clone)]
pub struct SimulatedRng {
    inner: rand_chacha::ChaCha8Rng,
}

impl SimulatedRng {
    pub fn new(seed: u64) -> Self {
        SimulatedRng {
            inner: rand_chacha::ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Derive an independent generator (used to give each component its own stream)
    pub fn fork(&mut self) -> Self {
        SimulatedRng::new(self.next_u64())
    }
}

impl Rng for SimulatedRng {
    fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.inner.next_u64()
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng;
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng;
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }
}

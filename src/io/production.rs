//! Production randomness backed by the thread-local OS-seeded generator.

use super::Rng;

/// Non-deterministic RNG for production code paths
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionRng;

impl ProductionRng {
    pub fn new() -> Self {
        ProductionRng
    }
}

impl Rng for ProductionRng {
    fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        rand::thread_rng().next_u64()
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng;
        rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng;
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..max)
    }
}

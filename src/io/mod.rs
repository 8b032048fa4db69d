//! I/O Abstractions for Deterministic Testing
//!
//! Randomness is the only ambient source the output layer consumes outside
//! of storage calls. Routing it through the `Rng` trait lets the fault
//! injecting store and the DST harnesses replay a run from its seed.

pub mod production;
pub mod simulation;

pub use production::ProductionRng;
pub use simulation::SimulatedRng;

/// Source of randomness used by fault injection and workload generation
pub trait Rng: Send + 'static {
    /// Next uniformly distributed u64
    fn next_u64(&mut self) -> u64;

    /// Returns true with the given probability (clamped to [0, 1])
    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `[min, max)`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    /// Fill a buffer with random bytes
    fn fill_bytes(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let value = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&value[..chunk.len()]);
        }
    }
}

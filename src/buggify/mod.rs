//! BUGGIFY - FoundationDB-Style Fault Injection
//!
//! Every storage call made by the output writers is a potential fault
//! injection site. The simulated object store asks `buggify!` before each
//! operation whether to fail it, and the answer is drawn from a seeded RNG so
//! a failing run replays from its seed.
//!
//! # Usage
//!
//! ```ignore
//! if buggify!(&mut rng, faults::object_store::FLUSH_FAIL, config.flush_fail_prob) {
//!     return Err(StoreError::Other("simulated flush failure".into()));
//! }
//! ```

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use std::cell::RefCell;
use std::collections::BTreeMap;

/// Check and trigger counts of one fault point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounts {
    pub checks: u64,
    pub triggers: u64,
}

/// Per-fault counters, ordered by fault id
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    faults: BTreeMap<String, FaultCounts>,
}

impl BuggifyStats {
    fn entry(&mut self, fault_id: &str) -> &mut FaultCounts {
        self.faults.entry(fault_id.to_string()).or_default()
    }

    pub fn counts(&self, fault_id: &str) -> FaultCounts {
        self.faults.get(fault_id).copied().unwrap_or_default()
    }

    pub fn total_triggers(&self) -> u64 {
        self.faults.values().map(|c| c.triggers).sum()
    }

    pub fn summary(&self) -> String {
        let mut out = String::from("BUGGIFY Statistics:");
        for (fault_id, counts) in &self.faults {
            out.push_str(&format!("\n  {}: {}/{}", fault_id, counts.triggers, counts.checks));
        }
        out
    }
}

#[derive(Debug, Default)]
struct BuggifyContext {
    config: FaultConfig,
    stats: BuggifyStats,
    suppressed: bool,
}

thread_local! {
    static BUGGIFY_CONTEXT: RefCell<BuggifyContext> = RefCell::new(BuggifyContext::default());
}

/// Replace the fault configuration of the current thread
pub fn set_config(config: FaultConfig) {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow_mut().config = config);
}

pub fn get_stats() -> BuggifyStats {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

pub fn reset_stats() {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow_mut().stats = BuggifyStats::default());
}

/// Guard that keeps every fault point quiet until dropped. Guards nest;
/// dropping one restores whatever state was in place when it was created.
pub struct BuggifySuppressor {
    previous: bool,
}

impl BuggifySuppressor {
    pub fn new() -> Self {
        let previous =
            BUGGIFY_CONTEXT.with(|ctx| std::mem::replace(&mut ctx.borrow_mut().suppressed, true));
        BuggifySuppressor { previous }
    }
}

impl Default for BuggifySuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BuggifySuppressor {
    fn drop(&mut self) {
        let previous = self.previous;
        BUGGIFY_CONTEXT.with(|ctx| ctx.borrow_mut().suppressed = previous);
    }
}

/// Core check. The per-fault probability from the thread config overrides
/// the caller's default when one is set.
#[inline]
pub fn should_buggify_with_prob<R: crate::io::Rng>(
    rng: &mut R,
    fault_id: &str,
    probability: f64,
) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let ctx = &mut *ctx.borrow_mut();
        let counts = ctx.stats.entry(fault_id);
        counts.checks += 1;

        if ctx.suppressed || !ctx.config.enabled {
            return false;
        }
        let prob = ctx.config.get(fault_id).unwrap_or(probability);
        if prob <= 0.0 {
            return false;
        }

        let triggered = rng.gen_bool(prob);
        if triggered {
            counts.triggers += 1;
        }
        triggered
    })
}

/// BUGGIFY macro - the main interface for fault injection
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}

/// Suppress all buggify calls while the returned guard lives
#[macro_export]
macro_rules! suppress_buggify {
    () => {
        $crate::buggify::BuggifySuppressor::new()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;

    #[test]
    fn test_buggify_disabled() {
        set_config(FaultConfig::disabled());
        let mut rng = SimulatedRng::new(1);

        for _ in 0..1000 {
            assert!(!buggify!(&mut rng, faults::object_store::FLUSH_FAIL, 1.0));
        }
        set_config(FaultConfig::default());
    }

    #[test]
    fn test_buggify_with_prob() {
        set_config(FaultConfig::default());
        let mut rng = SimulatedRng::new(2);

        let always = (0..100)
            .filter(|_| buggify!(&mut rng, "test.always", 1.0))
            .count();
        assert_eq!(always, 100);

        let never = (0..100)
            .filter(|_| buggify!(&mut rng, "test.never", 0.0))
            .count();
        assert_eq!(never, 0);
    }

    #[test]
    fn test_config_override_wins() {
        set_config(FaultConfig::default().with(faults::object_store::COPY_FAIL, 0.0));
        let mut rng = SimulatedRng::new(3);

        for _ in 0..100 {
            assert!(!buggify!(&mut rng, faults::object_store::COPY_FAIL, 1.0));
        }
        set_config(FaultConfig::default());
    }

    #[test]
    fn test_buggify_stats() {
        set_config(FaultConfig::default());
        reset_stats();
        let mut rng = SimulatedRng::new(4);

        for _ in 0..10 {
            let _ = buggify!(&mut rng, faults::object_store::DELETE_FAIL, 1.0);
        }

        let stats = get_stats();
        assert_eq!(
            stats.counts(faults::object_store::DELETE_FAIL),
            FaultCounts {
                checks: 10,
                triggers: 10
            }
        );
        assert_eq!(stats.total_triggers(), 10);
        assert!(stats.summary().contains("object_store.delete_fail: 10/10"));
    }

    #[test]
    fn test_buggify_suppression() {
        set_config(FaultConfig::default());
        let mut rng = SimulatedRng::new(5);

        {
            let _outer = suppress_buggify!();
            {
                let _inner = suppress_buggify!();
                assert!(!buggify!(&mut rng, faults::object_store::WRITE_FAIL, 1.0));
            }
            for _ in 0..100 {
                assert!(!buggify!(&mut rng, faults::object_store::WRITE_FAIL, 1.0));
            }
        }

        assert!(buggify!(&mut rng, "test.after_suppress", 1.0));
    }
}

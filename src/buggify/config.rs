//! Per-thread fault configuration.

use std::collections::HashMap;

/// Global switch plus per-fault probability overrides
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub enabled: bool,
    overrides: HashMap<String, f64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        FaultConfig {
            enabled: true,
            overrides: HashMap::new(),
        }
    }
}

impl FaultConfig {
    /// No faults fire regardless of call-site probabilities
    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            overrides: HashMap::new(),
        }
    }

    /// Pin one fault to a fixed probability
    pub fn with(mut self, fault_id: &str, probability: f64) -> Self {
        self.overrides.insert(fault_id.to_string(), probability);
        self
    }

    pub fn get(&self, fault_id: &str) -> Option<f64> {
        self.overrides.get(fault_id).copied()
    }
}

//! Batch scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Tunables for the batch scheduler. Loaded from the `[batch]` section of
/// the fleet config, then overridden from `FLEET_BATCH_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Time between batch starts in continuous mode.
    pub batch_interval_ms: u64,

    /// Minimum gap between consecutive phase completions.
    pub spacing_ms: u64,

    /// Fraction of the target's money one batch steals.
    pub hack_fraction: f64,

    /// How long past its planned start a phase may stay silent.
    pub heartbeat_grace_ms: u64,

    /// How long past its planned finish a phase may take to report done.
    pub completion_grace_ms: u64,

    /// Slack when deciding whether a target is at min security and max
    /// money.
    pub prep_tolerance: f64,

    pub hack_script: String,
    pub grow_script: String,
    pub weaken_script: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 1_000,
            spacing_ms: 80,
            hack_fraction: 0.1,
            heartbeat_grace_ms: 500,
            completion_grace_ms: 1_000,
            prep_tolerance: 0.01,
            hack_script: "hack.js".to_string(),
            grow_script: "grow.js".to_string(),
            weaken_script: "weaken.js".to_string(),
        }
    }
}

impl BatchConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms.max(1))
    }

    pub fn spacing(&self) -> Duration {
        Duration::from_millis(self.spacing_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if !(self.hack_fraction > 0.0 && self.hack_fraction < 1.0) {
            return Err(BatchError::invalid(format!(
                "hack_fraction must be between 0 and 1, got {}",
                self.hack_fraction
            )));
        }
        if self.spacing_ms == 0 {
            return Err(BatchError::invalid("spacing_ms must be positive"));
        }
        if [&self.hack_script, &self.grow_script, &self.weaken_script]
            .iter()
            .any(|s| s.trim().is_empty())
        {
            return Err(BatchError::invalid("phase script names must not be empty"));
        }
        Ok(())
    }

    /// Applies `FLEET_BATCH_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("FLEET_BATCH_INTERVAL_MS").and_then(|s| s.parse().ok()) {
            self.batch_interval_ms = v;
        }
        if let Some(v) = lookup("FLEET_BATCH_SPACING_MS").and_then(|s| s.parse().ok()) {
            self.spacing_ms = v;
        }
        if let Some(v) = lookup("FLEET_BATCH_HACK_FRACTION").and_then(|s| s.parse().ok()) {
            self.hack_fraction = v;
        }
        if let Some(v) = lookup("FLEET_BATCH_HEARTBEAT_GRACE_MS").and_then(|s| s.parse().ok()) {
            self.heartbeat_grace_ms = v;
        }
        if let Some(v) = lookup("FLEET_BATCH_COMPLETION_GRACE_MS").and_then(|s| s.parse().ok()) {
            self.completion_grace_ms = v;
        }
        self
    }
}

//! Memory service configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use fleet_memory::Ram;
use serde::{Deserialize, Serialize};

/// Tunables for the memory service. Loaded from the `[memory]` section of
/// the fleet config, then overridden from `FLEET_MEMORY_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// How often workers are rediscovered and refreshed from the host.
    pub refresh_interval_ms: u64,

    /// How often exit registrations are checked against running processes.
    pub reap_interval_ms: u64,

    /// Internal retries of an `Allocate` after a commit conflict.
    pub conflict_retries: u32,

    /// RAM kept free on specific hosts, in GB.
    pub set_aside_gb: BTreeMap<String, f64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1_000,
            reap_interval_ms: 5_000,
            conflict_retries: 3,
            set_aside_gb: BTreeMap::from([("home".to_string(), 8.0)]),
        }
    }
}

impl MemoryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }

    pub fn set_aside(&self, hostname: &str) -> Ram {
        self.set_aside_gb
            .get(hostname)
            .map(|gb| Ram::from_gb_f64(*gb))
            .unwrap_or(Ram::ZERO)
    }

    /// Applies `FLEET_MEMORY_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored.
    ///
    /// `FLEET_MEMORY_SET_ASIDE` takes `host=gb` pairs separated by commas.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("FLEET_MEMORY_REFRESH_MS").and_then(|s| s.parse().ok()) {
            self.refresh_interval_ms = v;
        }
        if let Some(v) = lookup("FLEET_MEMORY_REAP_MS").and_then(|s| s.parse().ok()) {
            self.reap_interval_ms = v;
        }
        if let Some(v) = lookup("FLEET_MEMORY_CONFLICT_RETRIES").and_then(|s| s.parse().ok()) {
            self.conflict_retries = v;
        }
        if let Some(raw) = lookup("FLEET_MEMORY_SET_ASIDE") {
            let parsed: Option<BTreeMap<String, f64>> = raw
                .split(',')
                .filter(|pair| !pair.trim().is_empty())
                .map(|pair| {
                    let (host, gb) = pair.split_once('=')?;
                    Some((host.trim().to_string(), gb.trim().parse().ok()?))
                })
                .collect();
            if let Some(set_aside) = parsed {
                self.set_aside_gb = set_aside;
            }
        }
        self
    }
}

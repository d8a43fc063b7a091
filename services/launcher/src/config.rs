//! Launch service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Tunables for the launch service. Loaded from the `[launch]` section of
/// the fleet config, then overridden from `FLEET_LAUNCH_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Extra attempts per worker after a failed process start.
    pub retry_limit: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Jitter factor applied to each back-off delay (0.0 to 1.0).
    pub backoff_jitter: f64,

    /// Timeout for calls to the memory service.
    pub memory_timeout_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
            backoff_jitter: 0.25,
            memory_timeout_ms: 5_000,
        }
    }
}

impl LaunchConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            jitter: self.backoff_jitter,
        }
    }

    pub fn memory_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_timeout_ms.max(1))
    }

    /// Applies `FLEET_LAUNCH_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("FLEET_LAUNCH_RETRY_LIMIT").and_then(|s| s.parse().ok()) {
            self.retry_limit = v;
        }
        if let Some(v) = lookup("FLEET_LAUNCH_BACKOFF_BASE_MS").and_then(|s| s.parse().ok()) {
            self.backoff_base_ms = v;
        }
        if let Some(v) = lookup("FLEET_LAUNCH_BACKOFF_MAX_MS").and_then(|s| s.parse().ok()) {
            self.backoff_max_ms = v;
        }
        if let Some(v) = lookup("FLEET_LAUNCH_BACKOFF_JITTER").and_then(|s| s.parse().ok()) {
            self.backoff_jitter = v;
        }
        if let Some(v) = lookup("FLEET_LAUNCH_MEMORY_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.memory_timeout_ms = v;
        }
        self
    }
}

//! Values the host reports.

use chrono::{DateTime, Utc};
use fleet_id::Pid;
use fleet_memory::Ram;
use serde::{Deserialize, Serialize};

/// RAM and access state of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub max_ram: Ram,
    /// Everything running there, placed by the allocator or not.
    pub used_ram: Ram,
    pub rooted: bool,
}

impl ServerInfo {
    pub fn free_ram(&self) -> Ram {
        self.max_ram.saturating_sub(self.used_ram)
    }

    /// Whether the allocator may place work here.
    pub fn is_worker(&self) -> bool {
        self.rooted && !self.max_ram.is_zero()
    }
}

/// A running script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub script: String,
    pub hostname: String,
    pub threads: u64,
    pub args: Vec<String>,
    pub ram: Ram,
    pub started_at: DateTime<Utc>,
}

/// Why a process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Finished,
    Killed,
}

/// Broadcast whenever a process stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub pid: Pid,
    pub hostname: String,
    pub script: String,
    pub threads: u64,
    pub ram: Ram,
    pub reason: ExitReason,
}

/// Money and security of a hack target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub hostname: String,
    pub money: f64,
    pub max_money: f64,
    pub security: f64,
    pub min_security: f64,
    /// Server growth parameter; higher grows faster per thread.
    pub growth: f64,
    /// Hack time at minimum security.
    pub base_hack_ms: u64,
}

impl TargetState {
    /// At minimum security and maximum money, within `tolerance`.
    pub fn is_prepped(&self, tolerance: f64) -> bool {
        self.security <= self.min_security + tolerance
            && self.money >= self.max_money * (1.0 - tolerance)
    }

    pub fn money_ratio(&self) -> f64 {
        if self.max_money <= 0.0 {
            return 0.0;
        }
        self.money / self.max_money
    }
}

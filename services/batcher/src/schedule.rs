//! Phase timing.
//!
//! Phases are given in the order they must complete. With durations `d_i`
//! and spacing `s`, phase `i` finishes at `T + i·s` where the anchor
//! `T = max(d_i - i·s)` (never below zero) is the earliest time at which the
//! longest phase can still finish in its slot. Phase `i` therefore starts at
//! `T + i·s - d_i`, which is never negative.

use std::fmt;
use std::time::Duration;

use fleet_proto::PhaseKind;
use serde::{Deserialize, Serialize};

/// Which phases a batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// Hack, then grow back the stolen money, then weaken away the added
    /// security.
    Hgw,
    /// Grow to max money and weaken to min security.
    Prep,
}

impl Shape {
    /// Phases in completion order.
    pub fn phases(self) -> &'static [PhaseKind] {
        match self {
            Shape::Hgw => &[PhaseKind::Hack, PhaseKind::Grow, PhaseKind::Weaken],
            Shape::Prep => &[PhaseKind::Grow, PhaseKind::Weaken],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Shape::Hgw => "hgw",
            Shape::Prep => "prep",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When one phase runs, relative to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTiming {
    pub kind: PhaseKind,
    pub duration: Duration,
    /// Delay from dispatch to the start of the operation.
    pub start: Duration,
}

impl PhaseTiming {
    pub fn finish(&self) -> Duration {
        self.start + self.duration
    }
}

/// Timings for every phase of a batch, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub spacing: Duration,
    pub phases: Vec<PhaseTiming>,
}

impl Schedule {
    /// Computes start offsets for `phases`, given in completion order.
    pub fn compute(phases: &[(PhaseKind, Duration)], spacing: Duration) -> Self {
        let slot = |i: usize| spacing * u32::try_from(i).unwrap_or(u32::MAX);

        let anchor = phases
            .iter()
            .enumerate()
            .map(|(i, (_, duration))| duration.saturating_sub(slot(i)))
            .max()
            .unwrap_or_default();

        let phases = phases
            .iter()
            .enumerate()
            .map(|(i, (kind, duration))| PhaseTiming {
                kind: *kind,
                duration: *duration,
                start: (anchor + slot(i)).saturating_sub(*duration),
            })
            .collect();

        Self { spacing, phases }
    }

    pub fn timing(&self, kind: PhaseKind) -> Option<&PhaseTiming> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    /// Time from dispatch until the last phase finishes.
    pub fn makespan(&self) -> Duration {
        self.phases
            .iter()
            .map(PhaseTiming::finish)
            .max()
            .unwrap_or_default()
    }

    /// Whether every phase finishes at least `spacing` after the previous
    /// one.
    pub fn is_well_ordered(&self) -> bool {
        self.phases
            .windows(2)
            .all(|pair| pair[1].finish() >= pair[0].finish() + self.spacing)
    }
}

//! Batch state.
//!
//! A batch moves `Planned -> Dispatched -> {AllCompleted | PartialFailure |
//! TimedOut}`. Every phase process reports `Started` when its delay ends and
//! `Done` when its operation resolves; the batch tracks both per pid.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{AllocationId, BatchId, Pid};
use fleet_memory::Ram;
use fleet_proto::{BatchSignal, LaunchResult, PhaseKind};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::BatchError;
use crate::schedule::{PhaseTiming, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Planned,
    Dispatched,
    AllCompleted,
    PartialFailure,
    TimedOut,
}

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Planned => "planned",
            BatchState::Dispatched => "dispatched",
            BatchState::AllCompleted => "all_completed",
            BatchState::PartialFailure => "partial_failure",
            BatchState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::AllCompleted | BatchState::PartialFailure | BatchState::TimedOut
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One phase of a batch.
#[derive(Debug, Clone)]
pub struct PhaseRun {
    pub script: String,
    pub threads: u64,
    /// RAM the phase needs across all its processes.
    pub ram: Ram,
    pub timing: PhaseTiming,
    pub launch: Option<LaunchResult>,
    launched_at: Option<Instant>,
    started: BTreeSet<Pid>,
    done: BTreeSet<Pid>,
    completed_at: Option<Instant>,
    effect: f64,
}

impl PhaseRun {
    pub fn new(script: impl Into<String>, threads: u64, ram: Ram, timing: PhaseTiming) -> Self {
        Self {
            script: script.into(),
            threads,
            ram,
            timing,
            launch: None,
            launched_at: None,
            started: BTreeSet::new(),
            done: BTreeSet::new(),
            completed_at: None,
            effect: 0.0,
        }
    }

    pub fn kind(&self) -> PhaseKind {
        self.timing.kind
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.launch
            .as_ref()
            .map(LaunchResult::started_pids)
            .unwrap_or_default()
    }

    pub fn is_started(&self) -> bool {
        self.launch.is_some() && self.pids().iter().all(|pid| self.started.contains(pid))
    }

    pub fn is_done(&self) -> bool {
        self.launch.is_some() && self.pids().iter().all(|pid| self.done.contains(pid))
    }

    /// When the last process of this phase reported done.
    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }

    /// Summed effect reported by this phase's processes.
    pub fn effect(&self) -> f64 {
        self.effect
    }

    fn heartbeat_deadline(&self, grace: Duration) -> Option<Instant> {
        let launched_at = self.launched_at?;
        (!self.is_started()).then(|| launched_at + self.timing.start + grace)
    }

    fn completion_deadline(&self, grace: Duration) -> Option<Instant> {
        let launched_at = self.launched_at?;
        (!self.is_done()).then(|| launched_at + self.timing.finish() + grace)
    }
}

/// A batch against one target.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub target: String,
    pub shape: Shape,
    /// In completion order.
    pub phases: Vec<PhaseRun>,
    pub created_at: DateTime<Utc>,
    state: BatchState,
    reason: Option<String>,
}

impl Batch {
    pub fn new(target: impl Into<String>, shape: Shape, phases: Vec<PhaseRun>) -> Self {
        Self {
            id: BatchId::new(),
            target: target.into(),
            shape,
            phases,
            created_at: Utc::now(),
            state: BatchState::Planned,
            reason: None,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Why the batch failed or timed out.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&PhaseRun> {
        self.phases.iter().find(|p| p.kind() == kind)
    }

    pub fn ram(&self) -> Ram {
        self.phases.iter().map(|p| p.ram).sum()
    }

    /// Owner tag for this batch's allocations.
    pub fn owner(&self) -> String {
        format!("batch:{}", self.id)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    pub fn dispatch(&mut self) -> Result<(), BatchError> {
        self.transition(BatchState::Dispatched)
    }

    pub fn complete(&mut self) -> Result<(), BatchError> {
        self.transition(BatchState::AllCompleted)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), BatchError> {
        self.transition(BatchState::PartialFailure)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn time_out(&mut self, reason: impl Into<String>) -> Result<(), BatchError> {
        self.transition(BatchState::TimedOut)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, to: BatchState) -> Result<(), BatchError> {
        match (self.state, to) {
            (BatchState::Planned, BatchState::Dispatched)
            | (
                BatchState::Dispatched,
                BatchState::AllCompleted | BatchState::PartialFailure | BatchState::TimedOut,
            ) => {
                self.state = to;
                Ok(())
            }
            (from, to) => Err(BatchError::InvalidTransition { from, to }),
        }
    }

    // =========================================================================
    // Tracking
    // =========================================================================

    pub fn record_launch(&mut self, index: usize, result: LaunchResult, at: Instant) {
        if let Some(phase) = self.phases.get_mut(index) {
            phase.launch = Some(result);
            phase.launched_at = Some(at);
        }
    }

    /// Applies a signal from the done port. Returns false if it does not
    /// belong to this batch.
    pub fn on_signal(&mut self, signal: &BatchSignal) -> bool {
        let report = signal.signal();
        if report.batch_id != self.id {
            return false;
        }
        let Some(phase) = self
            .phases
            .iter_mut()
            .find(|p| p.kind() == report.phase && p.pids().contains(&report.pid))
        else {
            return false;
        };

        match signal {
            BatchSignal::Started(_) => {
                phase.started.insert(report.pid);
            }
            BatchSignal::Done(_) => {
                // A done phase has necessarily started.
                phase.started.insert(report.pid);
                if phase.done.insert(report.pid) {
                    phase.effect += report.effect.unwrap_or(0.0);
                }
                if phase.is_done() && phase.completed_at.is_none() {
                    phase.completed_at = Some(Instant::now());
                }
            }
        }
        true
    }

    /// Whether every launched phase reported done.
    pub fn is_complete(&self) -> bool {
        !self.phases.is_empty() && self.phases.iter().all(PhaseRun::is_done)
    }

    /// The earliest deadline not yet met.
    pub fn next_deadline(&self, heartbeat_grace: Duration, completion_grace: Duration) -> Option<Instant> {
        self.phases
            .iter()
            .flat_map(|p| {
                [
                    p.heartbeat_deadline(heartbeat_grace),
                    p.completion_deadline(completion_grace),
                ]
            })
            .flatten()
            .min()
    }

    /// Describes the first missed deadline at `now`, if any.
    pub fn overdue(&self, now: Instant, heartbeat_grace: Duration, completion_grace: Duration) -> Option<String> {
        self.phases.iter().find_map(|p| {
            if p.heartbeat_deadline(heartbeat_grace).is_some_and(|d| now >= d) {
                Some(format!("{} phase never started", p.kind()))
            } else if p.completion_deadline(completion_grace).is_some_and(|d| now >= d) {
                Some(format!("{} phase never finished", p.kind()))
            } else {
                None
            }
        })
    }

    /// Allocations made for this batch.
    pub fn allocations(&self) -> Vec<AllocationId> {
        self.phases
            .iter()
            .filter_map(|p| p.launch.as_ref().map(|l| l.allocation.id))
            .collect()
    }

    /// Launched processes that have not reported done.
    pub fn running_pids(&self) -> Vec<Pid> {
        self.phases
            .iter()
            .flat_map(|p| {
                p.pids()
                    .into_iter()
                    .filter(|pid| !p.done.contains(pid))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
